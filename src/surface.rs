use std::io::Write;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tracing::warn;

use crate::auth::{AuthState, IdentityClient, IdleTimer, SessionFile};
use crate::backend::{BackendClient, HistoryStore};
use crate::chat::{ChatSession, Renderer, SessionStatus};
use crate::models::{Message, Role};
use crate::settings::Settings;

/// Streams the conversation to stdout. Assistant updates arrive as the full
/// republished content, so only the new suffix is printed; a replacement
/// that is not a pure extension (the error path) restarts the line.
#[derive(Default)]
pub struct TerminalRenderer {
    shown: String,
}

impl Renderer for TerminalRenderer {
    fn message_appended(&mut self, msg: &Message) {
        match msg.role {
            Role::User => println!("{}> {}", msg.role, msg.content),
            Role::Assistant => {
                self.shown.clear();
                if msg.content.is_empty() {
                    print!("{}> ", msg.role);
                    let _ = std::io::stdout().flush();
                } else {
                    println!("{}> {}", msg.role, msg.content);
                }
            }
        }
    }

    fn last_updated(&mut self, content: &str) {
        if let Some(suffix) = content.strip_prefix(self.shown.as_str()) {
            print!("{suffix}");
        } else {
            println!();
            print!("{content}");
        }
        let _ = std::io::stdout().flush();
        self.shown = content.to_string();
    }
}

/// One-shot anonymous question: the widget surface. Returns false when the
/// exchange ended in a failed state.
pub async fn run_ask(backend: BackendClient, question: &str, no_stream: bool) -> bool {
    let mut session = ChatSession::new(backend, None, TerminalRenderer::default());
    if no_stream {
        session.submit_without_stream(question, None).await;
    } else {
        session.submit(question, None).await;
    }
    println!();
    session.status() != SessionStatus::Failed
}

/// Interactive REPL: the full-chat surface. Owns the single auth-state
/// subscription; an idle deadline signs the session out, and the surface
/// resets and closes when the session goes away.
pub async fn run_chat(
    settings: &Settings,
    backend: BackendClient,
    identity: Option<IdentityClient>,
    session_file: SessionFile,
    auth: AuthState,
    no_stream: bool,
) -> anyhow::Result<()> {
    let history: Arc<dyn HistoryStore> = Arc::new(backend.clone());
    let mut chat = ChatSession::new(backend, Some(history), TerminalRenderer::default());
    let mut auth_changes = auth.subscribe();

    match auth.current() {
        Some(session) => {
            println!("Restoring your conversation for {}...", session.email);
            chat.restore_history(Some(&session.access_token)).await;
        }
        None => println!("Chatting anonymously; `login` to keep your history."),
    }
    if chat.messages().is_empty() {
        println!("Hello! I'm AlphaWave AI. How can I assist you today?");
    }
    println!("Type your message, or /quit to leave.");

    let mut idle = IdleTimer::new(settings.idle_timeout);
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(idle.deadline()), if auth.current().is_some() => {
                if let (Some(identity), Some(session)) = (&identity, auth.current()) {
                    if let Err(err) = identity.sign_out(&session.access_token).await {
                        warn!(%err, "sign-out call failed during idle logout");
                    }
                }
                session_file.clear()?;
                idle.touch();
                auth.publish(None);
                println!("\nSigned out after inactivity.");
            }
            changed = auth_changes.changed() => {
                if changed.is_err() {
                    break;
                }
                if auth_changes.borrow_and_update().is_none() {
                    chat.reset();
                    break;
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                idle.touch();
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "/quit" {
                    break;
                }
                let token = auth.current().map(|s| s.access_token);
                if no_stream {
                    chat.submit_without_stream(line, token.as_deref()).await;
                } else {
                    chat.submit(line, token.as_deref()).await;
                }
                println!();
            }
        }
    }
    Ok(())
}
