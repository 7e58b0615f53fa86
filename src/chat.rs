use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::{BackendClient, HistoryStore};
use crate::models::Message;
use crate::stream;

/// Shown in place of the answer when the stream cannot be opened or dies
/// mid-flight. Partial content is discarded, never persisted.
pub const CONNECTION_ERROR_REPLY: &str =
    "Sorry, I'm having trouble connecting to the server. Please check if the backend is running.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Pending,
    Streaming,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Streaming)
    }
}

/// Rendering callbacks. Both surfaces plug in here instead of duplicating
/// the stream handling.
pub trait Renderer {
    fn message_appended(&mut self, msg: &Message);
    /// Republication of the placeholder's full content; replaces, never
    /// appends to, what was shown before.
    fn last_updated(&mut self, content: &str);
}

/// One conversation: the ordered message sequence plus the lifecycle of at
/// most one in-flight exchange. The last message is the only mutable one,
/// and only while a stream is active.
pub struct ChatSession<R: Renderer> {
    backend: BackendClient,
    history: Option<Arc<dyn HistoryStore>>,
    renderer: R,
    messages: Vec<Message>,
    status: SessionStatus,
}

impl<R: Renderer> ChatSession<R> {
    pub fn new(backend: BackendClient, history: Option<Arc<dyn HistoryStore>>, renderer: R) -> Self {
        Self { backend, history, renderer, messages: Vec::new(), status: SessionStatus::Idle }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Full reset, used when the auth session changes.
    pub fn reset(&mut self) {
        self.messages.clear();
        self.status = SessionStatus::Idle;
    }

    /// Restores the stored conversation for a signed-in user. Anonymous
    /// sessions and fetch failures both start empty.
    pub async fn restore_history(&mut self, token: Option<&str>) {
        let Some(history) = &self.history else { return };
        let Some(token) = token else { return };
        match history.fetch(Some(token)).await {
            Ok(messages) => {
                for msg in &messages {
                    self.renderer.message_appended(msg);
                }
                self.messages = messages;
            }
            Err(err) => warn!(%err, "failed to fetch history, starting empty"),
        }
    }

    /// Drives one streamed exchange from submission to terminal state.
    /// No-op while another exchange is active or when the question trims to
    /// nothing. Never propagates errors; every failure ends as a terminal
    /// UI state.
    pub async fn submit(&mut self, question: &str, token: Option<&str>) {
        let Some(question) = self.begin(question) else { return };
        let exchange = Uuid::new_v4();
        debug!(%exchange, chars = question.len(), "opening chat stream");
        self.persist(token, Message::user(&question));

        let byte_stream = match self.backend.open_chat_stream(&question, token).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(%exchange, %err, "could not open chat stream");
                self.fail();
                return;
            }
        };

        self.status = SessionStatus::Streaming;
        let outcome = {
            let messages = &mut self.messages;
            let renderer = &mut self.renderer;
            stream::reduce(byte_stream, |accumulated| {
                if let Some(placeholder) = messages.last_mut() {
                    placeholder.content.replace_range(.., accumulated);
                }
                renderer.last_updated(accumulated);
            })
            .await
        };

        match outcome {
            Ok(end) => {
                debug!(%exchange, complete = end.complete, chars = end.answer.len(), "stream finished");
                if end.complete {
                    self.persist(token, Message::assistant(&end.answer));
                }
                self.status = SessionStatus::Completed;
            }
            Err(err) => {
                warn!(%exchange, %err, "stream failed");
                self.fail();
            }
        }
    }

    /// Non-streaming fallback over the plain chat endpoint, selected per
    /// deployment. Same lifecycle and guards, one answer instead of tokens.
    pub async fn submit_without_stream(&mut self, question: &str, token: Option<&str>) {
        let Some(question) = self.begin(question) else { return };
        self.persist(token, Message::user(&question));

        match self.backend.ask(&question, token).await {
            Ok(answer) => {
                if let Some(placeholder) = self.messages.last_mut() {
                    placeholder.content.replace_range(.., &answer);
                }
                self.renderer.last_updated(&answer);
                self.persist(token, Message::assistant(&answer));
                self.status = SessionStatus::Completed;
            }
            Err(err) => {
                warn!(%err, "chat request failed");
                self.fail();
            }
        }
    }

    /// Applies the submission guard and, when it passes, appends the user
    /// message plus the empty assistant placeholder.
    fn begin(&mut self, question: &str) -> Option<String> {
        let question = question.trim();
        if question.is_empty() {
            return None;
        }
        if self.status.is_active() {
            debug!("submission ignored, an exchange is already in flight");
            return None;
        }
        self.push(Message::user(question));
        self.push(Message::assistant(""));
        self.status = SessionStatus::Pending;
        Some(question.to_owned())
    }

    fn push(&mut self, msg: Message) {
        self.renderer.message_appended(&msg);
        self.messages.push(msg);
    }

    fn fail(&mut self) {
        if let Some(placeholder) = self.messages.last_mut() {
            placeholder.content.replace_range(.., CONNECTION_ERROR_REPLY);
        }
        self.renderer.last_updated(CONNECTION_ERROR_REPLY);
        self.status = SessionStatus::Failed;
    }

    /// Fire-and-forget history write; failures are logged, never block the
    /// exchange. Surfaces without a store (the anonymous widget) skip it.
    fn persist(&mut self, token: Option<&str>, msg: Message) {
        let Some(history) = self.history.clone() else { return };
        let token = token.map(str::to_owned);
        tokio::spawn(async move {
            if let Err(err) = history.append(token, msg).await {
                warn!(%err, "failed to save message to history");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use async_trait::async_trait;
    use axum::http::header;
    use axum::routing::post;
    use axum::Router;
    use std::sync::Mutex;
    use std::time::Duration;
    use url::Url;

    #[derive(Default)]
    struct RecordingRenderer {
        appended: Vec<Message>,
        updates: Vec<String>,
    }

    impl Renderer for RecordingRenderer {
        fn message_appended(&mut self, msg: &Message) {
            self.appended.push(msg.clone());
        }

        fn last_updated(&mut self, content: &str) {
            self.updates.push(content.to_string());
        }
    }

    #[derive(Default)]
    struct RecordingStore {
        written: Mutex<Vec<Message>>,
        stored: Vec<Message>,
    }

    #[async_trait]
    impl HistoryStore for RecordingStore {
        async fn fetch(&self, _token: Option<&str>) -> anyhow::Result<Vec<Message>> {
            Ok(self.stored.clone())
        }

        async fn append(&self, _token: Option<String>, msg: Message) -> anyhow::Result<()> {
            self.written.lock().unwrap().push(msg);
            Ok(())
        }
    }

    fn history(store: &Arc<RecordingStore>) -> Arc<dyn HistoryStore> {
        store.clone()
    }

    async fn spawn_stream_server(body: &'static str) -> BackendClient {
        let router = Router::new().route(
            "/chat/stream",
            post(move || async move { ([(header::CONTENT_TYPE, "text/event-stream")], body) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        BackendClient::new(Url::parse(&format!("http://{addr}")).unwrap())
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn clean_stream_persists_exactly_one_assistant_message() {
        let backend = spawn_stream_server("data: Hel\n\ndata: lo\n\ndata: [DONE]\n\n").await;
        let store = Arc::new(RecordingStore::default());
        let mut session =
            ChatSession::new(backend, Some(history(&store)), RecordingRenderer::default());

        session.submit("What is AlphaWave?", Some("tok")).await;

        assert_eq!(session.status(), SessionStatus::Completed);
        assert_eq!(session.messages().last().unwrap().content, "Hello");
        assert_eq!(session.renderer.updates, vec!["Hel".to_string(), "Hello".to_string()]);

        wait_for(|| store.written.lock().unwrap().len() == 2).await;
        let written = store.written.lock().unwrap();
        let assistant: Vec<_> = written.iter().filter(|m| m.role == Role::Assistant).collect();
        assert_eq!(assistant.len(), 1);
        assert_eq!(assistant[0].content, "Hello");
    }

    #[tokio::test]
    async fn error_sentinel_replaces_partial_answer_and_persists_nothing_for_assistant() {
        let backend = spawn_stream_server("data: Par\n\ndata: [ERROR] boom\n\n").await;
        let store = Arc::new(RecordingStore::default());
        let mut session =
            ChatSession::new(backend, Some(history(&store)), RecordingRenderer::default());

        session.submit("q", Some("tok")).await;

        assert_eq!(session.status(), SessionStatus::Failed);
        assert_eq!(session.messages().last().unwrap().content, CONNECTION_ERROR_REPLY);

        // The user side is still saved; the assistant side never is.
        wait_for(|| !store.written.lock().unwrap().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let written = store.written.lock().unwrap();
        assert!(written.iter().all(|m| m.role == Role::User));
    }

    #[tokio::test]
    async fn failed_open_overwrites_placeholder_with_fixed_reply() {
        let router = Router::new().route(
            "/chat/stream",
            post(|| async { axum::http::StatusCode::SERVICE_UNAVAILABLE }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        let backend = BackendClient::new(Url::parse(&format!("http://{addr}")).unwrap());
        let mut session = ChatSession::new(backend, None, RecordingRenderer::default());

        session.submit("q", None).await;

        assert_eq!(session.status(), SessionStatus::Failed);
        assert_eq!(session.messages().last().unwrap().content, CONNECTION_ERROR_REPLY);
        assert_eq!(session.renderer.updates, vec![CONNECTION_ERROR_REPLY.to_string()]);
    }

    #[tokio::test]
    async fn submit_is_a_noop_while_an_exchange_is_active() {
        let backend = spawn_stream_server("data: [DONE]\n\n").await;
        let mut session = ChatSession::new(backend, None, RecordingRenderer::default());
        session.status = SessionStatus::Streaming;

        session.submit("second question", None).await;

        assert!(session.messages().is_empty());
        assert_eq!(session.status(), SessionStatus::Streaming);
    }

    #[tokio::test]
    async fn blank_question_is_rejected_before_anything_happens() {
        let backend = spawn_stream_server("data: [DONE]\n\n").await;
        let mut session = ChatSession::new(backend, None, RecordingRenderer::default());

        session.submit("   \n", None).await;

        assert!(session.messages().is_empty());
        assert_eq!(session.status(), SessionStatus::Idle);
    }

    #[tokio::test]
    async fn question_is_trimmed_before_it_is_appended() {
        let backend = spawn_stream_server("data: ok\n\ndata: [DONE]\n\n").await;
        let mut session = ChatSession::new(backend, None, RecordingRenderer::default());

        session.submit("  spaced out  ", None).await;

        assert_eq!(session.messages()[0].content, "spaced out");
    }

    #[tokio::test]
    async fn restore_history_skips_anonymous_and_renders_stored_messages() {
        let backend = spawn_stream_server("data: [DONE]\n\n").await;
        let store = Arc::new(RecordingStore {
            stored: vec![Message::user("earlier"), Message::assistant("answer")],
            ..Default::default()
        });
        let mut session =
            ChatSession::new(backend, Some(history(&store)), RecordingRenderer::default());

        session.restore_history(None).await;
        assert!(session.messages().is_empty());

        session.restore_history(Some("tok")).await;
        assert_eq!(session.messages().len(), 2);
        assert_eq!(session.renderer.appended.len(), 2);
    }

    #[tokio::test]
    async fn fallback_transport_completes_without_streaming() {
        let router = Router::new().route(
            "/chat",
            post(|| async { axum::Json(serde_json::json!({"answer": "plain answer"})) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        let backend = BackendClient::new(Url::parse(&format!("http://{addr}")).unwrap());
        let mut session = ChatSession::new(backend, None, RecordingRenderer::default());

        session.submit_without_stream("q", None).await;

        assert_eq!(session.status(), SessionStatus::Completed);
        assert_eq!(session.messages().last().unwrap().content, "plain answer");
    }
}
