use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::{fmt, EnvFilter};

mod auth;
mod backend;
mod chat;
mod dashboard;
mod models;
mod settings;
mod stream;
mod surface;

use auth::{AuthState, IdentityClient, SessionFile};
use backend::BackendClient;
use settings::{Overrides, Settings};

#[derive(Debug, Parser)]
#[command(name = "alphawave_chat")]
#[command(about = "Terminal client for the AlphaWave assistant", long_about = None)]
struct Cli {
    #[command(flatten)]
    flags: GlobalFlags,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct GlobalFlags {
    /// Backend base URL
    #[arg(long, global = true)]
    backend_url: Option<String>,
    /// Identity provider base URL
    #[arg(long, global = true)]
    identity_url: Option<String>,
    /// Identity provider anon key
    #[arg(long, global = true)]
    anon_key: Option<String>,
    /// Seconds of inactivity before auto-logout in `chat`
    #[arg(long, global = true)]
    idle_timeout_secs: Option<u64>,
    /// Seconds between dashboard refreshes
    #[arg(long, global = true)]
    poll_interval_secs: Option<u64>,
}

impl From<&GlobalFlags> for Overrides {
    fn from(flags: &GlobalFlags) -> Self {
        Overrides {
            backend_url: flags.backend_url.clone(),
            identity_url: flags.identity_url.clone(),
            anon_key: flags.anon_key.clone(),
            idle_timeout_secs: flags.idle_timeout_secs,
            poll_interval_secs: flags.poll_interval_secs,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ask one anonymous question and exit
    Ask {
        question: Vec<String>,
        /// Use the plain chat endpoint instead of the streaming one
        #[arg(long)]
        no_stream: bool,
    },
    /// Interactive conversation with history restore
    Chat {
        /// Use the plain chat endpoint instead of the streaming one
        #[arg(long)]
        no_stream: bool,
    },
    /// Sign in and store the issued session
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    /// Create an account
    Register {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        full_name: String,
    },
    /// Sign out and discard the stored session
    Logout,
    /// Live per-user activity view
    Dashboard,
}

fn identity_client(settings: &Settings) -> Option<IdentityClient> {
    match (&settings.identity_url, &settings.anon_key) {
        (Some(url), Some(key)) => Some(IdentityClient::new(url.clone(), key.clone())),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let settings = settings::resolve_settings(&Overrides::from(&cli.flags), &settings::env_overrides())?;
    let backend = BackendClient::new(settings.backend_url.clone());

    match cli.command {
        Commands::Ask { question, no_stream } => {
            let question = question.join(" ");
            if !surface::run_ask(backend, &question, no_stream).await {
                std::process::exit(1);
            }
        }
        Commands::Chat { no_stream } => {
            let session_file = SessionFile::at_default_location()?;
            let auth_state = AuthState::new(session_file.load());
            let identity = identity_client(&settings);
            surface::run_chat(&settings, backend, identity, session_file, auth_state, no_stream)
                .await?;
        }
        Commands::Login { email, password } => {
            let identity = identity_client(&settings)
                .context("identity url and anon key are required to log in")?;
            let session = identity.sign_in(&email, &password).await?;
            SessionFile::at_default_location()?.store(&session)?;
            println!("Logged in as {}.", session.email);
        }
        Commands::Register { email, password, full_name } => {
            let identity = identity_client(&settings)
                .context("identity url and anon key are required to register")?;
            identity.sign_up(&email, &password, &full_name).await?;
            println!("Registration successful! You can now log in.");
        }
        Commands::Logout => {
            let session_file = SessionFile::at_default_location()?;
            if let Some(session) = session_file.load() {
                if let Some(identity) = identity_client(&settings) {
                    if let Err(err) = identity.sign_out(&session.access_token).await {
                        warn!(%err, "sign-out call failed, discarding the local session anyway");
                    }
                }
            }
            session_file.clear()?;
            println!("Signed out.");
        }
        Commands::Dashboard => {
            dashboard::watch(&backend, settings.poll_interval).await?;
        }
    }
    Ok(())
}
