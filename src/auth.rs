use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use url::Url;

use crate::settings;

/// Opaque bearer session issued by the identity provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthSession {
    pub access_token: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    user: TokenUser,
}

#[derive(Debug, Deserialize)]
struct TokenUser {
    email: String,
}

/// Client for the GoTrue-style identity endpoints. Every call carries the
/// project's anon key; sign-out additionally carries the bearer token.
#[derive(Clone)]
pub struct IdentityClient {
    http: reqwest::Client,
    base_url: Url,
    anon_key: String,
}

impl IdentityClient {
    pub fn new(base_url: Url, anon_key: String) -> Self {
        Self { http: reqwest::Client::new(), base_url, anon_key }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.as_str().trim_end_matches('/'), path)
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> anyhow::Result<AuthSession> {
        let resp = self
            .http
            .post(self.endpoint("auth/v1/token"))
            .query(&[("grant_type", "password")])
            .header("apikey", &self.anon_key)
            .json(&serde_json::json!({"email": email, "password": password}))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("login failed: {}", error_detail(resp, status).await);
        }
        let token: TokenResponse = resp.json().await.context("malformed token response")?;
        Ok(AuthSession {
            access_token: token.access_token,
            email: token.user.email,
            created_at: Utc::now(),
        })
    }

    pub async fn sign_up(&self, email: &str, password: &str, full_name: &str) -> anyhow::Result<()> {
        let resp = self
            .http
            .post(self.endpoint("auth/v1/signup"))
            .header("apikey", &self.anon_key)
            .json(&serde_json::json!({
                "email": email,
                "password": password,
                "data": {"full_name": full_name},
            }))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("registration failed: {}", error_detail(resp, status).await);
        }
        Ok(())
    }

    pub async fn sign_out(&self, token: &str) -> anyhow::Result<()> {
        self.http
            .post(self.endpoint("auth/v1/logout"))
            .header("apikey", &self.anon_key)
            .bearer_auth(token)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Pulls the human-readable message out of an identity error body, falling
/// back to the HTTP status.
async fn error_detail(resp: reqwest::Response, status: reqwest::StatusCode) -> String {
    match resp.json::<serde_json::Value>().await {
        Ok(body) => body
            .get("error_description")
            .or_else(|| body.get("msg"))
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .unwrap_or_else(|| status.to_string()),
        Err(_) => status.to_string(),
    }
}

/// On-disk storage for the issued session, shared by the subcommands.
pub struct SessionFile {
    path: PathBuf,
}

impl SessionFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn at_default_location() -> anyhow::Result<Self> {
        Ok(Self::new(settings::resolve_data_dir()?.join("session.json")))
    }

    pub fn load(&self) -> Option<AuthSession> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    pub fn store(&self, session: &AuthSession) -> anyhow::Result<()> {
        let raw = serde_json::to_string_pretty(session)?;
        std::fs::write(&self.path, raw)
            .with_context(|| format!("could not write {}", self.path.display()))
    }

    pub fn clear(&self) -> anyhow::Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

/// Process-wide auth-state change notification. The top-level surface owns
/// the single long-lived subscription; sign-in and sign-out publish here.
pub struct AuthState {
    tx: watch::Sender<Option<AuthSession>>,
}

impl AuthState {
    pub fn new(initial: Option<AuthSession>) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<AuthSession>> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> Option<AuthSession> {
        self.tx.borrow().clone()
    }

    pub fn publish(&self, session: Option<AuthSession>) {
        // send only fails with no receivers; the state is still updated.
        let _ = self.tx.send(session);
    }
}

/// Single cancellable idle deadline, re-armed by any recognized activity.
pub struct IdleTimer {
    timeout: Duration,
    deadline: Instant,
}

impl IdleTimer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout, deadline: Instant::now() + timeout }
    }

    pub fn touch(&mut self) {
        self.deadline = Instant::now() + self.timeout;
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}
