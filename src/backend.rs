use async_trait::async_trait;
use futures::StreamExt;
use tracing::warn;
use url::Url;

use crate::dashboard::LogEntry;
use crate::models::{ChatAnswer, ChatRequest, Message};
use crate::stream::StreamError;

/// Raw chunk stream of one open chat exchange.
pub type ByteStream = futures::stream::BoxStream<'static, Result<Vec<u8>, reqwest::Error>>;

/// Persistence collaborator for the conversation. The backend is the real
/// store; tests substitute recording fakes.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn fetch(&self, token: Option<&str>) -> anyhow::Result<Vec<Message>>;
    async fn append(&self, token: Option<String>, msg: Message) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: Url,
}

impl BackendClient {
    pub fn new(base_url: Url) -> Self {
        Self { http: reqwest::Client::new(), base_url }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.as_str().trim_end_matches('/'), path)
    }

    /// Opens the streaming chat exchange. Fails fast on transport errors or
    /// a non-success status; no bytes are consumed here.
    pub async fn open_chat_stream(
        &self,
        question: &str,
        token: Option<&str>,
    ) -> Result<ByteStream, StreamError> {
        let mut rb = self.http.post(self.endpoint("chat/stream")).json(&ChatRequest { question });
        if let Some(token) = token {
            rb = rb.bearer_auth(token);
        }
        let resp = rb.send().await.map_err(StreamError::Connect)?;
        if !resp.status().is_success() {
            return Err(StreamError::Status(resp.status()));
        }
        Ok(resp.bytes_stream().map(|chunk| chunk.map(|b| b.to_vec())).boxed())
    }

    /// Non-streaming fallback: one request, one complete answer.
    pub async fn ask(&self, question: &str, token: Option<&str>) -> anyhow::Result<String> {
        let mut rb = self.http.post(self.endpoint("chat")).json(&ChatRequest { question });
        if let Some(token) = token {
            rb = rb.bearer_auth(token);
        }
        let resp = rb.send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("chat request failed: {}", resp.status());
        }
        let answer: ChatAnswer = resp.json().await?;
        Ok(answer.answer)
    }

    pub async fn fetch_logs(&self) -> anyhow::Result<Vec<LogEntry>> {
        let resp = self.http.get(self.endpoint("logs")).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("log fetch failed: {}", resp.status());
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl HistoryStore for BackendClient {
    async fn fetch(&self, token: Option<&str>) -> anyhow::Result<Vec<Message>> {
        let mut rb = self.http.get(self.endpoint("history"));
        if let Some(token) = token {
            rb = rb.bearer_auth(token);
        }
        let resp = rb.send().await?;
        if !resp.status().is_success() {
            warn!(status = %resp.status(), "history fetch rejected, starting empty");
            return Ok(Vec::new());
        }
        let value: serde_json::Value = resp.json().await?;
        match serde_json::from_value::<Vec<Message>>(value) {
            Ok(messages) => Ok(messages),
            Err(err) => {
                warn!(%err, "history response was not a message array, starting empty");
                Ok(Vec::new())
            }
        }
    }

    async fn append(&self, token: Option<String>, msg: Message) -> anyhow::Result<()> {
        let mut rb = self.http.post(self.endpoint("history")).json(&msg);
        if let Some(token) = token {
            rb = rb.bearer_auth(token);
        }
        rb.send().await?.error_for_status()?;
        Ok(())
    }
}
