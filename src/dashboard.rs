use chrono::NaiveDateTime;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::warn;

use crate::backend::BackendClient;

/// Latency above which a query counts as slow, matching the dashboard's
/// red-pill threshold.
pub const SLOW_QUERY_MS: f64 = 10_000.0;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RetrievedChunk {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub rrf_score: Option<f64>,
}

/// One backend activity-log record. The backend writes naive local
/// timestamps, so no offset is expected; unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LogEntry {
    pub timestamp: NaiveDateTime,
    #[serde(default)]
    pub user_email: Option<String>,
    pub query: String,
    #[serde(default)]
    pub normalized_query: Option<String>,
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub latency_ms: f64,
    #[serde(default)]
    pub retrieved_chunks: Vec<RetrievedChunk>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserActivity {
    pub user: String,
    pub queries: usize,
    pub mean_latency_ms: f64,
    pub slow_queries: usize,
    pub last_seen: NaiveDateTime,
}

/// Aggregates fetched log entries per user; entries without a user land in
/// the "anonymous" bucket. Sorted by query count, busiest first, user name
/// as the tiebreak.
pub fn group_by_user(entries: &[LogEntry]) -> Vec<UserActivity> {
    let mut groups: BTreeMap<&str, (usize, f64, usize, NaiveDateTime)> = BTreeMap::new();
    for entry in entries {
        let user = entry.user_email.as_deref().unwrap_or("anonymous");
        let slot = groups.entry(user).or_insert((0, 0.0, 0, entry.timestamp));
        slot.0 += 1;
        slot.1 += entry.latency_ms;
        if entry.latency_ms > SLOW_QUERY_MS {
            slot.2 += 1;
        }
        if entry.timestamp > slot.3 {
            slot.3 = entry.timestamp;
        }
    }

    let mut rows: Vec<UserActivity> = groups
        .into_iter()
        .map(|(user, (queries, total_latency, slow_queries, last_seen))| UserActivity {
            user: user.to_string(),
            queries,
            mean_latency_ms: total_latency / queries as f64,
            slow_queries,
            last_seen,
        })
        .collect();
    rows.sort_by(|a, b| b.queries.cmp(&a.queries).then_with(|| a.user.cmp(&b.user)));
    rows
}

pub fn render_table(rows: &[UserActivity]) -> String {
    if rows.is_empty() {
        return "No activity logs found.".to_string();
    }
    let mut out = format!(
        "{:<32} {:>8} {:>12} {:>6} {:>20}\n",
        "USER", "QUERIES", "AVG LATENCY", "SLOW", "LAST SEEN"
    );
    for row in rows {
        out.push_str(&format!(
            "{:<32} {:>8} {:>11.1}s {:>6} {:>20}\n",
            row.user,
            row.queries,
            row.mean_latency_ms / 1000.0,
            row.slow_queries,
            row.last_seen.format("%Y-%m-%d %H:%M:%S"),
        ));
    }
    out
}

/// Poll-and-rerender loop; a failed fetch keeps the previous view. Exits
/// on ctrl-c.
pub async fn watch(backend: &BackendClient, interval: Duration) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(interval);
    let mut entries: Vec<LogEntry> = Vec::new();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                match backend.fetch_logs().await {
                    Ok(fetched) => entries = fetched,
                    Err(err) => warn!(%err, "log fetch failed, keeping previous view"),
                }
                println!("{}", render_table(&group_by_user(&entries)));
            }
        }
    }
    Ok(())
}
