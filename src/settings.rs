use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 900;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Partial settings from one layer (CLI flags or environment). Absent
/// fields defer to the next layer down.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Overrides {
    pub backend_url: Option<String>,
    pub identity_url: Option<String>,
    pub anon_key: Option<String>,
    pub idle_timeout_secs: Option<u64>,
    pub poll_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub backend_url: Url,
    pub identity_url: Option<Url>,
    pub anon_key: Option<String>,
    pub idle_timeout: Duration,
    pub poll_interval: Duration,
}

pub fn env_overrides() -> Overrides {
    Overrides {
        backend_url: std::env::var("ALPHAWAVE_BACKEND_URL").ok(),
        identity_url: std::env::var("ALPHAWAVE_IDENTITY_URL").ok(),
        anon_key: std::env::var("ALPHAWAVE_ANON_KEY").ok(),
        idle_timeout_secs: std::env::var("ALPHAWAVE_IDLE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok()),
        poll_interval_secs: std::env::var("ALPHAWAVE_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok()),
    }
}

/// Precedence: CLI flag, then environment, then built-in default.
pub fn resolve_settings(cli: &Overrides, env: &Overrides) -> anyhow::Result<Settings> {
    let backend = cli
        .backend_url
        .clone()
        .or_else(|| env.backend_url.clone())
        .unwrap_or_else(|| DEFAULT_BACKEND_URL.into());
    let backend_url = Url::parse(&backend).with_context(|| format!("invalid backend url: {backend}"))?;

    let identity_url = match cli.identity_url.clone().or_else(|| env.identity_url.clone()) {
        Some(raw) => Some(Url::parse(&raw).with_context(|| format!("invalid identity url: {raw}"))?),
        None => None,
    };

    let idle_timeout_secs = cli
        .idle_timeout_secs
        .or(env.idle_timeout_secs)
        .unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS);
    let poll_interval_secs = cli
        .poll_interval_secs
        .or(env.poll_interval_secs)
        .unwrap_or(DEFAULT_POLL_INTERVAL_SECS);

    Ok(Settings {
        backend_url,
        identity_url,
        anon_key: cli.anon_key.clone().or_else(|| env.anon_key.clone()),
        idle_timeout: Duration::from_secs(idle_timeout_secs),
        poll_interval: Duration::from_secs(poll_interval_secs),
    })
}

/// Data directory for on-disk state such as the stored auth session.
pub fn resolve_data_dir() -> anyhow::Result<PathBuf> {
    let base = std::env::var("XDG_DATA_HOME").ok().map(PathBuf::from).unwrap_or_else(|| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        PathBuf::from(home).join(".local").join("share")
    });
    let dir = base.join("alphawave_chat");
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_cli_over_env_over_default() {
        let cli = Overrides {
            backend_url: Some("http://cli.example:9000".into()),
            identity_url: None,
            anon_key: None,
            idle_timeout_secs: None,
            poll_interval_secs: Some(2),
        };
        let env = Overrides {
            backend_url: Some("http://env.example:8000".into()),
            identity_url: Some("http://id.example".into()),
            anon_key: Some("env-key".into()),
            idle_timeout_secs: Some(60),
            poll_interval_secs: Some(30),
        };

        let settings = resolve_settings(&cli, &env).unwrap();

        assert_eq!(settings.backend_url.as_str(), "http://cli.example:9000/"); // from cli
        assert_eq!(settings.identity_url.unwrap().as_str(), "http://id.example/"); // from env
        assert_eq!(settings.anon_key.as_deref(), Some("env-key")); // from env
        assert_eq!(settings.idle_timeout, Duration::from_secs(60)); // from env
        assert_eq!(settings.poll_interval, Duration::from_secs(2)); // from cli
    }

    #[test]
    fn defaults_fill_the_bottom_layer() {
        let settings = resolve_settings(&Overrides::default(), &Overrides::default()).unwrap();
        assert_eq!(settings.backend_url.as_str(), "http://127.0.0.1:8000/");
        assert!(settings.identity_url.is_none());
        assert_eq!(settings.idle_timeout, Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS));
        assert_eq!(settings.poll_interval, Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS));
    }

    #[test]
    fn invalid_backend_url_is_rejected() {
        let cli = Overrides { backend_url: Some("not a url".into()), ..Default::default() };
        assert!(resolve_settings(&cli, &Overrides::default()).is_err());
    }
}
