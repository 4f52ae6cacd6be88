use std::path::PathBuf;
use std::time::Duration;

use rankwatch_notify::{DisplayUser, WebhookEndpoint, WebhookUrlError};
use reqwest::Url;
use thiserror::Error;

pub const DEFAULT_SNAPSHOT_PATH: &str = "psu_data.json";
pub const DEFAULT_INTERVAL_SECS: u64 = 3 * 60 * 60;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("{var}={value:?} is not a valid http(s) url: {reason}")]
    InvalidSiteUrl {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("WEBHOOK_URL is invalid: {0}")]
    InvalidWebhookUrl(#[from] WebhookUrlError),
    #[error("{var}={value:?} is not a positive integer")]
    InvalidNumber { var: &'static str, value: String },
}

/// Glyphs prefixed to a position change; used only when both are configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectionGlyphs {
    pub improved: String,
    pub worsened: String,
}

/// Startup configuration, built once and shared read-only.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub tracked_id: String,
    pub site_url: String,
    pub webhook: WebhookEndpoint,
    pub display_user: Option<DisplayUser>,
    pub glyphs: Option<DirectionGlyphs>,
    pub snapshot_path: PathBuf,
    pub interval: Duration,
    pub http_timeout: Duration,
    pub user_agent: String,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let require = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let tracked_id = require("SNILS")?;
        let site_url = normalize_site_url("SITE_URL", &require("SITE_URL")?)?;
        let webhook = WebhookEndpoint::parse(&require("WEBHOOK_URL")?)?;

        let bot_token = get("DISCORD_BOT_TOKEN").or_else(|| get("TOKEN"));
        let display_user = get("DISCORD_USER_ID")
            .map(|raw| parse_positive("DISCORD_USER_ID", &raw))
            .transpose()?
            .map(|user_id| DisplayUser { user_id, bot_token });

        let glyphs = match (get("EMOJI_ARROW_UP"), get("EMOJI_ARROW_DOWN")) {
            (Some(improved), Some(worsened)) => Some(DirectionGlyphs { improved, worsened }),
            _ => None,
        };

        let snapshot_path = get("RANKWATCH_SNAPSHOT_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SNAPSHOT_PATH));
        let interval = secs_or_default(&get, "RANKWATCH_INTERVAL_SECS", DEFAULT_INTERVAL_SECS)?;
        let http_timeout =
            secs_or_default(&get, "RANKWATCH_HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS)?;
        let user_agent = get("RANKWATCH_USER_AGENT")
            .unwrap_or_else(|| format!("rankwatch/{}", env!("CARGO_PKG_VERSION")));

        Ok(Self {
            tracked_id,
            site_url,
            webhook,
            display_user,
            glyphs,
            snapshot_path,
            interval,
            http_timeout,
            user_agent,
        })
    }
}

fn normalize_site_url(var: &'static str, value: &str) -> Result<String, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidSiteUrl {
        var,
        value: value.to_string(),
        reason,
    };
    let url = Url::parse(value).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme {}", url.scheme())));
    }

    let mut normalized = value.to_string();
    if !normalized.ends_with('/') {
        normalized.push('/');
    }
    Ok(normalized)
}

fn parse_positive(var: &'static str, raw: &str) -> Result<u64, ConfigError> {
    raw.parse::<u64>()
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| ConfigError::InvalidNumber {
            var,
            value: raw.to_string(),
        })
}

fn secs_or_default(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: u64,
) -> Result<Duration, ConfigError> {
    let secs = match get(var) {
        Some(raw) => parse_positive(var, &raw)?,
        None => default,
    };
    Ok(Duration::from_secs(secs))
}
