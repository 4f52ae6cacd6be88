//! Notification sink contract + webhook delivery for rankwatch.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

pub const EMBED_COLOR: u32 = 0xC62E3E;
const MAX_FIELDS_PER_EMBED: usize = 25;
const MAX_EMBED_CHARS: usize = 6000;
const MAX_FIELD_NAME_CHARS: usize = 256;
const MAX_FIELD_VALUE_CHARS: usize = 1024;
const CDN_BASE: &str = "https://cdn.discordapp.com";

/// Formatted message handed to a sink: a heading plus one field per change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
    pub description: String,
    pub fields: Vec<NotificationField>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationField {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("webhook request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("webhook rejected message with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &ChangeNotification) -> Result<(), DeliveryError>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WebhookUrlError {
    #[error("webhook url has {found} '/'-separated segments, expected at least 7")]
    MissingSegments { found: usize },
    #[error("webhook id {0:?} is not numeric")]
    NonNumericId(String),
    #[error("webhook url has an empty token")]
    MissingToken,
}

/// Webhook id + token pair parsed from `.../webhooks/{id}/{token}`.
#[derive(Clone, PartialEq, Eq)]
pub struct WebhookEndpoint {
    api_base: String,
    hooks_base: String,
    id: u64,
    token: String,
}

impl WebhookEndpoint {
    pub fn parse(url: &str) -> Result<Self, WebhookUrlError> {
        let segments = url.trim().split('/').collect::<Vec<_>>();
        if segments.len() < 7 {
            return Err(WebhookUrlError::MissingSegments {
                found: segments.len(),
            });
        }

        let raw_id = segments[5];
        if raw_id.is_empty() || !raw_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(WebhookUrlError::NonNumericId(raw_id.to_string()));
        }
        let id = raw_id
            .parse::<u64>()
            .map_err(|_| WebhookUrlError::NonNumericId(raw_id.to_string()))?;

        let token = segments[6].split(['?', '#']).next().unwrap_or_default();
        if token.is_empty() {
            return Err(WebhookUrlError::MissingToken);
        }

        Ok(Self {
            api_base: segments[..4].join("/"),
            hooks_base: segments[..5].join("/"),
            id,
            token: token.to_string(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn execute_url(&self) -> String {
        format!("{}/{}/{}?wait=true", self.hooks_base, self.id, self.token)
    }

    fn user_url(&self, user_id: u64) -> String {
        format!("{}/users/{}", self.api_base, user_id)
    }
}

impl fmt::Debug for WebhookEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookEndpoint")
            .field("hooks_base", &self.hooks_base)
            .field("id", &self.id)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// User shown as the message author; resolved through the bot API when a token is known.
#[derive(Clone, PartialEq, Eq)]
pub struct DisplayUser {
    pub user_id: u64,
    pub bot_token: Option<String>,
}

impl fmt::Debug for DisplayUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisplayUser")
            .field("user_id", &self.user_id)
            .field("bot_token", &self.bot_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmbedAuthor {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Embed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub color: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<EmbedAuthor>,
    pub fields: Vec<EmbedField>,
    pub timestamp: DateTime<Utc>,
}

impl Embed {
    fn start(
        description: Option<String>,
        author: Option<EmbedAuthor>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            description,
            color: EMBED_COLOR,
            author,
            fields: Vec::new(),
            timestamp,
        }
    }

    fn text_len(&self) -> usize {
        self.description.as_deref().map_or(0, |d| d.chars().count())
            + self.author.as_ref().map_or(0, |a| a.name.chars().count())
            + self
                .fields
                .iter()
                .map(|f| f.name.chars().count() + f.value.chars().count())
                .sum::<usize>()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllowedMentions {
    pub users: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub embeds: Vec<Embed>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_mentions: Option<AllowedMentions>,
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Split a notification into webhook messages of one embed each, keeping every
/// embed within the field-count and character limits of the webhook API.
///
/// The description and the user mention ride on the first message only.
pub fn build_payloads(
    notification: &ChangeNotification,
    author: Option<&EmbedAuthor>,
    mention: Option<u64>,
) -> Vec<WebhookPayload> {
    let mut embeds = Vec::new();
    let mut embed = Embed::start(
        Some(notification.description.clone()),
        author.cloned(),
        notification.timestamp,
    );
    let mut used = embed.text_len();

    for field in &notification.fields {
        let field = EmbedField {
            name: truncate_chars(&field.name, MAX_FIELD_NAME_CHARS),
            value: truncate_chars(&field.value, MAX_FIELD_VALUE_CHARS),
            inline: false,
        };
        let len = field.name.chars().count() + field.value.chars().count();
        if !embed.fields.is_empty()
            && (embed.fields.len() == MAX_FIELDS_PER_EMBED || used + len > MAX_EMBED_CHARS)
        {
            embeds.push(embed);
            embed = Embed::start(None, author.cloned(), notification.timestamp);
            used = embed.text_len();
        }
        used += len;
        embed.fields.push(field);
    }
    embeds.push(embed);

    embeds
        .into_iter()
        .enumerate()
        .map(|(index, embed)| {
            let mention = mention.filter(|_| index == 0);
            WebhookPayload {
                content: mention.map(|id| format!("<@{id}>")),
                embeds: vec![embed],
                allowed_mentions: mention.map(|id| AllowedMentions {
                    users: vec![id.to_string()],
                }),
            }
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct ApiUser {
    id: String,
    username: String,
    avatar: Option<String>,
}

/// Delivers notifications through an incoming webhook.
#[derive(Debug)]
pub struct WebhookSink {
    client: reqwest::Client,
    endpoint: WebhookEndpoint,
    display_user: Option<DisplayUser>,
    author: OnceCell<EmbedAuthor>,
}

impl WebhookSink {
    pub fn new(
        client: reqwest::Client,
        endpoint: WebhookEndpoint,
        display_user: Option<DisplayUser>,
    ) -> Self {
        Self {
            client,
            endpoint,
            display_user,
            author: OnceCell::new(),
        }
    }

    async fn fetch_author(
        &self,
        user_id: u64,
        bot_token: &str,
    ) -> Result<EmbedAuthor, reqwest::Error> {
        let user: ApiUser = self
            .client
            .get(self.endpoint.user_url(user_id))
            .header(reqwest::header::AUTHORIZATION, format!("Bot {bot_token}"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(EmbedAuthor {
            icon_url: user
                .avatar
                .map(|hash| format!("{CDN_BASE}/avatars/{}/{hash}.png", user.id)),
            name: user.username,
        })
    }

    /// Resolved author, or `None` when there is no bot token or the lookup failed.
    /// A failed lookup is retried on the next delivery.
    async fn author(&self) -> Option<&EmbedAuthor> {
        let user = self.display_user.as_ref()?;
        let token = user.bot_token.as_deref()?;
        match self
            .author
            .get_or_try_init(|| self.fetch_author(user.user_id, token))
            .await
        {
            Ok(author) => Some(author),
            Err(err) => {
                warn!(
                    user_id = user.user_id,
                    error = %err,
                    "could not resolve display user; mentioning instead"
                );
                None
            }
        }
    }

    async fn post(&self, payload: &WebhookPayload) -> Result<(), DeliveryError> {
        let resp = self
            .client
            .post(self.endpoint.execute_url())
            .json(payload)
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(DeliveryError::Rejected {
            status: status.as_u16(),
            body: truncate_chars(&body, 512),
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    /// Posts every message in order and stops at the first failure. Messages
    /// already posted are not rolled back, so a retried notification repeats them.
    async fn deliver(&self, notification: &ChangeNotification) -> Result<(), DeliveryError> {
        let author = self.author().await;
        let mention = match author {
            Some(_) => None,
            None => self.display_user.as_ref().map(|u| u.user_id),
        };

        let payloads = build_payloads(notification, author, mention);
        for payload in &payloads {
            self.post(payload).await?;
        }
        debug!(
            webhook_id = self.endpoint.id(),
            messages = payloads.len(),
            fields = notification.fields.len(),
            "notification delivered"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 20, 9, 0, 0).single().unwrap()
    }

    fn notification(fields: usize, value_len: usize) -> ChangeNotification {
        ChangeNotification {
            description: "heading".into(),
            fields: (0..fields)
                .map(|i| NotificationField {
                    name: format!("Program {i}"),
                    value: "x".repeat(value_len),
                })
                .collect(),
            timestamp: ts(),
        }
    }

    #[test]
    fn parses_webhook_id_and_token() {
        let endpoint =
            WebhookEndpoint::parse("https://discord.com/api/webhooks/123456789/abc-DEF_tok")
                .unwrap();
        assert_eq!(endpoint.id(), 123456789);
        assert_eq!(
            endpoint.execute_url(),
            "https://discord.com/api/webhooks/123456789/abc-DEF_tok?wait=true"
        );
        assert_eq!(endpoint.user_url(7), "https://discord.com/api/users/7");
    }

    #[test]
    fn rejects_short_webhook_url() {
        assert_eq!(
            WebhookEndpoint::parse("https://discord.com/api/webhooks/123"),
            Err(WebhookUrlError::MissingSegments { found: 6 })
        );
    }

    #[test]
    fn rejects_non_numeric_webhook_id() {
        assert_eq!(
            WebhookEndpoint::parse("https://discord.com/api/webhooks/abc/token"),
            Err(WebhookUrlError::NonNumericId("abc".into()))
        );
    }

    #[test]
    fn rejects_empty_token() {
        assert_eq!(
            WebhookEndpoint::parse("https://discord.com/api/webhooks/1/"),
            Err(WebhookUrlError::MissingToken)
        );
    }

    #[test]
    fn debug_output_hides_secrets() {
        let endpoint =
            WebhookEndpoint::parse("https://discord.com/api/webhooks/1/supersecret").unwrap();
        assert!(!format!("{endpoint:?}").contains("supersecret"));
        let user = DisplayUser {
            user_id: 5,
            bot_token: Some("bottoken".into()),
        };
        assert!(!format!("{user:?}").contains("bottoken"));
    }

    #[test]
    fn small_notification_is_one_message() {
        let author = EmbedAuthor {
            name: "applicant".into(),
            icon_url: None,
        };
        let payloads = build_payloads(&notification(3, 10), Some(&author), None);
        assert_eq!(payloads.len(), 1);

        let json = serde_json::to_value(&payloads[0]).unwrap();
        assert!(json.get("content").is_none());
        let embed = &json["embeds"][0];
        assert_eq!(embed["color"], EMBED_COLOR);
        assert_eq!(embed["description"], "heading");
        assert_eq!(embed["author"]["name"], "applicant");
        assert_eq!(embed["fields"].as_array().unwrap().len(), 3);
        assert_eq!(embed["fields"][0]["inline"], false);
        assert_eq!(embed["timestamp"], "2026-07-20T09:00:00Z");
    }

    #[test]
    fn field_count_limit_splits_messages() {
        let payloads = build_payloads(&notification(30, 10), None, Some(99));
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[0].embeds[0].fields.len(), 25);
        assert_eq!(payloads[1].embeds[0].fields.len(), 5);
        assert_eq!(payloads[0].content.as_deref(), Some("<@99>"));
        assert!(payloads[1].content.is_none());
        assert!(payloads[1].embeds[0].description.is_none());
    }

    #[test]
    fn character_budget_splits_messages() {
        let payloads = build_payloads(&notification(10, 1000), None, None);
        assert!(payloads.len() >= 2);
        for payload in &payloads {
            assert!(payload.embeds[0].text_len() <= MAX_EMBED_CHARS);
        }
        let total: usize = payloads.iter().map(|p| p.embeds[0].fields.len()).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn oversized_field_values_are_truncated() {
        let payloads = build_payloads(&notification(1, 5000), None, None);
        assert_eq!(payloads[0].embeds[0].fields[0].value.chars().count(), MAX_FIELD_VALUE_CHARS);
    }

    fn header_end(buf: &[u8]) -> Option<usize> {
        buf.windows(4).position(|w| w == b"\r\n\r\n")
    }

    async fn serve_once(status: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                if let Some(end) = header_end(&buf) {
                    let headers = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
                    let body_len = headers
                        .lines()
                        .find_map(|l| l.strip_prefix("content-length:"))
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if buf.len() >= end + 4 + body_len {
                        break;
                    }
                }
            }
            let response =
                format!("HTTP/1.1 {status}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&buf).to_string()
        });
        (format!("http://{addr}/api/webhooks/42/secret"), handle)
    }

    #[tokio::test]
    async fn delivers_to_execute_url_with_mention() {
        let (url, server) = serve_once("204 No Content").await;
        let sink = WebhookSink::new(
            reqwest::Client::new(),
            WebhookEndpoint::parse(&url).unwrap(),
            Some(DisplayUser {
                user_id: 77,
                bot_token: None,
            }),
        );

        sink.deliver(&notification(1, 5)).await.expect("delivery");
        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api/webhooks/42/secret?wait=true"));
        assert!(request.contains("\"content\":\"<@77>\""));
        assert!(request.contains("Program 0"));
    }

    #[tokio::test]
    async fn non_success_status_is_a_delivery_error() {
        let (url, server) = serve_once("500 Internal Server Error").await;
        let sink = WebhookSink::new(
            reqwest::Client::new(),
            WebhookEndpoint::parse(&url).unwrap(),
            None,
        );

        let err = sink.deliver(&notification(1, 5)).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Rejected { status: 500, .. }));
        server.await.unwrap();
    }
}
