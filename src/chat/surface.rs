//! External chat surface client.
//!
//! The bridge only needs two calls: fetch messages from a timestamp on and
//! post a message into a conversation. [`HttpChatSurface`] speaks a
//! plain JSON API:
//!
//! ```text
//! GET  {base_url}/spaces/{space}/messages?since=<rfc3339>
//! POST {base_url}/spaces/{space}/messages   {"text": ..., "conversation_id": ...}
//! ```

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::config::ChatConfig;
use crate::error::ChatError;

/// One inbound chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub sender: ChatSender,
    #[serde(default)]
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Thread or direct conversation the message belongs to.
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// Bot identities mentioned in the message.
    #[serde(default)]
    pub mentioned_bots: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSender {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub is_bot: bool,
}

impl ChatMessage {
    /// Conversation to reply into; falls back to the sender.
    pub fn conversation(&self) -> &str {
        self.conversation_id
            .as_deref()
            .filter(|c| !c.is_empty())
            .unwrap_or(&self.sender.id)
    }
}

/// Chat surface the bridge polls and posts to.
#[async_trait]
pub trait ChatSurface: Send + Sync {
    /// Messages at or after `since` (all retained messages when `None`).
    /// The bridge filters out what it has already handled.
    async fn fetch_new_messages(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ChatMessage>, ChatError>;

    /// Post `text` into `conversation_id`.
    async fn post_message(&self, conversation_id: &str, text: &str) -> Result<(), ChatError>;
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize)]
struct PostMessageRequest<'a> {
    text: &'a str,
    conversation_id: &'a str,
}

/// JSON-over-HTTP chat surface.
pub struct HttpChatSurface {
    client: Client,
    base_url: String,
    space_id: String,
    token: SecretString,
}

impl HttpChatSurface {
    pub fn new(config: &ChatConfig) -> Result<Self, ChatError> {
        let base_url = config.base_url.clone().ok_or_else(|| ChatError::NotConfigured {
            reason: "TROUPE_CHAT_BASE_URL is not set".to_string(),
        })?;
        let token = config.token.clone().ok_or_else(|| ChatError::NotConfigured {
            reason: "TROUPE_CHAT_TOKEN is not set".to_string(),
        })?;
        let space_id = config.space_id.clone().ok_or_else(|| ChatError::NotConfigured {
            reason: "TROUPE_CHAT_SPACE_ID is not set".to_string(),
        })?;

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());

        Ok(Self {
            client,
            base_url,
            space_id,
            token,
        })
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/spaces/{}/messages",
            self.base_url.trim_end_matches('/'),
            self.space_id
        )
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ChatError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ChatError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl ChatSurface for HttpChatSurface {
    async fn fetch_new_messages(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        let mut request = self
            .client
            .get(self.messages_url())
            .bearer_auth(self.token.expose_secret());
        if let Some(since) = since {
            request = request.query(&[("since", since.to_rfc3339())]);
        }

        let response = Self::check(request.send().await?).await?;
        let text = response.text().await?;
        let parsed: MessagesResponse =
            serde_json::from_str(&text).map_err(|e| ChatError::InvalidResponse {
                reason: format!("{}: {}", e, text.chars().take(200).collect::<String>()),
            })?;

        tracing::debug!("Fetched {} chat message(s)", parsed.messages.len());
        Ok(parsed.messages)
    }

    async fn post_message(&self, conversation_id: &str, text: &str) -> Result<(), ChatError> {
        let response = self
            .client
            .post(self.messages_url())
            .bearer_auth(self.token.expose_secret())
            .json(&PostMessageRequest {
                text,
                conversation_id,
            })
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}

/// Exponential backoff with jitter, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, attempts: u32) -> Self {
        Self {
            initial,
            max: max.max(initial),
            attempts: attempts.max(1),
        }
    }

    pub fn from_config(config: &ChatConfig) -> Self {
        Self::new(
            config.backoff_initial,
            config.backoff_max,
            config.max_fetch_attempts,
        )
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay before retry number `attempt` (1-based), before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Base delay plus up to 25% random jitter, still capped at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = base.mul_f64(rand::random::<f64>() * 0.25);
        (base + jitter).min(self.max)
    }

    /// Run `operation` until it succeeds or the attempts are used up.
    pub async fn retry<F, Fut, T>(&self, what: &str, mut operation: F) -> Result<T, ChatError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ChatError>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.attempts => return Err(e),
                Err(e) => {
                    let delay = self.delay(attempt);
                    tracing::warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        what,
                        attempt,
                        self.attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_doubles_up_to_ceiling() {
        let backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(3), 5);
        assert_eq!(backoff.base_delay(1), Duration::from_millis(500));
        assert_eq!(backoff.base_delay(2), Duration::from_secs(1));
        assert_eq!(backoff.base_delay(3), Duration::from_secs(2));
        assert_eq!(backoff.base_delay(4), Duration::from_secs(3));
        assert_eq!(backoff.base_delay(40), Duration::from_secs(3));
        for attempt in 1..10 {
            let delay = backoff.delay(attempt);
            assert!(delay >= backoff.base_delay(attempt));
            assert!(delay <= Duration::from_secs(3));
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(5), 4);
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let value = backoff
            .retry("fetch", move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ChatError::InvalidResponse {
                        reason: "flaky".into(),
                    })
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(tokio_test::assert_ok!(value), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_attempts() {
        let backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(5), 3);
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), ChatError> = backoff
            .retry("fetch", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ChatError::Status {
                    status: 503,
                    body: String::new(),
                })
            })
            .await;
        tokio_test::assert_err!(result);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_http_surface_requires_configuration() {
        let config = ChatConfig::default().with_space("spaces/1");
        assert!(matches!(
            HttpChatSurface::new(&config),
            Err(ChatError::NotConfigured { .. })
        ));
    }

    #[test]
    fn test_message_wire_format() {
        let raw = r#"{
            "id": "m1",
            "sender": {"id": "users/7", "display_name": "Ana"},
            "text": "@iris hi",
            "timestamp": "2026-01-02T03:04:05Z",
            "mentioned_bots": ["users/bot-1"]
        }"#;
        let message: ChatMessage = serde_json::from_str(raw).unwrap();
        assert!(!message.sender.is_bot);
        assert_eq!(message.conversation(), "users/7");
        assert_eq!(message.mentioned_bots, vec!["users/bot-1"]);
    }
}
