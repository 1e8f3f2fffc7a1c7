use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use ichigo_core::config::TelegramConfig;
use ichigo_core::{MessageHandle, TextFormat, Transport, TransportError};

use crate::events::{Message, Update, User};
use crate::polling::UpdateSource;
use crate::render::strip_escapes;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RETRY_AFTER_SECS: u64 = 1;

/// Bot API client covering long polling, sending and editing text messages.
pub struct TelegramClient {
    http: Client,
    api_base_url: String,
    token: SecretString,
    poll_timeout_secs: u64,
}

impl TelegramClient {
    pub fn new(config: &TelegramConfig) -> Result<Self, TransportError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(network_error)?;

        Ok(Self {
            http,
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            token: config.bot_token.clone(),
            poll_timeout_secs: config.poll_timeout_secs,
        })
    }

    pub async fn get_me(&self) -> Result<User, TransportError> {
        self.call("getMe", &serde_json::json!({}), REQUEST_TIMEOUT).await
    }

    async fn call<P, R>(
        &self,
        method: &str,
        payload: &P,
        timeout: Duration,
    ) -> Result<R, TransportError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}/bot{}/{method}", self.api_base_url, self.token.expose_secret());
        let response = self
            .http
            .post(url)
            .json(payload)
            .timeout(timeout)
            .send()
            .await
            .map_err(network_error)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(network_error)?;
        decode_response(status, &body)
    }

    async fn send_text(&self, payload: &TextPayload<'_>) -> Result<Message, TransportError> {
        self.call("sendMessage", payload, REQUEST_TIMEOUT).await
    }

    async fn edit_text(&self, payload: &TextPayload<'_>) -> Result<(), TransportError> {
        // the result is the edited message, or `true` for inline messages
        self.call::<_, serde_json::Value>("editMessageText", payload, REQUEST_TIMEOUT)
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl Transport for TelegramClient {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        format: TextFormat,
    ) -> Result<MessageHandle, TransportError> {
        let payload = TextPayload::new(chat_id, None, text, format);
        let sent = match self.send_text(&payload).await {
            Err(error) if format == TextFormat::Markdown && is_entity_error(&error) => {
                warn!(
                    event_name = "telegram.markdown_rejected",
                    chat_id,
                    error = %error,
                    "resending message as plain text"
                );
                let plain = strip_escapes(text);
                self.send_text(&TextPayload::new(chat_id, None, &plain, TextFormat::Plain)).await
            }
            other => other,
        }?;

        Ok(MessageHandle { chat_id: sent.chat.id, message_id: sent.message_id })
    }

    async fn edit_message(
        &self,
        handle: MessageHandle,
        text: &str,
        format: TextFormat,
    ) -> Result<(), TransportError> {
        let payload = TextPayload::new(handle.chat_id, Some(handle.message_id), text, format);
        let result = match self.edit_text(&payload).await {
            Err(error) if format == TextFormat::Markdown && is_entity_error(&error) => {
                warn!(
                    event_name = "telegram.markdown_rejected",
                    chat_id = handle.chat_id,
                    message_id = handle.message_id,
                    error = %error,
                    "resending edit as plain text"
                );
                let plain = strip_escapes(text);
                let payload = TextPayload::new(
                    handle.chat_id,
                    Some(handle.message_id),
                    &plain,
                    TextFormat::Plain,
                );
                self.edit_text(&payload).await
            }
            other => other,
        };

        match result {
            Err(error) if is_not_modified(&error) => Ok(()),
            other => other,
        }
    }
}

#[async_trait]
impl UpdateSource for TelegramClient {
    async fn get_updates(&self, offset: i64) -> Result<Vec<Update>, TransportError> {
        let payload = UpdatesPayload {
            offset,
            timeout: self.poll_timeout_secs,
            allowed_updates: &["message"],
        };
        let timeout = Duration::from_secs(self.poll_timeout_secs) + REQUEST_TIMEOUT;
        self.call("getUpdates", &payload, timeout).await
    }
}

/// Request errors can carry the request URL, which embeds the bot token.
fn network_error(error: reqwest::Error) -> TransportError {
    TransportError::Network(error.without_url().to_string())
}

fn is_entity_error(error: &TransportError) -> bool {
    matches!(error, TransportError::Api { code: 400, description }
        if description.contains("can't parse entities"))
}

fn is_not_modified(error: &TransportError) -> bool {
    matches!(error, TransportError::Api { code: 400, description }
        if description.contains("message is not modified"))
}

fn decode_response<R: DeserializeOwned>(status: u16, body: &str) -> Result<R, TransportError> {
    let envelope: ApiResponse<R> = serde_json::from_str(body)
        .map_err(|e| TransportError::Decode(format!("HTTP {status}: {e}")))?;

    if envelope.ok {
        return envelope
            .result
            .ok_or_else(|| TransportError::Decode("response has no result".to_string()));
    }

    let code = envelope.error_code.unwrap_or(i64::from(status));
    if code == 429 {
        let retry_after = envelope
            .parameters
            .and_then(|parameters| parameters.retry_after)
            .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
        return Err(TransportError::RateLimited { retry_after: Duration::from_secs(retry_after) });
    }
    Err(TransportError::Api { code, description: envelope.description.unwrap_or_default() })
}

#[derive(Debug, Serialize)]
struct TextPayload<'a> {
    chat_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_id: Option<i64>,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parse_mode: Option<&'static str>,
}

impl<'a> TextPayload<'a> {
    fn new(chat_id: i64, message_id: Option<i64>, text: &'a str, format: TextFormat) -> Self {
        let parse_mode = match format {
            TextFormat::Markdown => Some("MarkdownV2"),
            TextFormat::Plain => None,
        };
        Self { chat_id, message_id, text, parse_mode }
    }
}

#[derive(Debug, Serialize)]
struct UpdatesPayload<'a> {
    offset: i64,
    timeout: u64,
    allowed_updates: &'a [&'a str],
}

#[derive(Debug, Deserialize)]
struct ApiResponse<R> {
    ok: bool,
    result: Option<R>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}
