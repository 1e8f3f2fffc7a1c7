use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt, TryStreamExt};
use reqwest::{header, Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;

use ichigo_core::config::ProviderConfig;

use crate::provider::{ChatMessage, ChatProvider, ChatRequest, DeltaStream, ProviderError};

const MAX_SSE_LINE_BYTES: usize = 1024 * 1024;

/// Client for OpenAI-compatible `/chat/completions` endpoints.
pub struct OpenAiProvider {
    client: Client,
    endpoint: String,
    api_key: Option<SecretString>,
    request_timeout: Duration,
}

impl OpenAiProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.timeout_secs.min(30)))
            .build()
            .map_err(|e| ProviderError::unknown(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            endpoint: completions_endpoint(&config.base_url),
            api_key: config.api_key.clone(),
            request_timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post(
        &self,
        request: &ChatRequest,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let body = CompletionBody::new(request, stream);
        let mut builder = self
            .client
            .post(&self.endpoint)
            .header(header::CONTENT_TYPE, "application/json")
            .json(&body);
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key.expose_secret());
        }
        if !stream {
            builder = builder.timeout(self.request_timeout);
        }

        let response = builder.send().await.map_err(map_send_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body, retry_after))
    }
}

pub fn completions_endpoint(base_url: &str) -> String {
    format!("{}/chat/completions", base_url.trim_end_matches('/'))
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    async fn complete(&self, request: ChatRequest) -> Result<String, ProviderError> {
        let response = self.post(&request, false).await?;
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::network(format!("failed to read response: {e}")))?;
        parse_completion(&body)
    }

    async fn stream(&self, request: ChatRequest) -> Result<DeltaStream, ProviderError> {
        let response = self.post(&request, true).await?;
        let bytes = Box::pin(response.bytes_stream().map_err(std::io::Error::other));
        let lines = FramedRead::new(
            StreamReader::new(bytes),
            LinesCodec::new_with_max_length(MAX_SSE_LINE_BYTES),
        );

        let deltas = stream::unfold(Some(lines), |state| async move {
            let mut lines = state?;
            loop {
                let line = match lines.next().await {
                    None => return None,
                    Some(Ok(line)) => line,
                    Some(Err(e)) => {
                        let error = ProviderError::network(format!("stream read failed: {e}"));
                        return Some((Err(error), None));
                    }
                };
                match parse_sse_line(&line) {
                    Ok(SseEvent::Skip) => continue,
                    Ok(SseEvent::Done) => return None,
                    Ok(SseEvent::Delta(text)) => return Some((Ok(text), Some(lines))),
                    Err(error) => return Some((Err(error), None)),
                }
            }
        });

        Ok(deltas.boxed())
    }
}

fn map_send_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::network(format!("request timeout: {e}"))
    } else if e.is_connect() {
        ProviderError::network(format!("connection failed: {e}"))
    } else {
        ProviderError::unknown(format!("request failed: {e}"))
    }
}

fn classify_status(status: StatusCode, body: &str, retry_after: Option<Duration>) -> ProviderError {
    let message = serde_json::from_str::<ErrorResponse>(body)
        .map(|parsed| parsed.error.message)
        .unwrap_or_else(|_| body.to_string());

    let error = match status.as_u16() {
        401 | 403 => ProviderError::auth(format!("authentication failed: {message}")),
        429 => ProviderError::rate_limit(format!("rate limit exceeded: {message}")),
        400 | 404 | 422 => ProviderError::invalid_request(format!("invalid request: {message}")),
        500..=599 => ProviderError::server_error(format!("server error: {message}")),
        _ => ProviderError::unknown(format!("HTTP {status}: {message}")),
    };
    match retry_after {
        Some(duration) => error.with_retry_after(duration),
        None => error,
    }
}

fn parse_completion(body: &str) -> Result<String, ProviderError> {
    let response: CompletionResponse = serde_json::from_str(body)
        .map_err(|e| ProviderError::decode(format!("failed to parse response: {e}")))?;
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::decode("response contained no choices"))?;
    Ok(choice.message.content.unwrap_or_default())
}

#[derive(Debug, PartialEq, Eq)]
enum SseEvent {
    Delta(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> Result<SseEvent, ProviderError> {
    let line = line.trim_end_matches('\r');
    let Some(data) = line.strip_prefix("data:") else {
        // blank separators, comments, `event:` and `id:` fields
        return Ok(SseEvent::Skip);
    };
    let data = data.trim_start();
    if data == "[DONE]" {
        return Ok(SseEvent::Done);
    }

    if let Ok(error) = serde_json::from_str::<ErrorResponse>(data) {
        return Err(ProviderError::server_error(format!("stream error: {}", error.error.message)));
    }

    let chunk: StreamChunk = serde_json::from_str(data)
        .map_err(|e| ProviderError::decode(format!("failed to parse stream chunk: {e}")))?;
    let text: String =
        chunk.choices.into_iter().filter_map(|choice| choice.delta.content).collect();
    if text.is_empty() {
        Ok(SseEvent::Skip)
    } else {
        Ok(SseEvent::Delta(text))
    }
}

#[derive(Debug, Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    max_completion_tokens: u32,
    stream: bool,
}

impl<'a> CompletionBody<'a> {
    fn new(request: &'a ChatRequest, stream: bool) -> Self {
        Self {
            model: &request.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_completion_tokens: request.max_completion_tokens,
            stream,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use reqwest::StatusCode;

    use super::{
        classify_status, completions_endpoint, parse_completion, parse_sse_line, CompletionBody,
        SseEvent,
    };
    use crate::provider::{ChatMessage, ChatRequest, MessageRole, ProviderErrorKind};

    #[test]
    fn endpoint_tolerates_trailing_slash() {
        assert_eq!(
            completions_endpoint("https://api.openai.com/v1/"),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[test]
    fn request_body_omits_temperature_when_unsupported() {
        let request = ChatRequest {
            model: "o3-mini".to_string(),
            messages: vec![
                ChatMessage::new(MessageRole::Developer, "be brief"),
                ChatMessage::new(MessageRole::User, "hello"),
            ],
            temperature: None,
            max_completion_tokens: 4000,
        };
        let body = serde_json::to_value(CompletionBody::new(&request, true)).expect("serialize");

        assert_eq!(body["model"], "o3-mini");
        assert_eq!(body["messages"][0]["role"], "developer");
        assert_eq!(body["messages"][1]["content"], "hello");
        assert_eq!(body["stream"], true);
        assert_eq!(body["max_completion_tokens"], 4000);
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn sse_lines_decode_to_deltas() {
        let delta = r#"data: {"choices":[{"index":0,"delta":{"content":"Hel"}}]}"#;
        assert_eq!(parse_sse_line(delta), Ok(SseEvent::Delta("Hel".to_string())));

        let role_only = r#"data: {"choices":[{"index":0,"delta":{"role":"assistant"}}]}"#;
        assert_eq!(parse_sse_line(role_only), Ok(SseEvent::Skip));
        assert_eq!(parse_sse_line(""), Ok(SseEvent::Skip));
        assert_eq!(parse_sse_line(": keep-alive"), Ok(SseEvent::Skip));
        assert_eq!(parse_sse_line("data: [DONE]"), Ok(SseEvent::Done));
        assert_eq!(parse_sse_line("data:[DONE]\r"), Ok(SseEvent::Done));
    }

    #[test]
    fn sse_error_payloads_and_garbage_are_errors() {
        let error = parse_sse_line(r#"data: {"error":{"message":"overloaded"}}"#);
        assert!(matches!(error, Err(ref e) if e.kind == ProviderErrorKind::ServerError));

        let garbage = parse_sse_line("data: {not json");
        assert!(matches!(garbage, Err(ref e) if e.kind == ProviderErrorKind::Decode));
    }

    #[test]
    fn completion_body_yields_first_choice_content() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"hello!"}}]}"#;
        assert_eq!(parse_completion(body), Ok("hello!".to_string()));

        let empty = r#"{"choices":[]}"#;
        assert!(parse_completion(empty).is_err());
    }

    #[test]
    fn status_codes_are_classified() {
        let body = r#"{"error":{"message":"slow down"}}"#;
        let limited =
            classify_status(StatusCode::TOO_MANY_REQUESTS, body, Some(Duration::from_secs(2)));
        assert_eq!(limited.kind, ProviderErrorKind::RateLimit);
        assert_eq!(limited.retry_after, Some(Duration::from_secs(2)));
        assert!(limited.message.contains("slow down"));

        let auth = classify_status(StatusCode::UNAUTHORIZED, "nope", None);
        assert_eq!(auth.kind, ProviderErrorKind::Auth);

        let server = classify_status(StatusCode::BAD_GATEWAY, "", None);
        assert_eq!(server.kind, ProviderErrorKind::ServerError);
    }
}
