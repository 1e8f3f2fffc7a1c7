use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::errors::TransportError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextFormat {
    Plain,
    Markdown,
}

/// Identifies a message previously sent through a [`Transport`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageHandle {
    pub chat_id: i64,
    pub message_id: i64,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        format: TextFormat,
    ) -> Result<MessageHandle, TransportError>;

    async fn edit_message(
        &self,
        handle: MessageHandle,
        text: &str,
        format: TextFormat,
    ) -> Result<(), TransportError>;
}

/// Turns raw model output into text the transport accepts. Never fails.
pub trait Renderer: Send + Sync {
    fn render(&self, raw: &str) -> String;

    fn format(&self) -> TextFormat;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PlainRenderer;

impl Renderer for PlainRenderer {
    fn render(&self, raw: &str) -> String {
        raw.to_string()
    }

    fn format(&self) -> TextFormat {
        TextFormat::Plain
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportCall {
    Send { chat_id: i64, message_id: i64, text: String },
    Edit { chat_id: i64, message_id: i64, text: String },
}

impl TransportCall {
    pub fn text(&self) -> &str {
        match self {
            Self::Send { text, .. } | Self::Edit { text, .. } => text,
        }
    }

    pub fn is_edit(&self) -> bool {
        matches!(self, Self::Edit { .. })
    }
}

/// In-process transport that records every successful call. Failures queued
/// with [`RecordingTransport::fail_next`] are returned, one per call, before
/// any call is recorded.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    calls: Mutex<Vec<TransportCall>>,
    failures: Mutex<VecDeque<TransportError>>,
    next_message_id: Mutex<i64>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, error: TransportError) {
        self.failures.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).push_back(error);
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| !call.is_edit())
            .map(|call| call.text().to_string())
            .collect()
    }

    fn pop_failure(&self) -> Option<TransportError> {
        self.failures.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).pop_front()
    }

    fn record(&self, call: TransportCall) {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).push(call);
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        _format: TextFormat,
    ) -> Result<MessageHandle, TransportError> {
        if let Some(error) = self.pop_failure() {
            return Err(error);
        }
        let message_id = {
            let mut next = self.next_message_id.lock().unwrap_or_else(|p| p.into_inner());
            *next += 1;
            *next
        };
        self.record(TransportCall::Send { chat_id, message_id, text: text.to_string() });
        Ok(MessageHandle { chat_id, message_id })
    }

    async fn edit_message(
        &self,
        handle: MessageHandle,
        text: &str,
        _format: TextFormat,
    ) -> Result<(), TransportError> {
        if let Some(error) = self.pop_failure() {
            return Err(error);
        }
        self.record(TransportCall::Edit {
            chat_id: handle.chat_id,
            message_id: handle.message_id,
            text: text.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{RecordingTransport, TextFormat, Transport, TransportCall};
    use crate::errors::TransportError;

    #[tokio::test]
    async fn recording_transport_numbers_messages_and_replays_failures() {
        let transport = RecordingTransport::new();
        transport.fail_next(TransportError::Network("down".to_string()));

        let failed = transport.send_message(5, "first", TextFormat::Plain).await;
        assert!(matches!(failed, Err(TransportError::Network(_))));

        let handle = match transport.send_message(5, "hello", TextFormat::Plain).await {
            Ok(handle) => handle,
            Err(error) => panic!("send should succeed: {error}"),
        };
        assert_eq!(handle.message_id, 1);
        assert!(transport.edit_message(handle, "hello!", TextFormat::Markdown).await.is_ok());

        assert_eq!(
            transport.calls(),
            vec![
                TransportCall::Send { chat_id: 5, message_id: 1, text: "hello".to_string() },
                TransportCall::Edit { chat_id: 5, message_id: 1, text: "hello!".to_string() },
            ]
        );
        assert_eq!(transport.sent_texts(), vec!["hello".to_string()]);
    }
}
