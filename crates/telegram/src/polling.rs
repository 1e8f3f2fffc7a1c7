use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use ichigo_core::{AccessPolicy, CancellationToken, TransportError};

use crate::events::{resolve_update, InboundMessage, Resolution, Update};

#[derive(Debug, Error)]
pub enum PollingError {
    #[error("polling gave up after {attempts} consecutive failures: {last}")]
    RetriesExhausted { attempts: u32, last: TransportError },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { max_retries: 10, base_delay_ms: 500, max_delay_ms: 30_000 }
    }
}

impl ReconnectPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16);
        let multiplier = 1_u64 << exponent;
        let delay_ms = self.base_delay_ms.saturating_mul(multiplier).min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}

#[async_trait]
pub trait UpdateSource: Send + Sync {
    /// Long-polls for updates with an id of at least `offset`. Acknowledges
    /// every update below `offset`.
    async fn get_updates(&self, offset: i64) -> Result<Vec<Update>, TransportError>;
}

/// Pulls updates, keeps only allow-listed text messages and forwards them to
/// the dispatcher.
pub struct PollingRunner {
    source: Arc<dyn UpdateSource>,
    access: Arc<AccessPolicy>,
    reconnect_policy: ReconnectPolicy,
    inbound: mpsc::Sender<InboundMessage>,
}

impl PollingRunner {
    pub fn new(
        source: Arc<dyn UpdateSource>,
        access: Arc<AccessPolicy>,
        reconnect_policy: ReconnectPolicy,
        inbound: mpsc::Sender<InboundMessage>,
    ) -> Self {
        Self { source, access, reconnect_policy, inbound }
    }

    /// Runs until `shutdown` fires or the dispatcher goes away. Fails only
    /// when polling keeps failing past the reconnect policy.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), PollingError> {
        let mut offset = 0_i64;
        let mut failures = 0_u32;
        info!(event_name = "telegram.polling.start", "long polling started");

        loop {
            let batch = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!(event_name = "telegram.polling.stop", "long polling stopped");
                    return Ok(());
                }
                batch = self.source.get_updates(offset) => batch,
            };

            let updates = match batch {
                Ok(updates) => {
                    failures = 0;
                    updates
                }
                Err(error) => {
                    if failures >= self.reconnect_policy.max_retries {
                        return Err(PollingError::RetriesExhausted {
                            attempts: failures + 1,
                            last: error,
                        });
                    }
                    let delay =
                        error.retry_after().unwrap_or_else(|| self.reconnect_policy.backoff(failures));
                    failures += 1;
                    warn!(
                        event_name = "telegram.polling.failed",
                        attempt = failures,
                        max_retries = self.reconnect_policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "getUpdates failed; retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
            };

            for update in updates {
                offset = offset.max(update.update_id + 1);
                match resolve_update(update, &self.access) {
                    Resolution::Accepted(message) => {
                        debug!(
                            event_name = "telegram.update.accepted",
                            update_id = message.update_id,
                            conversation_id = %message.conversation_id,
                            chat_id = message.chat_id,
                            "forwarding message"
                        );
                        if self.inbound.send(message).await.is_err() {
                            info!(
                                event_name = "telegram.polling.stop",
                                "dispatcher closed; long polling stopped"
                            );
                            return Ok(());
                        }
                    }
                    Resolution::Unauthorized { user_id, chat_id } => {
                        warn!(
                            event_name = "telegram.update.unauthorized",
                            user_id = user_id.unwrap_or_default(),
                            chat_id,
                            "message from identity outside the allow-list"
                        );
                    }
                    Resolution::Ignored => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio::sync::{mpsc, Mutex};

    use ichigo_core::config::AccessConfig;
    use ichigo_core::{AccessPolicy, CancellationToken, Catalog, ConversationId, TransportError};

    use super::{PollingError, PollingRunner, ReconnectPolicy, UpdateSource};
    use crate::events::Update;

    /// Replays scripted batches, then cancels the shutdown token.
    struct ScriptedSource {
        batches: Mutex<VecDeque<Result<Vec<Update>, TransportError>>>,
        offsets: Mutex<Vec<i64>>,
        shutdown: CancellationToken,
    }

    impl ScriptedSource {
        fn new(
            batches: Vec<Result<Vec<Update>, TransportError>>,
            shutdown: CancellationToken,
        ) -> Self {
            Self {
                batches: Mutex::new(batches.into()),
                offsets: Mutex::new(Vec::new()),
                shutdown,
            }
        }
    }

    #[async_trait]
    impl UpdateSource for ScriptedSource {
        async fn get_updates(&self, offset: i64) -> Result<Vec<Update>, TransportError> {
            self.offsets.lock().await.push(offset);
            match self.batches.lock().await.pop_front() {
                Some(batch) => batch,
                None => {
                    self.shutdown.cancel();
                    Ok(Vec::new())
                }
            }
        }
    }

    fn text_update(update_id: i64, user_id: i64, text: &str) -> Update {
        serde_json::from_value(serde_json::json!({
            "update_id": update_id,
            "message": {
                "message_id": update_id,
                "from": {"id": user_id},
                "chat": {"id": user_id, "type": "private"},
                "text": text,
            }
        }))
        .expect("valid update")
    }

    fn access() -> Arc<AccessPolicy> {
        Arc::new(AccessPolicy::new(
            &AccessConfig { admins: vec![1], users: vec![2], groups: Vec::new() },
            &[],
            &Catalog::default(),
        ))
    }

    fn no_delay(max_retries: u32) -> ReconnectPolicy {
        ReconnectPolicy { max_retries, base_delay_ms: 0, max_delay_ms: 0 }
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = ReconnectPolicy { max_retries: 5, base_delay_ms: 250, max_delay_ms: 1_000 };
        assert_eq!(policy.backoff(0).as_millis(), 250);
        assert_eq!(policy.backoff(1).as_millis(), 500);
        assert_eq!(policy.backoff(5).as_millis(), 1_000);
    }

    #[tokio::test]
    async fn forwards_allowed_messages_and_advances_offset() {
        let shutdown = CancellationToken::new();
        let source = Arc::new(ScriptedSource::new(
            vec![
                Ok(vec![text_update(5, 1, "hello"), text_update(6, 99, "intruder")]),
                Ok(vec![text_update(9, 2, "/help")]),
            ],
            shutdown.clone(),
        ));
        let (tx, mut rx) = mpsc::channel(8);
        let runner = PollingRunner::new(source.clone(), access(), no_delay(3), tx);

        runner.run(shutdown).await.expect("clean stop");

        let first = rx.recv().await.expect("first message");
        assert_eq!(first.conversation_id, ConversationId(1));
        assert_eq!(first.text, "hello");
        let second = rx.recv().await.expect("second message");
        assert_eq!(second.conversation_id, ConversationId(2));
        assert!(rx.try_recv().is_err());
        assert_eq!(*source.offsets.lock().await, vec![0, 7, 10]);
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let shutdown = CancellationToken::new();
        let source = Arc::new(ScriptedSource::new(
            vec![
                Err(TransportError::Network("connection reset".to_string())),
                Err(TransportError::Network("connection reset".to_string())),
                Ok(vec![text_update(1, 1, "hi")]),
            ],
            shutdown.clone(),
        ));
        let (tx, mut rx) = mpsc::channel(8);
        let runner = PollingRunner::new(source, access(), no_delay(2), tx);

        runner.run(shutdown).await.expect("recovered");
        assert_eq!(rx.recv().await.map(|message| message.text), Some("hi".to_string()));
    }

    #[tokio::test]
    async fn gives_up_after_exhausting_retries() {
        let shutdown = CancellationToken::new();
        let source = Arc::new(ScriptedSource::new(
            (0..3).map(|_| Err(TransportError::Network("down".to_string()))).collect(),
            shutdown.clone(),
        ));
        let (tx, _rx) = mpsc::channel(8);
        let runner = PollingRunner::new(source, access(), no_delay(2), tx);

        let error = runner.run(shutdown).await.expect_err("retries exhausted");
        assert!(matches!(error, PollingError::RetriesExhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn stops_when_dispatcher_is_gone() {
        let shutdown = CancellationToken::new();
        let source = Arc::new(ScriptedSource::new(
            vec![Ok(vec![text_update(1, 1, "hi")]), Ok(vec![text_update(2, 1, "again")])],
            CancellationToken::new(),
        ));
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        let runner = PollingRunner::new(source.clone(), access(), no_delay(2), tx);

        runner.run(shutdown).await.expect("clean stop");
        assert_eq!(source.offsets.lock().await.len(), 1);
    }
}
