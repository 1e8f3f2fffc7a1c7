use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use ichigo_core::delivery::{banner, split_chunks, split_overflow, text_len, BannerPhase};
use ichigo_core::domain::catalog::ModelSpec;
use ichigo_core::domain::conversation::{ConversationId, GenerationHandles, Role, Turn};
use ichigo_core::{
    DeliveryPolicy, GenerationFinished, MessageHandle, Renderer, Throttler, Transport,
    TransportError,
};

use crate::provider::{ChatMessage, ChatProvider, ChatRequest, MessageRole};

pub const FAILURE_NOTICE: &str = "Failed to generate response.";

/// Everything needed to write generated text to the transport.
#[derive(Clone)]
pub struct DeliveryContext {
    pub transport: Arc<dyn Transport>,
    pub renderer: Arc<dyn Renderer>,
    pub throttler: Arc<Throttler>,
    pub policy: DeliveryPolicy,
}

/// Snapshot of one accepted turn, taken when the turn was accepted.
#[derive(Clone, Debug)]
pub struct GenerationJob {
    pub conversation_id: ConversationId,
    pub chat_id: i64,
    pub model: ModelSpec,
    pub temperature: f32,
    pub system_prompt: String,
    pub history: Vec<Turn>,
    pub max_completion_tokens: u32,
    pub handles: GenerationHandles,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GenerationOutcome {
    Completed,
    /// The provider failed; any partial text was still delivered.
    Failed,
    Cancelled,
    /// The transport never accepted the placeholder message.
    Undeliverable,
}

pub fn build_request(job: &GenerationJob) -> ChatRequest {
    let system_role =
        if job.model.accepts_system_role { MessageRole::System } else { MessageRole::Developer };

    let mut messages = Vec::with_capacity(job.history.len() + 1);
    messages.push(ChatMessage::new(system_role, job.system_prompt.clone()));
    for turn in job.history.iter().filter(|turn| !turn.text.is_empty()) {
        let role = match turn.role {
            Role::User => MessageRole::User,
            Role::Assistant => MessageRole::Assistant,
        };
        messages.push(ChatMessage::new(role, turn.text.clone()));
    }

    ChatRequest {
        model: job.model.name.clone(),
        messages,
        temperature: job.model.accepts_temperature.then_some(job.temperature),
        max_completion_tokens: job.max_completion_tokens,
    }
}

pub struct GenerationPipeline {
    provider: Arc<dyn ChatProvider>,
    delivery: DeliveryContext,
}

impl GenerationPipeline {
    pub fn new(provider: Arc<dyn ChatProvider>, delivery: DeliveryContext) -> Self {
        Self { provider, delivery }
    }

    /// Runs the job on its own task and reports to `finished` when it stops,
    /// whatever the outcome.
    pub fn spawn(
        self,
        job: GenerationJob,
        finished: mpsc::UnboundedSender<GenerationFinished>,
    ) -> JoinHandle<GenerationOutcome> {
        tokio::spawn(async move {
            let outcome = self.run(&job).await;
            let notice = GenerationFinished {
                conversation_id: job.conversation_id,
                generation: job.handles.generation,
            };
            if finished.send(notice).is_err() {
                warn!(
                    event_name = "generation.finish_notice_dropped",
                    conversation_id = %job.conversation_id,
                    generation = job.handles.generation,
                    "dispatcher is gone; completion notice dropped"
                );
            }
            outcome
        })
    }

    pub async fn run(&self, job: &GenerationJob) -> GenerationOutcome {
        let out = Output { delivery: &self.delivery, job };
        let outcome = if job.handles.cancel.is_cancelled() {
            GenerationOutcome::Cancelled
        } else if job.model.stream {
            self.run_streaming(job, &out).await
        } else {
            self.run_one_shot(job, &out).await
        };

        info!(
            event_name = "generation.finished",
            conversation_id = %job.conversation_id,
            generation = job.handles.generation,
            model = %job.model.alias,
            outcome = ?outcome,
            "generation finished"
        );
        outcome
    }

    async fn run_one_shot(&self, job: &GenerationJob, out: &Output<'_>) -> GenerationOutcome {
        let cancel = &job.handles.cancel;
        let Some(handle) = out.placeholder().await else {
            return GenerationOutcome::Undeliverable;
        };

        let completed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return GenerationOutcome::Cancelled,
            completed = self.provider.complete(build_request(job)) => completed,
        };

        let text = match completed {
            Ok(text) => text,
            Err(error) => {
                warn!(
                    event_name = "generation.provider_failed",
                    conversation_id = %job.conversation_id,
                    error_kind = ?error.kind,
                    error = %error,
                    "one-shot completion failed"
                );
                out.edit(handle, BannerPhase::Finished, "").await;
                out.notice(FAILURE_NOTICE).await;
                job.handles.result.put(String::new());
                return GenerationOutcome::Failed;
            }
        };

        if cancel.is_cancelled() {
            return GenerationOutcome::Cancelled;
        }

        let chunks = split_chunks(&text, self.delivery.policy.char_limit);
        let mut chunks = chunks.into_iter();
        out.edit(handle, BannerPhase::Finished, chunks.next().unwrap_or_default()).await;
        for chunk in chunks {
            if cancel.is_cancelled() {
                return GenerationOutcome::Cancelled;
            }
            if let Err(error) = out.send(BannerPhase::Finished, chunk).await {
                warn!(
                    event_name = "delivery.send_failed",
                    conversation_id = %job.conversation_id,
                    error = %error,
                    "failed to send continuation message"
                );
                break;
            }
        }

        job.handles.result.put(text);
        GenerationOutcome::Completed
    }

    async fn run_streaming(&self, job: &GenerationJob, out: &Output<'_>) -> GenerationOutcome {
        let cancel = &job.handles.cancel;
        let policy = self.delivery.policy;
        let Some(mut handle) = out.placeholder().await else {
            return GenerationOutcome::Undeliverable;
        };

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return GenerationOutcome::Cancelled,
            opened = self.provider.stream(build_request(job)) => opened,
        };
        let mut deltas = match opened {
            Ok(deltas) => deltas,
            Err(error) => {
                warn!(
                    event_name = "generation.provider_failed",
                    conversation_id = %job.conversation_id,
                    error_kind = ?error.kind,
                    error = %error,
                    "failed to open completion stream"
                );
                out.edit(handle, BannerPhase::Finished, "").await;
                out.notice(FAILURE_NOTICE).await;
                job.handles.result.put(String::new());
                return GenerationOutcome::Failed;
            }
        };

        let mut full = String::new();
        let mut pending = String::new();
        let mut last_edit_len = 0;
        let mut failed = false;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return GenerationOutcome::Cancelled,
                next = deltas.next() => next,
            };
            let delta = match next {
                None => break,
                Some(Ok(delta)) => delta,
                Some(Err(error)) => {
                    warn!(
                        event_name = "generation.stream_failed",
                        conversation_id = %job.conversation_id,
                        error_kind = ?error.kind,
                        error = %error,
                        received_units = text_len(&full),
                        "completion stream failed"
                    );
                    failed = true;
                    break;
                }
            };

            full.push_str(&delta);
            pending.push_str(&delta);

            while let Some((head, tail)) = split_overflow(&pending, policy.char_limit) {
                let (head, tail) = (head.to_string(), tail.to_string());
                if cancel.is_cancelled() {
                    return GenerationOutcome::Cancelled;
                }
                out.edit(handle, BannerPhase::Finished, &head).await;
                match out.send(BannerPhase::Responding, "").await {
                    Ok(next_handle) => handle = next_handle,
                    Err(error) => {
                        warn!(
                            event_name = "delivery.send_failed",
                            conversation_id = %job.conversation_id,
                            error = %error,
                            "failed to open continuation message"
                        );
                        out.notice(FAILURE_NOTICE).await;
                        job.handles.result.put(full);
                        return GenerationOutcome::Failed;
                    }
                }
                pending = tail;
            }

            let full_len = text_len(&full);
            if full_len > last_edit_len
                && policy.edit_threshold.should_edit(full_len, last_edit_len)
                && self.delivery.throttler.try_acquire()
            {
                if cancel.is_cancelled() {
                    return GenerationOutcome::Cancelled;
                }
                out.edit(handle, BannerPhase::Responding, &pending).await;
                last_edit_len = full_len;
            }
        }

        if cancel.is_cancelled() {
            return GenerationOutcome::Cancelled;
        }
        out.edit(handle, BannerPhase::Finished, &pending).await;
        if failed {
            out.notice(FAILURE_NOTICE).await;
        }

        job.handles.result.put(full);
        if failed {
            GenerationOutcome::Failed
        } else {
            GenerationOutcome::Completed
        }
    }
}

/// Transport writes for one job: banner wrapping, rendering, and rate-limit
/// retries.
struct Output<'a> {
    delivery: &'a DeliveryContext,
    job: &'a GenerationJob,
}

impl Output<'_> {
    fn render(&self, phase: BannerPhase, body: &str) -> String {
        let mut raw = banner(phase, &self.job.model.alias, self.job.temperature);
        raw.push_str(body);
        self.delivery.renderer.render(&raw)
    }

    async fn placeholder(&self) -> Option<MessageHandle> {
        match self.send(BannerPhase::Responding, "").await {
            Ok(handle) => Some(handle),
            Err(error) => {
                warn!(
                    event_name = "delivery.placeholder_failed",
                    conversation_id = %self.job.conversation_id,
                    error = %error,
                    "failed to send placeholder message"
                );
                None
            }
        }
    }

    async fn send(&self, phase: BannerPhase, body: &str) -> Result<MessageHandle, TransportError> {
        let text = self.render(phase, body);
        let format = self.delivery.renderer.format();
        let transport = &self.delivery.transport;
        let chat_id = self.job.chat_id;
        with_rate_limit_retry(self.delivery.policy.max_transport_retries, self.job, || {
            transport.send_message(chat_id, &text, format)
        })
        .await
    }

    /// Best-effort edit: failures other than rate limits are logged and
    /// swallowed.
    async fn edit(&self, handle: MessageHandle, phase: BannerPhase, body: &str) {
        let text = self.render(phase, body);
        let format = self.delivery.renderer.format();
        let transport = &self.delivery.transport;
        let result = with_rate_limit_retry(self.delivery.policy.max_transport_retries, self.job, || {
            transport.edit_message(handle, &text, format)
        })
        .await;

        if let Err(error) = result {
            warn!(
                event_name = "delivery.edit_failed",
                conversation_id = %self.job.conversation_id,
                message_id = handle.message_id,
                error = %error,
                "failed to edit message"
            );
        }
    }

    async fn notice(&self, text: &str) {
        let rendered = self.delivery.renderer.render(text);
        let format = self.delivery.renderer.format();
        let transport = &self.delivery.transport;
        let chat_id = self.job.chat_id;
        let result = with_rate_limit_retry(self.delivery.policy.max_transport_retries, self.job, || {
            transport.send_message(chat_id, &rendered, format)
        })
        .await;

        if let Err(error) = result {
            warn!(
                event_name = "delivery.notice_failed",
                conversation_id = %self.job.conversation_id,
                error = %error,
                "failed to send notice"
            );
        }
    }
}

/// Retries `operation` after each rate-limit error, waiting the transport's
/// `retry_after` plus one second, at most `max_retries` times. Gives up early
/// when the job is cancelled.
async fn with_rate_limit_retry<T, F, Fut>(
    max_retries: u32,
    job: &GenerationJob,
    mut operation: F,
) -> Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let mut attempt = 0;
    loop {
        let error = match operation().await {
            Err(error @ TransportError::RateLimited { .. }) if attempt < max_retries => error,
            other => return other,
        };
        attempt += 1;
        let wait = error.retry_after().unwrap_or_default() + Duration::from_secs(1);
        warn!(
            event_name = "delivery.rate_limited",
            conversation_id = %job.conversation_id,
            attempt,
            wait_ms = wait.as_millis() as u64,
            "transport rate limited; retrying"
        );

        tokio::select! {
            biased;
            _ = job.handles.cancel.cancelled() => return Err(error),
            _ = tokio::time::sleep(wait) => {}
        }
    }
}
