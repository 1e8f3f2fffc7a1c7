use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{stream, StreamExt};
use tokio::sync::Notify;

use crate::provider::{ChatProvider, ChatRequest, DeltaStream, ProviderError};

#[derive(Clone, Debug)]
pub enum ScriptStep {
    Delta(String),
    Fail(ProviderError),
    /// Waits until the notify is signalled.
    Hold(Arc<Notify>),
}

#[derive(Clone, Debug)]
enum Script {
    Steps(Vec<ScriptStep>),
    Rejected(ProviderError),
}

/// In-process provider that replays queued scripts, one per request. Used in
/// tests and for offline dry runs. `complete` concatenates the deltas of its
/// script; `stream` yields them one by one.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_reply(&self, text: impl Into<String>) {
        self.push_steps(vec![ScriptStep::Delta(text.into())]);
    }

    pub fn push_deltas<I, S>(&self, deltas: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push_steps(deltas.into_iter().map(|delta| ScriptStep::Delta(delta.into())).collect());
    }

    pub fn push_steps(&self, steps: Vec<ScriptStep>) {
        self.lock_scripts().push_back(Script::Steps(steps));
    }

    pub fn push_rejection(&self, error: ProviderError) {
        self.lock_scripts().push_back(Script::Rejected(error));
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    fn lock_scripts(&self) -> std::sync::MutexGuard<'_, VecDeque<Script>> {
        self.scripts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_script(&self, request: ChatRequest) -> Script {
        self.requests.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).push(request);
        self.lock_scripts()
            .pop_front()
            .unwrap_or_else(|| Script::Rejected(ProviderError::unknown("no scripted response")))
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    async fn complete(&self, request: ChatRequest) -> Result<String, ProviderError> {
        let steps = match self.next_script(request) {
            Script::Rejected(error) => return Err(error),
            Script::Steps(steps) => steps,
        };

        let mut text = String::new();
        for step in steps {
            match step {
                ScriptStep::Delta(delta) => text.push_str(&delta),
                ScriptStep::Fail(error) => return Err(error),
                ScriptStep::Hold(notify) => notify.notified().await,
            }
        }
        Ok(text)
    }

    async fn stream(&self, request: ChatRequest) -> Result<DeltaStream, ProviderError> {
        let steps = match self.next_script(request) {
            Script::Rejected(error) => return Err(error),
            Script::Steps(steps) => VecDeque::from(steps),
        };

        let deltas = stream::unfold(steps, |mut steps| async move {
            loop {
                match steps.pop_front()? {
                    ScriptStep::Delta(delta) => return Some((Ok(delta), steps)),
                    ScriptStep::Fail(error) => return Some((Err(error), VecDeque::new())),
                    ScriptStep::Hold(notify) => notify.notified().await,
                }
            }
        });
        Ok(deltas.boxed())
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::ScriptedProvider;
    use crate::provider::{ChatProvider, ChatRequest, ProviderError};

    fn request() -> ChatRequest {
        ChatRequest {
            model: "scripted".to_string(),
            messages: Vec::new(),
            temperature: None,
            max_completion_tokens: 16,
        }
    }

    #[tokio::test]
    async fn scripts_are_consumed_in_order() {
        let provider = ScriptedProvider::new();
        provider.push_deltas(["A", "B"]);
        provider.push_rejection(ProviderError::auth("bad key"));

        let mut deltas = provider.stream(request()).await.expect("stream opens");
        let mut collected = Vec::new();
        while let Some(delta) = deltas.next().await {
            collected.push(delta.expect("delta"));
        }
        assert_eq!(collected, vec!["A", "B"]);

        assert!(provider.complete(request()).await.is_err());
        assert_eq!(provider.requests().len(), 2);
    }
}
