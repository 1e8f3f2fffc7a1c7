use std::sync::{Arc, Mutex, MutexGuard};

pub use tokio_util::sync::CancellationToken;

use crate::domain::conversation::ConversationId;

/// Single-slot handoff between a generation task and its conversation.
///
/// `put` overwrites whatever was stored before; `take` empties the slot, so a
/// value is observed at most once.
#[derive(Debug)]
pub struct ResultSlot<T> {
    inner: Arc<Mutex<Option<T>>>,
}

impl<T> Clone for ResultSlot<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T> Default for ResultSlot<T> {
    fn default() -> Self {
        Self { inner: Arc::new(Mutex::new(None)) }
    }
}

impl<T> ResultSlot<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, value: T) {
        *self.lock() = Some(value);
    }

    pub fn take(&self) -> Option<T> {
        self.lock().take()
    }

    pub fn is_filled(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Notice sent by a generation task when it stops, whatever the outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GenerationFinished {
    pub conversation_id: ConversationId,
    pub generation: u64,
}

#[cfg(test)]
mod tests {
    use super::ResultSlot;

    #[test]
    fn take_observes_value_once() {
        let slot = ResultSlot::new();
        let producer = slot.clone();
        producer.put("first".to_string());
        producer.put("second".to_string());

        assert!(slot.is_filled());
        assert_eq!(slot.take().as_deref(), Some("second"));
        assert_eq!(slot.take(), None);
    }
}
