use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::signal::{CancellationToken, ResultSlot};

/// Telegram user id for private chats, chat id for groups.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationId(pub i64);

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(format!("unknown turn role `{other}`")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, text: text.into() }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: Role::Assistant, text: text.into() }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationState {
    Idle,
    Responding,
}

/// User-selectable settings of a conversation.
#[derive(Clone, Debug, PartialEq)]
pub struct ConversationSettings {
    pub model: String,
    pub temperature: f32,
    pub prompt: String,
}

/// Handles given to the generation task accepted by `begin_generation`.
#[derive(Clone, Debug)]
pub struct GenerationHandles {
    pub generation: u64,
    pub cancel: CancellationToken,
    pub result: ResultSlot<String>,
}

#[derive(Debug)]
pub struct ConversationRecord {
    id: ConversationId,
    history: Vec<Turn>,
    settings: ConversationSettings,
    available_models: Vec<String>,
    state: ConversationState,
    generation: u64,
    cancel: CancellationToken,
    result: ResultSlot<String>,
}

impl ConversationRecord {
    pub fn new(
        id: ConversationId,
        settings: ConversationSettings,
        available_models: Vec<String>,
    ) -> Self {
        Self {
            id,
            history: Vec::new(),
            settings,
            available_models,
            state: ConversationState::Idle,
            generation: 0,
            cancel: CancellationToken::new(),
            result: ResultSlot::new(),
        }
    }

    pub fn id(&self) -> ConversationId {
        self.id
    }

    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    pub fn settings(&self) -> &ConversationSettings {
        &self.settings
    }

    pub fn model(&self) -> &str {
        &self.settings.model
    }

    pub fn temperature(&self) -> f32 {
        self.settings.temperature
    }

    pub fn prompt(&self) -> &str {
        &self.settings.prompt
    }

    pub fn available_models(&self) -> &[String] {
        &self.available_models
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_responding(&self) -> bool {
        self.state == ConversationState::Responding
    }

    pub fn replace_settings(&mut self, settings: ConversationSettings) {
        self.settings = settings;
    }

    pub fn set_model(&mut self, model: impl Into<String>) {
        self.settings.model = model.into();
    }

    pub fn set_temperature(&mut self, temperature: f32) {
        self.settings.temperature = temperature;
    }

    pub fn set_prompt(&mut self, prompt: impl Into<String>) {
        self.settings.prompt = prompt.into();
    }

    pub fn replace_history(&mut self, history: Vec<Turn>) {
        self.history = history;
    }

    /// Appends a turn and drops the oldest turns beyond `cap`.
    /// Returns how many turns were dropped.
    pub fn push_turn(&mut self, turn: Turn, cap: usize) -> usize {
        self.history.push(turn);
        let overflow = self.history.len().saturating_sub(cap);
        if overflow > 0 {
            self.history.drain(..overflow);
        }
        overflow
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Removes the trailing assistant turn, if any, then the trailing user turn.
    /// Returns the number of removed turns.
    pub fn undo_last_round(&mut self) -> usize {
        let mut removed = 0;
        if self.history.last().map(|turn| turn.role) == Some(Role::Assistant) {
            self.history.pop();
            removed += 1;
        }
        if self.history.last().map(|turn| turn.role) == Some(Role::User) {
            self.history.pop();
            removed += 1;
        }
        removed
    }

    /// Arms fresh signals for a new generation and marks the record as
    /// responding. Signals of older generations stay detached from this one.
    pub fn begin_generation(&mut self) -> GenerationHandles {
        self.generation += 1;
        self.cancel = CancellationToken::new();
        self.result = ResultSlot::new();
        self.state = ConversationState::Responding;
        GenerationHandles {
            generation: self.generation,
            cancel: self.cancel.clone(),
            result: self.result.clone(),
        }
    }

    /// Non-blocking collection of a delivered result. Only a responding record
    /// collects; a collected record becomes idle.
    pub fn try_collect(&mut self) -> Option<String> {
        if !self.is_responding() {
            return None;
        }
        let text = self.result.take()?;
        self.state = ConversationState::Idle;
        Some(text)
    }

    /// Raises the cancel signal of the active generation. Returns whether a
    /// generation was in flight.
    pub fn cancel(&mut self) -> bool {
        if !self.is_responding() {
            return false;
        }
        self.cancel.cancel();
        self.state = ConversationState::Idle;
        true
    }

    /// Discards any result that was delivered but never collected.
    pub fn drain_result(&mut self) -> Option<String> {
        self.result.take()
    }
}
