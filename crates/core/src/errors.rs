use std::time::Duration;

use thiserror::Error;

use crate::domain::conversation::ConversationId;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum SessionError {
    #[error("conversation {0} is not authorized")]
    NotAuthorized(ConversationId),
    #[error("conversation {0} is busy with another generation")]
    Busy(ConversationId),
    #[error("model `{alias}` is not in the catalog")]
    ModelUnavailable { alias: String },
    #[error("provider `{provider}` for model `{alias}` is not configured")]
    ProviderUnavailable { alias: String, provider: String },
    #[error("model `{alias}` is not permitted for conversation {conversation_id}")]
    ModelNotPermitted { conversation_id: ConversationId, alias: String },
    #[error("prompt `{name}` is not configured")]
    PromptUnavailable { name: String },
    #[error("temperature {0} is outside 0.0..=2.0")]
    InvalidTemperature(f32),
}

impl SessionError {
    /// Short text suitable for an in-band reply to the user.
    pub fn user_message(&self) -> String {
        match self {
            Self::NotAuthorized(_) => "You are not allowed to use this bot.".to_string(),
            Self::Busy(_) => "Last response has not completed yet.".to_string(),
            Self::ModelUnavailable { alias } => {
                format!("Model `{alias}` is not available. Use /set to pick another one.")
            }
            Self::ProviderUnavailable { alias, .. } => {
                format!("Model `{alias}` has no configured provider.")
            }
            Self::ModelNotPermitted { alias, .. } => {
                format!("Model `{alias}` is not available for this chat. See /list.")
            }
            Self::PromptUnavailable { name } => format!("Prompt `{name}` does not exist."),
            Self::InvalidTemperature(_) => {
                "Temperature must be a number between 0.0 and 2.0.".to_string()
            }
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    #[error("transport api error {code}: {description}")]
    Api { code: i64, description: String },
    #[error("transport network error: {0}")]
    Network(String),
    #[error("transport decode error: {0}")]
    Decode(String),
}

impl TransportError {
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}
