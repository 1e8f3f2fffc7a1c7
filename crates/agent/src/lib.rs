//! Generation side of the relay.
//!
//! - `provider` / `openai` / `registry`: chat-completion clients behind the
//!   [`ChatProvider`] trait.
//! - `pipeline`: one spawned task per accepted turn. Streams or fetches the
//!   completion, edits the placeholder message under the shared throttle and
//!   hands the final text back through the generation's result slot.
//! - `session`: the [`SessionManager`], sole owner of conversation records.
//!
//! A conversation has at most one generation in flight. Turns that arrive
//! while one is running are rejected, never queued.

pub mod openai;
pub mod pipeline;
pub mod provider;
pub mod registry;
pub mod scripted;
pub mod session;

pub use openai::OpenAiProvider;
pub use pipeline::{
    build_request, DeliveryContext, GenerationJob, GenerationOutcome, GenerationPipeline,
    FAILURE_NOTICE,
};
pub use provider::{
    ChatMessage, ChatProvider, ChatRequest, DeltaStream, MessageRole, ProviderError,
    ProviderErrorKind,
};
pub use registry::ProviderRegistry;
pub use scripted::{ScriptStep, ScriptedProvider};
pub use session::{default_settings, SessionLimits, SessionManager, SessionSetup};
