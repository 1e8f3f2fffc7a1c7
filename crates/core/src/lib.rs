pub mod config;
pub mod delivery;
pub mod domain;
pub mod errors;
pub mod signal;
pub mod throttle;
pub mod transport;

pub use config::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};
pub use delivery::{BannerPhase, DeliveryPolicy, EditThreshold};
pub use domain::access::AccessPolicy;
pub use domain::catalog::{Catalog, ModelSpec};
pub use domain::conversation::{
    ConversationId, ConversationRecord, ConversationSettings, ConversationState,
    GenerationHandles, Role, Turn,
};
pub use errors::{SessionError, TransportError};
pub use signal::{CancellationToken, GenerationFinished, ResultSlot};
pub use throttle::Throttler;
pub use transport::{MessageHandle, PlainRenderer, Renderer, TextFormat, Transport};
