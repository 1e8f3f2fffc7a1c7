//! Telegram adapter.
//!
//! - **API client** (`api`) - `getUpdates`, `sendMessage` and `editMessageText`
//!   over the Bot HTTP API; implements the core `Transport` trait
//! - **Polling** (`polling`) - long-polling loop with reconnect backoff that
//!   forwards allow-listed messages to the dispatcher
//! - **Events** (`events`) - update payloads and conversation resolution
//! - **Commands** (`commands`) - `/chat`, `/new`, `/set` and the rest
//! - **Rendering** (`render`) - CommonMark to MarkdownV2 with an escape fallback

pub mod api;
pub mod commands;
pub mod events;
pub mod polling;
pub mod render;

pub use api::TelegramClient;
pub use commands::{parse_command, ChatCommand, ADMIN_HELP_TEXT, HELP_TEXT};
pub use events::{resolve_update, InboundMessage, Resolution, Update};
pub use polling::{PollingError, PollingRunner, ReconnectPolicy, UpdateSource};
pub use render::{escape_text, MarkdownV2Renderer};
