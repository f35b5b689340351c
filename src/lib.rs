//! Aura: a conversational companion client.
//!
//! Two ways to talk to the remote model:
//!
//! - **Text turns**: a streamed reply starts with a JSON header (mood, image
//!   request, code, learned facts) followed by a sentinel and the body text.
//!   [`turn::StreamDecoder`] splits the stream into [`turn::TurnEvent`]s and
//!   [`chat::ChatSession`] drives one turn at a time. Image requests go to
//!   [`image::ImageService`] and are shown as text art.
//! - **Voice**: [`live::LiveSession`] streams microphone audio over a
//!   WebSocket and schedules the model's audio replies gaplessly.
//!
//! Remote calls share one retry policy ([`retry`]) and one error type
//! ([`error::AuraError`]).

pub mod audio;
pub mod chat;
pub mod config;
pub mod error;
pub mod gemini;
pub mod image;
pub mod live;
pub mod paths;
pub mod retry;
pub mod turn;

pub use chat::{ChatSession, TurnOutcome};
pub use config::AuraConfig;
pub use error::{AuraError, Result};
pub use live::{LiveEvent, LiveSession, LiveSessionState};
pub use turn::{StreamDecoder, TurnEvent};
