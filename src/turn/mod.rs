//! Streamed turn decoding: header record + body text.

pub mod decoder;
pub mod header;

pub use decoder::{StreamDecoder, TurnEvent};
pub use header::{HeaderRecord, Mood};
