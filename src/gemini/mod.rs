//! Generative-language REST service: wire types, SSE framing and client.

pub mod client;
pub mod sse;
pub mod types;

pub use client::{FragmentStream, GeminiClient, GenerativeBackend, TurnRequest};
