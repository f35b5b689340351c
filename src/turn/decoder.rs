//! Incremental decoder for one streamed turn.
//!
//! A turn arrives as `<header JSON><sentinel><body text>` split into arbitrary
//! fragments. [`StreamDecoder`] buffers until the sentinel is visible, parses
//! the header, then passes body text through as it arrives.
//!
//! # Event sequence
//!
//! ```text
//! HeaderParsed → TextChunk* → Complete
//! HeaderParsed → ImageRequired → Complete
//! TextChunk (malformed header, whole buffer) → TextChunk* → Complete
//! … → Error
//! ```
//!
//! # Examples
//!
//! ```
//! use aura::turn::{StreamDecoder, TurnEvent};
//!
//! let mut decoder = StreamDecoder::new("SEP");
//! let mut events = decoder.feed(r#"{"mood":"happy"}SE"#);
//! assert!(events.is_empty());
//! events.extend(decoder.feed("PHello"));
//! events.extend(decoder.finish());
//! assert!(matches!(events[0], TurnEvent::HeaderParsed(_)));
//! assert_eq!(events[1], TurnEvent::TextChunk("Hello".into()));
//! assert_eq!(events[2], TurnEvent::Complete);
//! ```

use tracing::{debug, trace, warn};

use super::header::HeaderRecord;

/// Event produced while decoding a turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEvent {
    /// The header was parsed (or synthesized at end of stream).
    HeaderParsed(HeaderRecord),
    /// A piece of body text, in receipt order.
    TextChunk(String),
    /// The header asked for an image; the turn ends here.
    ImageRequired(String),
    /// Terminal: the turn finished normally.
    Complete,
    /// Terminal: the turn failed.
    Error(String),
}

impl TurnEvent {
    /// Whether this is `Complete` or `Error`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// Waiting for the sentinel.
    Buffering,
    /// Header handled; fragments pass straight through.
    Resolved,
    /// A terminal event has been emitted.
    Terminated,
}

/// Splits a streamed turn into a header record and body text.
#[derive(Debug)]
pub struct StreamDecoder {
    sentinel: String,
    buffer: String,
    /// Byte offset where the next sentinel search starts.
    scan_from: usize,
    state: DecodeState,
}

impl StreamDecoder {
    /// Create a decoder for one turn using `sentinel` as the delimiter.
    pub fn new(sentinel: impl Into<String>) -> Self {
        Self {
            sentinel: sentinel.into(),
            buffer: String::new(),
            scan_from: 0,
            state: DecodeState::Buffering,
        }
    }

    /// Whether a terminal event has already been emitted.
    pub fn is_terminated(&self) -> bool {
        self.state == DecodeState::Terminated
    }

    /// Whether the header has been handled and text is passing through.
    pub fn is_resolved(&self) -> bool {
        self.state == DecodeState::Resolved
    }

    /// Feed the next fragment and collect the events it produces.
    pub fn feed(&mut self, fragment: &str) -> Vec<TurnEvent> {
        match self.state {
            DecodeState::Terminated => {
                trace!(len = fragment.len(), "fragment after termination ignored");
                Vec::new()
            }
            DecodeState::Resolved => {
                if fragment.is_empty() {
                    Vec::new()
                } else {
                    vec![TurnEvent::TextChunk(fragment.to_owned())]
                }
            }
            DecodeState::Buffering => {
                self.buffer.push_str(fragment);
                self.try_resolve()
            }
        }
    }

    /// Signal end of stream.
    ///
    /// If the sentinel never appeared, the buffered text is emitted under a
    /// default header so nothing is dropped.
    pub fn finish(&mut self) -> Vec<TurnEvent> {
        let mut events = Vec::new();
        match self.state {
            DecodeState::Terminated => return events,
            DecodeState::Buffering if !self.buffer.is_empty() => {
                debug!(
                    len = self.buffer.len(),
                    "stream ended without sentinel, emitting buffer as text"
                );
                events.push(TurnEvent::HeaderParsed(HeaderRecord::default()));
                events.push(TurnEvent::TextChunk(std::mem::take(&mut self.buffer)));
            }
            DecodeState::Buffering | DecodeState::Resolved => {}
        }
        events.push(TurnEvent::Complete);
        self.terminate();
        events
    }

    /// Signal a stream failure. Emits `Error` unless already terminated.
    pub fn fail(&mut self, reason: impl Into<String>) -> Vec<TurnEvent> {
        if self.is_terminated() {
            return Vec::new();
        }
        let reason = reason.into();
        debug!(%reason, "turn failed");
        self.terminate();
        vec![TurnEvent::Error(reason)]
    }

    fn try_resolve(&mut self) -> Vec<TurnEvent> {
        let Some(offset) = self.buffer[self.scan_from..].find(&self.sentinel) else {
            self.advance_scan_window();
            return Vec::new();
        };
        let split_at = self.scan_from + offset;
        let buffer = std::mem::take(&mut self.buffer);

        let header = match HeaderRecord::parse(&buffer[..split_at]) {
            Ok(header) => header,
            Err(e) => {
                warn!(error = %e, "header unparseable, passing turn through as text");
                self.state = DecodeState::Resolved;
                return vec![TurnEvent::TextChunk(buffer)];
            }
        };

        let mut events = vec![TurnEvent::HeaderParsed(header.clone())];
        if let Some(prompt) = header.image_request() {
            debug!("header requested an image, ending turn");
            events.push(TurnEvent::ImageRequired(prompt.to_owned()));
            events.push(TurnEvent::Complete);
            self.terminate();
            return events;
        }

        let body = &buffer[split_at + self.sentinel.len()..];
        if !body.is_empty() {
            events.push(TurnEvent::TextChunk(body.to_owned()));
        }
        self.state = DecodeState::Resolved;
        events
    }

    /// Keep only the tail that could still hold the start of a split sentinel.
    fn advance_scan_window(&mut self) {
        let mut from = self
            .buffer
            .len()
            .saturating_sub(self.sentinel.len().saturating_sub(1));
        while !self.buffer.is_char_boundary(from) {
            from -= 1;
        }
        self.scan_from = from;
    }

    fn terminate(&mut self) {
        self.state = DecodeState::Terminated;
        self.buffer.clear();
        self.scan_from = 0;
    }
}
