//! Error types for the aura client.
//!
//! Each variant carries a stable error code (SCREAMING_SNAKE_CASE) that is
//! included in the Display output and accessible via [`AuraError::code()`].

/// Stable error codes for programmatic error handling.
pub mod error_codes {
    /// Rate limiting or temporary unavailability of the remote service.
    pub const TRANSIENT_REMOTE: &str = "TRANSIENT_REMOTE";

    /// Non-retriable failure reported by the remote service.
    pub const PERMANENT_REMOTE: &str = "PERMANENT_REMOTE";

    /// The structured header of a streamed turn could not be parsed.
    pub const MALFORMED_HEADER: &str = "MALFORMED_HEADER";

    /// The call succeeded but carried no usable data.
    pub const EMPTY_PAYLOAD: &str = "EMPTY_PAYLOAD";

    /// The capture or playback device could not be acquired.
    pub const DEVICE_ACCESS: &str = "DEVICE_ACCESS";

    /// Operation attempted on a session that has been torn down.
    pub const SESSION_CLOSED: &str = "SESSION_CLOSED";

    /// A retriable operation ran out of attempts.
    pub const RETRIES_EXHAUSTED: &str = "RETRIES_EXHAUSTED";

    /// Unexpected message shape on a remote channel.
    pub const PROTOCOL: &str = "PROTOCOL";

    /// Audio stream or encoding failure.
    pub const AUDIO: &str = "AUDIO";

    /// Image decoding failure.
    pub const IMAGE: &str = "IMAGE";

    /// Invalid or missing configuration.
    pub const CONFIG_INVALID: &str = "CONFIG_INVALID";

    /// Filesystem I/O failure.
    pub const IO: &str = "IO";

    /// Internal channel closed unexpectedly.
    pub const CHANNEL: &str = "CHANNEL";
}

/// Top-level error type for the companion client.
#[derive(Debug, thiserror::Error)]
pub enum AuraError {
    /// Rate limiting (429) or transient server unavailability (5xx).
    #[error("[{}] {}", error_codes::TRANSIENT_REMOTE, .0)]
    TransientRemote(String),

    /// The remote service rejected the request in a way retrying cannot fix.
    #[error("[{}] {}", error_codes::PERMANENT_REMOTE, .0)]
    PermanentRemote(String),

    /// Header JSON before the sentinel was not a valid record.
    #[error("[{}] {}", error_codes::MALFORMED_HEADER, .0)]
    MalformedHeader(String),

    /// The remote call succeeded but returned nothing usable.
    #[error("[{}] {}", error_codes::EMPTY_PAYLOAD, .0)]
    EmptyPayload(String),

    /// Microphone or speaker unavailable (missing device, permission denied).
    #[error("[{}] {}", error_codes::DEVICE_ACCESS, .0)]
    DeviceAccess(String),

    /// The session was already stopped or is stopping.
    #[error("[{}] {}", error_codes::SESSION_CLOSED, .0)]
    SessionClosed(String),

    /// Final error after the retry policy gave up.
    #[error("[{}] gave up after {attempts} attempts: {last}", error_codes::RETRIES_EXHAUSTED)]
    RetriesExhausted {
        /// Total number of attempts made.
        attempts: u32,
        /// The error returned by the last attempt.
        last: Box<AuraError>,
    },

    /// Unexpected or undecodable message on a remote channel.
    #[error("[{}] {}", error_codes::PROTOCOL, .0)]
    Protocol(String),

    /// Audio stream or PCM conversion failure.
    #[error("[{}] {}", error_codes::AUDIO, .0)]
    Audio(String),

    /// Image bytes could not be decoded.
    #[error("[{}] {}", error_codes::IMAGE, .0)]
    Image(String),

    /// Configuration error.
    #[error("[{}] {}", error_codes::CONFIG_INVALID, .0)]
    Config(String),

    /// I/O error.
    #[error("[{}] {}", error_codes::IO, .0)]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("[{}] {}", error_codes::CHANNEL, .0)]
    Channel(String),
}

impl AuraError {
    /// Returns the stable error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::TransientRemote(_) => error_codes::TRANSIENT_REMOTE,
            Self::PermanentRemote(_) => error_codes::PERMANENT_REMOTE,
            Self::MalformedHeader(_) => error_codes::MALFORMED_HEADER,
            Self::EmptyPayload(_) => error_codes::EMPTY_PAYLOAD,
            Self::DeviceAccess(_) => error_codes::DEVICE_ACCESS,
            Self::SessionClosed(_) => error_codes::SESSION_CLOSED,
            Self::RetriesExhausted { .. } => error_codes::RETRIES_EXHAUSTED,
            Self::Protocol(_) => error_codes::PROTOCOL,
            Self::Audio(_) => error_codes::AUDIO,
            Self::Image(_) => error_codes::IMAGE,
            Self::Config(_) => error_codes::CONFIG_INVALID,
            Self::Io(_) => error_codes::IO,
            Self::Channel(_) => error_codes::CHANNEL,
        }
    }

    /// Returns the inner message without the code prefix.
    pub fn message(&self) -> String {
        match self {
            Self::TransientRemote(m)
            | Self::PermanentRemote(m)
            | Self::MalformedHeader(m)
            | Self::EmptyPayload(m)
            | Self::DeviceAccess(m)
            | Self::SessionClosed(m)
            | Self::Protocol(m)
            | Self::Audio(m)
            | Self::Image(m)
            | Self::Config(m)
            | Self::Channel(m) => m.clone(),
            Self::RetriesExhausted { last, .. } => last.message(),
            Self::Io(e) => e.to_string(),
        }
    }

    /// Whether this error is a transient remote failure worth retrying.
    ///
    /// Only [`AuraError::TransientRemote`] qualifies. Empty payloads are data
    /// errors and device failures need user action, so neither is retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientRemote(_))
    }

    /// Whether the failure came from the local capture/playback device rather
    /// than the network.
    pub fn is_device_error(&self) -> bool {
        matches!(self, Self::DeviceAccess(_))
    }

    /// Classify an HTTP status returned by the remote service.
    ///
    /// Rate limiting, request timeouts and the 5xx availability family are
    /// transient; everything else is permanent.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            408 | 429 | 500 | 502 | 503 | 504 => {
                Self::TransientRemote(format!("HTTP {status}: {message}"))
            }
            _ => Self::PermanentRemote(format!("HTTP {status}: {message}")),
        }
    }
}

impl From<reqwest::Error> for AuraError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            return Self::TransientRemote(format!("request failed: {e}"));
        }
        if let Some(status) = e.status() {
            return Self::from_status(status.as_u16(), e.to_string());
        }
        Self::PermanentRemote(format!("request failed: {e}"))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AuraError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match e {
            WsError::Http(response) => Self::from_status(
                response.status().as_u16(),
                "live channel handshake rejected",
            ),
            WsError::Io(io) => Self::TransientRemote(format!("live channel I/O: {io}")),
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                Self::SessionClosed("live channel already closed".into())
            }
            other => Self::PermanentRemote(format!("live channel: {other}")),
        }
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, AuraError>;
