//! Full-duplex voice sessions over the live service.

pub mod protocol;
pub mod session;
pub mod transcript;
pub mod transport;

pub use protocol::{FunctionCall, SessionSetup};
pub use session::{LiveEvent, LiveOptions, LiveSession, LiveSessionState};
pub use transcript::Speaker;
pub use transport::{LiveConnector, LiveTransport, WebSocketConnector};
