// SIP over TCP and TLS: ABNF framing and streamed connections

pub mod abnf;
pub mod config;
pub mod error;
pub mod message;
pub mod transport;

pub use config::TransportConfig;
pub use error::Error;
pub use message::SipMessage;
pub type Result<T> = std::result::Result<T, Error>;
