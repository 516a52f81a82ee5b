pub mod connection;
pub mod listener;
pub mod manager;
pub mod sip_addr;
pub mod stream;
pub mod tls;
pub use connection::{ConnectionState, SipStream, StreamedConnection};
pub use listener::StreamListener;
pub use manager::{
    ConnectionContext, ConnectionManager, ConnectionTable, MessageDispatch, TransportEvent,
    TransportReceiver, TransportSender,
};
pub use sip_addr::{ConnectionIdentity, SipAddr};
pub use tls::TlsConfig;
#[cfg(test)]
pub mod tests;
