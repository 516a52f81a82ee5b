use crate::transport::SipAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SIP message error: {0}")]
    SipMessageError(String),

    #[error("Transport layer error: {0} ({1})")]
    TransportLayerError(String, SipAddr),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Address parse error: {0}")]
    AddrParseError(#[from] std::net::AddrParseError),

    #[error("{0}")]
    Error(String),
}

impl From<rsip::Error> for Error {
    fn from(e: rsip::Error) -> Self {
        Error::SipMessageError(e.to_string())
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::TlsError(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::Error(e.to_string())
    }
}
