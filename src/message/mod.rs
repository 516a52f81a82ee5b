//! Framed SIP messages
//!
//! A [`SipMessage`] is what the incremental [`PendingMessage`] parser
//! yields once a message has been completely framed: the start line and
//! header lines picked apart by the grammar, plus the exact bytes seen on
//! the wire. Header values stay textual; upper layers that want typed
//! headers convert into [`rsip::SipMessage`].
use crate::abnf::{sip::generic_params, Rule};
use bytes::Bytes;
use std::fmt;

pub mod parser;
pub use parser::{ParseOutcome, PendingMessage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request {
        method: String,
        uri: String,
        version: String,
    },
    Response {
        version: String,
        status_code: u16,
        reason: String,
    },
}

impl fmt::Display for StartLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartLine::Request {
                method,
                uri,
                version,
            } => write!(f, "{} {} {}", method, uri, version),
            StartLine::Response {
                version,
                status_code,
                reason,
            } => write!(f, "{} {} {}", version, status_code, reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// RFC 3261 §7.3.3 compact header names.
fn compact_form(name: &str) -> Option<&'static str> {
    let full = match name.as_bytes() {
        [b] => match b.to_ascii_lowercase() {
            b'i' => "Call-ID",
            b'm' => "Contact",
            b'e' => "Content-Encoding",
            b'l' => "Content-Length",
            b'c' => "Content-Type",
            b'f' => "From",
            b's' => "Subject",
            b'k' => "Supported",
            b't' => "To",
            b'v' => "Via",
            _ => return None,
        },
        _ => return None,
    };
    Some(full)
}

/// Case-insensitive header name comparison honoring compact forms.
pub fn header_name_eq(a: &str, b: &str) -> bool {
    let a = compact_form(a).unwrap_or(a);
    let b = compact_form(b).unwrap_or(b);
    a.eq_ignore_ascii_case(b)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipMessage {
    pub(crate) start_line: StartLine,
    pub(crate) headers: Vec<Header>,
    pub(crate) body_offset: usize,
    pub(crate) data: Bytes,
    pub(crate) max_generic_params: usize,
}

impl SipMessage {
    pub fn start_line(&self) -> &StartLine {
        &self.start_line
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start_line, StartLine::Request { .. })
    }

    pub fn method(&self) -> Option<&str> {
        match &self.start_line {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Response { .. } => None,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match &self.start_line {
            StartLine::Response { status_code, .. } => Some(*status_code),
            StartLine::Request { .. } => None,
        }
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    /// First value of the named header.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| header_name_eq(&h.name, name))
            .map(|h| h.value.as_str())
    }

    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |h| header_name_eq(&h.name, name))
            .map(|h| h.value.as_str())
    }

    pub fn content_length(&self) -> usize {
        self.data.len() - self.body_offset
    }

    /// Value of a `;name=value` parameter trailing the first value of a
    /// header, e.g. the `branch` of the topmost `Via`. A parameter present
    /// without a value yields `Some("")`.
    pub fn header_param(&self, header: &str, param: &str) -> Option<&str> {
        let value = self.header(header)?;
        let start = params_start(value.as_bytes())?;
        let mut tokens = Vec::new();
        generic_params(self.max_generic_params)
            .parse_tokens(&value.as_bytes()[start..], &mut tokens)?;
        tokens
            .iter()
            .skip(1)
            .step_by(2)
            .filter_map(|span| std::str::from_utf8(span).ok())
            .map(|pair| match pair.split_once('=') {
                Some((name, value)) => (name.trim(), value.trim()),
                None => (pair.trim(), ""),
            })
            .find(|(name, _)| name.eq_ignore_ascii_case(param))
            .map(|(_, value)| value)
    }

    pub fn body(&self) -> &[u8] {
        &self.data[self.body_offset..]
    }

    /// The exact bytes this message was framed from.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Offset of the first `;` outside angle brackets and quotes.
fn params_start(value: &[u8]) -> Option<usize> {
    let mut in_quotes = false;
    let mut in_angle = false;
    let mut escaped = false;
    for (i, &b) in value.iter().enumerate() {
        match b {
            _ if escaped => escaped = false,
            b'\\' if in_quotes => escaped = true,
            b'"' => in_quotes = !in_quotes,
            b'<' if !in_quotes => in_angle = true,
            b'>' if !in_quotes => in_angle = false,
            b';' if !in_quotes && !in_angle => return Some(i),
            _ => {}
        }
    }
    None
}

impl fmt::Display for SipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.data))
    }
}

impl TryFrom<&SipMessage> for rsip::SipMessage {
    type Error = crate::Error;

    fn try_from(msg: &SipMessage) -> crate::Result<Self> {
        rsip::SipMessage::try_from(&msg.data[..]).map_err(Into::into)
    }
}

impl TryFrom<SipMessage> for rsip::SipMessage {
    type Error = crate::Error;

    fn try_from(msg: SipMessage) -> crate::Result<Self> {
        rsip::SipMessage::try_from(&msg)
    }
}
