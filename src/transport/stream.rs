use crate::{
    config::{ParserLimits, TransportConfig},
    message::{ParseOutcome, PendingMessage, SipMessage},
    Result,
};
use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

/// What one read produced, in wire order.
#[derive(Debug, Clone)]
pub enum FrameEvent {
    Message(SipMessage),
    /// A `"\r\n\r\n"` probe that must be answered with `"\r\n"`.
    KeepaliveRequest,
    /// A message was rejected; its bytes and the rest of the read are gone.
    Invalid,
}

impl std::fmt::Display for FrameEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameEvent::Message(msg) => write!(f, "{}", msg.start_line()),
            FrameEvent::KeepaliveRequest => write!(f, "Keepalive Request"),
            FrameEvent::Invalid => write!(f, "Invalid Message"),
        }
    }
}

/// Splits the bytes of successive reads into messages.
///
/// A partially received message is carried over to the next read. When a
/// read completes a message and bytes remain, the remainder is parsed as a
/// new message, at most `max_compound_frames` more times per read.
pub struct SipFramer {
    limits: ParserLimits,
    max_compound_frames: usize,
    pending: Option<PendingMessage>,
}

impl SipFramer {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            limits: config.parser_limits(),
            max_compound_frames: config.max_compound_frames,
            pending: None,
        }
    }

    /// True while a partial message is buffered.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn decode_read(&mut self, data: &[u8]) -> Vec<FrameEvent> {
        let mut events = Vec::new();
        let mut offset = 0;
        let mut reparsed = 0;
        let limits = self.limits;

        loop {
            let pending = self
                .pending
                .get_or_insert_with(|| PendingMessage::new(limits));
            let (outcome, tail) = pending.feed(&data[offset..]);
            match outcome {
                ParseOutcome::Complete => {
                    if let Some(msg) = self.pending.take().and_then(PendingMessage::into_message) {
                        events.push(FrameEvent::Message(msg));
                    }
                }
                ParseOutcome::Invalid => {
                    self.pending = None;
                    events.push(FrameEvent::Invalid);
                    return events;
                }
                ParseOutcome::Indeterminate if pending.is_keepalive_probe() => {
                    self.pending = None;
                    events.push(FrameEvent::KeepaliveRequest);
                }
                ParseOutcome::Indeterminate => return events,
            }

            offset += tail;
            if offset >= data.len() {
                return events;
            }
            if reparsed == self.max_compound_frames {
                debug!(
                    frames = events.len(),
                    dropped = data.len() - offset,
                    "compound frame limit reached"
                );
                self.pending = None;
                return events;
            }
            reparsed += 1;
            debug!(reparsed, remaining = data.len() - offset, "compound frame");
        }
    }
}

/// `tokio_util` codec over the same incremental parser, for callers that
/// drive a socket through `FramedRead`/`FramedWrite`.
pub struct SipCodec {
    limits: ParserLimits,
    pending: Option<PendingMessage>,
}

impl SipCodec {
    pub fn new() -> Self {
        Self::with_limits(ParserLimits::default())
    }

    pub fn with_limits(limits: ParserLimits) -> Self {
        Self {
            limits,
            pending: None,
        }
    }
}

impl Default for SipCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for SipCodec {
    type Item = FrameEvent;
    type Error = crate::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.is_empty() {
            return Ok(None);
        }
        let limits = self.limits;
        let pending = self
            .pending
            .get_or_insert_with(|| PendingMessage::new(limits));
        let (outcome, tail) = pending.feed(&src[..]);
        src.advance(tail);

        match outcome {
            ParseOutcome::Complete => Ok(self
                .pending
                .take()
                .and_then(PendingMessage::into_message)
                .map(FrameEvent::Message)),
            ParseOutcome::Invalid => {
                self.pending = None;
                Err(crate::Error::SipMessageError(
                    "malformed SIP message".to_string(),
                ))
            }
            ParseOutcome::Indeterminate if pending.is_keepalive_probe() => {
                self.pending = None;
                Ok(Some(FrameEvent::KeepaliveRequest))
            }
            ParseOutcome::Indeterminate => Ok(None),
        }
    }
}

impl Encoder<SipMessage> for SipCodec {
    type Error = crate::Error;

    fn encode(&mut self, item: SipMessage, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(item.data());
        Ok(())
    }
}

impl Encoder<rsip::SipMessage> for SipCodec {
    type Error = crate::Error;

    fn encode(&mut self, item: rsip::SipMessage, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(item.to_string().as_bytes());
        Ok(())
    }
}
