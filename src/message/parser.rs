use super::{header_name_eq, Header, SipMessage, StartLine};
use crate::{
    abnf::{
        core::{is_text_char, is_wsp, CR, LF},
        sip::{header_terminator, message_header, start_line},
        Rule,
    },
    config::ParserLimits,
    transport::connection::KEEPALIVE_REQUEST,
};
use bytes::BytesMut;

/// Result of one [`PendingMessage::feed`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// The message is fully framed; the returned tail marks the first byte
    /// of the fed span that belongs to whatever comes next.
    Complete,
    /// The start line or a header line does not follow the grammar.
    Invalid,
    /// Consistent so far, more bytes are needed.
    Indeterminate,
}

/// A SIP message under construction.
///
/// Bytes are accumulated across [`feed`](Self::feed) calls; each call
/// advances the grammar as far as the buffered bytes allow. The header
/// section is checked line by line as lines complete, and once the blank
/// line is reached exactly `Content-Length` body bytes (0 when absent)
/// finish the message. Every buffered byte is scanned once, however the
/// message is split across calls.
///
/// CR and LF bytes ahead of the start line are not part of any message.
/// They are kept aside as the idle buffer; an idle buffer of exactly
/// `"\r\n\r\n"` is a keep-alive probe (RFC 5626 §3.5.1), reported as
/// [`ParseOutcome::Indeterminate`] with [`is_keepalive_probe`](Self::is_keepalive_probe)
/// set.
#[derive(Debug)]
pub struct PendingMessage {
    limits: ParserLimits,
    idle: Vec<u8>,
    buffer: BytesMut,
    cursor: usize,
    // bytes before this offset have been searched for line ends
    scan: usize,
    start_line: Option<StartLine>,
    headers: Vec<Header>,
    body_offset: Option<usize>,
    message_end: Option<usize>,
    complete: bool,
    invalid: bool,
}

impl Default for PendingMessage {
    fn default() -> Self {
        Self::new(ParserLimits::default())
    }
}

impl PendingMessage {
    pub fn new(limits: ParserLimits) -> Self {
        Self {
            limits,
            idle: Vec::with_capacity(KEEPALIVE_REQUEST.len()),
            buffer: BytesMut::new(),
            cursor: 0,
            scan: 0,
            start_line: None,
            headers: Vec::new(),
            body_offset: None,
            message_end: None,
            complete: false,
            invalid: false,
        }
    }

    /// Feeds newly arrived bytes, returning the outcome and the offset in
    /// `data` just past the last byte this message consumed.
    pub fn feed(&mut self, data: &[u8]) -> (ParseOutcome, usize) {
        if self.invalid {
            return (ParseOutcome::Invalid, data.len());
        }
        if self.complete {
            return (ParseOutcome::Complete, 0);
        }

        let mut offset = 0;
        if self.buffer.is_empty() {
            while let Some(&b) = data.get(offset) {
                if b != CR && b != LF {
                    break;
                }
                offset += 1;
                if self.idle.len() == KEEPALIVE_REQUEST.len() {
                    self.idle.remove(0);
                }
                self.idle.push(b);
                if self.idle == KEEPALIVE_REQUEST {
                    return (ParseOutcome::Indeterminate, offset);
                }
            }
            if offset == data.len() {
                return (ParseOutcome::Indeterminate, offset);
            }
            self.idle.clear();
        }

        let previous = self.buffer.len();
        self.buffer.extend_from_slice(&data[offset..]);

        match self.advance() {
            ParseOutcome::Complete => match self.message_end {
                Some(end) => {
                    self.buffer.truncate(end);
                    self.complete = true;
                    (
                        ParseOutcome::Complete,
                        offset + end.saturating_sub(previous),
                    )
                }
                None => {
                    self.invalid = true;
                    (ParseOutcome::Invalid, data.len())
                }
            },
            ParseOutcome::Invalid => {
                self.invalid = true;
                (ParseOutcome::Invalid, data.len())
            }
            ParseOutcome::Indeterminate => {
                if self.buffer.len() > self.limits.max_message_size {
                    self.invalid = true;
                    return (ParseOutcome::Invalid, data.len());
                }
                (ParseOutcome::Indeterminate, data.len())
            }
        }
    }

    /// CR/LF bytes received while no start line has begun.
    pub fn idle_buffer(&self) -> &[u8] {
        &self.idle
    }

    pub fn is_keepalive_probe(&self) -> bool {
        self.buffer.is_empty() && self.idle == KEEPALIVE_REQUEST
    }

    /// True once a start line byte has been buffered.
    pub fn has_started(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// The framed message, once [`feed`](Self::feed) has reported
    /// [`ParseOutcome::Complete`].
    pub fn into_message(self) -> Option<SipMessage> {
        if !self.complete {
            return None;
        }
        Some(SipMessage {
            start_line: self.start_line?,
            headers: self.headers,
            body_offset: self.body_offset?,
            data: self.buffer.freeze(),
            max_generic_params: self.limits.max_generic_params,
        })
    }

    fn advance(&mut self) -> ParseOutcome {
        if self.start_line.is_none() {
            // the CR of a CRLF may have been the last byte of the previous call
            let from = self.scan.saturating_sub(1);
            let Some(eol) = find_crlf(&self.buffer[from..]).map(|pos| from + pos) else {
                let outcome = partial_line(&self.buffer[self.scan..]);
                self.scan = self.buffer.len();
                return outcome;
            };
            let line = &self.buffer[..eol + 2];
            let mut tokens = Vec::new();
            if start_line().parse_tokens(line, &mut tokens) != Some(line.len()) {
                return ParseOutcome::Invalid;
            }
            match build_start_line(&tokens) {
                Some(start) => self.start_line = Some(start),
                None => return ParseOutcome::Invalid,
            }
            self.cursor = eol + 2;
            self.scan = self.cursor;
        }

        while self.body_offset.is_none() {
            let rest = &self.buffer[self.cursor..];
            if let Some(len) = header_terminator().parse(rest) {
                let body_offset = self.cursor + len;
                let end = match self.declared_content_length() {
                    Some(length) if length <= self.limits.max_message_size => {
                        body_offset.checked_add(length)
                    }
                    _ => None,
                };
                let Some(end) = end.filter(|end| *end <= self.limits.max_message_size) else {
                    return ParseOutcome::Invalid;
                };
                self.body_offset = Some(body_offset);
                self.message_end = Some(end);
                break;
            }
            if self.headers.len() >= self.limits.max_header_lines {
                return ParseOutcome::Invalid;
            }

            let Some(line_end) = self.logical_line_end() else {
                let from = self.scan.max(self.cursor);
                let outcome = partial_line(&self.buffer[from..]);
                // keep the last CRLF in view, the byte after it decides folding
                self.scan = self.buffer.len().saturating_sub(2).max(self.cursor);
                return outcome;
            };
            let line = &self.buffer[self.cursor..line_end];
            let mut tokens = Vec::new();
            if message_header().parse_tokens(line, &mut tokens) != Some(line.len()) {
                return ParseOutcome::Invalid;
            }
            self.headers.push(Header {
                name: String::from_utf8_lossy(tokens[0]).into_owned(),
                value: String::from_utf8_lossy(tokens[2]).trim().to_string(),
            });
            self.cursor = line_end;
            self.scan = line_end;
        }

        match self.message_end {
            Some(end) if self.buffer.len() >= end => ParseOutcome::Complete,
            _ => ParseOutcome::Indeterminate,
        }
    }

    /// End of the header line starting at the cursor: its CRLF must be
    /// followed by something other than folding whitespace.
    fn logical_line_end(&self) -> Option<usize> {
        let from = self.scan.max(self.cursor);
        self.buffer[from..]
            .windows(3)
            .position(|w| w[0] == CR && w[1] == LF && !is_wsp(w[2]))
            .map(|pos| from + pos + 2)
    }

    fn declared_content_length(&self) -> Option<usize> {
        match self
            .headers
            .iter()
            .find(|h| header_name_eq(&h.name, "Content-Length"))
        {
            Some(header) => header.value.parse().ok(),
            None => Some(0),
        }
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

/// Outcome for bytes of a line that has not been terminated yet: keep
/// waiting unless they hold a byte no SIP line may contain.
fn partial_line(data: &[u8]) -> ParseOutcome {
    let illegal = data
        .iter()
        .any(|&b| !(is_text_char(b) || is_wsp(b) || b == CR || b == LF));
    if illegal {
        ParseOutcome::Invalid
    } else {
        ParseOutcome::Indeterminate
    }
}

fn build_start_line(tokens: &[&[u8]]) -> Option<StartLine> {
    let text = |span: &[u8]| String::from_utf8_lossy(span).into_owned();
    let (first, second, third) = (tokens.first()?, tokens.get(2)?, tokens.get(4)?);
    // a Method is a token and never contains '/', a SIP-Version always does
    if first.contains(&b'/') {
        let status_code = std::str::from_utf8(second).ok()?.parse().ok()?;
        Some(StartLine::Response {
            version: text(first),
            status_code,
            reason: text(third),
        })
    } else {
        Some(StartLine::Request {
            method: text(first),
            uri: text(second),
            version: text(third),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTER: &[u8] = b"REGISTER sip:example.com SIP/2.0\r\n\
        Via: SIP/2.0/TCP 127.0.0.1:5060;branch=z9hG4bK-test\r\n\
        From: <sip:alice@example.com>;tag=test\r\n\
        To: <sip:alice@example.com>\r\n\
        Call-ID: test-call-id\r\n\
        CSeq: 1 REGISTER\r\n\
        Max-Forwards: 70\r\n\
        Content-Length: 0\r\n\r\n";

    const MESSAGE: &[u8] = b"MESSAGE sip:bob@example.com SIP/2.0\r\n\
        Via: SIP/2.0/TCP 127.0.0.1:5060;branch=z9hG4bK-msg\r\n\
        Call-ID: msg-call-id\r\n\
        CSeq: 2 MESSAGE\r\n\
        Content-Type: text/plain\r\n\
        Content-Length: 12\r\n\r\n\
        Hello\r\n\r\nBob";

    fn pending() -> PendingMessage {
        PendingMessage::new(ParserLimits::default())
    }

    #[test]
    fn test_single_message() {
        let mut parser = pending();
        assert_eq!(parser.feed(REGISTER), (ParseOutcome::Complete, REGISTER.len()));
        let msg = parser.into_message().expect("message");
        assert_eq!(msg.method(), Some("REGISTER"));
        assert_eq!(msg.headers().len(), 7);
        assert_eq!(&msg.data()[..], REGISTER);
    }

    #[test]
    fn test_every_two_way_split() {
        for split in 1..MESSAGE.len() {
            let mut parser = pending();
            let (first, second) = MESSAGE.split_at(split);
            assert_eq!(
                parser.feed(first),
                (ParseOutcome::Indeterminate, first.len()),
                "split at {}",
                split
            );
            assert_eq!(
                parser.feed(second),
                (ParseOutcome::Complete, second.len()),
                "split at {}",
                split
            );
            let msg = parser.into_message().expect("message");
            assert_eq!(&msg.data()[..], MESSAGE);
            assert_eq!(msg.body(), b"Hello\r\n\r\nBob");
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut parser = pending();
        let (last, head) = MESSAGE.split_last().expect("non-empty");
        for b in head {
            assert_eq!(
                parser.feed(std::slice::from_ref(b)).0,
                ParseOutcome::Indeterminate
            );
        }
        assert_eq!(
            parser.feed(std::slice::from_ref(last)),
            (ParseOutcome::Complete, 1)
        );
    }

    #[test]
    fn test_compound_frame_tail() {
        let mut data = REGISTER.to_vec();
        data.extend_from_slice(MESSAGE);

        let mut parser = pending();
        let (outcome, tail) = parser.feed(&data);
        assert_eq!(outcome, ParseOutcome::Complete);
        assert_eq!(tail, REGISTER.len());
        assert_eq!(parser.into_message().expect("first").method(), Some("REGISTER"));

        let mut parser = pending();
        assert_eq!(
            parser.feed(&data[tail..]),
            (ParseOutcome::Complete, MESSAGE.len())
        );
        assert_eq!(parser.into_message().expect("second").method(), Some("MESSAGE"));
    }

    #[test]
    fn test_short_body_then_rest() {
        let split = MESSAGE.len() - 5;
        let mut parser = pending();
        assert_eq!(
            parser.feed(&MESSAGE[..split]),
            (ParseOutcome::Indeterminate, split)
        );
        assert_eq!(parser.feed(&MESSAGE[split..]), (ParseOutcome::Complete, 5));
    }

    #[test]
    fn test_keepalive_probe() {
        let mut parser = pending();
        assert_eq!(parser.feed(b"\r\n\r\n"), (ParseOutcome::Indeterminate, 4));
        assert!(parser.is_keepalive_probe());
        assert!(!parser.has_started());
        assert!(parser.into_message().is_none());
    }

    #[test]
    fn test_keepalive_probe_split_and_followed() {
        let mut parser = pending();
        assert_eq!(parser.feed(b"\r\n"), (ParseOutcome::Indeterminate, 2));
        assert!(!parser.is_keepalive_probe());
        assert_eq!(parser.idle_buffer(), b"\r\n");

        let mut data = b"\r\n".to_vec();
        data.extend_from_slice(REGISTER);
        assert_eq!(parser.feed(&data), (ParseOutcome::Indeterminate, 2));
        assert!(parser.is_keepalive_probe());

        let mut parser = pending();
        assert_eq!(
            parser.feed(&data[2..]),
            (ParseOutcome::Complete, REGISTER.len())
        );
    }

    #[test]
    fn test_leading_crlf_is_skipped() {
        let mut data = b"\r\n".to_vec();
        data.extend_from_slice(REGISTER);
        let mut parser = pending();
        assert_eq!(parser.feed(&data), (ParseOutcome::Complete, data.len()));
        let msg = parser.into_message().expect("message");
        assert_eq!(&msg.data()[..], REGISTER);
    }

    #[test]
    fn test_invalid_start_line() {
        let mut parser = pending();
        assert_eq!(
            parser.feed(b"INVITE SIP/2.0\r\nContent-Length: 0\r\n\r\n").0,
            ParseOutcome::Invalid
        );
        // stays invalid
        assert_eq!(parser.feed(REGISTER).0, ParseOutcome::Invalid);

        let mut parser = pending();
        assert_eq!(parser.feed(b"garbage\r\n").0, ParseOutcome::Invalid);
    }

    #[test]
    fn test_invalid_detected_before_line_end() {
        let mut parser = pending();
        assert_eq!(parser.feed(b"INV\x00ITE").0, ParseOutcome::Invalid);
    }

    #[test]
    fn test_invalid_header_line() {
        let mut parser = pending();
        let data = b"OPTIONS sip:bob@example.com SIP/2.0\r\nNo colon here\r\nTo: x\r\n\r\n";
        assert_eq!(parser.feed(data).0, ParseOutcome::Invalid);
    }

    #[test]
    fn test_invalid_content_length() {
        let mut parser = pending();
        let data = b"OPTIONS sip:bob@example.com SIP/2.0\r\nContent-Length: many\r\n\r\n";
        assert_eq!(parser.feed(data).0, ParseOutcome::Invalid);
    }

    #[test]
    fn test_oversized_content_length() {
        for length in ["18446744073709551615", "18446744073709551606", "65536"] {
            let data = format!(
                "OPTIONS sip:bob@example.com SIP/2.0\r\nContent-Length: {}\r\n\r\n",
                length
            );
            let mut parser = pending();
            assert_eq!(
                parser.feed(data.as_bytes()),
                (ParseOutcome::Invalid, data.len()),
                "Content-Length: {}",
                length
            );
            assert!(parser.into_message().is_none());
        }

        // the body must fit in the size limit together with the headers
        let limits = ParserLimits {
            max_message_size: 80,
            ..ParserLimits::default()
        };
        let mut parser = PendingMessage::new(limits);
        let data = b"SIP/2.0 200 OK\r\nContent-Length: 60\r\n\r\n";
        assert_eq!(parser.feed(data).0, ParseOutcome::Invalid);
    }

    #[test]
    fn test_long_header_trickled() {
        let value = "a".repeat(24 * 1024);
        let data = format!(
            "MESSAGE sip:bob@example.com SIP/2.0\r\nSubject: {}\r\n {}\r\nContent-Length: 0\r\n\r\n",
            value, value
        );
        let mut parser = pending();
        let (last, head) = data.as_bytes().split_last().expect("non-empty");
        for b in head {
            assert_eq!(
                parser.feed(std::slice::from_ref(b)).0,
                ParseOutcome::Indeterminate
            );
        }
        assert_eq!(
            parser.feed(std::slice::from_ref(last)),
            (ParseOutcome::Complete, 1)
        );
        let msg = parser.into_message().expect("message");
        assert_eq!(msg.header("Subject").map(str::len), Some(2 * value.len() + 3));
        assert_eq!(msg.content_length(), 0);
    }

    #[test]
    fn test_compact_content_length() {
        let mut parser = pending();
        let data = b"SIP/2.0 200 OK\r\nl: 2\r\n\r\nokEXTRA";
        assert_eq!(parser.feed(data), (ParseOutcome::Complete, data.len() - 5));
        assert_eq!(parser.into_message().expect("message").body(), b"ok");
    }

    #[test]
    fn test_missing_content_length_means_empty_body() {
        let mut parser = pending();
        let data = b"OPTIONS sip:bob@example.com SIP/2.0\r\nCSeq: 1 OPTIONS\r\n\r\nOPTIONS";
        assert_eq!(parser.feed(data), (ParseOutcome::Complete, data.len() - 7));
    }

    #[test]
    fn test_no_headers() {
        let mut parser = pending();
        let data = b"SIP/2.0 100 Trying\r\n\r\n";
        assert_eq!(parser.feed(data), (ParseOutcome::Complete, data.len()));
        assert!(parser.into_message().expect("message").headers().is_empty());
    }

    #[test]
    fn test_folded_header_split_at_line_end() {
        let data = b"OPTIONS sip:bob@example.com SIP/2.0\r\nSubject: lunch\r\n tomorrow\r\n\r\n";
        let split = data
            .windows(2)
            .position(|w| w == b"h\r")
            .expect("fold point")
            + 3;
        let mut parser = pending();
        assert_eq!(parser.feed(&data[..split]).0, ParseOutcome::Indeterminate);
        assert_eq!(
            parser.feed(&data[split..]),
            (ParseOutcome::Complete, data.len() - split)
        );
        let msg = parser.into_message().expect("message");
        assert_eq!(msg.header("subject"), Some("lunch\r\n tomorrow"));
    }

    #[test]
    fn test_message_size_limit() {
        let limits = ParserLimits {
            max_message_size: 64,
            ..ParserLimits::default()
        };
        let mut parser = PendingMessage::new(limits);
        assert_eq!(parser.feed(REGISTER).0, ParseOutcome::Invalid);

        let mut parser = PendingMessage::new(limits);
        let data = b"SIP/2.0 200 OK\r\nContent-Length: 100\r\n\r\n";
        assert_eq!(parser.feed(data).0, ParseOutcome::Invalid);
    }

    #[test]
    fn test_header_line_limit() {
        let limits = ParserLimits {
            max_header_lines: 3,
            ..ParserLimits::default()
        };
        let mut parser = PendingMessage::new(limits);
        assert_eq!(parser.feed(REGISTER).0, ParseOutcome::Invalid);
    }
}
