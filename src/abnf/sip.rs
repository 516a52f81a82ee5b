//! RFC 3261 §25 message grammar.
//!
//! Only the rules needed to frame a message and pick apart the start line,
//! header lines and parameter lists are spelled out; header values are
//! otherwise carried as opaque `field-value` text.
use super::{
    alt, byte_if, core::*, literal, literal_nocase, one_or_more, optional, repeat, seq,
    star, Rule,
};

/// Default repetition cap for `generic-params` style lists.
pub const GENERIC_PARAMS_MAX: usize = 2048;

/// `Method = INVITEm / ACKm / ... / extension-method`, all of which are tokens.
pub fn method() -> impl Rule {
    token()
}

/// `scheme = ALPHA *( ALPHA / DIGIT / "+" / "-" / "." )`
pub fn scheme() -> impl Rule {
    seq((
        alpha(),
        star(byte_if(|b| {
            b.is_ascii_alphanumeric() || matches!(b, b'+' | b'-' | b'.')
        })),
    ))
}

/// `Request-URI = SIP-URI / SIPS-URI / absoluteURI`
///
/// Framing only needs to know where the URI ends, so everything up to
/// the next whitespace after `scheme ":"` is accepted.
pub fn request_uri() -> impl Rule {
    seq((scheme(), literal(b":"), one_or_more(byte_if(is_text_char))))
}

/// `SIP-Version = "SIP" "/" 1*DIGIT "." 1*DIGIT`
pub fn sip_version() -> impl Rule {
    seq((
        literal_nocase(b"SIP"),
        literal(b"/"),
        one_or_more(digit()),
        literal(b"."),
        one_or_more(digit()),
    ))
}

/// `Request-Line = Method SP Request-URI SP SIP-Version CRLF`
pub fn request_line() -> impl Rule {
    seq((method(), sp(), request_uri(), sp(), sip_version(), crlf()))
}

/// `Status-Code = 3DIGIT`
pub fn status_code() -> impl Rule {
    repeat(digit(), 3, 3)
}

/// `Reason-Phrase = *(reserved / unreserved / escaped / UTF8-NONASCII / UTF8-CONT / SP / HTAB)`
pub fn reason_phrase() -> impl Rule {
    star(byte_if(|b| is_text_char(b) || is_wsp(b)))
}

/// `Status-Line = SIP-Version SP Status-Code SP Reason-Phrase CRLF`
pub fn status_line() -> impl Rule {
    seq((sip_version(), sp(), status_code(), sp(), reason_phrase(), crlf()))
}

/// `start-line = Request-Line / Status-Line`
pub fn start_line() -> impl Rule {
    alt((request_line(), status_line()))
}

pub fn field_name() -> impl Rule {
    token()
}

/// `field-value = *( TEXT-UTF8char / UTF8-CONT / LWS )`
pub fn field_value() -> impl Rule {
    star(alt((byte_if(|b| is_text_char(b) || is_wsp(b)), lws())))
}

/// `message-header = field-name HCOLON field-value CRLF`
///
/// Tokens recorded by [`Rule::parse_tokens`]: name, colon, value, CRLF.
pub fn message_header() -> impl Rule {
    seq((field_name(), hcolon(), field_value(), crlf()))
}

/// `host = hostname / IPv4address / IPv6reference`
pub fn host() -> impl Rule {
    alt((ipv6_reference(), token()))
}

/// `gen-value = token / host / quoted-string`
pub fn gen_value() -> impl Rule {
    alt((token(), host(), quoted_string()))
}

/// `generic-param = token [ EQUAL gen-value ]`
pub fn generic_param() -> impl Rule {
    seq((token(), optional(seq((equal(), gen_value())))))
}

/// `generic-params = *( SEMI generic-param )`, at most `max` of them.
///
/// Tokens recorded per parameter: the separator and the `generic-param`.
pub fn generic_params(max: usize) -> impl Rule {
    repeat(seq((semi(), generic_param())), 0, max)
}

/// `user-param = "user=" ( "phone" / "ip" / other-user )`
pub fn user_param() -> impl Rule {
    seq((
        literal_nocase(b"user="),
        alt((literal(b"phone"), literal(b"ip"), token())),
    ))
}

/// `display-name = *(token LWS) / quoted-string`
pub fn display_name() -> impl Rule {
    alt((quoted_string(), seq((token(), star(seq((lws(), token())))))))
}

/// `addr-spec` as it appears outside angle brackets; parameters after
/// `;` belong to the enclosing header, not to the URI.
pub fn addr_spec() -> impl Rule {
    seq((
        scheme(),
        literal(b":"),
        one_or_more(byte_if(|b| {
            is_text_char(b) && !matches!(b, b';' | b',' | b'>' | b'<' | b'?' | b'"')
        })),
    ))
}

/// `name-addr = [ display-name ] LAQUOT addr-spec RAQUOT`
pub fn name_addr() -> impl Rule {
    let bracketed_uri = seq((
        scheme(),
        literal(b":"),
        one_or_more(byte_if(|b| is_text_char(b) && b != b'>')),
    ));
    seq((optional(display_name()), laquot(), bracketed_uri, raquot()))
}

/// `contact-param = (name-addr / addr-spec) *(SEMI contact-params)`
pub fn contact_param(max_params: usize) -> impl Rule {
    seq((alt((name_addr(), addr_spec())), generic_params(max_params)))
}

/// The blank line closing the header section.
pub fn header_terminator() -> impl Rule {
    crlf()
}
