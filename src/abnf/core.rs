//! Core terminals (RFC 5234 appendix B) and the RFC 3261 §25.1 basic rules.
use super::{alt, byte_if, literal, one_or_more, optional, repeat, seq, star, Literal, Rule};

pub const CR: u8 = b'\r';
pub const LF: u8 = b'\n';
pub const SP: u8 = b' ';
pub const HTAB: u8 = b'\t';

pub fn is_wsp(b: u8) -> bool {
    b == SP || b == HTAB
}

/// RFC 3261 `token` characters.
pub fn is_token_char(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'-' | b'.' | b'!' | b'%' | b'*' | b'_' | b'+' | b'`' | b'\'' | b'~'
        )
}

/// Visible characters plus anything outside ASCII (UTF8-NONASCII).
pub fn is_text_char(b: u8) -> bool {
    (0x21..=0x7e).contains(&b) || b >= 0x80
}

pub fn alpha() -> impl Rule {
    byte_if(|b| b.is_ascii_alphabetic())
}

pub fn digit() -> impl Rule {
    byte_if(|b| b.is_ascii_digit())
}

pub fn sp() -> Literal {
    literal(b" ")
}

pub fn crlf() -> Literal {
    literal(b"\r\n")
}

pub fn wsp() -> impl Rule {
    byte_if(is_wsp)
}

/// `LWS = [*WSP CRLF] 1*WSP`
pub fn lws() -> impl Rule {
    seq((optional(seq((star(wsp()), crlf()))), one_or_more(wsp())))
}

/// `SWS = [LWS]`
pub fn sws() -> impl Rule {
    optional(lws())
}

/// `HCOLON = *( SP / HTAB ) ":" SWS`
pub fn hcolon() -> impl Rule {
    seq((star(wsp()), literal(b":"), sws()))
}

/// `SEMI = SWS ";" SWS`
pub fn semi() -> impl Rule {
    seq((sws(), literal(b";"), sws()))
}

/// `EQUAL = SWS "=" SWS`
pub fn equal() -> impl Rule {
    seq((sws(), literal(b"="), sws()))
}

/// `LAQUOT = SWS "<"`
pub fn laquot() -> impl Rule {
    seq((sws(), literal(b"<")))
}

/// `RAQUOT = ">" SWS`
pub fn raquot() -> impl Rule {
    seq((literal(b">"), sws()))
}

pub fn token() -> impl Rule {
    one_or_more(byte_if(is_token_char))
}

/// `quoted-string = SWS DQUOTE *(qdtext / quoted-pair ) DQUOTE`
pub fn quoted_string() -> impl Rule {
    let qdtext = alt((
        lws(),
        byte_if(|b| {
            b == 0x21 || (0x23..=0x5b).contains(&b) || (0x5d..=0x7e).contains(&b) || b >= 0x80
        }),
    ));
    let quoted_pair = seq((
        literal(b"\\"),
        byte_if(|b| b <= 0x7f && b != CR && b != LF),
    ));
    seq((
        sws(),
        literal(b"\""),
        star(alt((qdtext, quoted_pair))),
        literal(b"\""),
    ))
}

/// `IPv6reference = "[" IPv6address "]"`, loosely: hex digits, colons and
/// an optional dotted IPv4 tail.
pub fn ipv6_reference() -> impl Rule {
    seq((
        literal(b"["),
        repeat(byte_if(|b| b.is_ascii_hexdigit() || b == b':' || b == b'.'), 2, 45),
        literal(b"]"),
    ))
}
