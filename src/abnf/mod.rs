//! ABNF rule engine
//!
//! Composable parsing primitives used to describe the RFC 3261 grammar.
//! A [`Rule`] inspects a prefix of its input and either reports how many
//! bytes it matched or `None`. A mismatch is an ordinary outcome, not an
//! error, and never leaves the caller's cursor half advanced: the caller
//! owns the cursor and only moves it by the returned length.
//!
//! Rules are built from a handful of combinators:
//!
//! * [`literal`] / [`literal_nocase`] - an exact byte sequence
//! * [`byte_if`] - a single byte accepted by a predicate
//! * [`seq`] - all elements in order (tuples of up to 8 rules)
//! * [`alt`] - the first element that matches (tuples of up to 8 rules)
//! * [`repeat`] / [`star`] / [`one_or_more`] / [`optional`] - bounded loops
//!
//! ```rust
//! use rsipstream::abnf::{alt, literal, literal_nocase, seq, Rule};
//!
//! let rule = seq((literal_nocase(b"user="), alt((literal(b"phone"), literal(b"ip")))));
//! assert_eq!(rule.parse(b"USER=phone;x"), Some(10));
//! assert_eq!(rule.parse(b"user=fax"), None);
//! ```
pub mod core;
pub mod sip;

/// A grammar rule evaluated against the start of a byte slice.
pub trait Rule {
    /// Returns the length of the matched prefix of `input`, or `None`.
    fn parse(&self, input: &[u8]) -> Option<usize>;

    /// Like [`Rule::parse`], additionally recording matched spans into
    /// `tokens`. Terminal rules record their whole match, a [`Sequence`]
    /// records one span per element. On mismatch `tokens` is left exactly
    /// as it was.
    fn parse_tokens<'a>(&self, input: &'a [u8], tokens: &mut Vec<&'a [u8]>) -> Option<usize> {
        let len = self.parse(input)?;
        tokens.push(&input[..len]);
        Some(len)
    }

    /// True when the rule matches the whole input.
    fn matches(&self, input: &[u8]) -> bool {
        self.parse(input) == Some(input.len())
    }
}

impl<R: Rule + ?Sized> Rule for Box<R> {
    fn parse(&self, input: &[u8]) -> Option<usize> {
        (**self).parse(input)
    }

    fn parse_tokens<'a>(&self, input: &'a [u8], tokens: &mut Vec<&'a [u8]>) -> Option<usize> {
        (**self).parse_tokens(input, tokens)
    }
}

/// Exact byte sequence.
#[derive(Debug, Clone, Copy)]
pub struct Literal {
    bytes: &'static [u8],
    ignore_case: bool,
}

pub fn literal(bytes: &'static [u8]) -> Literal {
    Literal {
        bytes,
        ignore_case: false,
    }
}

/// ABNF quoted strings are case-insensitive; header names and the
/// `SIP` version tag are matched with this.
pub fn literal_nocase(bytes: &'static [u8]) -> Literal {
    Literal {
        bytes,
        ignore_case: true,
    }
}

impl Rule for Literal {
    fn parse(&self, input: &[u8]) -> Option<usize> {
        let len = self.bytes.len();
        let candidate = input.get(..len)?;
        let matched = if self.ignore_case {
            candidate.eq_ignore_ascii_case(self.bytes)
        } else {
            candidate == self.bytes
        };
        matched.then_some(len)
    }
}

/// Single byte accepted by a predicate.
#[derive(Clone, Copy)]
pub struct ByteIf<F> {
    predicate: F,
}

pub fn byte_if<F: Fn(u8) -> bool>(predicate: F) -> ByteIf<F> {
    ByteIf { predicate }
}

impl<F: Fn(u8) -> bool> Rule for ByteIf<F> {
    fn parse(&self, input: &[u8]) -> Option<usize> {
        match input.first() {
            Some(&b) if (self.predicate)(b) => Some(1),
            _ => None,
        }
    }
}

/// Elements matched one after another.
#[derive(Debug, Clone, Copy)]
pub struct Sequence<T>(T);

pub fn seq<T>(rules: T) -> Sequence<T>
where
    Sequence<T>: Rule,
{
    Sequence(rules)
}

/// First matching element wins.
#[derive(Debug, Clone, Copy)]
pub struct Alternation<T>(T);

pub fn alt<T>(rules: T) -> Alternation<T>
where
    Alternation<T>: Rule,
{
    Alternation(rules)
}

macro_rules! tuple_rules {
    ($($name:ident : $idx:tt),+) => {
        impl<$($name: Rule),+> Rule for Sequence<($($name,)+)> {
            fn parse(&self, input: &[u8]) -> Option<usize> {
                let mut offset = 0;
                $(
                    offset += self.0.$idx.parse(&input[offset..])?;
                )+
                Some(offset)
            }

            fn parse_tokens<'a>(
                &self,
                input: &'a [u8],
                tokens: &mut Vec<&'a [u8]>,
            ) -> Option<usize> {
                let mark = tokens.len();
                let mut offset = 0;
                $(
                    match self.0.$idx.parse(&input[offset..]) {
                        Some(len) => {
                            tokens.push(&input[offset..offset + len]);
                            offset += len;
                        }
                        None => {
                            tokens.truncate(mark);
                            return None;
                        }
                    }
                )+
                Some(offset)
            }
        }

        impl<$($name: Rule),+> Rule for Alternation<($($name,)+)> {
            fn parse(&self, input: &[u8]) -> Option<usize> {
                $(
                    if let Some(len) = self.0.$idx.parse(input) {
                        return Some(len);
                    }
                )+
                None
            }

            fn parse_tokens<'a>(
                &self,
                input: &'a [u8],
                tokens: &mut Vec<&'a [u8]>,
            ) -> Option<usize> {
                $(
                    if let Some(len) = self.0.$idx.parse_tokens(input, tokens) {
                        return Some(len);
                    }
                )+
                None
            }
        }
    };
}

tuple_rules!(A: 0, B: 1);
tuple_rules!(A: 0, B: 1, C: 2);
tuple_rules!(A: 0, B: 1, C: 2, D: 3);
tuple_rules!(A: 0, B: 1, C: 2, D: 3, E: 4);
tuple_rules!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);
tuple_rules!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6);
tuple_rules!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7);

/// Bounded repetition, `min*max rule`.
///
/// The loop stops at the first failed iteration, at the end of the input,
/// or when an iteration matches nothing. Fewer than `min` iterations is a
/// mismatch. Input that would still match after `max` iterations is also
/// a mismatch: `max` caps the work spent on hostile input and does not
/// silently truncate it.
#[derive(Debug, Clone, Copy)]
pub struct LoopUntil<R> {
    rule: R,
    min: usize,
    max: usize,
}

pub fn repeat<R: Rule>(rule: R, min: usize, max: usize) -> LoopUntil<R> {
    LoopUntil { rule, min, max }
}

pub fn star<R: Rule>(rule: R) -> LoopUntil<R> {
    repeat(rule, 0, usize::MAX)
}

pub fn one_or_more<R: Rule>(rule: R) -> LoopUntil<R> {
    repeat(rule, 1, usize::MAX)
}

impl<R: Rule> LoopUntil<R> {
    fn run<'a>(&self, input: &'a [u8], mut tokens: Option<&mut Vec<&'a [u8]>>) -> Option<usize> {
        let mark = tokens.as_ref().map_or(0, |t| t.len());
        let mut offset = 0;
        let mut count = 0;
        let mut exceeded = false;
        while offset < input.len() {
            let rest = &input[offset..];
            let before = tokens.as_ref().map_or(0, |t| t.len());
            let len = match tokens.as_deref_mut() {
                Some(tokens) => self.rule.parse_tokens(rest, tokens),
                None => self.rule.parse(rest),
            };
            match len {
                Some(len) if len > 0 => {
                    if count == self.max {
                        exceeded = true;
                        break;
                    }
                    offset += len;
                    count += 1;
                }
                _ => {
                    if let Some(tokens) = tokens.as_deref_mut() {
                        tokens.truncate(before);
                    }
                    break;
                }
            }
        }
        if exceeded || count < self.min {
            if let Some(tokens) = tokens {
                tokens.truncate(mark);
            }
            return None;
        }
        Some(offset)
    }
}

impl<R: Rule> Rule for LoopUntil<R> {
    fn parse(&self, input: &[u8]) -> Option<usize> {
        self.run(input, None)
    }

    fn parse_tokens<'a>(&self, input: &'a [u8], tokens: &mut Vec<&'a [u8]>) -> Option<usize> {
        self.run(input, Some(tokens))
    }
}

/// `[ rule ]`, always succeeds.
#[derive(Debug, Clone, Copy)]
pub struct Optional<R>(R);

pub fn optional<R: Rule>(rule: R) -> Optional<R> {
    Optional(rule)
}

impl<R: Rule> Rule for Optional<R> {
    fn parse(&self, input: &[u8]) -> Option<usize> {
        Some(self.0.parse(input).unwrap_or(0))
    }

    fn parse_tokens<'a>(&self, input: &'a [u8], tokens: &mut Vec<&'a [u8]>) -> Option<usize> {
        Some(self.0.parse_tokens(input, tokens).unwrap_or(0))
    }
}
