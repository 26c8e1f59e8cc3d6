//! Type signatures: the runtime description of a value's shape.
//!
//! A signature is written as a compact string built from one-letter codes:
//!
//! | Code | Type | Code | Type |
//! |------|------|------|------|
//! | `v` | void | `s` | string |
//! | `b` | bool | `r` | raw buffer |
//! | `c` / `C` | i8 / u8 | `o` | object reference |
//! | `w` / `W` | i16 / u16 | `m` | dynamic (value carries its own signature) |
//! | `i` / `I` | i32 / u32 | `[X]` | sequence of X |
//! | `l` / `L` | i64 / u64 | `{X}` | mapping string → X |
//! | `f` / `d` | f32 / f64 | `(X..)` | tuple, used for parameter lists |
//!
//! `<Name>` names an opaque external type. Two signatures are equal exactly
//! when their rendered strings are equal.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Deepest nesting of sequences, mappings and tuples accepted in a signature
/// or in a decoded value.
pub const MAX_NESTING: usize = 64;

/// Parsed form of a signature string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Signature {
    Void,
    Bool,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
    String,
    Raw,
    Object,
    Dynamic,
    List(Box<Signature>),
    Map(Box<Signature>),
    Tuple(Vec<Signature>),
    Opaque(String),
}

impl Signature {
    /// Parse a complete signature string.
    pub fn parse(text: &str) -> Result<Self> {
        let bytes = text.as_bytes();
        if bytes.is_empty() {
            return Err(Error::InvalidSignature(text.to_string()));
        }
        let mut pos = 0;
        let sig = parse_one(bytes, &mut pos, 0).ok_or_else(|| Error::InvalidSignature(text.to_string()))?;
        if pos != bytes.len() {
            return Err(Error::InvalidSignature(text.to_string()));
        }
        Ok(sig)
    }

    /// A tuple of the given element signatures.
    pub fn tuple(children: impl IntoIterator<Item = Signature>) -> Self {
        Self::Tuple(children.into_iter().collect())
    }

    /// A sequence of `element`.
    pub fn list(element: Signature) -> Self {
        Self::List(Box::new(element))
    }

    /// A string-keyed mapping to `value`.
    pub fn map(value: Signature) -> Self {
        Self::Map(Box::new(value))
    }

    /// Nested signatures: tuple members, or the element of a sequence/mapping.
    pub fn children(&self) -> Vec<Signature> {
        match self {
            Self::List(inner) | Self::Map(inner) => vec![(**inner).clone()],
            Self::Tuple(members) => members.clone(),
            _ => Vec::new(),
        }
    }

    /// True for the `v` signature.
    pub fn is_void(&self) -> bool {
        matches!(self, Self::Void)
    }

    /// Single-letter code of an elementary signature.
    fn code(&self) -> Option<char> {
        Some(match self {
            Self::Void => 'v',
            Self::Bool => 'b',
            Self::Int8 => 'c',
            Self::UInt8 => 'C',
            Self::Int16 => 'w',
            Self::UInt16 => 'W',
            Self::Int32 => 'i',
            Self::UInt32 => 'I',
            Self::Int64 => 'l',
            Self::UInt64 => 'L',
            Self::Float32 => 'f',
            Self::Float64 => 'd',
            Self::String => 's',
            Self::Raw => 'r',
            Self::Object => 'o',
            Self::Dynamic => 'm',
            _ => return None,
        })
    }
}

fn elementary(code: u8) -> Option<Signature> {
    Some(match code {
        b'v' => Signature::Void,
        b'b' => Signature::Bool,
        b'c' => Signature::Int8,
        b'C' => Signature::UInt8,
        b'w' => Signature::Int16,
        b'W' => Signature::UInt16,
        b'i' => Signature::Int32,
        b'I' => Signature::UInt32,
        b'l' => Signature::Int64,
        b'L' => Signature::UInt64,
        b'f' => Signature::Float32,
        b'd' => Signature::Float64,
        b's' => Signature::String,
        b'r' => Signature::Raw,
        b'o' => Signature::Object,
        b'm' => Signature::Dynamic,
        _ => return None,
    })
}

fn parse_one(bytes: &[u8], pos: &mut usize, depth: usize) -> Option<Signature> {
    let code = *bytes.get(*pos)?;
    *pos += 1;
    if matches!(code, b'[' | b'{' | b'(') && depth >= MAX_NESTING {
        return None;
    }
    match code {
        b'[' => {
            let inner = parse_one(bytes, pos, depth + 1)?;
            expect(bytes, pos, b']')?;
            Some(Signature::list(inner))
        }
        b'{' => {
            let inner = parse_one(bytes, pos, depth + 1)?;
            expect(bytes, pos, b'}')?;
            Some(Signature::map(inner))
        }
        b'(' => {
            let mut members = Vec::new();
            while *bytes.get(*pos)? != b')' {
                members.push(parse_one(bytes, pos, depth + 1)?);
            }
            *pos += 1;
            Some(Signature::Tuple(members))
        }
        b'<' => {
            let start = *pos;
            while *bytes.get(*pos)? != b'>' {
                let c = bytes[*pos];
                if !(c.is_ascii_alphanumeric() || c == b'_' || c == b':' || c == b'.') {
                    return None;
                }
                *pos += 1;
            }
            if *pos == start {
                return None;
            }
            let name = std::str::from_utf8(&bytes[start..*pos]).ok()?.to_string();
            *pos += 1;
            Some(Signature::Opaque(name))
        }
        other => elementary(other),
    }
}

fn expect(bytes: &[u8], pos: &mut usize, want: u8) -> Option<()> {
    if *bytes.get(*pos)? == want {
        *pos += 1;
        Some(())
    } else {
        None
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.code() {
            return write!(f, "{code}");
        }
        match self {
            Self::List(inner) => write!(f, "[{inner}]"),
            Self::Map(inner) => write!(f, "{{{inner}}}"),
            Self::Tuple(members) => {
                write!(f, "(")?;
                for m in members {
                    write!(f, "{m}")?;
                }
                write!(f, ")")
            }
            Self::Opaque(name) => write!(f, "<{name}>"),
            _ => unreachable!("elementary signatures are rendered by code()"),
        }
    }
}

impl FromStr for Signature {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(d)?;
        Signature::parse(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_children_count() {
        assert_eq!(Signature::parse("(iiii)").unwrap().children().len(), 4);
        assert_eq!(Signature::parse("[i]").unwrap().children().len(), 1);
        assert!(Signature::parse("i").unwrap().children().is_empty());
    }

    #[test]
    fn test_render_matches_input() {
        for text in ["v", "(so)", "[[d]]", "{m}", "({[s]}L<Pose>)", "()"] {
            assert_eq!(Signature::parse(text).unwrap().to_string(), text);
        }
    }

    #[test]
    fn test_equality_is_string_equality() {
        assert_eq!(Signature::parse("[s]").unwrap(), Signature::parse("[s]").unwrap());
        assert_ne!(Signature::parse("(mm)").unwrap(), Signature::parse("(mmm)").unwrap());
        assert_ne!(Signature::parse("(mm)").unwrap(), Signature::parse("(m)").unwrap());
    }

    #[test]
    fn test_nesting_limit() {
        let nested = |depth: usize| format!("{}i{}", "[".repeat(depth), "]".repeat(depth));
        assert!(Signature::parse(&nested(MAX_NESTING)).is_ok());
        assert!(matches!(
            Signature::parse(&nested(MAX_NESTING + 1)),
            Err(Error::InvalidSignature(_))
        ));
        let hostile = format!("{}i{}", "{[(".repeat(100_000), ")]}".repeat(100_000));
        assert!(Signature::parse(&hostile).is_err());
    }

    #[test]
    fn test_invalid_signatures() {
        for text in ["", "(", "{", "[", "plafbim", "(m)(sib)", "ddd", "(mm", "[]", "<>", "<a b>"] {
            assert!(Signature::parse(text).is_err(), "{text:?} should be rejected");
        }
    }

    #[test]
    fn test_serde_as_string() {
        let sig = Signature::parse("(s[o])").unwrap();
        let json = serde_json::to_string(&sig).unwrap();
        assert_eq!(json, "\"(s[o])\"");
        let back: Signature = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sig);
        assert!(serde_json::from_str::<Signature>("\"(s\"").is_err());
    }
}
