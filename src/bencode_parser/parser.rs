use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::take,
    character::complete::{char, digit1, one_of},
    combinator::{eof, map, opt, recognize},
    error::ErrorKind,
    multi::{many_till, many0},
    sequence::{delimited, pair, preceded, terminated},
};
use std::collections::HashMap;

pub use nom::Err;

use crate::bencode_parser::errors::BencodeError;

type Input<'a> = &'a [u8];
type BenResult<'a, O = Value<'a>> = IResult<Input<'a>, O, BencodeError<Input<'a>>>;

/// A bencoded value borrowing its byte strings from the parsed buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value<'a> {
    Bytes(&'a [u8]),
    Integer(i64),
    List(Vec<Self>),
    Dictionary(HashMap<&'a [u8], Self>),
}

impl<'a> Value<'a> {
    pub fn as_bytes(&self) -> Option<&'a [u8]> {
        match self {
            Value::Bytes(bytes) => Some(*bytes),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&'a str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value<'a>]> {
        match self {
            Value::List(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    /// Looks up `key` when this value is a dictionary.
    pub fn get(&self, key: &[u8]) -> Option<&Value<'a>> {
        match self {
            Value::Dictionary(entries) => entries.get(key),
            _ => None,
        }
    }
}

fn ascii<'a>(at: Input<'a>, digits: Input<'a>) -> Result<&'a str, Err<BencodeError<Input<'a>>>> {
    std::str::from_utf8(digits).map_err(|_| Err::Error(BencodeError::Nom(at, ErrorKind::Digit)))
}

/// `i<digits>e`, rejecting leading zeros and negative zero.
fn integer(input: Input<'_>) -> BenResult<'_> {
    let (rest, digits) = delimited(
        char('i'),
        recognize(pair(opt(one_of("+-")), digit1)),
        char('e'),
    )
    .parse(input)?;

    let text = ascii(input, digits)?;
    let unsigned = text.trim_start_matches(['+', '-']);
    if text.starts_with("-0") || (unsigned.starts_with('0') && unsigned.len() > 1) {
        return Err(Err::Failure(BencodeError::InvalidInteger(input)));
    }
    let number: i64 = text
        .parse()
        .map_err(|e| BencodeError::ParseIntError(rest, e))?;
    Ok((rest, Value::Integer(number)))
}

/// `<len>:<bytes>`; the empty string `0:` is allowed.
fn byte_string(input: Input<'_>) -> BenResult<'_, Input<'_>> {
    let (rest, digits) = terminated(digit1, char(':')).parse(input)?;
    let len: usize = ascii(input, digits)?
        .parse()
        .map_err(|e| BencodeError::ParseIntError(rest, e))?;
    take(len).parse(rest)
}

fn list(input: Input<'_>) -> BenResult<'_> {
    let (rest, (items, _)) = preceded(char('l'), many_till(value, char('e'))).parse(input)?;
    Ok((rest, Value::List(items)))
}

fn dictionary(input: Input<'_>) -> BenResult<'_> {
    let (rest, (entries, _)) =
        preceded(char('d'), many_till(pair(byte_string, value), char('e'))).parse(input)?;
    Ok((rest, Value::Dictionary(entries.into_iter().collect())))
}

fn value(input: Input<'_>) -> BenResult<'_> {
    alt((map(byte_string, Value::Bytes), integer, list, dictionary)).parse(input)
}

/// Parses every value in `source`, which must be consumed entirely.
///
/// # Errors
/// Returns `Err` if `source` is not well-formed bencode.
pub fn parse(source: &[u8]) -> Result<Vec<Value<'_>>, Err<BencodeError<&[u8]>>> {
    let (rest, items) = many0(value).parse(source)?;
    eof::<_, BencodeError<&[u8]>>(rest)?;
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_dictionary() {
        let data = b"d3:cow3:moo4:spam4:eggse";
        let parsed = parse(data).unwrap();
        let dict = parsed.first().unwrap();

        assert_eq!(dict.get(b"cow").and_then(Value::as_bytes), Some(&b"moo"[..]));
        assert_eq!(dict.get(b"spam").and_then(Value::as_str), Some("eggs"));
        assert!(dict.get(b"missing").is_none());
    }

    #[test]
    fn test_parse_nested() {
        let data = b"d5:peersld4:addr14:127.0.0.1:7000ee8:intervali1800ee";
        let parsed = parse(data).unwrap();
        let dict = parsed.first().unwrap();

        assert_eq!(dict.get(b"interval").and_then(Value::as_integer), Some(1800));
        let peers = dict.get(b"peers").and_then(Value::as_list).unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(
            peers[0].get(b"addr").and_then(Value::as_str),
            Some("127.0.0.1:7000")
        );
    }

    #[test]
    fn test_parse_empty_string() {
        let parsed = parse(b"0:").unwrap();
        assert_eq!(parsed.first().and_then(Value::as_bytes), Some(&b""[..]));
    }

    #[test]
    fn test_parse_rejects_leading_zero() {
        assert!(parse(b"i03e").is_err());
        assert!(parse(b"i-0e").is_err());
        assert_eq!(
            parse(b"i-42e").unwrap().first().and_then(Value::as_integer),
            Some(-42)
        );
    }

    #[test]
    fn test_parse_signed_integers() {
        assert_eq!(parse(b"i+7e").unwrap(), vec![Value::Integer(7)]);
        assert_eq!(parse(b"i0e").unwrap(), vec![Value::Integer(0)]);
        assert!(parse(b"i+05e").is_err());
        assert!(parse(b"i99999999999999999999e").is_err());
    }

    #[test]
    fn test_parse_rejects_truncated_input() {
        assert!(parse(b"5:abc").is_err());
        assert!(parse(b"d3:cow").is_err());
    }
}
