use std::num::ParseIntError;

use nom::error::{ErrorKind, ParseError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BencodeError<I> {
    #[error("parser error {1:?} at {0:?}")]
    Nom(I, ErrorKind),

    #[error("invalid integer at {0:?}")]
    InvalidInteger(I),

    #[error("invalid number at {0:?}: {1}")]
    ParseIntError(I, ParseIntError),
}

impl<I> ParseError<I> for BencodeError<I> {
    fn from_error_kind(input: I, kind: ErrorKind) -> Self {
        BencodeError::Nom(input, kind)
    }

    fn append(_: I, _: ErrorKind, other: Self) -> Self {
        other
    }
}

impl<I> From<BencodeError<I>> for nom::Err<BencodeError<I>> {
    fn from(err: BencodeError<I>) -> Self {
        nom::Err::Error(err)
    }
}
