use std::array::TryFromSliceError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure conditions surfaced by the storage layer.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("invalid state")]
    InvalidState,
    #[error("index out of bound")]
    IndexOutOfBound,
    #[error("value count mismatch")]
    ValueCountMismatch,
    // persistence errors
    #[error("invalid format")]
    InvalidFormat,
    #[error("field tag mismatch({0})")]
    FieldTagMismatch(&'static str),
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("invalid compressed data")]
    InvalidCompressedData,
    #[error("io error")]
    IOError,
    #[error("page store exhausted")]
    PageStoreExhausted,
}

impl From<TryFromSliceError> for Error {
    #[inline]
    fn from(_: TryFromSliceError) -> Self {
        Error::InvalidFormat
    }
}

impl From<std::io::Error> for Error {
    #[inline]
    fn from(_: std::io::Error) -> Self {
        Error::IOError
    }
}

impl From<std::str::Utf8Error> for Error {
    #[inline]
    fn from(_: std::str::Utf8Error) -> Self {
        Error::InvalidFormat
    }
}
