//! Parse failures. Any of these is surfaced to the peer as a 400.

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed request line")]
    BadRequestLine,
    #[error("unsupported method")]
    BadMethod,
    #[error("unsupported http version")]
    BadVersion,
    #[error("malformed header line")]
    BadHeader,
    #[error("invalid content length")]
    BadContentLength,
}
