//! HTTP/1.0 and HTTP/1.1 protocol support.
//!
//! [`HttpContext`] parses requests incrementally as bytes arrive, one
//! context per connection; [`HttpResponse`] serializes into an outbound
//! buffer. Chunked transfer encoding and trailers are not supported;
//! `Content-Length` is authoritative.

mod context;
mod error;
mod request;
mod response;

pub use context::{HttpContext, ParseState};
pub use error::ParseError;
pub use request::{HttpRequest, Method, Version};
pub use response::{HttpResponse, StatusCode};
