//! Incremental request parser, one per connection.
//!
//! Bytes are consumed from the connection's input buffer as each piece
//! completes; partial lines stay buffered and parsing resumes where it
//! left off on the next delivery. The driver calls [`HttpContext::parse`]
//! until [`HttpContext::got_all`], takes the request, and the context is
//! then ready for the next request on a keep-alive connection.

use crate::error::ParseError;
use crate::request::{HttpRequest, Method, Version};
use net::{Buffer, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    ExpectRequestLine,
    ExpectHeaders,
    ExpectBody,
    GotAll,
}

#[derive(Debug)]
pub struct HttpContext {
    state: ParseState,
    request: HttpRequest,
}

impl Default for HttpContext {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpContext {
    pub fn new() -> Self {
        Self {
            state: ParseState::ExpectRequestLine,
            request: HttpRequest::default(),
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn got_all(&self) -> bool {
        self.state == ParseState::GotAll
    }

    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    /// Take the completed request, leaving the context equivalent to a
    /// freshly constructed one.
    pub fn take_request(&mut self) -> HttpRequest {
        debug_assert!(self.got_all());
        self.state = ParseState::ExpectRequestLine;
        std::mem::take(&mut self.request)
    }

    /// Discard any partial parse and start over.
    pub fn reset(&mut self) {
        self.state = ParseState::ExpectRequestLine;
        self.request = HttpRequest::default();
    }

    /// Consume as much of `buf` as possible. Returning `Ok` with a state
    /// short of `GotAll` means more bytes are needed; an error means the
    /// request is malformed and the connection should be rejected.
    pub fn parse(&mut self, buf: &mut Buffer, receive_time: Timestamp) -> Result<(), ParseError> {
        loop {
            match self.state {
                ParseState::ExpectRequestLine => {
                    let Some(pos) = buf.find_crlf() else {
                        return Ok(());
                    };
                    let line = buf.peek()[..pos].to_vec();
                    self.parse_request_line(&line)?;
                    self.request.set_receive_time(receive_time);
                    buf.retrieve(pos + 2);
                    self.state = ParseState::ExpectHeaders;
                }
                ParseState::ExpectHeaders => {
                    let Some(pos) = buf.find_crlf() else {
                        return Ok(());
                    };
                    if pos == 0 {
                        buf.retrieve(2);
                        let has_body = self
                            .request
                            .header("content-length")
                            .is_some_and(|v| !v.is_empty());
                        if has_body {
                            self.state = ParseState::ExpectBody;
                        } else {
                            self.state = ParseState::GotAll;
                            return Ok(());
                        }
                    } else {
                        let line = buf.peek()[..pos].to_vec();
                        buf.retrieve(pos + 2);
                        self.parse_header_line(&line)?;
                    }
                }
                ParseState::ExpectBody => {
                    let length = self.content_length()?;
                    if buf.readable_bytes() < length {
                        return Ok(());
                    }
                    self.request.set_body(buf.peek()[..length].to_vec());
                    buf.retrieve(length);
                    self.state = ParseState::GotAll;
                    return Ok(());
                }
                ParseState::GotAll => return Ok(()),
            }
        }
    }

    /// `METHOD SP URL SP VERSION`, with the URL split on the first `?`
    /// into path and query string.
    fn parse_request_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let line = std::str::from_utf8(line).map_err(|_| ParseError::BadRequestLine)?;
        let mut parts = line.split(' ');
        let (Some(method), Some(url), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ParseError::BadRequestLine);
        };
        if method.is_empty() || url.is_empty() {
            return Err(ParseError::BadRequestLine);
        }
        let method = Method::from_str(method).ok_or(ParseError::BadMethod)?;
        let version = Version::from_str(version).ok_or(ParseError::BadVersion)?;
        self.request.set_method(method);
        self.request.set_version(version);
        match url.split_once('?') {
            Some((path, query)) => {
                self.request.set_path(path);
                self.request.parse_query_string(query);
            }
            None => self.request.set_path(url),
        }
        Ok(())
    }

    /// `name: value`, split on the first colon; both sides are trimmed
    /// and the name is lowercased on insert.
    fn parse_header_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let line = std::str::from_utf8(line).map_err(|_| ParseError::BadHeader)?;
        let (name, value) = line.split_once(':').ok_or(ParseError::BadHeader)?;
        if name.trim().is_empty() {
            return Err(ParseError::BadHeader);
        }
        self.request.add_header(name, value);
        Ok(())
    }

    fn content_length(&self) -> Result<usize, ParseError> {
        self.request
            .header("content-length")
            .unwrap_or("")
            .trim()
            .parse::<usize>()
            .map_err(|_| ParseError::BadContentLength)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(ctx: &mut HttpContext, bytes: &[u8]) -> Result<(), ParseError> {
        let mut buf = Buffer::new();
        buf.append(bytes);
        ctx.parse(&mut buf, Timestamp::now())
    }

    #[test]
    fn parses_a_full_get_request() {
        let mut ctx = HttpContext::new();
        parse_all(
            &mut ctx,
            b"GET /index.html?name=tom&age=3 HTTP/1.1\r\nHost: localhost\r\nAccept: */*\r\n\r\n",
        )
        .unwrap();
        assert!(ctx.got_all());

        let req = ctx.take_request();
        assert_eq!(req.method(), Method::Get);
        assert_eq!(req.version(), Version::Http11);
        assert_eq!(req.path(), "/index.html");
        assert_eq!(req.query("name"), Some("tom"));
        assert_eq!(req.query("age"), Some("3"));
        assert_eq!(req.header("host"), Some("localhost"));
        assert!(req.receive_time().is_valid());
        assert_eq!(ctx.state(), ParseState::ExpectRequestLine);
    }

    #[test]
    fn parses_a_post_body_by_content_length() {
        let mut ctx = HttpContext::new();
        let mut buf = Buffer::new();
        buf.append(b"POST /submit HTTP/1.1\r\nContent-Length: 11\r\n\r\nhello");
        ctx.parse(&mut buf, Timestamp::now()).unwrap();
        assert_eq!(ctx.state(), ParseState::ExpectBody);

        buf.append(b" world");
        ctx.parse(&mut buf, Timestamp::now()).unwrap();
        assert!(ctx.got_all());
        assert_eq!(ctx.request().body(), b"hello world");
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn byte_at_a_time_delivery_matches_single_shot() {
        let wire = b"GET /a/b?x=1 HTTP/1.1\r\nHost: h\r\nX-K: v\r\n\r\n";

        let mut whole = HttpContext::new();
        parse_all(&mut whole, wire).unwrap();
        let expected = whole.take_request();

        let mut trickled = HttpContext::new();
        let mut buf = Buffer::new();
        for byte in wire.iter() {
            buf.append(&[*byte]);
            trickled.parse(&mut buf, Timestamp::now()).unwrap();
        }
        assert!(trickled.got_all());
        let got = trickled.take_request();

        assert_eq!(got.method(), expected.method());
        assert_eq!(got.path(), expected.path());
        assert_eq!(got.queries(), expected.queries());
        assert_eq!(got.headers(), expected.headers());
        assert_eq!(got.body(), expected.body());
    }

    #[test]
    fn rejects_unknown_version() {
        let mut ctx = HttpContext::new();
        let err = parse_all(&mut ctx, b"GET /foo HTTP/9.9\r\n\r\n").unwrap_err();
        assert_eq!(err, ParseError::BadVersion);
    }

    #[test]
    fn rejects_unknown_method() {
        let mut ctx = HttpContext::new();
        let err = parse_all(&mut ctx, b"BREW /pot HTTP/1.1\r\n\r\n").unwrap_err();
        assert_eq!(err, ParseError::BadMethod);
    }

    #[test]
    fn rejects_garbage_header_line() {
        let mut ctx = HttpContext::new();
        let err = parse_all(&mut ctx, b"GET / HTTP/1.1\r\nno-colon-here\r\n\r\n").unwrap_err();
        assert_eq!(err, ParseError::BadHeader);
    }

    #[test]
    fn rejects_unparsable_content_length() {
        let mut ctx = HttpContext::new();
        let err = parse_all(
            &mut ctx,
            b"POST / HTTP/1.1\r\nContent-Length: nope\r\n\r\nxx",
        )
        .unwrap_err();
        assert_eq!(err, ParseError::BadContentLength);
    }

    #[test]
    fn keep_alive_context_reuse_leaves_no_residue() {
        let mut ctx = HttpContext::new();
        let mut buf = Buffer::new();
        buf.append(b"GET /one HTTP/1.1\r\nA: 1\r\n\r\nGET /two HTTP/1.1\r\n\r\n");

        ctx.parse(&mut buf, Timestamp::now()).unwrap();
        assert!(ctx.got_all());
        let first = ctx.take_request();
        assert_eq!(first.path(), "/one");

        ctx.parse(&mut buf, Timestamp::now()).unwrap();
        assert!(ctx.got_all());
        let second = ctx.take_request();
        assert_eq!(second.path(), "/two");
        assert!(second.headers().is_empty());
    }

    #[test]
    fn reset_discards_partial_state() {
        let mut ctx = HttpContext::new();
        let mut buf = Buffer::new();
        buf.append(b"GET /partial HTTP/1.1\r\nHost:");
        ctx.parse(&mut buf, Timestamp::now()).unwrap();
        assert_eq!(ctx.state(), ParseState::ExpectHeaders);

        ctx.reset();
        assert_eq!(ctx.state(), ParseState::ExpectRequestLine);
        assert_eq!(ctx.request().path(), "");
    }
}
