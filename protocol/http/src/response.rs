//! Response model and wire serialization.

use net::Buffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    MovedPermanently,
    BadRequest,
    NotFound,
    MethodNotAllowed,
    InternalServerError,
}

impl StatusCode {
    pub fn code(&self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::MovedPermanently => 301,
            StatusCode::BadRequest => 400,
            StatusCode::NotFound => 404,
            StatusCode::MethodNotAllowed => 405,
            StatusCode::InternalServerError => 500,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::MovedPermanently => "Moved Permanently",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::NotFound => "Not Found",
            StatusCode::MethodNotAllowed => "Method Not Allowed",
            StatusCode::InternalServerError => "Internal Server Error",
        }
    }
}

/// An outbound response. `close_connection` decides both the
/// `Connection` header and whether the server half-closes after the
/// response drains.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    status: StatusCode,
    status_message: Option<String>,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    close_connection: bool,
}

impl HttpResponse {
    pub fn new(close_connection: bool) -> Self {
        Self {
            status: StatusCode::Ok,
            status_message: None,
            headers: Vec::new(),
            body: Vec::new(),
            close_connection,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// Override the canned reason phrase.
    pub fn set_status_message(&mut self, message: impl Into<String>) {
        self.status_message = Some(message.into());
    }

    pub fn close_connection(&self) -> bool {
        self.close_connection
    }

    pub fn set_close_connection(&mut self, on: bool) {
        self.close_connection = on;
    }

    /// Set a header, replacing any earlier value for the same name.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if let Some(slot) = self
            .headers
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(&name))
        {
            slot.1 = value;
        } else {
            self.headers.push((name, value));
        }
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.set_header("Content-Type", content_type);
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Serialize: status line, the connection block (`Connection: close`,
    /// or `Content-Length` plus `Connection: Keep-Alive`), user headers,
    /// blank line, body.
    pub fn append_to(&self, out: &mut Buffer) {
        let reason = match &self.status_message {
            Some(message) => message.as_str(),
            None => self.status.reason(),
        };
        out.append(format!("HTTP/1.1 {} {}\r\n", self.status.code(), reason).as_bytes());
        if self.close_connection {
            out.append(b"Connection: close\r\n");
        } else {
            out.append(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
            out.append(b"Connection: Keep-Alive\r\n");
        }
        for (name, value) in &self.headers {
            out.append(format!("{}: {}\r\n", name, value).as_bytes());
        }
        out.append(b"\r\n");
        out.append(&self.body);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serialized(response: &HttpResponse) -> Vec<u8> {
        let mut buf = Buffer::new();
        response.append_to(&mut buf);
        buf.peek().to_vec()
    }

    #[test]
    fn keep_alive_layout() {
        let mut response = HttpResponse::new(false);
        response.set_status(StatusCode::Ok);
        response.set_content_type("text/plain");
        response.set_body("Hello, World!");
        assert_eq!(
            serialized(&response),
            b"HTTP/1.1 200 OK\r\n\
              Content-Length: 13\r\n\
              Connection: Keep-Alive\r\n\
              Content-Type: text/plain\r\n\
              \r\n\
              Hello, World!"
        );
    }

    #[test]
    fn close_layout_omits_content_length() {
        let mut response = HttpResponse::new(true);
        response.set_status(StatusCode::NotFound);
        response.set_body("404 Not Found");
        assert_eq!(
            serialized(&response),
            b"HTTP/1.1 404 Not Found\r\nConnection: close\r\n\r\n404 Not Found"
        );
    }

    #[test]
    fn status_message_overrides_reason() {
        let mut response = HttpResponse::new(true);
        response.set_status(StatusCode::Ok);
        response.set_status_message("Fine");
        assert!(serialized(&response).starts_with(b"HTTP/1.1 200 Fine\r\n"));
    }

    #[test]
    fn set_header_replaces_case_insensitively() {
        let mut response = HttpResponse::new(false);
        response.set_header("X-Tag", "one");
        response.set_header("x-tag", "two");
        let wire = serialized(&response);
        let text = String::from_utf8(wire).unwrap();
        assert_eq!(text.matches("X-Tag").count(), 1);
        assert!(text.contains("X-Tag: two\r\n"));
    }
}
