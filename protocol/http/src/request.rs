//! Parsed request model.

use net::Timestamp;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Head,
    Put,
    Delete,
}

impl Method {
    /// Anything outside this set is rejected at parse time.
    pub fn from_str(s: &str) -> Option<Method> {
        match s {
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            "HEAD" => Some(Method::Head),
            "PUT" => Some(Method::Put),
            "DELETE" => Some(Method::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Head => "HEAD",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn from_str(s: &str) -> Option<Version> {
        match s {
            "HTTP/1.0" => Some(Version::Http10),
            "HTTP/1.1" => Some(Version::Http11),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

/// One parsed request. Header names are lowercased on insert and lookups
/// lowercase the probe, so access is case-insensitive in both directions.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    method: Method,
    version: Version,
    path: String,
    queries: HashMap<String, String>,
    headers: HashMap<String, String>,
    body: Vec<u8>,
    receive_time: Timestamp,
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self {
            method: Method::Get,
            version: Version::Http11,
            path: String::new(),
            queries: HashMap::new(),
            headers: HashMap::new(),
            body: Vec::new(),
            receive_time: Timestamp::invalid(),
        }
    }
}

impl HttpRequest {
    pub fn method(&self) -> Method {
        self.method
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// The request path, without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self, name: &str) -> Option<&str> {
        self.queries.get(name).map(String::as_str)
    }

    pub fn queries(&self) -> &HashMap<String, String> {
        &self.queries
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn receive_time(&self) -> Timestamp {
        self.receive_time
    }

    pub(crate) fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    pub(crate) fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub(crate) fn set_path(&mut self, path: &str) {
        self.path = path.to_string();
    }

    pub(crate) fn set_body(&mut self, body: Vec<u8>) {
        self.body = body;
    }

    pub(crate) fn set_receive_time(&mut self, t: Timestamp) {
        self.receive_time = t;
    }

    pub(crate) fn add_header(&mut self, name: &str, value: &str) {
        self.headers.insert(
            name.trim().to_ascii_lowercase(),
            value.trim().to_string(),
        );
    }

    /// Split a raw query string on `&`, then each entry on the first `=`.
    /// A missing `=` yields an empty value; empty entries are skipped.
    /// Keys and values are percent-decoded.
    pub(crate) fn parse_query_string(&mut self, raw: &str) {
        for entry in raw.split('&') {
            if entry.is_empty() {
                continue;
            }
            let (key, value) = match entry.split_once('=') {
                Some((key, value)) => (key, value),
                None => (entry, ""),
            };
            self.queries
                .insert(percent_decode(key), percent_decode(value));
        }
    }
}

/// Decode `%XX` escapes and `+` as space. Malformed escapes are kept
/// literally.
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => match (hex_value(bytes.get(i + 1)), hex_value(bytes.get(i + 2))) {
                (Some(hi), Some(lo)) => {
                    out.push(hi << 4 | lo);
                    i += 3;
                }
                _ => {
                    out.push(b'%');
                    i += 1;
                }
            },
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(b: Option<&u8>) -> Option<u8> {
    match b {
        Some(b @ b'0'..=b'9') => Some(b - b'0'),
        Some(b @ b'a'..=b'f') => Some(b - b'a' + 10),
        Some(b @ b'A'..=b'F') => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut req = HttpRequest::default();
        req.add_header("Content-Length", " 42 ");
        assert_eq!(req.header("content-length"), Some("42"));
        assert_eq!(req.header("CONTENT-LENGTH"), Some("42"));
        assert_eq!(req.header("x-missing"), None);
    }

    #[test]
    fn query_string_splits_on_ampersand_and_first_equals() {
        let mut req = HttpRequest::default();
        req.parse_query_string("a=1&b=x=y&&flag&empty=");
        assert_eq!(req.query("a"), Some("1"));
        assert_eq!(req.query("b"), Some("x=y"));
        assert_eq!(req.query("flag"), Some(""));
        assert_eq!(req.query("empty"), Some(""));
        assert_eq!(req.queries().len(), 4);
    }

    #[test]
    fn query_values_are_percent_decoded() {
        let mut req = HttpRequest::default();
        req.parse_query_string("name=tom%20jones&q=a%2Bb&plus=1+2&bad=%zz");
        assert_eq!(req.query("name"), Some("tom jones"));
        assert_eq!(req.query("q"), Some("a+b"));
        assert_eq!(req.query("plus"), Some("1 2"));
        assert_eq!(req.query("bad"), Some("%zz"));
    }
}
