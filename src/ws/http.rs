//! Minimal HTTP request/response model.
//!
//! Carries exactly what the upgrade handshake and plain-HTTP header access
//! need: a request line or status line, ordered headers with
//! case-insensitive lookup, wire serialization, and incremental parsers
//! that tolerate headers arriving across partial reads. Bytes following the
//! header block are returned to the caller; after a 101 response they
//! belong to the frame decoder.

/// Parser outcome for one `parse` call.
#[derive(Debug, PartialEq, Eq)]
pub enum Parse {
    /// Header block complete; holds the unconsumed bytes that followed it.
    Good(Vec<u8>),
    /// More bytes required.
    Indeterminate,
    /// Malformed head.
    Bad,
}

fn header_eq(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

#[derive(Debug, Clone, Default)]
pub struct Request {
    pub method: String,
    pub uri: String,
    pub version_major: u8,
    pub version_minor: u8,
    headers: Vec<(String, String)>,
}

impl Request {
    pub fn new() -> Request {
        Request {
            method: String::new(),
            uri: "/".to_string(),
            version_major: 1,
            version_minor: 1,
            headers: Vec::new(),
        }
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| header_eq(k, name))
            .map(|(_, v)| v.as_str())
    }

    /// Replace an existing header or append a new one.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some(entry) = self.headers.iter_mut().find(|(k, _)| header_eq(k, name)) {
            entry.1 = value;
        } else {
            self.headers.push((name.to_string(), value));
        }
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// True for a well-formed WebSocket upgrade request.
    pub fn is_websocket_upgrade(&self) -> bool {
        let upgrade = self
            .get_header("Upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false);
        let connection = self
            .get_header("Connection")
            .map(|v| v.to_ascii_lowercase().contains("upgrade"))
            .unwrap_or(false);
        header_eq(&self.method, "GET") && upgrade && connection
    }

    pub fn to_wire(&self) -> String {
        let mut out = format!(
            "{} {} HTTP/{}.{}\r\n",
            self.method, self.uri, self.version_major, self.version_minor
        );
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub version_major: u8,
    pub version_minor: u8,
    headers: Vec<(String, String)>,
}

impl Default for Response {
    fn default() -> Self {
        Response {
            status: 0,
            version_major: 1,
            version_minor: 1,
            headers: Vec::new(),
        }
    }
}

impl Response {
    pub fn new() -> Response {
        Response::default()
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| header_eq(k, name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some(entry) = self.headers.iter_mut().find(|(k, _)| header_eq(k, name)) {
            entry.1 = value;
        } else {
            self.headers.push((name.to_string(), value));
        }
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn reason_phrase(status: u16) -> &'static str {
        match status {
            101 => "Switching Protocols",
            200 => "OK",
            400 => "Bad Request",
            403 => "Forbidden",
            404 => "Not Found",
            426 => "Upgrade Required",
            500 => "Internal Server Error",
            _ => "Unknown",
        }
    }

    pub fn to_wire(&self) -> String {
        let mut out = format!(
            "HTTP/{}.{} {} {}\r\n",
            self.version_major,
            self.version_minor,
            self.status,
            Self::reason_phrase(self.status)
        );
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out
    }
}

/// Find the end of the header block (the CRLFCRLF terminator).
fn head_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn parse_http_version(token: &str) -> Option<(u8, u8)> {
    let rest = token.strip_prefix("HTTP/")?;
    let (major, minor) = rest.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

fn parse_headers(lines: std::str::Lines<'_>, headers: &mut Vec<(String, String)>) -> bool {
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return false;
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    true
}

/// Incremental request-head parser.
#[derive(Default)]
pub struct RequestParser {
    buffer: Vec<u8>,
}

impl RequestParser {
    pub fn new() -> RequestParser {
        RequestParser::default()
    }

    /// Feed bytes; on `Good` the request is filled in and the remainder
    /// returned.
    pub fn parse(&mut self, request: &mut Request, bytes: &[u8]) -> Parse {
        self.buffer.extend_from_slice(bytes);
        let Some(end) = head_end(&self.buffer) else {
            return Parse::Indeterminate;
        };
        let head = match std::str::from_utf8(&self.buffer[..end]) {
            Ok(head) => head,
            Err(_) => return Parse::Bad,
        };
        let mut lines = head.lines();
        let Some(request_line) = lines.next() else {
            return Parse::Bad;
        };
        let mut parts = request_line.split_whitespace();
        let (Some(method), Some(uri), Some(version)) = (parts.next(), parts.next(), parts.next())
        else {
            return Parse::Bad;
        };
        let Some((major, minor)) = parse_http_version(version) else {
            return Parse::Bad;
        };
        request.method = method.to_string();
        request.uri = uri.to_string();
        request.version_major = major;
        request.version_minor = minor;
        if !parse_headers(lines, &mut request.headers) {
            return Parse::Bad;
        }
        let rest = self.buffer[end..].to_vec();
        self.buffer.clear();
        Parse::Good(rest)
    }
}

/// Incremental response-head parser.
#[derive(Default)]
pub struct ResponseParser {
    buffer: Vec<u8>,
}

impl ResponseParser {
    pub fn new() -> ResponseParser {
        ResponseParser::default()
    }

    pub fn parse(&mut self, response: &mut Response, bytes: &[u8]) -> Parse {
        self.buffer.extend_from_slice(bytes);
        let Some(end) = head_end(&self.buffer) else {
            return Parse::Indeterminate;
        };
        let head = match std::str::from_utf8(&self.buffer[..end]) {
            Ok(head) => head,
            Err(_) => return Parse::Bad,
        };
        let mut lines = head.lines();
        let Some(status_line) = lines.next() else {
            return Parse::Bad;
        };
        let mut parts = status_line.split_whitespace();
        let (Some(version), Some(status)) = (parts.next(), parts.next()) else {
            return Parse::Bad;
        };
        let Some((major, minor)) = parse_http_version(version) else {
            return Parse::Bad;
        };
        let Ok(status) = status.parse::<u16>() else {
            return Parse::Bad;
        };
        response.status = status;
        response.version_major = major;
        response.version_minor = minor;
        if !parse_headers(lines, &mut response.headers) {
            return Parse::Bad;
        }
        let rest = self.buffer[end..].to_vec();
        self.buffer.clear();
        Parse::Good(rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let mut req = Request::new();
        req.method = "GET".to_string();
        req.uri = "/chat".to_string();
        req.set_header("Host", "example.com");
        req.set_header("Upgrade", "websocket");
        let wire = req.to_wire();

        let mut parsed = Request::new();
        let mut parser = RequestParser::new();
        match parser.parse(&mut parsed, wire.as_bytes()) {
            Parse::Good(rest) => assert!(rest.is_empty()),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(parsed.method, "GET");
        assert_eq!(parsed.uri, "/chat");
        assert_eq!(parsed.get_header("host"), Some("example.com"));
    }

    #[test]
    fn partial_head_is_indeterminate() {
        let mut parser = RequestParser::new();
        let mut req = Request::new();
        assert_eq!(
            parser.parse(&mut req, b"GET / HTTP/1.1\r\nHos"),
            Parse::Indeterminate
        );
        match parser.parse(&mut req, b"t: a\r\n\r\n") {
            Parse::Good(rest) => assert!(rest.is_empty()),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(req.get_header("Host"), Some("a"));
    }

    #[test]
    fn trailing_bytes_are_returned() {
        let mut parser = ResponseParser::new();
        let mut res = Response::new();
        let wire = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n\x81\x02hi";
        match parser.parse(&mut res, wire) {
            Parse::Good(rest) => assert_eq!(rest, b"\x81\x02hi"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(res.status, 101);
    }

    #[test]
    fn malformed_request_line_is_bad() {
        let mut parser = RequestParser::new();
        let mut req = Request::new();
        assert_eq!(parser.parse(&mut req, b"NONSENSE\r\n\r\n"), Parse::Bad);
    }

    #[test]
    fn header_set_replaces() {
        let mut req = Request::new();
        req.set_header("Connection", "close");
        req.set_header("connection", "Upgrade");
        assert_eq!(req.get_header("Connection"), Some("Upgrade"));
        assert_eq!(req.headers().count(), 1);
    }

    #[test]
    fn websocket_upgrade_detection() {
        let mut req = Request::new();
        req.method = "GET".to_string();
        req.set_header("Connection", "keep-alive, Upgrade");
        req.set_header("Upgrade", "websocket");
        assert!(req.is_websocket_upgrade());

        req.method = "POST".to_string();
        assert!(!req.is_websocket_upgrade());
    }
}
