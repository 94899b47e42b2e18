use std::collections::HashMap;
use std::fmt;

use crate::response::HttpError;

/// Longest accepted decoded request path.
pub const MAX_PATH_LEN: usize = 2048;

/// Largest accepted header section, terminator included.
pub const MAX_HEADER_BYTES: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Delete,
}

impl Method {
    pub fn from_token(token: &str) -> Option<Method> {
        match token {
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            "DELETE" => Some(Method::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully parsed request head. The parser never opens files, spawns
/// processes, or reads the body.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRequest {
    pub method: Method,
    /// Decoded path: percent-decoded, consecutive slashes collapsed.
    pub path: String,
    /// Raw request target as it appeared on the start line, for logging.
    pub target: String,
    pub version: String,
    /// Header map with lower-cased names.
    pub headers: HashMap<String, String>,
    /// Query component, kept raw.
    pub query: String,
    pub query_params: HashMap<String, String>,
    /// Index of the matched location in the owning server block, filled
    /// in by dispatch.
    pub location: Option<usize>,
}

impl ParsedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|value| value.as_str())
    }

    pub fn content_length(&self) -> Option<Result<u64, HttpError>> {
        self.header("content-length")
            .map(|value| value.trim().parse().map_err(|_| HttpError::BadRequest))
    }

    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .map_or(false, |value| value.trim().eq_ignore_ascii_case("chunked"))
    }
}

/// Parse the header section (everything before the `CRLF CRLF`
/// terminator, which the caller has already removed).
pub fn parse(head: &[u8]) -> Result<ParsedRequest, HttpError> {
    let text = std::str::from_utf8(head).map_err(|_| HttpError::BadRequest)?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next().ok_or(HttpError::BadRequest)?;
    let (method, target, version) = parse_request_line(request_line)?;

    let (raw_path, query) = match target.split_once('?') {
        Some((path, query)) => (path, query),
        None => (target, ""),
    };
    let decoded = String::from_utf8(url_decode(raw_path)).map_err(|_| HttpError::BadRequest)?;
    let path = collapse_slashes(&decoded);
    if path.len() > MAX_PATH_LEN {
        return Err(HttpError::UriTooLong);
    }

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let colon = line.find(':').ok_or(HttpError::BadRequest)?;
        let (name, rest) = line.split_at(colon);
        if name.is_empty() || name.chars().any(|c| c.is_ascii_whitespace()) {
            // forbids whitespace before the colon
            return Err(HttpError::BadRequest);
        }
        headers.insert(name.to_ascii_lowercase(), rest[1..].trim_start().to_string());
    }
    if !headers.contains_key("host") {
        return Err(HttpError::BadRequest);
    }

    Ok(ParsedRequest {
        method,
        path,
        target: target.to_string(),
        version: version.to_string(),
        headers,
        query: query.to_string(),
        query_params: parse_query(query),
        location: None,
    })
}

/// Early check on an incomplete request buffer: once the first line has
/// fully arrived it must look like a start line we could serve.
pub fn check_start_line(buf: &[u8]) -> Result<(), HttpError> {
    let end = match find(b"\r\n", buf) {
        Some(end) => end,
        None => return Ok(()), // first line still incomplete
    };
    let line = std::str::from_utf8(&buf[..end]).map_err(|_| HttpError::BadRequest)?;
    parse_request_line(line).map(|_| ())
}

fn parse_request_line(line: &str) -> Result<(Method, &str, &str), HttpError> {
    let mut parts = line.split(' ');
    let method_token = parts.next().filter(|s| !s.is_empty()).ok_or(HttpError::BadRequest)?;
    let target = parts.next().filter(|s| !s.is_empty()).ok_or(HttpError::BadRequest)?;
    let version = parts.next().filter(|s| !s.is_empty()).ok_or(HttpError::BadRequest)?;
    if parts.next().is_some() {
        return Err(HttpError::BadRequest);
    }
    if !target.starts_with('/') {
        return Err(HttpError::BadRequest);
    }
    if target.len() > MAX_PATH_LEN {
        return Err(HttpError::UriTooLong);
    }
    if !matches!(version, "HTTP/1.0" | "HTTP/1.1") {
        return Err(HttpError::BadRequest);
    }
    let method = match Method::from_token(method_token) {
        Some(method) => method,
        // a well-formed but unsupported method token gets 501
        None if method_token.bytes().all(|b| b.is_ascii_uppercase()) => {
            return Err(HttpError::NotImplemented)
        }
        None => return Err(HttpError::BadRequest),
    };
    Ok((method, target, version))
}

/// Decode %XX escapes; invalid escapes are passed through literally.
pub fn url_decode(s: &str) -> Vec<u8> {
    let url = s.as_bytes();
    let mut decoded = Vec::with_capacity(url.len());
    let mut i = 0;
    while i < url.len() {
        let c = url[i];
        if c == b'%'
            && i + 2 < url.len()
            && url[i + 1].is_ascii_hexdigit()
            && url[i + 2].is_ascii_hexdigit()
        {
            decoded.push(hex_to_digit(url[i + 1]) * 16 + hex_to_digit(url[i + 2]));
            i += 3;
        } else {
            decoded.push(c);
            i += 1;
        }
    }
    decoded
}

/// Convert hex digit to integer.
fn hex_to_digit(hex: u8) -> u8 {
    if hex >= b'A' && hex <= b'F' {
        hex - b'A' + 10
    } else if hex >= b'a' && hex <= b'f' {
        hex - b'a' + 10
    } else {
        hex - b'0'
    }
}

fn collapse_slashes(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut last_was_slash = false;
    for c in path.chars() {
        if c == '/' && last_was_slash {
            continue;
        }
        last_was_slash = c == '/';
        out.push(c);
    }
    if !out.starts_with('/') {
        out.insert(0, '/');
    }
    out
}

fn parse_query(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        params.insert(decode_component(key), decode_component(value));
    }
    params
}

fn decode_component(s: &str) -> String {
    String::from_utf8_lossy(&url_decode(s)).into_owned()
}

/// Return index of first occurrence of `needle` in `haystack`.
pub fn find(needle: &[u8], haystack: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    (0..=haystack.len() - needle.len()).find(|&i| haystack[i..].starts_with(needle))
}

#[cfg(test)]
mod test {
    use super::*;

    use test_case::test_case;

    fn parse_str(head: &str) -> Result<ParsedRequest, HttpError> {
        parse(head.as_bytes())
    }

    #[test]
    fn simple_get() {
        let request = parse_str("GET /index.html HTTP/1.1\r\nHost: example").unwrap();
        assert_eq!(request.method, Method::Get);
        assert_eq!(request.path, "/index.html");
        assert_eq!(request.version, "HTTP/1.1");
        assert_eq!(request.header("host"), Some("example"));
        assert!(request.query.is_empty());
    }

    #[test]
    fn header_names_are_case_folded() {
        let request =
            parse_str("GET / HTTP/1.1\r\nHoSt: x\r\nX-File-Name:  report.txt").unwrap();
        assert_eq!(request.header("host"), Some("x"));
        // leading whitespace in the value is trimmed
        assert_eq!(request.header("x-file-name"), Some("report.txt"));
    }

    #[test]
    fn query_is_split_and_parsed() {
        let request =
            parse_str("GET /search?q=crab%20cakes&page=2&flag HTTP/1.1\r\nHost: x").unwrap();
        assert_eq!(request.path, "/search");
        assert_eq!(request.query, "q=crab%20cakes&page=2&flag");
        assert_eq!(request.query_params.get("q").unwrap(), "crab cakes");
        assert_eq!(request.query_params.get("page").unwrap(), "2");
        assert_eq!(request.query_params.get("flag").unwrap(), "");
    }

    #[test]
    fn path_is_decoded_and_collapsed() {
        let request = parse_str("GET //a%20b///c HTTP/1.1\r\nHost: x").unwrap();
        assert_eq!(request.path, "/a b/c");
    }

    #[test_case("GET / HTTP/1.1\r\nBad Header: x\r\nHost: x" ; "space before colon")]
    #[test_case("GET / HTTP/1.1\r\nBad\t: x\r\nHost: x" ; "tab before colon")]
    #[test_case("GET / HTTP/1.1\r\nnocolon\r\nHost: x" ; "missing colon")]
    #[test_case("GET / HTTP/1.1\r\nUser-Agent: x" ; "missing host")]
    #[test_case("GET  / HTTP/1.1\r\nHost: x" ; "double space in start line")]
    #[test_case("GET / HTTP/2.0\r\nHost: x" ; "unsupported version")]
    #[test_case("GET relative HTTP/1.1\r\nHost: x" ; "target without slash")]
    #[test_case("GET / HTTP/1.1 extra\r\nHost: x" ; "extra start line token")]
    fn bad_requests(head: &str) {
        assert_eq!(parse_str(head), Err(HttpError::BadRequest));
    }

    #[test]
    fn unknown_method_is_not_implemented() {
        assert_eq!(
            parse_str("PATCH / HTTP/1.1\r\nHost: x"),
            Err(HttpError::NotImplemented)
        );
    }

    #[test]
    fn overlong_path_is_rejected() {
        let head = format!("GET /{} HTTP/1.1\r\nHost: x", "a".repeat(MAX_PATH_LEN));
        assert_eq!(parse_str(&head), Err(HttpError::UriTooLong));
    }

    #[test]
    fn start_line_check_waits_for_first_line() {
        assert_eq!(check_start_line(b"GET /part"), Ok(()));
        assert_eq!(check_start_line(b"GET /x HTTP/1.1\r\nHos"), Ok(()));
        assert_eq!(
            check_start_line(b"FROB /x HTTP/1.1\r\n"),
            Err(HttpError::NotImplemented)
        );
        assert_eq!(
            check_start_line(b"nonsense\r\n"),
            Err(HttpError::BadRequest)
        );
    }

    #[test]
    fn url_decode_works() {
        assert_eq!(url_decode("escape%28this%29name%09"), b"escape(this)name\t");
        assert_eq!(url_decode("edge%"), b"edge%");
        assert_eq!(url_decode("edge%2"), b"edge%2");
        assert_eq!(url_decode("edge%20"), b"edge ");
    }

    #[test]
    fn find_works() {
        assert_eq!(find(b"\r\n\r\n", b"abc\r\n\r\ndef"), Some(3));
        assert_eq!(find(b"\r\n\r\n", b"abc\r\n"), None);
        assert_eq!(find(b"", b"abc"), Some(0));
    }
}
