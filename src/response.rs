use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use chrono::{Local, TimeZone, Utc};
use once_cell::sync::Lazy;

use crate::config::ServerBlock;
use crate::mime::MimeMap;
use crate::request::Method;

static REASON_PHRASES: Lazy<HashMap<u16, &'static str>> = Lazy::new(|| {
    let mut phrases = HashMap::new();
    phrases.insert(200, "OK");
    phrases.insert(201, "Created");
    phrases.insert(301, "Moved Permanently");
    phrases.insert(302, "Found");
    phrases.insert(400, "Bad Request");
    phrases.insert(403, "Forbidden");
    phrases.insert(404, "Not Found");
    phrases.insert(405, "Method Not Allowed");
    phrases.insert(408, "Request Timeout");
    phrases.insert(411, "Length Required");
    phrases.insert(413, "Payload Too Large");
    phrases.insert(414, "URI Too Long");
    phrases.insert(431, "Request Header Fields Too Large");
    phrases.insert(500, "Internal Server Error");
    phrases.insert(501, "Not Implemented");
    phrases.insert(502, "Bad Gateway");
    phrases.insert(504, "Gateway Timeout");
    phrases
});

pub fn reason_phrase(status: u16) -> &'static str {
    REASON_PHRASES.get(&status).copied().unwrap_or("Unknown")
}

/// Everything that terminates a request pipeline short of success. Each
/// kind selects the response status.
#[derive(Debug, Clone, PartialEq)]
pub enum HttpError {
    BadRequest,
    Forbidden,
    NotFound,
    MethodNotAllowed(Vec<Method>),
    RequestTimeout,
    LengthRequired,
    PayloadTooLarge,
    UriTooLong,
    HeaderTooLarge,
    Internal,
    NotImplemented,
    BadGateway,
    GatewayTimeout,
}

impl HttpError {
    pub fn status(&self) -> u16 {
        match self {
            HttpError::BadRequest => 400,
            HttpError::Forbidden => 403,
            HttpError::NotFound => 404,
            HttpError::MethodNotAllowed(_) => 405,
            HttpError::RequestTimeout => 408,
            HttpError::LengthRequired => 411,
            HttpError::PayloadTooLarge => 413,
            HttpError::UriTooLong => 414,
            HttpError::HeaderTooLarge => 431,
            HttpError::Internal => 500,
            HttpError::NotImplemented => 501,
            HttpError::BadGateway => 502,
            HttpError::GatewayTimeout => 504,
        }
    }

    fn detail(&self) -> &'static str {
        match self {
            HttpError::BadRequest => "You sent a request that the server couldn't understand.",
            HttpError::Forbidden => "You don't have permission to access this URL.",
            HttpError::NotFound => "The URL you requested was not found.",
            HttpError::MethodNotAllowed(_) => "The method is not allowed for this URL.",
            HttpError::RequestTimeout => "The connection was idle for too long.",
            HttpError::LengthRequired => "Your request did not declare a body length.",
            HttpError::PayloadTooLarge => "Your request body exceeds the configured limit.",
            HttpError::UriTooLong => "The URL you requested is too long.",
            HttpError::HeaderTooLarge => "Your request headers are too large.",
            HttpError::Internal => "The URL you requested cannot be returned.",
            HttpError::NotImplemented => "The method you specified is not implemented.",
            HttpError::BadGateway => "The gateway program produced no usable output.",
            HttpError::GatewayTimeout => "The gateway program took too long to respond.",
        }
    }
}

#[derive(Debug)]
pub enum Body {
    Bytes(Vec<u8>),
    File { file: File, len: u64 },
}

/// A response under construction: status, headers in insertion order, and
/// a body that is either in memory or an open file streamed later.
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    headers: Vec<(String, String)>,
    body: Body,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Body::Bytes(Vec::new()),
        }
    }

    pub fn header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub fn set_body(&mut self, body: Vec<u8>) {
        self.body = Body::Bytes(body);
    }

    pub fn html(status: u16, body: String) -> Self {
        let mut response = Self::new(status);
        response.header("Content-Type", "text/html; charset=UTF-8");
        response.set_body(body.into_bytes());
        response
    }

    pub fn text(status: u16, body: &str) -> Self {
        let mut response = Self::new(status);
        response.header("Content-Type", "text/plain; charset=UTF-8");
        response.set_body(body.as_bytes().to_vec());
        response
    }

    pub fn from_file(status: u16, file: File, len: u64, content_type: &str) -> Self {
        let mut response = Self::new(status);
        response.header("Content-Type", content_type);
        response.body = Body::File { file, len };
        response
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn content_length(&self) -> u64 {
        match &self.body {
            Body::Bytes(bytes) => bytes.len() as u64,
            Body::File { len, .. } => *len,
        }
    }

    /// Emit the header block; the body is handed back for the connection
    /// to drain or stream.
    pub fn into_wire(self, now: libc::time_t) -> (Vec<u8>, Body) {
        let mut head = format!(
            "HTTP/1.1 {} {}\r\n\
            Date: {}\r\n\
            Server: {}/{}\r\n",
            self.status,
            reason_phrase(self.status),
            HttpDate(now),
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
        );
        for (name, value) in &self.headers {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str(&format!(
            "Content-Length: {}\r\nConnection: close\r\n\r\n",
            self.content_length()
        ));
        (head.into_bytes(), self.body)
    }
}

/// "Generated by" footer for generated HTML bodies.
struct GeneratedOn;

impl std::fmt::Display for GeneratedOn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Generated by {}/{}\n",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        )
    }
}

/// Build the response for a failed request: the owning server's custom
/// error page when one matches and exists, the built-in template
/// otherwise.
pub fn error_response(error: &HttpError, server: &ServerBlock, mime_map: &MimeMap) -> Response {
    let status = error.status();
    let mut response = custom_error_page(status, server, mime_map)
        .unwrap_or_else(|| default_error_page(error));
    if let HttpError::MethodNotAllowed(allowed) = error {
        let methods: Vec<&str> = allowed.iter().map(|method| method.as_str()).collect();
        response.header("Allow", &methods.join(", "));
    }
    response
}

fn custom_error_page(
    status: u16,
    server: &ServerBlock,
    mime_map: &MimeMap,
) -> Option<Response> {
    let page = server
        .error_pages
        .iter()
        .find(|page| page.codes.contains(&status))?;
    if server.root.is_empty() {
        return None;
    }
    let path = format!("{}{}", server.root.trim_end_matches('/'), page.uri);
    let file = File::open(&path).ok()?;
    let metadata = file.metadata().ok()?;
    if !metadata.is_file() {
        return None;
    }
    Some(Response::from_file(
        status,
        file,
        metadata.len(),
        mime_map.content_type(&page.uri),
    ))
}

fn default_error_page(error: &HttpError) -> Response {
    let status = error.status();
    let reason = reason_phrase(status);
    Response::html(
        status,
        format!(
            "<html><head><title>{} {}</title></head><body>\n\
            <h1>{}</h1>\n\
            {}\n\
            <hr>\n\
            {}\
            </body></html>\n",
            status,
            reason,
            reason,
            error.detail(),
            GeneratedOn,
        ),
    )
}

/// A redirect reply.
pub fn redirect(status: u16, location: &str) -> Response {
    let mut response = Response::html(
        status,
        format!(
            "<html><head><title>{} {}</title></head><body>\n\
            <h1>{}</h1>\n\
            Moved to: <a href=\"{}\">{}</a>\n\
            <hr>\n\
            {}\
            </body></html>\n",
            status,
            reason_phrase(status),
            reason_phrase(status),
            location,
            location,
            GeneratedOn,
        ),
    );
    response.header("Location", location);
    response
}

/// Directory listing.
struct Listing(Vec<std::fs::DirEntry>);

impl std::fmt::Display for Listing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let max_len = self
            .0
            .iter()
            .map(|dir_entry| dir_entry.file_name().len())
            .max()
            .unwrap_or(2);

        write!(f, "<a href=\"..\">..</a>/\n")?;

        for dir_entry in &self.0 {
            let metadata = match dir_entry.metadata() {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };
            let name = dir_entry.file_name();
            write!(
                f,
                "<a href=\"{}\">{}</a>",
                UrlEncoded(&name.to_string_lossy()),
                HtmlEscaped(&name.to_string_lossy()),
            )?;
            if metadata.is_dir() {
                write!(f, "/\n")?;
            } else {
                let num_spaces = max_len - name.len();
                for _ in 0..num_spaces {
                    write!(f, " ")?;
                }
                write!(f, "{:10}\n", metadata.len())?;
            }
        }
        Ok(())
    }
}

/// A directory listing reply.
pub fn dir_listing(dir_path: &Path, request_path: &str) -> Result<Response, HttpError> {
    let mut entries: Vec<_> = std::fs::read_dir(dir_path)
        .map_err(|_| HttpError::Internal)?
        .filter_map(|entry| entry.ok())
        .collect();
    entries
        .as_mut_slice()
        .sort_by_key(|dir_entry| dir_entry.file_name());

    Ok(Response::html(
        200,
        format!(
            "<html>\n<head>\n<title>{}</title>\n\
            <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n\
            </head>\n<body>\n<h1>{}</h1>\n<tt><pre>\n\
            {}\
            </pre></tt>\n\
            <hr>\n\
            {}\
            </body>\n</html>\n",
            HtmlEscaped(request_path),
            HtmlEscaped(request_path),
            Listing(entries),
            GeneratedOn,
        ),
    ))
}

/// RFC1123 formatted date.
pub struct HttpDate(pub libc::time_t);

impl std::fmt::Display for HttpDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let datetime = Utc.timestamp(self.0, 0);
        write!(f, "{}", datetime.format("%a, %d %b %Y %H:%M:%S GMT"))
    }
}

/// Common Log Format (CLF) formatted date in local timezone.
pub struct ClfDate(pub libc::time_t);

impl std::fmt::Display for ClfDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let datetime = Local.timestamp(self.0, 0);
        write!(f, "{}", datetime.format("[%d/%b/%Y:%H:%M:%S %z]"))
    }
}

/// Encode string to be an RFC3986-compliant URL part.
pub struct UrlEncoded<'a>(pub &'a str);

impl<'a> std::fmt::Display for UrlEncoded<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for c in self.0.chars() {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~' | '/') {
                write!(f, "{}", c)?;
            } else {
                let mut buf = [0; 4];
                c.encode_utf8(&mut buf);
                for i in 0..c.len_utf8() {
                    write!(f, "%{:02X}", buf[i])?;
                }
            }
        }
        Ok(())
    }
}

/// Escape < > & ' " into HTML entities.
pub struct HtmlEscaped<'a>(pub &'a str);

impl<'a> std::fmt::Display for HtmlEscaped<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for c in self.0.chars() {
            match c {
                '<' => write!(f, "&lt;")?,
                '>' => write!(f, "&gt;")?,
                '&' => write!(f, "&amp;")?,
                '\'' => write!(f, "&apos;")?,
                '"' => write!(f, "&quot;")?,
                c => write!(f, "{}", c)?,
            }
        }
        Ok(())
    }
}

/// Encode string for logging. Logs should not contain control characters
/// or double quotes.
pub struct LogEncoded<'a>(pub &'a str);

impl<'a> std::fmt::Display for LogEncoded<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for c in self.0.chars() {
            if !c.is_ascii() || c.is_ascii_control() || c == '"' {
                let mut buf = [0; 4];
                c.encode_utf8(&mut buf);
                for i in 0..c.len_utf8() {
                    write!(f, "%{:02X}", buf[i])?;
                }
            } else {
                write!(f, "{}", c)?;
            }
        }
        Ok(())
    }
}
