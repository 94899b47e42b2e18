use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};

use crate::request::Method;

pub const DEFAULT_INDEX_NAME: &str = "index.html";
const DEFAULT_PORT: u16 = 80;
const MAX_BODY_SIZE_CAP: u64 = 10 * 1024 * 1024 * 1024;

/// The full configuration: one `ServerBlock` per `server { }` block,
/// immutable after parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub servers: Vec<ServerBlock>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerBlock {
    pub host: Ipv4Addr,
    pub port: u16,
    pub root: String,
    pub index: Vec<String>,
    /// Maximum request body size in bytes; 0 means unlimited.
    pub max_body_size: u64,
    pub autoindex: bool,
    pub error_pages: Vec<ErrorPage>,
    pub locations: Vec<LocationBlock>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorPage {
    pub codes: Vec<u16>,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocationBlock {
    /// Path prefix, normalized: no trailing slash except for "/" itself.
    pub path: String,
    pub root: Option<String>,
    pub index: Vec<String>,
    pub autoindex: Option<bool>,
    /// Empty means every method is allowed.
    pub allowed_methods: Vec<Method>,
    /// `return` directive: respond 302 with this URL.
    pub redirect: Option<String>,
    /// Parallel lists: the i-th extension is run by the i-th interpreter.
    pub cgi_extensions: Vec<String>,
    pub cgi_interpreters: Vec<String>,
    pub upload_store: Option<String>,
}

impl ServerBlock {
    fn new() -> Self {
        Self {
            host: Ipv4Addr::new(0, 0, 0, 0),
            port: DEFAULT_PORT,
            root: String::new(),
            index: Vec::new(),
            max_body_size: 0,
            autoindex: false,
            error_pages: Vec::new(),
            locations: Vec::new(),
        }
    }

    /// Pick the location with the longest matching path prefix.
    pub fn match_location(&self, path: &str) -> Option<usize> {
        let mut best: Option<usize> = None;
        let mut best_len = 0;
        for (index, location) in self.locations.iter().enumerate() {
            if location.matches(path) && location.path.len() > best_len {
                best = Some(index);
                best_len = location.path.len();
            }
        }
        best
    }

    /// Root for a request, with the location override applied. `None` when
    /// the effective root is empty.
    pub fn effective_root<'a>(&'a self, location: Option<&'a LocationBlock>) -> Option<&'a str> {
        let root = location
            .and_then(|location| location.root.as_deref())
            .unwrap_or(&self.root);
        if root.is_empty() {
            None
        } else {
            Some(root)
        }
    }

    pub fn effective_index<'a>(&'a self, location: Option<&'a LocationBlock>) -> &'a [String] {
        match location {
            Some(location) if !location.index.is_empty() => &location.index,
            _ => &self.index,
        }
    }

    pub fn effective_autoindex(&self, location: Option<&LocationBlock>) -> bool {
        location
            .and_then(|location| location.autoindex)
            .unwrap_or(self.autoindex)
    }
}

impl LocationBlock {
    fn new(path: String) -> Self {
        Self {
            path,
            root: None,
            index: Vec::new(),
            autoindex: None,
            allowed_methods: Vec::new(),
            redirect: None,
            cgi_extensions: Vec::new(),
            cgi_interpreters: Vec::new(),
            upload_store: None,
        }
    }

    /// A path matches if the location is "/", if it equals the location
    /// path, or if the next character after the prefix is a slash.
    fn matches(&self, path: &str) -> bool {
        if self.path == "/" {
            return path.starts_with('/');
        }
        if !path.starts_with(self.path.as_str()) {
            return false;
        }
        path.len() == self.path.len() || path.as_bytes()[self.path.len()] == b'/'
    }
}

/// Load and parse a configuration file.
pub fn load(path: &str) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path))?;
    parse(&text).with_context(|| format!("failed to parse config file {}", path))
}

pub fn parse(text: &str) -> Result<Config> {
    let tokens = tokenize(text)?;
    Parser::new(tokens).parse()
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Word,
    LeftBrace,
    RightBrace,
    Semicolon,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    text: String,
    line: usize,
}

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    let mut line = 1;

    while let Some(&c) = chars.peek() {
        match c {
            '\n' => {
                line += 1;
                chars.next();
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            '#' => {
                // line comment
                while let Some(&c) = chars.peek() {
                    if c == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            '{' => {
                chars.next();
                tokens.push(Token {
                    kind: TokenKind::LeftBrace,
                    text: "{".to_string(),
                    line,
                });
            }
            '}' => {
                chars.next();
                tokens.push(Token {
                    kind: TokenKind::RightBrace,
                    text: "}".to_string(),
                    line,
                });
            }
            ';' => {
                chars.next();
                tokens.push(Token {
                    kind: TokenKind::Semicolon,
                    text: ";".to_string(),
                    line,
                });
            }
            quote @ '"' | quote @ '\'' => {
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some(c) if c == quote => break,
                        Some('\n') | None => {
                            return Err(anyhow!("unterminated string at line {}", line))
                        }
                        Some(c) => text.push(c),
                    }
                }
                tokens.push(Token {
                    kind: TokenKind::Word,
                    text,
                    line,
                });
            }
            _ => {
                let mut text = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || matches!(c, '{' | '}' | ';' | '#' | '"' | '\'') {
                        break;
                    }
                    text.push(c);
                    chars.next();
                }
                tokens.push(Token {
                    kind: TokenKind::Word,
                    text,
                    line,
                });
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    current: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, current: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.current)
    }

    fn line(&self) -> usize {
        self.peek()
            .map(|token| token.line)
            .or_else(|| self.tokens.last().map(|token| token.line))
            .unwrap_or(1)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.current).cloned();
        if token.is_some() {
            self.current += 1;
        }
        token
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<Token> {
        let line = self.line();
        match self.advance() {
            Some(token) if token.kind == kind => Ok(token),
            _ => Err(anyhow!("expected {} at line {}", what, line)),
        }
    }

    fn expect_word(&mut self, what: &str) -> Result<Token> {
        self.expect(TokenKind::Word, what)
    }

    /// Consume one or more words, up to the next `;`.
    fn word_list(&mut self, what: &str) -> Result<Vec<String>> {
        let mut words = Vec::new();
        while let Some(token) = self.peek() {
            if token.kind != TokenKind::Word {
                break;
            }
            words.push(self.advance().unwrap().text);
        }
        if words.is_empty() {
            return Err(anyhow!("expected {} at line {}", what, self.line()));
        }
        self.expect(TokenKind::Semicolon, "';'")?;
        Ok(words)
    }

    fn parse(mut self) -> Result<Config> {
        let mut servers = Vec::new();
        while let Some(token) = self.peek() {
            if token.kind == TokenKind::Word && token.text == "server" {
                self.advance();
                servers.push(self.parse_server_block()?);
            } else {
                return Err(anyhow!(
                    "expected 'server' keyword at line {}",
                    token.line
                ));
            }
        }
        if servers.is_empty() {
            return Err(anyhow!("configuration declares no server blocks"));
        }
        Ok(Config { servers })
    }

    fn parse_server_block(&mut self) -> Result<ServerBlock> {
        self.expect(TokenKind::LeftBrace, "'{' after 'server'")?;
        let mut server = ServerBlock::new();
        let mut seen_max_body_size = false;

        loop {
            let token = match self.peek() {
                Some(token) => token.clone(),
                None => return Err(anyhow!("unexpected end of file in server block")),
            };
            match token.kind {
                TokenKind::RightBrace => {
                    self.advance();
                    break;
                }
                TokenKind::Word => {
                    self.advance();
                    match token.text.as_str() {
                        "host" => {
                            let word = self.expect_word("IPv4 address after 'host'")?;
                            server.host = parse_ipv4(&word.text).ok_or_else(|| {
                                anyhow!("invalid IPv4 address `{}' at line {}", word.text, word.line)
                            })?;
                            self.expect(TokenKind::Semicolon, "';' after host directive")?;
                        }
                        "port" => {
                            let word = self.expect_word("port number after 'port'")?;
                            server.port = parse_port(&word.text).ok_or_else(|| {
                                anyhow!("invalid port number `{}' at line {}", word.text, word.line)
                            })?;
                            self.expect(TokenKind::Semicolon, "';' after port directive")?;
                        }
                        "root" => {
                            let word = self.expect_word("path after 'root'")?;
                            server.root = word.text;
                            self.expect(TokenKind::Semicolon, "';' after root directive")?;
                        }
                        "index" => {
                            server.index = self.word_list("at least one file after 'index'")?;
                        }
                        "client_max_body_size" => {
                            if seen_max_body_size {
                                return Err(anyhow!(
                                    "duplicate 'client_max_body_size' directive at line {}",
                                    token.line
                                ));
                            }
                            seen_max_body_size = true;
                            let word =
                                self.expect_word("size after 'client_max_body_size'")?;
                            server.max_body_size =
                                parse_size_literal(&word.text).ok_or_else(|| {
                                    anyhow!(
                                        "invalid size `{}' at line {}",
                                        word.text,
                                        word.line
                                    )
                                })?;
                            if server.max_body_size > MAX_BODY_SIZE_CAP {
                                return Err(anyhow!(
                                    "'client_max_body_size' exceeds allowed limit at line {}",
                                    word.line
                                ));
                            }
                            self.expect(
                                TokenKind::Semicolon,
                                "';' after client_max_body_size directive",
                            )?;
                        }
                        "autoindex" => {
                            server.autoindex = self.parse_on_off()?;
                        }
                        "error_page" => {
                            server.error_pages.push(self.parse_error_page()?);
                        }
                        "location" => {
                            server.locations.push(self.parse_location_block()?);
                        }
                        other => {
                            return Err(anyhow!(
                                "unknown directive `{}' in server block at line {}",
                                other,
                                token.line
                            ));
                        }
                    }
                }
                _ => {
                    return Err(anyhow!(
                        "unexpected `{}' in server block at line {}",
                        token.text,
                        token.line
                    ));
                }
            }
        }
        Ok(server)
    }

    fn parse_on_off(&mut self) -> Result<bool> {
        let word = self.expect_word("'on' or 'off' after 'autoindex'")?;
        let value = match word.text.as_str() {
            "on" => true,
            "off" => false,
            other => {
                return Err(anyhow!(
                    "invalid value `{}' for 'autoindex' at line {}",
                    other,
                    word.line
                ))
            }
        };
        self.expect(TokenKind::Semicolon, "';' after autoindex directive")?;
        Ok(value)
    }

    fn parse_error_page(&mut self) -> Result<ErrorPage> {
        let words = self.word_list("status codes and a URI after 'error_page'")?;
        if words.len() < 2 {
            return Err(anyhow!(
                "'error_page' needs at least one status code and a URI at line {}",
                self.line()
            ));
        }
        let uri = words.last().unwrap().clone();
        let mut codes = Vec::new();
        for word in &words[..words.len() - 1] {
            let code: u16 = word
                .parse()
                .ok()
                .filter(|code| (100..=599).contains(code))
                .ok_or_else(|| {
                    anyhow!("invalid status code `{}' in error_page directive", word)
                })?;
            codes.push(code);
        }
        Ok(ErrorPage { codes, uri })
    }

    fn parse_location_block(&mut self) -> Result<LocationBlock> {
        let word = self.expect_word("path after 'location'")?;
        let mut location = LocationBlock::new(normalize_location_path(&word.text));
        self.expect(TokenKind::LeftBrace, "'{' after location path")?;

        loop {
            let token = match self.peek() {
                Some(token) => token.clone(),
                None => return Err(anyhow!("unexpected end of file in location block")),
            };
            match token.kind {
                TokenKind::RightBrace => {
                    self.advance();
                    break;
                }
                TokenKind::Word => {
                    self.advance();
                    match token.text.as_str() {
                        "root" => {
                            let word = self.expect_word("path after 'root'")?;
                            location.root = Some(word.text);
                            self.expect(TokenKind::Semicolon, "';' after root directive")?;
                        }
                        "index" => {
                            location.index =
                                self.word_list("at least one file after 'index'")?;
                        }
                        "autoindex" => {
                            location.autoindex = Some(self.parse_on_off()?);
                        }
                        "allowed_methods" => {
                            let words =
                                self.word_list("at least one method after 'allowed_methods'")?;
                            let mut methods = Vec::new();
                            for word in words {
                                let method = Method::from_token(&word).ok_or_else(|| {
                                    anyhow!(
                                        "unsupported method `{}' at line {}",
                                        word,
                                        token.line
                                    )
                                })?;
                                if !methods.contains(&method) {
                                    methods.push(method);
                                }
                            }
                            location.allowed_methods = methods;
                        }
                        "return" => {
                            let word = self.expect_word("URL after 'return'")?;
                            location.redirect = Some(word.text);
                            self.expect(TokenKind::Semicolon, "';' after return directive")?;
                        }
                        "cgi_extension" => {
                            location.cgi_extensions = self
                                .word_list("at least one extension after 'cgi_extension'")?;
                        }
                        "cgi_path" => {
                            location.cgi_interpreters =
                                self.word_list("at least one interpreter after 'cgi_path'")?;
                        }
                        "upload_store" => {
                            let word = self.expect_word("path after 'upload_store'")?;
                            location.upload_store = Some(word.text);
                            self.expect(
                                TokenKind::Semicolon,
                                "';' after upload_store directive",
                            )?;
                        }
                        other => {
                            return Err(anyhow!(
                                "unknown directive `{}' in location block at line {}",
                                other,
                                token.line
                            ));
                        }
                    }
                }
                _ => {
                    return Err(anyhow!(
                        "unexpected `{}' in location block at line {}",
                        token.text,
                        token.line
                    ));
                }
            }
        }

        if location.cgi_extensions.len() != location.cgi_interpreters.len() {
            return Err(anyhow!(
                "'cgi_extension' and 'cgi_path' must have the same number of entries \
                 in location {}",
                location.path
            ));
        }
        Ok(location)
    }
}

/// Strict dotted-quad check: four octets 0-255, no leading zeros.
fn parse_ipv4(text: &str) -> Option<Ipv4Addr> {
    let octets: Vec<&str> = text.split('.').collect();
    if octets.len() != 4 {
        return None;
    }
    for octet in &octets {
        if octet.is_empty() || octet.len() > 3 {
            return None;
        }
        if !octet.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if octet.len() > 1 && octet.starts_with('0') {
            return None;
        }
        if octet.parse::<u32>().ok()? > 255 {
            return None;
        }
    }
    Ipv4Addr::from_str(text).ok()
}

fn parse_port(text: &str) -> Option<u16> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse::<u16>().ok().filter(|port| *port >= 1)
}

/// Parse a size literal: digits with an optional K/M/G suffix. A bare
/// number is taken as bytes.
fn parse_size_literal(text: &str) -> Option<u64> {
    if text.is_empty() {
        return None;
    }
    let (digits, multiplier) = match text.as_bytes()[text.len() - 1] {
        b'K' => (&text[..text.len() - 1], 1024),
        b'M' => (&text[..text.len() - 1], 1024 * 1024),
        b'G' => (&text[..text.len() - 1], 1024 * 1024 * 1024),
        _ => (text, 1),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u64>().ok()?.checked_mul(multiplier)
}

fn normalize_location_path(path: &str) -> String {
    let mut path = path.to_string();
    while path.len() > 1 && path.ends_with('/') {
        path.pop();
    }
    path
}

/// Quote a word for serialization when it would not survive the lexer
/// bare.
fn join_quoted(words: &[String]) -> String {
    let words: Vec<String> = words.iter().map(|word| quoted(word)).collect();
    words.join(" ")
}

fn quoted(word: &str) -> String {
    let needs_quotes = word.is_empty()
        || word
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, ';' | '{' | '}' | '#' | '"' | '\''));
    if !needs_quotes {
        word.to_string()
    } else if !word.contains('"') {
        format!("\"{}\"", word)
    } else {
        format!("'{}'", word)
    }
}

/// Render a size in bytes back to the shortest exact literal.
fn size_literal(bytes: u64) -> String {
    const G: u64 = 1024 * 1024 * 1024;
    const M: u64 = 1024 * 1024;
    const K: u64 = 1024;
    if bytes > 0 && bytes % G == 0 {
        format!("{}G", bytes / G)
    } else if bytes > 0 && bytes % M == 0 {
        format!("{}M", bytes / M)
    } else if bytes > 0 && bytes % K == 0 {
        format!("{}K", bytes / K)
    } else {
        format!("{}", bytes)
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for server in &self.servers {
            write!(f, "{}", server)?;
        }
        Ok(())
    }
}

impl fmt::Display for ServerBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "server {{")?;
        writeln!(f, "    host {};", self.host)?;
        writeln!(f, "    port {};", self.port)?;
        if !self.root.is_empty() {
            writeln!(f, "    root {};", quoted(&self.root))?;
        }
        if !self.index.is_empty() {
            writeln!(f, "    index {};", join_quoted(&self.index))?;
        }
        if self.max_body_size != 0 {
            writeln!(
                f,
                "    client_max_body_size {};",
                size_literal(self.max_body_size)
            )?;
        }
        if self.autoindex {
            writeln!(f, "    autoindex on;")?;
        }
        for page in &self.error_pages {
            let codes: Vec<String> = page.codes.iter().map(|code| code.to_string()).collect();
            writeln!(f, "    error_page {} {};", codes.join(" "), quoted(&page.uri))?;
        }
        for location in &self.locations {
            write!(f, "{}", location)?;
        }
        writeln!(f, "}}")
    }
}

impl fmt::Display for LocationBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "    location {} {{", quoted(&self.path))?;
        if let Some(root) = &self.root {
            writeln!(f, "        root {};", quoted(root))?;
        }
        if !self.index.is_empty() {
            writeln!(f, "        index {};", join_quoted(&self.index))?;
        }
        if let Some(autoindex) = self.autoindex {
            writeln!(
                f,
                "        autoindex {};",
                if autoindex { "on" } else { "off" }
            )?;
        }
        if !self.allowed_methods.is_empty() {
            let methods: Vec<&str> = self
                .allowed_methods
                .iter()
                .map(|method| method.as_str())
                .collect();
            writeln!(f, "        allowed_methods {};", methods.join(" "))?;
        }
        if let Some(redirect) = &self.redirect {
            writeln!(f, "        return {};", quoted(redirect))?;
        }
        if !self.cgi_extensions.is_empty() {
            writeln!(f, "        cgi_extension {};", join_quoted(&self.cgi_extensions))?;
            writeln!(f, "        cgi_path {};", join_quoted(&self.cgi_interpreters))?;
        }
        if let Some(upload_store) = &self.upload_store {
            writeln!(f, "        upload_store {};", quoted(upload_store))?;
        }
        writeln!(f, "    }}")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use test_case::test_case;

    const FULL_CONFIG: &str = r#"
# demo configuration
server {
    host 127.0.0.1;
    port 8080;
    root www;
    index index.html index.htm;
    client_max_body_size 10M;
    error_page 404 /errors/404.html;
    error_page 500 502 504 /errors/50x.html;
    location / {
        allowed_methods GET;
    }
    location /upload/ {
        allowed_methods POST DELETE;
        upload_store /tmp/uploads;
    }
    location /cgi-bin {
        cgi_extension .py .sh;
        cgi_path /usr/bin/python3 /bin/sh;
        autoindex on;
    }
    location /old {
        return "http://example.com/new";
    }
}
server {
    host 0.0.0.0;
    port 9090;
    root 'web root';
    autoindex on;
}
"#;

    #[test]
    fn parse_full_config() {
        let config = parse(FULL_CONFIG).unwrap();
        assert_eq!(config.servers.len(), 2);

        let server = &config.servers[0];
        assert_eq!(server.host, Ipv4Addr::new(127, 0, 0, 1));
        assert_eq!(server.port, 8080);
        assert_eq!(server.root, "www");
        assert_eq!(server.index, vec!["index.html", "index.htm"]);
        assert_eq!(server.max_body_size, 10 * 1024 * 1024);
        assert_eq!(server.error_pages.len(), 2);
        assert_eq!(server.error_pages[1].codes, vec![500, 502, 504]);
        assert_eq!(server.error_pages[1].uri, "/errors/50x.html");
        assert_eq!(server.locations.len(), 4);

        // trailing slash is normalized away
        assert_eq!(server.locations[1].path, "/upload");
        assert_eq!(
            server.locations[1].allowed_methods,
            vec![Method::Post, Method::Delete]
        );
        assert_eq!(
            server.locations[2].cgi_interpreters,
            vec!["/usr/bin/python3", "/bin/sh"]
        );
        assert_eq!(
            server.locations[3].redirect.as_deref(),
            Some("http://example.com/new")
        );

        let second = &config.servers[1];
        assert_eq!(second.host, Ipv4Addr::new(0, 0, 0, 0));
        assert_eq!(second.root, "web root");
        assert!(second.autoindex);
    }

    #[test]
    fn round_trip_is_identity() {
        let config = parse(FULL_CONFIG).unwrap();
        let rendered = config.to_string();
        let reparsed = parse(&rendered).unwrap();
        assert_eq!(config, reparsed);
    }

    #[test_case("server { port 0; }" ; "port zero")]
    #[test_case("server { port 65536; }" ; "port too large")]
    #[test_case("server { host 256.1.1.1; }" ; "octet out of range")]
    #[test_case("server { host 01.2.3.4; }" ; "leading zero octet")]
    #[test_case("server { host 1.2.3; }" ; "too few octets")]
    #[test_case("server { client_max_body_size 1M; client_max_body_size 2M; }" ; "duplicate body size")]
    #[test_case("server { client_max_body_size M; }" ; "size without digits")]
    #[test_case("server { location / { cgi_extension .py; } }" ; "cgi arity mismatch")]
    #[test_case("server { location / { allowed_methods PUT; } }" ; "unsupported method")]
    #[test_case("server { frobnicate on; }" ; "unknown directive")]
    #[test_case("server {" ; "unterminated block")]
    #[test_case("upstream { }" ; "not a server block")]
    #[test_case("" ; "empty file")]
    fn parse_rejects(input: &str) {
        assert!(parse(input).is_err());
    }

    #[test]
    fn size_literals() {
        assert_eq!(parse_size_literal("4"), Some(4));
        assert_eq!(parse_size_literal("8K"), Some(8 * 1024));
        assert_eq!(parse_size_literal("3M"), Some(3 * 1024 * 1024));
        assert_eq!(parse_size_literal("1G"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_size_literal(""), None);
        assert_eq!(parse_size_literal("12Q"), None);
        assert_eq!(parse_size_literal("1.5M"), None);
    }

    #[test]
    fn location_matching() {
        let config = parse(
            "server { root www; \
             location / { } \
             location /api { } \
             location /api/v2/ { } }",
        )
        .unwrap();
        let server = &config.servers[0];

        let for_path = |path: &str| {
            server
                .match_location(path)
                .map(|index| server.locations[index].path.as_str())
        };
        assert_eq!(for_path("/"), Some("/"));
        assert_eq!(for_path("/index.html"), Some("/"));
        assert_eq!(for_path("/api"), Some("/api"));
        assert_eq!(for_path("/api/users"), Some("/api"));
        assert_eq!(for_path("/api/v2/users"), Some("/api/v2"));
        // prefix must end on a path boundary
        assert_eq!(for_path("/apiary"), Some("/"));
    }

    #[test]
    fn comments_and_quotes() {
        let config = parse(
            "# leading comment\n\
             server { # trailing comment\n\
             root \"spaced out\"; port 81;\n\
             }\n",
        )
        .unwrap();
        assert_eq!(config.servers[0].root, "spaced out");
        assert_eq!(config.servers[0].port, 81);
    }
}
