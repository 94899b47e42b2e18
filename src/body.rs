use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::request::find;
use crate::response::HttpError;

/// Bodies up to this size stay in memory until complete.
const SMALL_BODY_MAX: usize = 64 * 1024;

/// Part headers larger than this mean the peer is not speaking multipart.
const MAX_PART_HEADER: usize = 64 * 1024;

pub const DEFAULT_UPLOAD_NAME: &str = "post_body_default.txt";
pub const DEFAULT_CGI_BODY_NAME: &str = "cgi_post_data.txt";

#[derive(Debug, PartialEq)]
pub enum Progress {
    NeedsMore,
    Complete,
}

/// Incremental body decoder. Consumes from the connection's read buffer
/// and appends the decoded payload to `out`; undecodable carry-over stays
/// in the buffer for the next readable event.
#[derive(Debug)]
pub enum BodyDecoder {
    Lengthed { remaining: u64 },
    Chunked(ChunkDecoder),
}

impl BodyDecoder {
    pub fn lengthed(total: u64) -> Self {
        BodyDecoder::Lengthed { remaining: total }
    }

    pub fn chunked() -> Self {
        BodyDecoder::Chunked(ChunkDecoder::new())
    }

    pub fn feed(&mut self, input: &mut Vec<u8>, out: &mut Vec<u8>) -> Result<Progress, HttpError> {
        match self {
            BodyDecoder::Lengthed { remaining } => {
                let take = (*remaining).min(input.len() as u64) as usize;
                out.extend_from_slice(&input[..take]);
                *remaining -= take as u64;
                if *remaining == 0 {
                    // overrun is discarded
                    input.clear();
                    Ok(Progress::Complete)
                } else {
                    input.drain(..take);
                    Ok(Progress::NeedsMore)
                }
            }
            BodyDecoder::Chunked(decoder) => decoder.feed(input, out),
        }
    }
}

#[derive(Debug)]
enum ChunkState {
    SizeLine,
    Data { remaining: u64 },
    DataEnd,
    Trailer,
    Done,
}

/// State machine over the chunked transfer grammar: hex size line, data,
/// CRLF, repeated until a zero-size chunk and its trailer section.
#[derive(Debug)]
pub struct ChunkDecoder {
    state: ChunkState,
}

impl ChunkDecoder {
    fn new() -> Self {
        Self {
            state: ChunkState::SizeLine,
        }
    }

    fn feed(&mut self, input: &mut Vec<u8>, out: &mut Vec<u8>) -> Result<Progress, HttpError> {
        let mut pos = 0;
        loop {
            match &mut self.state {
                ChunkState::SizeLine => match find(b"\r\n", &input[pos..]) {
                    None => break, // size line not yet terminated
                    Some(end) => {
                        let size = parse_chunk_size(&input[pos..pos + end])?;
                        pos += end + 2;
                        self.state = if size == 0 {
                            ChunkState::Trailer
                        } else {
                            ChunkState::Data { remaining: size }
                        };
                    }
                },
                ChunkState::Data { remaining } => {
                    let avail = input.len() - pos;
                    if avail == 0 {
                        break;
                    }
                    let take = (*remaining).min(avail as u64) as usize;
                    out.extend_from_slice(&input[pos..pos + take]);
                    pos += take;
                    *remaining -= take as u64;
                    if *remaining == 0 {
                        self.state = ChunkState::DataEnd;
                    }
                }
                ChunkState::DataEnd => {
                    if input.len() - pos < 2 {
                        break;
                    }
                    if &input[pos..pos + 2] != b"\r\n" {
                        return Err(HttpError::BadRequest);
                    }
                    pos += 2;
                    self.state = ChunkState::SizeLine;
                }
                ChunkState::Trailer => match find(b"\r\n", &input[pos..]) {
                    None => break,
                    Some(0) => {
                        pos += 2;
                        self.state = ChunkState::Done;
                    }
                    Some(end) => {
                        // trailer header, accepted and discarded
                        pos += end + 2;
                    }
                },
                ChunkState::Done => break,
            }
        }
        if matches!(self.state, ChunkState::Done) {
            input.clear();
            Ok(Progress::Complete)
        } else {
            input.drain(..pos);
            Ok(Progress::NeedsMore)
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, HttpError> {
    // a chunk extension may follow the size after ';'
    let digits = match line.iter().position(|&b| b == b';') {
        Some(end) => &line[..end],
        None => line,
    };
    if digits.is_empty() || !digits.iter().all(|b| b.is_ascii_hexdigit()) {
        return Err(HttpError::BadRequest);
    }
    let text = std::str::from_utf8(digits).map_err(|_| HttpError::BadRequest)?;
    u64::from_str_radix(text, 16).map_err(|_| HttpError::BadRequest)
}

fn map_io(err: std::io::Error) -> HttpError {
    match err.kind() {
        std::io::ErrorKind::NotFound => HttpError::NotFound,
        std::io::ErrorKind::PermissionDenied => HttpError::Forbidden,
        _ => HttpError::Internal,
    }
}

/// Keep only the final path component of a client-supplied name.
fn sanitize_filename(name: &str) -> Option<String> {
    let name = name.trim().rsplit('/').next().unwrap_or("");
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name.to_string())
    }
}

/// Where the decoded body bytes go.
#[derive(Debug)]
pub enum BodySink {
    Multipart(MultipartSaver),
    UploadFile(FileSink),
    CgiTemp(CgiTempSink),
}

impl BodySink {
    pub fn feed(&mut self, data: &[u8]) -> Result<(), HttpError> {
        match self {
            BodySink::Multipart(saver) => saver.feed(data),
            BodySink::UploadFile(sink) => sink.feed(data),
            BodySink::CgiTemp(sink) => sink.feed(data),
        }
    }

    pub fn finish(&mut self) -> Result<(), HttpError> {
        match self {
            BodySink::Multipart(saver) => saver.finish(),
            BodySink::UploadFile(sink) => sink.finish(),
            BodySink::CgiTemp(sink) => sink.finish(),
        }
    }

    /// Undo a partial upload after an aborted body.
    pub fn discard(&mut self) {
        match self {
            BodySink::Multipart(saver) => saver.discard(),
            BodySink::UploadFile(sink) => sink.discard(),
            BodySink::CgiTemp(sink) => sink.discard(),
        }
    }

    pub fn cgi_body_path(&self) -> Option<&Path> {
        match self {
            BodySink::CgiTemp(sink) => Some(&sink.path),
            _ => None,
        }
    }
}

#[derive(Debug)]
enum MultipartState {
    PartHeaders,
    PartData,
    Done,
}

/// Streams the first part of a multipart/form-data body into the upload
/// store. Stateful across reads; boundaries may straddle read events.
#[derive(Debug)]
pub struct MultipartSaver {
    /// Boundary marker including the leading dashes.
    marker: Vec<u8>,
    dir: PathBuf,
    state: MultipartState,
    pending: Vec<u8>,
    file: Option<File>,
    pub file_path: Option<PathBuf>,
}

impl MultipartSaver {
    pub fn new(content_type: &str, dir: &Path) -> Result<Self, HttpError> {
        let boundary = extract_boundary(content_type).ok_or(HttpError::BadRequest)?;
        Ok(Self {
            marker: format!("--{}", boundary).into_bytes(),
            dir: dir.to_path_buf(),
            state: MultipartState::PartHeaders,
            pending: Vec::new(),
            file: None,
            file_path: None,
        })
    }

    fn feed(&mut self, data: &[u8]) -> Result<(), HttpError> {
        if matches!(self.state, MultipartState::Done) {
            return Ok(()); // bytes after the closing boundary are ignored
        }
        self.pending.extend_from_slice(data);

        if matches!(self.state, MultipartState::PartHeaders) {
            let (end, skip) = match find(b"\r\n\r\n", &self.pending) {
                Some(end) => (end, 4),
                None => match find(b"\n\n", &self.pending) {
                    Some(end) => (end, 2),
                    None => {
                        if self.pending.len() > MAX_PART_HEADER {
                            return Err(HttpError::BadRequest);
                        }
                        return Ok(());
                    }
                },
            };
            let name = extract_filename(&self.pending[..end])
                .unwrap_or_else(|| DEFAULT_UPLOAD_NAME.to_string());
            let path = self.dir.join(&name);
            self.file = Some(
                OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&path)
                    .map_err(map_io)?,
            );
            self.file_path = Some(path);
            self.pending.drain(..end + skip);
            self.state = MultipartState::PartData;
        }

        self.drain_data(false)
    }

    fn drain_data(&mut self, finishing: bool) -> Result<(), HttpError> {
        if !matches!(self.state, MultipartState::PartData) {
            return Ok(());
        }
        let file = self.file.as_mut().unwrap();
        if let Some(found) = find(&self.marker, &self.pending) {
            // cut the CRLF that precedes the boundary
            let mut end = found;
            if end >= 2 && &self.pending[end - 2..end] == b"\r\n" {
                end -= 2;
            } else if end >= 1 && self.pending[end - 1] == b'\n' {
                end -= 1;
            }
            file.write_all(&self.pending[..end]).map_err(map_io)?;
            self.pending.clear();
            self.state = MultipartState::Done;
        } else if finishing {
            // body ended without a closing boundary; keep what arrived
            file.write_all(&self.pending).map_err(map_io)?;
            self.pending.clear();
            self.state = MultipartState::Done;
        } else {
            // retain a tail that could be the start of a split boundary
            let keep = self.marker.len() + 2;
            if self.pending.len() > keep {
                let cut = self.pending.len() - keep;
                file.write_all(&self.pending[..cut]).map_err(map_io)?;
                self.pending.drain(..cut);
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), HttpError> {
        match self.state {
            MultipartState::PartHeaders => Err(HttpError::BadRequest),
            MultipartState::PartData => self.drain_data(true),
            MultipartState::Done => Ok(()),
        }
    }

    fn discard(&mut self) {
        if let Some(file) = &self.file {
            file.set_len(0).ok();
        }
    }
}

/// Extract the boundary parameter from a multipart Content-Type value.
fn extract_boundary(content_type: &str) -> Option<String> {
    let start = content_type.find("boundary=")? + "boundary=".len();
    let rest = &content_type[start..];
    let boundary = if rest.starts_with('"') {
        let rest = &rest[1..];
        match rest.find('"') {
            Some(end) => &rest[..end],
            None => rest,
        }
    } else {
        match rest.find(|c| matches!(c, ';' | ' ' | '\t')) {
            Some(end) => &rest[..end],
            None => rest,
        }
    };
    let boundary = boundary.trim();
    if boundary.is_empty() {
        None
    } else {
        Some(boundary.to_string())
    }
}

/// Extract the filename parameter from the part headers.
fn extract_filename(headers: &[u8]) -> Option<String> {
    let start = find(b"filename=\"", headers)? + "filename=\"".len();
    let end = find(b"\"", &headers[start..])?;
    let name = String::from_utf8_lossy(&headers[start..start + end]).into_owned();
    sanitize_filename(&name)
}

/// Sink for non-multipart POST bodies. Small bodies stay in memory and
/// are written once on completion; larger ones spill to disk as they
/// arrive.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    file: Option<File>,
    buffered: Vec<u8>,
}

impl FileSink {
    pub fn new(dir: &Path, name: &str) -> Self {
        Self {
            path: dir.join(name),
            file: None,
            buffered: Vec::new(),
        }
    }

    fn open(&mut self) -> Result<&mut File, HttpError> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&self.path)
                .map_err(map_io)?;
            self.file = Some(file);
        }
        Ok(self.file.as_mut().unwrap())
    }

    fn feed(&mut self, data: &[u8]) -> Result<(), HttpError> {
        if self.file.is_none() && self.buffered.len() + data.len() <= SMALL_BODY_MAX {
            self.buffered.extend_from_slice(data);
            return Ok(());
        }
        let buffered = std::mem::take(&mut self.buffered);
        let file = self.open()?;
        if !buffered.is_empty() {
            file.write_all(&buffered).map_err(map_io)?;
        }
        file.write_all(data).map_err(map_io)
    }

    fn finish(&mut self) -> Result<(), HttpError> {
        let buffered = std::mem::take(&mut self.buffered);
        let file = self.open()?;
        file.write_all(&buffered).map_err(map_io)
    }

    fn discard(&mut self) {
        self.buffered.clear();
        if let Some(file) = &self.file {
            file.set_len(0).ok();
        }
    }
}

/// Sink for CGI POST bodies: spooled under /tmp, later wired to the CGI
/// child's stdin.
#[derive(Debug)]
pub struct CgiTempSink {
    pub path: PathBuf,
    file: Option<File>,
}

impl CgiTempSink {
    pub fn new(file_name_header: Option<&str>) -> Self {
        let name = file_name_header
            .and_then(sanitize_filename)
            .unwrap_or_else(|| DEFAULT_CGI_BODY_NAME.to_string());
        Self {
            path: Path::new("/tmp").join(name),
            file: None,
        }
    }

    fn open(&mut self) -> Result<&mut File, HttpError> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&self.path)
                .map_err(map_io)?;
            self.file = Some(file);
        }
        Ok(self.file.as_mut().unwrap())
    }

    fn feed(&mut self, data: &[u8]) -> Result<(), HttpError> {
        self.open()?.write_all(data).map_err(map_io)
    }

    fn finish(&mut self) -> Result<(), HttpError> {
        // make sure the spool file exists even for an empty body
        self.open().map(|_| ())
    }

    fn discard(&mut self) {
        self.file = None;
        std::fs::remove_file(&self.path).ok();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use tempfile::tempdir;
    use test_case::test_case;

    fn feed_all(decoder: &mut BodyDecoder, input: &[u8]) -> (Vec<u8>, Progress) {
        let mut buf = input.to_vec();
        let mut out = Vec::new();
        let progress = decoder.feed(&mut buf, &mut out).unwrap();
        (out, progress)
    }

    #[test]
    fn lengthed_decoder_works() {
        let mut decoder = BodyDecoder::lengthed(5);
        let mut buf = b"hel".to_vec();
        let mut out = Vec::new();
        assert_eq!(decoder.feed(&mut buf, &mut out).unwrap(), Progress::NeedsMore);
        let mut buf = b"lo and overrun".to_vec();
        assert_eq!(decoder.feed(&mut buf, &mut out).unwrap(), Progress::Complete);
        assert_eq!(out, b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn lengthed_zero_completes_immediately() {
        let mut decoder = BodyDecoder::lengthed(0);
        let (out, progress) = feed_all(&mut decoder, b"");
        assert_eq!(progress, Progress::Complete);
        assert!(out.is_empty());
    }

    #[test]
    fn chunked_decoder_works() {
        let mut decoder = BodyDecoder::chunked();
        let (out, progress) = feed_all(&mut decoder, b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n");
        assert_eq!(progress, Progress::Complete);
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn chunked_size_line_split_across_reads() {
        let mut decoder = BodyDecoder::chunked();
        let mut out = Vec::new();
        // the size line, the data, and the final chunk all arrive in pieces
        let mut buf = b"B".to_vec();
        assert_eq!(decoder.feed(&mut buf, &mut out).unwrap(), Progress::NeedsMore);
        buf.extend_from_slice(b"\r\nhello");
        assert_eq!(decoder.feed(&mut buf, &mut out).unwrap(), Progress::NeedsMore);
        buf.extend_from_slice(b" world\r\n0\r\n");
        assert_eq!(decoder.feed(&mut buf, &mut out).unwrap(), Progress::NeedsMore);
        buf.extend_from_slice(b"\r\n");
        assert_eq!(decoder.feed(&mut buf, &mut out).unwrap(), Progress::Complete);
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn chunked_with_extension_and_trailer() {
        let mut decoder = BodyDecoder::chunked();
        let (out, progress) =
            feed_all(&mut decoder, b"4;name=x\r\ndata\r\n0\r\nExpires: never\r\n\r\n");
        assert_eq!(progress, Progress::Complete);
        assert_eq!(out, b"data");
    }

    #[test_case(b"zz\r\ndata\r\n0\r\n\r\n" ; "non hex size")]
    #[test_case(b"\r\ndata\r\n" ; "empty size line")]
    #[test_case(b"4\r\ndataXX0\r\n\r\n" ; "missing chunk crlf")]
    fn chunked_malformed(input: &[u8]) {
        let mut decoder = BodyDecoder::chunked();
        let mut buf = input.to_vec();
        let mut out = Vec::new();
        assert_eq!(decoder.feed(&mut buf, &mut out), Err(HttpError::BadRequest));
    }

    #[test]
    fn chunked_payload_equals_lengthed_payload() {
        let body = b"The quick brown fox jumps over the lazy dog";
        let mut chunked = Vec::new();
        for chunk in body.chunks(7) {
            chunked.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
            chunked.extend_from_slice(chunk);
            chunked.extend_from_slice(b"\r\n");
        }
        chunked.extend_from_slice(b"0\r\n\r\n");

        let mut decoder = BodyDecoder::chunked();
        let (chunked_out, _) = feed_all(&mut decoder, &chunked);
        let mut decoder = BodyDecoder::lengthed(body.len() as u64);
        let (lengthed_out, _) = feed_all(&mut decoder, body);
        assert_eq!(chunked_out, lengthed_out);
        assert_eq!(chunked_out, body);
    }

    const MULTIPART_CONTENT_TYPE: &str = "multipart/form-data; boundary=XBOUND";
    const MULTIPART_BODY: &[u8] = b"--XBOUND\r\n\
        Content-Disposition: form-data; name=\"file\"; filename=\"hello.txt\"\r\n\
        Content-Type: text/plain\r\n\
        \r\n\
        hello multipart\r\n\
        --XBOUND--\r\n";

    #[test]
    fn multipart_single_feed() {
        let dir = tempdir().unwrap();
        let mut saver = MultipartSaver::new(MULTIPART_CONTENT_TYPE, dir.path()).unwrap();
        saver.feed(MULTIPART_BODY).unwrap();
        saver.finish().unwrap();
        let saved = std::fs::read(dir.path().join("hello.txt")).unwrap();
        assert_eq!(saved, b"hello multipart");
    }

    #[test]
    fn multipart_boundary_straddles_reads() {
        let dir = tempdir().unwrap();
        let mut saver = MultipartSaver::new(MULTIPART_CONTENT_TYPE, dir.path()).unwrap();
        // feed one byte at a time; the closing boundary spans every split
        for byte in MULTIPART_BODY {
            saver.feed(std::slice::from_ref(byte)).unwrap();
        }
        saver.finish().unwrap();
        let saved = std::fs::read(dir.path().join("hello.txt")).unwrap();
        assert_eq!(saved, b"hello multipart");
    }

    #[test]
    fn multipart_default_filename() {
        let dir = tempdir().unwrap();
        let body = b"--B\r\nContent-Disposition: form-data; name=\"f\"\r\n\r\ndata\r\n--B--\r\n";
        let mut saver =
            MultipartSaver::new("multipart/form-data; boundary=B", dir.path()).unwrap();
        saver.feed(body).unwrap();
        saver.finish().unwrap();
        let saved = std::fs::read(dir.path().join(DEFAULT_UPLOAD_NAME)).unwrap();
        assert_eq!(saved, b"data");
    }

    #[test]
    fn multipart_missing_boundary_parameter() {
        let dir = tempdir().unwrap();
        assert!(MultipartSaver::new("multipart/form-data", dir.path()).is_err());
    }

    #[test_case("boundary=simple", Some("simple") ; "bare")]
    #[test_case("multipart/form-data; boundary=\"quo ted\"", Some("quo ted") ; "quoted")]
    #[test_case("multipart/form-data; boundary=b; charset=x", Some("b") ; "followed by parameter")]
    #[test_case("multipart/form-data", None ; "absent")]
    fn boundary_extraction(content_type: &str, expected: Option<&str>) {
        assert_eq!(extract_boundary(content_type).as_deref(), expected);
    }

    #[test]
    fn file_sink_small_body_is_buffered() {
        let dir = tempdir().unwrap();
        let mut sink = FileSink::new(dir.path(), DEFAULT_UPLOAD_NAME);
        sink.feed(b"hello").unwrap();
        // nothing on disk until completion
        assert!(!dir.path().join(DEFAULT_UPLOAD_NAME).exists());
        sink.finish().unwrap();
        let saved = std::fs::read(dir.path().join(DEFAULT_UPLOAD_NAME)).unwrap();
        assert_eq!(saved, b"hello");
    }

    #[test]
    fn file_sink_large_body_spills() {
        let dir = tempdir().unwrap();
        let mut sink = FileSink::new(dir.path(), DEFAULT_UPLOAD_NAME);
        let block = vec![b'x'; SMALL_BODY_MAX];
        sink.feed(&block).unwrap();
        sink.feed(b"tail").unwrap();
        sink.finish().unwrap();
        let saved = std::fs::read(dir.path().join(DEFAULT_UPLOAD_NAME)).unwrap();
        assert_eq!(saved.len(), SMALL_BODY_MAX + 4);
    }

    #[test]
    fn file_sink_discard_truncates() {
        let dir = tempdir().unwrap();
        let mut sink = FileSink::new(dir.path(), DEFAULT_UPLOAD_NAME);
        let block = vec![b'x'; SMALL_BODY_MAX + 1];
        sink.feed(&block).unwrap();
        sink.discard();
        let saved = std::fs::read(dir.path().join(DEFAULT_UPLOAD_NAME)).unwrap();
        assert!(saved.is_empty());
    }

    #[test]
    fn cgi_temp_sink_names() {
        let sink = CgiTempSink::new(Some("notes.txt"));
        assert_eq!(sink.path, Path::new("/tmp/notes.txt"));
        let sink = CgiTempSink::new(Some("../../etc/passwd"));
        assert_eq!(sink.path, Path::new("/tmp/passwd"));
        let sink = CgiTempSink::new(None);
        assert_eq!(sink.path, Path::new("/tmp").join(DEFAULT_CGI_BODY_NAME));
    }
}
