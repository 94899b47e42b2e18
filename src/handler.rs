use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use crate::body::{
    BodyDecoder, BodySink, CgiTempSink, FileSink, MultipartSaver, Progress, DEFAULT_UPLOAD_NAME,
};
use crate::cgi::{self, CgiError};
use crate::config::ServerBlock;
use crate::request::{self, find, Method, ParsedRequest, MAX_HEADER_BYTES};
use crate::response::{self, HttpError, Response};
use crate::server::{Connection, PipelineState, Server};

/// Drive the `ReadingHeaders` state: wait for the terminator, guard the
/// header section size, and dispatch once the head parses.
pub fn process_headers(server: &mut Server, conn: &mut Connection) {
    match find(b"\r\n\r\n", &conn.read_buf) {
        Some(pos) => {
            if pos + 4 > MAX_HEADER_BYTES {
                server.respond_error(conn, HttpError::HeaderTooLarge);
                return;
            }
            let head: Vec<u8> = conn.read_buf.drain(..pos + 4).collect();
            match request::parse(&head[..pos]) {
                Ok(request) => dispatch(server, conn, request),
                Err(error) => server.respond_error(conn, error),
            }
        }
        None => {
            if conn.read_buf.len() > MAX_HEADER_BYTES {
                server.respond_error(conn, HttpError::HeaderTooLarge);
            } else if let Err(error) = request::check_start_line(&conn.read_buf) {
                // the prefix already cannot become a servable request
                server.respond_error(conn, error);
            }
        }
    }
}

/// Location match, method gate, CGI classification, and handler call.
fn dispatch(server: &mut Server, conn: &mut Connection, mut request: ParsedRequest) {
    server.num_requests += 1;
    conn.num_requests += 1;

    let config = server.config.clone();
    let block = &config.servers[conn.server_idx];

    // path traversal guardrail, applied to every method
    if request.path.contains("..") {
        conn.request = Some(request);
        server.respond_error(conn, HttpError::BadRequest);
        return;
    }

    request.location = block.match_location(&request.path);
    let location = match request.location {
        Some(index) => &block.locations[index],
        None => {
            conn.request = Some(request);
            server.respond_error(conn, HttpError::NotFound);
            return;
        }
    };

    if let Some(url) = location.redirect.as_deref() {
        let url = url.to_string();
        conn.request = Some(request);
        server.respond(conn, response::redirect(302, &url));
        return;
    }

    let root = match block.effective_root(Some(location)) {
        Some(root) => root.to_string(),
        None => {
            conn.request = Some(request);
            server.respond_error(conn, HttpError::NotFound);
            return;
        }
    };

    if !location.allowed_methods.is_empty()
        && !location.allowed_methods.contains(&request.method)
    {
        let allowed = location.allowed_methods.clone();
        conn.request = Some(request);
        server.respond_error(conn, HttpError::MethodNotAllowed(allowed));
        return;
    }

    let is_cgi = cgi::interpreter_for(location, &request.path).is_some();

    match request.method {
        Method::Post => setup_post(server, conn, request, block, is_cgi),
        Method::Get if is_cgi => {
            conn.request = Some(request);
            start_cgi(server, conn, None);
        }
        Method::Get => {
            let result = process_get(server, block, &request, &root);
            conn.request = Some(request);
            match result {
                Ok(response) => server.respond(conn, response),
                Err(error) => server.respond_error(conn, error),
            }
        }
        Method::Delete => {
            let result = process_delete(&request, &root, block);
            conn.request = Some(request);
            match result {
                Ok(response) => server.respond(conn, response),
                Err(error) => server.respond_error(conn, error),
            }
        }
    }
}

/// Map a request path into the filesystem: the effective root plus the
/// part of the path below the matched location.
fn resolve_path(root: &str, location_path: &str, request_path: &str) -> String {
    let below = if location_path == "/" {
        request_path
    } else {
        &request_path[location_path.len()..]
    };
    let root = root.trim_end_matches('/');
    if below.starts_with('/') || below.is_empty() {
        format!("{}{}", root, below)
    } else {
        format!("{}/{}", root, below)
    }
}

fn location_path<'a>(block: &'a ServerBlock, request: &ParsedRequest) -> &'a str {
    request
        .location
        .map(|index| block.locations[index].path.as_str())
        .unwrap_or("/")
}

/// Process a GET request: stream a file, or resolve a directory through
/// index files, autoindex, or a redirect to the slashed path.
fn process_get(
    server: &Server,
    block: &ServerBlock,
    request: &ParsedRequest,
    root: &str,
) -> Result<Response, HttpError> {
    let location = request.location.map(|index| &block.locations[index]);
    let target = resolve_path(root, location_path(block, request), &request.path);

    let metadata = std::fs::metadata(&target).map_err(map_fs_error)?;
    if metadata.is_dir() {
        if !request.path.ends_with('/') {
            // canonical directory URL has the trailing slash
            return Ok(response::redirect(301, &format!("{}/", request.path)));
        }
        let mut index_names = block.effective_index(location);
        let default = [crate::config::DEFAULT_INDEX_NAME.to_string()];
        if index_names.is_empty() {
            index_names = &default;
        }
        for name in index_names {
            let candidate = format!("{}{}", target, name);
            if file_exists(&candidate) {
                return serve_file(server, &candidate);
            }
        }
        if block.effective_autoindex(location) {
            return response::dir_listing(Path::new(&target), &request.path);
        }
        return Err(HttpError::Forbidden);
    }
    serve_file(server, &target)
}

fn serve_file(server: &Server, target: &str) -> Result<Response, HttpError> {
    let file = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(target)
        .map_err(map_fs_error)?;
    let metadata = file.metadata().map_err(|_| HttpError::Internal)?;
    if !metadata.is_file() {
        return Err(HttpError::Forbidden);
    }
    Ok(Response::from_file(
        200,
        file,
        metadata.len(),
        server.mime_map.content_type(target),
    ))
}

/// Return true if file exists.
fn file_exists(path: &str) -> bool {
    match std::fs::metadata(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        _ => true,
    }
}

fn map_fs_error(error: std::io::Error) -> HttpError {
    match error.kind() {
        std::io::ErrorKind::NotFound => HttpError::NotFound,
        std::io::ErrorKind::PermissionDenied => HttpError::Forbidden,
        _ => HttpError::Internal,
    }
}

fn process_delete(
    request: &ParsedRequest,
    root: &str,
    block: &ServerBlock,
) -> Result<Response, HttpError> {
    let target = resolve_path(root, location_path(block, request), &request.path);
    let metadata = std::fs::metadata(&target).map_err(map_fs_error)?;
    if metadata.is_dir() {
        return Err(HttpError::Forbidden);
    }
    std::fs::remove_file(&target).map_err(map_fs_error)?;
    Ok(Response::text(200, "Deleted.\n"))
}

/// Choose the body framing and destination for a POST, then consume
/// whatever body bytes arrived with the headers.
fn setup_post(
    server: &mut Server,
    conn: &mut Connection,
    request: ParsedRequest,
    block: &ServerBlock,
    is_cgi: bool,
) {
    let limit = block.max_body_size;

    let decoder = if request.is_chunked() {
        BodyDecoder::chunked()
    } else {
        match request.content_length() {
            Some(Ok(length)) => {
                if limit > 0 && length > limit {
                    conn.request = Some(request);
                    server.respond_error(conn, HttpError::PayloadTooLarge);
                    return;
                }
                BodyDecoder::lengthed(length)
            }
            Some(Err(error)) => {
                conn.request = Some(request);
                server.respond_error(conn, error);
                return;
            }
            None => {
                conn.request = Some(request);
                server.respond_error(conn, HttpError::LengthRequired);
                return;
            }
        }
    };

    let sink = if is_cgi {
        BodySink::CgiTemp(CgiTempSink::new(request.header("x-file-name")))
    } else {
        let location = request.location.map(|index| &block.locations[index]);
        let store = match location.and_then(|location| location.upload_store.as_deref()) {
            Some(store) => store.to_string(),
            None => {
                // nowhere configured to put the body
                conn.request = Some(request);
                server.respond_error(conn, HttpError::BadRequest);
                return;
            }
        };
        let store = Path::new(&store);
        match std::fs::metadata(store) {
            Ok(metadata) if metadata.is_dir() => {}
            _ => {
                conn.request = Some(request);
                server.respond_error(conn, HttpError::NotFound);
                return;
            }
        }
        let multipart = request
            .header("content-type")
            .map_or(false, |value| value.starts_with("multipart/form-data"));
        if multipart {
            match MultipartSaver::new(request.header("content-type").unwrap(), store) {
                Ok(saver) => BodySink::Multipart(saver),
                Err(error) => {
                    conn.request = Some(request);
                    server.respond_error(conn, error);
                    return;
                }
            }
        } else {
            BodySink::UploadFile(FileSink::new(store, DEFAULT_UPLOAD_NAME))
        }
    };

    conn.request = Some(request);
    conn.state = PipelineState::ReadingBody {
        decoder,
        sink,
        received: 0,
        limit,
    };
    // bytes that arrived together with the headers
    advance_body(server, conn);
}

enum BodyOutcome {
    NeedsMore,
    Fail(HttpError),
    UploadDone,
    CgiDone { path: std::path::PathBuf, len: u64 },
}

/// Drive the `ReadingBody` state: decode, enforce the size limit, feed
/// the sink, and finish the request when the decoder completes.
pub fn advance_body(server: &mut Server, conn: &mut Connection) {
    let outcome = match &mut conn.state {
        PipelineState::ReadingBody {
            decoder,
            sink,
            received,
            limit,
        } => {
            let mut decoded = Vec::new();
            match decoder.feed(&mut conn.read_buf, &mut decoded) {
                Err(error) => {
                    sink.discard();
                    BodyOutcome::Fail(error)
                }
                Ok(progress) => {
                    *received += decoded.len() as u64;
                    if *limit > 0 && *received > *limit {
                        sink.discard();
                        BodyOutcome::Fail(HttpError::PayloadTooLarge)
                    } else if let Err(error) = sink.feed(&decoded) {
                        BodyOutcome::Fail(error)
                    } else if matches!(progress, Progress::Complete) {
                        match sink.finish() {
                            Err(error) => {
                                sink.discard();
                                BodyOutcome::Fail(error)
                            }
                            Ok(()) => match sink.cgi_body_path() {
                                Some(path) => BodyOutcome::CgiDone {
                                    path: path.to_path_buf(),
                                    len: *received,
                                },
                                None => BodyOutcome::UploadDone,
                            },
                        }
                    } else {
                        BodyOutcome::NeedsMore
                    }
                }
            }
        }
        _ => return,
    };

    match outcome {
        BodyOutcome::NeedsMore => {}
        BodyOutcome::Fail(error) => server.respond_error(conn, error),
        BodyOutcome::UploadDone => {
            server.respond(conn, Response::text(201, "Upload stored.\n"))
        }
        BodyOutcome::CgiDone { path, len } => start_cgi(server, conn, Some((path, len))),
    }
}

/// Spawn the CGI child for the request stored on the connection and hand
/// its stdout pipe to the multiplexer.
fn start_cgi(
    server: &mut Server,
    conn: &mut Connection,
    body: Option<(std::path::PathBuf, u64)>,
) {
    let config = server.config.clone();
    let block = &config.servers[conn.server_idx];
    let request = conn.request.take().unwrap();
    let location = match request.location {
        Some(index) => &block.locations[index],
        None => {
            conn.request = Some(request);
            server.respond_error(conn, HttpError::Internal);
            return;
        }
    };
    let root = block.effective_root(Some(location)).unwrap_or("");
    let script = resolve_path(root, &location.path, &request.path);

    let result = cgi::start(
        &request,
        block,
        location,
        conn.fd(),
        &script,
        body.as_ref().map(|(path, len)| (path.as_path(), *len)),
        server.now,
    );
    match result {
        Ok(process) => {
            conn.request = Some(request);
            server.attach_cgi(conn, process);
        }
        Err(error) => {
            conn.request = Some(request);
            let error = match error {
                CgiError::ScriptNotFound => HttpError::NotFound,
                CgiError::ScriptForbidden => HttpError::Forbidden,
                CgiError::Internal => HttpError::Internal,
            };
            server.respond_error(conn, error);
        }
    }
}
