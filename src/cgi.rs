use std::ffi::CString;
use std::fs::File;
use std::io::Read;
use std::os::unix::io::{FromRawFd, RawFd};
use std::path::Path;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::{chdir, close, dup2, execve, fork, pipe, write, ForkResult, Pid};

use crate::config::{LocationBlock, ServerBlock};
use crate::request::{find, ParsedRequest};
use crate::response::Response;

/// A CGI child gets this long to finish before it is killed.
pub const CGI_DEADLINE_SECS: i64 = 30;

const DEFAULT_CGI_CONTENT_TYPE: &str = "text/html; charset=utf-8";

/// One forked CGI child. The stdout pipe is owned here and registered
/// with the multiplexer until EOF or the deadline.
#[derive(Debug)]
pub struct CgiProcess {
    pub pid: Pid,
    pub stdout: File,
    pub client_fd: RawFd,
    pub script_path: String,
    pub started_at: libc::time_t,
    pub last_active: libc::time_t,
    pub finished: bool,
    pub output: Vec<u8>,
}

#[derive(Debug, PartialEq)]
pub enum CgiError {
    ScriptNotFound,
    ScriptForbidden,
    Internal,
}

/// Interpreter for a request path, from the location's parallel
/// extension/interpreter lists.
pub fn interpreter_for<'a>(location: &'a LocationBlock, path: &str) -> Option<&'a str> {
    location
        .cgi_extensions
        .iter()
        .position(|extension| path.ends_with(extension.as_str()))
        .map(|index| location.cgi_interpreters[index].as_str())
}

/// Fork a CGI child for the request and hand back the process record.
/// The body, if any, has been spooled to `body`; it is written to the
/// child's stdin before the stdin pipe is closed.
pub fn start(
    request: &ParsedRequest,
    server: &ServerBlock,
    location: &LocationBlock,
    client_fd: RawFd,
    script_path: &str,
    body: Option<(&Path, u64)>,
    now: libc::time_t,
) -> Result<CgiProcess, CgiError> {
    let interpreter = interpreter_for(location, &request.path).ok_or(CgiError::Internal)?;

    let metadata = std::fs::metadata(script_path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => CgiError::ScriptNotFound,
        std::io::ErrorKind::PermissionDenied => CgiError::ScriptForbidden,
        _ => CgiError::Internal,
    })?;
    if !metadata.is_file() {
        return Err(CgiError::ScriptNotFound);
    }
    if let Err(e) = File::open(script_path) {
        return Err(match e.kind() {
            std::io::ErrorKind::PermissionDenied => CgiError::ScriptForbidden,
            std::io::ErrorKind::NotFound => CgiError::ScriptNotFound,
            _ => CgiError::Internal,
        });
    }

    // everything the child will exec with is built before the fork
    let interpreter_c = CString::new(interpreter).map_err(|_| CgiError::Internal)?;
    let script_c = CString::new(script_path).map_err(|_| CgiError::Internal)?;
    let env = build_env(request, server, body.map(|(_, len)| len))
        .into_iter()
        .map(|entry| CString::new(entry).map_err(|_| CgiError::Internal))
        .collect::<Result<Vec<CString>, CgiError>>()?;
    let script_dir = Path::new(script_path)
        .parent()
        .map(|dir| dir.to_path_buf());

    let (stdin_read, stdin_write) = pipe().map_err(|_| CgiError::Internal)?;
    let (stdout_read, stdout_write) = match pipe() {
        Ok(fds) => fds,
        Err(_) => {
            close(stdin_read).ok();
            close(stdin_write).ok();
            return Err(CgiError::Internal);
        }
    };

    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            close(stdin_write).ok();
            close(stdout_read).ok();
            if dup2(stdin_read, libc::STDIN_FILENO).is_err()
                || dup2(stdout_write, libc::STDOUT_FILENO).is_err()
            {
                unsafe { libc::_exit(127) };
            }
            close(stdin_read).ok();
            close(stdout_write).ok();
            if let Some(dir) = &script_dir {
                chdir(dir.as_path()).ok();
            }
            let args = [interpreter_c.as_c_str(), script_c.as_c_str()];
            let envp: Vec<&std::ffi::CStr> =
                env.iter().map(|entry| entry.as_c_str()).collect();
            execve(&interpreter_c, &args, &envp).ok();
            unsafe { libc::_exit(127) };
        }
        Ok(ForkResult::Parent { child }) => {
            close(stdin_read).ok();
            close(stdout_write).ok();

            if let Some((body_path, _)) = body {
                feed_stdin(stdin_write, body_path);
            }
            close(stdin_write).ok();

            fcntl(stdout_read, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).ok();
            Ok(CgiProcess {
                pid: child,
                stdout: unsafe { File::from_raw_fd(stdout_read) },
                client_fd,
                script_path: script_path.to_string(),
                started_at: now,
                last_active: now,
                finished: false,
                output: Vec::new(),
            })
        }
        Err(_) => {
            close(stdin_read).ok();
            close(stdin_write).ok();
            close(stdout_read).ok();
            close(stdout_write).ok();
            Err(CgiError::Internal)
        }
    }
}

/// Copy the spooled request body into the child's stdin pipe.
fn feed_stdin(stdin_write: RawFd, body_path: &Path) {
    let mut file = match File::open(body_path) {
        Ok(file) => file,
        Err(_) => return,
    };
    let mut buf = [0u8; 1 << 16];
    loop {
        let n = match file.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let mut written = 0;
        while written < n {
            match write(stdin_write, &buf[written..n]) {
                Ok(w) => written += w,
                Err(_) => return, // child went away; nothing to salvage
            }
        }
    }
}

fn build_env(
    request: &ParsedRequest,
    server: &ServerBlock,
    content_length: Option<u64>,
) -> Vec<String> {
    let mut env = vec![
        format!("REQUEST_METHOD={}", request.method),
        format!("QUERY_STRING={}", request.query),
        "GATEWAY_INTERFACE=CGI/1.1".to_string(),
        "SERVER_PROTOCOL=HTTP/1.1".to_string(),
        format!("SERVER_NAME={}", server.host),
        format!("SERVER_PORT={}", server.port),
        format!("SCRIPT_NAME={}", request.path),
        "PATH_INFO=".to_string(),
    ];
    if let Some(len) = content_length {
        env.push(format!("CONTENT_LENGTH={}", len));
        let content_type = request
            .header("content-type")
            .unwrap_or("application/x-www-form-urlencoded");
        env.push(format!("CONTENT_TYPE={}", content_type));
    }
    for (name, value) in &request.headers {
        let name = name.to_ascii_uppercase().replace('-', "_");
        env.push(format!("HTTP_{}={}", name, value));
    }
    env
}

/// Rewrite a finished child's output into an HTTP response: split the
/// header block from the body, honor `Status:` and `Content-Type:`,
/// forward the rest, and reframe with a recomputed `Content-Length`.
pub fn parse_output(output: &[u8]) -> Response {
    let (head, body) = split_headers_body(output);

    let mut status: u16 = 200;
    let mut content_type: Option<String> = None;
    let mut forwarded: Vec<(String, String)> = Vec::new();

    for line in head.split(|&b| b == b'\n') {
        let line = match line.last() {
            Some(b'\r') => &line[..line.len() - 1],
            _ => line,
        };
        if line.is_empty() {
            continue;
        }
        let text = match std::str::from_utf8(line) {
            Ok(text) => text,
            Err(_) => continue,
        };
        let (name, value) = match text.split_once(':') {
            Some((name, value)) => (name, value.trim()),
            None => continue,
        };
        match name.to_ascii_lowercase().as_str() {
            "status" => {
                if let Some(code) = value
                    .split_whitespace()
                    .next()
                    .and_then(|token| token.parse::<u16>().ok())
                {
                    status = code;
                }
            }
            "content-type" => content_type = Some(value.to_string()),
            // both are recomputed by the builder
            "content-length" | "connection" => {}
            _ => forwarded.push((name.to_string(), value.to_string())),
        }
    }

    let mut response = Response::new(status);
    response.header(
        "Content-Type",
        content_type.as_deref().unwrap_or(DEFAULT_CGI_CONTENT_TYPE),
    );
    for (name, value) in forwarded {
        response.header(&name, &value);
    }
    response.set_body(body.to_vec());
    response
}

fn split_headers_body(output: &[u8]) -> (&[u8], &[u8]) {
    if let Some(pos) = find(b"\r\n\r\n", output) {
        (&output[..pos], &output[pos + 4..])
    } else if let Some(pos) = find(b"\n\n", output) {
        (&output[..pos], &output[pos + 2..])
    } else {
        (&[], output)
    }
}
