use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::net::{IpAddr, SocketAddr, SocketAddrV4, TcpStream};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::rc::Rc;

use anyhow::{Context, Result};
use chrono::Utc;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::epoll::{
    epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
};
use nix::sys::signal::{kill, Signal};
use nix::sys::socket;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::close;

use crate::body::{BodyDecoder, BodySink};
use crate::cgi::{self, CgiProcess, CGI_DEADLINE_SECS};
use crate::config::Config;
use crate::handler;
use crate::mime::MimeMap;
use crate::request::ParsedRequest;
use crate::response::{self, Body, ClfDate, HttpError, LogEncoded, Response};

/// How long one readiness wait may block.
const IDLE_TIMEOUT_MS: isize = 30_000;

/// Connections with no read or write activity for this long are timed out.
const CLIENT_IDLE_SECS: i64 = 60;

/// Block size for pumping streamed file bodies.
const STREAM_BLOCK: usize = 8192;

const MAX_EVENTS: usize = 64;

/// What a registered descriptor is. The table keyed by these tags is the
/// single index of every live descriptor.
#[derive(Debug, Clone, Copy)]
enum Role {
    Listener(usize),
    Client,
    Cgi,
}

#[derive(Debug)]
pub enum PipelineState {
    ReadingHeaders,
    ReadingBody {
        decoder: BodyDecoder,
        sink: BodySink,
        received: u64,
        limit: u64,
    },
    WaitingForCgi {
        cgi_fd: RawFd,
    },
    WritingResponse,
    Closed,
}

/// Per-client state owned by the multiplexer. The socket closes exactly
/// once, when the connection is dropped at teardown.
pub struct Connection {
    socket: TcpStream,
    pub client: IpAddr,
    pub server_idx: usize,
    pub state: PipelineState,
    pub read_buf: Vec<u8>,
    write_buf: Vec<u8>,
    write_cursor: usize,
    stream_file: Option<File>,
    pub connected_at: libc::time_t,
    pub last_active: libc::time_t,
    pub request: Option<ParsedRequest>,
    pub http_code: u16,
    pub total_sent: u64,
    pub num_requests: u32,
}

impl Connection {
    fn new(socket: TcpStream, client: IpAddr, server_idx: usize, now: libc::time_t) -> Self {
        Self {
            socket,
            client,
            server_idx,
            state: PipelineState::ReadingHeaders,
            read_buf: Vec::new(),
            write_buf: Vec::new(),
            write_cursor: 0,
            stream_file: None,
            connected_at: now,
            last_active: now,
            request: None,
            http_code: 0,
            total_sent: 0,
            num_requests: 0,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

/// The event multiplexer: owns the epoll instance, every registered
/// descriptor, and the timeout sweeps.
pub struct Server {
    pub config: Rc<Config>,
    pub mime_map: MimeMap,
    pub now: libc::time_t,
    epoll_fd: RawFd,
    roles: HashMap<RawFd, Role>,
    listeners: Vec<RawFd>,
    clients: HashMap<RawFd, Connection>,
    cgis: HashMap<RawFd, CgiProcess>,
    pub num_requests: u64,
    pub total_in: u64,
    pub total_out: u64,
}

impl Server {
    pub fn new(config: Config) -> Result<Self> {
        let epoll_fd = epoll_create1(EpollCreateFlags::empty())
            .context("failed to create epoll instance")?;
        let mut server = Self {
            config: Rc::new(config),
            mime_map: MimeMap::parse_default_extension_map(),
            now: Utc::now().timestamp(),
            epoll_fd,
            roles: HashMap::new(),
            listeners: Vec::new(),
            clients: HashMap::new(),
            cgis: HashMap::new(),
            num_requests: 0,
            total_in: 0,
            total_out: 0,
        };
        let config = server.config.clone();
        for (index, block) in config.servers.iter().enumerate() {
            let fd = init_listener(block.host, block.port).with_context(|| {
                format!("failed to listen on {}:{}", block.host, block.port)
            })?;
            server.register(fd, EpollFlags::EPOLLIN);
            server.roles.insert(fd, Role::Listener(index));
            server.listeners.push(fd);
            println!("listening on: http://{}:{}/", block.host, block.port);
        }
        Ok(server)
    }

    fn register(&mut self, fd: RawFd, interest: EpollFlags) {
        let mut event = EpollEvent::new(interest, fd as u64);
        if let Err(e) = epoll_ctl(self.epoll_fd, EpollOp::EpollCtlAdd, fd, &mut event) {
            panic!("epoll_ctl(ADD) failed: {}", e);
        }
    }

    fn modify(&mut self, fd: RawFd, interest: EpollFlags) {
        let mut event = EpollEvent::new(interest, fd as u64);
        if let Err(e) = epoll_ctl(self.epoll_fd, EpollOp::EpollCtlMod, fd, &mut event) {
            panic!("epoll_ctl(MOD) failed: {}", e);
        }
    }

    fn deregister(&mut self, fd: RawFd) {
        if let Err(e) = epoll_ctl(self.epoll_fd, EpollOp::EpollCtlDel, fd, None) {
            eprintln!("warning: epoll_ctl(DEL) failed for fd {}: {}", fd, e);
        }
        self.roles.remove(&fd);
    }

    /// One iteration of the main loop: deadline sweep, readiness wait,
    /// idle sweep on a quiet wait, then event dispatch by role.
    pub fn poll(&mut self) {
        self.now = Utc::now().timestamp();
        self.sweep_cgi_deadlines();

        let mut events = vec![EpollEvent::empty(); MAX_EVENTS];
        let num_events = match epoll_wait(self.epoll_fd, &mut events, IDLE_TIMEOUT_MS) {
            Ok(num_events) => num_events,
            Err(Errno::EINTR) => return, // interrupted by signal
            Err(e) => panic!("epoll_wait failed: {}", e),
        };
        self.now = Utc::now().timestamp();

        if num_events == 0 {
            self.sweep_idle_clients();
            return;
        }

        for event in &events[..num_events] {
            let fd = event.data() as RawFd;
            let flags = event.events();
            match self.roles.get(&fd).copied() {
                Some(Role::Listener(index)) => self.accept_loop(fd, index),
                Some(Role::Client) => self.on_client_event(fd, flags),
                Some(Role::Cgi) => self.on_cgi_event(fd, flags),
                // descriptor torn down earlier in this batch
                None => {}
            }
        }
    }

    /// Accept until the listener would block. Every accepted socket is
    /// made non-blocking and registered for readability.
    fn accept_loop(&mut self, listener_fd: RawFd, server_idx: usize) {
        loop {
            let fd = match socket::accept(listener_fd) {
                Ok(fd) => fd,
                Err(Errno::EAGAIN) => break,
                Err(e) => {
                    eprintln!("warning: accept() failed: {}", e);
                    break;
                }
            };
            let client = match socket::getpeername(fd) {
                Ok(socket::SockAddr::Inet(addr)) => addr.ip().to_std(),
                _ => {
                    close(fd).ok();
                    continue;
                }
            };
            let stream = unsafe { TcpStream::from_raw_fd(fd) };
            if stream.set_nonblocking(true).is_err() {
                continue; // drop closes the socket
            }
            let conn = Connection::new(stream, client, server_idx, self.now);
            self.register(fd, EpollFlags::EPOLLIN);
            self.roles.insert(fd, Role::Client);
            self.clients.insert(fd, conn);
            // try to read straight away rather than waiting for another
            // readiness round
            self.on_client_event(fd, EpollFlags::EPOLLIN);
        }
    }

    fn on_client_event(&mut self, fd: RawFd, flags: EpollFlags) {
        let mut conn = match self.clients.remove(&fd) {
            Some(conn) => conn,
            None => return,
        };
        if flags.contains(EpollFlags::EPOLLIN) {
            self.poll_recv(&mut conn);
        } else if flags.contains(EpollFlags::EPOLLOUT) {
            self.poll_send(&mut conn);
        } else if flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR) {
            // the peer can hang up while parked behind a CGI; cancel the
            // child before the state is overwritten
            if let PipelineState::WaitingForCgi { cgi_fd } = conn.state {
                if let Some(mut process) = self.take_cgi(cgi_fd) {
                    Self::reap(&mut process);
                }
            }
            conn.state = PipelineState::Closed;
        }
        self.finish_client(fd, conn);
    }

    /// Park the connection again, or tear it down if it reached `Closed`.
    fn finish_client(&mut self, fd: RawFd, conn: Connection) {
        if matches!(conn.state, PipelineState::Closed) {
            self.teardown_client(conn);
        } else {
            self.clients.insert(fd, conn);
        }
    }

    fn poll_recv(&mut self, conn: &mut Connection) {
        let mut buf = [0u8; 1 << 15];
        let received = match socket::recv(conn.fd(), &mut buf, socket::MsgFlags::empty()) {
            Ok(received) if received > 0 => received,
            Err(Errno::EAGAIN) => return, // would block
            _ => {
                // closure or other error
                conn.state = PipelineState::Closed;
                return;
            }
        };
        conn.last_active = self.now;
        conn.read_buf.extend_from_slice(&buf[..received]);
        self.total_in += received as u64;

        match conn.state {
            PipelineState::ReadingHeaders => handler::process_headers(self, conn),
            PipelineState::ReadingBody { .. } => handler::advance_body(self, conn),
            // bytes in any later state are ignored; there is no pipelining
            _ => {}
        }

        // if a response is ready, try to send right away instead of going
        // through another readiness round
        if matches!(conn.state, PipelineState::WritingResponse) {
            self.poll_send(conn);
        }
    }

    fn poll_send(&mut self, conn: &mut Connection) {
        if !matches!(conn.state, PipelineState::WritingResponse) {
            return;
        }
        loop {
            if conn.write_cursor == conn.write_buf.len() {
                conn.write_buf.clear();
                conn.write_cursor = 0;
                match conn.stream_file.as_mut() {
                    Some(file) => {
                        let mut block = [0u8; STREAM_BLOCK];
                        match file.read(&mut block) {
                            Ok(0) => {
                                // streamed the whole file
                                conn.state = PipelineState::Closed;
                                return;
                            }
                            Ok(n) => conn.write_buf.extend_from_slice(&block[..n]),
                            Err(_) => {
                                conn.state = PipelineState::Closed;
                                return;
                            }
                        }
                    }
                    None => {
                        // response fully transmitted; no keep-alive
                        conn.state = PipelineState::Closed;
                        return;
                    }
                }
            }
            let sent = match socket::send(
                conn.fd(),
                &conn.write_buf[conn.write_cursor..],
                socket::MsgFlags::empty(),
            ) {
                Ok(sent) if sent > 0 => sent,
                Err(Errno::EAGAIN) => return, // re-armed, try later
                _ => {
                    // peer went away mid-write; close silently
                    conn.state = PipelineState::Closed;
                    return;
                }
            };
            conn.write_cursor += sent;
            conn.total_sent += sent as u64;
            conn.last_active = self.now;
            self.total_out += sent as u64;
        }
    }

    /// Queue a finished response and flip the connection to the write
    /// side.
    pub fn respond(&mut self, conn: &mut Connection, response: Response) {
        conn.http_code = response.status;
        let (head, body) = response.into_wire(self.now);
        conn.write_buf = head;
        conn.write_cursor = 0;
        match body {
            Body::Bytes(bytes) => conn.write_buf.extend_from_slice(&bytes),
            Body::File { file, .. } => conn.stream_file = Some(file),
        }
        conn.state = PipelineState::WritingResponse;
        self.modify(conn.fd(), EpollFlags::EPOLLOUT);
    }

    /// Report a pipeline error to the peer, unless bytes already went out
    /// on this connection, in which case it just closes.
    pub fn respond_error(&mut self, conn: &mut Connection, error: HttpError) {
        if conn.total_sent > 0 {
            conn.state = PipelineState::Closed;
            return;
        }
        let config = self.config.clone();
        let block = &config.servers[conn.server_idx];
        let response = response::error_response(&error, block, &self.mime_map);
        self.respond(conn, response);
    }

    /// Hand a freshly spawned CGI's stdout pipe to the multiplexer and
    /// park the client until the child finishes.
    pub fn attach_cgi(&mut self, conn: &mut Connection, process: CgiProcess) {
        let cgi_fd = process.stdout.as_raw_fd();
        self.register(cgi_fd, EpollFlags::EPOLLIN);
        self.roles.insert(cgi_fd, Role::Cgi);
        self.cgis.insert(cgi_fd, process);
        conn.state = PipelineState::WaitingForCgi { cgi_fd };
        self.modify(conn.fd(), EpollFlags::empty());
    }

    fn on_cgi_event(&mut self, fd: RawFd, flags: EpollFlags) {
        let mut at_eof = false;
        match self.cgis.get_mut(&fd) {
            Some(process) => {
                let mut buf = [0u8; 1 << 15];
                loop {
                    match nix::unistd::read(fd, &mut buf) {
                        Ok(0) => {
                            at_eof = true;
                            break;
                        }
                        Ok(n) => {
                            process.output.extend_from_slice(&buf[..n]);
                            process.last_active = self.now;
                        }
                        Err(Errno::EAGAIN) => break,
                        Err(_) => {
                            at_eof = true;
                            break;
                        }
                    }
                }
            }
            None => return,
        }
        if at_eof || flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR) {
            self.finalize_cgi(fd);
        }
    }

    /// The child closed its stdout (or errored): reap it, rewrite its
    /// output into a response, and arm the client's write side.
    fn finalize_cgi(&mut self, fd: RawFd) {
        let mut process = match self.take_cgi(fd) {
            Some(process) => process,
            None => return,
        };
        let status = match waitpid(process.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => waitpid(process.pid, None).ok(),
            other => other.ok(),
        };
        process.finished = true;
        let exit_code = match status {
            Some(WaitStatus::Exited(_, code)) => Some(code),
            _ => None,
        };

        let client_fd = process.client_fd;
        let mut conn = match self.clients.remove(&client_fd) {
            Some(conn) => conn,
            None => return, // client already gone
        };
        if process.output.is_empty() && exit_code != Some(0) {
            self.respond_error(&mut conn, HttpError::BadGateway);
        } else {
            let response = cgi::parse_output(&process.output);
            self.respond(&mut conn, response);
        }
        self.finish_client(client_fd, conn);
    }

    /// Remove a CGI pipe from the table. The caller gets the process
    /// record; dropping it closes the pipe, and `reap` below guarantees
    /// the child is waited on.
    fn take_cgi(&mut self, fd: RawFd) -> Option<CgiProcess> {
        let process = self.cgis.remove(&fd)?;
        self.deregister(fd);
        Some(process)
    }

    fn reap(process: &mut CgiProcess) {
        if process.finished {
            return;
        }
        kill(process.pid, Signal::SIGKILL).ok();
        waitpid(process.pid, None).ok();
        process.finished = true;
    }

    /// Kill and reap CGI children past their deadline; the waiting client
    /// gets a 504.
    fn sweep_cgi_deadlines(&mut self) {
        let now = self.now;
        let expired: Vec<RawFd> = self
            .cgis
            .iter()
            .filter(|(_, process)| now - process.started_at >= CGI_DEADLINE_SECS)
            .map(|(fd, _)| *fd)
            .collect();
        for fd in expired {
            let mut process = match self.take_cgi(fd) {
                Some(process) => process,
                None => continue,
            };
            eprintln!(
                "warning: CGI {} exceeded its deadline, killing pid {}",
                process.script_path, process.pid
            );
            Self::reap(&mut process);
            if let Some(mut conn) = self.clients.remove(&process.client_fd) {
                self.respond_error(&mut conn, HttpError::GatewayTimeout);
                self.finish_client(process.client_fd, conn);
            }
        }
    }

    /// Close out clients that sat idle past the limit, with a best-effort
    /// 408. Clients parked behind a CGI are governed by the CGI deadline
    /// instead.
    fn sweep_idle_clients(&mut self) {
        let now = self.now;
        let idle: Vec<RawFd> = self
            .clients
            .iter()
            .filter(|(_, conn)| {
                !matches!(conn.state, PipelineState::WaitingForCgi { .. })
                    && now - conn.last_active >= CLIENT_IDLE_SECS
            })
            .map(|(fd, _)| *fd)
            .collect();
        for fd in idle {
            let mut conn = match self.clients.remove(&fd) {
                Some(conn) => conn,
                None => continue,
            };
            self.respond_error(&mut conn, HttpError::RequestTimeout);
            self.poll_send(&mut conn); // best effort
            conn.state = PipelineState::Closed;
            self.teardown_client(conn);
        }
    }

    /// Deregister, cancel any CGI the connection was waiting on, log, and
    /// drop (which closes the socket).
    fn teardown_client(&mut self, conn: Connection) {
        if let PipelineState::WaitingForCgi { cgi_fd } = conn.state {
            if let Some(mut process) = self.take_cgi(cgi_fd) {
                Self::reap(&mut process);
            }
        }
        self.deregister(conn.fd());
        self.log_connection(&conn);
    }

    /// Add a connection's details to the access log.
    fn log_connection(&mut self, conn: &Connection) {
        if conn.http_code == 0 {
            return; // died before producing a response
        }
        let request = match &conn.request {
            Some(request) => request,
            None => return,
        };
        println!(
            "{} - - {} \"{} {} HTTP/1.1\" {} {} \"{}\" \"{}\"",
            conn.client,
            ClfDate(self.now),
            LogEncoded(request.method.as_str()),
            LogEncoded(&request.target),
            conn.http_code,
            conn.total_sent,
            LogEncoded(request.header("referer").unwrap_or("")),
            LogEncoded(request.header("user-agent").unwrap_or("")),
        );
    }

    /// Close everything in an orderly way and print usage counters.
    pub fn shutdown(&mut self) {
        for fd in std::mem::take(&mut self.listeners) {
            self.deregister(fd);
            close(fd).ok();
        }
        let client_fds: Vec<RawFd> = self.clients.keys().copied().collect();
        for fd in client_fds {
            if let Some(conn) = self.clients.remove(&fd) {
                self.teardown_client(conn);
            }
        }
        let cgi_fds: Vec<RawFd> = self.cgis.keys().copied().collect();
        for fd in cgi_fds {
            if let Some(mut process) = self.take_cgi(fd) {
                Self::reap(&mut process);
            }
        }
        close(self.epoll_fd).ok();
        println!("Requests: {}", self.num_requests);
        println!("Bytes: {} in, {} out", self.total_in, self.total_out);
    }
}

/// Create, bind, and arm one listening socket.
fn init_listener(addr: std::net::Ipv4Addr, port: u16) -> Result<RawFd> {
    let fd = socket::socket(
        socket::AddressFamily::Inet,
        socket::SockType::Stream,
        socket::SockFlag::empty(),
        socket::SockProtocol::Tcp,
    )
    .context("failed to create listening socket")?;
    socket::setsockopt(fd, socket::sockopt::ReuseAddr, &true)
        .context("failed to set SO_REUSEADDR")?;
    let socket_addr = SocketAddr::V4(SocketAddrV4::new(addr, port));
    socket::bind(
        fd,
        &socket::SockAddr::Inet(socket::InetAddr::from_std(&socket_addr)),
    )
    .context("failed to bind")?;
    socket::listen(fd, libc::SOMAXCONN as usize).context("failed to listen")?;
    fcntl(fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
        .context("failed to make listener non-blocking")?;
    Ok(fd)
}
