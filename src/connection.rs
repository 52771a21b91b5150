// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Per-connection read/write state and the HTTP state machine.
//!
//! A connection owns its socket, a fixed 2 KiB read buffer, a fixed 1 KiB
//! write buffer for response headers (and small error bodies), and an
//! optional memory-mapped file region. Responses go out as a two-segment
//! vectored write: the header segment from the write buffer and the mapped
//! file, with short writes advancing through both. On keep-alive the parser
//! and buffers reset and the same record serves the next request.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Cursor, IoSlice, Read, Write};
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, error, info};
use memmap2::Mmap;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use mysql::Conn;

use crate::config::TriggerMode;
use crate::db;
use crate::parser::request::{ParseStatus, RequestParser};
use crate::parser::response::Status;
use crate::parser::Method;
use crate::timer::TimerHandle;

/// Fixed request buffer; requests larger than this are rejected.
pub const READ_BUFFER_SIZE: usize = 2048;
/// Fixed header/error-body buffer.
pub const WRITE_BUFFER_SIZE: usize = 1024;

/// Body used for a 200 against an empty file.
const EMPTY_PAGE: &str = "<html><body></body></html>";

/// State shared by every connection: the site root, the credential map,
/// and the configured trigger discipline for client sockets.
#[derive(Debug)]
pub struct ConnContext {
    /// Directory resolved against for static targets.
    pub doc_root: PathBuf,
    /// In-memory credential table, loaded from the database at startup.
    pub users: Mutex<HashMap<String, String>>,
    /// Read discipline for client sockets.
    pub trigger: TriggerMode,
}

/// What the connection needs next from the reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for (more of) a request.
    Reading,
    /// A response is staged and partially or fully unsent.
    Writing,
    /// The connection is finished and must be closed.
    Closing,
}

/// Result of driving the write state machine once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The staged response went out completely.
    Complete,
    /// The socket stopped accepting bytes; re-arm for writability.
    Blocked,
    /// The peer is gone or the socket failed.
    Closed,
}

/// One live client connection.
#[derive(Debug)]
pub struct HttpConnection {
    token: Token,
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<ConnContext>,
    read_buf: Box<[u8; READ_BUFFER_SIZE]>,
    read_idx: usize,
    parser: RequestParser,
    write_buf: Box<[u8; WRITE_BUFFER_SIZE]>,
    write_idx: usize,
    /// Mapped response file; held for the whole write phase.
    file: Option<Mmap>,
    to_send: usize,
    have_sent: usize,
    phase: Phase,
    /// True while a worker owns this connection.
    in_flight: bool,
    timer: Option<TimerHandle>,
}

impl HttpConnection {
    /// Wraps a freshly accepted socket.
    pub fn new(token: Token, stream: TcpStream, peer: SocketAddr, ctx: Arc<ConnContext>) -> Self {
        Self {
            token,
            stream,
            peer,
            ctx,
            read_buf: Box::new([0; READ_BUFFER_SIZE]),
            read_idx: 0,
            parser: RequestParser::new(),
            write_buf: Box::new([0; WRITE_BUFFER_SIZE]),
            write_idx: 0,
            file: None,
            to_send: 0,
            have_sent: 0,
            phase: Phase::Reading,
            in_flight: false,
            timer: None,
        }
    }

    /// Poll token identifying this connection.
    pub fn token(&self) -> Token {
        self.token
    }

    /// Peer address, for logging.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Registers the socket with the poll set.
    pub fn register(&mut self, registry: &Registry, interest: Interest) -> io::Result<()> {
        registry.register(&mut self.stream, self.token, interest)
    }

    /// Re-arms readiness; on epoll this re-raises a still-pending edge.
    pub fn reregister(&mut self, registry: &Registry, interest: Interest) -> io::Result<()> {
        registry.reregister(&mut self.stream, self.token, interest)
    }

    /// Removes the socket from the poll set.
    pub fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.stream)
    }

    /// Readiness the reactor should arm next, or `None` to close.
    pub fn interest(&self) -> Option<Interest> {
        match self.phase {
            Phase::Reading => Some(Interest::READABLE),
            Phase::Writing => Some(Interest::WRITABLE),
            Phase::Closing => None,
        }
    }

    /// True while a worker owns the connection.
    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// Marks the hand-off to (or back from) a worker.
    pub fn set_in_flight(&mut self, in_flight: bool) {
        self.in_flight = in_flight;
    }

    /// The connection's timer node, if armed.
    pub fn timer(&self) -> Option<TimerHandle> {
        self.timer
    }

    /// Records the timer node backing this connection.
    pub fn set_timer(&mut self, handle: TimerHandle) {
        self.timer = Some(handle);
    }

    /// Detaches the timer node, e.g. once the timer list dropped it.
    pub fn take_timer(&mut self) -> Option<TimerHandle> {
        self.timer.take()
    }

    /// Forces the connection into the closing state.
    pub fn set_closing(&mut self) {
        self.phase = Phase::Closing;
        self.file = None;
    }

    /// Pulls bytes from the socket into the read buffer.
    ///
    /// Returns `Ok(false)` when the peer closed the stream; the caller
    /// closes without attempting a response. Edge mode drains until
    /// `WouldBlock`; level mode takes one read and relies on re-arming.
    pub fn read_once(&mut self) -> io::Result<bool> {
        loop {
            if self.read_idx >= READ_BUFFER_SIZE {
                return Ok(true);
            }
            match self.stream.read(&mut self.read_buf[self.read_idx..]) {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    self.read_idx += n;
                    if self.ctx.trigger == TriggerMode::Level {
                        return Ok(true);
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
    }

    /// Runs the parser over the buffered bytes and, on a complete request,
    /// resolves it into a staged response.
    ///
    /// `db` carries the worker's leased handle; register is the only
    /// operation that uses it.
    pub fn process(&mut self, db: Option<&mut Conn>) {
        match self.parser.parse(&self.read_buf[..], self.read_idx) {
            ParseStatus::Open => {
                if self.read_idx >= READ_BUFFER_SIZE {
                    // no room left to ever complete this request
                    debug!("request from {} exceeds the read buffer", self.peer);
                    self.build_response(Status::BadRequest);
                } else {
                    self.phase = Phase::Reading;
                }
            }
            ParseStatus::Bad => {
                debug!("bad request from {}", self.peer);
                self.build_response(Status::BadRequest);
            }
            ParseStatus::Done => {
                info!("{} {} from {}", self.parser.method, self.parser.url, self.peer);
                let status = self.resolve_target(db);
                self.build_response(status);
            }
        }
    }

    /// Maps the parsed request onto a page under the document root.
    fn resolve_target(&mut self, db: Option<&mut Conn>) -> Status {
        let url = self.parser.url.clone();
        let page = if self.parser.method == Method::Post
            && (url == "/login" || url == "/register")
        {
            let Some((user, password)) = split_credentials(&self.parser.body) else {
                return Status::BadRequest;
            };
            if url == "/login" {
                if self.login_ok(&user, &password) {
                    "/welcome.html".to_owned()
                } else {
                    "/logError.html".to_owned()
                }
            } else if self.register_user(&user, &password, db) {
                "/log.html".to_owned()
            } else {
                "/registerError.html".to_owned()
            }
        } else if url == "/" {
            "/index.html".to_owned()
        } else {
            url
        };
        self.map_file(&page)
    }

    fn login_ok(&self, user: &str, password: &str) -> bool {
        let users = self
            .ctx
            .users
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        users.get(user).is_some_and(|stored| stored == password)
    }

    /// Inserts the credential pair into the database and, on success, the
    /// in-memory map. Holding the map lock across the insert serializes
    /// concurrent registrations of the same name.
    fn register_user(&self, user: &str, password: &str, db: Option<&mut Conn>) -> bool {
        let mut users = self
            .ctx
            .users
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if users.contains_key(user) {
            info!("register rejected, user {user} exists");
            return false;
        }
        let Some(conn) = db else {
            error!("register for {user} reached without a database handle");
            return false;
        };
        match db::insert_user(conn, user, password) {
            Ok(()) => {
                users.insert(user.to_owned(), password.to_owned());
                info!("registered user {user}");
                true
            }
            Err(err) => {
                error!("insert for {user} failed: {err}");
                false
            }
        }
    }

    /// Stats and maps the target file, refusing traversal out of the root.
    fn map_file(&mut self, page: &str) -> Status {
        if Path::new(page)
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Status::Forbidden;
        }

        let path = self.ctx.doc_root.join(page.trim_start_matches('/'));
        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(_) => return Status::NotFound,
        };
        if meta.permissions().mode() & 0o004 == 0 {
            return Status::Forbidden;
        }
        if meta.is_dir() {
            return Status::BadRequest;
        }
        if meta.len() == 0 {
            self.file = None;
            return Status::Ok;
        }

        let file = match File::open(&path) {
            Ok(file) => file,
            Err(_) => return Status::NotFound,
        };
        // SAFETY: the mapping is read-only and private; a concurrent file
        // change can alter bytes but not invalidate the region.
        match unsafe { Mmap::map(&file) } {
            Ok(map) => {
                self.file = Some(map);
                Status::Ok
            }
            Err(err) => {
                error!("mmap of {} failed: {err}", path.display());
                Status::InternalError
            }
        }
    }

    /// Stages the status line, headers and (for errors) the canned body.
    fn build_response(&mut self, status: Status) {
        self.write_idx = 0;
        self.have_sent = 0;
        if status != Status::Ok {
            self.file = None;
        }

        let file_len = self.file.as_ref().map_or(0, |m| m.len());
        let body = if status == Status::Ok && file_len == 0 {
            EMPTY_PAGE
        } else {
            status.body()
        };
        let content_len = if file_len > 0 { file_len } else { body.len() };
        let connection = if self.parser.keep_alive {
            "keep-alive"
        } else {
            "close"
        };

        let ok = self.push(format_args!("HTTP/1.1 {status}\r\n"))
            && self.push(format_args!("Content-Length: {content_len}\r\n"))
            && self.push(format_args!("Connection: {connection}\r\n"))
            && self.push(format_args!("Content-Type: text/html\r\n\r\n"))
            && (body.is_empty() || self.push(format_args!("{body}")));
        if !ok {
            error!("response assembly overflowed the write buffer");
            self.set_closing();
            return;
        }

        self.to_send = self.write_idx + file_len;
        self.phase = Phase::Writing;
    }

    /// Appends formatted text to the write buffer; false on overflow.
    fn push(&mut self, args: fmt::Arguments<'_>) -> bool {
        let mut cursor = Cursor::new(&mut self.write_buf[self.write_idx..]);
        let ok = cursor.write_fmt(args).is_ok();
        self.write_idx += cursor.position() as usize;
        ok
    }

    /// Drives the staged response toward the socket until done or blocked.
    pub fn write(&mut self) -> WriteOutcome {
        loop {
            if self.have_sent >= self.to_send {
                return self.finish_write();
            }

            let file = self.file.as_ref().map_or(&[][..], |m| &m[..]);
            let result = if self.have_sent < self.write_idx {
                let header = &self.write_buf[self.have_sent..self.write_idx];
                if file.is_empty() {
                    self.stream.write(header)
                } else {
                    self.stream
                        .write_vectored(&[IoSlice::new(header), IoSlice::new(file)])
                }
            } else {
                self.stream.write(&file[self.have_sent - self.write_idx..])
            };

            match result {
                Ok(0) => return WriteOutcome::Closed,
                Ok(n) => self.have_sent += n,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.phase = Phase::Writing;
                    return WriteOutcome::Blocked;
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!("write to {} failed: {err}", self.peer);
                    self.set_closing();
                    return WriteOutcome::Closed;
                }
            }
        }
    }

    /// Releases the mapping and either resets for the next request or
    /// transitions to closing, per the client's keep-alive wish.
    fn finish_write(&mut self) -> WriteOutcome {
        self.file = None;
        if self.parser.keep_alive {
            self.reset_for_next();
            self.phase = Phase::Reading;
        } else {
            self.phase = Phase::Closing;
        }
        WriteOutcome::Complete
    }

    fn reset_for_next(&mut self) {
        self.parser.reset();
        self.read_idx = 0;
        self.write_idx = 0;
        self.to_send = 0;
        self.have_sent = 0;
    }
}

fn split_credentials(body: &str) -> Option<(String, String)> {
    let (user_part, password_part) = body.split_once('&')?;
    let user = user_part.strip_prefix("user=")?;
    let password = password_part.strip_prefix("password=")?;
    Some((user.to_owned(), password.to_owned()))
}
