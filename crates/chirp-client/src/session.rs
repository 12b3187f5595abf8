//! Chirp transport session
//!
//! A [`Session`] owns at most one TCP connection at a time and moves through
//! `Unconnected → Connecting → Authenticating → Ready → Closed`. The public
//! client opens a fresh session for every operation, so nothing here survives
//! between unrelated calls: descriptors are forgotten on disconnect and the
//! server closes them when the socket goes away.
//!
//! All I/O is blocking. The configured timeout applies to connect, read and
//! write; when it fires the operation fails with [`Error::Timeout`].

use crate::auth::AuthMethod;
use crate::config::SessionParams;
use crate::file::FileHandle;
use crate::protocol::{decode_fixed_record, decode_status_line, Command, Response, CHIRP_LINE_MAX};
use crate::{ChirpStatus, Error, Result};
use std::collections::HashMap;
use std::io::{BufReader, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use tracing::{debug, info, trace};

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No socket has been opened yet
    Unconnected,
    /// TCP connect in progress
    Connecting,
    /// Socket open, credentials not yet accepted
    Authenticating,
    /// Authenticated; commands may be sent
    Ready,
    /// Socket closed after use
    Closed,
}

/// One authenticated connection to a Chirp server
pub struct Session {
    params: SessionParams,
    state: SessionState,
    stream: Option<BufReader<TcpStream>>,
    handles: HashMap<u64, FileHandle>,
}

impl Session {
    /// Create an unconnected session
    pub fn new(params: SessionParams) -> Self {
        Self {
            params,
            state: SessionState::Unconnected,
            stream: None,
            handles: HashMap::new(),
        }
    }

    /// Connection parameters
    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// `true` while a socket is open
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Descriptors opened on this connection
    pub fn open_handles(&self) -> impl Iterator<Item = &FileHandle> {
        self.handles.values()
    }

    /// Look up a tracked descriptor
    pub fn handle(&self, fd: u64) -> Option<&FileHandle> {
        self.handles.get(&fd)
    }

    pub(crate) fn track_handle(&mut self, handle: FileHandle) {
        self.handles.insert(handle.fd, handle);
    }

    pub(crate) fn forget_handle(&mut self, fd: u64) -> Option<FileHandle> {
        self.handles.remove(&fd)
    }

    /// Open the TCP connection.
    ///
    /// An already open socket is closed first. On success the session is
    /// waiting for [`authenticate`](Self::authenticate).
    pub fn connect(&mut self) -> Result<()> {
        if self.stream.is_some() {
            self.disconnect();
        }

        self.state = SessionState::Connecting;
        let target = format!("{}:{}", self.params.host, self.params.port);
        debug!("Connecting to {}", target);

        let addrs = (self.params.host.as_str(), self.params.port)
            .to_socket_addrs()
            .map_err(|e| {
                self.state = SessionState::Closed;
                Error::Connection(format!("{}: {}", target, e))
            })?;

        let mut last_error = None;
        let mut connected = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.params.timeout) {
                Ok(stream) => {
                    connected = Some(stream);
                    break;
                }
                Err(e) => last_error = Some(e),
            }
        }

        let stream = match (connected, last_error) {
            (Some(stream), _) => stream,
            (None, Some(e)) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                self.state = SessionState::Closed;
                return Err(Error::Timeout(format!("connecting to {}", target)));
            }
            (None, Some(e)) => {
                self.state = SessionState::Closed;
                return Err(Error::Connection(format!("{}: {}", target, e)));
            }
            (None, None) => {
                self.state = SessionState::Closed;
                return Err(Error::Connection(format!("{}: no addresses resolved", target)));
            }
        };

        stream.set_read_timeout(Some(self.params.timeout))?;
        stream.set_write_timeout(Some(self.params.timeout))?;
        stream.set_nodelay(true)?;

        self.stream = Some(BufReader::new(stream));
        self.handles.clear();
        self.state = SessionState::Authenticating;
        Ok(())
    }

    /// Present credentials for `method`.
    ///
    /// Cookie authentication requires the literal status `0`; any other
    /// answer (including a server error status) is
    /// [`ChirpStatus::NotAuthenticated`]. Methods this client does not
    /// implement fail with [`Error::AuthNotImplemented`] without touching
    /// the socket.
    pub fn authenticate(&mut self, method: AuthMethod) -> Result<()> {
        if !method.is_implemented() {
            return Err(Error::AuthNotImplemented(method.to_string()));
        }

        let Some(cookie) = self.params.cookie.clone() else {
            debug!("No cookie configured for cookie authentication");
            return Err(Error::Status(ChirpStatus::NotAuthenticated));
        };

        let command = Command::new("cookie").arg(&cookie);
        match self.exchange(&command) {
            Ok(response) if response.is_ok() => {
                self.state = SessionState::Ready;
                debug!("Authenticated with {}:{} using {}", self.params.host, self.params.port, method);
                Ok(())
            }
            Ok(response) => {
                debug!("Cookie rejected with response '{}'", response);
                Err(Error::Status(ChirpStatus::NotAuthenticated))
            }
            Err(Error::Status(status)) => {
                debug!("Cookie rejected with status {}", status.code());
                Err(Error::Status(ChirpStatus::NotAuthenticated))
            }
            Err(e) => Err(e),
        }
    }

    /// Connect and authenticate in one step, closing the socket on failure
    pub fn establish(&mut self, method: AuthMethod) -> Result<()> {
        let result = self.connect().and_then(|()| self.authenticate(method));
        if result.is_err() {
            self.disconnect();
        }
        result
    }

    /// Send a command and read its status line
    pub fn send_command(&mut self, command: &Command) -> Result<Response> {
        self.ensure_ready()?;
        self.exchange(command)
    }

    /// Send a command whose answer comes later, after a raw payload
    pub fn send_command_no_response(&mut self, command: &Command) -> Result<()> {
        self.ensure_ready()?;
        debug!("-> {} ({} args)", command.verb(), command.args().len());
        self.write_line(&command.encode(), false).map(|_| ())
    }

    /// Send an already encoded request line on an authenticated session.
    ///
    /// The line must end with a newline; otherwise it is rejected with
    /// [`Error::InvalidRequest`] before anything is written.
    pub fn send_line(&mut self, line: &[u8], expect_response: bool) -> Result<Option<Response>> {
        check_terminated(line)?;
        self.ensure_ready()?;
        self.write_line(line, expect_response)
    }

    /// Write a terminated line regardless of state; the cookie exchange
    /// goes through here before the session is ready
    fn write_line(&mut self, line: &[u8], expect_response: bool) -> Result<Option<Response>> {
        check_terminated(line)?;
        self.write_all_bytes(line)?;

        if expect_response {
            self.read_status_line().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Read one status line.
    ///
    /// Negative codes are returned as their typed failure.
    pub fn read_status_line(&mut self) -> Result<Response> {
        let line = self.read_line(CHIRP_LINE_MAX)?;
        let response = decode_status_line(&line);
        trace!("<- {:?}", response);
        response
    }

    /// Read one raw newline terminated line of data
    pub fn read_line_data(&mut self) -> Result<String> {
        self.read_line(CHIRP_LINE_MAX)
    }

    /// Read lines until `expected` integer fields have been collected
    pub fn read_record(&mut self, expected: usize) -> Result<Vec<i64>> {
        let mut lines = Vec::new();
        let mut count = 0;
        while count < expected {
            let line = self.read_line_data()?;
            count += line.split_whitespace().count();
            lines.push(line);
        }
        decode_fixed_record(lines.iter().map(String::as_str), expected)
    }

    /// Read exactly `length` bytes of payload into memory
    pub fn read_fixed_payload(&mut self, length: u64) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(usize::try_from(length).unwrap_or(0).min(1 << 20));
        self.read_fixed_payload_into(length, &mut data)?;
        Ok(data)
    }

    /// Stream exactly `length` bytes of payload into `dest`, chunk by chunk.
    ///
    /// Returns the number of bytes received. Use this for large transfers.
    pub fn read_fixed_payload_into<W: Write>(&mut self, length: u64, dest: &mut W) -> Result<u64> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
        let mut chunk = [0u8; CHIRP_LINE_MAX];
        let mut received = 0u64;

        while received < length {
            let want = usize::try_from(length - received)
                .unwrap_or(CHIRP_LINE_MAX)
                .min(CHIRP_LINE_MAX);
            let n = match stream.read(&mut chunk[..want]) {
                Ok(0) => {
                    return Err(Error::ConnectionBroken(format!(
                        "connection closed after {} of {} payload bytes",
                        received, length
                    )));
                }
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::from_socket(e, "reading payload")),
            };
            dest.write_all(&chunk[..n])?;
            received += n as u64;
        }

        dest.flush()?;
        debug!("<- {} payload bytes", received);
        Ok(received)
    }

    /// Write a raw payload announced by the preceding command
    pub fn write_fixed_payload(&mut self, data: &[u8]) -> Result<()> {
        self.write_all_bytes(data)?;
        debug!("-> {} payload bytes", data.len());
        Ok(())
    }

    /// Stream exactly `length` bytes from `source` as a raw payload
    pub fn write_payload_from<R: Read>(&mut self, source: &mut R, length: u64) -> Result<u64> {
        let mut chunk = [0u8; CHIRP_LINE_MAX];
        let mut sent = 0u64;

        while sent < length {
            let want = usize::try_from(length - sent)
                .unwrap_or(CHIRP_LINE_MAX)
                .min(CHIRP_LINE_MAX);
            let n = match source.read(&mut chunk[..want]) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            };
            self.write_all_bytes(&chunk[..n])?;
            sent += n as u64;
        }

        debug!("-> {} payload bytes", sent);
        Ok(sent)
    }

    /// Close the socket and forget every descriptor.
    ///
    /// Safe to call at any time, any number of times.
    pub fn disconnect(&mut self) {
        if let Some(reader) = self.stream.take() {
            let stream = reader.into_inner();
            let _ = stream.shutdown(Shutdown::Both);
            self.state = SessionState::Closed;
            debug!("Disconnected from {}:{}", self.params.host, self.params.port);
        }
        self.handles.clear();
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state {
            SessionState::Ready if self.stream.is_some() => Ok(()),
            SessionState::Authenticating => Err(Error::Status(ChirpStatus::NotAuthenticated)),
            _ => Err(Error::NotConnected),
        }
    }

    fn exchange(&mut self, command: &Command) -> Result<Response> {
        if command.verb() == "cookie" {
            debug!("-> cookie <redacted>");
        } else {
            debug!("-> {}", command);
        }

        match self.write_line(&command.encode(), true)? {
            Some(response) => Ok(response),
            None => Err(Error::Protocol(format!("no response to {}", command.verb()))),
        }
    }

    fn write_all_bytes(&mut self, mut data: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?.get_mut();

        while !data.is_empty() {
            match stream.write(data) {
                Ok(0) => {
                    return Err(Error::ConnectionBroken(
                        "socket accepted zero bytes".to_string(),
                    ));
                }
                Ok(n) => data = &data[n..],
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::from_socket(e, "writing request")),
            }
        }

        stream.flush().map_err(|e| Error::from_socket(e, "flushing request"))
    }

    fn read_line(&mut self, max: usize) -> Result<String> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
        let mut line = Vec::with_capacity(64);
        let mut byte = [0u8; 1];

        loop {
            match stream.read(&mut byte) {
                Ok(0) => {
                    return Err(Error::ConnectionBroken(
                        "connection closed while reading a response line".to_string(),
                    ));
                }
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::from_socket(e, "reading response line")),
            }

            line.push(byte[0]);
            if line.len() > max {
                return Err(Error::OversizedResponse(line.len()));
            }
            if byte[0] == b'\n' {
                break;
            }
        }

        String::from_utf8(line)
            .map_err(|e| Error::Protocol(format!("response line is not valid UTF-8: {}", e)))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("host", &self.params.host)
            .field("port", &self.params.port)
            .field("state", &self.state)
            .field("open_handles", &self.handles.len())
            .finish()
    }
}

fn check_terminated(line: &[u8]) -> Result<()> {
    if line.last() == Some(&b'\n') {
        Ok(())
    } else {
        Err(Error::invalid_request("command line is not newline terminated"))
    }
}

/// Log an established connection
pub(crate) fn log_connected(params: &SessionParams, method: AuthMethod) {
    info!(
        "Connected to Chirp server {}:{} using {} authentication",
        params.host, params.port, method
    );
}
