//! Scripted Chirp server for integration tests
//!
//! The server accepts one connection per conversation, in order, checks each
//! request line against the script and writes back the canned reply. Every
//! line and payload it receives is recorded so tests can assert on the exact
//! wire traffic.

#![allow(dead_code)]

use chirp_client::ClientConfig;
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const COOKIE: &str = "abc123";

/// One scripted exchange
#[derive(Debug, Clone)]
pub enum Step {
    /// Expect a request line (without newline), then send `reply` verbatim
    Line { expect: String, reply: Vec<u8> },
    /// Expect `length` raw payload bytes, then send `reply` verbatim
    Payload { length: usize, reply: Vec<u8> },
    /// Close the connection right away
    Hangup,
}

/// What the server saw on one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Line(String),
    Payload(Vec<u8>),
    /// Client hung up
    Closed,
}

fn join_lines(replies: &[&str]) -> Vec<u8> {
    let mut out = Vec::new();
    for reply in replies {
        out.extend_from_slice(reply.as_bytes());
        out.push(b'\n');
    }
    out
}

/// Expect `expect` and answer with each of `replies` on its own line
pub fn line(expect: &str, replies: &[&str]) -> Step {
    Step::Line {
        expect: expect.to_string(),
        reply: join_lines(replies),
    }
}

/// Expect `expect` and send no answer yet
pub fn silent(expect: &str) -> Step {
    line(expect, &[])
}

/// Expect `expect`, answer with a length line followed by `payload`
pub fn with_payload(expect: &str, payload: &[u8]) -> Step {
    let length = payload.len().to_string();
    let mut reply = join_lines(&[length.as_str()]);
    reply.extend_from_slice(payload);
    Step::Line {
        expect: expect.to_string(),
        reply,
    }
}

/// Drop the connection without answering
pub fn hangup() -> Step {
    Step::Hangup
}

/// Expect `length` raw bytes and answer with each of `replies`
pub fn payload(length: usize, replies: &[&str]) -> Step {
    Step::Payload {
        length,
        reply: join_lines(replies),
    }
}

fn cookie_line() -> String {
    format!("cookie {COOKIE}")
}

/// Prefix a conversation with a successful cookie exchange
pub fn authed(steps: Vec<Step>) -> Vec<Step> {
    let mut all = vec![line(&cookie_line(), &["0"])];
    all.extend(steps);
    all
}

/// The conversation `Client::connect` has when cookie auth succeeds
pub fn handshake() -> Vec<Step> {
    authed(Vec::new())
}

pub struct MockServer {
    port: u16,
    handle: JoinHandle<Vec<Vec<Received>>>,
}

impl MockServer {
    /// Serve `conversations`, one accepted connection each
    pub fn start(conversations: Vec<Vec<Step>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        listener.set_nonblocking(true).unwrap();

        let handle = thread::spawn(move || {
            let mut transcripts = Vec::new();
            for steps in conversations {
                let Some(stream) = accept_within(&listener, Duration::from_secs(5)) else {
                    break;
                };
                transcripts.push(serve(stream, steps));
            }
            transcripts
        });

        Self { port, handle }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Client configuration pointing at this server
    pub fn config(&self) -> ClientConfig {
        ClientConfig::new("127.0.0.1", self.port)
            .with_cookie(COOKIE)
            .with_timeout(Duration::from_secs(5))
    }

    /// Wait for every conversation to finish and return what was received
    pub fn finish(self) -> Vec<Vec<Received>> {
        self.handle.join().unwrap()
    }
}

/// Accept one connection, giving up after `limit` so a failing test
/// cannot hang the suite
fn accept_within(listener: &TcpListener, limit: Duration) -> Option<TcpStream> {
    let deadline = Instant::now() + limit;
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false).unwrap();
                return Some(stream);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock && Instant::now() < deadline => {
                thread::sleep(Duration::from_millis(10));
            }
            Err(_) => return None,
        }
    }
}

fn serve(stream: TcpStream, steps: Vec<Step>) -> Vec<Received> {
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut writer = stream.try_clone().unwrap();
    let mut reader = BufReader::new(stream);
    let mut received = Vec::new();

    for step in steps {
        let reply = match step {
            Step::Line { expect, reply } => {
                let mut raw = String::new();
                match reader.read_line(&mut raw) {
                    Ok(0) | Err(_) => {
                        received.push(Received::Closed);
                        return received;
                    }
                    Ok(_) => {}
                }
                let got = raw.trim_end_matches('\n').to_string();
                let matched = got == expect;
                received.push(Received::Line(got));
                if !matched {
                    return received;
                }
                reply
            }
            Step::Payload { length, reply } => {
                let mut data = vec![0u8; length];
                if reader.read_exact(&mut data).is_err() {
                    received.push(Received::Closed);
                    return received;
                }
                received.push(Received::Payload(data));
                reply
            }
            Step::Hangup => return received,
        };

        if writer.write_all(&reply).is_err() {
            return received;
        }
    }

    let mut rest = Vec::new();
    match reader.read_to_end(&mut rest) {
        Ok(_) if rest.is_empty() => received.push(Received::Closed),
        Ok(_) => {
            received.push(Received::Payload(rest));
            received.push(Received::Closed);
        }
        Err(_) => {}
    }
    received
}

/// Shorthand for building expected transcripts
pub fn lines(items: &[&str]) -> Vec<Received> {
    items.iter().map(|l| Received::Line((*l).to_string())).collect()
}

/// Expected transcript of an authenticated conversation that ends cleanly
pub fn session(items: &[&str]) -> Vec<Received> {
    let cookie = cookie_line();
    let mut all = lines(&[cookie.as_str()]);
    all.extend(lines(items));
    all.push(Received::Closed);
    all
}

/// Minimal stat line with a recognisable size
pub fn stat_line(size: i64) -> String {
    format!("2049 1234 33188 1 1000 1000 0 {size} 4096 8 1700000000 1700000001 1700000002")
}
