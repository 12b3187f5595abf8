//! Chirp Protocol Implementation
//!
//! Chirp is a line-oriented request/response protocol. A request is a verb
//! followed by space separated arguments and a newline. Responses come in
//! three shapes:
//!
//! - a single status line holding an integer (negative means failure),
//! - a status line announcing a length, followed by exactly that many raw bytes,
//! - one or more lines of whitespace separated integers making up a fixed size
//!   metadata record (`stat`, `lstat`, `statfs`).

use crate::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest single response line the client accepts, and the chunk size used
/// for streaming payloads.
pub const CHIRP_LINE_MAX: usize = 1024;

/// Permission bits used when the caller does not specify a mode (`0777`)
pub const DEFAULT_MODE: u32 = 0o777;

/// Number of integer fields in a `stat`/`lstat` record
pub const STAT_FIELDS: usize = 13;

/// Number of integer fields in a `statfs` record
pub const STATFS_FIELDS: usize = 7;

/// Status codes returned by the Chirp server for failed requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChirpStatus {
    /// -1
    NotAuthenticated,
    /// -2
    NotAuthorized,
    /// -3
    DoesntExist,
    /// -4
    AlreadyExists,
    /// -5
    TooBig,
    /// -6
    NoSpace,
    /// -7
    NoMemory,
    /// -8
    InvalidRequest,
    /// -9
    TooManyOpen,
    /// -10
    Busy,
    /// -11
    TryAgain,
    /// -12
    BadFd,
    /// -13
    IsDir,
    /// -14
    NotDir,
    /// -15
    NotEmpty,
    /// -16
    CrossDeviceLink,
    /// -17
    Offline,
    /// Any other negative code, kept for diagnostics
    Unknown(i64),
}

impl ChirpStatus {
    /// Map a negative status code. Codes without a name become `Unknown`.
    pub fn from_code(code: i64) -> Self {
        match code {
            -1 => ChirpStatus::NotAuthenticated,
            -2 => ChirpStatus::NotAuthorized,
            -3 => ChirpStatus::DoesntExist,
            -4 => ChirpStatus::AlreadyExists,
            -5 => ChirpStatus::TooBig,
            -6 => ChirpStatus::NoSpace,
            -7 => ChirpStatus::NoMemory,
            -8 => ChirpStatus::InvalidRequest,
            -9 => ChirpStatus::TooManyOpen,
            -10 => ChirpStatus::Busy,
            -11 => ChirpStatus::TryAgain,
            -12 => ChirpStatus::BadFd,
            -13 => ChirpStatus::IsDir,
            -14 => ChirpStatus::NotDir,
            -15 => ChirpStatus::NotEmpty,
            -16 => ChirpStatus::CrossDeviceLink,
            -17 => ChirpStatus::Offline,
            other => ChirpStatus::Unknown(other),
        }
    }

    /// Wire value of this status
    pub fn code(&self) -> i64 {
        match self {
            ChirpStatus::NotAuthenticated => -1,
            ChirpStatus::NotAuthorized => -2,
            ChirpStatus::DoesntExist => -3,
            ChirpStatus::AlreadyExists => -4,
            ChirpStatus::TooBig => -5,
            ChirpStatus::NoSpace => -6,
            ChirpStatus::NoMemory => -7,
            ChirpStatus::InvalidRequest => -8,
            ChirpStatus::TooManyOpen => -9,
            ChirpStatus::Busy => -10,
            ChirpStatus::TryAgain => -11,
            ChirpStatus::BadFd => -12,
            ChirpStatus::IsDir => -13,
            ChirpStatus::NotDir => -14,
            ChirpStatus::NotEmpty => -15,
            ChirpStatus::CrossDeviceLink => -16,
            ChirpStatus::Offline => -17,
            ChirpStatus::Unknown(code) => *code,
        }
    }

    /// Fixed human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            ChirpStatus::NotAuthenticated => "The client has not authenticated its identity.",
            ChirpStatus::NotAuthorized => "The client is not authorized to perform that action.",
            ChirpStatus::DoesntExist => "There is no object by that name.",
            ChirpStatus::AlreadyExists => "There is already an object by that name.",
            ChirpStatus::TooBig => "That request is too big to execute.",
            ChirpStatus::NoSpace => "There is not enough space to store that.",
            ChirpStatus::NoMemory => "The server is out of memory.",
            ChirpStatus::InvalidRequest => "The form of the request is invalid.",
            ChirpStatus::TooManyOpen => "There are too many resources in use.",
            ChirpStatus::Busy => "That object is in use by someone else.",
            ChirpStatus::TryAgain => "A temporary condition prevented the request.",
            ChirpStatus::BadFd => "The file descriptor requested is invalid.",
            ChirpStatus::IsDir => "A file-only operation was attempted on a directory.",
            ChirpStatus::NotDir => "A directory operation was attempted on a file.",
            ChirpStatus::NotEmpty => "A directory cannot be removed because it is not empty.",
            ChirpStatus::CrossDeviceLink => "A hard link was attempted across devices.",
            ChirpStatus::Offline => "The requested resource is temporarily not available.",
            ChirpStatus::Unknown(_) => "An unknown error occurred.",
        }
    }
}

impl fmt::Display for ChirpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChirpStatus::Unknown(code) => write!(f, "An unknown error ({code}) occurred."),
            other => f.write_str(other.description()),
        }
    }
}

/// Escape a string argument.
///
/// Backslash, space, newline, tab and carriage return are each prefixed with
/// a backslash. The server undoes this; the client never unescapes.
pub fn quote(arg: &str) -> String {
    let mut out = String::with_capacity(arg.len());
    for c in arg.chars() {
        if matches!(c, '\\' | ' ' | '\n' | '\t' | '\r') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// A single request line: verb plus individually escaped arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    verb: &'static str,
    args: Vec<String>,
}

impl Command {
    /// Start a command with the given verb
    pub fn new(verb: &'static str) -> Self {
        Self {
            verb,
            args: Vec::new(),
        }
    }

    /// Append a string argument, escaping it
    pub fn arg(mut self, value: &str) -> Self {
        self.args.push(quote(value));
        self
    }

    /// Append an integer argument
    pub fn int(mut self, value: impl Into<i64>) -> Self {
        self.args.push(value.into().to_string());
        self
    }

    /// Append an unsigned size argument
    pub fn size(mut self, value: u64) -> Self {
        self.args.push(value.to_string());
        self
    }

    /// Protocol verb
    pub fn verb(&self) -> &'static str {
        self.verb
    }

    /// Escaped arguments, in order
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Encode to a newline terminated request line
    pub fn encode(&self) -> Bytes {
        let len = self.verb.len() + self.args.iter().map(|a| a.len() + 1).sum::<usize>() + 1;
        let mut buf = BytesMut::with_capacity(len);
        buf.put_slice(self.verb.as_bytes());
        for arg in &self.args {
            buf.put_u8(b' ');
            buf.put_slice(arg.as_bytes());
        }
        buf.put_u8(b'\n');
        buf.freeze()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Decoded single-line response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Non-negative integer: a status, length, byte count or descriptor
    Value(u64),
    /// Anything that is not an integer, returned verbatim
    Text(String),
}

impl Response {
    /// Integer value, or a protocol error if the server sent text
    pub fn value(&self) -> Result<u64> {
        match self {
            Response::Value(v) => Ok(*v),
            Response::Text(text) => Err(Error::Protocol(format!(
                "expected an integer response, got '{text}'"
            ))),
        }
    }

    /// `true` for the literal status `0`
    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Value(0))
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Value(v) => write!(f, "{v}"),
            Response::Text(text) => f.write_str(text),
        }
    }
}

/// Decode a status line.
///
/// Trailing whitespace is stripped. Integers are status codes and negative
/// ones are mapped to their failure; anything else is returned as text.
pub fn decode_status_line(line: &str) -> Result<Response> {
    let trimmed = line.trim_end();
    match trimmed.parse::<i64>() {
        Ok(code) => crate::error::check_status(code).map(Response::Value),
        Err(_) => Ok(Response::Text(trimmed.to_string())),
    }
}

/// Concatenate whitespace separated integers across lines until
/// `expected` fields are collected.
///
/// Tokens past `expected` are ignored. Running out of lines first is a
/// protocol error.
pub fn decode_fixed_record<'a, I>(lines: I, expected: usize) -> Result<Vec<i64>>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut fields = Vec::with_capacity(expected);
    for line in lines {
        for token in line.split_whitespace() {
            if fields.len() == expected {
                return Ok(fields);
            }
            let value = token.parse::<i64>().map_err(|e| {
                Error::Protocol(format!("invalid metadata field '{token}': {e}"))
            })?;
            fields.push(value);
        }
        if fields.len() == expected {
            return Ok(fields);
        }
    }

    Err(Error::Protocol(format!(
        "metadata record has {} fields, expected {}",
        fields.len(),
        expected
    )))
}

/// File metadata as reported by `stat`, `lstat` and `getlongdir`.
///
/// Field order is positional on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    /// Device holding the file
    pub device: i64,
    /// Inode number
    pub inode: i64,
    /// Type and permission bits
    pub mode: i64,
    /// Hard link count
    pub nlink: i64,
    /// Owner user id
    pub uid: i64,
    /// Owner group id
    pub gid: i64,
    /// Device id, for special files
    pub rdevice: i64,
    /// Size in bytes
    pub size: i64,
    /// Preferred I/O block size
    pub blksize: i64,
    /// Allocated blocks
    pub blocks: i64,
    /// Last access, seconds since the epoch
    pub atime: i64,
    /// Last modification, seconds since the epoch
    pub mtime: i64,
    /// Last status change, seconds since the epoch
    pub ctime: i64,
}

impl Stat {
    /// Field names in wire order
    pub const FIELD_NAMES: [&'static str; STAT_FIELDS] = [
        "device", "inode", "mode", "nlink", "uid", "gid", "rdevice", "size", "blksize", "blocks",
        "atime", "mtime", "ctime",
    ];

    /// Build from exactly [`STAT_FIELDS`] values
    pub fn from_fields(fields: &[i64]) -> Result<Self> {
        let &[
            device,
            inode,
            mode,
            nlink,
            uid,
            gid,
            rdevice,
            size,
            blksize,
            blocks,
            atime,
            mtime,
            ctime,
        ] = fields
        else {
            return Err(Error::Protocol(format!(
                "stat record needs {STAT_FIELDS} fields, got {}",
                fields.len()
            )));
        };

        Ok(Self {
            device,
            inode,
            mode,
            nlink,
            uid,
            gid,
            rdevice,
            size,
            blksize,
            blocks,
            atime,
            mtime,
            ctime,
        })
    }

    /// Parse a stat record from one or more lines of text
    pub fn parse(text: &str) -> Result<Self> {
        Self::from_fields(&decode_fixed_record(text.lines(), STAT_FIELDS)?)
    }

    /// Values in wire order
    pub fn fields(&self) -> [i64; STAT_FIELDS] {
        [
            self.device,
            self.inode,
            self.mode,
            self.nlink,
            self.uid,
            self.gid,
            self.rdevice,
            self.size,
            self.blksize,
            self.blocks,
            self.atime,
            self.mtime,
            self.ctime,
        ]
    }

    /// Last access time
    pub fn accessed(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.atime, 0)
    }

    /// Last modification time
    pub fn modified(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.mtime, 0)
    }

    /// Last status change time
    pub fn changed(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.ctime, 0)
    }
}

/// Filesystem metadata as reported by `statfs`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatFs {
    /// Filesystem type magic
    pub f_type: i64,
    /// Block size
    pub f_bsize: i64,
    /// Total data blocks
    pub f_blocks: i64,
    /// Free blocks
    pub f_bfree: i64,
    /// Free blocks available to unprivileged users
    pub f_bavail: i64,
    /// Total inodes
    pub f_files: i64,
    /// Free inodes
    pub f_free: i64,
}

impl StatFs {
    /// Field names in wire order
    pub const FIELD_NAMES: [&'static str; STATFS_FIELDS] = [
        "f_type", "f_bsize", "f_blocks", "f_bfree", "f_bavail", "f_files", "f_free",
    ];

    /// Build from exactly [`STATFS_FIELDS`] values
    pub fn from_fields(fields: &[i64]) -> Result<Self> {
        let &[f_type, f_bsize, f_blocks, f_bfree, f_bavail, f_files, f_free] = fields else {
            return Err(Error::Protocol(format!(
                "statfs record needs {STATFS_FIELDS} fields, got {}",
                fields.len()
            )));
        };

        Ok(Self {
            f_type,
            f_bsize,
            f_blocks,
            f_bfree,
            f_bavail,
            f_files,
            f_free,
        })
    }

    /// Values in wire order, matching [`Self::FIELD_NAMES`]
    pub fn fields(&self) -> [i64; STATFS_FIELDS] {
        [
            self.f_type,
            self.f_bsize,
            self.f_blocks,
            self.f_bfree,
            self.f_bavail,
            self.f_files,
            self.f_free,
        ]
    }
}

/// File open flags, a subset of `rwatcx`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct OpenFlags(u8);

impl OpenFlags {
    /// `r`: open for reading
    pub const READ: u8 = 0x01;
    /// `w`: open for writing
    pub const WRITE: u8 = 0x02;
    /// `a`: writes go to the end of the file
    pub const APPEND: u8 = 0x04;
    /// `t`: truncate to zero length
    pub const TRUNC: u8 = 0x08;
    /// `c`: create if missing
    pub const CREAT: u8 = 0x10;
    /// `x`: fail if the file exists (with `c`)
    pub const EXCL: u8 = 0x20;

    const LETTERS: [(char, u8); 6] = [
        ('r', Self::READ),
        ('w', Self::WRITE),
        ('a', Self::APPEND),
        ('t', Self::TRUNC),
        ('c', Self::CREAT),
        ('x', Self::EXCL),
    ];

    /// Parse a flag string such as `"wct"`. Order and repetition don't matter.
    pub fn parse(flags: &str) -> Result<Self> {
        let mut bits = 0;
        for c in flags.chars() {
            let (_, bit) = Self::LETTERS
                .iter()
                .find(|(letter, _)| *letter == c)
                .ok_or_else(|| {
                    Error::InvalidFlags(format!(
                        "'{flags}': flags must be one or more of 'rwatcx'"
                    ))
                })?;
            bits |= bit;
        }

        if bits == 0 {
            return Err(Error::InvalidFlags(
                "flags must be one or more of 'rwatcx'".to_string(),
            ));
        }

        Ok(Self(bits))
    }

    /// `"wct"`: write, create, truncate
    pub fn write_create_truncate() -> Self {
        Self(Self::WRITE | Self::CREAT | Self::TRUNC)
    }

    /// `"r"`
    pub fn read_only() -> Self {
        Self(Self::READ)
    }

    /// Read access requested
    pub fn has_read(&self) -> bool {
        self.0 & Self::READ != 0
    }

    /// Write access requested
    pub fn has_write(&self) -> bool {
        self.0 & Self::WRITE != 0
    }

    /// Append mode
    pub fn has_append(&self) -> bool {
        self.0 & Self::APPEND != 0
    }

    /// Truncate on open
    pub fn has_trunc(&self) -> bool {
        self.0 & Self::TRUNC != 0
    }

    /// Create if missing
    pub fn has_creat(&self) -> bool {
        self.0 & Self::CREAT != 0
    }

    /// Exclusive create
    pub fn has_excl(&self) -> bool {
        self.0 & Self::EXCL != 0
    }
}

impl fmt::Display for OpenFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (letter, bit) in Self::LETTERS {
            if self.0 & bit != 0 {
                write!(f, "{letter}")?;
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for OpenFlags {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Access check mask, built from a subset of `frwx`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessMode(u32);

impl AccessMode {
    /// Existence check only
    pub const EXISTS: u32 = 0;
    /// `S_IROTH`
    pub const READ: u32 = 0o4;
    /// `S_IWOTH`
    pub const WRITE: u32 = 0o2;
    /// `S_IXOTH`
    pub const EXECUTE: u32 = 0o1;

    /// Parse a mode string such as `"rw"`
    pub fn parse(mode: &str) -> Result<Self> {
        let mut bits = Self::EXISTS;
        for c in mode.chars() {
            bits |= match c {
                'f' => Self::EXISTS,
                'r' => Self::READ,
                'w' => Self::WRITE,
                'x' => Self::EXECUTE,
                other => return Err(Error::InvalidAccessMode(other)),
            };
        }
        Ok(Self(bits))
    }

    /// Protocol bitmask
    pub fn bits(&self) -> u32 {
        self.0
    }
}

/// Reference point for `lseek`
#[repr(i64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    /// From the start of the file
    Set = 0,
    /// From the current position
    Current = 1,
    /// From the end of the file
    End = 2,
}
