//! Remote file descriptors
//!
//! Descriptors are handed out by the server on `open` and are only valid on
//! the connection that created them. [`Session`] keeps a table of the ones
//! it opened so callers can inspect them; the table is dropped on disconnect.

use crate::protocol::{Command, OpenFlags, Stat, Whence, DEFAULT_MODE, STAT_FIELDS};
use crate::session::Session;
use crate::{Error, Result};
use tracing::debug;

/// An open remote file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHandle {
    /// Server-assigned descriptor
    pub fd: u64,
    /// Path the descriptor was opened with
    pub path: String,
    /// Flags it was opened with
    pub flags: OpenFlags,
    /// Permission bits requested at open time
    pub mode: u32,
    /// Metadata the server reported right after opening
    pub stat: Stat,
}

/// Offset and stride parameters for `read`/`write`.
///
/// Which protocol verb is used depends on which fields are set; see
/// [`Access::select`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoOptions {
    /// Start this many bytes into the file
    pub offset: Option<u64>,
    /// Bytes transferred per stride
    pub stride_length: Option<u64>,
    /// Bytes skipped between strides
    pub stride_skip: Option<u64>,
}

impl IoOptions {
    /// Positional access at `offset`
    pub fn at(offset: u64) -> Self {
        Self {
            offset: Some(offset),
            ..Self::default()
        }
    }

    /// Strided access starting at the beginning of the file
    pub fn strided(stride_length: u64, stride_skip: u64) -> Self {
        Self {
            offset: None,
            stride_length: Some(stride_length),
            stride_skip: Some(stride_skip),
        }
    }

    /// Move the start of a strided or positional access
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Resolve to an access pattern
    pub fn access(&self) -> Result<Access> {
        Access::select(self.offset, self.stride_length, self.stride_skip)
    }
}

/// Access pattern, one per protocol verb family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// `read` / `write` at the current position
    Sequential,
    /// `pread` / `pwrite`
    Positional {
        /// Absolute file offset
        offset: u64,
    },
    /// `sread` / `swrite`
    Strided {
        /// Absolute file offset of the first stride
        offset: u64,
        /// Bytes per stride
        stride_length: u64,
        /// Bytes skipped between strides
        stride_skip: u64,
    },
}

impl Access {
    /// Pick the access pattern from the optional parameters.
    ///
    /// A stride without an offset starts at 0. A stride needs both its
    /// length and its skip; giving only one is [`Error::InvalidRequest`].
    pub fn select(
        offset: Option<u64>,
        stride_length: Option<u64>,
        stride_skip: Option<u64>,
    ) -> Result<Self> {
        match (offset, stride_length, stride_skip) {
            (None, None, None) => Ok(Access::Sequential),
            (Some(offset), None, None) => Ok(Access::Positional { offset }),
            (offset, Some(stride_length), Some(stride_skip)) => Ok(Access::Strided {
                offset: offset.unwrap_or(0),
                stride_length,
                stride_skip,
            }),
            _ => Err(Error::invalid_request(
                "stride length and stride skip must be given together",
            )),
        }
    }

    /// Request line for reading `length` bytes from `fd`
    pub fn read_command(&self, fd: u64, length: u64) -> Command {
        self.command(["read", "pread", "sread"], fd, length)
    }

    /// Request line announcing a `length` byte write to `fd`
    pub fn write_command(&self, fd: u64, length: u64) -> Command {
        self.command(["write", "pwrite", "swrite"], fd, length)
    }

    fn command(&self, verbs: [&'static str; 3], fd: u64, length: u64) -> Command {
        match *self {
            Access::Sequential => Command::new(verbs[0]).size(fd).size(length),
            Access::Positional { offset } => {
                Command::new(verbs[1]).size(fd).size(length).size(offset)
            }
            Access::Strided {
                offset,
                stride_length,
                stride_skip,
            } => Command::new(verbs[2])
                .size(fd)
                .size(length)
                .size(offset)
                .size(stride_length)
                .size(stride_skip),
        }
    }
}

impl Session {
    /// Open `path` with a subset of `rwatcx` and return the descriptor.
    ///
    /// Flags are validated before anything is sent. The permission mode
    /// defaults to `0777`. The server follows the descriptor with a stat
    /// record of the opened file, which is kept on the handle.
    pub fn open_file(&mut self, path: &str, flags: &str, mode: Option<u32>) -> Result<u64> {
        let flags = OpenFlags::parse(flags)?;
        let mode = mode.unwrap_or(DEFAULT_MODE);

        let command = Command::new("open")
            .arg(path)
            .arg(&flags.to_string())
            .int(mode);
        let fd = self.send_command(&command)?.value()?;
        let stat = Stat::from_fields(&self.read_record(STAT_FIELDS)?)?;

        debug!("Opened {} as descriptor {} ({})", path, fd, flags);
        self.track_handle(FileHandle {
            fd,
            path: path.to_string(),
            flags,
            mode,
            stat,
        });

        Ok(fd)
    }

    /// Read up to `length` bytes from `fd`.
    ///
    /// Returns exactly as many bytes as the server reports available.
    pub fn read_file(&mut self, fd: u64, length: u64, options: IoOptions) -> Result<Vec<u8>> {
        let access = options.access()?;
        let available = self.send_command(&access.read_command(fd, length))?.value()?;
        self.read_fixed_payload(available)
    }

    /// Write the first `length` bytes of `data` to `fd`.
    ///
    /// The return value is the byte count the server reports written, which
    /// may be less than `length`.
    pub fn write_file(
        &mut self,
        fd: u64,
        data: &[u8],
        length: u64,
        options: IoOptions,
    ) -> Result<u64> {
        let access = options.access()?;
        let payload = usize::try_from(length)
            .ok()
            .and_then(|len| data.get(..len))
            .ok_or_else(|| {
                Error::invalid_request(format!(
                    "write of {} bytes exceeds the {} bytes supplied",
                    length,
                    data.len()
                ))
            })?;

        self.send_command_no_response(&access.write_command(fd, length))?;
        self.write_fixed_payload(payload)?;
        self.read_status_line()?.value()
    }

    /// Flush `fd` to stable storage on the server
    pub fn fsync(&mut self, fd: u64) -> Result<()> {
        self.send_command(&Command::new("fsync").size(fd))?;
        Ok(())
    }

    /// Move the file position; returns the new absolute position
    pub fn lseek(&mut self, fd: u64, offset: i64, whence: Whence) -> Result<u64> {
        let command = Command::new("lseek")
            .size(fd)
            .int(offset)
            .int(whence as i64);
        self.send_command(&command)?.value()
    }

    /// Close `fd`
    pub fn close_file(&mut self, fd: u64) -> Result<()> {
        self.send_command(&Command::new("close").size(fd))?;
        self.forget_handle(fd);
        Ok(())
    }
}
