//! Chirp Client Implementation
//!
//! Every public operation opens a fresh authenticated connection, runs one
//! or more commands, and closes the connection again, whether or not the
//! operation succeeded. Nothing is carried between calls except the
//! authentication method chosen at construction time.

use crate::auth::{self, AuthMethod};
use crate::config::{ClientConfig, SessionParams};
use crate::file::IoOptions;
use crate::protocol::{
    AccessMode, Command, OpenFlags, Stat, StatFs, CHIRP_LINE_MAX, DEFAULT_MODE, STATFS_FIELDS,
    STAT_FIELDS,
};
use crate::session::{self, Session};
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tracing::{debug, info, warn};

/// Result of a directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirListing {
    /// Entry names in server order
    Names(Vec<String>),
    /// Entry names with their metadata
    Long(BTreeMap<String, Stat>),
}

/// Chirp Client
pub struct Client {
    auth_method: AuthMethod,
    session: Session,
}

impl Client {
    /// Resolve the configuration and find a working authentication method.
    ///
    /// Methods are tried in order with a full connect/authenticate cycle
    /// each; the first accepted one is kept for every later call. If none
    /// is accepted this fails with [`Error::AuthenticationFailed`].
    pub fn connect(config: &ClientConfig) -> Result<Self> {
        let params = config.resolve()?;
        Self::with_params(params, &config.auth_methods)
    }

    /// Connect using only `.chirp.config` discovery and cookie auth
    pub fn from_environment() -> Result<Self> {
        Self::connect(&ClientConfig::default())
    }

    /// Connect with already resolved parameters
    pub fn with_params(params: SessionParams, methods: &[AuthMethod]) -> Result<Self> {
        let mut session = Session::new(params);

        let auth_method = auth::negotiate(methods, |method| {
            let result = session.establish(method);
            session.disconnect();
            result
        })?;

        session::log_connected(session.params(), auth_method);
        Ok(Self {
            auth_method,
            session,
        })
    }

    /// Authentication method in use
    pub fn auth_method(&self) -> AuthMethod {
        self.auth_method
    }

    /// Server host
    pub fn host(&self) -> &str {
        &self.session.params().host
    }

    /// Server port
    pub fn port(&self) -> u16 {
        self.session.params().port
    }

    /// Run `op` on a freshly authenticated connection, then disconnect
    fn with_session<T>(&mut self, op: impl FnOnce(&mut Session) -> Result<T>) -> Result<T> {
        self.session.establish(self.auth_method)?;
        let result = op(&mut self.session);
        self.session.disconnect();
        result
    }

    fn simple(&mut self, command: Command) -> Result<()> {
        self.with_session(|s| s.send_command(&command).map(|_| ()))
    }

    fn fetch_string(&mut self, command: Command) -> Result<String> {
        let data = self.with_session(|s| {
            let length = s.send_command(&command)?.value()?;
            s.read_fixed_payload(length)
        })?;
        String::from_utf8(data)
            .map_err(|e| Error::Protocol(format!("{} returned invalid UTF-8: {}", command.verb(), e)))
    }

    // Job-specific operations

    /// Copy `remote_file` on the submit side to `local_file`
    pub fn fetch(&mut self, remote_file: &str, local_file: &Path) -> Result<u64> {
        self.getfile(remote_file, local_file)
    }

    /// Copy `local_file` to `remote_file` on the submit side.
    ///
    /// The default flags `"wct"` use the whole-file `putfile` transfer. Any
    /// other flag set reads the entire local file into memory and goes
    /// through descriptor based [`write`](Self::write); a partial write is
    /// reported as [`Error::ShortWrite`].
    pub fn put(
        &mut self,
        local_file: &Path,
        remote_file: &str,
        flags: &str,
        mode: Option<u32>,
    ) -> Result<u64> {
        let parsed = OpenFlags::parse(flags)?;
        if parsed == OpenFlags::write_create_truncate() {
            return self.putfile(local_file, remote_file, mode);
        }

        let data = std::fs::read(local_file)?;
        let written = self.write(&data, remote_file, flags, mode, None, IoOptions::default())?;
        if written < data.len() as u64 {
            return Err(Error::ShortWrite {
                written,
                expected: data.len() as u64,
            });
        }
        Ok(written)
    }

    /// Remove a file on the submit side
    pub fn remove(&mut self, remote_file: &str) -> Result<()> {
        self.unlink(remote_file)
    }

    /// Value of a job attribute
    pub fn get_job_attr(&mut self, name: &str) -> Result<String> {
        self.fetch_string(Command::new("get_job_attr").arg(name))
    }

    /// Value of a job attribute as known to the local execution side,
    /// which may lag behind the submit side
    pub fn get_job_attr_delayed(&mut self, name: &str) -> Result<String> {
        self.fetch_string(Command::new("get_job_attr_delayed").arg(name))
    }

    /// Set a job attribute immediately
    pub fn set_job_attr(&mut self, name: &str, value: &str) -> Result<()> {
        self.simple(Command::new("set_job_attr").arg(name).arg(value))
    }

    /// Set a job attribute as a non-durable update sent with the next
    /// regular status exchange
    pub fn set_job_attr_delayed(&mut self, name: &str, value: &str) -> Result<()> {
        self.simple(Command::new("set_job_attr_delayed").arg(name).arg(value))
    }

    /// Append a message to the job's user log
    pub fn ulog(&mut self, text: &str) -> Result<()> {
        self.simple(Command::new("ulog").arg(text))
    }

    /// Announce that the job entered a new phase
    pub fn phase(&mut self, phase: &str) -> Result<()> {
        self.simple(Command::new("phase").arg(phase))
    }

    // Descriptor based transfers

    /// Read up to `length` bytes of `remote_path`, optionally at an offset
    /// and/or in strides
    pub fn read(&mut self, remote_path: &str, length: u64, options: IoOptions) -> Result<Vec<u8>> {
        options.access()?;
        debug!("Reading {} bytes from {}", length, remote_path);

        self.with_session(|s| {
            let fd = s.open_file(remote_path, "r", None)?;
            let data = s.read_file(fd, length, options)?;
            s.close_file(fd)?;
            Ok(data)
        })
    }

    /// Write `data` to `remote_path`.
    ///
    /// `flags` must include `w`. `length` defaults to the whole of `data`.
    /// The file is fsynced before it is closed. Returns the byte count the
    /// server reports written.
    pub fn write(
        &mut self,
        data: &[u8],
        remote_path: &str,
        flags: &str,
        mode: Option<u32>,
        length: Option<u64>,
        options: IoOptions,
    ) -> Result<u64> {
        let parsed = OpenFlags::parse(flags)?;
        if !parsed.has_write() {
            return Err(Error::InvalidFlags(format!(
                "'w' is not included in flags '{}'",
                flags
            )));
        }
        options.access()?;

        let length = length.unwrap_or(data.len() as u64);
        if length > data.len() as u64 {
            return Err(Error::invalid_request(format!(
                "write of {} bytes exceeds the {} bytes supplied",
                length,
                data.len()
            )));
        }
        debug!("Writing {} bytes to {}", length, remote_path);

        self.with_session(|s| {
            let fd = s.open_file(remote_path, flags, mode)?;
            let written = s.write_file(fd, data, length, options)?;
            s.fsync(fd)?;
            s.close_file(fd)?;
            Ok(written)
        })
    }

    // Whole-file transfers

    /// Retrieve an entire remote file into `local_file`.
    ///
    /// If the transfer fails after the local file was created, the partial
    /// file is removed.
    pub fn getfile(&mut self, remote_file: &str, local_file: &Path) -> Result<u64> {
        self.with_session(|s| {
            let length = s
                .send_command(&Command::new("getfile").arg(remote_file))?
                .value()?;
            let mut out = BufWriter::new(File::create(local_file)?);
            let transfer = s
                .read_fixed_payload_into(length, &mut out)
                .and_then(|received| {
                    out.flush()?;
                    Ok(received)
                });

            match transfer {
                Ok(received) => {
                    info!("Fetched {} ({} bytes) into {:?}", remote_file, received, local_file);
                    Ok(received)
                }
                Err(e) => {
                    drop(out);
                    if let Err(cleanup) = std::fs::remove_file(local_file) {
                        warn!("Could not remove partial file {:?}: {}", local_file, cleanup);
                    }
                    Err(e)
                }
            }
        })
    }

    /// Retrieve an entire remote file into any writer
    pub fn getfile_to<W: Write>(&mut self, remote_file: &str, dest: &mut W) -> Result<u64> {
        self.with_session(|s| {
            let length = s
                .send_command(&Command::new("getfile").arg(remote_file))?
                .value()?;
            s.read_fixed_payload_into(length, dest)
        })
    }

    /// Store an entire local file as `remote_file`, creating or replacing it.
    ///
    /// Returns the byte count the server reports stored.
    pub fn putfile(&mut self, local_file: &Path, remote_file: &str, mode: Option<u32>) -> Result<u64> {
        let mode = mode.unwrap_or(DEFAULT_MODE);
        let file = File::open(local_file)?;
        let length = file.metadata()?.len();
        let mut source = BufReader::new(file);

        let stored = self.with_session(|s| {
            let command = Command::new("putfile")
                .arg(remote_file)
                .int(mode)
                .size(length);
            s.send_command(&command)?;
            let sent = s.write_payload_from(&mut source, length)?;
            if sent < length {
                return Err(Error::Protocol(format!(
                    "{:?} shrank while sending: {} of {} bytes",
                    local_file, sent, length
                )));
            }
            s.read_status_line()?.value()
        })?;

        info!("Stored {:?} as {} ({} bytes)", local_file, remote_file, stored);
        Ok(stored)
    }

    // Namespace operations

    /// Rename (move) a remote path
    pub fn rename(&mut self, old_path: &str, new_path: &str) -> Result<()> {
        self.simple(Command::new("rename").arg(old_path).arg(new_path))
    }

    /// Delete a remote file
    pub fn unlink(&mut self, remote_file: &str) -> Result<()> {
        self.simple(Command::new("unlink").arg(remote_file))
    }

    /// Delete a remote directory; it must be empty unless `recursive`
    pub fn rmdir(&mut self, remote_path: &str, recursive: bool) -> Result<()> {
        if recursive {
            return self.rmall(remote_path);
        }
        self.simple(Command::new("rmdir").arg(remote_path))
    }

    /// Recursively delete a remote directory
    pub fn rmall(&mut self, remote_path: &str) -> Result<()> {
        self.simple(Command::new("rmall").arg(remote_path))
    }

    /// Create a remote directory (mode defaults to `0777`)
    pub fn mkdir(&mut self, remote_path: &str, mode: Option<u32>) -> Result<()> {
        let mode = mode.unwrap_or(DEFAULT_MODE);
        self.simple(Command::new("mkdir").arg(remote_path).int(mode))
    }

    /// Names in a remote directory
    pub fn getdir(&mut self, remote_path: &str) -> Result<Vec<String>> {
        let listing = self.fetch_string(Command::new("getdir").arg(remote_path))?;
        Ok(parse_listing(&listing))
    }

    /// Names in a remote directory together with their metadata
    pub fn getlongdir(&mut self, remote_path: &str) -> Result<BTreeMap<String, Stat>> {
        let listing = self.fetch_string(Command::new("getlongdir").arg(remote_path))?;
        parse_long_listing(&listing)
    }

    /// List a directory, with metadata when `with_metadata` is set
    pub fn listdir(&mut self, remote_path: &str, with_metadata: bool) -> Result<DirListing> {
        if with_metadata {
            self.getlongdir(remote_path).map(DirListing::Long)
        } else {
            self.getdir(remote_path).map(DirListing::Names)
        }
    }

    /// Create a hard link, or a symbolic one when `symbolic`
    pub fn link(&mut self, old_path: &str, new_path: &str, symbolic: bool) -> Result<()> {
        if symbolic {
            return self.symlink(old_path, new_path);
        }
        self.simple(Command::new("link").arg(old_path).arg(new_path))
    }

    /// Create a symbolic link
    pub fn symlink(&mut self, old_path: &str, new_path: &str) -> Result<()> {
        self.simple(Command::new("symlink").arg(old_path).arg(new_path))
    }

    /// Target of a symbolic link
    pub fn readlink(&mut self, remote_path: &str) -> Result<String> {
        self.fetch_string(
            Command::new("readlink")
                .arg(remote_path)
                .size(CHIRP_LINE_MAX as u64),
        )
    }

    // Identity

    /// The caller's identity as seen by the server
    pub fn whoami(&mut self) -> Result<String> {
        self.fetch_string(Command::new("whoami").size(CHIRP_LINE_MAX as u64))
    }

    /// The server's identity as seen from `remote_host`
    pub fn whoareyou(&mut self, remote_host: &str) -> Result<String> {
        self.fetch_string(
            Command::new("whoareyou")
                .arg(remote_host)
                .size(CHIRP_LINE_MAX as u64),
        )
    }

    // Metadata

    /// Metadata of a path, following symbolic links
    pub fn stat(&mut self, remote_path: &str) -> Result<Stat> {
        self.stat_with("stat", remote_path)
    }

    /// Metadata of a path without following symbolic links
    pub fn lstat(&mut self, remote_path: &str) -> Result<Stat> {
        self.stat_with("lstat", remote_path)
    }

    fn stat_with(&mut self, verb: &'static str, remote_path: &str) -> Result<Stat> {
        let fields = self.with_session(|s| {
            s.send_command(&Command::new(verb).arg(remote_path))?;
            s.read_record(STAT_FIELDS)
        })?;
        Stat::from_fields(&fields)
    }

    /// Metadata of the filesystem holding a path
    pub fn statfs(&mut self, remote_path: &str) -> Result<StatFs> {
        let fields = self.with_session(|s| {
            s.send_command(&Command::new("statfs").arg(remote_path))?;
            s.read_record(STATFS_FIELDS)
        })?;
        StatFs::from_fields(&fields)
    }

    /// Check access to a path with a mode built from `frwx`.
    ///
    /// A denied bit surfaces as `NotAuthorized`.
    pub fn access(&mut self, remote_path: &str, mode: &str) -> Result<()> {
        let mode = AccessMode::parse(mode)?;
        self.simple(Command::new("access").arg(remote_path).int(mode.bits()))
    }

    /// Change permission bits
    pub fn chmod(&mut self, remote_path: &str, mode: u32) -> Result<()> {
        self.simple(Command::new("chmod").arg(remote_path).int(mode))
    }

    /// Change ownership, following symbolic links
    pub fn chown(&mut self, remote_path: &str, uid: i64, gid: i64) -> Result<()> {
        self.simple(Command::new("chown").arg(remote_path).int(uid).int(gid))
    }

    /// Change ownership of the link itself
    pub fn lchown(&mut self, remote_path: &str, uid: i64, gid: i64) -> Result<()> {
        self.simple(Command::new("lchown").arg(remote_path).int(uid).int(gid))
    }

    /// Truncate a file to `length` bytes
    pub fn truncate(&mut self, remote_path: &str, length: u64) -> Result<()> {
        self.simple(Command::new("truncate").arg(remote_path).size(length))
    }

    /// Set access and modification times (seconds since the Unix epoch)
    pub fn utime(&mut self, remote_path: &str, atime: i64, mtime: i64) -> Result<()> {
        self.simple(Command::new("utime").arg(remote_path).int(atime).int(mtime))
    }
}

impl fmt::Display for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Client({}, {}) using {} authentication",
            self.host(),
            self.port(),
            self.auth_method
        )
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("auth_method", &self.auth_method)
            .field("session", &self.session)
            .finish()
    }
}

/// Split a `getdir` payload into entry names
fn parse_listing(payload: &str) -> Vec<String> {
    payload
        .trim_end_matches('\n')
        .split('\n')
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// Split a `getlongdir` payload of alternating name and stat lines
fn parse_long_listing(payload: &str) -> Result<BTreeMap<String, Stat>> {
    let lines: Vec<&str> = payload
        .trim_end_matches('\n')
        .split('\n')
        .filter(|line| !line.is_empty())
        .collect();

    if lines.len() % 2 != 0 {
        return Err(Error::Protocol(format!(
            "long listing has {} lines, expected name/stat pairs",
            lines.len()
        )));
    }

    lines
        .chunks_exact(2)
        .map(|pair| Ok((pair[0].to_string(), Stat::parse(pair[1])?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listing() {
        assert_eq!(parse_listing("x\ny\n"), vec!["x", "y"]);
        assert_eq!(parse_listing("with space\n"), vec!["with space"]);
        assert!(parse_listing("").is_empty());
    }

    #[test]
    fn test_parse_long_listing() {
        let payload = "x\n1 2 3 4 5 6 7 8 9 10 11 12 13\ny\n21 22 23 24 25 26 27 28 29 30 31 32 33\n";
        let listing = parse_long_listing(payload).unwrap();
        assert_eq!(listing.len(), 2);
        assert_eq!(listing["x"].device, 1);
        assert_eq!(listing["x"].ctime, 13);
        assert_eq!(listing["y"].size, 28);
    }

    #[test]
    fn test_parse_long_listing_rejects_dangling_name() {
        assert!(parse_long_listing("x\n1 2 3 4 5 6 7 8 9 10 11 12 13\ny\n").is_err());
        assert!(parse_long_listing("").unwrap().is_empty());
    }
}
