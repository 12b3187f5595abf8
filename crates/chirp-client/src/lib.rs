//! # Chirp Client
//!
//! Client for the Chirp protocol, the line-oriented remote file and
//! job-attribute protocol a running HTCondor job uses to reach its submit
//! side.
//!
//! ## Features
//!
//! - Cookie authentication with ordered method fallback
//! - Whole-file transfer (`getfile` / `putfile`)
//! - Descriptor based reads and writes, plain, positional or strided
//! - Directory, link and metadata operations
//! - Job attribute, user log and phase updates
//! - Connection discovery from `.chirp.config`
//!
//! ## Example
//!
//! ```no_run
//! use chirp_client::{Client, ClientConfig};
//!
//! # fn main() -> chirp_client::Result<()> {
//! let mut client = Client::connect(&ClientConfig::default())?;
//! client.set_job_attr("Progress", "0.5")?;
//! let value = client.get_job_attr("Progress")?;
//! # let _ = value;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod file;
pub mod protocol;
pub mod session;

pub use auth::AuthMethod;
pub use client::{Client, DirListing};
pub use config::{ClientConfig, LogFormat, LoggingConfig, SessionParams};
pub use error::{Error, Result};
pub use file::{Access, FileHandle, IoOptions};
pub use protocol::{ChirpStatus, OpenFlags, Stat, StatFs, Whence};
pub use session::{Session, SessionState};
