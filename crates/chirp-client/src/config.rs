//! Configuration for the Chirp client
//!
//! Connection parameters come from one of two places. Callers may give the
//! host and port explicitly (directly or through a TOML file). Jobs running
//! under an I/O proxy instead find a `.chirp.config` file in their scratch
//! directory holding `host port cookie`.

use crate::auth::AuthMethod;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Name of the session discovery file
pub const CHIRP_CONFIG_FILE: &str = ".chirp.config";

/// Environment variable naming the job's scratch directory
pub const SCRATCH_DIR_ENV: &str = "_CONDOR_SCRATCH_DIR";

/// Chirp client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server host name or address
    #[serde(default)]
    pub host: Option<String>,

    /// Server port
    #[serde(default)]
    pub port: Option<u16>,

    /// Shared secret for cookie authentication
    #[serde(default)]
    pub cookie: Option<String>,

    /// Authentication methods to try, in order
    #[serde(default = "default_auth_methods")]
    pub auth_methods: Vec<AuthMethod>,

    /// Socket timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Logging configuration (used by the command-line front end)
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (text or json)
    pub format: LogFormat,
    /// Optional log file path (logs to stderr if not specified)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text logging for human readability
    Text,
    /// One JSON object per event
    Json,
}

/// Fully resolved connection parameters for a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    /// Server host name or address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Shared secret, if any
    pub cookie: Option<String>,
    /// Socket timeout applied to connect, read and write
    pub timeout: Duration,
}

/// Contents of a `.chirp.config` file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredSession {
    /// Proxy host
    pub host: String,
    /// Proxy port
    pub port: u16,
    /// Proxy cookie
    pub cookie: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            cookie: None,
            auth_methods: default_auth_methods(),
            timeout_secs: default_timeout(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Configuration for an explicitly addressed server
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: Some(host.into()),
            port: Some(port),
            ..Self::default()
        }
    }

    /// Set the cookie used for cookie authentication
    pub fn with_cookie(mut self, cookie: impl Into<String>) -> Self {
        self.cookie = Some(cookie.into());
        self
    }

    /// Set the socket timeout.
    ///
    /// The timeout is kept in whole seconds; a partial second rounds up, so
    /// the effective timeout is never shorter than requested.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let partial = u64::from(timeout.subsec_nanos() > 0);
        self.timeout_secs = timeout.as_secs().saturating_add(partial).max(1);
        self
    }

    /// Set the authentication methods to try
    pub fn with_auth_methods(mut self, methods: Vec<AuthMethod>) -> Self {
        self.auth_methods = methods;
        self
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.auth_methods.is_empty() {
            return Err(crate::Error::Config(
                "At least one authentication method is required".to_string(),
            ));
        }

        if self.timeout_secs == 0 {
            return Err(crate::Error::Config(
                "timeout_secs must be greater than zero".to_string(),
            ));
        }

        if self.port == Some(0) {
            return Err(crate::Error::Config("port must not be zero".to_string()));
        }

        Ok(())
    }

    /// Path of the discovery file: in the scratch directory if the
    /// environment names one, otherwise in the current directory.
    pub fn discovery_path() -> PathBuf {
        match std::env::var_os(SCRATCH_DIR_ENV) {
            Some(dir) => PathBuf::from(dir).join(CHIRP_CONFIG_FILE),
            None => PathBuf::from(CHIRP_CONFIG_FILE),
        }
    }

    /// Read `.chirp.config` from its default location
    pub fn discover() -> crate::Result<DiscoveredSession> {
        read_discovery_file(&Self::discovery_path())
    }

    /// Resolve connection parameters, reading the discovery file from the
    /// default location when needed.
    pub fn resolve(&self) -> crate::Result<SessionParams> {
        self.resolve_with(&Self::discovery_path())
    }

    /// Resolve connection parameters against a specific discovery file.
    ///
    /// An explicit host and port always win. Otherwise the discovery file is
    /// used when cookie authentication is requested without a cookie.
    pub fn resolve_with(&self, discovery_file: &Path) -> crate::Result<SessionParams> {
        self.validate()?;

        let timeout = Duration::from_secs(self.timeout_secs);

        if let (Some(host), Some(port)) = (&self.host, self.port) {
            return Ok(SessionParams {
                host: host.clone(),
                port,
                cookie: self.cookie.clone(),
                timeout,
            });
        }

        if self.auth_methods.contains(&AuthMethod::Cookie)
            && self.cookie.is_none()
            && discovery_file.is_file()
        {
            let found = read_discovery_file(discovery_file)?;
            debug!(
                "Using Chirp session from {:?}: {}:{}",
                discovery_file, found.host, found.port
            );
            return Ok(SessionParams {
                host: found.host,
                port: found.port,
                cookie: Some(found.cookie),
                timeout,
            });
        }

        Err(crate::Error::Config(format!(
            "{} must be present or you must provide a host and port",
            CHIRP_CONFIG_FILE
        )))
    }
}

/// Read `.chirp.config` from `dir`
pub fn discover_in(dir: &Path) -> crate::Result<DiscoveredSession> {
    read_discovery_file(&dir.join(CHIRP_CONFIG_FILE))
}

/// Read and parse a discovery file
pub fn read_discovery_file(path: &Path) -> crate::Result<DiscoveredSession> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| crate::Error::Config(format!("Error reading {:?}: {}", path, e)))?;

    parse_discovery(&content)
        .map_err(|e| crate::Error::Config(format!("Error reading {:?}: {}", path, e)))
}

/// Parse whitespace separated `host port cookie`
pub fn parse_discovery(content: &str) -> std::result::Result<DiscoveredSession, String> {
    let tokens: Vec<&str> = content.split_whitespace().collect();
    let [host, port, cookie] = tokens.as_slice() else {
        return Err(format!(
            "expected 'host port cookie', found {} fields",
            tokens.len()
        ));
    };

    let port = port
        .parse::<u16>()
        .map_err(|e| format!("invalid port '{}': {}", port, e))?;

    Ok(DiscoveredSession {
        host: (*host).to_string(),
        port,
        cookie: (*cookie).to_string(),
    })
}

fn default_auth_methods() -> Vec<AuthMethod> {
    vec![AuthMethod::Cookie]
}

fn default_timeout() -> u64 {
    10
}
