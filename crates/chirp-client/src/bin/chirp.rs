//! Chirp Command-Line Client
//!
//! Run with: cargo run --bin chirp -- <command>
//!
//! Inside a job the connection is discovered from `.chirp.config`; outside
//! one, pass `--host`, `--port` and `--cookie`.

use anyhow::{Context, Result};
use chirp_client::{AuthMethod, Client, ClientConfig, DirListing, IoOptions, LogFormat};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server host
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Server port
    #[arg(short, long)]
    port: Option<u16>,

    /// Authentication cookie
    #[arg(long)]
    cookie: Option<String>,

    /// Authentication methods to try, in order
    #[arg(long, value_delimiter = ',')]
    auth: Vec<AuthMethod>,

    /// Socket timeout in seconds
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Verbose logging (debug level)
    #[arg(short, long)]
    verbose: bool,

    /// Log format (json or text)
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Log file path
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Copy a remote file to a local path
    Fetch {
        /// Remote file path
        remote: String,
        /// Local file path
        local: PathBuf,
    },
    /// Copy a local file to a remote path
    Put {
        /// Local file path
        local: PathBuf,
        /// Remote file path
        remote: String,
        /// Open flags (subset of rwatcx)
        #[arg(short, long, default_value = "wct")]
        flags: String,
        /// Permission bits (octal)
        #[arg(short, long, value_parser = parse_mode)]
        mode: Option<u32>,
    },
    /// Remove a remote file
    #[command(alias = "unlink")]
    Remove {
        /// Remote file path
        path: String,
    },
    /// Print a job attribute
    GetJobAttr {
        /// Attribute name
        name: String,
        /// Read the execution side's possibly stale copy
        #[arg(long)]
        delayed: bool,
    },
    /// Set a job attribute
    SetJobAttr {
        /// Attribute name
        name: String,
        /// New value (ClassAd expression)
        value: String,
        /// Send with the next regular update instead of immediately
        #[arg(long)]
        delayed: bool,
    },
    /// Append a message to the user log
    Ulog {
        /// Message text
        text: String,
    },
    /// Announce a new job phase
    Phase {
        /// Phase name
        phase: String,
    },
    /// Read bytes from a remote file to stdout
    Read {
        /// Remote file path
        remote: String,
        /// Maximum number of bytes to read
        length: u64,
        #[command(flatten)]
        io: IoArgs,
    },
    /// Write a local file's contents to a remote file
    Write {
        /// Local file path
        local: PathBuf,
        /// Remote file path
        remote: String,
        /// Open flags (must include w)
        #[arg(short, long, default_value = "w")]
        flags: String,
        /// Permission bits (octal)
        #[arg(short, long, value_parser = parse_mode)]
        mode: Option<u32>,
        /// Number of bytes to write (defaults to the whole file)
        #[arg(short, long)]
        length: Option<u64>,
        #[command(flatten)]
        io: IoArgs,
    },
    /// Create a remote directory
    Mkdir {
        /// Remote directory path
        path: String,
        /// Permission bits (octal)
        #[arg(short, long, value_parser = parse_mode)]
        mode: Option<u32>,
    },
    /// Remove a remote directory
    Rmdir {
        /// Remote directory path
        path: String,
        /// Remove contents as well
        #[arg(short, long)]
        recursive: bool,
    },
    /// Rename a remote path
    Rename {
        /// Old path
        old: String,
        /// New path
        new: String,
    },
    /// List a remote directory
    Ls {
        /// Remote directory path
        path: String,
        /// Include metadata
        #[arg(short, long)]
        long: bool,
    },
    /// Create a link
    Link {
        /// Existing path
        old: String,
        /// New link path
        new: String,
        /// Create a symbolic link
        #[arg(short, long)]
        symbolic: bool,
    },
    /// Print the target of a symbolic link
    Readlink {
        /// Link path
        path: String,
    },
    /// Print the caller's identity
    Whoami,
    /// Print the server's identity as seen from a host
    Whoareyou {
        /// Remote host
        host: String,
    },
    /// Print file metadata
    Stat {
        /// Remote path
        path: String,
        /// Do not follow symbolic links
        #[arg(short = 'L', long)]
        no_follow: bool,
    },
    /// Print filesystem metadata
    Statfs {
        /// Remote path
        path: String,
    },
    /// Check access to a path
    Access {
        /// Remote path
        path: String,
        /// Mode (subset of frwx)
        #[arg(default_value = "f")]
        mode: String,
    },
    /// Change permission bits
    Chmod {
        /// Remote path
        path: String,
        /// Permission bits (octal)
        #[arg(value_parser = parse_mode)]
        mode: u32,
    },
    /// Change ownership
    Chown {
        /// Remote path
        path: String,
        /// New owner id
        uid: i64,
        /// New group id
        gid: i64,
        /// Change the link rather than its target
        #[arg(long)]
        no_follow: bool,
    },
    /// Truncate a remote file
    Truncate {
        /// Remote path
        path: String,
        /// New length
        length: u64,
    },
    /// Set access and modification times
    Utime {
        /// Remote path
        path: String,
        /// Access time (seconds since epoch)
        atime: i64,
        /// Modification time (seconds since epoch)
        mtime: i64,
    },
}

/// Offset and stride options shared by `read` and `write`
#[derive(clap::Args, Debug)]
struct IoArgs {
    /// Start at this byte offset
    #[arg(long)]
    offset: Option<u64>,
    /// Bytes per stride
    #[arg(long)]
    stride_length: Option<u64>,
    /// Bytes skipped between strides
    #[arg(long)]
    stride_skip: Option<u64>,
}

impl From<IoArgs> for IoOptions {
    fn from(args: IoArgs) -> Self {
        IoOptions {
            offset: args.offset,
            stride_length: args.stride_length,
            stride_skip: args.stride_skip,
        }
    }
}

fn parse_mode(s: &str) -> std::result::Result<u32, String> {
    let digits = s.trim_start_matches("0o");
    u32::from_str_radix(digits, 8).map_err(|e| format!("invalid octal mode '{s}': {e}"))
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ClientConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ClientConfig::default(),
    };

    if let Some(host) = args.host.clone() {
        config.host = Some(host);
    }
    if let Some(port) = args.port {
        config.port = Some(port);
    }
    if let Some(cookie) = args.cookie.clone() {
        config.cookie = Some(cookie);
    }
    if !args.auth.is_empty() {
        config.auth_methods = args.auth.clone();
    }
    if let Some(timeout) = args.timeout {
        config.timeout_secs = timeout;
    }
    if let Some(log_format) = args.log_format {
        config.logging.format = log_format;
    }
    if let Some(log_file) = args.log_file.clone() {
        config.logging.file = Some(log_file);
    }
    if args.verbose {
        config.logging.level = "debug".to_string();
    }

    let _log_guard = init_logging(&config);

    let mut client = Client::connect(&config).context("Failed to connect to Chirp server")?;
    debug!("{}", client);

    run(&mut client, args.command, args.json)
}

fn init_logging(config: &ClientConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level))
    };

    let Some(log_file) = &config.logging.file else {
        match config.logging.format {
            LogFormat::Json => tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter())
                .with_writer(std::io::stderr)
                .init(),
            LogFormat::Text => tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_writer(std::io::stderr)
                .init(),
        }
        return None;
    };

    let dir = log_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    if let Err(e) = std::fs::create_dir_all(dir) {
        eprintln!("Warning: Failed to create log directory: {}", e);
    }
    let name = log_file
        .file_name()
        .map_or_else(|| "chirp.log".into(), |n| n.to_string_lossy());

    let appender = tracing_appender::rolling::never(dir, &*name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    match config.logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter())
            .with_writer(writer)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_writer(writer)
            .with_ansi(false)
            .init(),
    }

    Some(guard)
}

fn run(client: &mut Client, command: Commands, json: bool) -> Result<()> {
    match command {
        Commands::Fetch { remote, local } => {
            let bytes = client
                .fetch(&remote, &local)
                .with_context(|| format!("Failed to fetch {}", remote))?;
            report_count(json, bytes);
        }
        Commands::Put {
            local,
            remote,
            flags,
            mode,
        } => {
            let bytes = client
                .put(&local, &remote, &flags, mode)
                .with_context(|| format!("Failed to put {}", local.display()))?;
            report_count(json, bytes);
        }
        Commands::Remove { path } => client.remove(&path)?,
        Commands::GetJobAttr { name, delayed } => {
            let value = if delayed {
                client.get_job_attr_delayed(&name)?
            } else {
                client.get_job_attr(&name)?
            };
            report_text(json, &value)?;
        }
        Commands::SetJobAttr {
            name,
            value,
            delayed,
        } => {
            if delayed {
                client.set_job_attr_delayed(&name, &value)?;
            } else {
                client.set_job_attr(&name, &value)?;
            }
        }
        Commands::Ulog { text } => client.ulog(&text)?,
        Commands::Phase { phase } => client.phase(&phase)?,
        Commands::Read { remote, length, io } => {
            let data = client.read(&remote, length, io.into())?;
            std::io::stdout()
                .write_all(&data)
                .context("Failed to write to stdout")?;
        }
        Commands::Write {
            local,
            remote,
            flags,
            mode,
            length,
            io,
        } => {
            let data = std::fs::read(&local)
                .with_context(|| format!("Failed to read {}", local.display()))?;
            let bytes = client.write(&data, &remote, &flags, mode, length, io.into())?;
            report_count(json, bytes);
        }
        Commands::Mkdir { path, mode } => client.mkdir(&path, mode)?,
        Commands::Rmdir { path, recursive } => client.rmdir(&path, recursive)?,
        Commands::Rename { old, new } => client.rename(&old, &new)?,
        Commands::Ls { path, long } => match client.listdir(&path, long)? {
            DirListing::Names(names) if json => println!("{}", serde_json::to_string(&names)?),
            DirListing::Names(names) => {
                for name in names {
                    println!("{}", name);
                }
            }
            DirListing::Long(entries) if json => {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            }
            DirListing::Long(entries) => {
                for (name, stat) in entries {
                    println!("{:o} {:>10} {}", stat.mode, stat.size, name);
                }
            }
        },
        Commands::Link { old, new, symbolic } => client.link(&old, &new, symbolic)?,
        Commands::Readlink { path } => report_text(json, &client.readlink(&path)?)?,
        Commands::Whoami => report_text(json, &client.whoami()?)?,
        Commands::Whoareyou { host } => report_text(json, &client.whoareyou(&host)?)?,
        Commands::Stat { path, no_follow } => {
            let stat = if no_follow {
                client.lstat(&path)?
            } else {
                client.stat(&path)?
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&stat)?);
            } else {
                for (name, value) in chirp_client::Stat::FIELD_NAMES.iter().zip(stat.fields()) {
                    println!("{}: {}", name, value);
                }
            }
        }
        Commands::Statfs { path } => {
            let statfs = client.statfs(&path)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&statfs)?);
            } else {
                for (name, value) in chirp_client::StatFs::FIELD_NAMES.iter().zip(statfs.fields()) {
                    println!("{}: {}", name, value);
                }
            }
        }
        Commands::Access { path, mode } => client.access(&path, &mode)?,
        Commands::Chmod { path, mode } => client.chmod(&path, mode)?,
        Commands::Chown {
            path,
            uid,
            gid,
            no_follow,
        } => {
            if no_follow {
                client.lchown(&path, uid, gid)?;
            } else {
                client.chown(&path, uid, gid)?;
            }
        }
        Commands::Truncate { path, length } => client.truncate(&path, length)?,
        Commands::Utime { path, atime, mtime } => client.utime(&path, atime, mtime)?,
    }

    Ok(())
}

fn report_count(json: bool, bytes: u64) {
    if json {
        println!("{}", serde_json::json!({ "bytes": bytes }));
    } else {
        println!("{} bytes", bytes);
    }
}

fn report_text(json: bool, text: &str) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(text)?);
    } else {
        println!("{}", text);
    }
    Ok(())
}
