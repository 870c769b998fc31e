//! Configuration management
//!
//! Handles loading, validation, and merging of configuration from:
//! - TOML files
//! - Environment variables
//! - CLI arguments
//!
//! Argument lists are structured (`Vec<String>`) everywhere in the core.
//! Whitespace tokenization exists only in [`tokenize`], for legacy
//! single-string fields coming from the CLI or old config files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default display server binary
pub const DEFAULT_SERVER: &str = "/usr/bin/X";
/// Default client (desktop entry point)
pub const DEFAULT_CLIENT: &str = "/usr/bin/fvwm-crystal";
/// Default log file used once stderr is detached
pub const DEFAULT_LOG_FILE: &str = "/var/log/vtlaunch.log";

fn default_server_program() -> PathBuf {
    PathBuf::from(DEFAULT_SERVER)
}

fn default_server_args() -> Vec<String> {
    tokenize("-br -novtswitch -nolisten tcp")
}

fn default_client_program() -> PathBuf {
    PathBuf::from(DEFAULT_CLIENT)
}

fn default_boot_delay() -> u32 {
    5
}

fn default_boot_timeout() -> u32 {
    120
}

fn default_shutdown_grace() -> u32 {
    5
}

fn default_kill_grace() -> u32 {
    2
}

fn default_poll_interval() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

/// Session identity and display selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSection {
    /// Display identifier (":0".."); autodetected from /tmp lock files when
    /// absent
    pub display: Option<String>,
    /// Target user; when absent the credential collector is consulted
    pub user: Option<String>,
    /// Drop to the target user before starting the client
    #[serde(default = "default_true")]
    pub drop_privileges: bool,
    /// Terminate the server when the session ends
    #[serde(default = "default_true")]
    pub kill_server_on_exit: bool,
    /// Explicit X authority file path
    pub authority_file: Option<PathBuf>,
}

// Derived Default would zero the booleans; a config-less run must still
// drop privileges and kill the server, same as an empty [session] table.
impl Default for SessionSection {
    fn default() -> Self {
        Self {
            display: None,
            user: None,
            drop_privileges: true,
            kill_server_on_exit: true,
            authority_file: None,
        }
    }
}

/// Display server process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// Server binary
    #[serde(default = "default_server_program")]
    pub program: PathBuf,
    /// Extra server arguments, already split
    #[serde(default = "default_server_args")]
    pub args: Vec<String>,
    /// Seconds to wait for the readiness signal before probing
    #[serde(default = "default_boot_delay")]
    pub boot_delay_secs: u32,
    /// One-second connect-probe cycles before giving up
    #[serde(default = "default_boot_timeout")]
    pub boot_timeout_cycles: u32,
    /// Seconds granted after SIGTERM before escalating
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u32,
    /// Seconds granted after SIGKILL before reporting failure
    #[serde(default = "default_kill_grace")]
    pub kill_grace_secs: u32,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            program: default_server_program(),
            args: default_server_args(),
            boot_delay_secs: default_boot_delay(),
            boot_timeout_cycles: default_boot_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
            kill_grace_secs: default_kill_grace(),
        }
    }
}

/// Client process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSection {
    /// Client binary
    #[serde(default = "default_client_program")]
    pub program: PathBuf,
    /// Extra client arguments, already split
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            program: default_client_program(),
            args: Vec::new(),
        }
    }
}

/// Daemon mode behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSection {
    /// Detach and supervise in the background
    #[serde(default)]
    pub daemonize: bool,
    /// Idle-loop poll interval in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Leave descriptors open across daemonization so the spawned session
    /// inherits them; disabling runs the textbook close-and-null recipe
    #[serde(default = "default_true")]
    pub inherit_descriptors: bool,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            daemonize: false,
            poll_interval_secs: default_poll_interval(),
            inherit_descriptors: true,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Log level when RUST_LOG is unset
    #[serde(default)]
    pub level: Option<String>,
    /// Log file; always used when daemonized
    #[serde(default)]
    pub file: Option<PathBuf>,
}

#[allow(clippy::derivable_impls)]
impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: None,
            file: None,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Session identity and flags
    #[serde(default)]
    pub session: SessionSection,
    /// Display server process
    #[serde(default)]
    pub server: ServerSection,
    /// Client process
    #[serde(default)]
    pub client: ClientSection,
    /// Daemon behavior
    #[serde(default)]
    pub daemon: DaemonSection,
    /// Logging
    #[serde(default)]
    pub logging: LoggingSection,
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read config file: {}", path))?;

        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(display) = &self.session.display {
            parse_display_number(display)
                .with_context(|| format!("Invalid display identifier: {}", display))?;
        }

        if self.server.program.as_os_str().is_empty() {
            anyhow::bail!("Server program must not be empty");
        }
        if self.client.program.as_os_str().is_empty() {
            anyhow::bail!("Client program must not be empty");
        }
        if self.server.boot_timeout_cycles == 0 {
            anyhow::bail!("server.boot_timeout_cycles must be at least 1");
        }
        if self.daemon.poll_interval_secs == 0 {
            anyhow::bail!("daemon.poll_interval_secs must be at least 1");
        }

        Ok(())
    }
}

/// Parse a display identifier like ":1" into its number
pub fn parse_display_number(display: &str) -> Result<u32> {
    let digits = display
        .strip_prefix(':')
        .ok_or_else(|| anyhow::anyhow!("display must start with ':'"))?;
    digits
        .parse::<u32>()
        .context("display number is not a number")
}

/// Split a legacy single-string argument field on whitespace
///
/// Embedded spaces cannot survive this, which is why the core contract takes
/// structured lists; this is the only place that splits.
pub fn tokenize(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

/// Pick the first free display by scanning X lock files
///
/// Returns the display identifier and the lock file path the server will
/// create for it, so the launcher can clean a leftover lock up on exit.
pub fn select_free_display(lock_dir: &Path) -> Result<(String, PathBuf)> {
    for n in 0..=9u32 {
        let lock = lock_dir.join(format!(".X{}-lock", n));
        if !lock.exists() {
            return Ok((format!(":{}", n), lock));
        }
    }
    anyhow::bail!("No free display found in {:?} (all lock files taken)", lock_dir)
}
