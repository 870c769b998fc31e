//! Error taxonomy for the session launcher
//!
//! Every fatal path in the launcher maps to one of these variants so callers
//! can distinguish "server never came up" from "fork failed" from "the forced
//! kill did not stick". Cleanup-time failures (privilege restore, console
//! restore, pidfile removal) are logged rather than raised, so they do not
//! appear here.

use std::path::PathBuf;

/// Typed launcher error
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// The target user could not be resolved to a passwd entry
    #[error("identity error: {0}")]
    Identity(String),

    /// fork or exec failed for the server or the client
    #[error("unable to run {role} \"{program}\": {source}")]
    SpawnFailed {
        /// "server" or "client"
        role: &'static str,
        /// Program path that failed to spawn
        program: PathBuf,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// The server never became connectable within its boot window
    #[error("server on display {display} not accepting connections after {cycles} probe cycles")]
    ReadinessTimeout {
        /// Display identifier (e.g. ":1")
        display: String,
        /// Number of one-second probe cycles that were exhausted
        cycles: u32,
    },

    /// The server survived both the graceful and the forced kill window
    #[error("server process group {pgid} refuses to die")]
    ShutdownIncomplete {
        /// Process group that is still alive
        pgid: i32,
    },

    /// A privilege drop or restore post-condition check failed
    #[error("privilege operation failed: {0}")]
    PrivilegeOperation(String),

    /// Virtual console query or switch failed
    #[error("console error: {0}")]
    Console(String),

    /// Configuration file or value rejected
    #[error("configuration error: {0}")]
    Config(String),

    /// Daemonization or pidfile handling failed
    #[error("daemon error: {0}")]
    Daemon(String),
}

/// Launcher result alias
pub type Result<T> = std::result::Result<T, LaunchError>;
