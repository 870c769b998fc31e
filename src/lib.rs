//! # vtlaunch
//!
//! Minimal graphical session launcher for Linux virtual consoles.
//!
//! vtlaunch starts a display server and a single client for a target user,
//! with privilege separation between the two, and supervises the pair until
//! the session ends. It can run in the foreground or detach into a daemon
//! guarded by a pid lockfile.
//!
//! # Architecture
//!
//! ```text
//! vtlaunch
//!   ├─> Session Context (user, display, authority resolution)
//!   ├─> Console Controller (virtual terminal save/restore)
//!   ├─> Privilege Context (drop to target user, restore for cleanup)
//!   ├─> Spawner (server/client fork+exec, readiness, shutdown escalation)
//!   └─> Daemon Supervisor (double fork, pid lockfile, idle polling)
//! ```
//!
//! # Control Flow
//!
//! **Foreground:** resolve session → save console → start server → wait
//! ready → drop privileges → start client → monitor → shutdown → restore.
//!
//! **Daemon:** same session in a forked leader, watched through
//! `/proc/<pid>/stat` from a detached idle loop.
//!
//! Everything is single-threaded and blocking on purpose: the launcher
//! controls other processes, it does not serve requests.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Configuration loading and validation
pub mod config;

/// Virtual console save/restore
pub mod console;

/// Daemonization, pid lockfile and idle supervision
pub mod daemon;

/// Crate error types
pub mod error;

/// Privilege drop/restore between server and client
pub mod privileges;

/// Session orchestration and entry points
pub mod session;

/// Async-signal-safe flags and handler installation
pub mod signals;

/// Server/client process lifecycle state machine
pub mod spawner;

/// X authority file resolution
pub mod xauth;

pub use error::{LaunchError, Result};
