//! Background supervision
//!
//! Daemon mode detaches the launcher with the classic double fork and then
//! sits in a slow polling loop watching the spawned session leader through
//! `/proc/<pid>/stat`. A pid lockfile under `/run` (falling back to the
//! target user's home) guards against a second instance and lets an operator
//! find the daemon; a leftover file from a crashed run is detected by
//! checking whether its pid is still alive.

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::{self, ForkResult, Gid, Pid, Uid};
use tracing::{debug, info, warn};

use crate::error::{LaunchError, Result};
use crate::privileges::Identity;
use crate::signals::SignalFlags;

/// Lockfile name, under [`RUN_DIR`] or the fallback home directory
pub const PID_FILE_NAME: &str = "vtlaunch.pid";
/// Preferred lockfile directory
pub const RUN_DIR: &str = "/run";

/// Coarse child state as reported by the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Running or sleeping
    Alive,
    /// Zombie, or the stat file is gone
    Dead,
    /// Some other state char (stopped, disk sleep); keep watching
    Unknown(char),
}

/// Read the state character out of `/proc/<pid>/stat`
///
/// The comm field is parenthesized and may itself contain spaces or
/// parentheses, so the state is everything after the *last* closing paren.
pub fn process_status(pid: Pid) -> ProcessStatus {
    let path = format!("/proc/{}/stat", pid.as_raw());
    let Ok(contents) = fs::read_to_string(&path) else {
        return ProcessStatus::Dead;
    };
    let state = contents
        .rsplit(')')
        .next()
        .and_then(|rest| rest.trim_start().chars().next());
    match state {
        Some('R') | Some('S') => ProcessStatus::Alive,
        Some('Z') | None => ProcessStatus::Dead,
        Some(other) => ProcessStatus::Unknown(other),
    }
}

/// True when the pid exists at all (signal 0 probe)
pub fn pid_exists(pid: Pid) -> bool {
    match signal::kill(pid, None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Pid lockfile for a running instance
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Default lockfile location
    pub fn default_path() -> PathBuf {
        Path::new(RUN_DIR).join(PID_FILE_NAME)
    }

    /// Every location a lockfile may have been written to: `/run` first,
    /// then the home-directory fallback [`create`](Self::create) uses
    pub fn candidate_paths() -> Vec<PathBuf> {
        let mut paths = vec![Self::default_path()];
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(PID_FILE_NAME));
        }
        paths
    }

    /// Run the stale-lockfile gate over every candidate location
    pub fn check_stale_all(paths: &[PathBuf]) -> Result<()> {
        for path in paths {
            Self::check_stale(path)?;
        }
        Ok(())
    }

    /// Refuse to start while another live instance holds the lockfile
    ///
    /// A file whose recorded pid no longer exists is stale: it is removed
    /// and startup proceeds.
    pub fn check_stale(path: &Path) -> Result<()> {
        let contents = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(LaunchError::Daemon(format!(
                    "cannot read lockfile {}: {e}",
                    path.display()
                )))
            }
        };

        match contents.trim().parse::<i32>() {
            Ok(pid) if pid > 0 && pid_exists(Pid::from_raw(pid)) => {
                Err(LaunchError::Daemon(format!(
                    "already running as pid {pid} (lockfile {})",
                    path.display()
                )))
            }
            _ => {
                info!("removing stale lockfile {}", path.display());
                fs::remove_file(path).map_err(|e| {
                    LaunchError::Daemon(format!(
                        "cannot remove stale lockfile {}: {e}",
                        path.display()
                    ))
                })?;
                Ok(())
            }
        }
    }

    /// Write the current pid, preferring `/run` and falling back to the
    /// target user's home directory
    ///
    /// The file is chowned to the target identity so the daemon can still
    /// remove it after dropping privileges.
    pub fn create(owner: Option<&Identity>) -> Result<Self> {
        let primary = Self::default_path();
        let path = match Self::write_pid(&primary) {
            Ok(()) => primary,
            Err(e) => {
                warn!("cannot create lockfile {}: {}", primary.display(), e);
                let home = dirs::home_dir().ok_or_else(|| {
                    LaunchError::Daemon("no home directory for fallback lockfile".into())
                })?;
                let fallback = home.join(PID_FILE_NAME);
                Self::write_pid(&fallback).map_err(|e| {
                    LaunchError::Daemon(format!(
                        "cannot create lockfile {}: {e}",
                        fallback.display()
                    ))
                })?;
                fallback
            }
        };

        let _ = fs::set_permissions(&path, fs::Permissions::from_mode(0o644));
        if let Some(identity) = owner {
            if let Err(e) = unistd::chown(
                &path,
                Some(Uid::from_raw(identity.uid)),
                Some(Gid::from_raw(identity.gid)),
            ) {
                warn!("cannot chown lockfile {}: {}", path.display(), e);
            }
        }

        info!("lockfile {}", path.display());
        Ok(Self { path })
    }

    fn write_pid(path: &Path) -> std::io::Result<()> {
        let mut file = fs::File::create(path)?;
        writeln!(file, "{}", unistd::getpid().as_raw())
    }

    /// Lockfile location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the lockfile; failure is logged, cleanup must go on
    pub fn remove(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("removed lockfile {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("cannot remove lockfile {}: {}", self.path.display(), e),
        }
    }
}

/// Detach from the controlling terminal with the double-fork recipe
///
/// Both intermediate parents `_exit` immediately; only the grandchild
/// returns. With `inherit_descriptors` (the default) the standard streams
/// stay open so the spawned session and the log writer keep working;
/// disabling it runs the textbook close-everything-and-null recipe.
pub fn daemonize(inherit_descriptors: bool) -> Result<()> {
    match unsafe { unistd::fork() } {
        Ok(ForkResult::Parent { .. }) => unsafe { libc::_exit(0) },
        Ok(ForkResult::Child) => {}
        Err(e) => return Err(LaunchError::Daemon(format!("first fork: {e}"))),
    }

    unistd::setsid().map_err(|e| LaunchError::Daemon(format!("setsid: {e}")))?;

    // Second fork: no longer session leader, cannot reacquire a tty.
    match unsafe { unistd::fork() } {
        Ok(ForkResult::Parent { .. }) => unsafe { libc::_exit(0) },
        Ok(ForkResult::Child) => {}
        Err(e) => return Err(LaunchError::Daemon(format!("second fork: {e}"))),
    }

    unsafe { libc::umask(0) };
    if let Err(e) = unistd::chdir("/") {
        warn!("cannot chdir to /: {}", e);
    }

    if !inherit_descriptors {
        close_descriptors();
    }

    Ok(())
}

/// Close every descriptor and point the standard three at /dev/null
fn close_descriptors() {
    let maxfd = match unsafe { libc::sysconf(libc::_SC_OPEN_MAX) } {
        -1 => 8192,
        n => n as i32,
    };
    for fd in 0..maxfd {
        unsafe { libc::close(fd) };
    }
    unsafe {
        let null = libc::open(c"/dev/null".as_ptr(), libc::O_RDWR);
        if null >= 0 {
            libc::dup2(null, 0);
            libc::dup2(null, 1);
            libc::dup2(null, 2);
            if null > 2 {
                libc::close(null);
            }
        }
    }
}

/// Idle loop watching the session leader
pub struct DaemonSupervisor {
    poll_interval: Duration,
    kill_session_on_exit: bool,
}

impl DaemonSupervisor {
    /// Create a supervisor and install the daemon signal dispositions
    pub fn new(poll_interval: Duration, kill_session_on_exit: bool) -> Result<Self> {
        crate::signals::install_daemon_handlers()
            .map_err(|e| LaunchError::Daemon(format!("installing signal handlers: {e}")))?;
        Ok(Self {
            poll_interval,
            kill_session_on_exit,
        })
    }

    /// Watch the session leader until it dies or termination is requested
    ///
    /// SIGHUP has no reload semantics here; it is acknowledged and dropped
    /// so a stray hangup cannot take the daemon down. On exit the session
    /// leader is terminated if it outlived the loop and the config says so.
    pub fn supervise(&self, session: Pid, flags: &SignalFlags) {
        info!(pid = session.as_raw(), "entering daemon idle loop");
        let mut session_alive = true;

        while !flags.termination_requested() {
            if flags.take_hup() {
                info!("got SIGHUP, nothing to reload");
            }

            match process_status(session) {
                ProcessStatus::Alive => debug!("session {} alive", session.as_raw()),
                ProcessStatus::Dead => {
                    info!("session {} is gone", session.as_raw());
                    session_alive = false;
                    break;
                }
                ProcessStatus::Unknown(c) => {
                    debug!("session {} in state '{}', still watching", session.as_raw(), c)
                }
            }

            self.interruptible_sleep(flags);
        }

        if self.kill_session_on_exit && session_alive {
            match signal::kill(session, Signal::SIGTERM) {
                Ok(()) => info!("terminated session {}", session.as_raw()),
                Err(e) => warn!("could not terminate session {}: {}", session.as_raw(), e),
            }
        }
    }

    /// Sleep one poll interval in short slices so a termination signal is
    /// noticed promptly
    fn interruptible_sleep(&self, flags: &SignalFlags) {
        let deadline = std::time::Instant::now() + self.poll_interval;
        while std::time::Instant::now() < deadline {
            if flags.termination_requested() {
                return;
            }
            std::thread::sleep(Duration::from_secs(1).min(self.poll_interval));
        }
    }
}
