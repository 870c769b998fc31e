//! Server/client lifecycle supervision
//!
//! [`Spawner`] owns the two session processes: it forks and execs the display
//! server, waits for it to become connectable, drops privileges, forks and
//! execs the client, then blocks until either process exits or a termination
//! signal is recorded, and finally tears both down - gracefully first, by
//! force if the server lingers.
//!
//! The readiness wait is two-phase. The server only *attempts* to signal its
//! parent (SIGUSR1, inherited-SIG_IGN convention) when it starts listening;
//! that signal can race the fork or get lost, so after the signal-or-alarm
//! window the spawner probes the display socket once per second until it
//! connects or the boot window is exhausted.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{self, SigHandler, SigSet, SigmaskHow, Signal};
use nix::sys::wait::{self, WaitPidFlag, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};
use tracing::{debug, error, info, warn};

use crate::error::{LaunchError, Result};
use crate::privileges::{IdentityBackend, PrivilegeContext};
use crate::signals::SignalFlags;

/// Supervisor lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Nothing started yet
    Idle,
    /// Server forked, readiness pending
    ServerStarting,
    /// Server accepting connections
    ServerReady,
    /// Client forked
    ClientStarting,
    /// Both processes running, blocking on child changes
    Monitoring,
    /// TERM sent, grace window running
    ShuttingDownGraceful,
    /// KILL sent, short grace window running
    ShuttingDownForced,
    /// Session over
    Terminated,
}

/// How the monitored session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Client exited with the given status code
    ClientExited(i32),
    /// Server exited (status code) while the client was still running
    ServerExited(i32),
    /// A recorded termination signal ended the session
    SignalReceived(i32),
}

/// Resolved inputs for one spawn/monitor/shutdown cycle
#[derive(Debug, Clone)]
pub struct SpawnerConfig {
    /// Display identifier, e.g. ":1"
    pub display: String,
    /// Display number parsed out of the identifier
    pub display_number: u32,
    /// Server binary
    pub server_program: PathBuf,
    /// Extra server arguments
    pub server_args: Vec<String>,
    /// Client binary
    pub client_program: PathBuf,
    /// Extra client arguments
    pub client_args: Vec<String>,
    /// Signal-or-alarm window before the connect probe starts
    pub boot_delay: Duration,
    /// One-second probe cycles before declaring readiness timeout
    pub boot_timeout_cycles: u32,
    /// Grace window after SIGTERM
    pub shutdown_grace: Duration,
    /// Grace window after SIGKILL
    pub kill_grace: Duration,
    /// Directory holding the display sockets (X<N>)
    pub socket_dir: PathBuf,
}

impl SpawnerConfig {
    /// Path of the display socket this session's server will listen on
    fn socket_path(&self) -> PathBuf {
        self.socket_dir.join(format!("X{}", self.display_number))
    }
}

/// Server/client process supervisor
pub struct Spawner {
    config: SpawnerConfig,
    state: SupervisorState,
    server: Option<Pid>,
    client: Option<Pid>,
}

/// Build an argv of C strings: basename of the program first, then the rest
fn build_argv(program: &Path, rest: &[String]) -> Result<Vec<CString>> {
    let basename = program
        .file_name()
        .unwrap_or(program.as_os_str())
        .as_bytes();
    let mut argv = Vec::with_capacity(rest.len() + 1);
    argv.push(CString::new(basename).map_err(|_| {
        LaunchError::Config(format!("program name contains NUL: {:?}", program))
    })?);
    for arg in rest {
        argv.push(
            CString::new(arg.as_bytes())
                .map_err(|_| LaunchError::Config(format!("argument contains NUL: {arg:?}")))?,
        );
    }
    Ok(argv)
}

fn spawn_error(role: &'static str, program: &Path, err: Errno) -> LaunchError {
    LaunchError::SpawnFailed {
        role,
        program: program.to_path_buf(),
        source: std::io::Error::from_raw_os_error(err as i32),
    }
}

impl Spawner {
    /// Create a supervisor and install its signal dispositions
    ///
    /// Termination signals from here on are recorded in [`SignalFlags`] and
    /// interrupt the blocking waits instead of killing the process.
    pub fn new(config: SpawnerConfig) -> Result<Self> {
        crate::signals::install_supervisor_handlers()
            .map_err(|e| LaunchError::Config(format!("installing signal handlers: {e}")))?;

        Ok(Self {
            config,
            state: SupervisorState::Idle,
            server: None,
            client: None,
        })
    }

    /// Current lifecycle state
    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Pid of the running server, if any
    pub fn server_pid(&self) -> Option<Pid> {
        self.server
    }

    /// Pid of the running client, if any
    pub fn client_pid(&self) -> Option<Pid> {
        self.client
    }

    /// Fork and exec the display server, then wait for it to come up
    ///
    /// SIGUSR1 is blocked before the fork so the ready signal cannot slip
    /// between fork and the suspend that waits for it.
    pub fn start_server(&mut self) -> Result<Pid> {
        self.state = SupervisorState::ServerStarting;

        let path = CString::new(self.config.server_program.as_os_str().as_bytes())
            .map_err(|_| LaunchError::Config("server path contains NUL".into()))?;
        let mut args = vec![self.config.display.clone()];
        args.extend(self.config.server_args.iter().cloned());
        let argv = build_argv(&self.config.server_program, &args)?;

        let mut ready_mask = SigSet::empty();
        ready_mask.add(Signal::SIGUSR1);
        let mut old_mask = SigSet::empty();
        signal::sigprocmask(
            SigmaskHow::SIG_BLOCK,
            Some(&ready_mask),
            Some(&mut old_mask),
        )
        .map_err(|e| spawn_error("server", &self.config.server_program, e))?;

        let fork_result = unsafe { unistd::fork() };
        match fork_result {
            Ok(ForkResult::Child) => {
                let _ = signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&old_mask), None);
                unsafe {
                    // Don't hang on reads/writes to the controlling tty.
                    let _ = signal::signal(Signal::SIGTTIN, SigHandler::SigIgn);
                    let _ = signal::signal(Signal::SIGTTOU, SigHandler::SigIgn);
                    // The X server treats an inherited SIG_IGN on USR1 as a
                    // request to signal its parent once it is listening.
                    let _ = signal::signal(Signal::SIGUSR1, SigHandler::SigIgn);
                }
                // Own process group, out of reach of a client-side vhangup.
                let _ = unistd::setpgid(Pid::from_raw(0), unistd::getpid());

                let _ = unistd::execvp(&path, &argv);
                eprintln!(
                    "vtlaunch: unable to run server {:?}",
                    self.config.server_program
                );
                unsafe { libc::_exit(127) };
            }
            Ok(ForkResult::Parent { child }) => {
                // Recorded before the readiness wait: a server that forked
                // but never came up must still be reachable by shutdown().
                self.server = Some(child);

                // The server is never niced; give it a small boost instead.
                unsafe {
                    libc::setpriority(libc::PRIO_PROCESS as _, child.as_raw() as _, -1);
                }

                let wait_result = self.await_server_ready(child, &old_mask);
                let _ = signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&old_mask), None);
                wait_result?;

                self.state = SupervisorState::ServerReady;
                info!(pid = child.as_raw(), display = %self.config.display, "server ready");
                Ok(child)
            }
            Err(e) => {
                let _ = signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&old_mask), None);
                Err(spawn_error("server", &self.config.server_program, e))
            }
        }
    }

    /// Signal-or-alarm wait, then the one-second connect probe
    fn await_server_ready(&self, child: Pid, suspend_mask: &SigSet) -> Result<()> {
        // A server that died during exec shows up here instead of hanging
        // the whole boot window.
        if self.child_gone(child) {
            return Err(spawn_error("server", &self.config.server_program, Errno::ECHILD));
        }

        // alarm(0) disarms rather than firing, so a zero window would leave
        // the suspend with nothing to wake it; go straight to the probe.
        if !self.config.boot_delay.is_zero() {
            unsafe {
                libc::alarm(self.config.boot_delay.as_secs() as libc::c_uint);
            }
            // Returns on SIGUSR1 (server ready) or SIGALRM (window over).
            let _ = suspend_mask.suspend();
            unsafe {
                libc::alarm(0);
            }
        }

        let socket = self.config.socket_path();
        for cycle in 0..self.config.boot_timeout_cycles {
            if UnixStream::connect(&socket).is_ok() {
                debug!("display {} connectable after {} probes", self.config.display, cycle);
                return Ok(());
            }
            if self.child_gone(child) {
                return Err(spawn_error("server", &self.config.server_program, Errno::ECHILD));
            }
            if cycle == 0 {
                info!("waiting for server to accept connections on {}", self.config.display);
            }
            std::thread::sleep(Duration::from_secs(1));
        }

        error!("giving up on display {}", self.config.display);
        Err(LaunchError::ReadinessTimeout {
            display: self.config.display.clone(),
            cycles: self.config.boot_timeout_cycles,
        })
    }

    /// True when the child has exited (reaps it as a side effect)
    fn child_gone(&self, pid: Pid) -> bool {
        match wait::waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => false,
            Ok(_) => true,
            Err(Errno::ECHILD) => true,
            Err(_) => false,
        }
    }

    /// Fork and exec the client in its own process group
    ///
    /// Privileges must already be dropped by the caller; the child inherits
    /// the target identity.
    pub fn start_client(&mut self) -> Result<Pid> {
        self.state = SupervisorState::ClientStarting;

        let path = CString::new(self.config.client_program.as_os_str().as_bytes())
            .map_err(|_| LaunchError::Config("client path contains NUL".into()))?;
        let mut args = vec!["-d".to_string(), self.config.display.clone()];
        args.extend(self.config.client_args.iter().cloned());
        let argv = build_argv(&self.config.client_program, &args)?;

        let fork_result = unsafe { unistd::fork() };
        match fork_result {
            Ok(ForkResult::Child) => {
                // Own group so shutdown can HUP the client and everything it
                // spawned with one killpg.
                let _ = unistd::setpgid(Pid::from_raw(0), unistd::getpid());

                let _ = unistd::execvp(&path, &argv);
                eprintln!(
                    "vtlaunch: unable to run client {:?}",
                    self.config.client_program
                );
                unsafe { libc::_exit(127) };
            }
            Ok(ForkResult::Parent { child }) => {
                self.client = Some(child);
                self.state = SupervisorState::Monitoring;
                info!(pid = child.as_raw(), "client started");
                Ok(child)
            }
            Err(e) => Err(spawn_error("client", &self.config.client_program, e)),
        }
    }

    /// Block until the server or client exits, or a termination signal lands
    ///
    /// The wait is interruptible: the handlers are installed without
    /// SA_RESTART, so a recorded signal surfaces as EINTR and the flag is
    /// polled each pass.
    pub fn monitor(&mut self, flags: &SignalFlags) -> SessionEnd {
        loop {
            if let Some(sig) = flags.termination() {
                info!("termination signal {} recorded, leaving monitor loop", sig);
                return SessionEnd::SignalReceived(sig);
            }
            match wait::wait() {
                Ok(WaitStatus::Exited(pid, code)) => {
                    if Some(pid) == self.client {
                        self.client = None;
                        info!(pid = pid.as_raw(), code, "client exited");
                        return SessionEnd::ClientExited(code);
                    }
                    if Some(pid) == self.server {
                        self.server = None;
                        warn!(pid = pid.as_raw(), code, "server exited");
                        return SessionEnd::ServerExited(code);
                    }
                }
                Ok(WaitStatus::Signaled(pid, sig, _)) => {
                    if Some(pid) == self.client {
                        self.client = None;
                        info!(pid = pid.as_raw(), signal = %sig, "client killed");
                        return SessionEnd::ClientExited(128 + sig as i32);
                    }
                    if Some(pid) == self.server {
                        self.server = None;
                        warn!(pid = pid.as_raw(), signal = %sig, "server killed");
                        return SessionEnd::ServerExited(128 + sig as i32);
                    }
                }
                Ok(_) => {}
                Err(Errno::EINTR) => {}
                Err(Errno::ECHILD) => {
                    // Both children already reaped elsewhere.
                    self.client = None;
                    self.server = None;
                    return SessionEnd::ServerExited(0);
                }
                Err(e) => {
                    error!("wait failed: {}", e);
                    return SessionEnd::ServerExited(1);
                }
            }
        }
    }

    /// Poll-wait for a child to disappear, up to `window`
    fn wait_for_exit(&self, pid: Pid, window: Duration) -> bool {
        let deadline = std::time::Instant::now() + window;
        loop {
            if self.child_gone(pid) {
                return true;
            }
            if std::time::Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(200));
        }
    }

    /// Orderly teardown: HUP the client group, TERM then KILL the server group
    ///
    /// Always returns - an unkillable server is reported as
    /// [`LaunchError::ShutdownIncomplete`], never looped on - so the caller
    /// can continue restoring console and privileges.
    pub fn shutdown(&mut self) -> Result<()> {
        self.state = SupervisorState::ShuttingDownGraceful;

        if let Some(client) = self.client.take() {
            // HUP the whole client group so its descendants can clean up;
            // an already-gone group is fine.
            match signal::killpg(client, Signal::SIGHUP) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => warn!("cannot HUP client group {}: {}", client, e),
            }
        }

        let Some(server) = self.server.take() else {
            self.state = SupervisorState::Terminated;
            return Ok(());
        };

        match signal::killpg(server, Signal::SIGTERM) {
            Err(Errno::ESRCH) => {
                self.state = SupervisorState::Terminated;
                return Ok(());
            }
            Err(e) => warn!("cannot TERM server group {}: {}", server, e),
            Ok(()) => {}
        }

        if self.wait_for_exit(server, self.config.shutdown_grace) {
            self.state = SupervisorState::Terminated;
            return Ok(());
        }

        warn!("server slow to shut down, sending KILL");
        self.state = SupervisorState::ShuttingDownForced;

        match signal::killpg(server, Signal::SIGKILL) {
            Err(Errno::ESRCH) => {
                self.state = SupervisorState::Terminated;
                return Ok(());
            }
            Err(e) => warn!("cannot KILL server group {}: {}", server, e),
            Ok(()) => {}
        }

        let died = self.wait_for_exit(server, self.config.kill_grace);
        self.state = SupervisorState::Terminated;
        if died {
            Ok(())
        } else {
            error!("server refuses to die");
            Err(LaunchError::ShutdownIncomplete {
                pgid: server.as_raw(),
            })
        }
    }

    /// One full spawn/ready/drop/spawn/monitor/shutdown cycle
    ///
    /// Returns the session exit code: the client's own exit status when
    /// shutdown succeeded, 128+signal when a termination signal ended the
    /// run. A failed privilege drop is fatal before the client ever starts -
    /// running it without confirmed separation would be a security hole, not
    /// a degraded mode.
    pub fn run<B: IdentityBackend>(
        &mut self,
        privileges: &mut PrivilegeContext<B>,
        flags: &SignalFlags,
    ) -> Result<i32> {
        if let Err(e) = self.start_server() {
            let _ = self.shutdown();
            return Err(e);
        }

        if privileges.enabled() && !privileges.drop() {
            let _ = self.shutdown();
            return Err(LaunchError::PrivilegeOperation(format!(
                "could not drop to uid {}",
                privileges.target().uid
            )));
        }

        if let Err(e) = self.start_client() {
            let _ = self.shutdown();
            return Err(e);
        }

        info!(
            server = self.server.map(Pid::as_raw),
            client = self.client.map(Pid::as_raw),
            "monitoring session"
        );

        let end = self.monitor(flags);
        let shutdown_result = self.shutdown();

        let code = match end {
            SessionEnd::ClientExited(code) => code,
            SessionEnd::ServerExited(_) => 1,
            SessionEnd::SignalReceived(sig) => 128 + sig,
        };

        shutdown_result?;
        Ok(code)
    }
}

impl Drop for Spawner {
    fn drop(&mut self) {
        // Late signals must not abort what little cleanup remains.
        if self.server.is_some() || self.client.is_some() {
            crate::signals::ignore_termination_signals();
            let _ = self.shutdown();
        }
    }
}
