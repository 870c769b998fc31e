//! Session orchestration
//!
//! Ties the pieces together: resolve who the session is for and which
//! display it gets, set up the environment and authority file, save the
//! active console, hand control to the [`Spawner`](crate::spawner::Spawner),
//! and undo everything on the way out. The daemon entry point wraps the same
//! session in a detached supervisor process.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::unistd::{self, ForkResult, Pid, User};
use tracing::{info, warn};

use crate::config::{self, Config};
use crate::console::ConsoleController;
use crate::daemon::{self, DaemonSupervisor, PidFile};
use crate::error::{LaunchError, Result};
use crate::privileges::{Identity, PrivilegeContext};
use crate::signals::SignalFlags;
use crate::spawner::{Spawner, SpawnerConfig};
use crate::xauth;

/// Directory where X servers leave their display lock files
pub const DISPLAY_LOCK_DIR: &str = "/tmp";
/// Directory where X servers create their listening sockets
pub const DISPLAY_SOCKET_DIR: &str = "/tmp/.X11-unix";

/// What the credential collector decided
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginDecision {
    /// Start a session for this user
    Login(String),
    /// Leave without starting anything
    Quit,
    /// Hand off to `shutdown -r now`
    Reboot,
    /// Hand off to `shutdown -h now`
    Shutdown,
}

/// Source of the target username when none is preconfigured
pub trait CredentialCollector {
    /// Ask who the session is for
    fn collect(&mut self) -> Result<LoginDecision>;
}

/// Line-based collector on the launcher's own terminal
///
/// Understands the special answers `quit`, `reboot` and `halt`; anything
/// else is taken as a username.
#[derive(Debug, Default)]
pub struct TtyCredentialCollector;

impl CredentialCollector for TtyCredentialCollector {
    fn collect(&mut self) -> Result<LoginDecision> {
        let stdin = std::io::stdin();
        let mut line = String::new();
        loop {
            print!("login: ");
            std::io::stdout()
                .flush()
                .map_err(|e| LaunchError::Config(format!("cannot prompt: {e}")))?;
            line.clear();
            let n = stdin
                .lock()
                .read_line(&mut line)
                .map_err(|e| LaunchError::Config(format!("cannot read login: {e}")))?;
            if n == 0 {
                return Ok(LoginDecision::Quit);
            }
            match line.trim() {
                "" => continue,
                "quit" | "exit" => return Ok(LoginDecision::Quit),
                "reboot" => return Ok(LoginDecision::Reboot),
                "halt" | "shutdown" => return Ok(LoginDecision::Shutdown),
                name => return Ok(LoginDecision::Login(name.to_string())),
            }
        }
    }
}

/// A target user with everything the session needs from passwd
#[derive(Debug, Clone)]
pub struct ResolvedUser {
    /// Login name
    pub name: String,
    /// uid/gid/groups for the privilege drop
    pub identity: Identity,
    /// Home directory
    pub home: PathBuf,
    /// Login shell
    pub shell: PathBuf,
}

/// Look a username up in the passwd database
pub fn resolve_user(name: &str) -> Result<ResolvedUser> {
    let user = User::from_name(name)
        .map_err(|e| LaunchError::Identity(format!("{name}: {e}")))?
        .ok_or_else(|| LaunchError::Identity(format!("no such user: {name}")))?;

    Ok(ResolvedUser {
        name: name.to_string(),
        identity: Identity {
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
            groups: vec![user.gid.as_raw()],
        },
        home: user.dir,
        shell: user.shell,
    })
}

/// Fully resolved, immutable inputs for one session
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Target user
    pub user: ResolvedUser,
    /// Display identifier, e.g. ":0"
    pub display: String,
    /// Parsed display number
    pub display_number: u32,
    /// Lock file the server will create when the display was auto-selected
    pub display_lock: Option<PathBuf>,
    /// Authority file for this session
    pub authority: PathBuf,
    /// Drop to the target user before the client starts
    pub drop_privileges: bool,
    /// Everything else straight from the config
    pub config: Config,
}

impl SessionContext {
    /// Resolve user and display against the config, consulting the
    /// collector only when no user is preconfigured
    ///
    /// Returns `None` when the collector decided not to log anyone in; the
    /// reboot/halt hand-off has already happened by then.
    pub fn from_config(
        config: &Config,
        collector: &mut dyn CredentialCollector,
    ) -> Result<Option<Self>> {
        let username = match preset_username(config) {
            Some(name) => name,
            None => match collector.collect()? {
                LoginDecision::Login(name) => name,
                LoginDecision::Quit => return Ok(None),
                LoginDecision::Reboot => {
                    hand_off_to_shutdown("-r")?;
                    return Ok(None);
                }
                LoginDecision::Shutdown => {
                    hand_off_to_shutdown("-h")?;
                    return Ok(None);
                }
            },
        };

        let user = resolve_user(&username)?;

        let (display, display_lock) = match &config.session.display {
            Some(display) => (display.clone(), None),
            None => {
                let (selected, lock) = config::select_free_display(Path::new(DISPLAY_LOCK_DIR))
                    .map_err(|e| LaunchError::Config(e.to_string()))?;
                info!("selected display {}", selected);
                (selected, Some(lock))
            }
        };
        let display_number = config::parse_display_number(&display)
            .map_err(|e| LaunchError::Config(e.to_string()))?;

        let authority = xauth::resolve(config.session.authority_file.as_deref(), Some(&user.home));

        Ok(Some(Self {
            user,
            display,
            display_number,
            display_lock,
            authority,
            drop_privileges: config.session.drop_privileges,
            config: config.clone(),
        }))
    }

    fn spawner_config(&self) -> SpawnerConfig {
        SpawnerConfig {
            display: self.display.clone(),
            display_number: self.display_number,
            server_program: self.config.server.program.clone(),
            server_args: self.config.server.args.clone(),
            client_program: self.config.client.program.clone(),
            client_args: self.config.client.args.clone(),
            boot_delay: Duration::from_secs(self.config.server.boot_delay_secs as u64),
            boot_timeout_cycles: self.config.server.boot_timeout_cycles,
            shutdown_grace: Duration::from_secs(self.config.server.shutdown_grace_secs as u64),
            kill_grace: Duration::from_secs(self.config.server.kill_grace_secs as u64),
            socket_dir: PathBuf::from(DISPLAY_SOCKET_DIR),
        }
    }
}

/// Username from config or, when running under sudo, from SUDO_USER
fn preset_username(config: &Config) -> Option<String> {
    if let Some(name) = &config.session.user {
        return Some(name.clone());
    }
    match std::env::var("SUDO_USER") {
        Ok(name) if !name.is_empty() => {
            info!("using invoking sudo user {}", name);
            Some(name)
        }
        _ => None,
    }
}

/// Delegate reboot/halt to the system shutdown command
fn hand_off_to_shutdown(flag: &str) -> Result<()> {
    info!("handing off to shutdown {} now", flag);
    let status = std::process::Command::new("shutdown")
        .args([flag, "now"])
        .status()
        .map_err(|e| LaunchError::Config(format!("cannot run shutdown: {e}")))?;
    if !status.success() {
        return Err(LaunchError::Config(format!("shutdown exited with {status}")));
    }
    Ok(())
}

/// Point the session environment at the target user
///
/// The chdir into the home directory is best effort; a missing home is not
/// a reason to refuse the login.
fn prepare_environment(ctx: &SessionContext) {
    std::env::set_var("USER", &ctx.user.name);
    std::env::set_var("USERNAME", &ctx.user.name);
    std::env::set_var("LOGNAME", &ctx.user.name);
    std::env::set_var("HOME", &ctx.user.home);
    std::env::set_var("SHELL", &ctx.user.shell);
    std::env::set_var("DISPLAY", &ctx.display);

    if let Err(e) = std::env::set_current_dir(&ctx.user.home) {
        warn!(
            "cannot enter home directory {}: {}",
            ctx.user.home.display(),
            e
        );
    }
}

/// A dead server sometimes leaves its display lock behind; remove it when
/// the pid it names is gone
fn cleanup_display_lock(ctx: &SessionContext) {
    let Some(lock) = &ctx.display_lock else {
        return;
    };
    let Ok(contents) = std::fs::read_to_string(lock) else {
        return;
    };
    let stale = match contents.trim().parse::<i32>() {
        Ok(pid) if pid > 0 => !daemon::pid_exists(Pid::from_raw(pid)),
        _ => true,
    };
    if stale {
        info!("removing leftover display lock {}", lock.display());
        if let Err(e) = std::fs::remove_file(lock) {
            warn!("cannot remove {}: {}", lock.display(), e);
        }
    }
}

/// Run one complete session in the current process
///
/// Console state and privileges are restored no matter how the session
/// ended; the returned code is what the launcher should exit with.
pub fn run_session(ctx: &SessionContext) -> Result<i32> {
    let flags = SignalFlags::new();
    flags.reset();

    let mut console = ConsoleController::new();
    console.save();

    prepare_environment(ctx);
    if let Err(e) = xauth::establish(&ctx.authority, Some(&ctx.user.identity)) {
        warn!("continuing without authority file: {}", e);
    }

    let mut privileges = PrivilegeContext::new(ctx.user.identity.clone(), ctx.drop_privileges);
    let mut spawner = Spawner::new(ctx.spawner_config())?;

    let result = spawner.run(&mut privileges, &flags);

    privileges.restore();
    console.restore();
    cleanup_display_lock(ctx);

    result
}

/// Foreground entry point
///
/// With a preconfigured user this runs exactly one session. Otherwise it is
/// a login loop: after each session ends the collector is asked again, until
/// it decides quit/reboot/halt or a termination signal ends the run.
pub fn run_foreground(config: &Config, collector: &mut dyn CredentialCollector) -> Result<i32> {
    let single_shot = preset_username(config).is_some();
    let flags = SignalFlags::new();

    loop {
        let Some(ctx) = SessionContext::from_config(config, collector)? else {
            return Ok(0);
        };
        let code = run_session(&ctx)?;
        if single_shot || flags.termination_requested() {
            return Ok(code);
        }
        info!("session over, returning to login");
    }
}

/// Daemon entry point
///
/// Detaches, takes the pid lockfile, forks a session leader running the
/// normal foreground supervision, and watches it from the idle loop. The
/// lockfile is removed on the way out even when the session failed.
pub fn run_daemon(config: &Config, collector: &mut dyn CredentialCollector) -> Result<i32> {
    let Some(ctx) = SessionContext::from_config(config, collector)? else {
        return Ok(0);
    };

    // A previous instance may have locked either location, depending on
    // whether /run was writable for it.
    PidFile::check_stale_all(&PidFile::candidate_paths())?;

    daemon::daemonize(config.daemon.inherit_descriptors)?;

    let pidfile = PidFile::create(Some(&ctx.user.identity))?;
    let flags = SignalFlags::new();
    flags.reset();

    let leader = match unsafe { unistd::fork() } {
        Ok(ForkResult::Child) => {
            let code = match run_session(&ctx) {
                Ok(code) => code,
                Err(e) => {
                    warn!("session failed: {}", e);
                    1
                }
            };
            unsafe { libc::_exit(code as libc::c_int) };
        }
        Ok(ForkResult::Parent { child }) => child,
        Err(e) => {
            pidfile.remove();
            return Err(LaunchError::Daemon(format!("cannot fork session: {e}")));
        }
    };

    let supervisor = DaemonSupervisor::new(
        Duration::from_secs(config.daemon.poll_interval_secs),
        config.session.kill_server_on_exit,
    );
    match supervisor {
        Ok(supervisor) => supervisor.supervise(leader, &flags),
        Err(e) => warn!("cannot supervise session: {}", e),
    }

    pidfile.remove();
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedCollector(Option<LoginDecision>);

    impl CredentialCollector for FixedCollector {
        fn collect(&mut self) -> Result<LoginDecision> {
            Ok(self.0.take().unwrap_or(LoginDecision::Quit))
        }
    }

    #[test]
    fn test_quit_decision_yields_no_context() {
        std::env::remove_var("SUDO_USER");
        let config = Config::default();
        let mut collector = FixedCollector(Some(LoginDecision::Quit));
        let ctx = SessionContext::from_config(&config, &mut collector).unwrap();
        assert!(ctx.is_none());
    }

    #[test]
    fn test_preset_user_skips_collector() {
        struct PanicCollector;
        impl CredentialCollector for PanicCollector {
            fn collect(&mut self) -> Result<LoginDecision> {
                panic!("collector must not be consulted with a preset user");
            }
        }

        let mut config = Config::default();
        config.session.user = Some("root".into());
        config.session.display = Some(":7".into());

        let ctx = SessionContext::from_config(&config, &mut PanicCollector)
            .unwrap()
            .unwrap();
        assert_eq!(ctx.user.name, "root");
        assert_eq!(ctx.user.identity.uid, 0);
        assert_eq!(ctx.display, ":7");
        assert_eq!(ctx.display_number, 7);
        assert!(ctx.display_lock.is_none(), "preset display takes no lock");
    }

    #[test]
    fn test_unknown_user_rejected() {
        let mut config = Config::default();
        config.session.user = Some("no-such-user-here".into());
        config.session.display = Some(":0".into());

        let err = SessionContext::from_config(&config, &mut FixedCollector(None)).unwrap_err();
        assert!(matches!(err, LaunchError::Identity(_)));
    }

    #[test]
    fn test_collector_consulted_for_every_login() {
        std::env::remove_var("SUDO_USER");
        let mut config = Config::default();
        config.session.display = Some(":8".into());

        struct SequenceCollector(Vec<LoginDecision>);
        impl CredentialCollector for SequenceCollector {
            fn collect(&mut self) -> Result<LoginDecision> {
                Ok(self.0.remove(0))
            }
        }

        // The login loop builds a fresh context per round; each round must
        // go back to the collector until it decides to quit.
        let mut collector = SequenceCollector(vec![
            LoginDecision::Login("root".into()),
            LoginDecision::Login("root".into()),
            LoginDecision::Quit,
        ]);

        for _ in 0..2 {
            let ctx = SessionContext::from_config(&config, &mut collector).unwrap();
            assert!(ctx.is_some(), "a login decision must yield a context");
        }
        let ctx = SessionContext::from_config(&config, &mut collector).unwrap();
        assert!(ctx.is_none(), "quit must end the loop");
    }

    #[test]
    fn test_resolve_root() {
        let user = resolve_user("root").unwrap();
        assert_eq!(user.identity.uid, 0);
        assert_eq!(user.identity.gid, 0);
        assert!(!user.home.as_os_str().is_empty());
    }
}
