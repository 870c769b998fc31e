//! Launcher integration tests
//!
//! Exercises the spawn/ready/monitor/shutdown cycle against real child
//! processes (shell scripts standing in for the display server and client).
//! Tests that need the single-threaded signal dance run in a forked child
//! so the test harness threads cannot swallow SIGALRM/SIGUSR1.

use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use vtlaunch::config::Config;
use vtlaunch::daemon::{DaemonSupervisor, PidFile};
use vtlaunch::error::LaunchError;
use vtlaunch::privileges::{Identity, PrivilegeContext};
use vtlaunch::session::{self, CredentialCollector, LoginDecision};
use vtlaunch::signals::SignalFlags;
use vtlaunch::spawner::{SessionEnd, Spawner, SpawnerConfig, SupervisorState};

/// Write an executable shell script into the test directory
fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn config_with(dir: &Path, server: PathBuf, client: PathBuf) -> SpawnerConfig {
    SpawnerConfig {
        display: ":5".into(),
        display_number: 5,
        server_program: server,
        server_args: vec![],
        client_program: client,
        client_args: vec![],
        boot_delay: Duration::from_secs(1),
        boot_timeout_cycles: 3,
        shutdown_grace: Duration::from_secs(1),
        kill_grace: Duration::from_secs(2),
        socket_dir: dir.to_path_buf(),
    }
}

/// Run `f` in a forked child and return its exit code
///
/// The child is single-threaded after the fork, so process-directed signals
/// land where the spawner expects them.
fn run_in_child<F: FnOnce() -> i32>(f: F) -> i32 {
    match unsafe { fork() }.expect("fork") {
        ForkResult::Child => {
            let code = f();
            unsafe { libc::_exit(code) };
        }
        ForkResult::Parent { child } => match waitpid(child, None).expect("waitpid") {
            WaitStatus::Exited(_, code) => code,
            other => panic!("child did not exit cleanly: {other:?}"),
        },
    }
}

#[test]
fn test_readiness_timeout_when_server_never_listens() {
    let dir = tempfile::tempdir().unwrap();
    let server = write_script(dir.path(), "server.sh", "sleep 30");
    let config = config_with(dir.path(), server, PathBuf::from("/bin/true"));

    let started = Instant::now();
    let code = run_in_child(move || {
        let mut spawner = Spawner::new(config).unwrap();
        match spawner.start_server() {
            Err(LaunchError::ReadinessTimeout { display, cycles }) => {
                assert_eq!(display, ":5");
                assert_eq!(cycles, 3);
                let _ = spawner.shutdown();
                0
            }
            other => {
                eprintln!("unexpected start_server result: {other:?}");
                1
            }
        }
    });

    assert_eq!(code, 0);
    // 1s signal window plus 3 probe cycles, nowhere near the script's 30s
    assert!(started.elapsed() < Duration::from_secs(20));
}

#[test]
fn test_readiness_timeout_leaves_no_server_behind() {
    let dir = tempfile::tempdir().unwrap();
    // Never listens, never dies on its own
    let server = write_script(dir.path(), "server.sh", "sleep 60");
    let mut config = config_with(dir.path(), server, PathBuf::from("/bin/true"));
    config.boot_timeout_cycles = 2;

    let code = run_in_child(move || {
        let mut spawner = Spawner::new(config).unwrap();
        match spawner.start_server() {
            Err(LaunchError::ReadinessTimeout { .. }) => {}
            other => {
                eprintln!("unexpected start_server result: {other:?}");
                return 1;
            }
        }
        // The pid must be on record even though startup failed, so the
        // teardown can reach the half-started server.
        let Some(pid) = spawner.server_pid() else {
            return 2;
        };
        if spawner.shutdown().is_err() {
            return 3;
        }
        if nix::sys::signal::kill(pid, None).is_ok() {
            eprintln!("server {pid} survived the failed startup");
            return 4;
        }
        0
    });
    assert_eq!(code, 0);
}

#[test]
fn test_zero_boot_delay_wait_stays_bounded() {
    let dir = tempfile::tempdir().unwrap();
    let server = write_script(dir.path(), "server.sh", "sleep 30");
    let mut config = config_with(dir.path(), server, PathBuf::from("/bin/true"));
    config.boot_delay = Duration::ZERO;
    config.boot_timeout_cycles = 2;

    let started = Instant::now();
    let code = run_in_child(move || {
        let mut spawner = Spawner::new(config).unwrap();
        match spawner.start_server() {
            Err(LaunchError::ReadinessTimeout { cycles, .. }) => {
                assert_eq!(cycles, 2);
                let _ = spawner.shutdown();
                0
            }
            other => {
                eprintln!("unexpected start_server result: {other:?}");
                1
            }
        }
    });

    assert_eq!(code, 0);
    // No signal window at all: the probe cycles alone bound the wait.
    assert!(started.elapsed() < Duration::from_secs(15));
}

#[test]
fn test_ready_signal_beats_the_alarm() {
    let dir = tempfile::tempdir().unwrap();
    let _listener = UnixListener::bind(dir.path().join("X5")).unwrap();
    // Signals readiness immediately, the way a real server does
    let server = write_script(dir.path(), "server.sh", "kill -USR1 $PPID\nsleep 30");
    let mut config = config_with(dir.path(), server, PathBuf::from("/bin/true"));
    config.boot_delay = Duration::from_secs(5);

    let started = Instant::now();
    let code = run_in_child(move || {
        let mut spawner = Spawner::new(config).unwrap();
        if spawner.start_server().is_err() {
            return 1;
        }
        let _ = spawner.shutdown();
        0
    });

    assert_eq!(code, 0);
    // The USR1 must end the wait well before the 5s alarm window
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[test]
fn test_readiness_via_connect_probe() {
    let dir = tempfile::tempdir().unwrap();
    // Stand-in display socket; a real server would create this itself
    let _listener = UnixListener::bind(dir.path().join("X5")).unwrap();
    let server = write_script(dir.path(), "server.sh", "sleep 30");
    let config = config_with(dir.path(), server, PathBuf::from("/bin/true"));

    let code = run_in_child(move || {
        let mut spawner = Spawner::new(config).unwrap();
        if spawner.start_server().is_err() {
            return 1;
        }
        if spawner.state() != SupervisorState::ServerReady {
            return 2;
        }
        if spawner.shutdown().is_err() {
            return 3;
        }
        if spawner.state() != SupervisorState::Terminated {
            return 4;
        }
        0
    });
    assert_eq!(code, 0);
}

#[test]
fn test_shutdown_escalates_to_kill() {
    let dir = tempfile::tempdir().unwrap();
    let _listener = UnixListener::bind(dir.path().join("X5")).unwrap();
    // A server that ignores SIGTERM and has to be killed
    let server = write_script(
        dir.path(),
        "stubborn.sh",
        "trap '' TERM\nwhile :; do sleep 1; done",
    );
    let config = config_with(dir.path(), server, PathBuf::from("/bin/true"));

    let started = Instant::now();
    let code = run_in_child(move || {
        let mut spawner = Spawner::new(config).unwrap();
        if spawner.start_server().is_err() {
            return 1;
        }
        match spawner.shutdown() {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("shutdown failed: {e}");
                2
            }
        }
    });

    assert_eq!(code, 0);
    // Must have sat out the full TERM grace window before the KILL worked
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert!(started.elapsed() < Duration::from_secs(30));
}

#[test]
fn test_client_exit_code_propagates() {
    let dir = tempfile::tempdir().unwrap();
    let _listener = UnixListener::bind(dir.path().join("X5")).unwrap();
    let server = write_script(dir.path(), "server.sh", "sleep 30");
    let client = write_script(dir.path(), "client.sh", "exit 7");
    let config = config_with(dir.path(), server, client);

    let code = run_in_child(move || {
        // Dropping disabled: the test does not run as a privileged launcher
        let identity = Identity {
            uid: 65534,
            gid: 65534,
            groups: vec![65534],
        };
        let mut privileges = PrivilegeContext::new(identity, false);

        let mut spawner = Spawner::new(config).unwrap();
        let flags = SignalFlags::new();
        flags.reset();
        match spawner.run(&mut privileges, &flags) {
            Ok(code) => code,
            Err(e) => {
                eprintln!("run failed: {e}");
                100
            }
        }
    });
    assert_eq!(code, 7);
}

#[test]
fn test_monitor_reports_server_death() {
    let dir = tempfile::tempdir().unwrap();
    let _listener = UnixListener::bind(dir.path().join("X5")).unwrap();
    // Server dies shortly after coming up, client outlives it
    let server = write_script(dir.path(), "server.sh", "sleep 2");
    let client = write_script(dir.path(), "client.sh", "sleep 30");
    let config = config_with(dir.path(), server, client);

    let code = run_in_child(move || {
        let mut spawner = Spawner::new(config).unwrap();
        if spawner.start_server().is_err() {
            return 1;
        }
        if spawner.start_client().is_err() {
            return 2;
        }
        let flags = SignalFlags::new();
        flags.reset();
        let end = spawner.monitor(&flags);
        let _ = spawner.shutdown();
        match end {
            SessionEnd::ServerExited(_) => 0,
            other => {
                eprintln!("unexpected session end: {other:?}");
                3
            }
        }
    });
    assert_eq!(code, 0);
}

#[test]
fn test_login_loop_runs_sessions_until_quit() {
    let dir = tempfile::tempdir().unwrap();

    // The session layer probes the well-known display socket directory, so
    // the stand-in listener has to live there for this one test.
    let socket_dir = Path::new("/tmp/.X11-unix");
    std::fs::create_dir_all(socket_dir).unwrap();
    let socket = socket_dir.join("X8");
    let _ = std::fs::remove_file(&socket);
    let _listener = UnixListener::bind(&socket).unwrap();

    let marker = dir.path().join("sessions");
    let server = write_script(dir.path(), "server.sh", "sleep 30");
    let client = write_script(
        dir.path(),
        "client.sh",
        &format!("echo session >> {}\nexit 0", marker.display()),
    );

    let mut config = Config::default();
    config.session.display = Some(":8".into());
    config.session.user = None;
    config.session.drop_privileges = false;
    config.server.program = server;
    config.server.args = vec![];
    config.server.boot_delay_secs = 1;
    config.server.boot_timeout_cycles = 5;
    config.server.shutdown_grace_secs = 1;
    config.server.kill_grace_secs = 2;
    config.client.program = client;
    config.client.args = vec![];

    let authority = dir.path().join("authority");
    let marker_check = marker.clone();
    let code = run_in_child(move || {
        std::env::remove_var("SUDO_USER");
        std::env::set_var("XAUTHORITY", &authority);

        struct SequenceCollector(Vec<LoginDecision>);
        impl CredentialCollector for SequenceCollector {
            fn collect(&mut self) -> vtlaunch::Result<LoginDecision> {
                Ok(self.0.remove(0))
            }
        }
        // Two logins, then quit: the loop must run a session per login.
        let mut collector = SequenceCollector(vec![
            LoginDecision::Login("root".into()),
            LoginDecision::Login("root".into()),
            LoginDecision::Quit,
        ]);

        match session::run_foreground(&config, &mut collector) {
            Ok(0) => {}
            Ok(code) => {
                eprintln!("unexpected exit code {code}");
                return 1;
            }
            Err(e) => {
                eprintln!("login loop failed: {e}");
                return 2;
            }
        }
        let sessions = std::fs::read_to_string(&marker_check)
            .map(|s| s.lines().count())
            .unwrap_or(0);
        if sessions != 2 {
            eprintln!("expected 2 sessions, saw {sessions}");
            return 3;
        }
        0
    });

    let _ = std::fs::remove_file(&socket);
    assert_eq!(code, 0);
}

#[test]
fn test_lockfile_gate_against_live_and_dead_pids() {
    let dir = tempfile::tempdir().unwrap();
    let lockfile = dir.path().join("vtlaunch.pid");

    let mut holder = std::process::Command::new("sleep")
        .arg("30")
        .spawn()
        .unwrap();
    std::fs::write(&lockfile, format!("{}\n", holder.id())).unwrap();

    // A live pid in the lockfile blocks startup
    assert!(matches!(
        PidFile::check_stale(&lockfile),
        Err(LaunchError::Daemon(_))
    ));

    holder.kill().unwrap();
    holder.wait().unwrap();

    // Once the holder is gone the file is stale and gets cleaned up
    PidFile::check_stale(&lockfile).unwrap();
    assert!(!lockfile.exists());
}

#[test]
fn test_daemon_supervisor_notices_dead_session() {
    let session = std::process::Command::new("sleep").arg("1").spawn().unwrap();
    let pid = Pid::from_raw(session.id() as i32);

    let supervisor = DaemonSupervisor::new(Duration::from_secs(1), false).unwrap();
    let flags = SignalFlags::new();
    flags.reset();

    let started = Instant::now();
    supervisor.supervise(pid, &flags);
    // The 1s session plus at most a couple of poll cycles
    assert!(started.elapsed() < Duration::from_secs(10));
}
