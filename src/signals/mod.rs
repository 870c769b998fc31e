//! Process-wide signal flags
//!
//! Signal handlers here only touch fixed atomics - no allocation, no
//! syscalls, no locks - because they can interrupt the supervisor at an
//! arbitrary point. The supervisors consume the flags through the poll
//! methods on [`SignalFlags`]; normal control flow never writes them.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

static TERM_SIGNAL: AtomicI32 = AtomicI32::new(0);
static HUP_FLAG: AtomicBool = AtomicBool::new(false);

extern "C" fn catch_termination(sig: libc::c_int) {
    // Recording the number is all a handler may safely do; the supervisor
    // loops poll the flag and act outside signal context.
    TERM_SIGNAL.store(sig, Ordering::SeqCst);
}

extern "C" fn catch_hup(_sig: libc::c_int) {
    HUP_FLAG.store(true, Ordering::SeqCst);
}

extern "C" fn catch_noop(_sig: libc::c_int) {
    // Installed for SIGALRM/SIGUSR1 so delivery interrupts sigsuspend
    // without terminating the process.
}

/// Poll interface over the handler-set flags
///
/// Zero-sized by design: the real state is process-global because signal
/// dispositions are process-global. Constructing an instance documents which
/// component is polling.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalFlags;

impl SignalFlags {
    /// Create a poll handle
    pub fn new() -> Self {
        Self
    }

    /// Signal number of a recorded termination request, if any
    pub fn termination(&self) -> Option<i32> {
        match TERM_SIGNAL.load(Ordering::SeqCst) {
            0 => None,
            sig => Some(sig),
        }
    }

    /// True once a termination signal has been recorded
    pub fn termination_requested(&self) -> bool {
        self.termination().is_some()
    }

    /// Consume the hangup flag, clearing it
    pub fn take_hup(&self) -> bool {
        HUP_FLAG.swap(false, Ordering::SeqCst)
    }

    /// Reset all flags (startup and tests)
    pub fn reset(&self) {
        TERM_SIGNAL.store(0, Ordering::SeqCst);
        HUP_FLAG.store(false, Ordering::SeqCst);
    }
}

/// Install the foreground supervisor dispositions
///
/// Termination signals (TERM, QUIT, INT, HUP, PIPE) record themselves and
/// interrupt blocking waits - deliberately no SA_RESTART, so `wait()` in the
/// monitor loop returns with EINTR. ALRM and USR1 get a no-op handler with
/// SA_RESTART; they exist only to end a `sigsuspend`.
pub fn install_supervisor_handlers() -> nix::Result<()> {
    let catch = SigAction::new(
        SigHandler::Handler(catch_termination),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let noop = SigAction::new(
        SigHandler::Handler(catch_noop),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );

    unsafe {
        signal::sigaction(Signal::SIGTERM, &catch)?;
        signal::sigaction(Signal::SIGQUIT, &catch)?;
        signal::sigaction(Signal::SIGINT, &catch)?;
        signal::sigaction(Signal::SIGHUP, &catch)?;
        signal::sigaction(Signal::SIGPIPE, &catch)?;
        signal::sigaction(Signal::SIGALRM, &noop)?;
        signal::sigaction(Signal::SIGUSR1, &noop)?;
        // Children are reaped explicitly in the monitor loop.
        signal::signal(Signal::SIGCHLD, SigHandler::SigDfl)?;
    }
    Ok(())
}

/// Install the daemon dispositions
///
/// HUP sets a flag the idle loop consumes once per iteration; TERM and INT
/// request loop exit; PIPE is ignored outright so a dead peer write cannot
/// kill the daemon.
pub fn install_daemon_handlers() -> nix::Result<()> {
    let term = SigAction::new(
        SigHandler::Handler(catch_termination),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    let hup = SigAction::new(
        SigHandler::Handler(catch_hup),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );

    unsafe {
        signal::sigaction(Signal::SIGTERM, &term)?;
        signal::sigaction(Signal::SIGINT, &term)?;
        signal::sigaction(Signal::SIGHUP, &hup)?;
        signal::signal(Signal::SIGPIPE, SigHandler::SigIgn)?;
    }
    Ok(())
}

/// Ignore termination signals during final teardown
///
/// Once shutdown has begun a late TERM or INT must not abort the cleanup
/// half-way through.
pub fn ignore_termination_signals() {
    unsafe {
        let _ = signal::signal(Signal::SIGTERM, SigHandler::SigIgn);
        let _ = signal::signal(Signal::SIGQUIT, SigHandler::SigIgn);
        let _ = signal::signal(Signal::SIGINT, SigHandler::SigIgn);
        let _ = signal::signal(Signal::SIGHUP, SigHandler::SigIgn);
        let _ = signal::signal(Signal::SIGPIPE, SigHandler::SigIgn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_start_clear() {
        let flags = SignalFlags::new();
        flags.reset();
        assert!(!flags.termination_requested());
        assert!(!flags.take_hup());
    }

    #[test]
    fn test_termination_records_signal_number() {
        let flags = SignalFlags::new();
        flags.reset();
        catch_termination(libc::SIGTERM);
        assert_eq!(flags.termination(), Some(libc::SIGTERM));
        flags.reset();
        assert!(flags.termination().is_none());
    }

    #[test]
    fn test_hup_flag_consumed_once() {
        let flags = SignalFlags::new();
        flags.reset();
        catch_hup(libc::SIGHUP);
        assert!(flags.take_hup());
        assert!(!flags.take_hup());
    }
}
