//! Privilege separation
//!
//! The launcher normally starts as root (it needs device access for the
//! display server) and impersonates an unprivileged target user for the
//! client. [`PrivilegeContext`] owns that transition: it captures the
//! original identity at construction, drops to the target exactly once, and
//! can restore the original around privileged cleanup work.
//!
//! There is only one real uid/gid per process, so the context is threaded
//! through the supervisor and daemon explicitly rather than hidden behind a
//! global. Identity mutation goes through [`IdentityBackend`] so tests can
//! substitute a fake and exercise the state machine without being root.

use nix::errno::Errno;
use nix::unistd::{self, Gid, Uid};
use tracing::{debug, error, info, warn};

/// A resolved OS identity: uid, gid and supplementary group set
///
/// Resolution from a username lives in the session layer, which also needs
/// the home directory and shell out of the same passwd entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// User id
    pub uid: u32,
    /// Primary group id
    pub gid: u32,
    /// Supplementary groups
    pub groups: Vec<u32>,
}

/// Whether the process currently holds its original or target identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegeState {
    /// Original identity in effect
    Elevated,
    /// Target identity in effect after a successful drop
    Dropped,
}

/// Identity-mutation seam
///
/// The real implementation forwards to the setuid family; tests provide a
/// recording fake.
pub trait IdentityBackend {
    /// Current effective uid
    fn effective_uid(&self) -> u32;
    /// Current effective gid
    fn effective_gid(&self) -> u32;
    /// Current supplementary group set
    fn current_groups(&self) -> nix::Result<Vec<u32>>;
    /// Replace the supplementary group set
    fn set_groups(&mut self, groups: &[u32]) -> nix::Result<()>;
    /// Set real and effective gid
    fn set_real_effective_gid(&mut self, gid: u32) -> nix::Result<()>;
    /// Set real and effective uid
    fn set_real_effective_uid(&mut self, uid: u32) -> nix::Result<()>;
    /// Set effective gid only (restore path)
    fn set_effective_gid(&mut self, gid: u32) -> nix::Result<()>;
    /// Set effective uid only (restore path)
    fn set_effective_uid(&mut self, uid: u32) -> nix::Result<()>;
}

/// Backend forwarding to the real process credentials
#[derive(Debug, Default)]
pub struct OsIdentityBackend;

impl IdentityBackend for OsIdentityBackend {
    fn effective_uid(&self) -> u32 {
        unistd::geteuid().as_raw()
    }

    fn effective_gid(&self) -> u32 {
        unistd::getegid().as_raw()
    }

    fn current_groups(&self) -> nix::Result<Vec<u32>> {
        Ok(unistd::getgroups()?
            .into_iter()
            .map(|g| g.as_raw())
            .collect())
    }

    fn set_groups(&mut self, groups: &[u32]) -> nix::Result<()> {
        let gids: Vec<Gid> = groups.iter().copied().map(Gid::from_raw).collect();
        unistd::setgroups(&gids)
    }

    fn set_real_effective_gid(&mut self, gid: u32) -> nix::Result<()> {
        Errno::result(unsafe { libc::setregid(gid, gid) }).map(drop)
    }

    fn set_real_effective_uid(&mut self, uid: u32) -> nix::Result<()> {
        Errno::result(unsafe { libc::setreuid(uid, uid) }).map(drop)
    }

    fn set_effective_gid(&mut self, gid: u32) -> nix::Result<()> {
        unistd::setegid(Gid::from_raw(gid))
    }

    fn set_effective_uid(&mut self, uid: u32) -> nix::Result<()> {
        unistd::seteuid(Uid::from_raw(uid))
    }
}

/// Owns the original and target identities and the drop/restore state machine
pub struct PrivilegeContext<B: IdentityBackend = OsIdentityBackend> {
    backend: B,
    enabled: bool,
    state: PrivilegeState,
    original: Identity,
    target: Identity,
}

impl PrivilegeContext<OsIdentityBackend> {
    /// Build a context over the real process credentials
    pub fn new(target: Identity, enabled: bool) -> Self {
        Self::with_backend(OsIdentityBackend, target, enabled)
    }
}

impl<B: IdentityBackend> PrivilegeContext<B> {
    /// Build a context over an explicit backend, capturing the original
    /// identity at call time
    pub fn with_backend(backend: B, target: Identity, enabled: bool) -> Self {
        let original = Identity {
            uid: backend.effective_uid(),
            gid: backend.effective_gid(),
            groups: backend.current_groups().unwrap_or_default(),
        };

        Self {
            backend,
            enabled,
            state: PrivilegeState::Elevated,
            original,
            target,
        }
    }

    /// Target identity this context drops to
    pub fn target(&self) -> &Identity {
        &self.target
    }

    /// Whether dropping is enabled at all
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Identity captured at construction
    pub fn original(&self) -> &Identity {
        &self.original
    }

    /// Current state
    pub fn state(&self) -> PrivilegeState {
        self.state
    }

    /// Drop to the target identity
    ///
    /// Returns false without touching anything when dropping is disabled or
    /// has already happened. Group id goes first: once the uid is gone the
    /// process may no longer be allowed to change its groups. Each step is
    /// verified against the effective ids; on any failure the process is left
    /// in whatever partial state resulted and the caller must treat the run
    /// as unfit for the client.
    pub fn drop(&mut self) -> bool {
        if !self.enabled {
            debug!("privilege dropping disabled, keeping current identity");
            return false;
        }
        if self.state == PrivilegeState::Dropped {
            debug!("privileges already dropped, ignoring repeated drop");
            return false;
        }

        info!(
            uid = self.target.uid,
            gid = self.target.gid,
            "dropping privileges"
        );

        if let Err(e) = self.backend.set_groups(&[self.target.gid]) {
            error!("clearing supplementary groups failed: {}", e);
            return false;
        }

        if let Err(e) = self.backend.set_real_effective_gid(self.target.gid) {
            error!("setting gid {} failed: {}", self.target.gid, e);
            return false;
        }
        if self.backend.effective_gid() != self.target.gid {
            error!(
                "gid verification failed: effective {} != target {}",
                self.backend.effective_gid(),
                self.target.gid
            );
            return false;
        }

        if let Err(e) = self.backend.set_real_effective_uid(self.target.uid) {
            error!("setting uid {} failed: {}", self.target.uid, e);
            return false;
        }
        if self.backend.effective_uid() != self.target.uid {
            error!(
                "uid verification failed: effective {} != target {}",
                self.backend.effective_uid(),
                self.target.uid
            );
            return false;
        }

        self.state = PrivilegeState::Dropped;
        true
    }

    /// Restore the identity captured at construction
    ///
    /// Only meaningful after a successful drop; otherwise a no-op. Uid comes
    /// back first, mirroring the drop order, since the gid change may require
    /// the original uid. Runs during best-effort cleanup, so verification
    /// failures are logged rather than returned.
    pub fn restore(&mut self) {
        if !self.enabled || self.state != PrivilegeState::Dropped {
            debug!("no privilege drop to restore");
            return;
        }

        info!(
            uid = self.original.uid,
            gid = self.original.gid,
            "restoring privileges"
        );

        if self.backend.effective_uid() != self.original.uid {
            if self.backend.set_effective_uid(self.original.uid).is_err()
                || self.backend.effective_uid() != self.original.uid
            {
                warn!("restoring uid {} failed, continuing", self.original.uid);
            }
        }

        if self.backend.effective_gid() != self.original.gid {
            if self.backend.set_effective_gid(self.original.gid).is_err()
                || self.backend.effective_gid() != self.original.gid
            {
                warn!("restoring gid {} failed, continuing", self.original.gid);
            }
        }

        // Supplementary groups only come back for a originally-root process;
        // anyone else was never allowed to change them.
        if self.original.uid == 0 {
            if let Err(e) = self.backend.set_groups(&self.original.groups) {
                warn!("restoring supplementary groups failed: {}", e);
            }
        }

        self.state = PrivilegeState::Elevated;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fake backend recording every mutation in order
    struct RecordingBackend {
        uid: u32,
        gid: u32,
        groups: Vec<u32>,
        calls: Vec<String>,
        fail_uid_change: bool,
    }

    impl RecordingBackend {
        fn root() -> Self {
            Self {
                uid: 0,
                gid: 0,
                groups: vec![0, 4, 27],
                calls: Vec::new(),
                fail_uid_change: false,
            }
        }
    }

    impl IdentityBackend for RecordingBackend {
        fn effective_uid(&self) -> u32 {
            self.uid
        }
        fn effective_gid(&self) -> u32 {
            self.gid
        }
        fn current_groups(&self) -> nix::Result<Vec<u32>> {
            Ok(self.groups.clone())
        }
        fn set_groups(&mut self, groups: &[u32]) -> nix::Result<()> {
            self.calls.push(format!("setgroups{:?}", groups));
            self.groups = groups.to_vec();
            Ok(())
        }
        fn set_real_effective_gid(&mut self, gid: u32) -> nix::Result<()> {
            self.calls.push(format!("setregid({gid})"));
            self.gid = gid;
            Ok(())
        }
        fn set_real_effective_uid(&mut self, uid: u32) -> nix::Result<()> {
            if self.fail_uid_change {
                return Err(nix::errno::Errno::EPERM);
            }
            self.calls.push(format!("setreuid({uid})"));
            self.uid = uid;
            Ok(())
        }
        fn set_effective_gid(&mut self, gid: u32) -> nix::Result<()> {
            self.calls.push(format!("setegid({gid})"));
            self.gid = gid;
            Ok(())
        }
        fn set_effective_uid(&mut self, uid: u32) -> nix::Result<()> {
            if self.fail_uid_change {
                return Err(nix::errno::Errno::EPERM);
            }
            self.calls.push(format!("seteuid({uid})"));
            self.uid = uid;
            Ok(())
        }
    }

    fn alice() -> Identity {
        Identity {
            uid: 1000,
            gid: 1000,
            groups: vec![1000],
        }
    }

    #[test]
    fn test_drop_then_restore_round_trip() {
        let mut ctx = PrivilegeContext::with_backend(RecordingBackend::root(), alice(), true);

        assert!(ctx.drop());
        assert_eq!(ctx.state(), PrivilegeState::Dropped);
        assert_eq!(ctx.backend.uid, 1000);
        assert_eq!(ctx.backend.gid, 1000);
        assert_eq!(ctx.backend.groups, vec![1000]);

        ctx.restore();
        assert_eq!(ctx.state(), PrivilegeState::Elevated);
        assert_eq!(ctx.backend.uid, 0);
        assert_eq!(ctx.backend.gid, 0);
        assert_eq!(ctx.backend.groups, vec![0, 4, 27]);
    }

    #[test]
    fn test_drop_orders_gid_before_uid() {
        let mut ctx = PrivilegeContext::with_backend(RecordingBackend::root(), alice(), true);
        assert!(ctx.drop());

        let gid_pos = ctx
            .backend
            .calls
            .iter()
            .position(|c| c.starts_with("setregid"))
            .unwrap();
        let uid_pos = ctx
            .backend
            .calls
            .iter()
            .position(|c| c.starts_with("setreuid"))
            .unwrap();
        assert!(gid_pos < uid_pos, "gid must drop before uid");
    }

    #[test]
    fn test_restore_orders_uid_before_gid() {
        let mut ctx = PrivilegeContext::with_backend(RecordingBackend::root(), alice(), true);
        assert!(ctx.drop());
        ctx.restore();

        let restore_calls: Vec<&String> = ctx
            .backend
            .calls
            .iter()
            .filter(|c| c.starts_with("sete"))
            .collect();
        assert!(restore_calls[0].starts_with("seteuid"));
        assert!(restore_calls[1].starts_with("setegid"));
    }

    #[test]
    fn test_second_drop_rejected_without_restore() {
        let mut ctx = PrivilegeContext::with_backend(RecordingBackend::root(), alice(), true);
        assert!(ctx.drop());
        let calls_after_first = ctx.backend.calls.len();

        assert!(!ctx.drop());
        assert_eq!(ctx.backend.calls.len(), calls_after_first, "no mutation");
        assert_eq!(ctx.backend.uid, 1000);
    }

    #[test]
    fn test_restore_without_drop_is_noop() {
        let mut ctx = PrivilegeContext::with_backend(RecordingBackend::root(), alice(), true);
        ctx.restore();
        assert!(ctx.backend.calls.is_empty());
        assert_eq!(ctx.state(), PrivilegeState::Elevated);
    }

    #[test]
    fn test_disabled_drop_changes_nothing() {
        let mut ctx = PrivilegeContext::with_backend(RecordingBackend::root(), alice(), false);
        assert!(!ctx.drop());
        assert!(ctx.backend.calls.is_empty());
        assert_eq!(ctx.state(), PrivilegeState::Elevated);

        ctx.restore();
        assert!(ctx.backend.calls.is_empty());
    }

    #[test]
    fn test_failed_uid_step_reports_failure() {
        let mut backend = RecordingBackend::root();
        backend.fail_uid_change = true;
        let mut ctx = PrivilegeContext::with_backend(backend, alice(), true);

        assert!(!ctx.drop());
        // Partial drop: gid went through, uid did not, state stays Elevated
        // so the caller sees the failure.
        assert_eq!(ctx.state(), PrivilegeState::Elevated);
        assert_eq!(ctx.backend.gid, 1000);
        assert_eq!(ctx.backend.uid, 0);
    }

    #[test]
    fn test_repeated_alternation_holds_invariant() {
        let mut ctx = PrivilegeContext::with_backend(RecordingBackend::root(), alice(), true);
        for _ in 0..3 {
            assert!(ctx.drop());
            assert_eq!(ctx.backend.uid, 1000);
            ctx.restore();
            assert_eq!(ctx.backend.uid, 0);
            assert_eq!(ctx.backend.gid, 0);
        }
    }
}
