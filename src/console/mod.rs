//! Virtual console save/restore
//!
//! The graphical session steals the active virtual terminal; this module
//! remembers which VT the caller was on and puts it back afterwards. Talking
//! to the console means finding any device that answers a keyboard-type
//! ioctl - `/dev/console`, the current VC, or the controlling terminal -
//! and issuing VT state/activate requests against it.

use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsRawFd, RawFd};

use tracing::{debug, warn};

use crate::error::{LaunchError, Result};

const CONSOLE_DEVICES: [&str; 3] = ["/dev/console", "/dev/tty0", "/dev/tty"];

/// Highest valid virtual console number
pub const MAX_CONSOLE: u16 = 63;

// From <linux/kd.h> and <linux/vt.h>; pulled in as constants so the kernel
// headers are not a build dependency.
const KDGKBTYPE: libc::c_ulong = 0x4B33;
const VT_GETSTATE: libc::c_ulong = 0x5603;
const VT_ACTIVATE: libc::c_ulong = 0x5606;
const VT_WAITACTIVE: libc::c_ulong = 0x5607;

#[repr(C)]
#[derive(Default)]
struct VtStat {
    v_active: libc::c_ushort,
    v_signal: libc::c_ushort,
    v_state: libc::c_ushort,
}

/// EINTR-retrying ioctl wrapper
fn xioctl(fd: RawFd, request: libc::c_ulong, arg: *mut libc::c_void) -> std::io::Result<()> {
    loop {
        let r = unsafe { libc::ioctl(fd, request as _, arg) };
        if r != -1 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}

/// Open one console candidate, tolerating permission failures per mode
///
/// Read-write first, then read-only, then write-only; some setups only grant
/// one direction and any of them is enough for an ioctl.
fn open_device(path: &str) -> Option<File> {
    let attempts = [
        OpenOptions::new().read(true).write(true).open(path),
        OpenOptions::new().read(true).open(path),
        OpenOptions::new().write(true).open(path),
    ];
    for attempt in attempts {
        match attempt {
            Ok(file) => return Some(file),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => continue,
            Err(_) => return None,
        }
    }
    None
}

/// True when the descriptor answers a keyboard-type query, i.e. is a console
fn is_console(fd: RawFd) -> bool {
    let mut kb_type: libc::c_char = 0;
    xioctl(fd, KDGKBTYPE, (&mut kb_type as *mut libc::c_char).cast()).is_ok()
}

enum ConsoleFd {
    Owned(File),
    Borrowed(RawFd),
}

impl ConsoleFd {
    fn raw(&self) -> RawFd {
        match self {
            ConsoleFd::Owned(f) => f.as_raw_fd(),
            ConsoleFd::Borrowed(fd) => *fd,
        }
    }
}

/// Find a descriptor on which VT ioctls work
///
/// Probes the known device names, then falls back to the three standard
/// descriptors in case one of them still points at a console.
fn console_fd() -> Option<ConsoleFd> {
    for name in CONSOLE_DEVICES {
        if let Some(file) = open_device(name) {
            if is_console(file.as_raw_fd()) {
                debug!("console device: {}", name);
                return Some(ConsoleFd::Owned(file));
            }
        }
    }
    for fd in 0..3 {
        if is_console(fd) {
            debug!("console on standard descriptor {}", fd);
            return Some(ConsoleFd::Borrowed(fd));
        }
    }
    None
}

/// Remembers and restores the active virtual console
#[derive(Debug, Default)]
pub struct ConsoleController {
    saved: Option<u16>,
}

impl ConsoleController {
    /// Create a controller with nothing saved
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of the currently active virtual console
    pub fn active_console(&self) -> Result<u16> {
        let fd = console_fd().ok_or_else(|| LaunchError::Console("no console device".into()))?;
        let mut stat = VtStat::default();
        xioctl(fd.raw(), VT_GETSTATE, (&mut stat as *mut VtStat).cast())
            .map_err(|e| LaunchError::Console(format!("VT_GETSTATE: {e}")))?;
        Ok(stat.v_active)
    }

    /// Capture the active console; last save wins
    pub fn save(&mut self) -> bool {
        match self.active_console() {
            Ok(vt) => {
                debug!("saved active console {}", vt);
                self.saved = Some(vt);
                true
            }
            Err(e) => {
                warn!("could not save active console: {}", e);
                false
            }
        }
    }

    /// Switch the active console and block until the switch completes
    pub fn set_active(&self, vt: u16) -> Result<()> {
        if vt < 1 || vt > MAX_CONSOLE {
            return Err(LaunchError::Console(format!(
                "console number {vt} out of range 1..={MAX_CONSOLE}"
            )));
        }
        let fd = console_fd().ok_or_else(|| LaunchError::Console("no console device".into()))?;
        xioctl(fd.raw(), VT_ACTIVATE, vt as usize as *mut libc::c_void)
            .map_err(|e| LaunchError::Console(format!("VT_ACTIVATE {vt}: {e}")))?;
        xioctl(fd.raw(), VT_WAITACTIVE, vt as usize as *mut libc::c_void)
            .map_err(|e| LaunchError::Console(format!("VT_WAITACTIVE {vt}: {e}")))?;
        Ok(())
    }

    /// Reactivate the previously saved console
    ///
    /// False when nothing was saved or the switch failed; restore runs during
    /// cleanup, so failure is reported, not raised.
    pub fn restore(&self) -> bool {
        let Some(vt) = self.saved else {
            debug!("no saved console to restore");
            return false;
        };
        match self.set_active(vt) {
            Ok(()) => true,
            Err(e) => {
                warn!("could not restore console {}: {}", vt, e);
                false
            }
        }
    }

    /// The saved console, if any
    pub fn saved(&self) -> Option<u16> {
        self.saved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restore_without_save_fails() {
        let console = ConsoleController::new();
        assert!(!console.restore());
    }

    #[test]
    fn test_set_active_rejects_out_of_range() {
        let console = ConsoleController::new();
        assert!(matches!(
            console.set_active(0),
            Err(LaunchError::Console(_))
        ));
        assert!(matches!(
            console.set_active(64),
            Err(LaunchError::Console(_))
        ));
    }

    #[test]
    fn test_last_save_wins() {
        let mut console = ConsoleController::new();
        console.saved = Some(2);
        console.saved = Some(7);
        assert_eq!(console.saved(), Some(7));
    }

    #[test]
    fn test_open_device_missing_path() {
        assert!(open_device("/dev/nonexistent-console-device").is_none());
    }
}
