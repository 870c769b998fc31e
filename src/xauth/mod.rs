//! X authority file resolution
//!
//! The server and client agree on where the authority cookies live through
//! the `XAUTHORITY` environment variable. This module picks the path (an
//! already-set variable always wins, then the configured override, then the
//! target user's home, then a temp directory), makes sure the file exists
//! with owner-only permissions, and exports the variable for the children.

use std::fs::OpenOptions;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::unistd::{self, Gid, Uid};
use tracing::{debug, warn};

use crate::error::{LaunchError, Result};
use crate::privileges::Identity;

/// Conventional authority file name inside a home directory
pub const AUTHORITY_FILE_NAME: &str = ".Xauthority";

/// Decide which authority file this session will use
///
/// An `XAUTHORITY` already present in the environment is respected as-is.
pub fn resolve(explicit: Option<&Path>, home: Option<&Path>) -> PathBuf {
    choose(
        std::env::var_os("XAUTHORITY").map(PathBuf::from),
        explicit,
        home,
        std::env::var_os("TMPDIR").map(PathBuf::from),
    )
}

fn choose(
    from_env: Option<PathBuf>,
    explicit: Option<&Path>,
    home: Option<&Path>,
    tmpdir: Option<PathBuf>,
) -> PathBuf {
    if let Some(path) = from_env {
        return path;
    }
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Some(home) = home {
        return home.join(AUTHORITY_FILE_NAME);
    }
    tmpdir
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(AUTHORITY_FILE_NAME)
}

/// Make sure the authority file exists, is private, and belongs to the
/// target user, then export `XAUTHORITY` for the children
///
/// Cookie contents are the server's business; an empty file is a valid
/// starting point.
pub fn establish(path: &Path, owner: Option<&Identity>) -> Result<PathBuf> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| {
            LaunchError::Config(format!("cannot create authority file {}: {e}", path.display()))
        })?;

    if let Err(e) = file.set_permissions(std::fs::Permissions::from_mode(0o600)) {
        warn!("cannot restrict authority file {}: {}", path.display(), e);
    }
    if let Some(identity) = owner {
        if let Err(e) = unistd::chown(
            path,
            Some(Uid::from_raw(identity.uid)),
            Some(Gid::from_raw(identity.gid)),
        ) {
            warn!("cannot chown authority file {}: {}", path.display(), e);
        }
    }

    debug!("authority file {}", path.display());
    std::env::set_var("XAUTHORITY", path);
    Ok(path.to_path_buf())
}
