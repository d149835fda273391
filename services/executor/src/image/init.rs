//! In-guest init binary lookup and injection.
//!
//! A small static init (tini, dumb-init) is copied from the host into the
//! rootfs so the guest gets zombie reaping and signal forwarding around the
//! container command.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Canonical locations probed after PATH.
const CANONICAL_DIRS: &[&str] = &["/usr/bin", "/sbin", "/usr/sbin"];

/// Find an init binary on the host.
pub fn locate_init_binary(name: &str) -> Option<PathBuf> {
    if let Ok(path) = which::which(name) {
        return Some(path);
    }
    CANONICAL_DIRS
        .iter()
        .map(|dir| Path::new(dir).join(name))
        .find(|candidate| candidate.is_file())
}

/// Copy an init binary to `/sbin/<name>` inside a mounted rootfs with mode
/// 0755. Returns the in-guest path.
pub fn inject_init(mount_root: &Path, name: &str, source: &Path) -> io::Result<PathBuf> {
    let sbin = mount_root.join("sbin");
    fs::create_dir_all(&sbin)?;

    let dest = sbin.join(name);
    fs::copy(source, &dest)?;
    fs::set_permissions(&dest, fs::Permissions::from_mode(0o755))?;

    debug!(
        source = %source.display(),
        dest = %dest.display(),
        "Init binary injected"
    );
    Ok(PathBuf::from("/sbin").join(name))
}

/// The in-guest path an injected init lives at.
pub fn guest_init_path(name: &str) -> PathBuf {
    PathBuf::from("/sbin").join(name)
}
