#![forbid(unsafe_code)]

//! Shared security helpers used by the tubelib binaries.

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Fails fast when a binary is started as root. The backend runs as an
/// unprivileged service account; guarding the binary itself keeps manual
/// invocations from silently reverting to insecure defaults.
pub fn ensure_not_root(process: &str) -> Result<()> {
    if Uid::current().is_root() {
        bail!("{process} must not be run as root; please use an unprivileged service account");
    }
    Ok(())
}
