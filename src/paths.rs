//! Runtime directory and socket path resolution.
//!
//! Everything lives under `$XDG_RUNTIME_DIR/clippy/`, mode 0700. When the
//! variable is unset the caller refuses to start; there is no fallback to a
//! world-writable location.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

pub const SOCKET_NAME: &str = "broker.sock";

/// The `clippy/` runtime directory path. Fails when `XDG_RUNTIME_DIR` is
/// unset or empty.
pub fn runtime_dir() -> Result<PathBuf> {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) if !dir.is_empty() => Ok(PathBuf::from(dir).join("clippy")),
        _ => bail!("XDG_RUNTIME_DIR is not set; refusing to guess a socket location"),
    }
}

/// Resolve the runtime directory, creating it with mode 0700 if absent.
pub fn ensure_runtime_dir() -> Result<PathBuf> {
    let dir = runtime_dir()?;
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create runtime dir {}", dir.display()))?;
    fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))
        .with_context(|| format!("failed to set permissions on {}", dir.display()))?;
    Ok(dir)
}

pub fn socket_path() -> Result<PathBuf> {
    Ok(runtime_dir()?.join(SOCKET_NAME))
}
