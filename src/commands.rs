use anyhow::{Context, Result};
use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;

/// Copies the running executable to `dest` and makes it executable for
/// everyone, so any image can run it from the shared volume.
pub async fn copy_self(dest: &Path) -> Result<()> {
    let source = std::env::current_exe().context("Failed to locate the running executable")?;
    info!("Copying {} to {}", source.display(), dest.display());

    tokio::fs::copy(&source, dest)
        .await
        .with_context(|| format!("Failed to copy binary to {}", dest.display()))?;
    tokio::fs::set_permissions(dest, Permissions::from_mode(0o777))
        .await
        .with_context(|| format!("Failed to make {} executable", dest.display()))?;
    Ok(())
}

/// Parks until SIGINT or SIGTERM is received.
pub async fn wait_for_termination() -> Result<()> {
    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for SIGINT")?,
        _ = terminate.recv() => {}
    }
    info!("Termination signal received");
    Ok(())
}
