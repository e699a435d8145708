//! Sink delivery for `deliver` requests: clipboard and file output.
//!
//! Both are best-effort side effects executed outside the broker's state
//! lock; failures map to the structured error reasons on the wire.

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::protocol::{ErrorReason, SinkKind};

pub async fn deliver(kind: SinkKind, path: Option<&str>, content: &[u8]) -> Result<(), ErrorReason> {
    match kind {
        SinkKind::Clipboard => clipboard(content).await,
        SinkKind::File => {
            let path = path.ok_or(ErrorReason::FileWriteFailed)?;
            file(path, content).await
        }
    }
}

/// Pipe the bytes into `xclip -selection clipboard`.
async fn clipboard(content: &[u8]) -> Result<(), ErrorReason> {
    let mut child = Command::new("xclip")
        .args(["-selection", "clipboard"])
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .map_err(|e| {
            tracing::warn!(error = %e, "xclip spawn failed");
            ErrorReason::ClipboardFailed
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(content)
            .await
            .map_err(|_| ErrorReason::ClipboardFailed)?;
        // Dropping stdin closes the pipe so xclip can exit.
    }

    let status = child
        .wait()
        .await
        .map_err(|_| ErrorReason::ClipboardFailed)?;
    if status.success() {
        Ok(())
    } else {
        tracing::warn!(?status, "xclip exited non-zero");
        Err(ErrorReason::ClipboardFailed)
    }
}

async fn file(path: &str, content: &[u8]) -> Result<(), ErrorReason> {
    tokio::fs::write(path, content).await.map_err(|e| {
        tracing::warn!(error = %e, path, "sink file write failed");
        ErrorReason::FileWriteFailed
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_sink_writes_exact_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("turn.bin");
        let content = b"raw \x1b[31mbytes\x1b[0m\n";

        deliver(SinkKind::File, path.to_str(), content)
            .await
            .unwrap();
        let written = tokio::fs::read(&path).await.unwrap();
        assert_eq!(written, content);
    }

    #[tokio::test]
    async fn file_sink_bad_path_fails() {
        let result = deliver(SinkKind::File, Some("/nonexistent/dir/turn.bin"), b"x").await;
        assert_eq!(result, Err(ErrorReason::FileWriteFailed));
    }

    #[tokio::test]
    async fn file_sink_without_path_fails() {
        let result = deliver(SinkKind::File, None, b"x").await;
        assert_eq!(result, Err(ErrorReason::FileWriteFailed));
    }
}
