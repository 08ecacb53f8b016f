//! Per-session data directory under the system temp root.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;

use hc_spin_error::SpinError;

pub const DIR_PREFIX: &str = "hc-spin-";
pub const ABANDONED_MARKER: &str = ".abandoned";
pub const ABANDONED_TEXT: &str = "I'm not in use anymore by an active hc-spin process.";
const REMOVE_ATTEMPTS: usize = 4;
const REMOVE_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDir {
    path: PathBuf,
}

impl SessionDir {
    /// Creates `<root>/hc-spin-<8 random chars>`.
    pub async fn create_in(root: &Path) -> Result<Self, SpinError> {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        let path = root.join(format!("{DIR_PREFIX}{suffix}"));
        tokio::fs::create_dir_all(&path).await?;
        tracing::info!(path = %path.display(), "created session directory");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flags the directory for removal by the next launcher's startup sweep.
    pub async fn mark_abandoned(&self) -> Result<(), SpinError> {
        tokio::fs::write(self.path.join(ABANDONED_MARKER), ABANDONED_TEXT).await?;
        Ok(())
    }
}

/// Removes every `hc-spin-*` directory under `root` that carries the
/// abandonment marker. Returns how many were removed.
pub async fn sweep_abandoned(root: &Path) -> Result<usize, SpinError> {
    let mut removed = 0;
    let mut entries = tokio::fs::read_dir(root).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.starts_with(DIR_PREFIX) {
            continue;
        }
        let path = entry.path();
        if !tokio::fs::try_exists(path.join(ABANDONED_MARKER))
            .await
            .unwrap_or(false)
        {
            continue;
        }
        match remove_with_retries(&path).await {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "removed abandoned session directory");
                removed += 1;
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed to remove abandoned session directory");
            }
        }
    }
    Ok(removed)
}

async fn remove_with_retries(path: &Path) -> std::io::Result<()> {
    let mut attempt = 1;
    loop {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) if attempt >= REMOVE_ATTEMPTS => return Err(err),
            Err(_) => {
                attempt += 1;
                tokio::time::sleep(REMOVE_RETRY_DELAY).await;
            }
        }
    }
}
