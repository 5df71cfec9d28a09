//! Artifact watcher.
//!
//! The assistant runtime drops produced files into a shared output
//! directory. During a turn, newly appearing files are announced to the
//! output stream as a notification chunk with a download path. Watch events
//! alone are not trusted for timing (a change notification can land before
//! the file is fully written), so the watcher combines an event-driven
//! wakeup with bounded polls and a settle delay, plus one final poll at
//! completion time.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, warn};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

/// Route prefix under which the delivery layer serves artifact downloads.
pub const DOWNLOAD_ROUTE: &str = "/download";

/// A file discovered in the output directory during a turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactNotice {
    pub filename: String,
    pub size: u64,
}

impl ArtifactNotice {
    /// Render the notification chunk injected into the output stream. The
    /// filename is url-escaped as a single path segment under the fixed
    /// download route.
    pub fn chunk(&self) -> String {
        format!(
            "\nNew file: {} ({} bytes). Download: {}/{}\n",
            self.filename,
            self.size,
            DOWNLOAD_ROUTE,
            urlencoding::encode(&self.filename)
        )
    }
}

/// Turn-scoped watcher over the shared output directory.
///
/// Files listed when the watcher starts form the pre-existing set and are
/// never announced, even if modified later. Each new filename is announced
/// at most once.
pub struct ArtifactWatcher {
    dir: PathBuf,
    settle: Duration,
    seen: HashSet<String>,
    wakeup_rx: mpsc::UnboundedReceiver<()>,
    // Kept alive for the duration of the turn; dropping it stops the watch.
    _watcher: Option<RecommendedWatcher>,
}

impl ArtifactWatcher {
    /// Snapshot the directory and begin watching it (non-recursive).
    ///
    /// Watch registration failure is not fatal: polling still runs at
    /// completion time, so artifacts are announced late rather than lost.
    pub async fn start(dir: &Path, settle: Duration) -> Result<Self> {
        let seen: HashSet<String> = list_files(dir)
            .await
            .with_context(|| format!("listing artifact directory {}", dir.display()))?
            .into_iter()
            .map(|(name, _)| name)
            .collect();

        let (wakeup_tx, wakeup_rx) = mpsc::unbounded_channel();
        let watcher = match spawn_watcher(dir, wakeup_tx) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!(
                    "artifact watch on {} unavailable, falling back to completion-time poll: {:?}",
                    dir.display(),
                    e
                );
                None
            }
        };

        Ok(Self {
            dir: dir.to_path_buf(),
            settle,
            seen,
            wakeup_rx,
            _watcher: watcher,
        })
    }

    /// Wait for the next change notification. Pends forever when no watch
    /// could be registered, leaving the turn driver to rely on its other
    /// select arms.
    pub async fn changed(&mut self) {
        if self.wakeup_rx.recv().await.is_none() {
            std::future::pending::<()>().await;
        }
    }

    /// One bounded poll: list the directory, announce files not yet seen.
    ///
    /// A candidate is confirmed only after the settle delay and a fresh stat
    /// showing it non-empty; an empty file stays a candidate for later
    /// polls.
    pub async fn poll_new(&mut self) -> Vec<ArtifactNotice> {
        let listing = match list_files(&self.dir).await {
            Ok(listing) => listing,
            Err(e) => {
                debug!("artifact poll failed on {}: {:?}", self.dir.display(), e);
                return Vec::new();
            }
        };

        let mut notices = Vec::new();
        for (name, _) in listing {
            if self.seen.contains(&name) {
                continue;
            }
            if !self.settle.is_zero() {
                tokio::time::sleep(self.settle).await;
            }
            match tokio::fs::metadata(self.dir.join(&name)).await {
                Ok(meta) if meta.len() > 0 => {
                    self.seen.insert(name.clone());
                    notices.push(ArtifactNotice {
                        filename: name,
                        size: meta.len(),
                    });
                }
                // Still empty or gone again: leave it for a later poll.
                _ => {}
            }
        }
        notices
    }
}

fn spawn_watcher(dir: &Path, wakeup_tx: mpsc::UnboundedSender<()>) -> Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        match res {
            // Coalescing is fine: a wakeup only triggers a poll.
            Ok(_) => {
                let _ = wakeup_tx.send(());
            }
            Err(e) => debug!("artifact watch error: {:?}", e),
        }
    })
    .context("creating artifact watcher")?;
    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .context("registering artifact watch")?;
    Ok(watcher)
}

/// List plain files (name, size) in a single directory. Never recursive.
async fn list_files(dir: &Path) -> Result<Vec<(String, u64)>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("reading {}", dir.display()))?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let meta = match entry.metadata().await {
            Ok(meta) => meta,
            Err(_) => continue,
        };
        if !meta.is_file() {
            continue;
        }
        if let Ok(name) = entry.file_name().into_string() {
            files.push((name, meta.len()));
        }
    }
    Ok(files)
}
