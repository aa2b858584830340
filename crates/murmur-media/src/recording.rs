//! Local recording of inbound stream audio.
//!
//! Every accepted voice connection may write its raw PCM to
//! `<dir>/streamed_<uuid>.pcm`. Recording is strictly best effort: a write
//! failure disables the sink for that stream and never reaches the session.

use std::path::{Path, PathBuf};

use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use murmur_core::config::Config;
use murmur_core::error::Result;

const FILE_PREFIX: &str = "streamed_";
const FILE_EXT: &str = "pcm";

/// What a finished recording left on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingSummary {
    pub path: PathBuf,
    pub bytes: u64,
    /// Audio past the size cap was dropped.
    pub truncated: bool,
}

#[derive(Debug)]
pub struct RecordingSink {
    path: PathBuf,
    file: Option<File>,
    written: u64,
    max_bytes: u64,
    truncated: bool,
}

impl RecordingSink {
    /// Open a sink when recording is enabled in config. Failures are logged
    /// and yield `None`.
    pub async fn from_config(config: &Config) -> Option<Self> {
        let recording = config.recording();
        if !recording.enabled {
            return None;
        }
        let dir = config.recording_dir();
        match Self::open(&dir, recording.max_bytes_per_stream, recording.max_files).await {
            Ok(sink) => Some(sink),
            Err(e) => {
                warn!(dir = %dir.display(), %e, "Recording disabled for this stream");
                None
            }
        }
    }

    /// Create a new recording file in `dir`, pruning old ones so at most
    /// `max_files` remain afterwards.
    pub async fn open(dir: &Path, max_bytes: u64, max_files: usize) -> Result<Self> {
        fs::create_dir_all(dir).await?;
        prune(dir, max_files.saturating_sub(1)).await;

        let path = dir.join(format!("{FILE_PREFIX}{}.{FILE_EXT}", uuid::Uuid::new_v4()));
        let file = File::create(&path).await?;
        debug!(path = %path.display(), "Recording started");
        Ok(Self {
            path,
            file: Some(file),
            written: 0,
            max_bytes,
            truncated: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub fn is_active(&self) -> bool {
        self.file.is_some()
    }

    /// Append audio, dropping whatever exceeds the size cap.
    pub async fn write(&mut self, audio: &[u8]) {
        let Some(file) = self.file.as_mut() else {
            return;
        };

        let room = self.max_bytes.saturating_sub(self.written);
        let take = (audio.len() as u64).min(room) as usize;
        if take < audio.len() && !self.truncated {
            self.truncated = true;
            warn!(
                path = %self.path.display(),
                max_bytes = self.max_bytes,
                "Recording size cap reached, dropping further audio"
            );
        }
        if take == 0 {
            return;
        }

        match file.write_all(&audio[..take]).await {
            Ok(()) => self.written += take as u64,
            Err(e) => {
                warn!(path = %self.path.display(), %e, "Recording write failed, disabling");
                self.file = None;
            }
        }
    }

    /// Flush and close the file.
    pub async fn finish(mut self) -> RecordingSummary {
        if let Some(mut file) = self.file.take() {
            if let Err(e) = file.flush().await {
                warn!(path = %self.path.display(), %e, "Recording flush failed");
            }
        }
        info!(path = %self.path.display(), bytes = self.written, truncated = self.truncated, "Recording finished");
        RecordingSummary {
            path: self.path,
            bytes: self.written,
            truncated: self.truncated,
        }
    }
}

/// Delete the oldest recordings so that at most `keep` remain.
async fn prune(dir: &Path, keep: usize) {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), %e, "Cannot list recordings");
            return;
        }
    };

    let mut recordings = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if !is_recording(&path) {
            continue;
        }
        let modified = match entry.metadata().await.and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(_) => continue,
        };
        recordings.push((modified, path));
    }
    if recordings.len() <= keep {
        return;
    }

    recordings.sort();
    let excess = recordings.len() - keep;
    for (_, path) in recordings.into_iter().take(excess) {
        match fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "Pruned old recording"),
            Err(e) => warn!(path = %path.display(), %e, "Failed to prune recording"),
        }
    }
}

fn is_recording(path: &Path) -> bool {
    let name_ok = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(FILE_PREFIX));
    name_ok && path.extension().and_then(|e| e.to_str()) == Some(FILE_EXT)
}
