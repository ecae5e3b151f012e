//! Staged preview payloads and their release.
//!
//! Each payload is a file under the staging directory named after the group
//! and request that staged it, so concurrent groups never share a path.
//! `ResourceJanitor::release` removes the file exactly once; dropping an
//! unreleased payload removes it too.

use futures_util::{Stream, StreamExt};
use preview_proto::protocol::{AudioSource, GroupId, RequestId};
use std::fmt;
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

use crate::error::FetchError;

/// Prefix shared by every staged file; the startup sweep keys on it.
pub const STAGED_PREFIX: &str = "preview-";

const WRITE_BUFFER: usize = 64 * 1024;

/// Storage key of one staged payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StagingKey {
    pub group_id: GroupId,
    pub request_id: RequestId,
}

impl fmt::Display for StagingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.group_id, self.request_id)
    }
}

/// A fully written preview on disk.
pub struct PreviewPayload {
    key: StagingKey,
    path: PathBuf,
    len: u64,
    staged: Option<TempPath>,
}

impl PreviewPayload {
    pub fn key(&self) -> StagingKey {
        self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_released(&self) -> bool {
        self.staged.is_none()
    }

    /// What the transport reads.  `None` once the payload has been released.
    pub fn audio_source(&self, title: &str) -> Option<AudioSource> {
        self.staged.as_ref()?;
        Some(AudioSource {
            request_id: self.key.request_id,
            path: self.path.clone(),
            title: title.to_string(),
        })
    }
}

impl fmt::Debug for PreviewPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreviewPayload")
            .field("key", &self.key)
            .field("path", &self.path)
            .field("len", &self.len)
            .field("released", &self.is_released())
            .finish()
    }
}

/// Outcome of a `release` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    Removed,
    AlreadyReleased,
}

pub struct ResourceJanitor;

impl ResourceJanitor {
    /// Remove the staged file behind `payload`.  Safe to call from any exit
    /// path, any number of times: only the first call touches the disk.
    pub fn release(payload: &mut PreviewPayload) -> Release {
        let Some(staged) = payload.staged.take() else {
            debug!("Janitor: {} already released", payload.key);
            return Release::AlreadyReleased;
        };
        match staged.close() {
            Ok(()) => debug!("Janitor: removed {}", payload.path.display()),
            // The file is gone either way; nothing left to retry.
            Err(e) => warn!(
                "Janitor: failed to remove {}: {}",
                payload.path.display(),
                e
            ),
        }
        Release::Removed
    }

    /// Delete staged files left behind by a previous process.  Run before any
    /// session exists.
    pub async fn sweep_stale(area: &StagingArea) -> std::io::Result<usize> {
        let mut removed = 0usize;
        let mut entries = match tokio::fs::read_dir(area.dir()).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_staged = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(STAGED_PREFIX));
            if !is_staged || !entry.file_type().await?.is_file() {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Janitor: could not sweep {}: {}", path.display(), e),
            }
        }

        if removed > 0 {
            info!("Janitor: swept {} stale payload(s) from {}", removed, area.dir().display());
        }
        Ok(removed)
    }
}

/// Directory where previews are materialized before playback.
#[derive(Debug, Clone)]
pub struct StagingArea {
    dir: PathBuf,
}

impl StagingArea {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the directory and sweep leftovers.
    pub async fn prepare(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        ResourceJanitor::sweep_stale(self).await?;
        Ok(())
    }

    /// Write `stream` to a fresh file for `key`.  Resolves only after every
    /// byte is flushed and synced; on any error the partial file is removed
    /// before returning.
    pub async fn stage_stream<S, B, E>(
        &self,
        key: StagingKey,
        stream: S,
        max_bytes: u64,
    ) -> Result<PreviewPayload, FetchError>
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: Into<FetchError>,
    {
        let named = tempfile::Builder::new()
            .prefix(&format!("{}{}-", STAGED_PREFIX, key))
            .suffix(".mp3")
            .tempfile_in(&self.dir)?;
        // Dropping `staged` deletes the file, so every early return below
        // discards the partial write.
        let (file, staged) = named.into_parts();
        let path = staged.to_path_buf();

        let mut stream = std::pin::pin!(stream);
        let mut writer = BufWriter::with_capacity(WRITE_BUFFER, tokio::fs::File::from_std(file));
        let mut len = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(Into::into)?;
            let bytes = chunk.as_ref();
            len += bytes.len() as u64;
            if len > max_bytes {
                return Err(FetchError::TooLarge { limit: max_bytes });
            }
            writer.write_all(bytes).await?;
        }
        writer.flush().await?;
        writer.into_inner().sync_all().await?;

        debug!("Staging: committed {} bytes to {}", len, path.display());
        Ok(PreviewPayload {
            key,
            path,
            len,
            staged: Some(staged),
        })
    }

    pub async fn stage_bytes(
        &self,
        key: StagingKey,
        bytes: &[u8],
    ) -> Result<PreviewPayload, FetchError> {
        let chunks = futures_util::stream::iter([Ok::<_, FetchError>(bytes)]);
        self.stage_stream(key, chunks, u64::MAX).await
    }
}
