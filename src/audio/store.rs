//! # Audio Segment Store
//!
//! Per-session scratch storage for incoming audio. Each session owns a
//! unique directory under the OS temp dir containing:
//!
//! - `raw.pcm`: an append-only file of canonical PCM samples (the
//!   continuous-buffer path)
//! - `segs/seg_NNNNNN.seg`: discrete containerized chunks in arrival order
//!   (the fallback segment path)
//!
//! ## Lifecycle:
//! Created when the session is created, reset on an explicit session start,
//! and torn down when the session is removed. Teardown is best-effort: a
//! deletion failure is logged and swallowed so cleanup can never take down
//! the connection teardown path.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};
use uuid::Uuid;

/// A discrete audio chunk persisted to the store, tagged with its sequence
/// number in arrival order.
#[derive(Debug, Clone)]
pub struct StoredSegment {
    /// Zero-based, strictly increasing within a session until reset
    pub seq: u64,

    /// Size of the chunk in bytes
    pub len: u64,

    /// Location of the chunk on disk
    pub path: PathBuf,
}

/// Scratch storage owned by a single session.
pub struct SegmentStore {
    root: PathBuf,
    seg_dir: PathBuf,
    raw_path: PathBuf,
    next_seq: AtomicU64,
}

impl SegmentStore {
    /// Allocate a fresh scratch directory for one session.
    pub fn create() -> std::io::Result<Self> {
        let root = std::env::temp_dir().join(format!("vc-ws-{}", Uuid::new_v4()));
        let seg_dir = root.join("segs");
        fs::create_dir_all(&seg_dir)?;

        let raw_path = root.join("raw.pcm");
        debug!(root = %root.display(), "allocated session scratch storage");

        Ok(Self {
            root,
            seg_dir,
            raw_path,
            next_seq: AtomicU64::new(0),
        })
    }

    /// Persist a discrete audio chunk under the next sequence number.
    pub fn write_segment(&self, data: &[u8]) -> std::io::Result<StoredSegment> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let path = self.seg_dir.join(format!("seg_{:06}.seg", seq));
        fs::write(&path, data)?;

        Ok(StoredSegment {
            seq,
            len: data.len() as u64,
            path,
        })
    }

    /// Append canonical PCM bytes to the raw buffer.
    ///
    /// ## Returns:
    /// The total size of the raw buffer after the append, so callers can
    /// apply the trigger-threshold policy without a second stat call.
    pub fn append_raw(&self, data: &[u8]) -> std::io::Result<u64> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.raw_path)?;
        file.write_all(data)?;
        Ok(file.metadata()?.len())
    }

    /// Current size of the raw buffer in bytes (0 if nothing was appended).
    pub fn raw_len(&self) -> u64 {
        fs::metadata(&self.raw_path).map(|m| m.len()).unwrap_or(0)
    }

    /// Whether any raw PCM has been accumulated. The raw buffer takes
    /// precedence over segments at finalization time.
    pub fn has_raw_audio(&self) -> bool {
        self.raw_len() > 0
    }

    pub fn raw_path(&self) -> &Path {
        &self.raw_path
    }

    /// All persisted segments in sequence-number order.
    pub fn segment_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = match fs::read_dir(&self.seg_dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().map_or(false, |ext| ext == "seg"))
                .collect(),
            Err(err) => {
                warn!(%err, "failed to list session segments");
                Vec::new()
            }
        };
        // Zero-padded names sort lexicographically in sequence order
        paths.sort();
        paths
    }

    /// Path for a transient pipeline artifact (converted WAVs and the like)
    /// inside this session's scratch directory.
    pub fn scratch_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Reset to the just-created state: sequence counter zeroed, segments
    /// deleted, raw buffer truncated. Best-effort, mirroring session start
    /// semantics where a stale leftover must never abort the new session.
    pub fn reset(&self) {
        self.next_seq.store(0, Ordering::SeqCst);

        for path in self.segment_paths() {
            if let Err(err) = fs::remove_file(&path) {
                warn!(path = %path.display(), %err, "failed to delete stale segment");
            }
        }

        if self.raw_path.exists() {
            if let Err(err) = fs::File::create(&self.raw_path) {
                warn!(%err, "failed to truncate raw PCM buffer");
            }
        }
    }

    /// Release all storage owned by this session. Failures are logged and
    /// swallowed; this is invoked from every exit path (normal end, error,
    /// disconnect) and must never raise.
    pub fn teardown(&self) {
        if !self.root.exists() {
            return;
        }
        match fs::remove_dir_all(&self.root) {
            Ok(()) => debug!(root = %self.root.display(), "released session scratch storage"),
            Err(err) => warn!(root = %self.root.display(), %err, "failed to release session scratch storage"),
        }
    }
}
