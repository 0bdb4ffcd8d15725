//! # Session State and Registry
//!
//! Manages the lifecycle of streaming transcription sessions. One session
//! exists per WebSocket connection, keyed by a stable server-generated
//! connection id rather than by the transport handle itself.
//!
//! ## Session Lifecycle:
//! 1. **Idle**: created lazily, no audio received yet
//! 2. **Active**: receiving audio, partial transcriptions may trigger
//! 3. **Ended**: finalized, awaiting teardown
//!
//! ## Thread Safety:
//! Sessions are shared between the connection actor and spawned pipeline
//! tasks via `Arc`. The `transcribing` flag is the single-flight primitive
//! that keeps at most one normalize+transcribe pipeline running per session;
//! the accumulated transcript is only ever mutated by the pipeline that
//! holds it.

use crate::audio::store::SegmentStore;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info};

/// Current status of a streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Session exists but has not received audio
    Idle,
    /// Actively receiving audio and accepting transcription triggers
    Active,
    /// Finalized; nothing should trigger after this
    Ended,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Active => "active",
            SessionStatus::Ended => "ended",
        }
    }
}

/// How partial transcription results are folded into the accumulated
/// transcript. Determined by which message type the client sends first and
/// latched until an explicit reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationMode {
    /// Discrete per-chunk transcription; each result is concatenated onto
    /// the transcript with a single separating space
    SegmentAppend,
    /// The whole raw buffer is re-transcribed on each trigger; each result
    /// replaces the transcript wholesale
    BufferReplace,
}

/// A single streaming transcription session.
pub struct CoachSession {
    /// Stable identity bound to the connection (owned by the registry)
    pub connection_id: String,

    /// When the session was created
    pub created_at: DateTime<Utc>,

    /// Scratch storage for raw PCM and discrete segments
    pub store: SegmentStore,

    status: RwLock<SessionStatus>,

    /// Best current aggregate transcript; mutated only by a completed
    /// transcription pipeline
    transcript: Mutex<String>,

    /// Partial-trigger aggregation mode, latched by the first audio message
    mode: Mutex<Option<AggregationMode>>,

    /// Single-flight flag: true while a pipeline owns this session's buffers
    transcribing: AtomicBool,

    /// Latch so "engine unavailable" is reported to the client at most once
    engine_fault_reported: AtomicBool,
}

impl CoachSession {
    /// Create a session with empty buffers. Allocates scratch storage.
    pub fn new(connection_id: String) -> std::io::Result<Self> {
        Ok(Self {
            connection_id,
            created_at: Utc::now(),
            store: SegmentStore::create()?,
            status: RwLock::new(SessionStatus::Idle),
            transcript: Mutex::new(String::new()),
            mode: Mutex::new(None),
            transcribing: AtomicBool::new(false),
            engine_fault_reported: AtomicBool::new(false),
        })
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.read().unwrap()
    }

    /// Explicit session start: buffers truncated, counters zeroed,
    /// transcript cleared, aggregation mode unlatched.
    pub fn begin(&self) {
        self.store.reset();
        self.transcript.lock().unwrap().clear();
        *self.mode.lock().unwrap() = None;
        self.engine_fault_reported.store(false, Ordering::SeqCst);
        *self.status.write().unwrap() = SessionStatus::Active;
        debug!(connection_id = %self.connection_id, "session reset and activated");
    }

    /// Implicit activation when audio arrives without an explicit start.
    pub fn mark_active(&self) {
        let mut status = self.status.write().unwrap();
        if *status == SessionStatus::Idle {
            *status = SessionStatus::Active;
        }
    }

    pub fn end(&self) {
        *self.status.write().unwrap() = SessionStatus::Ended;
    }

    /// Snapshot of the accumulated transcript.
    pub fn transcript(&self) -> String {
        self.transcript.lock().unwrap().clone()
    }

    /// Segment-append aggregation: concatenate with a single space.
    /// Returns the full transcript after the append.
    pub fn append_transcript(&self, text: &str) -> String {
        let mut transcript = self.transcript.lock().unwrap();
        if transcript.is_empty() {
            transcript.push_str(text);
        } else {
            transcript.push(' ');
            transcript.push_str(text);
        }
        transcript.clone()
    }

    /// Buffer-replace aggregation: the result supersedes the transcript.
    pub fn replace_transcript(&self, text: &str) {
        *self.transcript.lock().unwrap() = text.to_string();
    }

    /// Latch the aggregation mode on first use and return the active mode.
    /// Later calls with the other mode observe the latched one, which keeps
    /// a connection from switching policies mid-session.
    pub fn lock_mode(&self, requested: AggregationMode) -> AggregationMode {
        *self.mode.lock().unwrap().get_or_insert(requested)
    }

    pub fn mode(&self) -> Option<AggregationMode> {
        *self.mode.lock().unwrap()
    }

    pub fn is_transcribing(&self) -> bool {
        self.transcribing.load(Ordering::Acquire)
    }

    /// Attempt to claim the single-flight flag. Returns true on success;
    /// the caller owns the flag and must release it on every exit path.
    pub(crate) fn try_set_transcribing(&self) -> bool {
        self.transcribing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn clear_transcribing(&self) {
        self.transcribing.store(false, Ordering::Release);
    }

    /// Record that the engine was found unavailable. Returns true only the
    /// first time so the diagnostic is emitted once per session.
    pub fn note_engine_fault(&self) -> bool {
        !self.engine_fault_reported.swap(true, Ordering::SeqCst)
    }
}

/// Maps connection identities to their sessions and owns creation/teardown.
///
/// ## Resource Management:
/// - Creation is exclusive per identity: the map's write lock is held across
///   the whole create-and-insert, so two racing calls for the same id can
///   never produce two live sessions.
/// - Removal releases the session's scratch storage best-effort.
/// - Enforces a maximum concurrent session count.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<CoachSession>>>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
        }
    }

    /// Return the existing session for this identity or create one with
    /// empty buffers. Idempotent.
    pub fn ensure(&self, connection_id: &str) -> Result<Arc<CoachSession>, String> {
        let mut sessions = self.sessions.write().unwrap();

        if let Some(session) = sessions.get(connection_id) {
            return Ok(session.clone());
        }

        if sessions.len() >= self.max_sessions {
            return Err(format!(
                "maximum concurrent sessions ({}) reached",
                self.max_sessions
            ));
        }

        let session = CoachSession::new(connection_id.to_string())
            .map_err(|err| format!("failed to allocate session storage: {}", err))?;
        let session = Arc::new(session);
        sessions.insert(connection_id.to_string(), session.clone());

        info!(connection_id, "created streaming session");
        Ok(session)
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<CoachSession>> {
        self.sessions.read().unwrap().get(connection_id).cloned()
    }

    /// Remove the session and release its storage. Returns whether a
    /// session existed. Cleanup failures are logged inside the store and
    /// never propagate: partial cleanup must not crash connection teardown.
    pub fn remove(&self, connection_id: &str) -> bool {
        let removed = self.sessions.write().unwrap().remove(connection_id);
        match removed {
            Some(session) => {
                session.store.teardown();
                info!(connection_id, "removed streaming session");
                true
            }
            None => false,
        }
    }

    pub fn active_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> CoachSession {
        CoachSession::new("test-conn".to_string()).unwrap()
    }

    #[test]
    fn test_status_transitions() {
        let s = session();
        assert_eq!(s.status(), SessionStatus::Idle);
        assert_eq!(s.status().as_str(), "idle");

        s.mark_active();
        assert_eq!(s.status(), SessionStatus::Active);
        assert_eq!(s.status().as_str(), "active");

        s.end();
        assert_eq!(s.status(), SessionStatus::Ended);
        assert_eq!(s.status().as_str(), "ended");
        // Implicit activation never resurrects an ended session
        s.mark_active();
        assert_eq!(s.status(), SessionStatus::Ended);

        s.store.teardown();
    }

    #[test]
    fn test_append_aggregation_joins_with_single_space() {
        let s = session();
        assert_eq!(s.append_transcript("foo"), "foo");
        assert_eq!(s.append_transcript("bar"), "foo bar");
        assert_eq!(s.transcript(), "foo bar");
        s.store.teardown();
    }

    #[test]
    fn test_replace_aggregation_supersedes() {
        let s = session();
        s.replace_transcript("hello");
        s.replace_transcript("hello world");
        assert_eq!(s.transcript(), "hello world");
        s.store.teardown();
    }

    #[test]
    fn test_begin_resets_session() {
        let s = session();
        s.store.write_segment(b"chunk").unwrap();
        s.append_transcript("stale text");
        s.lock_mode(AggregationMode::SegmentAppend);
        assert!(s.note_engine_fault());

        s.begin();

        assert_eq!(s.status(), SessionStatus::Active);
        assert_eq!(s.transcript(), "");
        assert_eq!(s.mode(), None);
        assert!(s.store.segment_paths().is_empty());
        // Sequence numbers and the fault latch start over
        assert_eq!(s.store.write_segment(b"chunk").unwrap().seq, 0);
        assert!(s.note_engine_fault());

        s.store.teardown();
    }

    #[test]
    fn test_mode_latches_on_first_use() {
        let s = session();
        assert_eq!(
            s.lock_mode(AggregationMode::BufferReplace),
            AggregationMode::BufferReplace
        );
        // The other mode cannot take over mid-session
        assert_eq!(
            s.lock_mode(AggregationMode::SegmentAppend),
            AggregationMode::BufferReplace
        );
        s.store.teardown();
    }

    #[test]
    fn test_single_flight_flag_is_exclusive() {
        let s = session();
        assert!(s.try_set_transcribing());
        assert!(!s.try_set_transcribing());
        s.clear_transcribing();
        assert!(s.try_set_transcribing());
        s.store.teardown();
    }

    #[test]
    fn test_engine_fault_reported_once() {
        let s = session();
        assert!(s.note_engine_fault());
        assert!(!s.note_engine_fault());
        s.store.teardown();
    }

    #[test]
    fn test_registry_ensure_is_idempotent() {
        let registry = SessionRegistry::new(4);
        let a = registry.ensure("conn-1").unwrap();
        let b = registry.ensure("conn-1").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.active_count(), 1);
        registry.remove("conn-1");
    }

    #[test]
    fn test_registry_exclusive_creation_under_races() {
        let registry = Arc::new(SessionRegistry::new(16));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(std::thread::spawn(move || {
                registry.ensure("conn-race").unwrap()
            }));
        }
        let sessions: Vec<Arc<CoachSession>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        // Rapid reconnect to the same identity never yields two live sessions
        assert_eq!(registry.active_count(), 1);
        for s in &sessions[1..] {
            assert!(Arc::ptr_eq(&sessions[0], s));
        }
        registry.remove("conn-race");
    }

    #[test]
    fn test_registry_remove_releases_storage() {
        let registry = SessionRegistry::new(4);
        let session = registry.ensure("conn-2").unwrap();
        let root = session.store.scratch_path("");

        assert!(registry.remove("conn-2"));
        assert!(!root.exists());
        assert!(registry.get("conn-2").is_none());
        assert!(!registry.remove("conn-2"));
        assert_eq!(registry.active_count(), 0);

        // A fresh session for the same identity is a distinct one
        let fresh = registry.ensure("conn-2").unwrap();
        assert!(!Arc::ptr_eq(&session, &fresh));
        registry.remove("conn-2");
    }

    #[test]
    fn test_registry_enforces_session_limit() {
        let registry = SessionRegistry::new(1);
        registry.ensure("conn-a").unwrap();
        assert!(registry.ensure("conn-b").is_err());
        // Existing identities still resolve at the limit
        assert!(registry.ensure("conn-a").is_ok());
        registry.remove("conn-a");
    }
}
