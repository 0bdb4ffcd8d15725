//! # Single-Flight Transcription Scheduler
//!
//! Decides when and what to transcribe for a session, and guarantees that
//! at most one normalize+transcribe pipeline runs per session at any time.
//!
//! ## Trigger policy:
//! - A discrete segment triggers when it is larger than the configured
//!   segment threshold (segment-append aggregation).
//! - The raw PCM buffer triggers when its accumulated size crosses the raw
//!   threshold (buffer-replace aggregation: the whole buffer is
//!   re-transcribed and the result supersedes the transcript).
//! - An overlapping trigger is silently dropped while a pipeline is in
//!   flight; the untranscribed tail is naturally covered by the next
//!   trigger or by finalization, so only latency is lost, never audio.
//!
//! ## Failure containment:
//! Nothing raised by the converter or the engine escapes this module. A
//! partial-pass engine failure is logged and produces no notification; a
//! converter failure and an uninitialized engine produce a diagnostic
//! placeholder so the user is not left guessing; finalization failures
//! produce a diagnostic rather than a protocol error.

use crate::audio::pcm;
use crate::audio::session::{AggregationMode, CoachSession};
use crate::audio::store::StoredSegment;
use crate::config::AppConfig;
use crate::transcription::engine::TranscriptionEngine;
use crate::transcription::normalizer::AudioNormalizer;
use anyhow::bail;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Confidence reported with partial transcription updates.
pub const PARTIAL_CONFIDENCE: f32 = 0.7;

/// Confidence reported with a non-empty final transcript.
pub const FINAL_CONFIDENCE: f32 = 0.75;

/// Placeholder emitted when the converter rejects a segment.
pub const CONVERSION_FAILED_TEXT: &str = "[Transcriber error: audio conversion failed]";

/// Placeholder emitted (once per session) when the engine is unavailable.
pub const ENGINE_UNAVAILABLE_TEXT: &str = "[Transcriber error: speech engine not initialized]";

const FLIGHT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// A transcription result ready to be sent to the client.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptUpdate {
    pub text: String,
    pub confidence: f32,
    pub partial: bool,
}

impl TranscriptUpdate {
    fn partial(text: String) -> Self {
        Self {
            text,
            confidence: PARTIAL_CONFIDENCE,
            partial: true,
        }
    }

    fn diagnostic(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            confidence: 0.0,
            partial: false,
        }
    }
}

/// RAII ownership of a session's single-flight flag. The flag is released
/// on drop, so every exit path of a pipeline — including panics inside a
/// spawned task — clears it.
struct FlightGuard {
    session: Arc<CoachSession>,
}

impl FlightGuard {
    fn acquire(session: &Arc<CoachSession>) -> Option<Self> {
        session.try_set_transcribing().then(|| Self {
            session: session.clone(),
        })
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.session.clear_transcribing();
    }
}

/// Per-process scheduler shared by all sessions. Sessions carry their own
/// single-flight flags; the scheduler carries the pipeline and the policy.
pub struct TranscriptionScheduler {
    normalizer: Arc<dyn AudioNormalizer>,
    engine: Arc<TranscriptionEngine>,
    segment_trigger_bytes: u64,
    raw_trigger_bytes: u64,
    sample_rate: u32,
    finalize_wait: Duration,
}

impl TranscriptionScheduler {
    pub fn new(
        normalizer: Arc<dyn AudioNormalizer>,
        engine: Arc<TranscriptionEngine>,
        config: &AppConfig,
    ) -> Self {
        Self {
            normalizer,
            engine,
            segment_trigger_bytes: config.audio.segment_trigger_bytes,
            raw_trigger_bytes: config.audio.raw_trigger_bytes,
            sample_rate: config.audio.sample_rate,
            finalize_wait: Duration::from_millis(config.stt.finalize_wait_ms),
        }
    }

    /// Maybe transcribe a freshly buffered discrete segment
    /// (segment-append aggregation).
    ///
    /// Returns `None` when the segment is below the trigger threshold, the
    /// session is latched to the other aggregation mode, another pipeline
    /// is in flight, or the engine produced nothing.
    pub async fn on_segment(
        &self,
        session: &Arc<CoachSession>,
        segment: &StoredSegment,
    ) -> Option<TranscriptUpdate> {
        if segment.len <= self.segment_trigger_bytes {
            return None;
        }

        if session.lock_mode(AggregationMode::SegmentAppend) != AggregationMode::SegmentAppend {
            debug!(
                connection_id = %session.connection_id,
                seq = segment.seq,
                "segment buffered only; session is in buffer-replace mode"
            );
            return None;
        }

        if !self.engine.is_ready().await {
            return self.engine_fault(session);
        }

        let _guard = FlightGuard::acquire(session)?;

        let wav = session.store.scratch_path("seg.wav");
        if let Err(err) = self.normalizer.normalize(&segment.path, &wav).await {
            warn!(
                connection_id = %session.connection_id,
                seq = segment.seq,
                %err,
                "segment conversion failed"
            );
            return Some(TranscriptUpdate::diagnostic(CONVERSION_FAILED_TEXT));
        }

        let text = match self.engine.transcribe_file(&wav).await {
            Ok(text) => text,
            Err(err) => {
                warn!(
                    connection_id = %session.connection_id,
                    seq = segment.seq,
                    %err,
                    "segment transcription failed"
                );
                return None;
            }
        };

        if text.is_empty() {
            return None;
        }

        let full = session.append_transcript(&text);
        Some(TranscriptUpdate::partial(full))
    }

    /// Maybe re-transcribe the whole raw PCM buffer after it grew
    /// (buffer-replace aggregation).
    pub async fn on_raw_growth(&self, session: &Arc<CoachSession>) -> Option<TranscriptUpdate> {
        if session.store.raw_len() <= self.raw_trigger_bytes {
            return None;
        }

        if session.lock_mode(AggregationMode::BufferReplace) != AggregationMode::BufferReplace {
            return None;
        }

        if !self.engine.is_ready().await {
            return self.engine_fault(session);
        }

        let _guard = FlightGuard::acquire(session)?;

        let wav = session.store.scratch_path("partial.wav");
        if let Err(err) = pcm::wrap_raw_as_wav(session.store.raw_path(), &wav, self.sample_rate) {
            warn!(connection_id = %session.connection_id, %err, "failed to package raw buffer");
            return None;
        }

        let text = match self.engine.transcribe_file(&wav).await {
            Ok(text) => text,
            Err(err) => {
                warn!(
                    connection_id = %session.connection_id,
                    %err,
                    "partial transcription failed"
                );
                return None;
            }
        };

        if text.is_empty() {
            return None;
        }

        session.replace_transcript(&text);
        Some(TranscriptUpdate::partial(text))
    }

    /// Terminal transcription pass over the complete buffered audio. Always
    /// runs, and always yields an update: the authoritative transcript, an
    /// empty transcript when no audio was received, or a diagnostic when
    /// the pipeline failed.
    ///
    /// Waits (bounded) for an in-flight partial pass to release the flag so
    /// it never reads a buffer mid-mutation; on timeout it proceeds with
    /// whatever is flushed rather than hanging connection teardown on a
    /// wedged pipeline.
    pub async fn finalize(&self, session: &Arc<CoachSession>) -> TranscriptUpdate {
        session.end();

        let _guard = self.wait_for_flight(session).await;

        match self.transcribe_everything(session).await {
            Ok(text) => {
                session.replace_transcript(&text);
                let confidence = if text.is_empty() { 0.0 } else { FINAL_CONFIDENCE };
                TranscriptUpdate {
                    text,
                    confidence,
                    partial: false,
                }
            }
            Err(err) => {
                warn!(connection_id = %session.connection_id, %err, "final transcription failed");
                TranscriptUpdate::diagnostic(format!("[Transcription failed: {}]", err))
            }
        }
    }

    /// Poll for the single-flight flag until it is free or the configured
    /// wait elapses. `None` means finalization proceeds degraded.
    async fn wait_for_flight(&self, session: &Arc<CoachSession>) -> Option<FlightGuard> {
        let deadline = tokio::time::Instant::now() + self.finalize_wait;
        loop {
            if let Some(guard) = FlightGuard::acquire(session) {
                return Some(guard);
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    connection_id = %session.connection_id,
                    "in-flight transcription did not finish in time; finalizing with current buffers"
                );
                return None;
            }
            tokio::time::sleep(FLIGHT_POLL_INTERVAL).await;
        }
    }

    /// Transcribe the session's complete audio: the raw buffer when it is
    /// non-empty, otherwise each stored segment in sequence order with the
    /// results joined by spaces. Per-segment failures are logged and
    /// skipped so one bad chunk cannot sink the whole transcript.
    async fn transcribe_everything(&self, session: &Arc<CoachSession>) -> anyhow::Result<String> {
        let store = &session.store;

        if store.has_raw_audio() {
            if !self.engine.is_ready().await {
                bail!("speech engine not initialized");
            }
            let wav = store.scratch_path("final.wav");
            pcm::wrap_raw_as_wav(store.raw_path(), &wav, self.sample_rate)?;
            return self.engine.transcribe_file(&wav).await;
        }

        let segments = store.segment_paths();
        if segments.is_empty() {
            return Ok(String::new());
        }

        if !self.engine.is_ready().await {
            bail!("speech engine not initialized");
        }

        let mut parts = Vec::new();
        for (idx, segment) in segments.iter().enumerate() {
            let wav = store.scratch_path("final_seg.wav");
            if let Err(err) = self.normalizer.normalize(segment, &wav).await {
                warn!(segment = idx, %err, "segment conversion failed during finalization");
                continue;
            }
            match self.engine.transcribe_file(&wav).await {
                Ok(text) if !text.is_empty() => parts.push(text),
                Ok(_) => {}
                Err(err) => {
                    warn!(segment = idx, %err, "segment transcription failed during finalization");
                }
            }
        }

        Ok(parts.join(" "))
    }

    /// One diagnostic per session when the engine is unavailable, silence
    /// afterwards.
    fn engine_fault(&self, session: &Arc<CoachSession>) -> Option<TranscriptUpdate> {
        if session.note_engine_fault() {
            warn!(
                connection_id = %session.connection_id,
                "transcription requested but speech engine is not initialized"
            );
            Some(TranscriptUpdate::diagnostic(ENGINE_UNAVAILABLE_TEXT))
        } else {
            None
        }
    }
}
