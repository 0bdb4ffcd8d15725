//! # Transcription Module
//!
//! The transcription pipeline behind the streaming session manager:
//! external converter and speech-engine boundaries, plus the single-flight
//! scheduler that decides when either of them runs.
//!
//! ## Key Components:
//! - **Normalizer**: arbitrary container bytes → canonical mono/16 kHz WAV
//!   (ffmpeg subprocess behind a trait seam)
//! - **Engine**: canonical WAV → text (whisper.cpp CLI behind a trait seam)
//! - **Scheduler**: per-session single-flight discipline, trigger policy,
//!   partial/final aggregation, and failure containment
//!
//! Both external programs are black boxes; this module only owns the
//! contracts at their boundaries and the discipline around invoking them.

pub mod engine;      // Speech engine boundary and whisper.cpp CLI backend
pub mod normalizer;  // Audio format converter boundary
pub mod scheduler;   // Single-flight transcription scheduling

pub use engine::{SpeechEngine, TranscriptionEngine};
pub use normalizer::{AudioNormalizer, FfmpegNormalizer};
pub use scheduler::{TranscriptUpdate, TranscriptionScheduler};
