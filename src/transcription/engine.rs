//! # Transcription Engine
//!
//! Boundary to the external speech-to-text engine. The engine is a black
//! box: canonical WAV in, best-effort text out, or a failure. A failure is
//! never conflated with "no speech detected" — silence yields an empty
//! string from a healthy engine.
//!
//! ## Availability:
//! The engine may legitimately be absent (binary or model not installed).
//! The backend starts anyway; any transcription attempt while the engine is
//! unavailable fails with a distinct error the scheduler reports to the
//! client once per session.

use crate::config::SttConfig;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::info;

/// Black-box speech-to-text backend: canonical WAV in, text out.
#[async_trait]
pub trait SpeechEngine: Send + Sync {
    async fn transcribe_wav(&self, wav: &Path) -> Result<String>;
}

/// whisper.cpp CLI backend. Invokes the standalone binary per request and
/// collects its stdout as the transcript.
pub struct WhisperCliEngine {
    binary: PathBuf,
    model: PathBuf,
    language: String,
}

impl WhisperCliEngine {
    pub fn new(binary: PathBuf, model: PathBuf, language: String) -> Self {
        Self {
            binary,
            model,
            language,
        }
    }
}

#[async_trait]
impl SpeechEngine for WhisperCliEngine {
    async fn transcribe_wav(&self, wav: &Path) -> Result<String> {
        let output = Command::new(&self.binary)
            .arg("-m")
            .arg(&self.model)
            .arg("-f")
            .arg(wav)
            .arg("--no-timestamps")
            .arg("-l")
            .arg(&self.language)
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.binary.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let excerpt: String = stderr.chars().take(400).collect();
            bail!("speech engine failed: {}", excerpt);
        }

        // One segment per line; join into a single transcript
        let text = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        Ok(text)
    }
}

/// Holder for the currently installed speech backend.
///
/// ## Thread Safety:
/// `RwLock<Option<...>>` lets concurrent transcriptions share the backend
/// while initialization (or a future model swap) takes the write side.
pub struct TranscriptionEngine {
    backend: RwLock<Option<Arc<dyn SpeechEngine>>>,
}

impl TranscriptionEngine {
    /// Create an engine with no backend installed.
    pub fn new() -> Self {
        Self {
            backend: RwLock::new(None),
        }
    }

    /// Create an engine with a specific backend already installed. Used by
    /// tests to substitute stub engines.
    pub fn with_backend(backend: Arc<dyn SpeechEngine>) -> Self {
        Self {
            backend: RwLock::new(Some(backend)),
        }
    }

    /// Install the whisper.cpp CLI backend described by the configuration.
    ///
    /// Fails (leaving the engine unavailable) when the binary or model file
    /// is missing, so a misconfigured install degrades to diagnostics
    /// instead of preventing server startup.
    pub async fn initialize(&self, stt: &SttConfig) -> Result<()> {
        let binary = PathBuf::from(&stt.whisper_bin);
        let model = PathBuf::from(&stt.model_path);

        if !binary.exists() {
            bail!("speech engine binary not found at {}", binary.display());
        }
        if !model.exists() {
            bail!("speech model not found at {}", model.display());
        }

        let engine = Arc::new(WhisperCliEngine::new(binary, model, stt.language.clone()));
        *self.backend.write().await = Some(engine);

        info!(model = %stt.model_path, "speech engine initialized");
        Ok(())
    }

    /// Whether a backend is installed and transcription attempts can run.
    pub async fn is_ready(&self) -> bool {
        self.backend.read().await.is_some()
    }

    /// Transcribe a canonical WAV file with the installed backend.
    pub async fn transcribe_file(&self, wav: &Path) -> Result<String> {
        let backend = self.backend.read().await.clone();
        match backend {
            Some(engine) => engine.transcribe_wav(wav).await,
            None => Err(anyhow!("speech engine not initialized")),
        }
    }
}

impl Default for TranscriptionEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedEngine(&'static str);

    #[async_trait]
    impl SpeechEngine for FixedEngine {
        async fn transcribe_wav(&self, _wav: &Path) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    #[tokio::test]
    async fn test_uninitialized_engine_is_not_ready() {
        let engine = TranscriptionEngine::new();
        assert!(!engine.is_ready().await);
        assert!(engine.transcribe_file(Path::new("x.wav")).await.is_err());
    }

    #[tokio::test]
    async fn test_initialize_fails_on_missing_binary() {
        let engine = TranscriptionEngine::new();
        let stt = SttConfig {
            ffmpeg_path: "ffmpeg".to_string(),
            whisper_bin: "/nonexistent/whisper-cli".to_string(),
            model_path: "/nonexistent/model.bin".to_string(),
            language: "en".to_string(),
            finalize_wait_ms: 3000,
        };
        assert!(engine.initialize(&stt).await.is_err());
        assert!(!engine.is_ready().await);
    }

    #[tokio::test]
    async fn test_installed_backend_is_used() {
        let engine = TranscriptionEngine::with_backend(Arc::new(FixedEngine("hello world")));
        assert!(engine.is_ready().await);
        let text = engine.transcribe_file(Path::new("x.wav")).await.unwrap();
        assert_eq!(text, "hello world");
    }
}
