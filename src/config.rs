//! # Configuration Management
//!
//! Loads application configuration from layered sources:
//! - Built-in defaults
//! - TOML configuration file (config.toml)
//! - Environment variables with the APP_ prefix
//! - HOST / PORT overrides used by deployment platforms
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER_HOST, HOST, PORT, ...)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub stt: SttConfig,
    pub performance: PerformanceConfig,
}

/// HTTP server binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Canonical audio format and the partial-transcription trigger policy.
///
/// ## Trigger thresholds:
/// - `segment_trigger_bytes`: a discrete chunk larger than this triggers a
///   segment-append partial transcription
/// - `raw_trigger_bytes`: once the accumulated raw PCM buffer grows past
///   this, a buffer-replace partial transcription triggers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u8,
    pub bit_depth: u8,
    pub segment_trigger_bytes: u64,
    pub raw_trigger_bytes: u64,
}

/// Speech-to-text boundary configuration.
///
/// The converter and engine are external programs; the backend only needs
/// to know where they live and how long finalization may wait for an
/// in-flight partial pass before proceeding degraded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttConfig {
    pub ffmpeg_path: String,
    pub whisper_bin: String,
    pub model_path: String,
    pub language: String,
    pub finalize_wait_ms: u64,
}

/// Capacity tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            audio: AudioConfig {
                sample_rate: 16_000,
                channels: 1,
                bit_depth: 16,
                segment_trigger_bytes: 4096,
                raw_trigger_bytes: 8192,
            },
            stt: SttConfig {
                ffmpeg_path: "ffmpeg".to_string(),
                whisper_bin: "whisper.cpp/build/bin/whisper-cli".to_string(),
                model_path: "whisper.cpp/models/ggml-tiny.en.bin".to_string(),
                language: "en".to_string(),
                finalize_wait_ms: 3000,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from all sources in priority order.
    ///
    /// `HOST` and `PORT` are honored as overrides on top of the `APP_`
    /// prefix convention because deployment platforms commonly inject them.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that configuration values make sense before the server
    /// starts or an update is accepted.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.audio.sample_rate == 0 {
            return Err(anyhow::anyhow!("Audio sample rate must be greater than 0"));
        }

        if self.audio.segment_trigger_bytes == 0 || self.audio.raw_trigger_bytes == 0 {
            return Err(anyhow::anyhow!(
                "Transcription trigger thresholds must be greater than 0"
            ));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!(
                "Max concurrent sessions must be greater than 0"
            ));
        }

        Ok(())
    }

    /// Apply a partial update from a JSON document, then re-validate.
    ///
    /// Only the fields present in the JSON are touched, so a client can send
    /// just `{"audio": {"raw_trigger_bytes": 16384}}` to tune one knob.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = port as u16;
            }
        }

        if let Some(audio) = partial.get("audio") {
            if let Some(v) = audio.get("segment_trigger_bytes").and_then(|v| v.as_u64()) {
                self.audio.segment_trigger_bytes = v;
            }
            if let Some(v) = audio.get("raw_trigger_bytes").and_then(|v| v.as_u64()) {
                self.audio.raw_trigger_bytes = v;
            }
        }

        if let Some(stt) = partial.get("stt") {
            if let Some(v) = stt.get("model_path").and_then(|v| v.as_str()) {
                self.stt.model_path = v.to_string();
            }
            if let Some(v) = stt.get("language").and_then(|v| v.as_str()) {
                self.stt.language = v.to_string();
            }
            if let Some(v) = stt.get("finalize_wait_ms").and_then(|v| v.as_u64()) {
                self.stt.finalize_wait_ms = v;
            }
        }

        if let Some(performance) = partial.get("performance") {
            if let Some(v) = performance
                .get("max_concurrent_sessions")
                .and_then(|v| v.as_u64())
            {
                self.performance.max_concurrent_sessions = v as usize;
            }
        }

        self.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.audio.sample_rate, 16_000);
        assert_eq!(config.audio.segment_trigger_bytes, 4096);
        assert_eq!(config.audio.raw_trigger_bytes, 8192);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.raw_trigger_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_update_from_json() {
        let mut config = AppConfig::default();
        let json = r#"{"audio": {"raw_trigger_bytes": 16384}, "stt": {"language": "de"}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.audio.raw_trigger_bytes, 16384);
        assert_eq!(config.stt.language, "de");
        // Untouched fields keep their values
        assert_eq!(config.audio.segment_trigger_bytes, 4096);
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_update_rejects_invalid_values() {
        let mut config = AppConfig::default();
        let json = r#"{"performance": {"max_concurrent_sessions": 0}}"#;
        assert!(config.update_from_json(json).is_err());
    }

    #[test]
    fn test_config_parses_from_toml() {
        let toml_str = r#"
            [server]
            host = "0.0.0.0"
            port = 9000

            [audio]
            sample_rate = 16000
            channels = 1
            bit_depth = 16
            segment_trigger_bytes = 2048
            raw_trigger_bytes = 4096

            [stt]
            ffmpeg_path = "ffmpeg"
            whisper_bin = "bin/whisper-cli"
            model_path = "models/ggml-base.en.bin"
            language = "en"
            finalize_wait_ms = 1500

            [performance]
            max_concurrent_sessions = 4
        "#;

        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.audio.segment_trigger_bytes, 2048);
        assert_eq!(config.stt.finalize_wait_ms, 1500);
        assert!(config.validate().is_ok());
    }
}
