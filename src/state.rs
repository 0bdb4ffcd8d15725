//! # Application State Management
//!
//! Shared state accessed by every HTTP request handler and WebSocket
//! connection: runtime configuration, request metrics, and the
//! transcription plumbing (registry, scheduler, converter, engine).
//!
//! ## Thread Safety:
//! `Arc<RwLock<_>>` throughout — many readers or one writer. Config reads
//! clone out of the lock so nothing holds it across an await point.

use crate::audio::session::SessionRegistry;
use crate::config::AppConfig;
use crate::transcription::engine::TranscriptionEngine;
use crate::transcription::normalizer::{AudioNormalizer, FfmpegNormalizer};
use crate::transcription::scheduler::TranscriptionScheduler;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// Config, metrics, and uptime shared across all request handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Application configuration (updatable at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Request metrics, updated by middleware on every request
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,
}

/// Counters collected across all requests and connections.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total HTTP requests processed since server start
    pub request_count: u64,

    /// Total errors encountered since server start
    pub error_count: u64,

    /// Currently open WebSocket streaming connections
    pub active_sessions: u32,

    /// Per-endpoint statistics keyed by "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Statistics for a single API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Snapshot of the current configuration. Clones so the lock is not
    /// held while the caller works with it.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                *self.config.write().unwrap() = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.request_count += 1;
    }

    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.error_count += 1;
    }

    /// Record a finished request against its endpoint's statistics.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();
        let endpoint_metric = metrics
            .endpoint_metrics
            .entry(endpoint.to_string())
            .or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn increment_active_sessions(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.active_sessions += 1;
    }

    pub fn decrement_active_sessions(&self) {
        let mut metrics = self.metrics.write().unwrap();
        if metrics.active_sessions > 0 {
            metrics.active_sessions -= 1;
        }
    }

    /// Consistent copy of the metrics for serialization, taken under the
    /// read lock so it cannot observe a half-updated endpoint entry.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            active_sessions: metrics.active_sessions,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

/// The transcription plumbing shared by the WebSocket route, the upload
/// endpoint, and the health checks. One instance per process: the registry
/// in particular must be process-wide so a connection identity can never
/// resolve to two different session maps.
#[derive(Clone)]
pub struct TranscriberState {
    pub registry: Arc<SessionRegistry>,
    pub scheduler: Arc<TranscriptionScheduler>,
    pub normalizer: Arc<dyn AudioNormalizer>,
    pub engine: Arc<TranscriptionEngine>,
}

impl TranscriberState {
    pub fn new(config: &AppConfig) -> Self {
        let normalizer: Arc<dyn AudioNormalizer> = Arc::new(FfmpegNormalizer::new(
            config.stt.ffmpeg_path.clone(),
            config.audio.sample_rate,
        ));
        let engine = Arc::new(TranscriptionEngine::new());
        let registry = Arc::new(SessionRegistry::new(
            config.performance.max_concurrent_sessions,
        ));
        let scheduler = Arc::new(TranscriptionScheduler::new(
            normalizer.clone(),
            engine.clone(),
            config,
        ));

        Self {
            registry,
            scheduler,
            normalizer,
            engine,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_counter_never_underflows() {
        let state = AppState::new(AppConfig::default());
        state.decrement_active_sessions();
        assert_eq!(state.get_metrics_snapshot().active_sessions, 0);

        state.increment_active_sessions();
        state.increment_active_sessions();
        state.decrement_active_sessions();
        assert_eq!(state.get_metrics_snapshot().active_sessions, 1);
    }

    #[test]
    fn test_endpoint_metrics_accumulate() {
        let state = AppState::new(AppConfig::default());
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let snapshot = state.get_metrics_snapshot();
        let metric = &snapshot.endpoint_metrics["GET /health"];
        assert_eq!(metric.request_count, 2);
        assert_eq!(metric.error_count, 1);
        assert_eq!(metric.average_duration_ms(), 20.0);
        assert_eq!(metric.error_rate(), 0.5);
    }

    #[test]
    fn test_config_update_is_validated() {
        let state = AppState::new(AppConfig::default());
        let mut bad = AppConfig::default();
        bad.server.port = 0;
        assert!(state.update_config(bad).is_err());
        // The stored config is untouched after a rejected update
        assert_eq!(state.get_config().server.port, 8080);
    }
}
