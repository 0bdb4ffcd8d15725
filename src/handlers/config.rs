//! Runtime configuration endpoints: read the effective configuration and
//! apply partial updates (trigger thresholds, STT settings) without a
//! restart.

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

fn config_json(config: &crate::config::AppConfig) -> serde_json::Value {
    json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port
        },
        "audio": {
            "sample_rate": config.audio.sample_rate,
            "channels": config.audio.channels,
            "bit_depth": config.audio.bit_depth,
            "segment_trigger_bytes": config.audio.segment_trigger_bytes,
            "raw_trigger_bytes": config.audio.raw_trigger_bytes
        },
        "stt": {
            "ffmpeg_path": config.stt.ffmpeg_path,
            "whisper_bin": config.stt.whisper_bin,
            "model_path": config.stt.model_path,
            "language": config.stt.language,
            "finalize_wait_ms": config.stt.finalize_wait_ms
        },
        "performance": {
            "max_concurrent_sessions": config.performance.max_concurrent_sessions
        }
    })
}

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config_json(&config)
    })))
}

pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config.update_from_json(&json_str)?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": config_json(&current_config)
    })))
}
