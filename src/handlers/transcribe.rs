//! One-shot transcription endpoint: accepts an uploaded audio file in any
//! container the converter understands, normalizes it to canonical WAV,
//! and returns the transcript. Complements the streaming WebSocket path
//! for clients that record first and transcribe after.

use crate::error::{AppError, AppResult};
use crate::state::TranscriberState;
use actix_multipart::Multipart;
use actix_web::{web, HttpResponse};
use futures_util::TryStreamExt;
use serde_json::json;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

/// `POST /api/v1/audio/transcribe` — multipart upload, JSON transcript out.
pub async fn transcribe_upload(
    payload: Multipart,
    transcriber: web::Data<TranscriberState>,
) -> AppResult<HttpResponse> {
    let scratch = std::env::temp_dir().join(format!("vc-upload-{}", Uuid::new_v4()));
    tokio::fs::create_dir_all(&scratch).await?;

    let result = run_pipeline(payload, &transcriber, &scratch).await;

    // Scratch cleanup is best-effort on every outcome
    if let Err(err) = tokio::fs::remove_dir_all(&scratch).await {
        warn!(%err, "failed to remove upload scratch directory");
    }

    result
}

async fn run_pipeline(
    mut payload: Multipart,
    transcriber: &TranscriberState,
    scratch: &Path,
) -> AppResult<HttpResponse> {
    let source = scratch.join("input");
    let mut received = 0u64;
    let mut wrote = false;

    // First file field wins; one upload per request
    while let Some(mut field) = payload.try_next().await? {
        let mut file = tokio::fs::File::create(&source).await?;
        while let Some(chunk) = field.try_next().await? {
            received += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        wrote = true;
        break;
    }

    if !wrote || received == 0 {
        return Err(AppError::BadRequest(
            "no audio file found in multipart request".to_string(),
        ));
    }

    let wav = scratch.join("input.wav");
    transcriber
        .normalizer
        .normalize(&source, &wav)
        .await
        .map_err(|err| AppError::Transcription(err.to_string()))?;

    let transcript = transcriber
        .engine
        .transcribe_file(&wav)
        .await
        .map_err(|err| AppError::Transcription(err.to_string()))?;

    info!(
        bytes = received,
        chars = transcript.len(),
        "transcribed uploaded audio"
    );

    Ok(HttpResponse::Ok().json(json!({ "transcript": transcript })))
}
