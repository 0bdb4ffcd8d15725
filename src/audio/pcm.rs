//! # Canonical PCM Helpers
//!
//! Utilities for the canonical audio representation used throughout the
//! transcription pipeline: 16 kHz, mono, 16-bit little-endian PCM.
//!
//! ## Key Functions:
//! - **Chunk validation**: reject payloads that cannot be 16-bit PCM
//! - **Sample decoding**: raw little-endian bytes to `i16` samples
//! - **WAV wrapping**: package an accumulated raw PCM file as a WAV
//!   container for the speech engine

use anyhow::{Context, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;
use std::path::Path;

/// Validate an incoming raw PCM chunk before it is buffered.
///
/// ## Checks:
/// 1. Non-empty payload
/// 2. Even byte count (each sample is two bytes)
///
/// Deeper format problems (wrong rate, clipped capture) cannot be detected
/// from bytes alone and are left to the speech engine to absorb.
pub fn validate_chunk(data: &[u8]) -> Result<(), String> {
    if data.is_empty() {
        return Err("PCM chunk is empty".to_string());
    }
    if data.len() % 2 != 0 {
        return Err("PCM chunk length must be even for 16-bit samples".to_string());
    }
    Ok(())
}

/// Decode raw little-endian bytes into 16-bit samples.
pub fn decode_samples(data: &[u8]) -> Vec<i16> {
    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    samples
}

/// Wrap an accumulated raw PCM file into a canonical WAV container.
///
/// The speech engine consumes WAV, not bare sample streams, so the raw
/// append-only buffer is packaged on demand. Mono, 16-bit, at the configured
/// sample rate.
pub fn wrap_raw_as_wav(raw_path: &Path, wav_path: &Path, sample_rate: u32) -> Result<()> {
    let data = std::fs::read(raw_path)
        .with_context(|| format!("failed to read raw PCM from {}", raw_path.display()))?;

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::create(wav_path, spec)
        .with_context(|| format!("failed to create {}", wav_path.display()))?;
    for sample in decode_samples(&data) {
        writer.write_sample(sample)?;
    }
    writer.finalize().context("failed to finalize WAV container")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_validation() {
        assert!(validate_chunk(&[0u8; 16]).is_ok());
        assert!(validate_chunk(&[]).is_err());
        // Odd byte count cannot hold 16-bit samples
        assert!(validate_chunk(&[0u8; 15]).is_err());
    }

    #[test]
    fn test_decode_samples_little_endian() {
        // 0x0100 = 256, 0xFFFF = -1
        let data = [0x00, 0x01, 0xFF, 0xFF];
        assert_eq!(decode_samples(&data), vec![256, -1]);
    }

    #[test]
    fn test_wrap_raw_as_wav_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let raw_path = dir.path().join("raw.pcm");
        let wav_path = dir.path().join("out.wav");

        let samples: Vec<i16> = vec![0, 1000, -1000, i16::MAX, i16::MIN];
        let mut bytes = Vec::new();
        for s in &samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        std::fs::write(&raw_path, &bytes).unwrap();

        wrap_raw_as_wav(&raw_path, &wav_path, 16000).unwrap();

        let mut reader = hound::WavReader::open(&wav_path).unwrap();
        assert_eq!(reader.spec().channels, 1);
        assert_eq!(reader.spec().sample_rate, 16000);
        assert_eq!(reader.spec().bits_per_sample, 16);
        let read_back: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(read_back, samples);
    }
}
