//! PCM16 sample conversion and sample-rate adaptation.
//!
//! The wire format on both directions is 16-bit signed little-endian mono
//! PCM, base64-encoded inside JSON. Device streams run at whatever rate the
//! hardware prefers, so both capture and playback resample through here.

use base64::Engine;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1, // mono
    )?;
    Ok(resampler)
}

/// Interprets little-endian PCM16 bytes as normalized f32 samples in [-1, 1].
/// A trailing odd byte is ignored.
pub fn pcm16_bytes_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|chunk| {
            let v = i16::from_le_bytes([chunk[0], chunk[1]]);
            (v as f32 / 32768.0).clamp(-1.0, 1.0)
        })
        .collect()
}

/// Quantizes f32 samples to little-endian PCM16 bytes.
pub fn f32_to_pcm16_bytes(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&sample| {
            let v = (sample * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            v.to_le_bytes()
        })
        .collect()
}

/// Decodes a base64 PCM16 payload into normalized f32 samples.
/// Malformed base64 yields an empty buffer; the payload is fire-and-forget.
pub fn decode_base64_pcm16(fragment: &str) -> Vec<f32> {
    match base64::engine::general_purpose::STANDARD.decode(fragment) {
        Ok(bytes) => pcm16_bytes_to_f32(&bytes),
        Err(e) => {
            tracing::warn!(error = %e, "failed to decode base64 audio payload");
            Vec::new()
        }
    }
}

/// Base64-encodes raw bytes for a media chunk payload.
pub fn encode_base64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Feeds a fixed-chunk resampler from arbitrary-length sample slices.
///
/// `FastFixedIn` consumes exactly `chunk_size` input frames per call, so the
/// remainder of each push is carried over instead of dropped.
pub struct ResampleBuffer {
    resampler: FastFixedIn<f32>,
    chunk_size: usize,
    pending: Vec<f32>,
    passthrough: bool,
}

impl ResampleBuffer {
    pub fn new(in_rate: u32, out_rate: u32, chunk_size: usize) -> anyhow::Result<Self> {
        Ok(Self {
            resampler: create_resampler(in_rate as f64, out_rate as f64, chunk_size)?,
            chunk_size,
            pending: Vec::new(),
            passthrough: in_rate == out_rate,
        })
    }

    /// Pushes samples in and returns whatever full chunks resample out.
    pub fn push(&mut self, samples: &[f32]) -> Vec<f32> {
        if self.passthrough {
            return samples.to_vec();
        }
        self.pending.extend_from_slice(samples);
        let mut out = Vec::new();
        while self.pending.len() >= self.chunk_size {
            let chunk: Vec<f32> = self.pending.drain(..self.chunk_size).collect();
            match self.resampler.process(&[chunk], None) {
                Ok(res) => out.extend_from_slice(&res[0]),
                Err(e) => {
                    tracing::warn!(error = %e, "resampler failed on chunk; samples dropped");
                }
            }
        }
        out
    }

    /// Flushes the tail by zero-padding it to a full chunk. Call once when
    /// the stream ends; the padding is inaudible.
    pub fn flush(&mut self) -> Vec<f32> {
        if self.passthrough || self.pending.is_empty() {
            return Vec::new();
        }
        self.pending.resize(self.chunk_size, 0.0);
        let chunk: Vec<f32> = self.pending.drain(..).collect();
        match self.resampler.process(&[chunk], None) {
            Ok(res) => res[0].clone(),
            Err(e) => {
                tracing::warn!(error = %e, "resampler failed on flush");
                Vec::new()
            }
        }
    }
}

/// Downmixes interleaved multi-channel samples to mono by averaging.
pub fn downmix_to_mono(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}
