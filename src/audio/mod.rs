//! Device-facing audio: microphone capture and speaker playback.

pub mod capture;
pub mod pcm;
pub mod playback;

pub use capture::{AudioCapture, AudioChunk};
pub use playback::AudioPlayback;

/// Sample rate the Live API accepts for client audio.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;
/// Sample rate of the PCM16 audio the Live API returns.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;
/// Cadence at which capture emits encoded chunks.
pub const CHUNK_INTERVAL_MS: u64 = 100;
