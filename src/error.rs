//! Error taxonomy for the voice pipeline.
//!
//! Only failures that the UI layer must react to are surfaced as `Err` values.
//! Playback decode failures and sends attempted while the transport is not
//! open are deliberately log-only conditions: response audio is
//! fire-and-forget, and a stale send is dropped rather than raised.

/// Failures surfaced to the caller of the voice session API.
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    /// Microphone access was refused by the user or the OS.
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    /// No usable audio backend or output device on this platform.
    #[error("audio output is not available on this platform: {0}")]
    UnsupportedPlatform(String),

    /// Audio resource construction failed for a non-permission reason.
    #[error("audio system initialization failed: {0}")]
    Init(String),

    /// Microphone acquisition failed for a non-permission reason.
    #[error("audio capture unavailable: {0}")]
    CaptureUnavailable(String),

    /// The streaming transport could not be established.
    #[error("voice service connection failed: {0}")]
    Connection(String),

    /// The credential collaborator could not issue a usable token.
    #[error("credential fetch failed: {0}")]
    Credential(String),
}
