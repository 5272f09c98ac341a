//! Realtime voice session pipeline for the Gemini Live API.
//!
//! The crate is organized leaf to root: [`audio`] owns device capture and
//! playback, [`live`] owns the bidirectional WebSocket transport and its wire
//! format, and [`controller`] binds them together behind a single session
//! state machine that a UI layer can drive.

pub mod audio;
pub mod config;
pub mod controller;
pub mod credential;
pub mod error;
pub mod live;
