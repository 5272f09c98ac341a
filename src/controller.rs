//! The orchestrating session state machine.
//!
//! `VoiceSessionController` owns the capture, playback, and transport pieces
//! and binds UI intent to them: `start` brings the session up, a single
//! `toggle_recording` control surface drives the microphone, and transport
//! events flow through a pump task that routes returned audio to playback
//! and terminal events to the UI.

use crate::audio::{AudioCapture, AudioChunk, AudioPlayback, PLAYBACK_SAMPLE_RATE};
use crate::config::Config;
use crate::credential::{EphemeralCredential, TokenProvider};
use crate::error::VoiceError;
use crate::live::{SessionTransport, TransportEvent, wire};
use base64::Engine;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Session lifecycle as the UI sees it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// User-visible notifications emitted by the session pump.
#[derive(Debug)]
pub enum SessionEvent {
    Connected,
    Disconnected { reason: String },
    Error(String),
}

/// Orchestrates one realtime voice session at a time.
///
/// Only one controller should be active per process: the audio devices it
/// acquires are exclusive OS resources.
pub struct VoiceSessionController {
    config: Config,
    tokens: Arc<dyn TokenProvider>,
    capture: Arc<AudioCapture>,
    playback: Arc<AudioPlayback>,
    transport: Option<Arc<SessionTransport>>,
    credential: Option<EphemeralCredential>,
    chunk_tx: Option<mpsc::Sender<AudioChunk>>,
    state: Arc<Mutex<SessionState>>,
    pump: Option<JoinHandle<()>>,
}

impl VoiceSessionController {
    pub fn new(config: Config, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            config,
            tokens,
            capture: Arc::new(AudioCapture::new()),
            playback: Arc::new(AudioPlayback::new()),
            transport: None,
            credential: None,
            chunk_tx: None,
            state: Arc::new(Mutex::new(SessionState::Idle)),
            pump: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(SessionState::Error)
    }

    pub fn is_recording(&self) -> bool {
        self.capture.is_capturing()
    }

    /// Brings the session up: ensures a usable credential, connects the
    /// transport, and spawns the session pump. Returns the stream of
    /// user-visible session events.
    ///
    /// The microphone is not touched here; it is acquired on the first
    /// [`toggle_recording`](Self::toggle_recording).
    pub async fn start(&mut self) -> Result<mpsc::Receiver<SessionEvent>, VoiceError> {
        if matches!(
            self.state(),
            SessionState::Connecting | SessionState::Connected
        ) {
            return Err(VoiceError::Connection("a session is already active".into()));
        }
        set_state(&self.state, SessionState::Connecting);

        // Re-fetch the credential only when the cached one is unusable.
        if self.credential.as_ref().is_none_or(|c| c.is_expired()) {
            debug!("fetching a fresh credential");
            match self.tokens.fetch().await {
                Ok(cred) => self.credential = Some(cred),
                Err(e) => {
                    set_state(&self.state, SessionState::Error);
                    return Err(e);
                }
            }
        }
        let credential = self.credential.as_ref().unwrap().clone();

        // A missing output device degrades to silent playback rather than
        // blocking the session; response audio is fire-and-forget.
        if let Err(e) = self.playback.initialize() {
            warn!(error = %e, "playback unavailable; session will run without audio output");
        }

        let session_config = self.config.session_config();
        let (transport, transport_rx) =
            match SessionTransport::connect(&self.config.live_endpoint, &credential, &session_config)
                .await
            {
                Ok(parts) => parts,
                Err(e) => {
                    set_state(&self.state, SessionState::Error);
                    return Err(e);
                }
            };
        let transport = Arc::new(transport);
        self.transport = Some(transport.clone());

        let (chunk_tx, chunk_rx) = mpsc::channel::<AudioChunk>(32);
        self.chunk_tx = Some(chunk_tx);

        let (event_tx, event_rx) = mpsc::channel::<SessionEvent>(16);
        self.pump = Some(tokio::spawn(run_pump(
            transport,
            transport_rx,
            chunk_rx,
            self.capture.clone(),
            self.playback.clone(),
            self.state.clone(),
            event_tx,
        )));

        Ok(event_rx)
    }

    /// Starts the microphone if idle, stops it if recording. Returns whether
    /// recording is active after the call.
    ///
    /// This is the only user-facing capture control. Mic acquisition errors
    /// (`PermissionDenied`, `CaptureUnavailable`) surface here and leave the
    /// session itself untouched.
    pub fn toggle_recording(&self) -> Result<bool, VoiceError> {
        if self.capture.is_capturing() {
            self.capture.stop_capture();
            return Ok(false);
        }
        let chunk_tx = self
            .chunk_tx
            .as_ref()
            .ok_or_else(|| VoiceError::Connection("no active session".into()))?;
        self.capture.start_capture(chunk_tx.clone())?;
        Ok(true)
    }

    /// Sends a complete user text turn over the active session. Dropped with
    /// a warning when no session is active.
    pub async fn send_text(&self, text: &str) {
        match &self.transport {
            Some(transport) => transport.send_text(text).await,
            None => warn!("no active session; text turn dropped"),
        }
    }

    /// Explicit teardown: stop capture, disconnect, release audio resources.
    /// Safe to call from any state, repeatedly.
    pub async fn stop(&mut self) {
        self.capture.stop_capture();
        if let Some(transport) = self.transport.take() {
            transport.disconnect().await;
        }
        self.chunk_tx = None;
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.playback.cleanup();
        set_state(&self.state, SessionState::Idle);
        info!("voice session stopped");
    }
}

impl Drop for VoiceSessionController {
    fn drop(&mut self) {
        self.capture.stop_capture();
        self.playback.cleanup();
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

fn set_state(state: &Arc<Mutex<SessionState>>, next: SessionState) {
    if let Ok(mut guard) = state.lock() {
        if *guard != next {
            debug!(from = ?*guard, to = ?next, "session state");
            *guard = next;
        }
    }
}

/// Routes transport events and captured chunks for the life of a session.
///
/// Chunk forwarding and message handling share this single task, so capture
/// order is preserved through to `send_audio` and server messages are
/// processed in arrival order.
async fn run_pump(
    transport: Arc<SessionTransport>,
    mut transport_rx: mpsc::Receiver<TransportEvent>,
    mut chunk_rx: mpsc::Receiver<AudioChunk>,
    capture: Arc<AudioCapture>,
    playback: Arc<AudioPlayback>,
    state: Arc<Mutex<SessionState>>,
    events: mpsc::Sender<SessionEvent>,
) {
    loop {
        tokio::select! {
            maybe_event = transport_rx.recv() => {
                match maybe_event {
                    Some(TransportEvent::Open) => {
                        set_state(&state, SessionState::Connected);
                        let _ = events.send(SessionEvent::Connected).await;
                    }
                    Some(TransportEvent::Message(msg)) => {
                        handle_server_message(msg, &playback);
                    }
                    Some(TransportEvent::Closed) => {
                        capture.stop_capture();
                        set_state(&state, SessionState::Disconnected);
                        let _ = events
                            .send(SessionEvent::Disconnected {
                                reason: "connection closed".to_string(),
                            })
                            .await;
                        break;
                    }
                    Some(TransportEvent::Error(e)) => {
                        capture.stop_capture();
                        set_state(&state, SessionState::Error);
                        let _ = events.send(SessionEvent::Error(e)).await;
                        break;
                    }
                    None => {
                        capture.stop_capture();
                        set_state(&state, SessionState::Disconnected);
                        break;
                    }
                }
            }
            Some(chunk) = chunk_rx.recv() => {
                transport.send_audio(&chunk).await;
            }
        }
    }
}

fn handle_server_message(msg: wire::ServerMessage, playback: &AudioPlayback) {
    if msg.setup_complete.is_some() {
        debug!("session setup acknowledged");
    }
    let Some(content) = msg.server_content else {
        return;
    };

    // The upstream protocol uses this to mean "stop rendering the previous
    // response". Observation-only here: in-flight playback is left to drain,
    // matching the long-standing behavior of this pipeline.
    if content.interrupted == Some(true) {
        warn!("server interruption signal received; in-flight playback left to finish");
    }

    if let Some(turn) = content.model_turn {
        for part in turn.parts {
            if let Some(inline) = part.inline_data {
                match base64::engine::general_purpose::STANDARD.decode(&inline.data) {
                    Ok(bytes) => {
                        let rate = inline
                            .mime_type
                            .as_deref()
                            .and_then(parse_pcm_rate)
                            .unwrap_or(PLAYBACK_SAMPLE_RATE);
                        playback.play_pcm(&bytes, rate);
                    }
                    Err(e) => warn!(error = %e, "undecodable audio payload skipped"),
                }
            }
            if let Some(text) = part.text {
                debug!(%text, "model text part");
            }
        }
    }

    if content.turn_complete == Some(true) {
        debug!("model turn complete");
    }
}

/// Extracts the sample rate from a `audio/pcm;rate=24000` style MIME tag.
fn parse_pcm_rate(mime: &str) -> Option<u32> {
    mime.split(';')
        .filter_map(|part| part.trim().strip_prefix("rate="))
        .find_map(|rate| rate.parse().ok())
}
