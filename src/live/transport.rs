//! The bidirectional streaming connection to the voice endpoint.
//!
//! One `SessionTransport` owns one WebSocket for its whole life: there is no
//! reconnection here, by design. A dropped or faulted connection surfaces as
//! a terminal event and the owner decides whether to build a new transport.
//! Lifecycle and server messages are delivered over an mpsc channel in the
//! order the network produced them.

use crate::audio::AudioChunk;
use crate::audio::pcm;
use crate::config::SessionConfig;
use crate::credential::EphemeralCredential;
use crate::error::VoiceError;
use crate::live::wire::{self, ClientMessage};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message as WsMessage,
};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;

/// Connection lifecycle. `sendAudio`/`sendText` only transmit in `Open`;
/// `Closed` and `Error` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    Error,
}

impl ConnectionState {
    /// Legal state transitions. Anything else is a programming error.
    pub fn can_transition(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Open)
                | (Connecting, Error)
                | (Open, Closing)
                | (Open, Closed)
                | (Open, Error)
                | (Closing, Closed)
                | (Closing, Error)
        )
    }
}

/// A lifecycle or server event, delivered in network order.
#[derive(Debug)]
pub enum TransportEvent {
    /// The connection is open and the Setup message has been sent.
    Open,
    /// A parsed server message.
    Message(wire::ServerMessage),
    /// The connection ended, either locally or remotely.
    Closed,
    /// A transport fault. Terminal; no reconnection is attempted.
    Error(String),
}

/// One persistent bidirectional connection to the voice endpoint.
pub struct SessionTransport {
    sink: Arc<tokio::sync::Mutex<WsSink>>,
    state: Arc<Mutex<ConnectionState>>,
}

impl SessionTransport {
    /// Opens the connection with the credential embedded in the endpoint
    /// address and sends the Setup message before anything else.
    ///
    /// Returns the transport plus the event stream for this connection. The
    /// first event is always [`TransportEvent::Open`].
    pub async fn connect(
        endpoint: &str,
        credential: &EphemeralCredential,
        config: &SessionConfig,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>), VoiceError> {
        let url = format!("{}?key={}", endpoint, credential.token);
        debug!(endpoint, "connecting to voice endpoint");

        let (ws, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| VoiceError::Connection(e.to_string()))?;
        let (mut sink, stream) = ws.split();

        // Setup is the first and only message before any audio.
        let setup = serde_json::to_string(&build_setup(config))
            .map_err(|e| VoiceError::Connection(e.to_string()))?;
        sink.send(WsMessage::Text(setup.into()))
            .await
            .map_err(|e| VoiceError::Connection(e.to_string()))?;
        info!(model = %config.model, "voice session connected, setup sent");

        let state = Arc::new(Mutex::new(ConnectionState::Connecting));
        set_state(&state, ConnectionState::Open);

        let (event_tx, event_rx) = mpsc::channel(64);
        if event_tx.send(TransportEvent::Open).await.is_err() {
            return Err(VoiceError::Connection("event receiver dropped".into()));
        }
        tokio::spawn(read_loop(stream, event_tx, state.clone()));

        Ok((
            Self {
                sink: Arc::new(tokio::sync::Mutex::new(sink)),
                state,
            },
            event_rx,
        ))
    }

    pub fn state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(ConnectionState::Error)
    }

    /// Wraps a captured chunk as a realtime media message. A no-op with a
    /// warning when the connection is not open; never an error.
    pub async fn send_audio(&self, chunk: &AudioChunk) {
        let msg = ClientMessage::RealtimeInput(wire::RealtimeInput {
            media_chunks: vec![wire::MediaChunk {
                mime_type: chunk.mime_type.to_string(),
                data: pcm::encode_base64(&chunk.data),
            }],
        });
        self.send(&msg, "audio chunk").await;
    }

    /// Sends a complete user text turn. Same not-open guard as audio.
    pub async fn send_text(&self, text: &str) {
        let msg = ClientMessage::ClientContent(wire::ClientContent {
            turns: vec![wire::Turn {
                role: "user".to_string(),
                parts: vec![wire::TextPart {
                    text: text.to_string(),
                }],
            }],
            turn_complete: true,
        });
        self.send(&msg, "text turn").await;
    }

    /// Serializes and transmits only while the channel is actively open;
    /// logs and drops otherwise.
    async fn send(&self, msg: &ClientMessage, what: &str) {
        if self.state() != ConnectionState::Open {
            warn!(state = ?self.state(), "transport not open; {what} dropped");
            return;
        }
        let payload = match serde_json::to_string(msg) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to serialize {what}; dropped");
                return;
            }
        };
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(WsMessage::Text(payload.into())).await {
            warn!(error = %e, "failed to transmit {what}");
        }
    }

    /// Closes the channel. Idempotent; the matching [`TransportEvent::Closed`]
    /// is emitted by the read loop when the close completes.
    pub async fn disconnect(&self) {
        {
            let current = self.state();
            if matches!(
                current,
                ConnectionState::Closing | ConnectionState::Closed | ConnectionState::Error
            ) {
                return;
            }
            set_state(&self.state, ConnectionState::Closing);
        }
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(WsMessage::Close(None)).await {
            debug!(error = %e, "close frame not sent; connection already gone");
        }
        info!("voice session disconnect requested");
    }
}

fn set_state(state: &Arc<Mutex<ConnectionState>>, next: ConnectionState) {
    let Ok(mut guard) = state.lock() else {
        return;
    };
    if *guard == next {
        return;
    }
    if !guard.can_transition(next) {
        debug_assert!(false, "illegal transition {:?} -> {:?}", *guard, next);
        warn!(from = ?*guard, to = ?next, "illegal connection state transition");
        return;
    }
    debug!(from = ?*guard, to = ?next, "connection state");
    *guard = next;
}

fn build_setup(config: &SessionConfig) -> ClientMessage {
    ClientMessage::Setup(wire::Setup {
        model: config.model.clone(),
        generation_config: wire::GenerationConfig {
            response_modalities: config.response_modalities.clone(),
            speech_config: Some(wire::SpeechConfig {
                voice_config: wire::VoiceConfig {
                    prebuilt_voice_config: wire::PrebuiltVoiceConfig {
                        voice_name: config.voice_name.clone(),
                    },
                },
            }),
        },
        system_instruction: config.system_instruction.as_ref().map(|text| {
            wire::SystemInstruction {
                parts: vec![wire::TextPart { text: text.clone() }],
            }
        }),
    })
}

/// Forwards server frames as events, in arrival order, until the connection
/// ends. Exactly one terminal event (`Closed` or `Error`) is emitted.
async fn read_loop(
    mut stream: futures_util::stream::SplitStream<WsStream>,
    event_tx: mpsc::Sender<TransportEvent>,
    state: Arc<Mutex<ConnectionState>>,
) {
    let mut terminal = None;
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => {
                forward_server_message(text.as_bytes(), &event_tx).await;
            }
            // The service may deliver JSON payloads in binary frames.
            Ok(WsMessage::Binary(bytes)) => {
                forward_server_message(&bytes, &event_tx).await;
            }
            Ok(WsMessage::Close(frame)) => {
                info!(?frame, "voice endpoint closed the connection");
                terminal = Some(TransportEvent::Closed);
                break;
            }
            Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_)) => {}
            Err(e) => {
                warn!(error = %e, "transport fault");
                terminal = Some(TransportEvent::Error(e.to_string()));
                break;
            }
        }
    }

    let terminal = terminal.unwrap_or(TransportEvent::Closed);
    match &terminal {
        TransportEvent::Error(_) => set_state(&state, ConnectionState::Error),
        _ => set_state(&state, ConnectionState::Closed),
    }
    let _ = event_tx.send(terminal).await;
}

async fn forward_server_message(payload: &[u8], event_tx: &mpsc::Sender<TransportEvent>) {
    match serde_json::from_slice::<wire::ServerMessage>(payload) {
        Ok(msg) => {
            if event_tx.send(TransportEvent::Message(msg)).await.is_err() {
                debug!("event receiver dropped; server message discarded");
            }
        }
        Err(e) => {
            warn!(error = %e, "unparseable server message skipped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::wire::ResponseModality;
    use bytes::Bytes;
    use futures_util::SinkExt;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};

    fn test_session_config() -> SessionConfig {
        SessionConfig {
            model: "models/live-test".to_string(),
            system_instruction: None,
            voice_name: "Aoede".to_string(),
            response_modalities: vec![ResponseModality::Audio],
        }
    }

    fn test_credential() -> EphemeralCredential {
        EphemeralCredential {
            token: "test-token".to_string(),
            expires_at: None,
        }
    }

    #[test]
    fn test_transition_table() {
        use ConnectionState::*;
        assert!(Idle.can_transition(Connecting));
        assert!(Connecting.can_transition(Open));
        assert!(Connecting.can_transition(Error));
        assert!(Open.can_transition(Closing));
        assert!(Open.can_transition(Closed));
        assert!(Closing.can_transition(Closed));

        assert!(!Idle.can_transition(Open));
        assert!(!Closed.can_transition(Open));
        assert!(!Error.can_transition(Open));
        assert!(!Open.can_transition(Connecting));
        assert!(!Closed.can_transition(Connecting));
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_error() {
        let cred = test_credential();
        let config = test_session_config();
        // Port 1 is never listening.
        let result = SessionTransport::connect("ws://127.0.0.1:1", &cred, &config).await;
        assert!(matches!(result, Err(VoiceError::Connection(_))));
    }

    #[tokio::test]
    async fn test_setup_is_first_message_and_key_is_in_url() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut uri = String::new();
            let ws = tokio_tungstenite::accept_hdr_async(
                socket,
                |req: &Request, resp: Response| {
                    uri = req.uri().to_string();
                    Ok(resp)
                },
            )
            .await
            .unwrap();
            let (mut tx, mut rx) = ws.split();

            let first = rx.next().await.unwrap().unwrap();
            let text = first.into_text().unwrap();
            let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();

            tx.send(WsMessage::Text(r#"{"setupComplete":{}}"#.into()))
                .await
                .unwrap();
            tx.send(WsMessage::Close(None)).await.unwrap();
            (uri, parsed)
        });

        let (transport, mut events) = SessionTransport::connect(
            &format!("ws://{addr}/"),
            &test_credential(),
            &test_session_config(),
        )
        .await
        .unwrap();

        assert!(matches!(events.recv().await, Some(TransportEvent::Open)));
        assert_eq!(transport.state(), ConnectionState::Open);

        let setup_ack = events.recv().await.unwrap();
        match setup_ack {
            TransportEvent::Message(msg) => assert!(msg.setup_complete.is_some()),
            other => panic!("expected setup ack, got {other:?}"),
        }
        assert!(matches!(events.recv().await, Some(TransportEvent::Closed)));
        assert_eq!(transport.state(), ConnectionState::Closed);

        let (uri, setup) = server.await.unwrap();
        assert!(uri.ends_with("?key=test-token"), "uri was {uri}");
        assert_eq!(setup["setup"]["model"], "models/live-test");
        assert_eq!(
            setup["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]
                ["prebuiltVoiceConfig"]["voiceName"],
            "Aoede"
        );
    }

    #[tokio::test]
    async fn test_send_after_disconnect_never_transmits() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            let (_tx, mut rx) = ws.split();
            // Count data frames until the connection ends.
            let mut data_frames = 0usize;
            while let Some(Ok(frame)) = rx.next().await {
                match frame {
                    WsMessage::Text(_) | WsMessage::Binary(_) => data_frames += 1,
                    WsMessage::Close(_) => break,
                    _ => {}
                }
            }
            data_frames
        });

        let (transport, mut events) = SessionTransport::connect(
            &format!("ws://{addr}/"),
            &test_credential(),
            &test_session_config(),
        )
        .await
        .unwrap();
        assert!(matches!(events.recv().await, Some(TransportEvent::Open)));

        transport.disconnect().await;
        transport.disconnect().await; // idempotent

        // Neither send may transmit or panic after the close.
        let chunk = AudioChunk {
            data: Bytes::from_static(&[0, 0, 0, 0]),
            mime_type: "audio/pcm;rate=16000",
        };
        transport.send_audio(&chunk).await;
        transport.send_text("too late").await;

        // Only the setup frame counts as data on the server side.
        assert_eq!(server.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_server_messages_arrive_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            let (mut tx, mut rx) = ws.split();
            let _setup = rx.next().await;
            for data in ["QQ==", "Qg==", "Qw=="] {
                let msg = format!(
                    r#"{{"serverContent":{{"modelTurn":{{"parts":[{{"inlineData":{{"data":"{data}"}}}}]}}}}}}"#
                );
                tx.send(WsMessage::Text(msg.into())).await.unwrap();
            }
            tx.send(WsMessage::Text(r#"{"serverContent":{"interrupted":true}}"#.into()))
                .await
                .unwrap();
            tx.send(WsMessage::Close(None)).await.unwrap();
        });

        let (_transport, mut events) = SessionTransport::connect(
            &format!("ws://{addr}/"),
            &test_credential(),
            &test_session_config(),
        )
        .await
        .unwrap();
        assert!(matches!(events.recv().await, Some(TransportEvent::Open)));

        for expected in ["QQ==", "Qg==", "Qw=="] {
            match events.recv().await.unwrap() {
                TransportEvent::Message(msg) => {
                    let content = msg.server_content.unwrap();
                    let turn = content.model_turn.unwrap();
                    assert_eq!(turn.parts[0].inline_data.as_ref().unwrap().data, expected);
                }
                other => panic!("expected audio message, got {other:?}"),
            }
        }
        match events.recv().await.unwrap() {
            TransportEvent::Message(msg) => {
                assert_eq!(msg.server_content.unwrap().interrupted, Some(true));
            }
            other => panic!("expected interruption, got {other:?}"),
        }
        assert!(matches!(events.recv().await, Some(TransportEvent::Closed)));
    }
}
