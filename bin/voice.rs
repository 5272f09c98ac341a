//! Console demo for the realtime voice session pipeline.
//!
//! Connects a session, then reads commands from stdin: an empty line toggles
//! the microphone, `t <text>` sends a text turn, `q` quits. Session events
//! are printed as they arrive.

use anyhow::Context;
use live_voice::{
    config::Config,
    controller::{SessionEvent, VoiceSessionController},
    credential::{HttpTokenProvider, StaticKeyProvider, TokenProvider},
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .init();

    let tokens: Arc<dyn TokenProvider> = match (&config.token_endpoint, &config.gemini_api_key) {
        (Some(endpoint), _) => {
            info!(%endpoint, "using ephemeral token issuance");
            Arc::new(HttpTokenProvider::new(endpoint.clone()))
        }
        (None, Some(key)) => Arc::new(StaticKeyProvider::new(key.clone())),
        (None, None) => unreachable!("Config::from_env requires one credential source"),
    };

    let mut controller = VoiceSessionController::new(config, tokens);
    let mut events = controller.start().await?;

    println!("Voice session starting. Enter = toggle mic, t <text> = send text, q = quit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            maybe_event = events.recv() => {
                match maybe_event {
                    Some(SessionEvent::Connected) => println!("* connected"),
                    Some(SessionEvent::Disconnected { reason }) => {
                        println!("* disconnected: {reason}");
                        break;
                    }
                    Some(SessionEvent::Error(message)) => {
                        println!("* session error: {message}");
                        break;
                    }
                    None => break,
                }
            }
            maybe_line = lines.next_line() => {
                let Some(line) = maybe_line? else { break };
                let line = line.trim();
                if line == "q" {
                    break;
                } else if let Some(text) = line.strip_prefix("t ") {
                    controller.send_text(text).await;
                } else if line.is_empty() {
                    match controller.toggle_recording() {
                        Ok(true) => println!("* recording"),
                        Ok(false) => println!("* mic off"),
                        Err(e) => println!("* mic unavailable: {e}"),
                    }
                }
            }
        }
    }

    controller.stop().await;
    Ok(())
}
