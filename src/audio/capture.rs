//! Microphone capture: cpal input stream to fixed-cadence PCM16 chunks.
//!
//! `cpal::Stream` is not `Send`, so the stream lives on a dedicated capture
//! thread for the duration of a recording. The cpal callback hands raw device
//! frames to that thread over a bounded channel; the thread downmixes,
//! resamples to 16 kHz, and emits one encoded chunk per 100 ms of audio to
//! the session's chunk channel.

use super::pcm::{self, ResampleBuffer};
use super::{CAPTURE_SAMPLE_RATE, CHUNK_INTERVAL_MS};
use crate::error::VoiceError;
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, mpsc as std_mpsc};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// One capture interval's worth of encoded audio, ready for transport.
#[derive(Clone, Debug)]
pub struct AudioChunk {
    pub data: Bytes,
    pub mime_type: &'static str,
}

/// MIME tag declared on every captured chunk.
pub const CAPTURE_MIME_TYPE: &str = "audio/pcm;rate=16000";

/// Samples per emitted chunk at the capture rate.
const SAMPLES_PER_CHUNK: usize =
    (CAPTURE_SAMPLE_RATE as usize * CHUNK_INTERVAL_MS as usize) / 1000;

struct CaptureWorker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Owns the microphone for the lifetime of a recording.
///
/// Exactly one capture worker may run at a time; the microphone is an
/// exclusively held OS resource per session.
pub struct AudioCapture {
    worker: Mutex<Option<CaptureWorker>>,
}

impl AudioCapture {
    pub fn new() -> Self {
        Self {
            worker: Mutex::new(None),
        }
    }

    /// Whether a capture worker currently holds the microphone.
    pub fn is_capturing(&self) -> bool {
        self.worker
            .lock()
            .map(|w| w.as_ref().is_some_and(|w| !w.handle.is_finished()))
            .unwrap_or(false)
    }

    /// Acquires the microphone and begins emitting [`AudioChunk`]s on
    /// `chunk_tx` roughly every 100 ms, in production order.
    ///
    /// Returns once the device stream is running. Chunk delivery uses a
    /// bounded queue with a drop-newest policy: if the consumer lags, the
    /// freshest chunk is dropped with a warning rather than blocking the
    /// audio thread.
    pub fn start_capture(&self, chunk_tx: mpsc::Sender<AudioChunk>) -> Result<(), VoiceError> {
        let mut slot = self
            .worker
            .lock()
            .map_err(|_| VoiceError::CaptureUnavailable("capture state poisoned".into()))?;
        if slot.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            return Err(VoiceError::CaptureUnavailable(
                "capture is already running".into(),
            ));
        }

        let host = cpal::default_host();
        let device = host.default_input_device().ok_or_else(|| {
            VoiceError::CaptureUnavailable("no default input device available".into())
        })?;

        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_thread = stop.clone();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), VoiceError>>();

        let handle = std::thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                capture_thread(device, chunk_tx, stop_for_thread, ready_tx);
            })
            .map_err(|e| VoiceError::Init(e.to_string()))?;

        // Wait for the stream to come up (or fail) before reporting success.
        match ready_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(())) => {
                *slot = Some(CaptureWorker { stop, handle });
                info!("audio capture started");
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                stop.store(true, Ordering::Relaxed);
                let _ = handle.join();
                Err(VoiceError::CaptureUnavailable(
                    "timed out waiting for the capture stream to start".into(),
                ))
            }
        }
    }

    /// Stops the encoder and releases the microphone. Idempotent; a no-op
    /// when not capturing.
    pub fn stop_capture(&self) {
        let worker = match self.worker.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => return,
        };
        if let Some(worker) = worker {
            worker.stop.store(true, Ordering::Relaxed);
            if worker.handle.join().is_err() {
                warn!("capture thread panicked during shutdown");
            }
            info!("audio capture stopped");
        }
    }
}

impl Default for AudioCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop_capture();
    }
}

/// Accumulates 16 kHz mono samples and cuts them into fixed-size PCM16
/// chunks, preserving production order.
struct ChunkAssembler {
    pending: Vec<f32>,
    samples_per_chunk: usize,
}

impl ChunkAssembler {
    fn new(samples_per_chunk: usize) -> Self {
        Self {
            pending: Vec::new(),
            samples_per_chunk,
        }
    }

    fn push(&mut self, samples: &[f32]) -> Vec<AudioChunk> {
        self.pending.extend_from_slice(samples);
        let mut out = Vec::new();
        while self.pending.len() >= self.samples_per_chunk {
            let chunk: Vec<f32> = self.pending.drain(..self.samples_per_chunk).collect();
            out.push(AudioChunk {
                data: Bytes::from(pcm::f32_to_pcm16_bytes(&chunk)),
                mime_type: CAPTURE_MIME_TYPE,
            });
        }
        out
    }
}

fn capture_thread(
    device: cpal::Device,
    chunk_tx: mpsc::Sender<AudioChunk>,
    stop: Arc<AtomicBool>,
    ready_tx: std_mpsc::Sender<Result<(), VoiceError>>,
) {
    let (stream, frame_rx, device_rate, channels, overruns) = match build_input_stream(&device) {
        Ok(parts) => parts,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(VoiceError::CaptureUnavailable(e.to_string())));
        return;
    }
    let _ = ready_tx.send(Ok(()));
    debug!(device_rate, channels, "capture stream running");

    let mut resampler = match ResampleBuffer::new(device_rate, CAPTURE_SAMPLE_RATE, 512) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "failed to construct capture resampler");
            return;
        }
    };
    let mut assembler = ChunkAssembler::new(SAMPLES_PER_CHUNK);
    let mut dropped_chunks = 0usize;

    while !stop.load(Ordering::Relaxed) {
        let frame = match frame_rx.recv_timeout(Duration::from_millis(20)) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                warn!("capture stream disconnected");
                break;
            }
        };
        let mono = pcm::downmix_to_mono(&frame, channels);
        let resampled = resampler.push(&mono);
        for chunk in assembler.push(&resampled) {
            if chunk_tx.try_send(chunk).is_err() {
                dropped_chunks += 1;
            }
        }
    }

    drop(stream);
    if dropped_chunks > 0 {
        warn!(dropped_chunks, "chunk consumer lagged; newest chunks dropped");
    }
    let overrun_count = overruns.load(Ordering::Relaxed);
    if overrun_count > 0 {
        warn!(overrun_count, "capture thread lagged; device frames dropped");
    }
}

type InputParts = (
    cpal::Stream,
    Receiver<Vec<f32>>,
    u32,
    usize,
    Arc<AtomicUsize>,
);

/// Builds an input stream in the device's native format, converting every
/// supported sample type to f32 at the callback boundary.
fn build_input_stream(device: &cpal::Device) -> Result<InputParts, VoiceError> {
    let default_config = device
        .default_input_config()
        .map_err(|e| VoiceError::CaptureUnavailable(e.to_string()))?;
    let format = default_config.sample_format();
    let config: StreamConfig = default_config.into();
    let device_rate = config.sample_rate.0;
    let channels = usize::from(config.channels.max(1));

    let (frame_tx, frame_rx) = bounded::<Vec<f32>>(32);
    let overruns = Arc::new(AtomicUsize::new(0));
    let err_fn = |err| warn!(error = %err, "capture stream error");

    macro_rules! input_stream {
        ($ty:ty, $to_f32:expr) => {{
            let frame_tx = frame_tx.clone();
            let overruns = overruns.clone();
            device.build_input_stream(
                &config,
                move |data: &[$ty], _| {
                    let frame: Vec<f32> = data.iter().map($to_f32).collect();
                    if frame_tx.try_send(frame).is_err() {
                        overruns.fetch_add(1, Ordering::Relaxed);
                    }
                },
                err_fn,
                None,
            )
        }};
    }

    let stream = match format {
        SampleFormat::F32 => input_stream!(f32, |&s| s),
        SampleFormat::I16 => input_stream!(i16, |&s| s as f32 / 32_768.0),
        SampleFormat::U16 => input_stream!(u16, |&s| (s as f32 - 32_768.0) / 32_768.0),
        other => {
            return Err(VoiceError::CaptureUnavailable(format!(
                "unsupported sample format: {other:?}"
            )));
        }
    }
    .map_err(map_build_error)?;

    Ok((stream, frame_rx, device_rate, channels, overruns))
}

/// A vanished device at stream-build time is how OS-level microphone denial
/// shows up through cpal, so it gets the permission hint.
fn map_build_error(err: cpal::BuildStreamError) -> VoiceError {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => {
            VoiceError::PermissionDenied(format!("{} {}", err, mic_permission_hint()))
        }
        other => VoiceError::CaptureUnavailable(other.to_string()),
    }
}

fn mic_permission_hint() -> &'static str {
    #[cfg(target_os = "macos")]
    {
        "macOS: System Settings > Privacy & Security > Microphone (enable your terminal)."
    }
    #[cfg(target_os = "linux")]
    {
        "Linux: check PipeWire/PulseAudio permissions and ensure the device is not muted."
    }
    #[cfg(target_os = "windows")]
    {
        "Windows: Settings > Privacy & Security > Microphone (allow access)."
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        "Check OS microphone permissions."
    }
}
