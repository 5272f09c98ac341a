//! Speaker playback: a ring-buffer-fed cpal output stream.
//!
//! Server audio arrives as base64 PCM16 at 24 kHz; each payload is
//! normalized, resampled to the device rate, and appended to a lock-free
//! ring buffer that the output callback drains (zero-filling on underrun).
//! Appending serializes chunks in arrival order, which matches how the
//! upstream protocol emits them. Playback failures are never surfaced to the
//! caller: response audio is fire-and-forget, so every error path here logs
//! and returns.

use super::PLAYBACK_SAMPLE_RATE;
use super::pcm::{self, ResampleBuffer};
use crate::error::VoiceError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc as std_mpsc};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Ring capacity in seconds of device-rate audio. Generous enough that a
/// long model turn never overruns while the device drains in real time.
const QUEUE_SECONDS: usize = 30;

struct PlaybackShared {
    producer: HeapProd<f32>,
    /// Cached 24 kHz -> device rate resampler; payload chunks stream through
    /// it so leftovers carry across chunk boundaries.
    resampler: ResampleBuffer,
    device_rate: u32,
}

struct PlaybackWorker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Renders returned audio to the default output device.
pub struct AudioPlayback {
    shared: Mutex<Option<PlaybackShared>>,
    worker: Mutex<Option<PlaybackWorker>>,
}

impl AudioPlayback {
    pub fn new() -> Self {
        Self {
            shared: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// Acquires the output device and starts the render thread. Idempotent;
    /// calling again while initialized is a no-op.
    pub fn initialize(&self) -> Result<(), VoiceError> {
        let mut worker_slot = self
            .worker
            .lock()
            .map_err(|_| VoiceError::Init("playback state poisoned".into()))?;
        if worker_slot.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            return Ok(());
        }

        let host = cpal::default_host();
        let device = host.default_output_device().ok_or_else(|| {
            VoiceError::UnsupportedPlatform("no default output device available".into())
        })?;
        let default_config = device
            .default_output_config()
            .map_err(|e| VoiceError::Init(e.to_string()))?;
        let format = default_config.sample_format();
        let config: StreamConfig = default_config.into();
        let device_rate = config.sample_rate.0;

        let ring = HeapRb::<f32>::new(device_rate as usize * QUEUE_SECONDS);
        let (producer, consumer) = ring.split();

        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_thread = stop.clone();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), VoiceError>>();

        let handle = std::thread::Builder::new()
            .name("audio-playback".into())
            .spawn(move || {
                playback_thread(device, config, format, consumer, stop_for_thread, ready_tx);
            })
            .map_err(|e| VoiceError::Init(e.to_string()))?;

        match ready_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                stop.store(true, Ordering::Relaxed);
                let _ = handle.join();
                return Err(VoiceError::Init(
                    "timed out waiting for the output stream to start".into(),
                ));
            }
        }

        let resampler = ResampleBuffer::new(PLAYBACK_SAMPLE_RATE, device_rate, 512)
            .map_err(|e| VoiceError::Init(e.to_string()))?;
        *self
            .shared
            .lock()
            .map_err(|_| VoiceError::Init("playback state poisoned".into()))? =
            Some(PlaybackShared {
                producer,
                resampler,
                device_rate,
            });
        *worker_slot = Some(PlaybackWorker { stop, handle });
        info!(device_rate, "audio playback initialized");
        Ok(())
    }

    /// Queues raw little-endian PCM16 for immediate rendering.
    ///
    /// Never fails: malformed input, an unavailable device, and queue
    /// overflow are all logged and otherwise ignored.
    pub fn play_pcm(&self, bytes: &[u8], sample_rate: u32) {
        if let Err(e) = self.initialize() {
            warn!(error = %e, "cannot play audio without an output device");
            return;
        }
        let samples = pcm::pcm16_bytes_to_f32(bytes);
        if samples.is_empty() {
            debug!("empty PCM payload; nothing to play");
            return;
        }
        self.enqueue(&samples, sample_rate);
    }

    /// Decodes a WAV container and queues it for rendering once,
    /// end-to-end. Decode failures are logged and otherwise ignored.
    pub fn play_encoded(&self, bytes: &[u8]) {
        if let Err(e) = self.initialize() {
            warn!(error = %e, "cannot play audio without an output device");
            return;
        }
        let reader = match hound::WavReader::new(Cursor::new(bytes)) {
            Ok(reader) => reader,
            Err(e) => {
                warn!(error = %e, "failed to decode audio container; payload skipped");
                return;
            }
        };
        let spec = reader.spec();
        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Int => reader
                .into_samples::<i16>()
                .filter_map(Result::ok)
                .map(|s| (s as f32 / 32768.0).clamp(-1.0, 1.0))
                .collect(),
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .filter_map(Result::ok)
                .collect(),
        };
        let mono = pcm::downmix_to_mono(&interleaved, usize::from(spec.channels.max(1)));
        self.enqueue(&mono, spec.sample_rate);
    }

    fn enqueue(&self, samples: &[f32], sample_rate: u32) {
        let mut guard = match self.shared.lock() {
            Ok(guard) => guard,
            Err(_) => {
                warn!("playback state poisoned; payload skipped");
                return;
            }
        };
        let Some(shared) = guard.as_mut() else {
            warn!("playback not initialized; payload skipped");
            return;
        };

        let device_samples = if sample_rate == PLAYBACK_SAMPLE_RATE {
            shared.resampler.push(samples)
        } else if sample_rate == shared.device_rate {
            samples.to_vec()
        } else {
            // Off-protocol rate (container audio): one-shot resample.
            match ResampleBuffer::new(sample_rate, shared.device_rate, 512) {
                Ok(mut r) => {
                    let mut out = r.push(samples);
                    out.extend(r.flush());
                    out
                }
                Err(e) => {
                    warn!(error = %e, "failed to resample payload; skipped");
                    return;
                }
            }
        };

        let pushed = shared.producer.push_slice(&device_samples);
        if pushed < device_samples.len() {
            warn!(
                dropped = device_samples.len() - pushed,
                "playback queue full; samples dropped"
            );
        }
    }

    /// Stops rendering and releases the output device. Idempotent.
    pub fn cleanup(&self) {
        if let Ok(mut guard) = self.shared.lock() {
            guard.take();
        }
        let worker = match self.worker.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => return,
        };
        if let Some(worker) = worker {
            worker.stop.store(true, Ordering::Relaxed);
            if worker.handle.join().is_err() {
                warn!("playback thread panicked during shutdown");
            }
            info!("audio playback released");
        }
    }
}

impl Default for AudioPlayback {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Owns the cpal output stream for the lifetime of the playback worker.
/// Mono samples are duplicated across the device's channels; underruns
/// render silence.
fn playback_thread(
    device: cpal::Device,
    config: StreamConfig,
    format: SampleFormat,
    mut consumer: HeapCons<f32>,
    stop: Arc<AtomicBool>,
    ready_tx: std_mpsc::Sender<Result<(), VoiceError>>,
) {
    let channels = usize::from(config.channels.max(1));
    let err_fn = |err| warn!(error = %err, "playback stream error");

    macro_rules! output_stream {
        ($ty:ty, $from_f32:expr) => {{
            device.build_output_stream(
                &config,
                move |data: &mut [$ty], _| {
                    for frame in data.chunks_mut(channels) {
                        let sample = consumer.try_pop().unwrap_or(0.0);
                        for out in frame.iter_mut() {
                            *out = $from_f32(sample);
                        }
                    }
                },
                err_fn,
                None,
            )
        }};
    }

    let stream = match format {
        SampleFormat::F32 => output_stream!(f32, |s| s),
        SampleFormat::I16 => output_stream!(i16, |s: f32| {
            (s * 32767.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16
        }),
        SampleFormat::U16 => {
            output_stream!(u16, |s: f32| { ((s + 1.0) * 32767.5).clamp(0.0, 65535.0) as u16 })
        }
        other => {
            let _ = ready_tx.send(Err(VoiceError::Init(format!(
                "unsupported output sample format: {other:?}"
            ))));
            return;
        }
    };
    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(VoiceError::Init(e.to_string())));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(VoiceError::Init(e.to_string())));
        return;
    }
    let _ = ready_tx.send(Ok(()));

    while !stop.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(50));
    }
    drop(stream);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleanup_is_idempotent_without_device() {
        let playback = AudioPlayback::new();
        playback.cleanup();
        playback.cleanup();
    }

    #[test]
    fn test_play_pcm_without_device_is_non_fatal() {
        // On hosts without an output device this exercises the log-only
        // failure path; with a device it renders a short silent buffer.
        let playback = AudioPlayback::new();
        let silence = vec![0u8; 4800];
        playback.play_pcm(&silence, PLAYBACK_SAMPLE_RATE);
        playback.cleanup();
    }

    #[test]
    fn test_play_encoded_rejects_garbage_silently() {
        let playback = AudioPlayback::new();
        playback.play_encoded(b"definitely not a wav container");
        playback.cleanup();
    }
}
