//! Microphone input via cpal
//!
//! The platform stream lives on a dedicated thread for its whole life;
//! that thread slices captured samples into little-endian s16 PCM
//! fragments at the configured cadence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::{debug, error, info};

use super::{AudioInput, CaptureEvent, CaptureSink};
use crate::error::{Result, SessionError};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Default input device capture
#[derive(Debug)]
pub struct MicInput {
    sample_rate: u32,
    interval: Duration,
    worker: Option<Worker>,
}

#[derive(Debug)]
struct Worker {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl MicInput {
    pub fn new(sample_rate: u32, interval: Duration) -> Self {
        Self {
            sample_rate,
            interval,
            worker: None,
        }
    }
}

impl AudioInput for MicInput {
    fn request_permission(&mut self) -> Result<()> {
        // Access is granted or refused when the stream is built; probing
        // the device here surfaces a missing device early.
        let host = cpal::default_host();
        host.default_input_device()
            .map(|_| ())
            .ok_or_else(|| SessionError::DeviceUnavailable("no default input device".to_string()))
    }

    fn start(&mut self, sink: CaptureSink) -> Result<()> {
        if self.is_active() {
            return Err(SessionError::AlreadyInProgress("capture"));
        }

        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let sample_rate = self.sample_rate;
        let interval = self.interval;
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();

        let handle = thread::Builder::new()
            .name("mic-input".to_string())
            .spawn(move || {
                let samples = Arc::new(Mutex::new(Vec::<i16>::new()));

                let stream = match open_stream(sample_rate, Arc::clone(&samples), sink.clone()) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                let mut last_emit = Instant::now();
                while flag.load(Ordering::SeqCst) {
                    thread::sleep(POLL_INTERVAL);
                    if last_emit.elapsed() >= interval {
                        emit(&samples, &sink);
                        last_emit = Instant::now();
                    }
                }

                drop(stream);
                // In-flight fragment, then the end marker
                emit(&samples, &sink);
                let _ = sink.send(CaptureEvent::Ended);
                debug!("mic input thread stopped");
            })
            .map_err(|e| SessionError::CaptureFailure(format!("failed to spawn mic thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!(sample_rate, "mic capture started");
                self.worker = Some(Worker { running, handle });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(SessionError::CaptureFailure(
                    "mic thread exited before starting".to_string(),
                ))
            }
        }
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(worker) = self.worker.take() {
            worker.running.store(false, Ordering::SeqCst);
            worker
                .handle
                .join()
                .map_err(|_| SessionError::CaptureFailure("mic thread panicked".to_string()))?;
            info!("mic capture stopped");
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.worker
            .as_ref()
            .map(|w| !w.handle.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for MicInput {
    // Signal only; `stop` is the joining path
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            debug!("dropping active MicInput, capture thread winds down on its own");
            worker.running.store(false, Ordering::SeqCst);
        }
    }
}

fn open_stream(
    sample_rate: u32,
    samples: Arc<Mutex<Vec<i16>>>,
    sink: CaptureSink,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| SessionError::DeviceUnavailable("no default input device".to_string()))?;

    info!(
        device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
        "using input device"
    );

    let config = cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let err_sink = sink.clone();
    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if let Ok(mut samples) = samples.lock() {
                    samples.extend(data.iter().map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16));
                }
            },
            move |err| {
                error!(%err, "mic stream error");
                let _ = err_sink.send(CaptureEvent::Error(err.to_string()));
            },
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => {
                SessionError::DeviceUnavailable(e.to_string())
            }
            other => classify_backend_error(other.to_string()),
        })?;

    stream
        .play()
        .map_err(|e| classify_backend_error(e.to_string()))?;

    Ok(stream)
}

/// Backends report refused access as free-form text
fn classify_backend_error(message: String) -> SessionError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized") {
        SessionError::PermissionDenied(message)
    } else {
        SessionError::CaptureFailure(message)
    }
}

fn emit(samples: &Mutex<Vec<i16>>, sink: &CaptureSink) {
    let taken = samples
        .lock()
        .map(|mut guard| std::mem::take(&mut *guard))
        .unwrap_or_default();
    if taken.is_empty() {
        return;
    }

    let bytes: Vec<u8> = taken.iter().flat_map(|s| s.to_le_bytes()).collect();
    let _ = sink.send(CaptureEvent::Fragment(bytes));
}
