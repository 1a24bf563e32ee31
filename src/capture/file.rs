//! WAV file input
//!
//! Replays a WAV file's bytes as capture fragments, one fragment per
//! cadence interval of audio, on a dedicated thread. Concatenating every
//! fragment yields the original file.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::{AudioInput, CaptureEvent, CaptureSink};
use crate::error::{Result, SessionError};

/// How often the replay thread checks for a stop request
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Audio input backed by a WAV file on disk
#[derive(Debug)]
pub struct WavFileInput {
    path: PathBuf,
    data: Arc<Vec<u8>>,
    fragment_len: usize,
    interval: Duration,
    worker: Option<Worker>,
}

#[derive(Debug)]
struct Worker {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl WavFileInput {
    /// Open and validate a WAV file, sizing fragments to `interval` of audio
    pub fn open(path: impl AsRef<Path>, interval: Duration) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let data = std::fs::read(&path)
            .map_err(|e| SessionError::DeviceUnavailable(format!("{}: {e}", path.display())))?;

        let reader = hound::WavReader::new(Cursor::new(&data)).map_err(|e| {
            SessionError::CaptureFailure(format!("{} is not a WAV file: {e}", path.display()))
        })?;
        let spec = reader.spec();

        let bytes_per_second = spec.sample_rate as u128
            * spec.channels as u128
            * (spec.bits_per_sample as u128).div_ceil(8);
        let fragment_len = (bytes_per_second * interval.as_millis() / 1000).max(1) as usize;

        info!(
            path = %path.display(),
            sample_rate = spec.sample_rate,
            channels = spec.channels,
            bits = spec.bits_per_sample,
            fragment_len,
            "WAV input opened"
        );

        Ok(Self {
            path,
            data: Arc::new(data),
            fragment_len,
            interval,
            worker: None,
        })
    }

    /// Bytes carried by each fragment (the last one may be shorter)
    pub fn fragment_len(&self) -> usize {
        self.fragment_len
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AudioInput for WavFileInput {
    fn start(&mut self, sink: CaptureSink) -> Result<()> {
        if self.is_active() {
            return Err(SessionError::AlreadyInProgress("capture"));
        }
        // Reap a worker that ran to the end of the file
        if let Some(worker) = self.worker.take() {
            let _ = worker.handle.join();
        }

        let running = Arc::new(AtomicBool::new(true));
        let data = Arc::clone(&self.data);
        let fragment_len = self.fragment_len;
        let interval = self.interval;
        let flag = Arc::clone(&running);

        let handle = thread::Builder::new()
            .name("wav-input".to_string())
            .spawn(move || replay(&data, fragment_len, interval, &flag, &sink))
            .map_err(|e| SessionError::CaptureFailure(format!("failed to spawn input thread: {e}")))?;

        self.worker = Some(Worker { running, handle });
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(worker) = self.worker.take() {
            worker.running.store(false, Ordering::SeqCst);
            worker
                .handle
                .join()
                .map_err(|_| SessionError::CaptureFailure("input thread panicked".to_string()))?;
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

impl Drop for WavFileInput {
    // Signal only; `stop` is the joining path
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            debug!("dropping active WAV input, replay winds down on its own");
            worker.running.store(false, Ordering::SeqCst);
        }
    }
}

/// Emit one fragment per interval; on stop, emit the in-flight fragment
/// before `Ended`
fn replay(
    data: &[u8],
    fragment_len: usize,
    interval: Duration,
    running: &AtomicBool,
    sink: &CaptureSink,
) {
    for (index, chunk) in data.chunks(fragment_len).enumerate() {
        let due = Instant::now() + interval;
        while running.load(Ordering::SeqCst) && Instant::now() < due {
            thread::sleep(POLL_INTERVAL.min(interval));
        }

        if sink.send(CaptureEvent::Fragment(chunk.to_vec())).is_err() {
            warn!(index, "capture sink closed, ending replay");
            return;
        }

        if !running.load(Ordering::SeqCst) {
            debug!(index, "replay stopped early");
            break;
        }
    }

    let _ = sink.send(CaptureEvent::Ended);
}
