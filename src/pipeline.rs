// src/pipeline.rs - Capture and inference worker thread
use crate::landmarker::{
    HandLandmarker, HandLandmarkerOptions, HandLandmarkerResult, LandmarkerError, RunningMode, SimulatedBackend,
};
use crate::webcam::{CameraConfig, Webcam};
use image::RgbImage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Pace for backends that do not wait on a camera.
const FRAME_INTERVAL: Duration = Duration::from_millis(33);

/// Messages the UI has not drained yet. Newer frames are dropped past this.
const CHANNEL_CAPACITY: usize = 2;

/// How long `stop` waits for the worker before leaving it detached.
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

pub struct FrameUpdate {
    pub timestamp_ms: u64,
    /// Camera image the landmarks were detected on, if a camera is open.
    pub frame: Option<RgbImage>,
    pub result: HandLandmarkerResult,
    pub backend: &'static str,
    pub processing_time: Duration,
}

pub enum PipelineMessage {
    Frame(FrameUpdate),
    Error(String),
}

pub struct Pipeline {
    rx: Receiver<PipelineMessage>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Pipeline {
    pub fn spawn(camera: CameraConfig, mut tracker: HandLandmarkerOptions) -> Self {
        if tracker.running_mode != RunningMode::Video {
            tracing::debug!("pipeline runs the landmarker in video mode");
            tracker.running_mode = RunningMode::Video;
        }

        Self::start(move |tx, stop| run(camera, tracker, tx, stop))
    }

    fn start<F>(worker: F) -> Self
    where
        F: FnOnce(SyncSender<PipelineMessage>, Arc<AtomicBool>) + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(CHANNEL_CAPACITY);
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("hand-pipeline".into())
            .spawn(move || worker(tx, worker_stop));

        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::error!(error = %e, "failed to start pipeline thread");
                None
            }
        };

        Self { rx, stop, handle }
    }

    /// Everything the worker sent since the last call, oldest first.
    pub fn drain(&self) -> Vec<PipelineMessage> {
        self.rx.try_iter().collect()
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Signal the worker and wait up to `STOP_TIMEOUT` for it. A worker
    /// stuck in a camera or detector call is left to finish on its own.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        let Some(handle) = self.handle.take() else {
            return;
        };

        let deadline = Instant::now() + STOP_TIMEOUT;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                tracing::warn!("pipeline thread did not stop in time, detaching it");
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        if handle.join().is_err() {
            tracing::error!("pipeline thread panicked");
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(camera: CameraConfig, tracker: HandLandmarkerOptions, tx: SyncSender<PipelineMessage>, stop: Arc<AtomicBool>) {
    let mut landmarker = match HandLandmarker::create_from_options(tracker.clone()) {
        Ok(landmarker) => landmarker,
        Err(e) => {
            tracing::error!(error = %e, "failed to create hand landmarker");
            send(&tx, PipelineMessage::Error(e.to_string()));
            return;
        }
    };

    let mut webcam = None;
    if tracker.backend.needs_frames() {
        match Webcam::open(&camera) {
            Ok(cam) => webcam = Some(cam),
            Err(e) if tracker.fallback_to_simulation => {
                tracing::warn!(error = %format!("{e:#}"), "camera unavailable, using simulated hands");
                landmarker = HandLandmarker::with_backend(tracker.clone(), Box::new(SimulatedBackend));
            }
            Err(e) => {
                send(&tx, PipelineMessage::Error(format!("{e:#}")));
                return;
            }
        }
    }

    let started = Instant::now();
    let mut last_timestamp_ms = 0;

    while !stop.load(Ordering::Relaxed) {
        let tick = Instant::now();

        let frame = match webcam.as_mut() {
            Some(cam) => match cam.read_frame() {
                Ok(frame) => Some(frame),
                Err(e) => {
                    tracing::warn!(error = %e, "dropped camera frame");
                    thread::sleep(Duration::from_millis(10));
                    continue;
                }
            },
            None => None,
        };

        let timestamp_ms = next_timestamp(started.elapsed().as_millis() as u64, last_timestamp_ms);
        last_timestamp_ms = timestamp_ms;

        let message = match landmarker.detect_for_video(frame.as_ref(), timestamp_ms) {
            Ok(result) => PipelineMessage::Frame(FrameUpdate {
                timestamp_ms,
                frame: frame.map(|f| f.into_rgb8()),
                result,
                backend: landmarker.backend_name(),
                processing_time: tick.elapsed(),
            }),
            Err(e) => {
                tracing::warn!(error = %e, "hand detection failed");
                let fatal = is_fatal(&e);
                if !send(&tx, PipelineMessage::Error(e.to_string())) || fatal {
                    break;
                }
                continue;
            }
        };

        if !send(&tx, message) {
            break;
        }

        if webcam.is_none() {
            thread::sleep(FRAME_INTERVAL.saturating_sub(tick.elapsed()));
        }
    }

    tracing::info!("pipeline stopped");
}

/// Queue a message without blocking. A full queue drops it, since the UI
/// only shows the latest frame anyway. `false` once the UI hung up.
fn send(tx: &SyncSender<PipelineMessage>, message: PipelineMessage) -> bool {
    match tx.try_send(message) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            tracing::trace!("ui is behind, dropping pipeline message");
            true
        }
        Err(TrySendError::Disconnected(_)) => false,
    }
}

/// Strictly increasing millisecond timestamps even when the clock stalls.
fn next_timestamp(elapsed_ms: u64, last_ms: u64) -> u64 {
    elapsed_ms.max(last_ms + 1)
}

/// The detector process is gone (or was killed after a missed reply), so
/// every later call fails the same way.
fn is_fatal(error: &LandmarkerError) -> bool {
    matches!(
        error,
        LandmarkerError::Closed | LandmarkerError::Io(_) | LandmarkerError::Timeout { .. }
    )
}
