// src/landmarker.rs - Hand landmark model bring-up and per-frame detection
use crate::landmarks::{Handedness, Landmark, LANDMARK_COUNT};
use image::DynamicImage;
use nalgebra::{Matrix3, Matrix3x6, Matrix6, Vector3, Vector6};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LandmarkerError {
    #[error("hand landmarker model not found at {0}")]
    ModelNotFound(PathBuf),
    #[error("invalid landmarker option: {0}")]
    InvalidOption(String),
    #[error("failed to start detector process {program}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("detector did not signal ready, got {0:?}")]
    Handshake(String),
    #[error("detector I/O failed")]
    Io(#[from] std::io::Error),
    #[error("malformed detector response")]
    Protocol(#[from] serde_json::Error),
    #[error("detector reported: {0}")]
    Detector(String),
    #[error("detector closed its output")]
    Closed,
    #[error("detector sent no {waiting_for} within {after:?}")]
    Timeout { waiting_for: &'static str, after: Duration },
    #[error("video timestamps must increase: got {current} ms after {previous} ms")]
    NonMonotonicTimestamp { previous: u64, current: u64 },
    #[error("{call} is not available in {mode:?} running mode")]
    WrongRunningMode { call: &'static str, mode: RunningMode },
    #[error("landmark replay failed: {0}")]
    Replay(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunningMode {
    Image,
    Video,
}

impl RunningMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RunningMode::Image => "image",
            RunningMode::Video => "video",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BaseOptions {
    pub model_asset_path: PathBuf,
}

impl Default for BaseOptions {
    fn default() -> Self {
        Self {
            model_asset_path: PathBuf::from("models/hand_landmarker.task"),
        }
    }
}

/// Where landmarks come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// MediaPipe running in a helper process fed over stdin/stdout.
    Subprocess { python: PathBuf, script: PathBuf },
    /// Procedurally animated hands, no camera or model needed.
    Simulated,
    /// Frames previously exported to CSV.
    Replay { path: PathBuf, looping: bool },
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Subprocess {
            python: PathBuf::from(".venv/bin/python"),
            script: PathBuf::from("scripts/hand_detect.py"),
        }
    }
}

impl BackendConfig {
    /// Backends that need camera frames to produce landmarks.
    pub fn needs_frames(&self) -> bool {
        matches!(self, BackendConfig::Subprocess { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandLandmarkerOptions {
    pub base_options: BaseOptions,
    pub running_mode: RunningMode,
    pub num_hands: usize,
    pub min_hand_detection_confidence: f32,
    /// Kalman-smooth each landmark over time, per hand.
    pub smoothing: bool,
    pub backend: BackendConfig,
    /// Drop to simulated hands if the configured backend cannot start.
    pub fallback_to_simulation: bool,
    /// How long the helper process may take to load the model.
    pub startup_timeout_ms: u64,
    /// How long one frame may take to come back from the helper process.
    pub response_timeout_ms: u64,
}

impl Default for HandLandmarkerOptions {
    fn default() -> Self {
        Self {
            base_options: BaseOptions::default(),
            running_mode: RunningMode::Video,
            num_hands: 2,
            min_hand_detection_confidence: 0.5,
            smoothing: false,
            backend: BackendConfig::default(),
            fallback_to_simulation: true,
            startup_timeout_ms: 30_000,
            response_timeout_ms: 2_000,
        }
    }
}

impl HandLandmarkerOptions {
    fn validate(&self) -> Result<(), LandmarkerError> {
        if self.num_hands == 0 {
            return Err(LandmarkerError::InvalidOption("num_hands must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.min_hand_detection_confidence) {
            return Err(LandmarkerError::InvalidOption(format!(
                "min_hand_detection_confidence must be within 0..=1, got {}",
                self.min_hand_detection_confidence
            )));
        }
        Ok(())
    }
}

/// One hand as the detector reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedHand {
    pub handedness: String,
    pub score: f32,
    pub landmarks: Vec<Landmark>,
}

/// Per-frame output, laid out as parallel arrays the way the model
/// returns them: `handedness[i]` and `scores[i]` describe `landmarks[i]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandLandmarkerResult {
    pub landmarks: Vec<Vec<Landmark>>,
    pub handedness: Vec<String>,
    pub scores: Vec<f32>,
}

impl HandLandmarkerResult {
    pub fn from_hands(hands: Vec<DetectedHand>) -> Self {
        let mut result = Self::default();
        for hand in hands {
            result.landmarks.push(hand.landmarks);
            result.handedness.push(hand.handedness);
            result.scores.push(hand.score);
        }
        result
    }

    pub fn len(&self) -> usize {
        self.landmarks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.landmarks.is_empty()
    }

    pub fn hands(&self) -> impl Iterator<Item = (Handedness, &[Landmark], f32)> + '_ {
        self.landmarks.iter().enumerate().map(|(i, lms)| {
            (
                Handedness::from_label(self.handedness.get(i).map(String::as_str)),
                lms.as_slice(),
                self.scores.get(i).copied().unwrap_or(0.0),
            )
        })
    }

    /// Landmark `index` of the first hand that has one.
    pub fn first_landmark(&self, index: usize) -> Option<&Landmark> {
        self.landmarks.iter().find_map(|lms| lms.get(index))
    }
}

/// A source of raw hand detections.
pub trait LandmarkBackend: Send {
    fn name(&self) -> &'static str;

    fn detect(&mut self, frame: Option<&DynamicImage>, timestamp_ms: u64) -> Result<Vec<DetectedHand>, LandmarkerError>;
}

// ─── Subprocess backend ─────────────────────────────────────────────────────

#[derive(Deserialize, Debug)]
struct DetectionResponse {
    #[serde(default)]
    hands: Vec<DetectedHand>,
    #[serde(default)]
    error: Option<String>,
}

/// MediaPipe hand landmarker hosted by a helper script.
///
/// Request: `width u32 LE, height u32 LE, channels u32 LE, timestamp_ms u64 LE`
/// followed by `width * height * channels` RGB bytes.
/// Response: one JSON line `{"hands":[...],"error":null}`.
///
/// Stdout is read on its own thread so every wait has a deadline.
pub struct SubprocessBackend {
    process: Child,
    lines: Receiver<std::io::Result<String>>,
    response_timeout: Duration,
}

impl SubprocessBackend {
    pub fn spawn(python: &Path, script: &Path, options: &HandLandmarkerOptions) -> Result<Self, LandmarkerError> {
        let model = &options.base_options.model_asset_path;
        if !model.exists() {
            return Err(LandmarkerError::ModelNotFound(model.to_path_buf()));
        }
        if !script.exists() {
            return Err(LandmarkerError::InvalidOption(format!(
                "detector script not found at {}",
                script.display()
            )));
        }

        tracing::info!(
            python = %python.display(),
            script = %script.display(),
            mode = options.running_mode.as_str(),
            "starting hand detector subprocess"
        );

        let mut process = Command::new(python)
            .arg(script)
            .arg("--model")
            .arg(model)
            .arg("--num-hands")
            .arg(options.num_hands.to_string())
            .arg("--running-mode")
            .arg(options.running_mode.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| LandmarkerError::Spawn {
                program: python.to_path_buf(),
                source,
            })?;

        match Self::handshake(&mut process, Duration::from_millis(options.startup_timeout_ms)) {
            Ok(lines) => {
                tracing::info!("hand detector ready");
                Ok(Self {
                    process,
                    lines,
                    response_timeout: Duration::from_millis(options.response_timeout_ms),
                })
            }
            Err(e) => {
                let _ = process.kill();
                let _ = process.wait();
                Err(e)
            }
        }
    }

    fn handshake(process: &mut Child, timeout: Duration) -> Result<Receiver<std::io::Result<String>>, LandmarkerError> {
        let stdout = process.stdout.take().ok_or(LandmarkerError::Closed)?;
        let lines = spawn_line_reader(stdout)?;

        let ready_line = next_line(&lines, timeout, "READY line")?;
        if ready_line.trim() != "READY" {
            return Err(LandmarkerError::Handshake(ready_line.trim().to_string()));
        }
        Ok(lines)
    }
}

/// Forward stdout line by line. The channel disconnects at end of stream.
fn spawn_line_reader(stdout: ChildStdout) -> std::io::Result<Receiver<std::io::Result<String>>> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("hand-detector-stdout".into())
        .spawn(move || {
            let mut reader = BufReader::new(stdout);
            loop {
                let mut line = String::new();
                match reader.read_line(&mut line) {
                    Ok(0) => break,
                    Ok(_) => {
                        if tx.send(Ok(line)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        break;
                    }
                }
            }
        })?;
    Ok(rx)
}

fn next_line(
    lines: &Receiver<std::io::Result<String>>,
    timeout: Duration,
    waiting_for: &'static str,
) -> Result<String, LandmarkerError> {
    match lines.recv_timeout(timeout) {
        Ok(line) => Ok(line?),
        Err(RecvTimeoutError::Timeout) => Err(LandmarkerError::Timeout {
            waiting_for,
            after: timeout,
        }),
        Err(RecvTimeoutError::Disconnected) => Err(LandmarkerError::Closed),
    }
}

fn write_request(out: &mut impl Write, frame: &DynamicImage, timestamp_ms: u64) -> std::io::Result<()> {
    let rgb = frame.to_rgb8();
    out.write_all(&rgb.width().to_le_bytes())?;
    out.write_all(&rgb.height().to_le_bytes())?;
    out.write_all(&3u32.to_le_bytes())?;
    out.write_all(&timestamp_ms.to_le_bytes())?;
    out.write_all(rgb.as_raw())?;
    out.flush()
}

fn parse_response(line: &str) -> Result<Vec<DetectedHand>, LandmarkerError> {
    let response: DetectionResponse = serde_json::from_str(line.trim())?;
    match response.error {
        Some(error) => Err(LandmarkerError::Detector(error)),
        None => Ok(response.hands),
    }
}

impl LandmarkBackend for SubprocessBackend {
    fn name(&self) -> &'static str {
        "mediapipe"
    }

    fn detect(&mut self, frame: Option<&DynamicImage>, timestamp_ms: u64) -> Result<Vec<DetectedHand>, LandmarkerError> {
        let Some(frame) = frame else {
            return Ok(Vec::new());
        };

        let stdin = self.process.stdin.as_mut().ok_or(LandmarkerError::Closed)?;
        write_request(stdin, frame, timestamp_ms)?;

        match next_line(&self.lines, self.response_timeout, "detection") {
            Ok(response) => parse_response(&response),
            Err(e) => {
                // A late reply would answer the wrong frame.
                let _ = self.process.kill();
                Err(e)
            }
        }
    }
}

impl Drop for SubprocessBackend {
    fn drop(&mut self) {
        let _ = self.process.kill();
        let _ = self.process.wait();
    }
}

// ─── Simulated backend ──────────────────────────────────────────────────────

/// Two hands waving and curling their fingers, for running without a
/// camera or model.
#[derive(Default)]
pub struct SimulatedBackend;

impl SimulatedBackend {
    /// Open right hand, wrist at the origin, image axes (y grows down).
    fn template() -> [(f32, f32, f32); LANDMARK_COUNT] {
        let mut points = [(0.0, 0.0, 0.0); LANDMARK_COUNT];
        for finger in 0..5 {
            for joint in 1..=4 {
                let j = joint as f32;
                let (angle, dist) = if finger == 0 {
                    (-0.9 - 0.15 * j, 0.05 + 0.04 * j)
                } else {
                    (-0.45 + 0.3 * finger as f32 - 0.3, 0.08 + 0.045 * j)
                };
                points[finger * 4 + joint] = (angle.sin() * dist, -angle.cos() * dist, -0.012 * j);
            }
        }
        points
    }

    fn hand(side: Handedness, t: f32) -> DetectedHand {
        let (center_x, phase, mirror) = match side {
            Handedness::Left => (0.68, 1.3, -1.0),
            Handedness::Right => (0.32, 0.0, 1.0),
        };
        let wave = 0.35 * (t * 1.2 + phase).sin();
        let curl = 0.5 * ((t * 0.8 + phase).sin() + 1.0) * 0.35;
        let (sin_w, cos_w) = wave.sin_cos();
        let wrist = (center_x + 0.04 * (t * 0.5 + phase).cos(), 0.78 + 0.03 * (t + phase).sin());

        let template = Self::template();
        let landmarks = template
            .iter()
            .enumerate()
            .map(|(i, &(dx, dy, dz))| {
                // Fingers (not the thumb) curl toward their knuckle.
                let (dx, dy) = if i >= 5 {
                    let mcp = template[i - (i - 1) % 4];
                    (dx + (mcp.0 - dx) * curl, dy + (mcp.1 - dy) * curl)
                } else {
                    (dx, dy)
                };
                let dx = dx * mirror;
                Landmark::new(
                    wrist.0 + dx * cos_w - dy * sin_w,
                    wrist.1 + dx * sin_w + dy * cos_w,
                    dz,
                )
            })
            .collect();

        DetectedHand {
            handedness: side.label().to_string(),
            score: 0.95,
            landmarks,
        }
    }
}

impl LandmarkBackend for SimulatedBackend {
    fn name(&self) -> &'static str {
        "simulation"
    }

    fn detect(&mut self, _frame: Option<&DynamicImage>, timestamp_ms: u64) -> Result<Vec<DetectedHand>, LandmarkerError> {
        let t = timestamp_ms as f32 / 1000.0;
        Ok(vec![Self::hand(Handedness::Right, t), Self::hand(Handedness::Left, t)])
    }
}

// ─── Smoothing ──────────────────────────────────────────────────────────────

/// Constant-velocity Kalman filter over one 3D point.
pub struct KalmanFilter {
    state: Vector6<f64>, // [x, y, z, vx, vy, vz]
    covariance: Matrix6<f64>,
    process_noise: Matrix6<f64>,
    measurement_noise: Matrix3<f64>,
    dt: f64,
    initialized: bool,
}

impl KalmanFilter {
    pub fn new() -> Self {
        let mut process_noise = Matrix6::identity() * 0.001;
        process_noise.fixed_view_mut::<3, 3>(3, 3).fill_diagonal(0.01);

        Self {
            state: Vector6::zeros(),
            covariance: Matrix6::identity(),
            process_noise,
            measurement_noise: Matrix3::identity() * 0.0005,
            dt: 1.0 / 30.0,
            initialized: false,
        }
    }

    pub fn predict(&mut self) {
        let mut f = Matrix6::identity();
        f.fixed_view_mut::<3, 3>(0, 3).fill_diagonal(self.dt);

        self.state = f * self.state;
        self.covariance = f * self.covariance * f.transpose() + self.process_noise;
    }

    pub fn update(&mut self, measurement: Vector3<f64>) {
        if !self.initialized {
            self.state.fixed_rows_mut::<3>(0).copy_from(&measurement);
            self.initialized = true;
            return;
        }

        let mut h = Matrix3x6::<f64>::zeros();
        h[(0, 0)] = 1.0;
        h[(1, 1)] = 1.0;
        h[(2, 2)] = 1.0;

        let innovation = measurement - h * self.state;
        let s = h * self.covariance * h.transpose() + self.measurement_noise;
        let Some(s_inv) = s.try_inverse() else {
            return;
        };
        let gain = self.covariance * h.transpose() * s_inv;

        self.state += gain * innovation;
        self.covariance = (Matrix6::identity() - gain * h) * self.covariance;
    }

    pub fn position(&self) -> Vector3<f64> {
        Vector3::new(self.state[0], self.state[1], self.state[2])
    }
}

impl Default for KalmanFilter {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Landmarker ─────────────────────────────────────────────────────────────

pub struct HandLandmarker {
    options: HandLandmarkerOptions,
    backend: Box<dyn LandmarkBackend>,
    last_timestamp_ms: Option<u64>,
    /// Keyed by label and by order among hands with that label.
    filters: HashMap<(Handedness, usize), Vec<KalmanFilter>>,
}

impl HandLandmarker {
    /// Bring up the configured backend. With `fallback_to_simulation`, a
    /// backend that fails to start is replaced by simulated hands.
    pub fn create_from_options(options: HandLandmarkerOptions) -> Result<Self, LandmarkerError> {
        options.validate()?;

        let backend: Box<dyn LandmarkBackend> = match Self::create_backend(&options) {
            Ok(backend) => backend,
            Err(e) if options.fallback_to_simulation => {
                tracing::warn!(error = %e, "hand landmarker unavailable, using simulated hands");
                Box::new(SimulatedBackend)
            }
            Err(e) => return Err(e),
        };

        Ok(Self::with_backend(options, backend))
    }

    fn create_backend(options: &HandLandmarkerOptions) -> Result<Box<dyn LandmarkBackend>, LandmarkerError> {
        Ok(match &options.backend {
            BackendConfig::Subprocess { python, script } => {
                Box::new(SubprocessBackend::spawn(python, script, options)?)
            }
            BackendConfig::Simulated => Box::new(SimulatedBackend),
            BackendConfig::Replay { path, looping } => Box::new(
                crate::recording::ReplayBackend::open(path, *looping)
                    .map_err(|e| LandmarkerError::Replay(format!("{e:#}")))?,
            ),
        })
    }

    pub fn with_backend(options: HandLandmarkerOptions, backend: Box<dyn LandmarkBackend>) -> Self {
        tracing::info!(
            backend = backend.name(),
            num_hands = options.num_hands,
            mode = ?options.running_mode,
            "hand landmarker created"
        );
        Self {
            options,
            backend,
            last_timestamp_ms: None,
            filters: HashMap::new(),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn options(&self) -> &HandLandmarkerOptions {
        &self.options
    }

    /// Detect hands in a still image. The helper process runs its model
    /// in image mode, where timestamps are not used.
    pub fn detect(&mut self, frame: &DynamicImage) -> Result<HandLandmarkerResult, LandmarkerError> {
        if self.options.running_mode != RunningMode::Image {
            return Err(LandmarkerError::WrongRunningMode {
                call: "detect",
                mode: self.options.running_mode,
            });
        }
        let hands = self.backend.detect(Some(frame), 0)?;
        Ok(self.postprocess(hands))
    }

    /// Detect hands in one video frame. Timestamps must strictly increase.
    /// Backends that synthesize landmarks accept `None` for the frame.
    pub fn detect_for_video(
        &mut self,
        frame: Option<&DynamicImage>,
        timestamp_ms: u64,
    ) -> Result<HandLandmarkerResult, LandmarkerError> {
        if self.options.running_mode != RunningMode::Video {
            return Err(LandmarkerError::WrongRunningMode {
                call: "detect_for_video",
                mode: self.options.running_mode,
            });
        }
        if let Some(previous) = self.last_timestamp_ms {
            if timestamp_ms <= previous {
                return Err(LandmarkerError::NonMonotonicTimestamp {
                    previous,
                    current: timestamp_ms,
                });
            }
        }
        self.last_timestamp_ms = Some(timestamp_ms);

        let hands = self.backend.detect(frame, timestamp_ms)?;
        Ok(self.postprocess(hands))
    }

    fn postprocess(&mut self, hands: Vec<DetectedHand>) -> HandLandmarkerResult {
        let min_score = self.options.min_hand_detection_confidence;
        let mut accepted: Vec<DetectedHand> = hands
            .into_iter()
            .filter(|hand| {
                if hand.landmarks.len() != LANDMARK_COUNT {
                    tracing::warn!(count = hand.landmarks.len(), "dropping hand with unexpected landmark count");
                    return false;
                }
                hand.score >= min_score
            })
            .take(self.options.num_hands)
            .collect();

        if self.options.smoothing {
            self.smooth(&mut accepted);
        }

        HandLandmarkerResult::from_hands(accepted)
    }

    fn smooth(&mut self, hands: &mut [DetectedHand]) {
        let mut keys: Vec<(Handedness, usize)> = Vec::with_capacity(hands.len());
        for hand in hands.iter() {
            let side = Handedness::from_label(Some(hand.handedness.as_str()));
            let ordinal = keys.iter().filter(|(seen, _)| *seen == side).count();
            keys.push((side, ordinal));
        }
        // A hand that left the frame starts fresh when it returns.
        self.filters.retain(|key, _| keys.contains(key));

        for (hand, key) in hands.iter_mut().zip(keys) {
            let filters = self
                .filters
                .entry(key)
                .or_insert_with(|| (0..LANDMARK_COUNT).map(|_| KalmanFilter::new()).collect());

            for (lm, filter) in hand.landmarks.iter_mut().zip(filters.iter_mut()) {
                filter.predict();
                filter.update(Vector3::new(lm.x as f64, lm.y as f64, lm.z as f64));
                let p = filter.position();
                *lm = Landmark::new(p.x as f32, p.y as f32, p.z as f32);
            }
        }
    }
}
