// src/recording.rs - Landmark session export and replay
use crate::landmarker::{DetectedHand, HandLandmarkerResult, LandmarkBackend, LandmarkerError};
use crate::landmarks::Landmark;
use anyhow::{Context, Result};
use chrono::Local;
use csv::{Reader, Writer};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// One landmark of one hand of one frame.
#[derive(Debug, Serialize, Deserialize)]
struct LandmarkRecord {
    frame: u64,
    timestamp_ms: u64,
    hand: usize,
    handedness: String,
    score: f32,
    landmark: usize,
    x: f32,
    y: f32,
    z: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedFrame {
    pub timestamp_ms: u64,
    pub hands: Vec<DetectedHand>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub output_directory: PathBuf,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output_directory: directories::UserDirs::new()
                .and_then(|dirs| dirs.document_dir().map(|p| p.join("HandVisualizer")))
                .unwrap_or_else(|| PathBuf::from("./output")),
        }
    }
}

pub struct LandmarkRecorder {
    output_dir: PathBuf,
    session_name: String,
    frames: Vec<RecordedFrame>,
}

impl LandmarkRecorder {
    pub fn new(output_dir: impl AsRef<Path>, session_name: Option<String>) -> Self {
        let session_name =
            session_name.unwrap_or_else(|| format!("session_{}", Local::now().format("%Y%m%d_%H%M%S")));

        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
            session_name,
            frames: Vec::new(),
        }
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn add_frame(&mut self, timestamp_ms: u64, result: &HandLandmarkerResult) {
        let hands = result
            .landmarks
            .iter()
            .enumerate()
            .map(|(i, landmarks)| DetectedHand {
                handedness: result.handedness.get(i).cloned().unwrap_or_default(),
                score: result.scores.get(i).copied().unwrap_or(0.0),
                landmarks: landmarks.clone(),
            })
            .collect();
        self.frames.push(RecordedFrame { timestamp_ms, hands });
    }

    pub fn export_csv(&self) -> Result<PathBuf> {
        let csv_path = self.output_dir.join(&self.session_name).join("landmarks.csv");

        if let Some(parent) = csv_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating recording directory {}", parent.display()))?;
        }

        let file = File::create(&csv_path).with_context(|| format!("creating {}", csv_path.display()))?;
        self.write_csv(file)?;

        tracing::info!(path = %csv_path.display(), frames = self.frames.len(), "landmark recording exported");
        Ok(csv_path)
    }

    /// Frames without hands produce no rows.
    pub fn write_csv<W: Write>(&self, out: W) -> Result<()> {
        let mut writer = Writer::from_writer(out);

        for (frame, recorded) in self.frames.iter().enumerate() {
            for (hand, detected) in recorded.hands.iter().enumerate() {
                for (landmark, lm) in detected.landmarks.iter().enumerate() {
                    writer.serialize(LandmarkRecord {
                        frame: frame as u64,
                        timestamp_ms: recorded.timestamp_ms,
                        hand,
                        handedness: detected.handedness.clone(),
                        score: detected.score,
                        landmark,
                        x: lm.x,
                        y: lm.y,
                        z: lm.z,
                    })?;
                }
            }
        }

        writer.flush()?;
        Ok(())
    }
}

pub fn read_recording(path: impl AsRef<Path>) -> Result<Vec<RecordedFrame>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("opening recording {}", path.display()))?;
    read_recording_from(file).with_context(|| format!("reading recording {}", path.display()))
}

pub fn read_recording_from<R: Read>(input: R) -> Result<Vec<RecordedFrame>> {
    struct HandRows {
        handedness: String,
        score: f32,
        landmarks: BTreeMap<usize, Landmark>,
    }

    let mut frames: BTreeMap<u64, (u64, BTreeMap<usize, HandRows>)> = BTreeMap::new();

    let mut reader = Reader::from_reader(input);
    for (row, record) in reader.deserialize::<LandmarkRecord>().enumerate() {
        let record = record.with_context(|| format!("row {}", row + 1))?;
        let (_, hands) = frames
            .entry(record.frame)
            .or_insert_with(|| (record.timestamp_ms, BTreeMap::new()));
        let hand = hands.entry(record.hand).or_insert_with(|| HandRows {
            handedness: record.handedness.clone(),
            score: record.score,
            landmarks: BTreeMap::new(),
        });
        hand.landmarks
            .insert(record.landmark, Landmark::new(record.x, record.y, record.z));
    }

    Ok(frames
        .into_values()
        .map(|(timestamp_ms, hands)| RecordedFrame {
            timestamp_ms,
            hands: hands
                .into_values()
                .map(|rows| DetectedHand {
                    handedness: rows.handedness,
                    score: rows.score,
                    landmarks: rows.landmarks.into_values().collect(),
                })
                .collect(),
        })
        .collect())
}

/// Plays a recording back frame by frame, one frame per detection call.
pub struct ReplayBackend {
    frames: Vec<RecordedFrame>,
    cursor: usize,
    looping: bool,
}

impl ReplayBackend {
    pub fn open(path: impl AsRef<Path>, looping: bool) -> Result<Self> {
        let frames = read_recording(path)?;
        anyhow::ensure!(!frames.is_empty(), "recording contains no hand frames");
        Ok(Self::from_frames(frames, looping))
    }

    pub fn from_frames(frames: Vec<RecordedFrame>, looping: bool) -> Self {
        Self {
            frames,
            cursor: 0,
            looping,
        }
    }
}

impl LandmarkBackend for ReplayBackend {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn detect(&mut self, _frame: Option<&DynamicImage>, _timestamp_ms: u64) -> Result<Vec<DetectedHand>, LandmarkerError> {
        if self.frames.is_empty() {
            return Ok(Vec::new());
        }
        if self.cursor >= self.frames.len() {
            if !self.looping {
                return Ok(Vec::new());
            }
            self.cursor = 0;
        }
        let hands = self.frames[self.cursor].hands.clone();
        self.cursor += 1;
        Ok(hands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::landmarks::LANDMARK_COUNT;

    fn result(labels: &[&str], x: f32) -> HandLandmarkerResult {
        HandLandmarkerResult::from_hands(
            labels
                .iter()
                .enumerate()
                .map(|(i, label)| DetectedHand {
                    handedness: label.to_string(),
                    score: 0.9,
                    landmarks: (0..LANDMARK_COUNT)
                        .map(|j| Landmark::new(x + i as f32 * 0.1, j as f32 * 0.01, -0.02))
                        .collect(),
                })
                .collect(),
        )
    }

    #[test]
    fn csv_preserves_frames_hands_and_landmark_order() {
        let mut recorder = LandmarkRecorder::new("unused", Some("test".into()));
        recorder.add_frame(33, &result(&["Left", "Right"], 0.2));
        recorder.add_frame(66, &HandLandmarkerResult::default());
        recorder.add_frame(99, &result(&["Right"], 0.4));

        let mut buf = Vec::new();
        recorder.write_csv(&mut buf).unwrap();
        let text = String::from_utf8(buf.clone()).unwrap();
        assert!(text.starts_with("frame,timestamp_ms,hand,handedness,score,landmark,x,y,z"));
        assert_eq!(text.lines().count(), 1 + 3 * LANDMARK_COUNT);

        let frames = read_recording_from(buf.as_slice()).unwrap();
        // The empty frame leaves no rows behind.
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].timestamp_ms, 33);
        assert_eq!(frames[0].hands.len(), 2);
        assert_eq!(frames[0].hands[1].handedness, "Right");
        assert_eq!(frames[1].timestamp_ms, 99);
        assert_eq!(frames[1].hands[0].landmarks.len(), LANDMARK_COUNT);
        assert_eq!(frames[1].hands[0].landmarks[20], Landmark::new(0.4, 20.0f32 * 0.01, -0.02));
    }

    #[test]
    fn rows_may_arrive_out_of_order() {
        let csv = "frame,timestamp_ms,hand,handedness,score,landmark,x,y,z\n\
                   1,20,0,Left,0.8,1,0.3,0.3,0.0\n\
                   0,10,0,Right,0.9,1,0.2,0.2,0.0\n\
                   1,20,0,Left,0.8,0,0.1,0.1,0.0\n";
        let frames = read_recording_from(csv.as_bytes()).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].hands[0].handedness, "Right");
        assert_eq!(frames[1].hands[0].landmarks[0], Landmark::new(0.1, 0.1, 0.0));
        assert_eq!(frames[1].hands[0].landmarks[1], Landmark::new(0.3, 0.3, 0.0));
    }

    #[test]
    fn malformed_rows_name_their_position() {
        let csv = "frame,timestamp_ms,hand,handedness,score,landmark,x,y,z\n0,10,0,Left,oops,0,0,0,0\n";
        let err = read_recording_from(csv.as_bytes()).unwrap_err();
        assert!(format!("{err:#}").contains("row 1"));
    }

    #[test]
    fn export_writes_session_directory() {
        let dir = std::env::temp_dir().join(format!("hand_visualizer_{}", uuid::Uuid::new_v4()));
        let mut recorder = LandmarkRecorder::new(&dir, Some("session_a".into()));
        recorder.add_frame(1, &result(&["Left"], 0.5));

        let path = recorder.export_csv().unwrap();
        assert_eq!(path, dir.join("session_a").join("landmarks.csv"));

        let mut replay = ReplayBackend::open(&path, false).unwrap();
        let hands = replay.detect(None, 1).unwrap();
        assert_eq!(hands.len(), 1);
        assert_eq!(hands[0].handedness, "Left");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn replay_stops_or_loops() {
        let frames = vec![
            RecordedFrame {
                timestamp_ms: 1,
                hands: vec![DetectedHand {
                    handedness: "Left".into(),
                    score: 1.0,
                    landmarks: vec![Landmark::default(); LANDMARK_COUNT],
                }],
            },
            RecordedFrame {
                timestamp_ms: 2,
                hands: Vec::new(),
            },
        ];

        let mut once = ReplayBackend::from_frames(frames.clone(), false);
        assert_eq!(once.detect(None, 0).unwrap().len(), 1);
        assert_eq!(once.detect(None, 0).unwrap().len(), 0);
        // Past the end a one-shot replay stays empty.
        assert_eq!(once.detect(None, 0).unwrap().len(), 0);
        assert_eq!(once.detect(None, 0).unwrap().len(), 0);

        let mut looping = ReplayBackend::from_frames(frames, true);
        looping.detect(None, 0).unwrap();
        looping.detect(None, 0).unwrap();
        assert_eq!(looping.detect(None, 0).unwrap().len(), 1);
    }

    #[test]
    fn empty_recording_cannot_be_replayed() {
        let dir = std::env::temp_dir().join(format!("hand_visualizer_{}", uuid::Uuid::new_v4()));
        let recorder = LandmarkRecorder::new(&dir, Some("empty".into()));
        let path = recorder.export_csv().unwrap();
        assert!(ReplayBackend::open(&path, false).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
