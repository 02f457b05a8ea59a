// src/webcam.rs - Webcam capture via nokhwa
use anyhow::{Context, Result};
use image::DynamicImage;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{
    ApiBackend, CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution,
};
use nokhwa::Camera;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

const FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub index: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Flip frames horizontally before they reach the detector.
    pub mirror: bool,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            index: 0,
            width: 640,
            height: 480,
            fps: 30,
            mirror: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CameraInfo {
    pub index: String,
    pub name: String,
}

pub fn list_cameras() -> Result<Vec<CameraInfo>> {
    let cameras = nokhwa::query(ApiBackend::Auto).map_err(|e| anyhow::anyhow!("camera query failed: {e}"))?;
    Ok(cameras
        .into_iter()
        .map(|camera| CameraInfo {
            index: camera.index().to_string(),
            name: camera.human_name(),
        })
        .collect())
}

pub struct Webcam {
    camera: Camera,
    mirror: bool,
}

impl Webcam {
    /// Opens the camera, starts the stream and blocks until a first frame decodes.
    pub fn open(config: &CameraConfig) -> Result<Self> {
        let format = CameraFormat::new(
            Resolution::new(config.width, config.height),
            FrameFormat::MJPEG,
            config.fps,
        );
        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(format));

        let mut camera = Camera::new(CameraIndex::Index(config.index), requested)
            .map_err(|e| anyhow::anyhow!("failed to open camera {}: {e}", config.index))?;
        camera
            .open_stream()
            .map_err(|e| anyhow::anyhow!("failed to open camera stream: {e}"))?;

        let mut webcam = Self {
            camera,
            mirror: config.mirror,
        };

        let started = Instant::now();
        loop {
            match webcam.read_frame() {
                Ok(_) => break,
                Err(e) if started.elapsed() < FIRST_FRAME_TIMEOUT => {
                    tracing::debug!(error = %e, "waiting for first camera frame");
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => return Err(e).context("camera produced no frames"),
            }
        }

        let resolution = webcam.resolution();
        tracing::info!(
            index = config.index,
            width = resolution.0,
            height = resolution.1,
            fps = webcam.camera.frame_rate(),
            "camera stream started"
        );
        Ok(webcam)
    }

    pub fn read_frame(&mut self) -> Result<DynamicImage> {
        let frame = self
            .camera
            .frame()
            .map_err(|e| anyhow::anyhow!("failed to capture frame: {e}"))?;
        let decoded = frame
            .decode_image::<RgbFormat>()
            .map_err(|e| anyhow::anyhow!("failed to decode frame: {e}"))?;

        let rgb = if self.mirror {
            image::imageops::flip_horizontal(&decoded)
        } else {
            decoded
        };
        Ok(DynamicImage::ImageRgb8(rgb))
    }

    pub fn resolution(&self) -> (u32, u32) {
        let resolution = self.camera.resolution();
        (resolution.width(), resolution.height())
    }
}

impl Drop for Webcam {
    fn drop(&mut self) {
        if let Err(e) = self.camera.stop_stream() {
            tracing::warn!(error = %e, "failed to stop camera stream");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_fill_missing_fields() {
        let config: CameraConfig = serde_json::from_str(r#"{"index": 2, "mirror": true}"#).unwrap();
        assert_eq!(config.index, 2);
        assert!(config.mirror);
        assert_eq!((config.width, config.height, config.fps), (640, 480, 30));
    }
}
