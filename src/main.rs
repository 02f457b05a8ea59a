// src/main.rs
mod app;
mod config;
mod landmarker;
mod landmarks;
mod pipeline;
mod recording;
mod scene;
mod ui;
mod viewport;
mod visualizer;
mod webcam;

use anyhow::Result;
use config::AppConfig;
use eframe::egui;

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    if let Ok(p) = std::env::current_exe() {
        tracing::debug!(path = %p.display(), "starting");
    }

    match webcam::list_cameras() {
        Ok(cameras) => {
            tracing::info!(count = cameras.len(), "cameras detected");
            for camera in &cameras {
                tracing::info!(index = %camera.index, name = %camera.name, "camera");
            }
        }
        Err(e) => tracing::warn!(error = %e, "failed to query cameras"),
    }

    let config = AppConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "invalid config, using defaults");
        AppConfig::default()
    });

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([1400.0, 900.0])
            .with_min_inner_size([960.0, 640.0]),
        centered: true,
        // The 3D view draws with three-d on eframe's OpenGL context.
        renderer: eframe::Renderer::Glow,
        ..Default::default()
    };

    eframe::run_native(
        "Hand Visualizer",
        options,
        Box::new(move |cc| Box::new(app::HandVisualizerApp::new(cc, config))),
    )
    .map_err(|e| anyhow::anyhow!("failed to run application: {e}"))
}
