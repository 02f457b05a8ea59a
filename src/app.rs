// src/app.rs
use crate::config::AppConfig;
use crate::landmarker::{BackendConfig, HandLandmarkerResult};
use crate::landmarks::{Handedness, Landmark, INDEX_FINGER_TIP};
use crate::pipeline::{Pipeline, PipelineMessage};
use crate::recording::LandmarkRecorder;
use crate::ui::{self, PreviewWidget, Theme};
use crate::viewport::HandViewport;
use crate::visualizer::HandVisualizer;

use chrono::{DateTime, Local};
use eframe::egui;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

const FPS_WINDOW: usize = 30;
/// Percent per second when the ring fills itself.
const AUTO_PROGRESS_RATE: f32 = 50.0;

struct FeedbackState {
    track_fingertip: bool,
    auto_progress: bool,
    progress: f32,
    hint_message: String,
}

impl Default for FeedbackState {
    fn default() -> Self {
        Self {
            track_fingertip: true,
            auto_progress: false,
            progress: 100.0,
            hint_message: "Hold still to confirm".to_string(),
        }
    }
}

impl FeedbackState {
    /// Drive the ring from this frame's fingertip. Visibility changes only
    /// when the fingertip appears or disappears, so a pending hint keeps
    /// its own countdown.
    fn update(&mut self, visualizer: &mut HandVisualizer, tip: Option<Landmark>, now: Instant, dt: f32) {
        let shown = visualizer.is_progress_ring_visible();
        match tip.filter(|_| self.track_fingertip) {
            Some(tip) if shown => visualizer.move_progress_ring(&tip),
            Some(tip) => visualizer.show_progress_ring(true, Some(&tip)),
            None if shown => visualizer.show_progress_ring(false, None),
            None => {}
        }

        if self.auto_progress && visualizer.is_progress_ring_visible() {
            self.progress += AUTO_PROGRESS_RATE * dt;
            if self.progress >= 100.0 {
                self.progress = 0.0;
                if let Some(tip) = tip {
                    visualizer.show_hint_text_at("Confirmed", &tip, now);
                }
            }
        }
        visualizer.set_progress(self.progress);
        visualizer.tick(now);
    }
}

pub struct HandVisualizerApp {
    config: AppConfig,
    theme: Theme,
    pipeline: Option<Pipeline>,
    visualizer: HandVisualizer,
    viewport: Result<HandViewport, String>,
    preview: PreviewWidget,

    latest_result: HandLandmarkerResult,
    backend_name: &'static str,
    processing_time: Duration,
    frame_times: VecDeque<Instant>,

    recorder: Option<LandmarkRecorder>,
    recording_start: Option<DateTime<Local>>,

    feedback: FeedbackState,
    show_settings: bool,
    status: Option<String>,
    last_error: Option<String>,
}

impl HandVisualizerApp {
    pub fn new(cc: &eframe::CreationContext<'_>, config: AppConfig) -> Self {
        let theme = Theme::default();
        cc.egui_ctx.set_visuals(theme.visuals());

        let visualizer = HandVisualizer::new(config.visualization.clone());
        let viewport = HandViewport::new(cc, theme.background).map_err(|e| {
            tracing::error!(error = %e, "3D view unavailable");
            e.to_string()
        });
        let pipeline = Pipeline::spawn(config.camera.clone(), config.tracker.clone());

        Self {
            config,
            theme,
            pipeline: Some(pipeline),
            visualizer,
            viewport,
            preview: PreviewWidget::default(),
            latest_result: HandLandmarkerResult::default(),
            backend_name: "starting",
            processing_time: Duration::ZERO,
            frame_times: VecDeque::with_capacity(FPS_WINDOW),
            recorder: None,
            recording_start: None,
            feedback: FeedbackState::default(),
            show_settings: false,
            status: None,
            last_error: None,
        }
    }

    fn restart_pipeline(&mut self) {
        // Dropping joins the old worker before a new one opens the camera.
        self.pipeline = None;
        self.preview.clear();
        self.frame_times.clear();
        self.latest_result = HandLandmarkerResult::default();
        self.visualizer.update_from_result(&self.latest_result);
        self.backend_name = "starting";
        self.last_error = None;
        self.pipeline = Some(Pipeline::spawn(self.config.camera.clone(), self.config.tracker.clone()));
    }

    fn stop_pipeline(&mut self) {
        if let Some(mut pipeline) = self.pipeline.take() {
            pipeline.stop();
        }
        self.backend_name = "stopped";
    }

    fn poll_pipeline(&mut self, ctx: &egui::Context) {
        let messages = match &self.pipeline {
            Some(pipeline) => pipeline.drain(),
            None => return,
        };

        let mut latest = None;
        for message in messages {
            match message {
                PipelineMessage::Frame(update) => {
                    if let Some(recorder) = self.recorder.as_mut() {
                        recorder.add_frame(update.timestamp_ms, &update.result);
                    }
                    if self.frame_times.len() == FPS_WINDOW {
                        self.frame_times.pop_front();
                    }
                    self.frame_times.push_back(Instant::now());
                    latest = Some(update);
                }
                PipelineMessage::Error(error) => self.last_error = Some(error),
            }
        }

        let Some(update) = latest else {
            return;
        };
        if let Some(frame) = &update.frame {
            self.preview.update_frame(ctx, frame);
        }
        self.visualizer.update_from_result(&update.result);
        self.backend_name = update.backend;
        self.processing_time = update.processing_time;
        self.latest_result = update.result;
    }

    fn update_feedback(&mut self, now: Instant, dt: f32) {
        let tip = self.latest_result.first_landmark(INDEX_FINGER_TIP).copied();
        self.feedback.update(&mut self.visualizer, tip, now, dt);
    }

    fn fps(&self) -> f32 {
        match (self.frame_times.front(), self.frame_times.back()) {
            (Some(first), Some(last)) if self.frame_times.len() > 1 => {
                let span = last.duration_since(*first).as_secs_f32();
                if span > 0.0 {
                    (self.frame_times.len() - 1) as f32 / span
                } else {
                    0.0
                }
            }
            _ => 0.0,
        }
    }

    fn toggle_recording(&mut self) {
        match self.recorder.take() {
            None => {
                let recorder = LandmarkRecorder::new(&self.config.recording.output_directory, None);
                tracing::info!(session = recorder.session_name(), "recording started");
                self.recorder = Some(recorder);
                self.recording_start = Some(Local::now());
            }
            Some(recorder) => {
                self.recording_start = None;
                if recorder.frame_count() == 0 {
                    self.status = Some("Recording discarded: no frames".to_string());
                    return;
                }
                match recorder.export_csv() {
                    Ok(path) => self.status = Some(format!("Saved {}", path.display())),
                    Err(e) => {
                        tracing::error!(error = %format!("{e:#}"), "recording export failed");
                        self.last_error = Some(format!("{e:#}"));
                    }
                }
            }
        }
    }

    fn open_replay(&mut self) {
        let Some(path) = rfd::FileDialog::new()
            .add_filter("Landmark recording", &["csv"])
            .set_directory(&self.config.recording.output_directory)
            .pick_file()
        else {
            return;
        };
        tracing::info!(path = %path.display(), "replaying recording");
        self.config.tracker.backend = BackendConfig::Replay { path, looping: true };
        self.restart_pipeline();
    }

    fn hint_anchor(&self) -> Landmark {
        self.latest_result
            .first_landmark(INDEX_FINGER_TIP)
            .copied()
            .unwrap_or(Landmark::new(0.5, 0.5, 0.0))
    }

    fn render_header(&mut self, ctx: &egui::Context) {
        egui::TopBottomPanel::top("header").show(ctx, |ui| {
            ui.add_space(6.0);
            egui::menu::bar(ui, |ui| {
                ui.heading("Hand Visualizer");
                ui.separator();

                ui.label(format!("Source: {}", self.backend_name));
                ui.label(format!("{:.1} fps", self.fps()));
                ui.label(format!("{:.1} ms", self.processing_time.as_secs_f32() * 1000.0));

                ui.separator();

                let running = self.pipeline.as_ref().is_some_and(Pipeline::is_running);
                if running {
                    if ui.button("⏹ Stop").clicked() {
                        self.stop_pipeline();
                    }
                } else if ui.button("▶ Start").clicked() {
                    self.restart_pipeline();
                }

                let record_label = if self.recorder.is_some() { "⏹ Stop Recording" } else { "⏺ Record" };
                let record_color = if self.recorder.is_some() { self.theme.error } else { self.theme.success };
                if ui.add(egui::Button::new(record_label).fill(record_color)).clicked() {
                    self.toggle_recording();
                }

                if ui.button("📁 Replay…").clicked() {
                    self.open_replay();
                }

                ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                    if ui.button("⚙ Settings").clicked() {
                        self.show_settings = !self.show_settings;
                    }
                    if ui.button("Reset view").clicked() {
                        self.visualizer.scene_mut().camera = self.config.visualization.camera_pose();
                    }
                });
            });
            ui.add_space(6.0);
        });
    }

    fn render_side_panel(&mut self, ctx: &egui::Context) {
        egui::SidePanel::right("details")
            .resizable(true)
            .default_width(340.0)
            .show(ctx, |ui| {
                egui::ScrollArea::vertical().show(ui, |ui| {
                    ui.heading("Camera");
                    self.preview.show(ui, &self.theme);

                    ui.add_space(10.0);
                    ui.heading("Hands");
                    if self.latest_result.is_empty() {
                        ui.colored_label(self.theme.text_secondary, "No hands detected");
                    }
                    let hands: Vec<(Handedness, Vec<Landmark>, f32)> = self
                        .latest_result
                        .hands()
                        .map(|(hand, landmarks, score)| (hand, landmarks.to_vec(), score))
                        .collect();
                    for (i, (hand, landmarks, score)) in hands.iter().enumerate() {
                        ui.group(|ui| {
                            ui::hand_label(ui, *hand, self.config.visualization.hand_color(*hand));
                            ui::draw_confidence_bar(ui, &self.theme, "Score", *score);
                            egui::CollapsingHeader::new("Landmarks")
                                .id_source(("landmarks", i))
                                .show(ui, |ui| ui::landmark_table(ui, hand.label(), landmarks));
                        });
                    }

                    ui.add_space(10.0);
                    ui.heading("Feedback");
                    self.render_feedback_panel(ui);
                });
            });
    }

    fn render_feedback_panel(&mut self, ui: &mut egui::Ui) {
        ui.checkbox(&mut self.feedback.track_fingertip, "Ring on index fingertip");
        ui.checkbox(&mut self.feedback.auto_progress, "Fill automatically");

        ui.horizontal(|ui| {
            ui::progress_dial(ui, &self.theme, self.feedback.progress, 64.0);
            ui.add(
                egui::Slider::new(&mut self.feedback.progress, 0.0..=100.0)
                    .text("Progress")
                    .suffix("%"),
            );
        });

        ui.horizontal(|ui| {
            ui.text_edit_singleline(&mut self.feedback.hint_message);
            if ui.button("Show hint").clicked() {
                let anchor = self.hint_anchor();
                self.visualizer.show_hint_text(&self.feedback.hint_message, &anchor);
            }
        });
    }

    fn render_status_bar(&mut self, ctx: &egui::Context) {
        egui::TopBottomPanel::bottom("status").show(ctx, |ui| {
            ui.horizontal(|ui| {
                if let Some(error) = &self.last_error {
                    ui.colored_label(self.theme.error, error);
                } else if let Some(status) = &self.status {
                    ui.colored_label(self.theme.text_secondary, status);
                }

                ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                    if let (Some(start), Some(recorder)) = (self.recording_start, self.recorder.as_ref()) {
                        let elapsed = Local::now().signed_duration_since(start).to_std().unwrap_or_default();
                        ui.colored_label(
                            self.theme.error,
                            format!(
                                "REC {:02}:{:02} · {} frames",
                                elapsed.as_secs() / 60,
                                elapsed.as_secs() % 60,
                                recorder.frame_count()
                            ),
                        );
                    }
                });
            });
        });
    }

    fn render_viewport(&mut self, ctx: &egui::Context) {
        egui::CentralPanel::default().show(ctx, |ui| match &mut self.viewport {
            Ok(viewport) => viewport.show(ui, self.visualizer.scene_mut()),
            Err(error) => {
                ui.centered_and_justified(|ui| {
                    ui.colored_label(self.theme.error, format!("3D view unavailable: {error}"));
                });
            }
        });
    }

    fn render_settings_window(&mut self, ctx: &egui::Context) {
        let mut open = self.show_settings;
        let mut apply = false;

        egui::Window::new("Settings")
            .open(&mut open)
            .resizable(true)
            .default_size([360.0, 420.0])
            .show(ctx, |ui| {
                ui.heading("Tracking");
                let tracker = &mut self.config.tracker;
                ui.add(egui::Slider::new(&mut tracker.num_hands, 1..=2).text("Hands"));
                ui.add(
                    egui::Slider::new(&mut tracker.min_hand_detection_confidence, 0.0..=1.0)
                        .step_by(0.01)
                        .text("Min confidence"),
                );
                ui.checkbox(&mut tracker.smoothing, "Kalman smoothing");
                ui.checkbox(&mut tracker.fallback_to_simulation, "Fall back to simulated hands");

                ui.horizontal(|ui| {
                    ui.label("Source:");
                    let is_live = matches!(tracker.backend, BackendConfig::Subprocess { .. });
                    if ui.selectable_label(is_live, "Camera").clicked() && !is_live {
                        tracker.backend = BackendConfig::default();
                    }
                    let is_simulated = matches!(tracker.backend, BackendConfig::Simulated);
                    if ui.selectable_label(is_simulated, "Simulated").clicked() {
                        tracker.backend = BackendConfig::Simulated;
                    }
                });

                ui.separator();
                ui.heading("Camera");
                let camera = &mut self.config.camera;
                ui.add(egui::DragValue::new(&mut camera.index).prefix("Index "));
                ui.checkbox(&mut camera.mirror, "Mirror");

                ui.separator();
                ui.heading("Output");
                ui.label(self.config.recording.output_directory.display().to_string());
                if ui.button("Browse…").clicked() {
                    if let Some(dir) = rfd::FileDialog::new().pick_folder() {
                        self.config.recording.output_directory = dir;
                    }
                }

                ui.separator();
                apply = ui.button("Apply and restart").clicked();
            });

        self.show_settings = open;
        if apply {
            self.restart_pipeline();
        }
    }
}

impl eframe::App for HandVisualizerApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.poll_pipeline(ctx);
        let dt = ctx.input(|i| i.stable_dt);
        self.update_feedback(Instant::now(), dt);

        self.render_header(ctx);
        self.render_status_bar(ctx);
        self.render_side_panel(ctx);

        if self.show_settings {
            self.render_settings_window(ctx);
        }

        self.render_viewport(ctx);

        ctx.request_repaint();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::visualizer::VisualizationConfig;

    fn tip(frame: u64) -> Landmark {
        Landmark::new(0.4 + frame as f32 * 0.002, 0.5, 0.0)
    }

    #[test]
    fn ring_shows_once_and_then_follows_the_fingertip() {
        let mut viz = HandVisualizer::new(VisualizationConfig::default());
        let mut feedback = FeedbackState::default();
        let now = Instant::now();

        feedback.update(&mut viz, Some(tip(0)), now, 0.033);
        assert!(viz.is_progress_ring_visible());
        let caption = viz.progress_text().transform.position;

        feedback.update(&mut viz, Some(tip(5)), now + Duration::from_millis(16), 0.016);
        assert!(viz.is_progress_ring_visible());
        assert!(viz.progress_text().transform.position != caption);

        feedback.update(&mut viz, None, now + Duration::from_millis(33), 0.033);
        assert!(!viz.is_progress_ring_visible());
        assert!(!viz.progress_text().visible);
    }

    #[test]
    fn confirmation_hint_hides_after_two_seconds_while_tracking() {
        let mut viz = HandVisualizer::new(VisualizationConfig::default());
        let mut feedback = FeedbackState {
            auto_progress: true,
            progress: 99.0,
            ..Default::default()
        };
        let start = Instant::now();

        // The first frame fills the ring and shows the hint.
        feedback.update(&mut viz, Some(tip(0)), start, 0.1);
        assert!(viz.progress_text().visible);
        feedback.auto_progress = false;

        for frame in 1..=90u64 {
            let now = start + Duration::from_millis(frame * 33);
            feedback.update(&mut viz, Some(tip(frame)), now, 0.033);
        }

        assert!(viz.is_progress_ring_visible());
        assert!(!viz.progress_text().visible);
    }
}
