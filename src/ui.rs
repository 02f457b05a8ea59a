// src/ui.rs - Theme and custom widgets
use crate::landmarks::{Handedness, Landmark};
use eframe::egui::{self, Color32, Pos2, Rect, Stroke, Vec2};
use egui_extras::{Column, TableBuilder};
use image::RgbImage;

#[derive(Debug, Clone)]
pub struct Theme {
    pub primary: Color32,
    pub accent: Color32,
    pub background: Color32,
    pub surface: Color32,
    pub error: Color32,
    pub warning: Color32,
    pub success: Color32,
    pub text_primary: Color32,
    pub text_secondary: Color32,
}

impl Default for Theme {
    fn default() -> Self {
        Self {
            primary: Color32::from_rgb(70, 130, 240),
            accent: Color32::from_rgb(255, 215, 0),
            background: Color32::from_rgb(20, 20, 25),
            surface: Color32::from_rgb(30, 30, 35),
            error: Color32::from_rgb(244, 67, 54),
            warning: Color32::from_rgb(255, 152, 0),
            success: Color32::from_rgb(76, 175, 80),
            text_primary: Color32::WHITE,
            text_secondary: Color32::from_rgb(200, 200, 200),
        }
    }
}

impl Theme {
    pub fn visuals(&self) -> egui::Visuals {
        let mut visuals = egui::Visuals::dark();
        visuals.panel_fill = self.surface;
        visuals.window_fill = self.surface;
        visuals.extreme_bg_color = self.background;
        visuals.selection.bg_fill = self.primary;
        visuals
    }
}

pub fn color32(rgb: u32) -> Color32 {
    Color32::from_rgb((rgb >> 16) as u8, (rgb >> 8) as u8, rgb as u8)
}

/// Label tinted with the hand's scene color.
pub fn hand_label(ui: &mut egui::Ui, hand: Handedness, color: u32) {
    ui.label(egui::RichText::new(hand.label()).strong().color(color32(color)));
}

/// Circular gauge showing `percent` of a full turn, like the 3D ring.
pub fn progress_dial(ui: &mut egui::Ui, theme: &Theme, percent: f32, diameter: f32) {
    let (rect, _response) = ui.allocate_exact_size(Vec2::splat(diameter), egui::Sense::hover());
    let painter = ui.painter();
    let center = rect.center();
    let radius = diameter * 0.4;

    painter.circle_stroke(center, radius, Stroke::new(6.0, theme.surface));

    let sweep = percent.clamp(0.0, 100.0) / 100.0 * std::f32::consts::TAU;
    let start = -std::f32::consts::FRAC_PI_2;
    draw_arc(painter, center, radius, start, start + sweep, theme.accent, 6.0);

    painter.text(
        center,
        egui::Align2::CENTER_CENTER,
        format!("{:.0}%", percent),
        egui::FontId::proportional(14.0),
        theme.text_primary,
    );
}

pub fn draw_confidence_bar(ui: &mut egui::Ui, theme: &Theme, label: &str, value: f32) {
    ui.horizontal(|ui| {
        ui.label(label);

        let bar_width = 160.0;
        let bar_height = 16.0;
        let rect = ui.allocate_space(Vec2::new(bar_width, bar_height)).1;
        let painter = ui.painter();

        painter.rect_filled(rect, egui::Rounding::same(4.0), theme.background);

        let value = value.clamp(0.0, 1.0);
        let fill_rect = Rect::from_min_size(rect.min, Vec2::new(bar_width * value, bar_height));
        let color = if value > 0.7 {
            theme.success
        } else if value > 0.4 {
            theme.warning
        } else {
            theme.error
        };
        painter.rect_filled(fill_rect, egui::Rounding::same(4.0), color);

        painter.text(
            rect.center(),
            egui::Align2::CENTER_CENTER,
            format!("{:.0}%", value * 100.0),
            egui::FontId::proportional(11.0),
            theme.text_primary,
        );
    });
}

/// Points along an arc, `start_angle` to `end_angle` radians, screen y down.
pub fn arc_points(center: Pos2, radius: f32, start_angle: f32, end_angle: f32) -> Vec<Pos2> {
    let points_count = ((end_angle - start_angle).abs() * 50.0) as usize;
    if points_count == 0 {
        return Vec::new();
    }
    (0..=points_count)
        .map(|i| {
            let t = i as f32 / points_count as f32;
            let angle = start_angle + (end_angle - start_angle) * t;
            Pos2::new(center.x + radius * angle.cos(), center.y + radius * angle.sin())
        })
        .collect()
}

fn draw_arc(
    painter: &egui::Painter,
    center: Pos2,
    radius: f32,
    start_angle: f32,
    end_angle: f32,
    color: Color32,
    thickness: f32,
) {
    let points = arc_points(center, radius, start_angle, end_angle);
    if points.len() > 1 {
        painter.add(egui::Shape::line(points, Stroke::new(thickness, color)));
    }
}

/// Normalized coordinates of one hand, one row per landmark.
pub fn landmark_table(ui: &mut egui::Ui, id: &str, landmarks: &[Landmark]) {
    ui.push_id(id, |ui| {
        TableBuilder::new(ui)
            .striped(true)
            .max_scroll_height(220.0)
            .column(Column::exact(28.0))
            .columns(Column::remainder(), 3)
            .header(18.0, |mut header| {
                for title in ["#", "x", "y", "z"] {
                    header.col(|ui| {
                        ui.strong(title);
                    });
                }
            })
            .body(|mut body| {
                for (i, lm) in landmarks.iter().enumerate() {
                    body.row(16.0, |mut row| {
                        row.col(|ui| {
                            ui.label(i.to_string());
                        });
                        for value in [lm.x, lm.y, lm.z] {
                            row.col(|ui| {
                                ui.monospace(format!("{value:+.3}"));
                            });
                        }
                    });
                }
            });
    });
}

/// Camera preview backed by a single reusable texture.
#[derive(Default)]
pub struct PreviewWidget {
    texture: Option<egui::TextureHandle>,
    aspect_ratio: Option<f32>,
}

impl PreviewWidget {
    pub fn update_frame(&mut self, ctx: &egui::Context, frame: &RgbImage) {
        let size = [frame.width() as usize, frame.height() as usize];
        let image = egui::ColorImage::from_rgb(size, frame.as_raw());
        self.aspect_ratio = Some(frame.width() as f32 / frame.height().max(1) as f32);

        match self.texture.as_mut() {
            Some(texture) => texture.set(image, egui::TextureOptions::LINEAR),
            None => self.texture = Some(ctx.load_texture("camera_preview", image, egui::TextureOptions::LINEAR)),
        }
    }

    pub fn clear(&mut self) {
        self.texture = None;
        self.aspect_ratio = None;
    }

    pub fn show(&self, ui: &mut egui::Ui, theme: &Theme) {
        let width = ui.available_width();
        let height = width / self.aspect_ratio.unwrap_or(4.0 / 3.0);
        let (rect, _response) = ui.allocate_exact_size(Vec2::new(width, height), egui::Sense::hover());

        if let Some(texture) = &self.texture {
            ui.painter().image(
                texture.id(),
                rect,
                Rect::from_min_max(Pos2::ZERO, Pos2::new(1.0, 1.0)),
                Color32::WHITE,
            );
        } else {
            ui.painter().rect_filled(rect, egui::Rounding::same(4.0), theme.background);
            ui.painter().text(
                rect.center(),
                egui::Align2::CENTER_CENTER,
                "No camera frames",
                egui::FontId::proportional(14.0),
                theme.text_secondary,
            );
        }
    }
}
