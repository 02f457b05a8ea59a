// src/visualizer.rs - Positions pooled hand primitives from landmark frames
use crate::landmarker::HandLandmarkerResult;
use crate::landmarks::{
    Handedness, Landmark, PerHand, SceneMapping, BONES, BONE_COUNT, LANDMARK_COUNT, PALM_OUTLINE,
};
use crate::scene::{
    CameraPose, DirectionalLight, Geometry, Material, ObjectId, RingGeometry, Scene, SceneObject, ShapeGeometry,
    SpriteLabel,
};
use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::f32::consts::{FRAC_PI_2, TAU};
use std::time::{Duration, Instant};

/// Where idle landmark spheres wait, well outside the view.
pub const PARKED_COORDINATE: f32 = 999.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualizationConfig {
    pub mapping: SceneMapping,
    pub left_color: u32,
    pub right_color: u32,
    pub sphere_radius: f32,
    pub sphere_segments: u32,
    pub bone_radius: f32,
    pub bone_radial_segments: u32,
    pub bone_opacity: f32,
    pub palm_opacity: f32,
    pub ring_inner_radius: f32,
    pub ring_outer_radius: f32,
    pub ring_segments: u32,
    pub ring_color: u32,
    pub ring_opacity: f32,
    /// Hint text sits this far above the progress ring.
    pub text_offset: f32,
    pub hint_vertical_offset: f32,
    pub hint_duration_ms: u64,
    pub hint_font_px: f32,
    pub camera_position: [f32; 3],
    pub camera_target: [f32; 3],
    pub camera_fov_degrees: f32,
    pub camera_near: f32,
    pub camera_far: f32,
    pub light_position: [f32; 3],
}

impl Default for VisualizationConfig {
    fn default() -> Self {
        Self {
            mapping: SceneMapping::default(),
            left_color: 0xffc0cb,
            right_color: 0xadd8e6,
            sphere_radius: 0.08,
            sphere_segments: 12,
            bone_radius: 0.05,
            bone_radial_segments: 6,
            bone_opacity: 0.5,
            palm_opacity: 0.4,
            ring_inner_radius: 0.08,
            ring_outer_radius: 0.13,
            ring_segments: 64,
            ring_color: 0xffd700,
            ring_opacity: 0.9,
            text_offset: 0.4,
            hint_vertical_offset: 2.4,
            hint_duration_ms: 2000,
            hint_font_px: 32.0,
            camera_position: [0.0, 1.5, 4.5],
            camera_target: [0.0, 1.0, 0.0],
            camera_fov_degrees: 50.0,
            camera_near: 0.1,
            camera_far: 1000.0,
            light_position: [2.0, 2.0, 4.0],
        }
    }
}

impl VisualizationConfig {
    pub fn hand_color(&self, hand: Handedness) -> u32 {
        match hand {
            Handedness::Left => self.left_color,
            Handedness::Right => self.right_color,
        }
    }

    pub fn camera_pose(&self) -> CameraPose {
        CameraPose {
            position: Vector3::from(self.camera_position),
            target: Vector3::from(self.camera_target),
            fov_degrees: self.camera_fov_degrees,
            near: self.camera_near,
            far: self.camera_far,
        }
    }
}

struct HandPool {
    spheres: Vec<ObjectId>,
    bones: Vec<ObjectId>,
    palm: ObjectId,
}

pub struct HandVisualizer {
    scene: Scene,
    config: VisualizationConfig,
    pools: PerHand<HandPool>,
    progress_ring: ObjectId,
    progress_text: ObjectId,
    hint_deadline: Option<Instant>,
}

impl HandVisualizer {
    pub fn new(config: VisualizationConfig) -> Self {
        let mut scene = Scene::new(config.camera_pose());

        let pools = PerHand::new(|hand| Self::create_pool(&mut scene, &config, hand));

        scene.add_light(DirectionalLight {
            color: 0xffffff,
            intensity: 1.0,
            position: Vector3::from(config.light_position),
        });

        let mut ring = SceneObject::new(
            Geometry::Ring(Self::ring_sector(&config, TAU)),
            Material::basic(config.ring_color)
                .with_opacity(config.ring_opacity)
                .double_sided(),
        );
        ring.transform.rotate_x(FRAC_PI_2);
        ring.visible = false;
        let progress_ring = scene.add(ring);

        let mut text = SceneObject::new(
            Geometry::Sprite(SpriteLabel {
                text: String::new(),
                font_px: config.hint_font_px,
                canvas_width: 256,
                canvas_height: 64,
            }),
            Material::basic(0xffffff),
        );
        text.visible = false;
        let progress_text = scene.add(text);

        tracing::debug!(objects = scene.len(), "hand visualizer scene ready");

        Self {
            scene,
            config,
            pools,
            progress_ring,
            progress_text,
            hint_deadline: None,
        }
    }

    fn create_pool(scene: &mut Scene, config: &VisualizationConfig, hand: Handedness) -> HandPool {
        let color = config.hand_color(hand);

        let spheres = (0..LANDMARK_COUNT)
            .map(|_| {
                let mut sphere = SceneObject::new(
                    Geometry::Sphere {
                        radius: config.sphere_radius,
                        segments: config.sphere_segments,
                    },
                    Material::standard(color),
                );
                sphere.transform.position = Vector3::repeat(PARKED_COORDINATE);
                scene.add(sphere)
            })
            .collect();

        // Bones start hidden until the first frame places them.
        let bones = (0..BONE_COUNT)
            .map(|_| {
                let mut bone = SceneObject::new(
                    Geometry::Cylinder {
                        radius: config.bone_radius,
                        height: 1.0,
                        radial_segments: config.bone_radial_segments,
                    },
                    Material::standard(color).with_opacity(config.bone_opacity),
                );
                bone.visible = false;
                scene.add(bone)
            })
            .collect();

        let mut palm = SceneObject::new(
            Geometry::Shape(ShapeGeometry::placeholder()),
            Material::basic(color)
                .with_opacity(config.palm_opacity)
                .double_sided(),
        );
        palm.visible = false;
        let palm = scene.add(palm);

        HandPool { spheres, bones, palm }
    }

    fn ring_sector(config: &VisualizationConfig, theta_length: f32) -> RingGeometry {
        RingGeometry {
            inner_radius: config.ring_inner_radius,
            outer_radius: config.ring_outer_radius,
            theta_segments: config.ring_segments,
            theta_start: 0.0,
            theta_length,
        }
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    pub fn scene_mut(&mut self) -> &mut Scene {
        &mut self.scene
    }

    pub fn sphere(&self, hand: Handedness, landmark: usize) -> &SceneObject {
        self.scene.object(self.pools.get(hand).spheres[landmark])
    }

    pub fn bone(&self, hand: Handedness, bone: usize) -> &SceneObject {
        self.scene.object(self.pools.get(hand).bones[bone])
    }

    pub fn palm(&self, hand: Handedness) -> &SceneObject {
        self.scene.object(self.pools.get(hand).palm)
    }

    pub fn progress_ring(&self) -> &SceneObject {
        self.scene.object(self.progress_ring)
    }

    pub fn progress_text(&self) -> &SceneObject {
        self.scene.object(self.progress_text)
    }

    pub fn is_progress_ring_visible(&self) -> bool {
        self.progress_ring().visible
    }

    pub fn update_from_result(&mut self, result: &HandLandmarkerResult) -> Vec<Handedness> {
        self.update_hands(result.landmarks.as_slice(), result.handedness.as_slice())
    }

    /// Redraw both hands from one frame of model output.
    ///
    /// `handedness_list[i]` labels `landmarks_list[i]`; a missing label
    /// means the right hand. Only the first entry per hand is drawn.
    /// Returns the hands that were drawn, in input order.
    pub fn update_hands<L, H>(&mut self, landmarks_list: &[L], handedness_list: &[H]) -> Vec<Handedness>
    where
        L: AsRef<[Landmark]>,
        H: AsRef<str>,
    {
        self.reset_pools();

        let mut drawn = Vec::with_capacity(2);
        for (i, landmarks) in landmarks_list.iter().enumerate() {
            let hand = Handedness::from_label(handedness_list.get(i).map(AsRef::as_ref));
            if drawn.contains(&hand) {
                continue;
            }

            let landmarks = landmarks.as_ref();
            if landmarks.len() < LANDMARK_COUNT {
                tracing::warn!(
                    hand = %hand,
                    count = landmarks.len(),
                    "skipping hand with too few landmarks"
                );
                continue;
            }

            let points: Vec<Vector3<f32>> = landmarks[..LANDMARK_COUNT]
                .iter()
                .map(|lm| self.config.mapping.to_scene(lm))
                .collect();
            self.place_hand(hand, &points);
            drawn.push(hand);
        }
        drawn
    }

    fn reset_pools(&mut self) {
        let parked = Vector3::repeat(PARKED_COORDINATE);
        for hand in Handedness::BOTH {
            let pool = self.pools.get(hand);
            for &id in &pool.spheres {
                self.scene.object_mut(id).transform.position = parked;
            }
            for &id in &pool.bones {
                self.scene.object_mut(id).visible = false;
            }
            self.scene.object_mut(pool.palm).visible = false;
        }
    }

    fn place_hand(&mut self, hand: Handedness, points: &[Vector3<f32>]) {
        let pool = self.pools.get(hand);

        for (&id, point) in pool.spheres.iter().zip(points) {
            self.scene.object_mut(id).transform.position = *point;
        }

        for (&id, &(a, b)) in pool.bones.iter().zip(BONES.iter()) {
            let start = points[a];
            let end = points[b];
            let length = (end - start).norm();

            let bone = self.scene.object_mut(id);
            bone.transform.scale = Vector3::new(1.0, length, 1.0);
            bone.transform.position = (start + end) * 0.5;
            // Cylinders run along local Y; face Z at the end, then tip Z onto Y.
            bone.transform.look_at(&end);
            bone.transform.rotate_x(FRAC_PI_2);
            bone.visible = true;
        }

        // The palm is flattened onto z = 0.
        let outline: Vec<Vector2<f32>> = PALM_OUTLINE
            .iter()
            .chain(std::iter::once(&PALM_OUTLINE[0]))
            .map(|&idx| Vector2::new(points[idx].x, points[idx].y))
            .collect();
        let palm = self.scene.object_mut(pool.palm);
        palm.geometry = Geometry::Shape(ShapeGeometry::from_outline(outline));
        palm.transform.position = Vector3::zeros();
        palm.visible = true;
    }

    /// Show or hide the confirmation ring and its caption together. With a
    /// position, the ring also moves there (see `move_progress_ring`).
    pub fn show_progress_ring(&mut self, show: bool, position: Option<&Landmark>) {
        self.scene.object_mut(self.progress_ring).visible = show;
        self.scene.object_mut(self.progress_text).visible = show;

        if let Some(landmark) = position.filter(|_| show) {
            self.move_progress_ring(landmark);
        }
    }

    /// Put the ring over `landmark`, turned to the camera, without changing
    /// what is visible. The caption follows the ring unless a hint holds it.
    pub fn move_progress_ring(&mut self, landmark: &Landmark) {
        let anchor = self.config.mapping.to_scene(landmark);
        let camera_position = self.scene.camera.position;

        let ring = self.scene.object_mut(self.progress_ring);
        ring.transform.position = anchor;
        ring.transform.look_at(&camera_position);

        if self.hint_deadline.is_none() {
            let text_offset = self.config.text_offset;
            self.scene.object_mut(self.progress_text).transform.position =
                anchor + Vector3::new(0.0, text_offset, 0.0);
        }
    }

    /// Sweep the ring to `percent` of a full turn. Out-of-range values are
    /// clamped to 0..=100.
    pub fn set_progress(&mut self, percent: f32) {
        let percent = if percent.is_nan() { 0.0 } else { percent.clamp(0.0, 100.0) };
        let sector = Self::ring_sector(&self.config, percent / 100.0 * TAU);
        self.scene.object_mut(self.progress_ring).geometry = Geometry::Ring(sector);
    }

    pub fn show_hint_text(&mut self, message: &str, position: &Landmark) {
        self.show_hint_text_at(message, position, Instant::now());
    }

    /// Caption `message` above `position` until the hint duration elapses.
    /// A newer hint replaces the text and restarts the countdown.
    pub fn show_hint_text_at(&mut self, message: &str, position: &Landmark, now: Instant) {
        let anchor = self
            .config
            .mapping
            .to_scene_with_offset(position, self.config.hint_vertical_offset);

        let text = self.scene.object_mut(self.progress_text);
        if let Geometry::Sprite(label) = &mut text.geometry {
            label.text = message.to_owned();
        }
        text.transform.scale = Vector3::new(1.5, 0.375, 1.0);
        text.transform.position = anchor;
        text.visible = true;

        self.hint_deadline = Some(now + Duration::from_millis(self.config.hint_duration_ms));
        tracing::debug!(hint = message, "hint shown");
    }

    /// Expire a hint whose time is up. Call once per rendered frame.
    pub fn tick(&mut self, now: Instant) {
        if let Some(deadline) = self.hint_deadline {
            if now >= deadline {
                self.scene.object_mut(self.progress_text).visible = false;
                self.hint_deadline = None;
            }
        }
    }
}
