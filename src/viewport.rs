// src/viewport.rs - three-d rendering of the hand scene inside an egui panel
use crate::scene::{CameraPose, Geometry, Material, RingGeometry, Scene, SceneObject, ShapeGeometry, SpriteLabel};
use crate::ui::color32;
use eframe::egui::{self, Color32, Pos2, Rect};
use nalgebra::{Matrix4, Rotation3, Vector3};
use std::f32::consts::FRAC_PI_2;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use three_d::{
    degrees, vec3, vec4, AmbientLight, Camera, ColorMaterial, Context, CpuMaterial, CpuMesh, Cull, Gm, Indices, Light,
    Mat4, Mesh, Object, PhysicalMaterial, Positions, RenderTarget, Srgba, Vec3, Viewport,
};

const ORBIT_DEGREES_PER_POINT: f32 = 0.5;
const ZOOM_SPEED: f32 = 0.002;
const PITCH_LIMIT: f32 = 89.0;
const MIN_DISTANCE: f32 = 0.5;
const MAX_DISTANCE: f32 = 50.0;
const AMBIENT_INTENSITY: f32 = 0.3;
const MIN_FONT_PX: f32 = 8.0;
const MAX_FONT_PX: f32 = 96.0;

#[derive(Error, Debug)]
pub enum ViewportError {
    #[error("no OpenGL context; the 3D view needs the glow renderer")]
    NoGlContext,

    #[error("failed to create 3D context: {0}")]
    Context(#[from] three_d::CoreError),
}

/// Yaw/pitch/distance view of a camera pose, in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrbitControls {
    pub yaw: f32,
    pub pitch: f32,
    pub distance: f32,
}

impl OrbitControls {
    pub fn from_pose(pose: &CameraPose) -> Self {
        let offset = pose.position - pose.target;
        let distance = offset.norm().max(MIN_DISTANCE);
        Self {
            yaw: offset.x.atan2(offset.z).to_degrees(),
            pitch: (offset.y / distance)
                .clamp(-1.0, 1.0)
                .asin()
                .to_degrees()
                .clamp(-PITCH_LIMIT, PITCH_LIMIT),
            distance,
        }
    }

    pub fn orbit(&mut self, delta_yaw: f32, delta_pitch: f32) {
        self.yaw += delta_yaw;
        self.pitch = (self.pitch + delta_pitch).clamp(-PITCH_LIMIT, PITCH_LIMIT);
    }

    pub fn zoom(&mut self, factor: f32) {
        if factor.is_finite() && factor > 0.0 {
            self.distance = (self.distance * factor).clamp(MIN_DISTANCE, MAX_DISTANCE);
        }
    }

    /// Move `pose` onto the orbit around its target.
    pub fn apply(&self, pose: &mut CameraPose) {
        let (yaw, pitch) = (self.yaw.to_radians(), self.pitch.to_radians());
        let direction = Vector3::new(pitch.cos() * yaw.sin(), pitch.sin(), pitch.cos() * yaw.cos());
        pose.position = pose.target + direction * self.distance;
    }
}

fn to_vec3(v: &Vector3<f32>) -> Vec3 {
    vec3(v.x, v.y, v.z)
}

fn to_mat4(m: &Matrix4<f32>) -> Mat4 {
    let columns: [[f32; 4]; 4] = (*m).into();
    Mat4::from(columns)
}

pub fn srgba(material: &Material) -> Srgba {
    let [r, g, b, a] = material.rgba();
    Srgba::new(r, g, b, a)
}

pub fn camera_for(pose: &CameraPose, viewport: Viewport) -> Camera {
    Camera::new_perspective(
        viewport,
        to_vec3(&pose.position),
        to_vec3(&pose.target),
        vec3(0.0, 1.0, 0.0),
        degrees(pose.fov_degrees),
        pose.near,
        pose.far,
    )
}

/// Where `world` lands inside `rect`. `None` behind the camera.
pub fn project_to_rect(camera: &Camera, rect: Rect, world: &Vector3<f32>) -> Option<Pos2> {
    let view_projection = *camera.projection() * *camera.view();
    let clip = view_projection * vec4(world.x, world.y, world.z, 1.0);
    if clip.w <= 1e-6 {
        return None;
    }
    let center = rect.center();
    Some(Pos2::new(
        center.x + clip.x / clip.w * rect.width() * 0.5,
        center.y - clip.y / clip.w * rect.height() * 0.5,
    ))
}

/// Model matrix for the three-d primitive behind `object`. Spheres are unit
/// spheres; three-d cylinders run along +X from 0 to 1 with unit radius and
/// are turned onto the scene's centered +Y axis.
pub fn model_matrix(object: &SceneObject) -> Matrix4<f32> {
    let base = object.transform.matrix();
    match &object.geometry {
        Geometry::Sphere { radius, .. } => base * Matrix4::new_scaling(*radius),
        Geometry::Cylinder { radius, height, .. } => {
            base * Matrix4::new_nonuniform_scaling(&Vector3::new(*radius, *height, *radius))
                * Matrix4::new_translation(&Vector3::new(0.0, -0.5, 0.0))
                * Rotation3::from_axis_angle(&Vector3::z_axis(), FRAC_PI_2).to_homogeneous()
        }
        _ => base,
    }
}

pub fn ring_mesh(ring: &RingGeometry) -> Option<CpuMesh> {
    let pairs = ring.vertex_pairs();
    if pairs.len() < 2 {
        return None;
    }
    let positions = pairs
        .iter()
        .flat_map(|(inner, outer)| [vec3(inner.x, inner.y, 0.0), vec3(outer.x, outer.y, 0.0)])
        .collect();
    let indices = (1..pairs.len() as u32)
        .flat_map(|i| {
            let (a, b, c, d) = (2 * i - 2, 2 * i - 1, 2 * i, 2 * i + 1);
            [a, b, d, a, d, c]
        })
        .collect();
    Some(CpuMesh {
        positions: Positions::F32(positions),
        indices: Indices::U32(indices),
        ..Default::default()
    })
}

pub fn palm_mesh(shape: &ShapeGeometry) -> Option<CpuMesh> {
    let triangles = shape.triangles();
    if triangles.is_empty() {
        return None;
    }
    Some(CpuMesh {
        positions: Positions::F32(shape.outline.iter().map(|p| vec3(p.x, p.y, 0.0)).collect()),
        indices: Indices::U32(triangles.into_iter().flatten().collect()),
        ..Default::default()
    })
}

fn cpu_mesh(geometry: &Geometry) -> Option<CpuMesh> {
    let mut mesh = match geometry {
        Geometry::Sphere { segments, .. } => CpuMesh::sphere(*segments),
        Geometry::Cylinder { radial_segments, .. } => CpuMesh::cylinder(*radial_segments),
        Geometry::Shape(shape) => palm_mesh(shape)?,
        Geometry::Ring(ring) => ring_mesh(ring)?,
        Geometry::Sprite(_) => return None,
    };
    if mesh.normals.is_none() {
        mesh.compute_normals();
    }
    Some(mesh)
}

enum GpuGm {
    Lit(Gm<Mesh, PhysicalMaterial>),
    Flat(Gm<Mesh, ColorMaterial>),
}

impl GpuGm {
    fn set_transformation(&mut self, transformation: Mat4) {
        match self {
            GpuGm::Lit(gm) => gm.set_transformation(transformation),
            GpuGm::Flat(gm) => gm.set_transformation(transformation),
        }
    }

    fn as_object(&self) -> &dyn Object {
        match self {
            GpuGm::Lit(gm) => gm,
            GpuGm::Flat(gm) => gm,
        }
    }
}

/// GPU copy of one scene object, rebuilt when its geometry or material changes.
struct GpuObject {
    gm: GpuGm,
    geometry: Geometry,
    material: Material,
    visible: bool,
}

impl GpuObject {
    fn build(context: &Context, object: &SceneObject) -> Option<Self> {
        let mesh = Mesh::new(context, &cpu_mesh(&object.geometry)?);
        let material = &object.material;
        let cpu_material = CpuMaterial {
            albedo: srgba(material),
            roughness: 0.6,
            metallic: 0.1,
            ..Default::default()
        };

        let gm = if material.lit {
            let mut physical = if material.is_transparent() {
                PhysicalMaterial::new_transparent(context, &cpu_material)
            } else {
                PhysicalMaterial::new_opaque(context, &cpu_material)
            };
            if material.double_sided {
                physical.render_states.cull = Cull::None;
            }
            GpuGm::Lit(Gm::new(mesh, physical))
        } else {
            let mut flat = if material.is_transparent() {
                ColorMaterial::new_transparent(context, &cpu_material)
            } else {
                ColorMaterial::new_opaque(context, &cpu_material)
            };
            if material.double_sided {
                flat.render_states.cull = Cull::None;
            }
            GpuGm::Flat(Gm::new(mesh, flat))
        };

        Some(Self {
            gm,
            geometry: object.geometry.clone(),
            material: material.clone(),
            visible: object.visible,
        })
    }
}

#[derive(Default)]
struct GpuScene {
    slots: Vec<Option<GpuObject>>,
    lights: Vec<three_d::DirectionalLight>,
    ambient: Option<AmbientLight>,
}

impl GpuScene {
    fn sync(&mut self, context: &Context, scene: &Scene) {
        self.slots.resize_with(scene.len(), || None);
        for (slot, object) in self.slots.iter_mut().zip(scene.objects()) {
            let stale = slot
                .as_ref()
                .map_or(true, |gpu| gpu.geometry != object.geometry || gpu.material != object.material);
            if stale {
                *slot = GpuObject::build(context, object);
            }
            if let Some(gpu) = slot {
                gpu.visible = object.visible;
                gpu.gm.set_transformation(to_mat4(&model_matrix(object)));
            }
        }

        if self.lights.len() != scene.lights().len() {
            self.lights = scene
                .lights()
                .iter()
                .map(|light| {
                    let [r, g, b] = [(light.color >> 16) as u8, (light.color >> 8) as u8, light.color as u8];
                    three_d::DirectionalLight::new(
                        context,
                        light.intensity,
                        Srgba::new(r, g, b, 255),
                        &to_vec3(&light.direction()),
                    )
                })
                .collect();
        }
        if self.ambient.is_none() {
            self.ambient = Some(AmbientLight::new(context, AMBIENT_INTENSITY, Srgba::WHITE));
        }
    }

    fn render(&self, context: &Context, camera: &Camera) {
        let objects: Vec<&dyn Object> = self
            .slots
            .iter()
            .flatten()
            .filter(|gpu| gpu.visible)
            .map(|gpu| gpu.gm.as_object())
            .collect();
        let mut lights: Vec<&dyn Light> = self.lights.iter().map(|light| light as &dyn Light).collect();
        if let Some(ambient) = &self.ambient {
            lights.push(ambient);
        }

        let viewport = camera.viewport();
        RenderTarget::screen(context, viewport.width, viewport.height).render(camera, objects.as_slice(), &lights);
    }
}

fn lock(gpu: &Mutex<GpuScene>) -> MutexGuard<'_, GpuScene> {
    gpu.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct LabelPlacement {
    pub pos: Pos2,
    pub size: f32,
}

/// Screen position and font size of a sprite label, sized by its world height.
pub fn label_placement(camera: &Camera, rect: Rect, object: &SceneObject, label: &SpriteLabel) -> Option<LabelPlacement> {
    if label.text.is_empty() {
        return None;
    }
    let center = object.transform.position;
    let top = object.transform.transform_point(&Vector3::new(0.0, 0.5, 0.0));
    let pos = project_to_rect(camera, rect, &center)?;
    let top = project_to_rect(camera, rect, &top)?;

    // The glyphs fill font_px of the label canvas.
    let sprite_height = (pos.y - top.y).abs() * 2.0;
    let size = sprite_height * label.font_px / label.canvas_height.max(1) as f32;
    Some(LabelPlacement {
        pos,
        size: size.clamp(MIN_FONT_PX, MAX_FONT_PX),
    })
}

/// The central 3D view: three-d draws the meshes through an egui paint
/// callback and egui draws sprite labels on top.
pub struct HandViewport {
    context: Context,
    gpu: Arc<Mutex<GpuScene>>,
    background: Color32,
}

impl HandViewport {
    pub fn new(cc: &eframe::CreationContext<'_>, background: Color32) -> Result<Self, ViewportError> {
        let gl = cc.gl.as_ref().ok_or(ViewportError::NoGlContext)?;
        let context = Context::from_gl_context(gl.clone())?;
        tracing::debug!("3D viewport ready");

        Ok(Self {
            context,
            gpu: Arc::new(Mutex::new(GpuScene::default())),
            background,
        })
    }

    /// Orbit on drag, zoom on scroll, then draw `scene`.
    pub fn show(&mut self, ui: &mut egui::Ui, scene: &mut Scene) {
        let (rect, response) = ui.allocate_exact_size(ui.available_size(), egui::Sense::click_and_drag());
        handle_input(ui, &response, &mut scene.camera);

        ui.painter().rect_filled(rect, egui::Rounding::same(4.0), self.background);

        lock(&self.gpu).sync(&self.context, scene);

        let context = self.context.clone();
        let gpu = Arc::clone(&self.gpu);
        let pose = scene.camera.clone();

        let callback = egui::PaintCallback {
            rect,
            callback: Arc::new(eframe::egui_glow::CallbackFn::new(move |info, painter| {
                use eframe::glow::HasContext as _;
                let gl = painter.gl();
                let screen = info.viewport_in_pixels();
                let viewport = Viewport {
                    x: screen.left_px as i32,
                    y: screen.from_bottom_px as i32,
                    width: screen.width_px as u32,
                    height: screen.height_px as u32,
                };

                unsafe {
                    let prev_depth_test = gl.is_enabled(eframe::glow::DEPTH_TEST);
                    gl.enable(eframe::glow::DEPTH_TEST);
                    gl.clear(eframe::glow::DEPTH_BUFFER_BIT);

                    lock(&gpu).render(&context, &camera_for(&pose, viewport));

                    if !prev_depth_test {
                        gl.disable(eframe::glow::DEPTH_TEST);
                    }
                }
            })),
        };
        ui.painter().add(callback);

        self.paint_labels(ui.painter(), rect, scene);
    }

    fn paint_labels(&self, painter: &egui::Painter, rect: Rect, scene: &Scene) {
        let viewport = Viewport {
            x: 0,
            y: 0,
            width: rect.width().max(1.0) as u32,
            height: rect.height().max(1.0) as u32,
        };
        let camera = camera_for(&scene.camera, viewport);

        for object in scene.objects().filter(|object| object.visible) {
            let Geometry::Sprite(label) = &object.geometry else {
                continue;
            };
            if let Some(placement) = label_placement(&camera, rect, object, label) {
                let [r, g, b, a] = object.material.rgba();
                let color = if a == 255 { color32(object.material.color) } else { Color32::from_rgba_unmultiplied(r, g, b, a) };
                painter.text(
                    placement.pos,
                    egui::Align2::CENTER_CENTER,
                    &label.text,
                    egui::FontId::proportional(placement.size),
                    color,
                );
            }
        }
    }
}

fn handle_input(ui: &egui::Ui, response: &egui::Response, pose: &mut CameraPose) {
    let mut controls = OrbitControls::from_pose(pose);
    let mut moved = false;

    if response.dragged() {
        let delta = response.drag_delta();
        controls.orbit(-delta.x * ORBIT_DEGREES_PER_POINT, delta.y * ORBIT_DEGREES_PER_POINT);
        moved = true;
    }
    if response.hovered() {
        let scroll = ui.input(|i| i.scroll_delta.y);
        if scroll != 0.0 {
            controls.zoom((-scroll * ZOOM_SPEED).exp());
            moved = true;
        }
    }

    if moved {
        controls.apply(pose);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::landmarks::{Handedness, Landmark, SceneMapping, BONES, INDEX_FINGER_TIP, LANDMARK_COUNT};
    use crate::visualizer::{HandVisualizer, VisualizationConfig};
    use approx::assert_relative_eq;
    use eframe::egui::pos2;
    use nalgebra::Point3;

    fn rect() -> Rect {
        Rect::from_min_max(pos2(0.0, 0.0), pos2(800.0, 600.0))
    }

    fn pose() -> CameraPose {
        CameraPose {
            position: Vector3::new(0.0, 1.5, 4.5),
            target: Vector3::new(0.0, 1.0, 0.0),
            fov_degrees: 50.0,
            near: 0.1,
            far: 1000.0,
        }
    }

    fn camera() -> Camera {
        camera_for(
            &pose(),
            Viewport {
                x: 0,
                y: 0,
                width: 800,
                height: 600,
            },
        )
    }

    fn hand() -> Vec<Landmark> {
        (0..LANDMARK_COUNT)
            .map(|i| {
                let angle = i as f32 * 0.3;
                Landmark::new(0.5 + 0.1 * angle.cos(), 0.6 + 0.1 * angle.sin(), -0.01 * i as f32)
            })
            .collect()
    }

    fn index_len(mesh: &CpuMesh) -> usize {
        match &mesh.indices {
            Indices::U32(indices) => indices.len(),
            _ => 0,
        }
    }

    #[test]
    fn bone_cylinders_span_their_landmarks() {
        let mut viz = HandVisualizer::new(VisualizationConfig::default());
        let hand = hand();
        viz.update_hands(&[hand.clone()], &["Left"]);

        let mapping = SceneMapping::default();
        for (k, &(a, b)) in BONES.iter().enumerate() {
            let model = model_matrix(viz.bone(Handedness::Left, k));
            let base = model.transform_point(&Point3::new(0.0, 0.0, 0.0)).coords;
            let tip = model.transform_point(&Point3::new(1.0, 0.0, 0.0)).coords;
            assert_relative_eq!(base, mapping.to_scene(&hand[a]), epsilon = 1e-4);
            assert_relative_eq!(tip, mapping.to_scene(&hand[b]), epsilon = 1e-4);
        }
    }

    #[test]
    fn bone_cylinders_keep_their_radius() {
        let mut viz = HandVisualizer::new(VisualizationConfig::default());
        viz.update_hands(&[hand()], &["Right"]);
        let bone = viz.bone(Handedness::Right, 4);
        let model = model_matrix(bone);
        let axis_point = model.transform_point(&Point3::new(0.5, 0.0, 0.0)).coords;
        let rim_point = model.transform_point(&Point3::new(0.5, 1.0, 0.0)).coords;
        assert_relative_eq!((rim_point - axis_point).norm(), 0.05, epsilon = 1e-5);
    }

    #[test]
    fn spheres_scale_to_their_radius() {
        let mut viz = HandVisualizer::new(VisualizationConfig::default());
        viz.update_hands(&[hand()], &["Right"]);
        let sphere = viz.sphere(Handedness::Right, 3);
        let model = model_matrix(sphere);
        let surface = model.transform_point(&Point3::new(1.0, 0.0, 0.0)).coords;
        assert_relative_eq!((surface - sphere.transform.position).norm(), 0.08, epsilon = 1e-6);
    }

    #[test]
    fn half_progress_ring_mesh_covers_half_the_segments() {
        let mut viz = HandVisualizer::new(VisualizationConfig::default());
        viz.set_progress(50.0);
        let Geometry::Ring(ring) = &viz.progress_ring().geometry else {
            panic!("progress ring must be a ring");
        };
        let mesh = ring_mesh(ring).expect("half ring has triangles");
        assert_eq!(mesh.positions.len(), 33 * 2);
        assert_eq!(index_len(&mesh), 32 * 2 * 3);

        viz.set_progress(0.0);
        let Geometry::Ring(ring) = &viz.progress_ring().geometry else {
            panic!("progress ring must be a ring");
        };
        assert!(ring_mesh(ring).is_none());
    }

    #[test]
    fn palm_mesh_fans_from_the_wrist() {
        let mut viz = HandVisualizer::new(VisualizationConfig::default());
        viz.update_hands(&[hand()], &["Left"]);
        let Geometry::Shape(shape) = &viz.palm(Handedness::Left).geometry else {
            panic!("palm must be a shape");
        };
        let mesh = palm_mesh(shape).expect("palm has triangles");
        assert_eq!(mesh.positions.len(), 7);
        assert_eq!(index_len(&mesh), 5 * 3);
        assert!(palm_mesh(&ShapeGeometry::placeholder()).is_none());
    }

    #[test]
    fn sprites_have_no_mesh() {
        let viz = HandVisualizer::new(VisualizationConfig::default());
        assert!(cpu_mesh(&viz.progress_text().geometry).is_none());
    }

    #[test]
    fn material_alpha_follows_opacity() {
        let config = VisualizationConfig::default();
        let viz = HandVisualizer::new(config.clone());
        let color = srgba(&viz.bone(Handedness::Right, 0).material);
        assert_eq!((color.r, color.g, color.b, color.a), (0xad, 0xd8, 0xe6, 128));
        let ring = srgba(&viz.progress_ring().material);
        assert_eq!((ring.r, ring.g, ring.b), (0xff, 0xd7, 0x00));
        assert!(ring.a > 200 && ring.a < 255);
    }

    #[test]
    fn camera_target_projects_to_center() {
        let projected = project_to_rect(&camera(), rect(), &pose().target).expect("target in front");
        assert_relative_eq!(projected.x, 400.0, epsilon = 1e-2);
        assert_relative_eq!(projected.y, 300.0, epsilon = 1e-2);
    }

    #[test]
    fn parked_points_do_not_project() {
        assert!(project_to_rect(&camera(), rect(), &Vector3::repeat(999.0)).is_none());
    }

    #[test]
    fn right_and_up_keep_their_screen_sides() {
        let right = project_to_rect(&camera(), rect(), &Vector3::new(1.0, 1.0, 0.0)).unwrap();
        let up = project_to_rect(&camera(), rect(), &Vector3::new(0.0, 2.0, 0.0)).unwrap();
        assert!(right.x > 400.0);
        assert!(up.y < 300.0);
    }

    #[test]
    fn hint_label_sits_above_the_fingertip() {
        let mut viz = HandVisualizer::new(VisualizationConfig::default());
        let tip = hand()[INDEX_FINGER_TIP];
        viz.show_progress_ring(true, Some(&tip));
        viz.show_hint_text("Hold", &tip);

        let text = viz.progress_text();
        let Geometry::Sprite(label) = &text.geometry else {
            panic!("caption must be a sprite");
        };
        let camera = camera();
        let placement = label_placement(&camera, rect(), text, label).expect("hint in view");
        let ring = project_to_rect(&camera, rect(), &viz.progress_ring().transform.position).unwrap();
        assert!(placement.pos.y < ring.y);
        assert!(placement.size >= MIN_FONT_PX && placement.size <= MAX_FONT_PX);
    }

    #[test]
    fn orbit_round_trips_the_default_pose() {
        let mut pose = pose();
        OrbitControls::from_pose(&pose).apply(&mut pose);
        assert_relative_eq!(pose.position, Vector3::new(0.0, 1.5, 4.5), epsilon = 1e-4);
    }

    #[test]
    fn orbit_keeps_distance_and_clamps_pitch() {
        let mut pose = pose();
        let mut controls = OrbitControls::from_pose(&pose);
        let distance = controls.distance;
        controls.orbit(40.0, 500.0);
        controls.apply(&mut pose);
        assert_relative_eq!(controls.pitch, PITCH_LIMIT);
        assert_relative_eq!((pose.position - pose.target).norm(), distance, epsilon = 1e-4);
        assert!(pose.position.y > pose.target.y);
    }

    #[test]
    fn zoom_is_clamped() {
        let mut controls = OrbitControls::from_pose(&pose());
        controls.zoom(100.0);
        assert_relative_eq!(controls.distance, MAX_DISTANCE);
        controls.zoom(0.0001);
        assert_relative_eq!(controls.distance, MIN_DISTANCE);
        controls.zoom(f32::NAN);
        assert_relative_eq!(controls.distance, MIN_DISTANCE);
    }
}
