// src/scene.rs - Retained scene description the 3D viewport uploads and draws
use nalgebra::{Matrix4, UnitQuaternion, Vector2, Vector3};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId(usize);

#[derive(Debug, Clone, PartialEq)]
pub struct Transform {
    pub position: Vector3<f32>,
    pub rotation: UnitQuaternion<f32>,
    pub scale: Vector3<f32>,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vector3::zeros(),
            rotation: UnitQuaternion::identity(),
            scale: Vector3::new(1.0, 1.0, 1.0),
        }
    }
}

impl Transform {
    /// Turn the object so its local +Z axis points at `target`.
    pub fn look_at(&mut self, target: &Vector3<f32>) {
        if let Some(rotation) = look_rotation(&(target - self.position)) {
            self.rotation = rotation;
        }
    }

    /// Rotate about the object's own X axis.
    pub fn rotate_x(&mut self, angle: f32) {
        self.rotation *= UnitQuaternion::from_axis_angle(&Vector3::x_axis(), angle);
    }

    pub fn transform_point(&self, local: &Vector3<f32>) -> Vector3<f32> {
        self.position + self.rotation * local.component_mul(&self.scale)
    }

    /// Translation * rotation * scale.
    pub fn matrix(&self) -> Matrix4<f32> {
        Matrix4::new_translation(&self.position)
            * self.rotation.to_homogeneous()
            * Matrix4::new_nonuniform_scaling(&self.scale)
    }
}

/// Rotation mapping +Z onto `dir`. `None` for a zero-length direction.
fn look_rotation(dir: &Vector3<f32>) -> Option<UnitQuaternion<f32>> {
    if dir.norm_squared() < 1e-12 {
        return None;
    }
    let forward = dir.normalize();
    let mut up = Vector3::y();
    if forward.cross(&up).norm_squared() < 1e-8 {
        up = Vector3::z();
    }
    Some(UnitQuaternion::face_towards(&forward, &up))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Material {
    /// 0xRRGGBB
    pub color: u32,
    pub opacity: f32,
    /// Shaded by scene lights; unlit materials draw their flat color.
    pub lit: bool,
    pub double_sided: bool,
}

impl Material {
    pub fn standard(color: u32) -> Self {
        Self {
            color,
            opacity: 1.0,
            lit: true,
            double_sided: false,
        }
    }

    pub fn basic(color: u32) -> Self {
        Self {
            lit: false,
            ..Self::standard(color)
        }
    }

    pub fn with_opacity(mut self, opacity: f32) -> Self {
        self.opacity = opacity.clamp(0.0, 1.0);
        self
    }

    pub fn double_sided(mut self) -> Self {
        self.double_sided = true;
        self
    }

    pub fn is_transparent(&self) -> bool {
        self.opacity < 1.0
    }

    pub fn rgba(&self) -> [u8; 4] {
        [
            ((self.color >> 16) & 0xff) as u8,
            ((self.color >> 8) & 0xff) as u8,
            (self.color & 0xff) as u8,
            (self.opacity.clamp(0.0, 1.0) * 255.0).round() as u8,
        ]
    }
}

/// Planar polygon in local XY.
#[derive(Debug, Clone, PartialEq)]
pub struct ShapeGeometry {
    pub outline: Vec<Vector2<f32>>,
}

impl ShapeGeometry {
    pub fn from_outline(mut outline: Vec<Vector2<f32>>) -> Self {
        // An explicitly closed outline repeats its first point.
        if outline.len() > 1 && outline.first() == outline.last() {
            outline.pop();
        }
        Self { outline }
    }

    /// Degenerate outline used before the first real palm arrives.
    pub fn placeholder() -> Self {
        Self::from_outline(vec![Vector2::zeros()])
    }

    /// Fan around the first outline point. The palm outline starts at the
    /// wrist, which sees every other palm point.
    pub fn triangles(&self) -> Vec<[u32; 3]> {
        (1..self.outline.len().saturating_sub(1))
            .map(|i| [0, i as u32, i as u32 + 1])
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RingGeometry {
    pub inner_radius: f32,
    pub outer_radius: f32,
    pub theta_segments: u32,
    pub theta_start: f32,
    pub theta_length: f32,
}

impl RingGeometry {
    /// Inner/outer vertex pairs along the sector, `theta_segments + 1` of
    /// them. Empty when the sector has no extent.
    pub fn vertex_pairs(&self) -> Vec<(Vector2<f32>, Vector2<f32>)> {
        if self.theta_length <= 0.0 || self.theta_segments == 0 {
            return Vec::new();
        }
        (0..=self.theta_segments)
            .map(|i| {
                let angle = self.theta_start + self.theta_length * i as f32 / self.theta_segments as f32;
                let dir = Vector2::new(angle.cos(), angle.sin());
                (dir * self.inner_radius, dir * self.outer_radius)
            })
            .collect()
    }
}

/// Camera-facing text label.
#[derive(Debug, Clone, PartialEq)]
pub struct SpriteLabel {
    pub text: String,
    pub font_px: f32,
    pub canvas_width: u32,
    pub canvas_height: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Sphere { radius: f32, segments: u32 },
    /// Axis along local +Y, centered on the origin.
    Cylinder { radius: f32, height: f32, radial_segments: u32 },
    Shape(ShapeGeometry),
    Ring(RingGeometry),
    Sprite(SpriteLabel),
}

#[derive(Debug, Clone)]
pub struct SceneObject {
    pub geometry: Geometry,
    pub material: Material,
    pub transform: Transform,
    pub visible: bool,
}

impl SceneObject {
    pub fn new(geometry: Geometry, material: Material) -> Self {
        Self {
            geometry,
            material,
            transform: Transform::default(),
            visible: true,
        }
    }
}

/// Light shining from `position` toward the origin.
#[derive(Debug, Clone)]
pub struct DirectionalLight {
    pub color: u32,
    pub intensity: f32,
    pub position: Vector3<f32>,
}

impl DirectionalLight {
    /// Direction the light travels in.
    pub fn direction(&self) -> Vector3<f32> {
        -self.position.try_normalize(1e-6).unwrap_or_else(Vector3::z)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CameraPose {
    pub position: Vector3<f32>,
    pub target: Vector3<f32>,
    pub fov_degrees: f32,
    pub near: f32,
    pub far: f32,
}

pub struct Scene {
    objects: Vec<SceneObject>,
    lights: Vec<DirectionalLight>,
    pub camera: CameraPose,
}

impl Scene {
    pub fn new(camera: CameraPose) -> Self {
        Self {
            objects: Vec::new(),
            lights: Vec::new(),
            camera,
        }
    }

    pub fn add(&mut self, object: SceneObject) -> ObjectId {
        self.objects.push(object);
        ObjectId(self.objects.len() - 1)
    }

    pub fn add_light(&mut self, light: DirectionalLight) {
        self.lights.push(light);
    }

    pub fn object(&self, id: ObjectId) -> &SceneObject {
        &self.objects[id.0]
    }

    pub fn object_mut(&mut self, id: ObjectId) -> &mut SceneObject {
        &mut self.objects[id.0]
    }

    pub fn objects(&self) -> impl Iterator<Item = &SceneObject> {
        self.objects.iter()
    }

    pub fn lights(&self) -> &[DirectionalLight] {
        &self.lights
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Point3;
    use std::f32::consts::{FRAC_PI_2, PI};

    #[test]
    fn look_at_points_local_z_at_target() {
        let mut t = Transform {
            position: Vector3::new(1.0, 2.0, 3.0),
            ..Default::default()
        };
        let target = Vector3::new(4.0, -1.0, 5.0);
        t.look_at(&target);
        let forward = t.rotation * Vector3::z();
        assert_relative_eq!(forward, (target - t.position).normalize(), epsilon = 1e-5);
    }

    #[test]
    fn look_at_straight_up_is_finite() {
        let mut t = Transform::default();
        t.look_at(&Vector3::new(0.0, 3.0, 0.0));
        let forward = t.rotation * Vector3::z();
        assert_relative_eq!(forward, Vector3::y(), epsilon = 1e-5);
    }

    #[test]
    fn look_at_own_position_keeps_rotation() {
        let mut t = Transform::default();
        t.rotate_x(0.3);
        let before = t.rotation;
        t.look_at(&Vector3::zeros());
        assert_eq!(t.rotation, before);
    }

    #[test]
    fn rotate_x_after_look_at_aligns_y_with_target() {
        let mut t = Transform::default();
        let target = Vector3::new(1.0, 1.0, 0.0);
        t.look_at(&target);
        t.rotate_x(FRAC_PI_2);
        assert_relative_eq!(t.rotation * Vector3::y(), target.normalize(), epsilon = 1e-5);
    }

    #[test]
    fn matrix_agrees_with_transform_point() {
        let mut t = Transform {
            position: Vector3::new(0.0, 1.0, 0.0),
            scale: Vector3::new(1.0, 2.0, 1.0),
            ..Default::default()
        };
        t.rotation = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), FRAC_PI_2);
        let local = Vector3::new(0.0, 0.5, 0.0);
        let p = t.transform_point(&local);
        assert_relative_eq!(p, Vector3::new(-1.0, 1.0, 0.0), epsilon = 1e-5);
        assert_relative_eq!(t.matrix().transform_point(&Point3::from(local)).coords, p, epsilon = 1e-5);
    }

    #[test]
    fn closed_outline_drops_repeated_point() {
        let square = vec![
            Vector2::new(0.0, 0.0),
            Vector2::new(1.0, 0.0),
            Vector2::new(1.0, 1.0),
            Vector2::new(0.0, 1.0),
            Vector2::new(0.0, 0.0),
        ];
        let shape = ShapeGeometry::from_outline(square);
        assert_eq!(shape.outline.len(), 4);
        assert_eq!(shape.triangles(), vec![[0, 1, 2], [0, 2, 3]]);
    }

    #[test]
    fn placeholder_has_no_triangles() {
        assert!(ShapeGeometry::placeholder().triangles().is_empty());
    }

    #[test]
    fn ring_sector_vertices() {
        let ring = RingGeometry {
            inner_radius: 0.08,
            outer_radius: 0.13,
            theta_segments: 4,
            theta_start: 0.0,
            theta_length: PI,
        };
        let pairs = ring.vertex_pairs();
        assert_eq!(pairs.len(), 5);
        assert_relative_eq!(pairs[0].0, Vector2::new(0.08, 0.0), epsilon = 1e-6);
        assert_relative_eq!(pairs[4].1, Vector2::new(-0.13, 0.0), epsilon = 1e-5);

        let empty = RingGeometry { theta_length: 0.0, ..ring };
        assert!(empty.vertex_pairs().is_empty());
    }

    #[test]
    fn material_channels() {
        assert_eq!(Material::basic(0xffd700).rgba(), [0xff, 0xd7, 0x00, 0xff]);
        let bone = Material::standard(0xadd8e6).with_opacity(0.5);
        assert_eq!(bone.rgba()[3], 128);
        assert!(bone.is_transparent());
        assert_eq!(Material::standard(0xadd8e6).with_opacity(2.0).opacity, 1.0);
    }

    #[test]
    fn light_travels_toward_origin() {
        let light = DirectionalLight {
            color: 0xffffff,
            intensity: 1.0,
            position: Vector3::new(0.0, 0.0, 4.0),
        };
        assert_relative_eq!(light.direction(), -Vector3::z());
    }
}
