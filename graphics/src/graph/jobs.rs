//! Per-frame render jobs.
//!
//! The application fills a [`FrameJobs`] every frame; the renderer turns it
//! into instance buffers and batches and then clears it.

use ember_core::Handle;
use glam::{Mat4, Vec3, Vec4};

use crate::resources::{Animation, FontAtlas, Material, Mesh, SkeletalMesh};
use crate::types::{EmitterData, LineVertex, SceneUniforms, SpriteInstanceData};

/// Viewer of the scene.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub view: Mat4,
    pub projection: Mat4,
    pub position: Vec3,
}

impl Camera {
    /// Right-handed perspective camera at `eye` looking at `target`, depth
    /// mapped to `[0, 1]`.
    pub fn look_at(eye: Vec3, target: Vec3, fov_y: f32, aspect_ratio: f32) -> Self {
        Self {
            view: Mat4::look_at_rh(eye, target, Vec3::Y),
            projection: Mat4::perspective_rh(fov_y, aspect_ratio.max(1e-4), 0.1, 1000.0),
            position: eye,
        }
    }

    pub fn view_projection(&self) -> Mat4 {
        self.projection * self.view
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self::look_at(Vec3::new(0.0, 2.0, 5.0), Vec3::ZERO, 60f32.to_radians(), 16.0 / 9.0)
    }
}

/// The single shadow-casting light.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectionalLight {
    /// Direction the light travels.
    pub direction: Vec3,
    pub color: Vec3,
    pub intensity: f32,
    /// Half-extent of the orthographic shadow volume around the origin.
    pub shadow_extent: f32,
}

impl DirectionalLight {
    pub fn view_projection(&self) -> Mat4 {
        let direction = self.direction.try_normalize().unwrap_or(Vec3::NEG_Y);
        let up = if direction.abs().dot(Vec3::Y) > 0.99 {
            Vec3::Z
        } else {
            Vec3::Y
        };
        let eye = -direction * self.shadow_extent * 2.0;
        let view = Mat4::look_at_rh(eye, Vec3::ZERO, up);
        let e = self.shadow_extent;
        let projection = Mat4::orthographic_rh(-e, e, -e, e, 0.0, e * 4.0);
        projection * view
    }
}

impl Default for DirectionalLight {
    fn default() -> Self {
        Self {
            direction: Vec3::new(-0.4, -1.0, -0.3),
            color: Vec3::ONE,
            intensity: 3.0,
            shadow_extent: 20.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StaticRenderJob {
    pub mesh: Handle<Mesh>,
    pub material: Handle<Material>,
    pub transform: Mat4,
    pub color: Vec4,
    pub casts_shadows: bool,
}

impl StaticRenderJob {
    pub fn new(mesh: Handle<Mesh>, material: Handle<Material>, transform: Mat4) -> Self {
        Self {
            mesh,
            material,
            transform,
            color: Vec4::ONE,
            casts_shadows: true,
        }
    }

    pub fn with_color(mut self, color: Vec4) -> Self {
        self.color = color;
        self
    }

    pub fn without_shadows(mut self) -> Self {
        self.casts_shadows = false;
        self
    }
}

/// A clip sampled at `time`, contributing with `weight`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnimationBlend {
    pub animation: Handle<Animation>,
    pub time: f32,
    pub weight: f32,
}

impl AnimationBlend {
    pub fn new(animation: Handle<Animation>, time: f32, weight: f32) -> Self {
        Self {
            animation,
            time,
            weight,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkeletalRenderJob {
    pub mesh: Handle<SkeletalMesh>,
    pub material: Handle<Material>,
    pub transform: Mat4,
    pub blends: Vec<AnimationBlend>,
    pub casts_shadows: bool,
}

impl SkeletalRenderJob {
    pub fn new(mesh: Handle<SkeletalMesh>, material: Handle<Material>, transform: Mat4) -> Self {
        Self {
            mesh,
            material,
            transform,
            blends: Vec::new(),
            casts_shadows: true,
        }
    }

    pub fn with_blend(mut self, blend: AnimationBlend) -> Self {
        self.blends.push(blend);
        self
    }

    pub fn without_shadows(mut self) -> Self {
        self.casts_shadows = false;
        self
    }
}

/// A screen-space quad textured by `material`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpriteRenderJob {
    pub material: Handle<Material>,
    pub sprite: SpriteInstanceData,
}

/// One line of text in pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct TextRenderJob {
    pub font: Handle<FontAtlas>,
    pub text: String,
    /// Left edge and vertical center.
    pub origin: [f32; 2],
    pub height: f32,
    pub color: [f32; 4],
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineSegment {
    pub start: Vec3,
    pub end: Vec3,
    pub color: Vec4,
}

impl LineSegment {
    pub fn vertices(&self) -> [LineVertex; 2] {
        [
            LineVertex::new(self.start, self.color),
            LineVertex::new(self.end, self.color),
        ]
    }
}

/// A particle source active this frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmitterJob {
    pub position: Vec3,
    pub velocity: Vec3,
    /// Cone half-angle in radians.
    pub spread: f32,
    pub color: Vec4,
    pub lifetime: f32,
    pub size: f32,
    /// Particles requested this frame.
    pub spawn_count: u32,
}

impl EmitterJob {
    pub fn new(position: Vec3, velocity: Vec3, spawn_count: u32) -> Self {
        Self {
            position,
            velocity,
            spread: 0.3,
            color: Vec4::ONE,
            lifetime: 2.0,
            size: 0.1,
            spawn_count,
        }
    }

    /// GPU record for this frame. `seed` varies the spawn pattern.
    pub fn to_gpu(&self, seed: u32) -> EmitterData {
        let mut data = EmitterData::new(self.position, self.velocity, self.spawn_count);
        data.spread = self.spread;
        data.color = self.color;
        data.lifetime = self.lifetime;
        data.size = self.size;
        data.seed = seed;
        data
    }
}

/// Everything drawn in one frame.
#[derive(Debug, Clone, Default)]
pub struct FrameJobs {
    pub camera: Camera,
    pub light: DirectionalLight,
    pub static_jobs: Vec<StaticRenderJob>,
    pub skeletal_jobs: Vec<SkeletalRenderJob>,
    pub sprites: Vec<SpriteRenderJob>,
    pub texts: Vec<TextRenderJob>,
    pub lines: Vec<LineSegment>,
    pub emitters: Vec<EmitterJob>,
    /// Seconds since the previous frame.
    pub delta_time: f32,
    /// Seconds since the renderer started.
    pub elapsed: f32,
    pub bloom_strength: f32,
}

impl FrameJobs {
    pub fn new() -> Self {
        Self {
            bloom_strength: 0.04,
            ..Default::default()
        }
    }

    pub fn add_static(&mut self, job: StaticRenderJob) {
        self.static_jobs.push(job);
    }

    pub fn add_skeletal(&mut self, job: SkeletalRenderJob) {
        self.skeletal_jobs.push(job);
    }

    pub fn add_sprite(&mut self, material: Handle<Material>, sprite: SpriteInstanceData) {
        self.sprites.push(SpriteRenderJob { material, sprite });
    }

    pub fn add_text(
        &mut self,
        font: Handle<FontAtlas>,
        text: impl Into<String>,
        origin: [f32; 2],
        height: f32,
        color: [f32; 4],
    ) {
        self.texts.push(TextRenderJob {
            font,
            text: text.into(),
            origin,
            height,
            color,
        });
    }

    pub fn add_line(&mut self, start: Vec3, end: Vec3, color: Vec4) {
        self.lines.push(LineSegment { start, end, color });
    }

    pub fn add_emitter(&mut self, emitter: EmitterJob) {
        self.emitters.push(emitter);
    }

    /// Drop every job; the camera, light and timing stay.
    pub fn clear(&mut self) {
        self.static_jobs.clear();
        self.skeletal_jobs.clear();
        self.sprites.clear();
        self.texts.clear();
        self.lines.clear();
        self.emitters.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.static_jobs.is_empty()
            && self.skeletal_jobs.is_empty()
            && self.sprites.is_empty()
            && self.texts.is_empty()
            && self.lines.is_empty()
            && self.emitters.is_empty()
    }

    /// Scene uniforms for this frame.
    pub fn uniforms(&self, has_environment: bool, particle_capacity: u32) -> SceneUniforms {
        let camera = &self.camera;
        let light = &self.light;
        SceneUniforms {
            view: camera.view,
            projection: camera.projection,
            view_projection: camera.view_projection(),
            light_view_projection: light.view_projection(),
            camera_position: camera.position.extend(1.0),
            light_direction: light.direction.normalize_or_zero().extend(0.0),
            light_color: light.color.extend(light.intensity),
            params: Vec4::new(
                self.elapsed,
                self.bloom_strength,
                if has_environment { 1.0 } else { 0.0 },
                particle_capacity as f32,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clear_keeps_camera() {
        let mut jobs = FrameJobs::new();
        jobs.camera.position = Vec3::X;
        jobs.add_line(Vec3::ZERO, Vec3::ONE, Vec4::ONE);
        jobs.add_static(StaticRenderJob::new(
            Handle::from_raw(1),
            Handle::from_raw(1),
            Mat4::IDENTITY,
        ));
        assert!(!jobs.is_empty());

        jobs.clear();
        assert!(jobs.is_empty());
        assert_eq!(jobs.camera.position, Vec3::X);
    }

    #[test]
    fn test_uniform_params() {
        let mut jobs = FrameJobs::new();
        jobs.elapsed = 2.5;
        let uniforms = jobs.uniforms(true, 1024);
        assert_eq!(uniforms.params, Vec4::new(2.5, 0.04, 1.0, 1024.0));
        assert_eq!(uniforms.view_projection, jobs.camera.view_projection());
    }

    #[test]
    fn test_emitter_to_gpu() {
        let job = EmitterJob::new(Vec3::ONE, Vec3::Y, 12);
        let data = job.to_gpu(99);
        assert_eq!(data.spawn_count, 12);
        assert_eq!(data.seed, 99);
        assert_eq!(data.lifetime, 2.0);
    }

    #[test]
    fn test_light_matrix_handles_vertical_light() {
        let light = DirectionalLight {
            direction: Vec3::NEG_Y,
            ..Default::default()
        };
        let m = light.view_projection();
        assert!(m.is_finite());
        // The origin lies inside the shadow volume.
        let p = m.project_point3(Vec3::ZERO);
        assert!(p.x.abs() <= 1.0 && p.y.abs() <= 1.0 && (0.0..=1.0).contains(&p.z));
    }
}
