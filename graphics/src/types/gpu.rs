//! Records shared with shaders through GPU buffers.
//!
//! Every struct is `#[repr(C)]` and `Pod` with explicit padding, so the byte
//! layout matches std430. Sizes are checked at compile time.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Quat, Vec3, Vec4};
use static_assertions::const_assert_eq;

use super::{VertexFormat, VertexLayout};

// ============================================================================
// Vertices
// ============================================================================

/// Vertex of a static mesh.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
    pub tangent: [f32; 4],
}

impl Vertex {
    pub fn layout() -> VertexLayout {
        VertexLayout::new(std::mem::size_of::<Self>() as u32)
            .with_attribute(VertexFormat::Float3, 0)
            .with_attribute(VertexFormat::Float3, 12)
            .with_attribute(VertexFormat::Float2, 24)
            .with_attribute(VertexFormat::Float4, 32)
    }
}

/// Vertex of a skinned mesh with up to four bone influences.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct SkinnedVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
    pub tangent: [f32; 4],
    pub bone_indices: [u32; 4],
    pub bone_weights: [f32; 4],
}

impl SkinnedVertex {
    pub fn layout() -> VertexLayout {
        VertexLayout::new(std::mem::size_of::<Self>() as u32)
            .with_attribute(VertexFormat::Float3, 0)
            .with_attribute(VertexFormat::Float3, 12)
            .with_attribute(VertexFormat::Float2, 24)
            .with_attribute(VertexFormat::Float4, 32)
            .with_attribute(VertexFormat::Uint4, 48)
            .with_attribute(VertexFormat::Float4, 64)
    }
}

/// Endpoint of a debug line.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct LineVertex {
    pub position: Vec3,
    _pad: f32,
    pub color: Vec4,
}

impl LineVertex {
    pub fn new(position: Vec3, color: Vec4) -> Self {
        Self {
            position,
            _pad: 0.0,
            color,
        }
    }

    pub fn layout() -> VertexLayout {
        VertexLayout::new(std::mem::size_of::<Self>() as u32)
            .with_attribute(VertexFormat::Float3, 0)
            .with_attribute(VertexFormat::Float4, 16)
    }
}

// ============================================================================
// Per-frame instance records
// ============================================================================

/// Per-instance data of a static mesh draw.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct StaticInstanceData {
    pub model: Mat4,
    pub color: Vec4,
    /// xy: UV offset, zw: UV scale.
    pub uv_transform: Vec4,
}

impl StaticInstanceData {
    pub fn new(model: Mat4, color: Vec4) -> Self {
        Self {
            model,
            color,
            uv_transform: Vec4::new(0.0, 0.0, 1.0, 1.0),
        }
    }
}

/// Per-instance data of a skeletal mesh draw, read by skinning and by the
/// skeletal vertex shader.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct SkeletalInstanceData {
    pub model: Mat4,
    /// First record of this mesh in the bone hierarchy buffer.
    pub bone_offset: u32,
    pub bone_count: u32,
    /// First blend of this instance in the animation instance buffer.
    pub animation_instance_offset: u32,
    pub animation_instance_count: u32,
}

/// One sampled clip contributing to a skeletal pose.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct AnimationInstanceData {
    /// First record of the clip in the shared frame pool.
    pub frame_offset: u32,
    pub frame1: u32,
    pub frame2: u32,
    /// Interpolation weight between `frame1` and `frame2`.
    pub frame_blend: f32,
    /// Weight of this clip in the final pose.
    pub blend_factor: f32,
    /// Bones per frame of the clip.
    pub bone_stride: u32,
    _pad: [u32; 2],
}

impl AnimationInstanceData {
    pub fn new(frame_offset: u32, frame1: u32, frame2: u32, frame_blend: f32, blend_factor: f32) -> Self {
        Self {
            frame_offset,
            frame1,
            frame2,
            frame_blend,
            blend_factor,
            bone_stride: 0,
            _pad: [0; 2],
        }
    }

    pub fn with_bone_stride(mut self, bone_stride: u32) -> Self {
        self.bone_stride = bone_stride;
        self
    }

    /// Index into the frame pool of `bone` in frame `frame`, if the clip
    /// animates that bone.
    pub fn frame_record(&self, frame: u32, bone: u32) -> Option<usize> {
        (bone < self.bone_stride).then(|| {
            self.frame_offset as usize
                + frame as usize * self.bone_stride as usize
                + bone as usize
        })
    }
}

/// Local transform of one bone in one animation frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct AnimationFrame {
    pub position: Vec3,
    _pad0: f32,
    pub rotation: Quat,
    pub scale: Vec3,
    _pad1: f32,
}

impl AnimationFrame {
    /// Size of one packed frame record in bytes.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub const IDENTITY: Self = Self {
        position: Vec3::ZERO,
        _pad0: 0.0,
        rotation: Quat::IDENTITY,
        scale: Vec3::ONE,
        _pad1: 0.0,
    };

    pub fn new(position: Vec3, rotation: Quat, scale: Vec3) -> Self {
        Self {
            position,
            rotation,
            scale,
            ..Self::IDENTITY
        }
    }

    pub fn to_matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.position)
    }
}

impl Default for AnimationFrame {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Static hierarchy record of one bone.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct BoneData {
    /// Inverse bind matrix.
    pub offset_matrix: Mat4,
    /// Index of the parent bone within the mesh, -1 for roots.
    pub parent: i32,
    _pad: [u32; 3],
}

impl BoneData {
    pub fn new(parent: i32, offset_matrix: Mat4) -> Self {
        Self {
            offset_matrix,
            parent,
            _pad: [0; 3],
        }
    }
}

/// Screen-space sprite quad.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct SpriteInstanceData {
    /// Center in pixels.
    pub position: [f32; 2],
    /// Size in pixels.
    pub size: [f32; 2],
    pub uv_offset: [f32; 2],
    pub uv_extent: [f32; 2],
    pub color: [f32; 4],
    /// Rotation in radians around the center.
    pub rotation: f32,
    pub depth: f32,
    _pad: [f32; 2],
}

impl SpriteInstanceData {
    pub fn new(position: [f32; 2], size: [f32; 2], color: [f32; 4]) -> Self {
        Self {
            position,
            size,
            uv_offset: [0.0, 0.0],
            uv_extent: [1.0, 1.0],
            color,
            ..Default::default()
        }
    }

    pub fn with_uv(mut self, offset: [f32; 2], extent: [f32; 2]) -> Self {
        self.uv_offset = offset;
        self.uv_extent = extent;
        self
    }

    pub fn with_rotation(mut self, rotation: f32) -> Self {
        self.rotation = rotation;
        self
    }
}

// ============================================================================
// Particles
// ============================================================================

/// Header at offset 0 of every particle buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct ParticleHeader {
    /// Live particles following the header.
    pub count: u32,
    _pad: [u32; 3],
}

impl ParticleHeader {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;
}

/// A single simulated particle.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ParticleData {
    pub position: Vec3,
    /// Seconds since spawn.
    pub age: f32,
    pub velocity: Vec3,
    /// Seconds until the particle dies.
    pub lifetime: f32,
    pub color: Vec4,
    pub size: f32,
    /// View-space depth, the sort key.
    pub depth: f32,
    _pad: [f32; 2],
}

impl ParticleData {
    pub fn new(position: Vec3, velocity: Vec3, lifetime: f32, color: Vec4, size: f32) -> Self {
        Self {
            position,
            age: 0.0,
            velocity,
            lifetime,
            color,
            size,
            depth: 0.0,
            _pad: [0.0; 2],
        }
    }

    pub fn is_alive(&self) -> bool {
        self.age < self.lifetime
    }
}

/// A particle emitter active for one frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct EmitterData {
    pub position: Vec3,
    /// Particles to spawn this frame, already clamped to the free capacity.
    pub spawn_count: u32,
    pub velocity: Vec3,
    /// Cone half-angle in radians around `velocity`.
    pub spread: f32,
    pub color: Vec4,
    pub lifetime: f32,
    pub size: f32,
    pub seed: u32,
    _pad: u32,
}

impl EmitterData {
    pub fn new(position: Vec3, velocity: Vec3, spawn_count: u32) -> Self {
        Self {
            position,
            spawn_count,
            velocity,
            spread: 0.0,
            color: Vec4::ONE,
            lifetime: 1.0,
            size: 1.0,
            seed: 0,
            _pad: 0,
        }
    }
}

// ============================================================================
// Uniforms
// ============================================================================

/// Scene-wide values bound at set 0, binding 0 of every graphics pipeline.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct SceneUniforms {
    pub view: Mat4,
    pub projection: Mat4,
    pub view_projection: Mat4,
    pub light_view_projection: Mat4,
    /// xyz: camera position.
    pub camera_position: Vec4,
    /// xyz: direction the light travels.
    pub light_direction: Vec4,
    /// rgb: light color, a: intensity.
    pub light_color: Vec4,
    /// x: elapsed seconds, y: bloom strength, z: 1 when an environment map
    /// is bound, w: particle capacity.
    pub params: Vec4,
}

impl Default for SceneUniforms {
    fn default() -> Self {
        Self {
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
            view_projection: Mat4::IDENTITY,
            light_view_projection: Mat4::IDENTITY,
            camera_position: Vec4::ZERO,
            light_direction: Vec4::new(0.0, -1.0, 0.0, 0.0),
            light_color: Vec4::ONE,
            params: Vec4::ZERO,
        }
    }
}

const_assert_eq!(std::mem::size_of::<Vertex>(), 48);
const_assert_eq!(std::mem::size_of::<SkinnedVertex>(), 80);
const_assert_eq!(std::mem::size_of::<LineVertex>(), 32);
const_assert_eq!(std::mem::size_of::<StaticInstanceData>(), 96);
const_assert_eq!(std::mem::size_of::<SkeletalInstanceData>(), 80);
const_assert_eq!(std::mem::size_of::<AnimationInstanceData>(), 32);
const_assert_eq!(std::mem::size_of::<AnimationFrame>(), 48);
const_assert_eq!(std::mem::size_of::<BoneData>(), 80);
const_assert_eq!(std::mem::size_of::<SpriteInstanceData>(), 64);
const_assert_eq!(std::mem::size_of::<ParticleHeader>(), 16);
const_assert_eq!(std::mem::size_of::<ParticleData>(), 64);
const_assert_eq!(std::mem::size_of::<EmitterData>(), 64);
const_assert_eq!(std::mem::size_of::<SceneUniforms>(), 320);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_animation_frame_matrix() {
        let frame = AnimationFrame::new(Vec3::new(1.0, 2.0, 3.0), Quat::IDENTITY, Vec3::ONE);
        let m = frame.to_matrix();
        assert_eq!(m.w_axis, Vec4::new(1.0, 2.0, 3.0, 1.0));
        assert_eq!(AnimationFrame::default().to_matrix(), Mat4::IDENTITY);
    }

    #[test]
    fn test_particle_liveness() {
        let mut p = ParticleData::new(Vec3::ZERO, Vec3::Y, 1.0, Vec4::ONE, 0.1);
        assert!(p.is_alive());
        p.age = 1.0;
        assert!(!p.is_alive());
    }

    #[test]
    fn test_vertex_layout_strides() {
        assert_eq!(Vertex::layout().stride, 48);
        assert_eq!(SkinnedVertex::layout().attributes.len(), 6);
        assert_eq!(LineVertex::layout().stride, 32);
    }
}
