//! Common types and descriptors for graphics resources.
//!
//! Format enums, usage flags and descriptor structs used by the backends,
//! plus the `#[repr(C)]` records the shaders read from GPU buffers.

mod buffer;
mod common;
mod gpu;
mod image;
mod pipeline;
mod sampler;

pub use buffer::{BufferDescriptor, BufferUsage, DrawIndirectCommand};
pub use common::{ClearValue, Extent2d, ScissorRect, Viewport};
pub use gpu::{
    AnimationFrame, AnimationInstanceData, BoneData, EmitterData, LineVertex, ParticleData,
    ParticleHeader, SceneUniforms, SkeletalInstanceData, SkinnedVertex, SpriteInstanceData,
    StaticInstanceData, Vertex,
};
pub use image::{ImageDescriptor, ImageFormat, ImageUsage};
pub use pipeline::{
    BindingLayoutDescriptor, BindingLayoutEntry, BindingType, BlendMode, ComputePipelineDescriptor,
    DepthTest, GraphicsPipelineDescriptor, PrimitiveTopology, ShaderStages, VertexAttribute,
    VertexFormat, VertexLayout,
};
pub use sampler::{AddressMode, CompareFunction, FilterMode, SamplerDescriptor};
