//! Pipeline, binding layout and vertex layout descriptors.
//!
//! Shader code arrives as SPIR-V words. The renderer never inspects it; the
//! layouts declared here must match what the shaders were compiled against.

use bitflags::bitflags;

use super::ImageFormat;

bitflags! {
    /// Shader stages that can access a binding or push constant range.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShaderStages: u32 {
        /// Vertex shader stage.
        const VERTEX = 1 << 0;
        /// Fragment shader stage.
        const FRAGMENT = 1 << 1;
        /// Compute shader stage.
        const COMPUTE = 1 << 2;
        /// Vertex and fragment stages.
        const GRAPHICS = Self::VERTEX.bits() | Self::FRAGMENT.bits();
    }
}

/// Type of resource expected at a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingType {
    /// Uniform buffer (read-only, small, frequently updated).
    UniformBuffer,
    /// Storage buffer (read-write, larger data).
    StorageBuffer,
    /// Image sampled through a sampler.
    SampledImage,
    /// Image read and written by compute shaders.
    StorageImage,
}

/// A single entry in a binding layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingLayoutEntry {
    /// Binding index within the set.
    pub binding: u32,
    /// Type of resource expected at this binding.
    pub ty: BindingType,
    /// Shader stages that can access this binding.
    pub stages: ShaderStages,
}

impl BindingLayoutEntry {
    pub fn new(binding: u32, ty: BindingType, stages: ShaderStages) -> Self {
        Self { binding, ty, stages }
    }
}

/// Layout of one binding set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct BindingLayoutDescriptor {
    /// The binding entries in this layout.
    pub entries: Vec<BindingLayoutEntry>,
    /// Optional label for debugging.
    pub label: Option<String>,
}

impl BindingLayoutDescriptor {
    /// Create an empty layout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry.
    pub fn with_entry(mut self, binding: u32, ty: BindingType, stages: ShaderStages) -> Self {
        self.entries.push(BindingLayoutEntry::new(binding, ty, stages));
        self
    }

    /// Set a debug label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Find the entry for a binding index.
    pub fn entry(&self, binding: u32) -> Option<&BindingLayoutEntry> {
        self.entries.iter().find(|e| e.binding == binding)
    }
}

/// Format of a vertex attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    /// Two 32-bit floats.
    Float2,
    /// Three 32-bit floats.
    Float3,
    /// Four 32-bit floats.
    Float4,
    /// Four 32-bit unsigned integers.
    Uint4,
}

impl VertexFormat {
    /// Size in bytes of this format.
    pub fn size(&self) -> u32 {
        match self {
            Self::Float2 => 8,
            Self::Float3 => 12,
            Self::Float4 | Self::Uint4 => 16,
        }
    }
}

/// A single vertex attribute read from binding 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    /// Shader input location.
    pub location: u32,
    /// Data format of this attribute.
    pub format: VertexFormat,
    /// Byte offset within the vertex.
    pub offset: u32,
}

/// Layout of the single interleaved vertex buffer a pipeline reads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct VertexLayout {
    /// Stride in bytes between consecutive vertices.
    pub stride: u32,
    /// The vertex attributes.
    pub attributes: Vec<VertexAttribute>,
}

impl VertexLayout {
    /// Create a layout with the given stride and no attributes.
    pub fn new(stride: u32) -> Self {
        Self {
            stride,
            attributes: Vec::new(),
        }
    }

    /// Add an attribute at the next free location.
    pub fn with_attribute(mut self, format: VertexFormat, offset: u32) -> Self {
        let location = self.attributes.len() as u32;
        self.attributes.push(VertexAttribute {
            location,
            format,
            offset,
        });
        self
    }
}

/// Color blending applied to the single color attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlendMode {
    /// No blending.
    #[default]
    Opaque,
    /// Premultiplied-free src-over-dst alpha blending.
    Alpha,
    /// `src * src_alpha + dst`, used for particles.
    Additive,
}

/// Primitive assembly mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PrimitiveTopology {
    #[default]
    TriangleList,
    LineList,
}

/// Depth test configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DepthTest {
    /// No depth attachment access.
    #[default]
    Disabled,
    /// Test with `LESS_OR_EQUAL` but do not write.
    ReadOnly,
    /// Test with `LESS` and write.
    ReadWrite,
}

/// Descriptor for a graphics pipeline using dynamic rendering.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GraphicsPipelineDescriptor {
    pub label: Option<String>,
    /// SPIR-V words of the vertex shader (`main` entry point).
    pub vertex_shader: Vec<u32>,
    /// SPIR-V words of the fragment shader, absent for depth-only passes.
    pub fragment_shader: Option<Vec<u32>>,
    /// Vertex input. `None` for passes that generate vertices in the shader.
    pub vertex_layout: Option<VertexLayout>,
    /// Binding set layouts, indexed by set number.
    pub binding_layouts: Vec<BindingLayoutDescriptor>,
    /// Push constant bytes visible to every stage. Zero disables them.
    pub push_constant_size: u32,
    pub color_format: Option<ImageFormat>,
    pub depth_format: Option<ImageFormat>,
    pub blend: BlendMode,
    pub topology: PrimitiveTopology,
    pub depth_test: DepthTest,
    /// Apply a constant depth bias, used by the shadow pass.
    pub depth_bias: bool,
    pub cull_back_faces: bool,
}

impl GraphicsPipelineDescriptor {
    /// Create a descriptor for the given vertex shader.
    pub fn new(vertex_shader: Vec<u32>) -> Self {
        Self {
            vertex_shader,
            ..Default::default()
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_fragment(mut self, fragment_shader: Vec<u32>) -> Self {
        self.fragment_shader = Some(fragment_shader);
        self
    }

    pub fn with_vertex_layout(mut self, layout: VertexLayout) -> Self {
        self.vertex_layout = Some(layout);
        self
    }

    pub fn with_binding_layout(mut self, layout: BindingLayoutDescriptor) -> Self {
        self.binding_layouts.push(layout);
        self
    }

    pub fn with_push_constants(mut self, size: u32) -> Self {
        self.push_constant_size = size;
        self
    }

    pub fn with_color(mut self, format: ImageFormat, blend: BlendMode) -> Self {
        self.color_format = Some(format);
        self.blend = blend;
        self
    }

    pub fn with_depth(mut self, format: ImageFormat, test: DepthTest) -> Self {
        self.depth_format = Some(format);
        self.depth_test = test;
        self
    }

    pub fn with_topology(mut self, topology: PrimitiveTopology) -> Self {
        self.topology = topology;
        self
    }

    pub fn with_depth_bias(mut self) -> Self {
        self.depth_bias = true;
        self
    }

    pub fn with_back_face_culling(mut self) -> Self {
        self.cull_back_faces = true;
        self
    }
}

/// Descriptor for a compute pipeline.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ComputePipelineDescriptor {
    pub label: Option<String>,
    /// SPIR-V words of the compute shader (`main` entry point).
    pub shader: Vec<u32>,
    pub binding_layouts: Vec<BindingLayoutDescriptor>,
    pub push_constant_size: u32,
}

impl ComputePipelineDescriptor {
    pub fn new(shader: Vec<u32>) -> Self {
        Self {
            shader,
            ..Default::default()
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_binding_layout(mut self, layout: BindingLayoutDescriptor) -> Self {
        self.binding_layouts.push(layout);
        self
    }

    pub fn with_push_constants(mut self, size: u32) -> Self {
        self.push_constant_size = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_layout_assigns_locations() {
        let layout = VertexLayout::new(48)
            .with_attribute(VertexFormat::Float3, 0)
            .with_attribute(VertexFormat::Float3, 12)
            .with_attribute(VertexFormat::Float2, 24);
        let locations: Vec<u32> = layout.attributes.iter().map(|a| a.location).collect();
        assert_eq!(locations, vec![0, 1, 2]);
    }

    #[test]
    fn test_binding_layout_lookup() {
        let layout = BindingLayoutDescriptor::new()
            .with_entry(0, BindingType::UniformBuffer, ShaderStages::GRAPHICS)
            .with_entry(3, BindingType::SampledImage, ShaderStages::FRAGMENT);
        assert_eq!(layout.entry(3).map(|e| e.ty), Some(BindingType::SampledImage));
        assert!(layout.entry(1).is_none());
    }
}
