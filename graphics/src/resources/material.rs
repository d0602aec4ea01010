//! Materials and environment maps: binding sets over pool images.

use ember_core::Handle;

use crate::backend::{
    Binding, BindingResource, BindingSetHandle, GpuBackend, ImageHandle, PipelineHandle,
    SamplerHandle,
};
use crate::error::GraphicsResult;
use crate::types::{BindingLayoutDescriptor, BindingType, ShaderStages};

use super::deletion::GpuResource;
use super::image::GpuImage;
use super::GpuResources;

/// Sampled images in every material binding set.
pub const MATERIAL_TEXTURE_SLOTS: usize = 4;

/// Layout of the material set: albedo, normal, metallic-roughness-AO and
/// emissive, each a combined image sampler.
pub fn material_binding_layout() -> BindingLayoutDescriptor {
    (0..MATERIAL_TEXTURE_SLOTS as u32)
        .fold(BindingLayoutDescriptor::new().with_label("material"), |layout, slot| {
            layout.with_entry(slot, BindingType::SampledImage, ShaderStages::FRAGMENT)
        })
}

/// Layout of the environment set: skybox, irradiance and prefiltered maps.
pub fn environment_binding_layout() -> BindingLayoutDescriptor {
    BindingLayoutDescriptor::new()
        .with_label("environment")
        .with_entry(0, BindingType::SampledImage, ShaderStages::FRAGMENT)
        .with_entry(1, BindingType::SampledImage, ShaderStages::FRAGMENT)
        .with_entry(2, BindingType::SampledImage, ShaderStages::FRAGMENT)
}

/// What a material samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterialDescriptor {
    /// A single base color texture, used by unlit meshes and sprites.
    Textured { base_color: Handle<GpuImage> },
    /// Metallic-roughness PBR.
    Pbr {
        albedo: Handle<GpuImage>,
        normal: Handle<GpuImage>,
        metallic_roughness: Handle<GpuImage>,
        emissive: Option<Handle<GpuImage>>,
    },
}

impl MaterialDescriptor {
    /// Pool image per slot; `None` slots take the renderer's defaults.
    pub fn slots(&self) -> [Option<Handle<GpuImage>>; MATERIAL_TEXTURE_SLOTS] {
        match *self {
            Self::Textured { base_color } => [Some(base_color), None, None, None],
            Self::Pbr {
                albedo,
                normal,
                metallic_roughness,
                emissive,
            } => [Some(albedo), Some(normal), Some(metallic_roughness), emissive],
        }
    }
}

/// Images bound to slots a material leaves empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaterialDefaults {
    pub white: ImageHandle,
    pub flat_normal: ImageHandle,
    pub black: ImageHandle,
}

impl MaterialDefaults {
    pub fn for_slot(&self, slot: usize) -> ImageHandle {
        match slot {
            1 => self.flat_normal,
            3 => self.black,
            _ => self.white,
        }
    }
}

/// A material ready to bind at the material set index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Material {
    descriptor: MaterialDescriptor,
    binding_set: BindingSetHandle,
}

impl Material {
    /// Write `images` (already resolved per slot) into a new binding set of
    /// `pipeline`'s material layout.
    pub fn create(
        backend: &dyn GpuBackend,
        pipeline: PipelineHandle,
        set_index: u32,
        descriptor: MaterialDescriptor,
        images: [ImageHandle; MATERIAL_TEXTURE_SLOTS],
        sampler: SamplerHandle,
    ) -> GraphicsResult<Self> {
        let bindings: Vec<Binding> = images
            .iter()
            .enumerate()
            .map(|(slot, &image)| {
                Binding::new(slot as u32, BindingResource::SampledImage { image, sampler })
            })
            .collect();
        let binding_set = backend.create_binding_set(pipeline, set_index, &bindings)?;
        Ok(Self {
            descriptor,
            binding_set,
        })
    }

    pub fn descriptor(&self) -> &MaterialDescriptor {
        &self.descriptor
    }

    pub fn binding_set(&self) -> BindingSetHandle {
        self.binding_set
    }
}

impl GpuResources for Material {
    fn gpu_resources(&self) -> Vec<GpuResource> {
        vec![GpuResource::BindingSet(self.binding_set)]
    }
}

/// Image-based lighting inputs and the set that binds them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentMap {
    pub skybox: Handle<GpuImage>,
    pub irradiance: Handle<GpuImage>,
    pub prefiltered: Handle<GpuImage>,
    binding_set: BindingSetHandle,
}

impl EnvironmentMap {
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        backend: &dyn GpuBackend,
        pipeline: PipelineHandle,
        set_index: u32,
        handles: [Handle<GpuImage>; 3],
        images: [ImageHandle; 3],
        sampler: SamplerHandle,
    ) -> GraphicsResult<Self> {
        let bindings: Vec<Binding> = images
            .iter()
            .enumerate()
            .map(|(slot, &image)| {
                Binding::new(slot as u32, BindingResource::SampledImage { image, sampler })
            })
            .collect();
        let binding_set = backend.create_binding_set(pipeline, set_index, &bindings)?;
        let [skybox, irradiance, prefiltered] = handles;
        Ok(Self {
            skybox,
            irradiance,
            prefiltered,
            binding_set,
        })
    }

    pub fn binding_set(&self) -> BindingSetHandle {
        self.binding_set
    }
}

impl GpuResources for EnvironmentMap {
    fn gpu_resources(&self) -> Vec<GpuResource> {
        vec![GpuResource::BindingSet(self.binding_set)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_textured_slots() {
        let base = Handle::from_raw(3);
        let slots = MaterialDescriptor::Textured { base_color: base }.slots();
        assert_eq!(slots, [Some(base), None, None, None]);
    }

    #[test]
    fn test_defaults_per_slot() {
        let defaults = MaterialDefaults {
            white: ImageHandle::from_raw(1),
            flat_normal: ImageHandle::from_raw(2),
            black: ImageHandle::from_raw(3),
        };
        assert_eq!(defaults.for_slot(0), defaults.white);
        assert_eq!(defaults.for_slot(1), defaults.flat_normal);
        assert_eq!(defaults.for_slot(2), defaults.white);
        assert_eq!(defaults.for_slot(3), defaults.black);
    }

    #[test]
    fn test_material_layout() {
        let layout = material_binding_layout();
        assert_eq!(layout.entries.len(), MATERIAL_TEXTURE_SLOTS);
        assert!(layout.entries.iter().all(|e| e.ty == BindingType::SampledImage));
    }
}
