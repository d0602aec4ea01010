//! Bloom mip chain.
//!
//! Mip `i` is its own `Rgba16Float` image of `max(1, extent >> (i + 1))`.
//! Downsampling walks HDR → mip 0 → … → mip n-1, upsampling walks back
//! from mip n-1 to mip 0, adding each level into the one above. A source is
//! sampled in `ShaderReadOnly`, a destination written as a storage image in
//! `General`, and every step ends with the barrier that flips the image it
//! wrote so the next step can read it.

use bytemuck::{Pod, Zeroable};

use crate::backend::{
    Binding, BindingResource, BindingSetHandle, GpuBackend, ImageHandle, PipelineHandle,
    SamplerHandle,
};
use crate::command::{Access, Barrier, CommandList, ImageBarrier, ImageLayout, PipelineStages};
use crate::error::GraphicsResult;
use crate::shader::{names, ShaderSource};
use crate::types::{
    BindingLayoutDescriptor, BindingType, ComputePipelineDescriptor, Extent2d, ImageDescriptor,
    ImageFormat, ImageUsage, ShaderStages,
};

/// Invocations along each axis of a bloom workgroup.
pub const BLOOM_WORKGROUP: u32 = 8;

/// Extent of bloom mip `level` for a surface of `extent`.
pub fn bloom_mip_extent(extent: Extent2d, level: u32) -> Extent2d {
    extent.mip(level + 1)
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
struct BloomPushConstants {
    source_extent: [u32; 2],
    target_extent: [u32; 2],
}

/// Which way a bloom step goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BloomDirection {
    Down,
    Up,
}

#[derive(Debug, Clone, Copy)]
struct BloomStep {
    direction: BloomDirection,
    source_extent: Extent2d,
    target: usize,
    binding_set: BindingSetHandle,
}

/// Surface-sized images and binding sets of the chain.
#[derive(Debug)]
struct BloomImages {
    mips: Vec<ImageHandle>,
    extents: Vec<Extent2d>,
    steps: Vec<BloomStep>,
}

/// Bloom pipelines plus the chain for the current surface size.
pub struct BloomChain {
    downsample: PipelineHandle,
    upsample: PipelineHandle,
    mip_count: u32,
    images: Option<BloomImages>,
}

impl BloomChain {
    pub fn binding_layout() -> BindingLayoutDescriptor {
        BindingLayoutDescriptor::new()
            .with_entry(0, BindingType::SampledImage, ShaderStages::COMPUTE)
            .with_entry(1, BindingType::StorageImage, ShaderStages::COMPUTE)
            .with_label("bloom")
    }

    pub fn new(
        backend: &dyn GpuBackend,
        shaders: &dyn ShaderSource,
        mip_count: u32,
    ) -> GraphicsResult<Self> {
        let pipeline = |name: &str, label: &str| -> GraphicsResult<PipelineHandle> {
            backend.create_compute_pipeline(
                &ComputePipelineDescriptor::new(shaders.load(name)?)
                    .with_label(label)
                    .with_binding_layout(Self::binding_layout())
                    .with_push_constants(std::mem::size_of::<BloomPushConstants>() as u32),
            )
        };
        let downsample = pipeline(names::BLOOM_DOWNSAMPLE, "bloom downsample")?;
        let upsample = pipeline(names::BLOOM_UPSAMPLE, "bloom upsample")
            .inspect_err(|_| backend.destroy_pipeline(downsample))?;
        Ok(Self {
            downsample,
            upsample,
            mip_count,
            images: None,
        })
    }

    pub fn mip_count(&self) -> u32 {
        self.mip_count
    }

    /// The largest mip, the one composite samples. `None` before the first
    /// [`resize`](Self::resize).
    pub fn output(&self) -> Option<ImageHandle> {
        self.images.as_ref().and_then(|images| images.mips.first().copied())
    }

    pub fn mip_extents(&self) -> &[Extent2d] {
        self.images.as_ref().map_or(&[], |images| &images.extents)
    }

    /// Rebuild the mip images and step binding sets for a new surface. The
    /// device must be idle.
    pub fn resize(
        &mut self,
        backend: &dyn GpuBackend,
        hdr: ImageHandle,
        extent: Extent2d,
        sampler: SamplerHandle,
    ) -> GraphicsResult<()> {
        if let Some(old) = self.images.take() {
            destroy_images(backend, old);
        }

        let mut images = BloomImages {
            mips: Vec::with_capacity(self.mip_count as usize),
            extents: Vec::with_capacity(self.mip_count as usize),
            steps: Vec::with_capacity(self.mip_count as usize * 2),
        };
        if let Err(e) = self.build(backend, &mut images, hdr, extent, sampler) {
            destroy_images(backend, images);
            return Err(e);
        }
        self.images = Some(images);
        Ok(())
    }

    fn build(
        &self,
        backend: &dyn GpuBackend,
        images: &mut BloomImages,
        hdr: ImageHandle,
        extent: Extent2d,
        sampler: SamplerHandle,
    ) -> GraphicsResult<()> {
        for level in 0..self.mip_count {
            let mip_extent = bloom_mip_extent(extent, level);
            let image = backend.create_image(
                &ImageDescriptor::new_2d(
                    mip_extent.width,
                    mip_extent.height,
                    ImageFormat::Rgba16Float,
                    ImageUsage::STORAGE | ImageUsage::SAMPLED,
                )
                .with_label(format!("bloom mip {level}")),
            )?;
            images.mips.push(image);
            images.extents.push(mip_extent);
        }

        let step = |direction: BloomDirection,
                        source: ImageHandle,
                        source_extent: Extent2d,
                        target: usize|
         -> GraphicsResult<BloomStep> {
            let pipeline = match direction {
                BloomDirection::Down => self.downsample,
                BloomDirection::Up => self.upsample,
            };
            let binding_set = backend.create_binding_set(
                pipeline,
                0,
                &[
                    Binding::new(0, BindingResource::SampledImage { image: source, sampler }),
                    Binding::new(1, BindingResource::StorageImage(images.mips[target])),
                ],
            )?;
            Ok(BloomStep {
                direction,
                source_extent,
                target,
                binding_set,
            })
        };

        let count = self.mip_count as usize;
        let mut steps = Vec::with_capacity(count * 2);
        for target in 0..count {
            let (source, source_extent) = if target == 0 {
                (hdr, extent)
            } else {
                (images.mips[target - 1], images.extents[target - 1])
            };
            steps.push(step(BloomDirection::Down, source, source_extent, target)?);
        }
        for target in (0..count.saturating_sub(1)).rev() {
            let source = images.mips[target + 1];
            let source_extent = images.extents[target + 1];
            steps.push(step(BloomDirection::Up, source, source_extent, target)?);
        }
        images.steps = steps;
        Ok(())
    }

    /// Record the chain. The HDR target must already be in `ShaderReadOnly`.
    /// Leaves mip 0 in `ShaderReadOnly` for the composite pass.
    pub fn record(&self, commands: &mut CommandList) {
        let Some(images) = &self.images else {
            return;
        };

        let mut start = Barrier::new(PipelineStages::TOP_OF_PIPE, PipelineStages::COMPUTE_SHADER);
        for &mip in &images.mips {
            start = start.image(ImageBarrier::new(
                mip,
                ImageLayout::Undefined,
                ImageLayout::General,
                Access::empty(),
                Access::SHADER_WRITE,
            ));
        }
        commands.barrier(start);

        let mut bound = None;
        for (i, step) in images.steps.iter().enumerate() {
            let target = images.mips[step.target];
            let pipeline = match step.direction {
                BloomDirection::Down => self.downsample,
                BloomDirection::Up => self.upsample,
            };
            if bound != Some(pipeline) {
                commands.bind_pipeline(pipeline);
                bound = Some(pipeline);
            }
            if step.direction == BloomDirection::Up {
                // Written by the downsample, read back and accumulated into.
                commands.barrier(
                    Barrier::new(PipelineStages::COMPUTE_SHADER, PipelineStages::COMPUTE_SHADER)
                        .image(ImageBarrier::new(
                            target,
                            ImageLayout::ShaderReadOnly,
                            ImageLayout::General,
                            Access::SHADER_READ,
                            Access::SHADER_READ | Access::SHADER_WRITE,
                        )),
                );
            }

            let target_extent = images.extents[step.target];
            commands.bind_binding_set(0, step.binding_set);
            commands.push_constants(&BloomPushConstants {
                source_extent: [step.source_extent.width, step.source_extent.height],
                target_extent: [target_extent.width, target_extent.height],
            });
            commands.dispatch(
                target_extent.width.div_ceil(BLOOM_WORKGROUP),
                target_extent.height.div_ceil(BLOOM_WORKGROUP),
                1,
            );

            let last = i + 1 == images.steps.len();
            let dst_stages = if last {
                PipelineStages::FRAGMENT_SHADER
            } else {
                PipelineStages::COMPUTE_SHADER
            };
            commands.barrier(
                Barrier::new(PipelineStages::COMPUTE_SHADER, dst_stages).image(ImageBarrier::new(
                    target,
                    ImageLayout::General,
                    ImageLayout::ShaderReadOnly,
                    Access::SHADER_WRITE,
                    Access::SHADER_READ,
                )),
            );
        }
    }

    pub fn destroy(mut self, backend: &dyn GpuBackend) {
        if let Some(images) = self.images.take() {
            destroy_images(backend, images);
        }
        backend.destroy_pipeline(self.downsample);
        backend.destroy_pipeline(self.upsample);
    }
}

fn destroy_images(backend: &dyn GpuBackend, images: BloomImages) {
    for step in images.steps {
        backend.destroy_binding_set(step.binding_set);
    }
    for mip in images.mips {
        backend.destroy_image(mip);
    }
}
