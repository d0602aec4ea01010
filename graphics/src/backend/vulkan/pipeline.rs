//! Vulkan pipeline, layout and descriptor set management.
//!
//! Descriptor set layouts are cached by their entries, so two pipelines
//! declaring the same set get the same layout and a binding set created for
//! one can be bound with the other.

use std::collections::HashMap;

use ash::vk;

use crate::error::GraphicsError;
use crate::types::{
    BindingLayoutDescriptor, BindingLayoutEntry, BindingType, BlendMode,
    ComputePipelineDescriptor, DepthTest, GraphicsPipelineDescriptor,
};

use super::conversion::{
    convert_binding_type, convert_image_format, convert_shader_stages, convert_topology,
    convert_vertex_format, map_vk_err,
};

const ENTRY_POINT: &std::ffi::CStr = c"main";

/// Sets per descriptor pool; another pool is created when one runs out.
const SETS_PER_POOL: u32 = 256;

const DEPTH_BIAS_CONSTANT: f32 = 1.25;
const DEPTH_BIAS_SLOPE: f32 = 1.75;

/// A pipeline together with everything needed to bind resources to it.
pub struct VulkanPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub bind_point: vk::PipelineBindPoint,
    pub push_stages: vk::ShaderStageFlags,
    pub set_layouts: Vec<vk::DescriptorSetLayout>,
    pub binding_layouts: Vec<BindingLayoutDescriptor>,
}

/// A descriptor set and the pool it must be freed to.
pub struct VulkanBindingSet {
    pub set: vk::DescriptorSet,
    pub pool: vk::DescriptorPool,
}

/// Resolved resource for one descriptor write.
pub enum DescriptorWrite {
    Buffer {
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    },
    SampledImage {
        view: vk::ImageView,
        sampler: vk::Sampler,
    },
    StorageImage(vk::ImageView),
}

impl DescriptorWrite {
    fn matches(&self, ty: BindingType) -> bool {
        matches!(
            (self, ty),
            (Self::Buffer { .. }, BindingType::UniformBuffer | BindingType::StorageBuffer)
                | (Self::SampledImage { .. }, BindingType::SampledImage)
                | (Self::StorageImage(_), BindingType::StorageImage)
        )
    }
}

/// Manages Vulkan pipelines and related resources.
pub struct PipelineManager {
    device: ash::Device,
    set_layout_cache: HashMap<Vec<BindingLayoutEntry>, vk::DescriptorSetLayout>,
    descriptor_pools: Vec<vk::DescriptorPool>,
}

impl PipelineManager {
    pub fn new(device: ash::Device) -> Result<Self, GraphicsError> {
        let mut manager = Self {
            device,
            set_layout_cache: HashMap::new(),
            descriptor_pools: Vec::new(),
        };
        manager.grow_descriptor_pools()?;
        Ok(manager)
    }

    fn grow_descriptor_pools(&mut self) -> Result<vk::DescriptorPool, GraphicsError> {
        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: SETS_PER_POOL,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: SETS_PER_POOL * 4,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: SETS_PER_POOL * 4,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_IMAGE,
                descriptor_count: SETS_PER_POOL / 2,
            },
        ];

        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(SETS_PER_POOL)
            .pool_sizes(&pool_sizes);

        // SAFETY: device is valid; the pool is destroyed in `destroy`.
        let pool = unsafe { self.device.create_descriptor_pool(&pool_info, None) }.map_err(|e| {
            GraphicsError::ResourceCreationFailed(format!(
                "Failed to create descriptor pool: {:?}",
                e
            ))
        })?;
        self.descriptor_pools.push(pool);
        log::debug!("Descriptor pool #{} created", self.descriptor_pools.len());
        Ok(pool)
    }

    /// Layout for `descriptor`, created on first use.
    fn set_layout(
        &mut self,
        descriptor: &BindingLayoutDescriptor,
    ) -> Result<vk::DescriptorSetLayout, GraphicsError> {
        let mut key = descriptor.entries.clone();
        key.sort_by_key(|e| e.binding);
        if let Some(&layout) = self.set_layout_cache.get(&key) {
            return Ok(layout);
        }

        let bindings: Vec<vk::DescriptorSetLayoutBinding> = key
            .iter()
            .map(|entry| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(entry.binding)
                    .descriptor_type(convert_binding_type(entry.ty))
                    .descriptor_count(1)
                    .stage_flags(convert_shader_stages(entry.stages))
            })
            .collect();
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);

        // SAFETY: device is valid; layouts live until `destroy`.
        let layout = unsafe { self.device.create_descriptor_set_layout(&layout_info, None) }
            .map_err(|e| {
                GraphicsError::ResourceCreationFailed(format!(
                    "Failed to create descriptor set layout {:?}: {:?}",
                    descriptor.label, e
                ))
            })?;
        self.set_layout_cache.insert(key, layout);
        Ok(layout)
    }

    fn create_layout(
        &mut self,
        binding_layouts: &[BindingLayoutDescriptor],
        push_constant_size: u32,
        push_stages: vk::ShaderStageFlags,
    ) -> Result<(vk::PipelineLayout, Vec<vk::DescriptorSetLayout>), GraphicsError> {
        let set_layouts = binding_layouts
            .iter()
            .map(|layout| self.set_layout(layout))
            .collect::<Result<Vec<_>, _>>()?;

        let push_ranges = [vk::PushConstantRange::default()
            .stage_flags(push_stages)
            .offset(0)
            .size(push_constant_size)];
        let push_ranges: &[vk::PushConstantRange] = if push_constant_size > 0 {
            &push_ranges
        } else {
            &[]
        };

        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(push_ranges);

        // SAFETY: set layouts are alive in the cache.
        let layout = unsafe { self.device.create_pipeline_layout(&layout_info, None) }.map_err(
            |e| {
                GraphicsError::ResourceCreationFailed(format!(
                    "Failed to create pipeline layout: {:?}",
                    e
                ))
            },
        )?;
        Ok((layout, set_layouts))
    }

    fn create_shader_module(&self, words: &[u32]) -> Result<vk::ShaderModule, GraphicsError> {
        if words.is_empty() {
            return Err(GraphicsError::InvalidParameter(
                "empty SPIR-V module".to_string(),
            ));
        }
        let info = vk::ShaderModuleCreateInfo::default().code(words);
        // SAFETY: words is SPIR-V loaded and checked by the shader directory.
        unsafe { self.device.create_shader_module(&info, None) }.map_err(|e| {
            GraphicsError::ResourceCreationFailed(format!("Failed to create shader module: {:?}", e))
        })
    }

    pub fn create_compute_pipeline(
        &mut self,
        descriptor: &ComputePipelineDescriptor,
    ) -> Result<VulkanPipeline, GraphicsError> {
        let label = descriptor.label.as_deref().unwrap_or("compute");
        let push_stages = vk::ShaderStageFlags::COMPUTE;
        let module = self.create_shader_module(&descriptor.shader)?;
        let (layout, set_layouts) = match self.create_layout(
            &descriptor.binding_layouts,
            descriptor.push_constant_size,
            push_stages,
        ) {
            Ok(created) => created,
            Err(e) => {
                // SAFETY: the module is unused.
                unsafe { self.device.destroy_shader_module(module, None) };
                return Err(e);
            }
        };

        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(ENTRY_POINT);
        let create_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(layout);

        // SAFETY: module and layout are valid; the module is only needed during creation.
        let result = unsafe {
            self.device
                .create_compute_pipelines(vk::PipelineCache::null(), &[create_info], None)
        };
        unsafe { self.device.destroy_shader_module(module, None) };

        let pipeline = match result {
            Ok(pipelines) => pipelines[0],
            Err((_, e)) => {
                // SAFETY: the layout is not referenced by any pipeline.
                unsafe { self.device.destroy_pipeline_layout(layout, None) };
                return Err(GraphicsError::ResourceCreationFailed(format!(
                    "Failed to create compute pipeline '{}': {:?}",
                    label, e
                )));
            }
        };

        log::debug!("Created compute pipeline '{}'", label);
        Ok(VulkanPipeline {
            pipeline,
            layout,
            bind_point: vk::PipelineBindPoint::COMPUTE,
            push_stages,
            set_layouts,
            binding_layouts: descriptor.binding_layouts.clone(),
        })
    }

    pub fn create_graphics_pipeline(
        &mut self,
        descriptor: &GraphicsPipelineDescriptor,
    ) -> Result<VulkanPipeline, GraphicsError> {
        let label = descriptor.label.as_deref().unwrap_or("graphics");
        let push_stages = vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT;

        let mut modules = vec![self.create_shader_module(&descriptor.vertex_shader)?];
        if let Some(fragment) = &descriptor.fragment_shader {
            match self.create_shader_module(fragment) {
                Ok(module) => modules.push(module),
                Err(e) => {
                    self.destroy_modules(&modules);
                    return Err(e);
                }
            }
        }

        let (layout, set_layouts) = match self.create_layout(
            &descriptor.binding_layouts,
            descriptor.push_constant_size,
            push_stages,
        ) {
            Ok(created) => created,
            Err(e) => {
                self.destroy_modules(&modules);
                return Err(e);
            }
        };

        let result = self.build_graphics_pipeline(descriptor, &modules, layout);
        self.destroy_modules(&modules);

        let pipeline = match result {
            Ok(pipeline) => pipeline,
            Err(e) => {
                // SAFETY: the layout is not referenced by any pipeline.
                unsafe { self.device.destroy_pipeline_layout(layout, None) };
                return Err(GraphicsError::ResourceCreationFailed(format!(
                    "Failed to create graphics pipeline '{}': {:?}",
                    label, e
                )));
            }
        };

        log::debug!("Created graphics pipeline '{}'", label);
        Ok(VulkanPipeline {
            pipeline,
            layout,
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            push_stages,
            set_layouts,
            binding_layouts: descriptor.binding_layouts.clone(),
        })
    }

    fn build_graphics_pipeline(
        &self,
        descriptor: &GraphicsPipelineDescriptor,
        modules: &[vk::ShaderModule],
        layout: vk::PipelineLayout,
    ) -> Result<vk::Pipeline, vk::Result> {
        let stage_flags = [vk::ShaderStageFlags::VERTEX, vk::ShaderStageFlags::FRAGMENT];
        let stages: Vec<vk::PipelineShaderStageCreateInfo> = modules
            .iter()
            .zip(stage_flags)
            .map(|(&module, stage)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(stage)
                    .module(module)
                    .name(ENTRY_POINT)
            })
            .collect();

        let (vertex_bindings, vertex_attributes) = match &descriptor.vertex_layout {
            Some(vertex_layout) => (
                vec![vk::VertexInputBindingDescription::default()
                    .binding(0)
                    .stride(vertex_layout.stride)
                    .input_rate(vk::VertexInputRate::VERTEX)],
                vertex_layout
                    .attributes
                    .iter()
                    .map(|attr| {
                        vk::VertexInputAttributeDescription::default()
                            .location(attr.location)
                            .binding(0)
                            .format(convert_vertex_format(attr.format))
                            .offset(attr.offset)
                    })
                    .collect(),
            ),
            None => (Vec::new(), Vec::new()),
        };
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&vertex_bindings)
            .vertex_attribute_descriptions(&vertex_attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(convert_topology(descriptor.topology));

        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(if descriptor.cull_back_faces {
                vk::CullModeFlags::BACK
            } else {
                vk::CullModeFlags::NONE
            })
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0)
            .depth_bias_enable(descriptor.depth_bias)
            .depth_bias_constant_factor(DEPTH_BIAS_CONSTANT)
            .depth_bias_slope_factor(DEPTH_BIAS_SLOPE);

        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let (depth_test, depth_write) = match descriptor.depth_test {
            DepthTest::Disabled => (false, false),
            DepthTest::ReadOnly => (true, false),
            DepthTest::ReadWrite => (true, true),
        };
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(depth_test)
            .depth_write_enable(depth_write)
            .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL);

        let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = descriptor
            .color_format
            .iter()
            .map(|_| blend_attachment(descriptor.blend))
            .collect();
        let color_blend =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let color_formats: Vec<vk::Format> = descriptor
            .color_format
            .iter()
            .map(|&format| convert_image_format(format))
            .collect();
        let depth_format = descriptor
            .depth_format
            .map_or(vk::Format::UNDEFINED, convert_image_format);
        let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&color_formats)
            .depth_attachment_format(depth_format);

        let create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .push_next(&mut rendering_info);

        // SAFETY: every state struct outlives this call.
        unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None)
        }
        .map(|pipelines| pipelines[0])
        .map_err(|(_, e)| e)
    }

    fn destroy_modules(&self, modules: &[vk::ShaderModule]) {
        for &module in modules {
            // SAFETY: modules are only referenced during pipeline creation.
            unsafe { self.device.destroy_shader_module(module, None) };
        }
    }

    /// Destroy a pipeline and its layout. Cached set layouts stay alive.
    pub fn destroy_pipeline(&self, pipeline: VulkanPipeline) {
        // SAFETY: the caller guarantees the GPU no longer uses the pipeline.
        unsafe {
            self.device.destroy_pipeline(pipeline.pipeline, None);
            self.device.destroy_pipeline_layout(pipeline.layout, None);
        }
    }

    /// Allocate a set for `set_index` of `pipeline` and write `writes` into it.
    pub fn create_binding_set(
        &mut self,
        pipeline: &VulkanPipeline,
        set_index: u32,
        writes: &[(u32, DescriptorWrite)],
    ) -> Result<VulkanBindingSet, GraphicsError> {
        let index = set_index as usize;
        let (Some(&layout), Some(binding_layout)) = (
            pipeline.set_layouts.get(index),
            pipeline.binding_layouts.get(index),
        ) else {
            return Err(GraphicsError::InvalidParameter(format!(
                "pipeline has no binding set {}",
                set_index
            )));
        };

        let mut typed = Vec::with_capacity(writes.len());
        for (binding, write) in writes {
            let Some(entry) = binding_layout.entry(*binding) else {
                return Err(GraphicsError::InvalidParameter(format!(
                    "set {} has no binding {}",
                    set_index, binding
                )));
            };
            if !write.matches(entry.ty) {
                return Err(GraphicsError::InvalidParameter(format!(
                    "binding {} of set {} expects {:?}",
                    binding, set_index, entry.ty
                )));
            }
            typed.push((*binding, convert_binding_type(entry.ty), write));
        }

        let allocated = self.allocate_set(layout)?;
        self.write_set(allocated.set, &typed);
        Ok(allocated)
    }

    fn allocate_set(
        &mut self,
        layout: vk::DescriptorSetLayout,
    ) -> Result<VulkanBindingSet, GraphicsError> {
        let layouts = [layout];
        let mut retried = false;
        loop {
            let pool = match self.descriptor_pools.last() {
                Some(&pool) => pool,
                None => self.grow_descriptor_pools()?,
            };
            let alloc_info = vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(pool)
                .set_layouts(&layouts);

            // SAFETY: pool and layout are alive; the manager lock serializes pool access.
            match unsafe { self.device.allocate_descriptor_sets(&alloc_info) } {
                Ok(sets) => {
                    return Ok(VulkanBindingSet { set: sets[0], pool });
                }
                Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL)
                    if !retried =>
                {
                    retried = true;
                    self.grow_descriptor_pools()?;
                }
                Err(e) => return Err(map_vk_err(e)),
            }
        }
    }

    fn write_set(&self, set: vk::DescriptorSet, writes: &[(u32, vk::DescriptorType, &DescriptorWrite)]) {
        enum Info {
            Buffer(vk::DescriptorBufferInfo),
            Image(vk::DescriptorImageInfo),
        }

        let infos: Vec<(u32, vk::DescriptorType, Info)> = writes
            .iter()
            .map(|&(binding, ty, write)| {
                let info = match *write {
                    DescriptorWrite::Buffer {
                        buffer,
                        offset,
                        range,
                    } => Info::Buffer(
                        vk::DescriptorBufferInfo::default()
                            .buffer(buffer)
                            .offset(offset)
                            .range(range),
                    ),
                    DescriptorWrite::SampledImage { view, sampler } => Info::Image(
                        vk::DescriptorImageInfo::default()
                            .image_view(view)
                            .sampler(sampler)
                            .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
                    ),
                    DescriptorWrite::StorageImage(view) => Info::Image(
                        vk::DescriptorImageInfo::default()
                            .image_view(view)
                            .image_layout(vk::ImageLayout::GENERAL),
                    ),
                };
                (binding, ty, info)
            })
            .collect();

        let descriptor_writes: Vec<vk::WriteDescriptorSet> = infos
            .iter()
            .map(|(binding, ty, info)| {
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(*binding)
                    .descriptor_type(*ty);
                match info {
                    Info::Buffer(buffer) => write.buffer_info(std::slice::from_ref(buffer)),
                    Info::Image(image) => write.image_info(std::slice::from_ref(image)),
                }
            })
            .collect();

        // SAFETY: the set was just allocated and is not in use.
        unsafe { self.device.update_descriptor_sets(&descriptor_writes, &[]) };
    }

    /// Return a set to its pool.
    pub fn free_binding_set(&self, binding_set: VulkanBindingSet) {
        // SAFETY: the caller guarantees the GPU no longer uses the set.
        if let Err(e) = unsafe {
            self.device
                .free_descriptor_sets(binding_set.pool, &[binding_set.set])
        } {
            log::warn!("Failed to free descriptor set: {:?}", e);
        }
    }

    /// Destroy pools and cached layouts. The device must be idle.
    pub fn destroy(&mut self) {
        // SAFETY: the device is idle and every pipeline has been destroyed.
        unsafe {
            for pool in self.descriptor_pools.drain(..) {
                self.device.destroy_descriptor_pool(pool, None);
            }
            for (_, layout) in self.set_layout_cache.drain() {
                self.device.destroy_descriptor_set_layout(layout, None);
            }
        }
    }

    pub fn cached_set_layouts(&self) -> usize {
        self.set_layout_cache.len()
    }
}

fn blend_attachment(blend: BlendMode) -> vk::PipelineColorBlendAttachmentState {
    let state = vk::PipelineColorBlendAttachmentState::default()
        .color_write_mask(vk::ColorComponentFlags::RGBA);
    match blend {
        BlendMode::Opaque => state.blend_enable(false),
        BlendMode::Alpha => state
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .alpha_blend_op(vk::BlendOp::ADD),
        BlendMode::Additive => state
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::ONE)
            .dst_color_blend_factor(vk::BlendFactor::ONE)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE)
            .alpha_blend_op(vk::BlendOp::ADD),
    }
}
