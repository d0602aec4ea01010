//! Vulkan backend implementation using ash.
//!
//! One queue is opened per distinct family among graphics, compute and
//! transfer, each with its own command pool behind a lock. Buffers are
//! shared concurrently between families; images are exclusive and move
//! between queues through the ownership transfers recorded in barriers.
//!
//! Integer handles map to native objects in [`ResourceTables`]. Destroy
//! calls release immediately: callers defer them until the GPU is done.

mod allocator;
mod command;
mod conversion;
mod debug;
mod device;
mod encoder;
mod instance;
mod pipeline;
mod resources;
mod swapchain;

use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{AllocationCreateDesc, AllocationScheme, Allocator};
use parking_lot::Mutex;

use crate::backend::{
    Binding, BindingResource, BindingSetHandle, BufferHandle, CommandBufferHandle, FenceHandle,
    GpuBackend, ImageHandle, NativeWindow, PipelineHandle, QueueKind, SamplerHandle,
    SemaphoreHandle, Submission, SwapchainInfo,
};
use crate::config::DeviceConfig;
use crate::error::{GraphicsError, GraphicsResult};
use crate::types::{
    BufferDescriptor, ComputePipelineDescriptor, Extent2d, GraphicsPipelineDescriptor,
    ImageDescriptor, SamplerDescriptor,
};

use self::allocator::{allocation_error, buffer_location, create_allocator};
use self::conversion::{
    convert_address_mode, convert_buffer_usage, convert_compare, convert_filter,
    convert_image_format, convert_image_usage, convert_mipmap_mode, convert_stages, format_aspect,
    map_vk_err,
};
use self::device::QueueFamilies;
use self::encoder::EncodeContext;
use self::instance::InstanceBundle;
use self::pipeline::{DescriptorWrite, PipelineManager, VulkanPipeline};
use self::resources::{ResourceTables, VulkanBuffer, VulkanCommandBuffer, VulkanImage};
use self::swapchain::{SurfaceContext, VulkanSwapchain};

/// Queue plus the command pool whose buffers are submitted to it. Both need
/// external synchronization, so they share one lock.
struct QueueState {
    queue: vk::Queue,
    pool: vk::CommandPool,
}

struct QueueSlot {
    family: u32,
    state: Mutex<QueueState>,
}

/// Vulkan GPU backend.
pub struct VulkanBackend {
    _entry: ash::Entry,
    instance: ash::Instance,
    debug_utils: Option<ash::ext::debug_utils::Instance>,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
    surface_loader: ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    families: QueueFamilies,
    queues: Vec<QueueSlot>,
    swapchain_loader: ash::khr::swapchain::Device,
    swapchain: Mutex<VulkanSwapchain>,
    vsync: bool,
    max_anisotropy: f32,
    allocator: Mutex<ManuallyDrop<Allocator>>,
    pipelines: Mutex<PipelineManager>,
    resources: Mutex<ResourceTables>,
    next_handle: AtomicU64,
}

/// Objects created so far during [`VulkanBackend::new`], destroyed in
/// reverse if a later step fails.
#[derive(Default)]
struct PartialBackend {
    instance: Option<InstanceBundle>,
    surface: Option<(ash::khr::surface::Instance, vk::SurfaceKHR)>,
    device: Option<ash::Device>,
    pools: Vec<vk::CommandPool>,
    swapchain: Option<(ash::khr::swapchain::Device, VulkanSwapchain)>,
}

impl PartialBackend {
    /// Hand every object over to the finished backend.
    fn disarm(&mut self) {
        self.swapchain = None;
        self.pools.clear();
        self.device = None;
        self.surface = None;
        self.instance = None;
    }
}

impl Drop for PartialBackend {
    fn drop(&mut self) {
        // SAFETY: nothing has been submitted yet, so every object is idle.
        unsafe {
            if let Some(device) = &self.device {
                let _ = device.device_wait_idle();
                if let Some((loader, mut swapchain)) = self.swapchain.take() {
                    swapchain.destroy(device, &loader);
                }
                for pool in self.pools.drain(..) {
                    device.destroy_command_pool(pool, None);
                }
                device.destroy_device(None);
            }
            if let Some((loader, surface)) = self.surface.take() {
                loader.destroy_surface(surface, None);
            }
            if let Some(bundle) = self.instance.take() {
                if let (Some(utils), Some(messenger)) = (&bundle.debug_utils, bundle.debug_messenger)
                {
                    utils.destroy_debug_utils_messenger(messenger, None);
                }
                bundle.instance.destroy_instance(None);
            }
        }
    }
}

fn init_err(what: &str) -> impl FnOnce(vk::Result) -> GraphicsError + '_ {
    move |e| GraphicsError::InitializationFailed(format!("Failed to {}: {:?}", what, e))
}

impl VulkanBackend {
    /// Create the instance, surface, device, queues and swapchain for `window`.
    pub fn new(
        config: &DeviceConfig,
        window: &dyn NativeWindow,
        extent: Extent2d,
    ) -> GraphicsResult<Self> {
        let display = window
            .display_handle()
            .map_err(|e| GraphicsError::InitializationFailed(format!("No display handle: {}", e)))?
            .as_raw();
        let window_handle = window
            .window_handle()
            .map_err(|e| GraphicsError::InitializationFailed(format!("No window handle: {}", e)))?
            .as_raw();

        // SAFETY: the loaded library stays alive in `_entry` for the backend's lifetime.
        let entry = unsafe { ash::Entry::load() }.map_err(|e| {
            GraphicsError::InitializationFailed(format!("Failed to load Vulkan: {}", e))
        })?;

        let mut partial = PartialBackend::default();
        let bundle = partial
            .instance
            .insert(instance::create_instance(&entry, display, config.validation)?);
        let instance = bundle.instance.clone();
        let debug_utils = bundle.debug_utils.clone();
        let debug_messenger = bundle.debug_messenger;

        let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);
        // SAFETY: the window outlives the backend; the caller owns both.
        let surface =
            unsafe { ash_window::create_surface(&entry, &instance, display, window_handle, None) }
                .map_err(init_err("create surface"))?;
        partial.surface = Some((surface_loader.clone(), surface));

        let (physical_device, families) =
            device::select_physical_device(&instance, &surface_loader, surface)?;
        // SAFETY: physical_device was returned by this instance.
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        if let Ok(name) = properties.device_name_as_c_str() {
            log::info!("Selected GPU: {}", name.to_string_lossy());
        }

        let device = device::create_logical_device(&instance, physical_device, &families)?;
        partial.device = Some(device.clone());

        let mut queues = Vec::new();
        for family in families.unique() {
            let pool = command::create_command_pool(&device, family)?;
            partial.pools.push(pool);
            // SAFETY: one queue was requested for every unique family.
            let queue = unsafe { device.get_device_queue(family, 0) };
            queues.push(QueueSlot {
                family,
                state: Mutex::new(QueueState { queue, pool }),
            });
        }
        log::info!(
            "Queue families: graphics {}, compute {}, transfer {}",
            families.graphics,
            families.compute,
            families.transfer
        );

        let swapchain_loader = ash::khr::swapchain::Device::new(&instance, &device);
        let ctx = SurfaceContext {
            device: &device,
            surface_loader: &surface_loader,
            swapchain_loader: &swapchain_loader,
            physical_device,
            surface,
        };
        let created = VulkanSwapchain::new(&ctx, extent, config.vsync, None)?;
        let swapchain_info = created.info();
        partial.swapchain = Some((swapchain_loader.clone(), created));

        // Declared after `partial`, so on failure these drop before the device goes.
        let allocator = create_allocator(&instance, physical_device, device.clone())?;
        let pipelines = PipelineManager::new(device.clone())?;

        let Some((_, swapchain)) = partial.swapchain.take() else {
            return Err(GraphicsError::Internal("swapchain missing after init".to_string()));
        };
        partial.disarm();
        log::info!(
            "Vulkan backend ready: {}x{} {:?}",
            swapchain_info.extent.width,
            swapchain_info.extent.height,
            swapchain_info.format
        );

        Ok(Self {
            _entry: entry,
            instance,
            debug_utils,
            debug_messenger,
            surface_loader,
            surface,
            physical_device,
            device,
            families,
            queues,
            swapchain_loader,
            swapchain: Mutex::new(swapchain),
            vsync: config.vsync,
            max_anisotropy: properties.limits.max_sampler_anisotropy,
            allocator: Mutex::new(ManuallyDrop::new(allocator)),
            pipelines: Mutex::new(pipelines),
            resources: Mutex::new(ResourceTables::default()),
            next_handle: AtomicU64::new(1),
        })
    }

    fn next_raw(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn slot(&self, kind: QueueKind) -> &QueueSlot {
        let family = self.families.get(kind);
        self.queues
            .iter()
            .find(|slot| slot.family == family)
            .unwrap_or(&self.queues[0])
    }

    /// Sharing mode for buffers: concurrent across every family in use.
    fn buffer_sharing(&self) -> (vk::SharingMode, Vec<u32>) {
        let families = self.families.unique();
        if families.len() > 1 {
            (vk::SharingMode::CONCURRENT, families)
        } else {
            (vk::SharingMode::EXCLUSIVE, Vec::new())
        }
    }

    fn surface_context(&self) -> SurfaceContext<'_> {
        SurfaceContext {
            device: &self.device,
            surface_loader: &self.surface_loader,
            swapchain_loader: &self.swapchain_loader,
            physical_device: self.physical_device,
            surface: self.surface,
        }
    }

    fn free_allocation(&self, allocation: gpu_allocator::vulkan::Allocation) {
        if let Err(e) = self.allocator.lock().free(allocation) {
            log::warn!("Failed to free GPU memory: {}", e);
        }
    }

    fn destroy_buffer_now(&self, buffer: VulkanBuffer) {
        // SAFETY: the caller guarantees the GPU no longer uses the buffer.
        unsafe { self.device.destroy_buffer(buffer.buffer, None) };
        self.free_allocation(buffer.allocation);
    }

    fn destroy_image_now(&self, image: VulkanImage) {
        // SAFETY: the caller guarantees the GPU no longer uses the image.
        unsafe {
            self.device.destroy_image_view(image.view, None);
            self.device.destroy_image(image.image, None);
        }
        self.free_allocation(image.allocation);
    }

    fn resolve_binding(
        resources: &ResourceTables,
        binding: &Binding,
    ) -> GraphicsResult<(u32, DescriptorWrite)> {
        let write = match binding.resource {
            BindingResource::Buffer {
                buffer,
                offset,
                size,
            } => DescriptorWrite::Buffer {
                buffer: resources.buffer(buffer.raw())?.buffer,
                offset,
                range: if size == u64::MAX { vk::WHOLE_SIZE } else { size },
            },
            BindingResource::SampledImage { image, sampler } => DescriptorWrite::SampledImage {
                view: resources.image(image.raw())?.view,
                sampler: resources.sampler(sampler.raw())?,
            },
            BindingResource::StorageImage(image) => {
                DescriptorWrite::StorageImage(resources.image(image.raw())?.view)
            }
        };
        Ok((binding.binding, write))
    }
}

impl GpuBackend for VulkanBackend {
    fn name(&self) -> &'static str {
        "Vulkan Backend (ash)"
    }

    fn create_buffer(&self, descriptor: &BufferDescriptor) -> GraphicsResult<BufferHandle> {
        if descriptor.size == 0 {
            return Err(GraphicsError::InvalidParameter(format!(
                "buffer {:?} has zero size",
                descriptor.label
            )));
        }
        let label = descriptor.label.as_deref().unwrap_or("buffer");
        let (sharing, families) = self.buffer_sharing();
        let create_info = vk::BufferCreateInfo::default()
            .size(descriptor.size)
            .usage(convert_buffer_usage(descriptor.usage))
            .sharing_mode(sharing)
            .queue_family_indices(&families);

        // SAFETY: create_info is fully initialized.
        let buffer = unsafe { self.device.create_buffer(&create_info, None) }.map_err(|e| {
            GraphicsError::ResourceCreationFailed(format!(
                "Failed to create buffer '{}': {:?}",
                label, e
            ))
        })?;
        // SAFETY: buffer was just created.
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = self
            .allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name: label,
                requirements,
                location: buffer_location(descriptor.usage),
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| allocation_error(label, e));
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                // SAFETY: the buffer has no memory and is unused.
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        // SAFETY: memory and offset come from an allocation for these requirements.
        if let Err(e) = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            self.destroy_buffer_now(VulkanBuffer {
                buffer,
                allocation,
                size: descriptor.size,
            });
            return Err(map_vk_err(e));
        }

        let raw = self.next_raw();
        self.resources.lock().buffers.insert(
            raw,
            VulkanBuffer {
                buffer,
                allocation,
                size: descriptor.size,
            },
        );
        log::trace!("Created buffer '{}' ({} bytes)", label, descriptor.size);
        Ok(BufferHandle::from_raw(raw))
    }

    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> GraphicsResult<()> {
        let mut resources = self.resources.lock();
        let target = resources.buffers.get_mut(&buffer.raw()).ok_or_else(|| {
            GraphicsError::InvalidParameter(format!("write to unknown buffer {buffer:?}"))
        })?;
        let end = offset + data.len() as u64;
        if end > target.size {
            return Err(GraphicsError::InvalidParameter(format!(
                "write of {} bytes at {offset} overflows buffer {buffer:?} of {} bytes",
                data.len(),
                target.size
            )));
        }
        let mapped = target.allocation.mapped_slice_mut().ok_or_else(|| {
            GraphicsError::InvalidParameter(format!("buffer {buffer:?} is not host-visible"))
        })?;
        mapped[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        let removed = self.resources.lock().buffers.remove(&buffer.raw());
        match removed {
            Some(buffer) => self.destroy_buffer_now(buffer),
            None => log::warn!("Destroying unknown buffer {:?}", buffer),
        }
    }

    fn create_image(&self, descriptor: &ImageDescriptor) -> GraphicsResult<ImageHandle> {
        if descriptor.extent.is_empty() {
            return Err(GraphicsError::InvalidParameter(format!(
                "image {:?} has an empty extent",
                descriptor.label
            )));
        }
        let label = descriptor.label.as_deref().unwrap_or("image");
        let format = convert_image_format(descriptor.format);
        let mip_levels = descriptor.mip_level_count.max(1);

        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: descriptor.extent.width,
                height: descriptor.extent.height,
                depth: 1,
            })
            .mip_levels(mip_levels)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(convert_image_usage(descriptor.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        // SAFETY: create_info is fully initialized.
        let image = unsafe { self.device.create_image(&create_info, None) }.map_err(|e| {
            GraphicsError::ResourceCreationFailed(format!(
                "Failed to create image '{}': {:?}",
                label, e
            ))
        })?;
        // SAFETY: image was just created.
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = match self
            .allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name: label,
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| allocation_error(label, e))
        {
            Ok(allocation) => allocation,
            Err(e) => {
                // SAFETY: the image has no memory and is unused.
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let bound = unsafe {
            // SAFETY: memory and offset come from an allocation for these requirements.
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        }
        .map_err(map_vk_err)
        .and_then(|()| {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format)
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(format_aspect(descriptor.format))
                        .level_count(mip_levels)
                        .layer_count(1),
                );
            // SAFETY: image is bound to memory.
            unsafe { self.device.create_image_view(&view_info, None) }.map_err(|e| {
                GraphicsError::ResourceCreationFailed(format!(
                    "Failed to create view for '{}': {:?}",
                    label, e
                ))
            })
        });
        let view = match bound {
            Ok(view) => view,
            Err(e) => {
                // SAFETY: the image is unused.
                unsafe { self.device.destroy_image(image, None) };
                self.free_allocation(allocation);
                return Err(e);
            }
        };

        let raw = self.next_raw();
        self.resources.lock().images.insert(
            raw,
            VulkanImage {
                image,
                view,
                allocation,
                format: descriptor.format,
                extent: descriptor.extent,
            },
        );
        log::trace!(
            "Created image '{}' ({}x{}, {:?})",
            label,
            descriptor.extent.width,
            descriptor.extent.height,
            descriptor.format
        );
        Ok(ImageHandle::from_raw(raw))
    }

    fn destroy_image(&self, image: ImageHandle) {
        let removed = self.resources.lock().images.remove(&image.raw());
        match removed {
            Some(image) => self.destroy_image_now(image),
            None => log::warn!("Destroying unknown image {:?}", image),
        }
    }

    fn create_sampler(&self, descriptor: &SamplerDescriptor) -> GraphicsResult<SamplerHandle> {
        let address_mode = convert_address_mode(descriptor.address_mode);
        let anisotropy = f32::from(descriptor.anisotropy_clamp).min(self.max_anisotropy);
        let filter = convert_filter(descriptor.filter);
        let create_info = vk::SamplerCreateInfo::default()
            .mag_filter(filter)
            .min_filter(filter)
            .mipmap_mode(convert_mipmap_mode(descriptor.filter))
            .address_mode_u(address_mode)
            .address_mode_v(address_mode)
            .address_mode_w(address_mode)
            .anisotropy_enable(anisotropy > 1.0)
            .max_anisotropy(anisotropy.max(1.0))
            .compare_enable(descriptor.compare.is_some())
            .compare_op(descriptor.compare.map_or(vk::CompareOp::NEVER, convert_compare))
            .min_lod(0.0)
            .max_lod(descriptor.lod_max_clamp);

        // SAFETY: create_info is fully initialized.
        let sampler = unsafe { self.device.create_sampler(&create_info, None) }.map_err(|e| {
            GraphicsError::ResourceCreationFailed(format!(
                "Failed to create sampler {:?}: {:?}",
                descriptor.label, e
            ))
        })?;
        let raw = self.next_raw();
        self.resources.lock().samplers.insert(raw, sampler);
        Ok(SamplerHandle::from_raw(raw))
    }

    fn destroy_sampler(&self, sampler: SamplerHandle) {
        if let Some(sampler) = self.resources.lock().samplers.remove(&sampler.raw()) {
            // SAFETY: the caller guarantees the GPU no longer uses the sampler.
            unsafe { self.device.destroy_sampler(sampler, None) };
        }
    }

    fn create_compute_pipeline(
        &self,
        descriptor: &ComputePipelineDescriptor,
    ) -> GraphicsResult<PipelineHandle> {
        let pipeline = self.pipelines.lock().create_compute_pipeline(descriptor)?;
        let raw = self.next_raw();
        self.resources.lock().pipelines.insert(raw, pipeline);
        Ok(PipelineHandle::from_raw(raw))
    }

    fn create_graphics_pipeline(
        &self,
        descriptor: &GraphicsPipelineDescriptor,
    ) -> GraphicsResult<PipelineHandle> {
        let pipeline = self.pipelines.lock().create_graphics_pipeline(descriptor)?;
        let raw = self.next_raw();
        self.resources.lock().pipelines.insert(raw, pipeline);
        Ok(PipelineHandle::from_raw(raw))
    }

    fn destroy_pipeline(&self, pipeline: PipelineHandle) {
        let removed: Option<VulkanPipeline> =
            self.resources.lock().pipelines.remove(&pipeline.raw());
        if let Some(pipeline) = removed {
            self.pipelines.lock().destroy_pipeline(pipeline);
        }
    }

    fn create_binding_set(
        &self,
        pipeline: PipelineHandle,
        set_index: u32,
        bindings: &[Binding],
    ) -> GraphicsResult<BindingSetHandle> {
        let binding_set = {
            let resources = self.resources.lock();
            let target = resources.pipeline(pipeline.raw())?;
            let writes = bindings
                .iter()
                .map(|binding| Self::resolve_binding(&resources, binding))
                .collect::<GraphicsResult<Vec<_>>>()?;
            self.pipelines
                .lock()
                .create_binding_set(target, set_index, &writes)?
        };
        let raw = self.next_raw();
        self.resources.lock().binding_sets.insert(raw, binding_set);
        Ok(BindingSetHandle::from_raw(raw))
    }

    fn destroy_binding_set(&self, binding_set: BindingSetHandle) {
        let removed = self.resources.lock().binding_sets.remove(&binding_set.raw());
        if let Some(binding_set) = removed {
            self.pipelines.lock().free_binding_set(binding_set);
        }
    }

    fn create_command_buffer(&self, queue: QueueKind) -> GraphicsResult<CommandBufferHandle> {
        let buffer = {
            let state = self.slot(queue).state.lock();
            command::allocate_command_buffer(&self.device, state.pool)?
        };
        let raw = self.next_raw();
        self.resources
            .lock()
            .command_buffers
            .insert(raw, VulkanCommandBuffer { buffer, queue });
        Ok(CommandBufferHandle::from_raw(raw))
    }

    fn destroy_command_buffer(&self, command_buffer: CommandBufferHandle) {
        let removed = self
            .resources
            .lock()
            .command_buffers
            .remove(&command_buffer.raw());
        if let Some(command_buffer) = removed {
            let state = self.slot(command_buffer.queue).state.lock();
            // SAFETY: the pool lock is held and the buffer has finished executing.
            unsafe {
                self.device
                    .free_command_buffers(state.pool, &[command_buffer.buffer])
            };
        }
    }

    fn create_fence(&self, signaled: bool) -> GraphicsResult<FenceHandle> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::default().flags(flags);
        // SAFETY: create_info is fully initialized.
        let fence = unsafe { self.device.create_fence(&create_info, None) }.map_err(map_vk_err)?;
        let raw = self.next_raw();
        self.resources.lock().fences.insert(raw, fence);
        Ok(FenceHandle::from_raw(raw))
    }

    fn wait_fence(&self, fence: FenceHandle, timeout: Duration) -> GraphicsResult<bool> {
        let fence = self.resources.lock().fence(fence.raw())?;
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        // SAFETY: the fence is alive; waiting needs no external synchronization.
        match unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(map_vk_err(e)),
        }
    }

    fn reset_fence(&self, fence: FenceHandle) -> GraphicsResult<()> {
        let fence = self.resources.lock().fence(fence.raw())?;
        // SAFETY: the fence is not part of a pending submission.
        unsafe { self.device.reset_fences(&[fence]) }.map_err(map_vk_err)
    }

    fn is_fence_signaled(&self, fence: FenceHandle) -> GraphicsResult<bool> {
        let fence = self.resources.lock().fence(fence.raw())?;
        // SAFETY: the fence is alive.
        unsafe { self.device.get_fence_status(fence) }.map_err(map_vk_err)
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        if let Some(fence) = self.resources.lock().fences.remove(&fence.raw()) {
            // SAFETY: the caller waited for the fence before destroying it.
            unsafe { self.device.destroy_fence(fence, None) };
        }
    }

    fn create_semaphore(&self) -> GraphicsResult<SemaphoreHandle> {
        let create_info = vk::SemaphoreCreateInfo::default();
        // SAFETY: create_info is fully initialized.
        let semaphore =
            unsafe { self.device.create_semaphore(&create_info, None) }.map_err(map_vk_err)?;
        let raw = self.next_raw();
        self.resources.lock().semaphores.insert(raw, semaphore);
        Ok(SemaphoreHandle::from_raw(raw))
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle) {
        if let Some(semaphore) = self.resources.lock().semaphores.remove(&semaphore.raw()) {
            // SAFETY: no pending submission waits on or signals the semaphore.
            unsafe { self.device.destroy_semaphore(semaphore, None) };
        }
    }

    fn submit(&self, submission: &Submission<'_>) -> GraphicsResult<()> {
        let slot = self.slot(submission.queue);
        let state = slot.state.lock();
        let swapchain = self.swapchain.lock();
        let resources = self.resources.lock();

        let command_buffer = resources.command_buffer(submission.command_buffer.raw())?;
        if command_buffer.queue != submission.queue {
            return Err(GraphicsError::InvalidParameter(format!(
                "command buffer for the {} queue submitted to {}",
                command_buffer.queue.name(),
                submission.queue.name()
            )));
        }
        let cmd = command_buffer.buffer;

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        // SAFETY: the pool lock is held and the buffer's last submission completed.
        unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .map_err(map_vk_err)?;
            self.device
                .begin_command_buffer(cmd, &begin_info)
                .map_err(map_vk_err)?;
        }

        let ctx = EncodeContext {
            device: &self.device,
            resources: &resources,
            swapchain: &swapchain,
            families: &self.families,
            queue: submission.queue,
        };
        let encoded = ctx.encode(cmd, submission.commands);
        // SAFETY: cmd is in the recording state.
        let ended = unsafe { self.device.end_command_buffer(cmd) }.map_err(map_vk_err);
        encoded?;
        ended?;

        let waits = submission
            .waits
            .iter()
            .map(|wait| -> GraphicsResult<vk::SemaphoreSubmitInfo<'static>> {
                Ok(vk::SemaphoreSubmitInfo::default()
                    .semaphore(resources.semaphore(wait.semaphore.raw())?)
                    .stage_mask(convert_stages(wait.stages)))
            })
            .collect::<GraphicsResult<Vec<_>>>()?;
        let signals = submission
            .signals
            .iter()
            .map(|&semaphore| -> GraphicsResult<vk::SemaphoreSubmitInfo<'static>> {
                Ok(vk::SemaphoreSubmitInfo::default()
                    .semaphore(resources.semaphore(semaphore.raw())?)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS))
            })
            .collect::<GraphicsResult<Vec<_>>>()?;
        let fence = match submission.fence {
            Some(fence) => resources.fence(fence.raw())?,
            None => vk::Fence::null(),
        };
        drop(resources);
        drop(swapchain);

        let command_buffers = [vk::CommandBufferSubmitInfo::default().command_buffer(cmd)];
        let submit_info = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&waits)
            .command_buffer_infos(&command_buffers)
            .signal_semaphore_infos(&signals);

        // SAFETY: the queue lock is held; every referenced object is alive.
        unsafe { self.device.queue_submit2(state.queue, &[submit_info], fence) }
            .map_err(map_vk_err)
    }

    fn acquire_next_image(&self, signal: SemaphoreHandle) -> GraphicsResult<u32> {
        let semaphore = self.resources.lock().semaphore(signal.raw())?;
        let swapchain = self.swapchain.lock();
        // SAFETY: the swapchain lock serializes acquires against recreation.
        let (index, suboptimal) = unsafe {
            self.swapchain_loader.acquire_next_image(
                swapchain.swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        }
        .map_err(map_vk_err)?;
        if suboptimal {
            log::debug!("Acquired image {} from a suboptimal swapchain", index);
        }
        Ok(index)
    }

    fn present(&self, image_index: u32, wait: SemaphoreHandle) -> GraphicsResult<()> {
        let semaphore = self.resources.lock().semaphore(wait.raw())?;
        let state = self.slot(QueueKind::Graphics).state.lock();
        let swapchain = self.swapchain.lock();

        let wait_semaphores = [semaphore];
        let swapchains = [swapchain.swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        // SAFETY: the graphics queue can present; its lock is held.
        let suboptimal = unsafe { self.swapchain_loader.queue_present(state.queue, &present_info) }
            .map_err(map_vk_err)?;
        if suboptimal {
            return Err(GraphicsError::SurfaceOutdated);
        }
        Ok(())
    }

    fn recreate_swapchain(&self, extent: Extent2d) -> GraphicsResult<SwapchainInfo> {
        self.wait_idle()?;
        let mut swapchain = self.swapchain.lock();
        let ctx = self.surface_context();
        let mut replaced = VulkanSwapchain::new(&ctx, extent, self.vsync, Some(&swapchain))?;
        std::mem::swap(&mut *swapchain, &mut replaced);
        replaced.destroy(&self.device, &self.swapchain_loader);
        Ok(swapchain.info())
    }

    fn swapchain_info(&self) -> SwapchainInfo {
        self.swapchain.lock().info()
    }

    fn wait_idle(&self) -> GraphicsResult<()> {
        // vkDeviceWaitIdle needs every queue externally synchronized.
        let _held: Vec<_> = self.queues.iter().map(|slot| slot.state.lock()).collect();
        // SAFETY: every queue lock is held.
        unsafe { self.device.device_wait_idle() }.map_err(map_vk_err)
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        if let Err(e) = self.wait_idle() {
            log::error!("Failed to wait for device idle at shutdown: {}", e);
        }

        let mut resources = std::mem::take(&mut *self.resources.lock());
        let leaked = resources.live_count();
        if leaked > 0 {
            log::warn!("Vulkan backend dropped with {} live objects", leaked);
        }

        let mut pipelines = self.pipelines.lock();
        for (_, binding_set) in resources.binding_sets.drain() {
            pipelines.free_binding_set(binding_set);
        }
        for (_, pipeline) in resources.pipelines.drain() {
            pipelines.destroy_pipeline(pipeline);
        }
        pipelines.destroy();
        drop(pipelines);

        for (_, buffer) in resources.buffers.drain() {
            self.destroy_buffer_now(buffer);
        }
        for (_, image) in resources.images.drain() {
            self.destroy_image_now(image);
        }

        // SAFETY: the device is idle, so nothing below is in use.
        unsafe {
            for (_, sampler) in resources.samplers.drain() {
                self.device.destroy_sampler(sampler, None);
            }
            for (_, fence) in resources.fences.drain() {
                self.device.destroy_fence(fence, None);
            }
            for (_, semaphore) in resources.semaphores.drain() {
                self.device.destroy_semaphore(semaphore, None);
            }
            // Command buffers go away with their pools.
            for slot in &self.queues {
                self.device.destroy_command_pool(slot.state.lock().pool, None);
            }

            self.swapchain
                .lock()
                .destroy(&self.device, &self.swapchain_loader);

            // The allocator must release its memory blocks before the device goes.
            ManuallyDrop::drop(&mut *self.allocator.lock());

            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            if let (Some(debug_utils), Some(messenger)) = (&self.debug_utils, self.debug_messenger)
            {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
        log::info!("Vulkan backend destroyed");
    }
}
