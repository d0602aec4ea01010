//! Vulkan swapchain creation and recreation.
//!
//! The surface format is chosen once, on first creation, and kept across
//! every recreation so pipelines built against it stay valid.

use ash::vk;

use crate::backend::SwapchainInfo;
use crate::error::GraphicsError;
use crate::types::{Extent2d, ImageFormat};

use super::conversion::{image_format_from_vk, map_vk_err};

/// Surface formats in order of preference.
const PREFERRED_FORMATS: [vk::Format; 4] = [
    vk::Format::B8G8R8A8_SRGB,
    vk::Format::R8G8B8A8_SRGB,
    vk::Format::B8G8R8A8_UNORM,
    vk::Format::R8G8B8A8_UNORM,
];

/// Loaders and handles the swapchain is created against.
pub struct SurfaceContext<'a> {
    pub device: &'a ash::Device,
    pub surface_loader: &'a ash::khr::surface::Instance,
    pub swapchain_loader: &'a ash::khr::swapchain::Device,
    pub physical_device: vk::PhysicalDevice,
    pub surface: vk::SurfaceKHR,
}

/// Vulkan swapchain resources.
pub struct VulkanSwapchain {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,
    pub surface_format: vk::SurfaceFormatKHR,
    pub format: ImageFormat,
    pub extent: Extent2d,
}

impl VulkanSwapchain {
    /// Create a swapchain for `extent`. Passing the previous swapchain keeps
    /// its surface format and lets the driver recycle its images; the old
    /// swapchain still has to be destroyed by the caller.
    pub fn new(
        ctx: &SurfaceContext<'_>,
        extent: Extent2d,
        vsync: bool,
        previous: Option<&VulkanSwapchain>,
    ) -> Result<Self, GraphicsError> {
        // SAFETY: physical_device and surface belong to the same instance.
        let capabilities = unsafe {
            ctx.surface_loader
                .get_physical_device_surface_capabilities(ctx.physical_device, ctx.surface)
        }
        .map_err(map_vk_err)?;

        let (surface_format, format) = match previous {
            Some(previous) => (previous.surface_format, previous.format),
            None => {
                // SAFETY: as above.
                let formats = unsafe {
                    ctx.surface_loader
                        .get_physical_device_surface_formats(ctx.physical_device, ctx.surface)
                }
                .map_err(map_vk_err)?;
                choose_surface_format(&formats).ok_or_else(|| {
                    GraphicsError::FeatureNotSupported(
                        "Surface offers no supported color format".to_string(),
                    )
                })?
            }
        };

        // SAFETY: as above.
        let present_modes = unsafe {
            ctx.surface_loader
                .get_physical_device_surface_present_modes(ctx.physical_device, ctx.surface)
        }
        .map_err(map_vk_err)?;
        let present_mode = choose_present_mode(&present_modes, vsync);

        let vk_extent = choose_extent(&capabilities, extent);
        let image_count = choose_image_count(&capabilities);

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(ctx.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(vk_extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(previous.map_or(vk::SwapchainKHR::null(), |p| p.swapchain));

        // SAFETY: create_info references only live handles.
        let swapchain = unsafe { ctx.swapchain_loader.create_swapchain(&create_info, None) }
            .map_err(|e| match e {
                vk::Result::ERROR_SURFACE_LOST_KHR => GraphicsError::SurfaceLost,
                other => GraphicsError::ResourceCreationFailed(format!(
                    "Failed to create swapchain: {:?}",
                    other
                )),
            })?;

        let mut created = Self {
            swapchain,
            images: Vec::new(),
            views: Vec::new(),
            surface_format,
            format,
            extent: Extent2d::new(vk_extent.width, vk_extent.height),
        };
        if let Err(e) = created.create_views(ctx) {
            created.destroy(ctx.device, ctx.swapchain_loader);
            return Err(e);
        }

        log::info!(
            "Swapchain created: {}x{} {:?}, {} images, {:?}",
            vk_extent.width,
            vk_extent.height,
            format,
            created.images.len(),
            present_mode
        );
        Ok(created)
    }

    fn create_views(&mut self, ctx: &SurfaceContext<'_>) -> Result<(), GraphicsError> {
        // SAFETY: swapchain was just created by this loader.
        self.images = unsafe { ctx.swapchain_loader.get_swapchain_images(self.swapchain) }
            .map_err(map_vk_err)?;

        for &image in &self.images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.surface_format.format)
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .level_count(1)
                        .layer_count(1),
                );
            // SAFETY: image is owned by the swapchain and outlives the view.
            let view = unsafe { ctx.device.create_image_view(&view_info, None) }.map_err(|e| {
                GraphicsError::ResourceCreationFailed(format!(
                    "Failed to create swapchain image view: {:?}",
                    e
                ))
            })?;
            self.views.push(view);
        }
        Ok(())
    }

    pub fn info(&self) -> SwapchainInfo {
        SwapchainInfo {
            extent: self.extent,
            format: self.format,
            image_count: self.images.len() as u32,
        }
    }

    /// Destroy the views and the swapchain. The device must be idle.
    pub fn destroy(&mut self, device: &ash::Device, loader: &ash::khr::swapchain::Device) {
        // SAFETY: no command using these views is pending once the device is idle.
        unsafe {
            for view in self.views.drain(..) {
                device.destroy_image_view(view, None);
            }
            if self.swapchain != vk::SwapchainKHR::null() {
                loader.destroy_swapchain(self.swapchain, None);
                self.swapchain = vk::SwapchainKHR::null();
            }
        }
        self.images.clear();
    }
}

/// First preferred sRGB-nonlinear format the surface offers, falling back
/// to anything this crate has a format for.
pub fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
) -> Option<(vk::SurfaceFormatKHR, ImageFormat)> {
    let supported = |candidate: &vk::SurfaceFormatKHR| {
        image_format_from_vk(candidate.format).map(|format| (*candidate, format))
    };

    PREFERRED_FORMATS
        .iter()
        .find_map(|&wanted| {
            formats
                .iter()
                .find(|f| {
                    f.format == wanted && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
                })
                .and_then(supported)
        })
        .or_else(|| formats.iter().find_map(supported))
}

/// FIFO when vsync is on; otherwise MAILBOX, then IMMEDIATE. FIFO is
/// always available.
pub fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| modes.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

pub fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, requested: Extent2d) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: requested.width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: requested.height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// One more than the minimum, within the maximum when there is one.
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let wanted = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        wanted.min(capabilities.max_image_count)
    } else {
        wanted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface_format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    #[test]
    fn test_prefers_srgb() {
        let formats = [
            surface_format(vk::Format::B8G8R8A8_UNORM),
            surface_format(vk::Format::B8G8R8A8_SRGB),
        ];
        let (_, format) = choose_surface_format(&formats).unwrap();
        assert_eq!(format, ImageFormat::Bgra8Srgb);
    }

    #[test]
    fn test_unknown_formats_rejected() {
        let formats = [surface_format(vk::Format::A2B10G10R10_UNORM_PACK32)];
        assert!(choose_surface_format(&formats).is_none());
    }

    #[test]
    fn test_present_mode() {
        let all = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::IMMEDIATE,
        ];
        assert_eq!(choose_present_mode(&all, true), vk::PresentModeKHR::FIFO);
        assert_eq!(choose_present_mode(&all, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO], false),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn test_extent_and_image_count() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 1024,
                height: 1024,
            },
            min_image_count: 2,
            max_image_count: 2,
            ..Default::default()
        };
        let extent = choose_extent(&caps, Extent2d::new(4096, 300));
        assert_eq!((extent.width, extent.height), (1024, 300));
        assert_eq!(choose_image_count(&caps), 2);
    }
}
