//! Vulkan physical and logical device management.

use ash::vk;

use crate::backend::QueueKind;
use crate::error::GraphicsError;

use super::instance::REQUIRED_API_VERSION;

/// Queue family chosen for each queue kind. Kinds may share a family when
/// the device has no dedicated one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub compute: u32,
    pub transfer: u32,
}

impl QueueFamilies {
    pub fn get(&self, kind: QueueKind) -> u32 {
        match kind {
            QueueKind::Graphics => self.graphics,
            QueueKind::Compute => self.compute,
            QueueKind::Transfer => self.transfer,
        }
    }

    /// Distinct family indices in graphics, compute, transfer order.
    pub fn unique(&self) -> Vec<u32> {
        let mut unique = Vec::with_capacity(3);
        for family in [self.graphics, self.compute, self.transfer] {
            if !unique.contains(&family) {
                unique.push(family);
            }
        }
        unique
    }

    /// Pick families from their capability flags.
    ///
    /// Graphics must also present. Compute prefers a family without graphics,
    /// transfer one with neither graphics nor compute; each falls back to
    /// the previous choice.
    pub fn select(families: &[vk::QueueFlags], can_present: impl Fn(u32) -> bool) -> Option<Self> {
        let index = |i: usize| i as u32;
        let graphics = (0..families.len())
            .find(|&i| families[i].contains(vk::QueueFlags::GRAPHICS) && can_present(index(i)))
            .map(index)?;

        let compute = families
            .iter()
            .position(|flags| {
                flags.contains(vk::QueueFlags::COMPUTE) && !flags.contains(vk::QueueFlags::GRAPHICS)
            })
            .map(index)
            .unwrap_or(graphics);

        let transfer = families
            .iter()
            .position(|flags| {
                flags.contains(vk::QueueFlags::TRANSFER)
                    && !flags.intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
            })
            .map(index)
            .unwrap_or(compute);

        Some(Self {
            graphics,
            compute,
            transfer,
        })
    }
}

/// Select the best physical device for rendering.
///
/// Candidates need Vulkan 1.3, anisotropic filtering and a graphics family
/// that can present to the surface. Discrete GPUs win over integrated ones.
pub fn select_physical_device(
    instance: &ash::Instance,
    surface_loader: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
) -> Result<(vk::PhysicalDevice, QueueFamilies), GraphicsError> {
    // SAFETY: instance is valid for the duration of the call.
    let devices = unsafe { instance.enumerate_physical_devices() }.map_err(|e| {
        GraphicsError::InitializationFailed(format!(
            "Failed to enumerate physical devices: {:?}",
            e
        ))
    })?;

    if devices.is_empty() {
        return Err(GraphicsError::InitializationFailed(
            "No Vulkan-capable GPU found".to_string(),
        ));
    }

    let mut best = None;
    let mut best_score = 0;

    for device in devices {
        // SAFETY: device comes from enumerate_physical_devices.
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let features = unsafe { instance.get_physical_device_features(device) };
        let name = properties
            .device_name_as_c_str()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if properties.api_version < REQUIRED_API_VERSION {
            log::info!("Skipping GPU {}: Vulkan 1.3 not supported", name);
            continue;
        }
        if features.sampler_anisotropy == vk::FALSE {
            log::info!("Skipping GPU {}: no anisotropic filtering", name);
            continue;
        }

        // SAFETY: device comes from enumerate_physical_devices.
        let family_flags: Vec<vk::QueueFlags> =
            unsafe { instance.get_physical_device_queue_family_properties(device) }
                .iter()
                .map(|family| family.queue_flags)
                .collect();
        let can_present = |family: u32| {
            // SAFETY: family is a valid index for this device.
            unsafe { surface_loader.get_physical_device_surface_support(device, family, surface) }
                .unwrap_or(false)
        };
        let Some(families) = QueueFamilies::select(&family_flags, can_present) else {
            log::info!("Skipping GPU {}: no graphics queue can present", name);
            continue;
        };

        let mut score = 1;
        if properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            score += 1000;
        } else if properties.device_type == vk::PhysicalDeviceType::INTEGRATED_GPU {
            score += 100;
        }
        score += properties.limits.max_image_dimension2_d / 1024;

        log::info!(
            "Found GPU: {} (type: {:?}, score: {}, queues: {:?})",
            name,
            properties.device_type,
            score,
            families
        );

        if score > best_score {
            best_score = score;
            best = Some((device, families));
        }
    }

    best.ok_or_else(|| GraphicsError::InitializationFailed("No suitable GPU found".to_string()))
}

/// Create the logical device with one queue per distinct family.
pub fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    families: &QueueFamilies,
) -> Result<ash::Device, GraphicsError> {
    let queue_priorities = [1.0f32];
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = families
        .unique()
        .into_iter()
        .map(|family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(&queue_priorities)
        })
        .collect();

    let device_extensions = [ash::khr::swapchain::NAME.as_ptr()];

    let features = vk::PhysicalDeviceFeatures::default().sampler_anisotropy(true);
    let mut vulkan_13_features = vk::PhysicalDeviceVulkan13Features::default()
        .dynamic_rendering(true)
        .synchronization2(true);

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&device_extensions)
        .enabled_features(&features)
        .push_next(&mut vulkan_13_features);

    // SAFETY: every pointer in create_info outlives this call.
    unsafe { instance.create_device(physical_device, &create_info, None) }.map_err(|e| {
        GraphicsError::InitializationFailed(format!("Failed to create logical device: {:?}", e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const G: vk::QueueFlags = vk::QueueFlags::from_raw(
        vk::QueueFlags::GRAPHICS.as_raw()
            | vk::QueueFlags::COMPUTE.as_raw()
            | vk::QueueFlags::TRANSFER.as_raw(),
    );
    const C: vk::QueueFlags =
        vk::QueueFlags::from_raw(vk::QueueFlags::COMPUTE.as_raw() | vk::QueueFlags::TRANSFER.as_raw());
    const T: vk::QueueFlags = vk::QueueFlags::TRANSFER;

    #[test]
    fn test_dedicated_families() {
        let families = QueueFamilies::select(&[G, C, T], |_| true).unwrap();
        assert_eq!(
            families,
            QueueFamilies {
                graphics: 0,
                compute: 1,
                transfer: 2
            }
        );
        assert_eq!(families.unique(), vec![0, 1, 2]);
    }

    #[test]
    fn test_single_family_fallback() {
        let families = QueueFamilies::select(&[G], |_| true).unwrap();
        assert_eq!(families.get(QueueKind::Compute), 0);
        assert_eq!(families.get(QueueKind::Transfer), 0);
        assert_eq!(families.unique(), vec![0]);
    }

    #[test]
    fn test_transfer_falls_back_to_compute() {
        let families = QueueFamilies::select(&[G, C], |_| true).unwrap();
        assert_eq!(families.transfer, 1);
    }

    #[test]
    fn test_graphics_must_present() {
        assert!(QueueFamilies::select(&[G, C], |_| false).is_none());
        let families = QueueFamilies::select(&[G, G], |i| i == 1).unwrap();
        assert_eq!(families.graphics, 1);
    }
}
