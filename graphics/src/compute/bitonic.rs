//! Bitonic depth sort of the particle buffer.
//!
//! The sort runs over the whole particle array (`max_particles` entries, a
//! power of two). Dead slots past the live count sort as `-inf` so they end
//! up behind every live particle. Each invocation compares one pair, so a
//! workgroup of `wg` invocations covers a window of `2 * wg` elements:
//!
//! ```text
//! LocalSort(2wg)                       sort every window in shared memory
//! Flip(h) Disperse(h/2) .. LocalDisperse(2wg)   for h = 4wg, 8wg, .. n
//! ```
//!
//! Flip compares mirrored pairs inside a block of `h`, disperse compares
//! pairs `h/2` apart. Once the pair distance fits in one window the rest of
//! the disperse cascade runs locally.

use bytemuck::{Pod, Zeroable};

use crate::backend::{
    Binding, BindingResource, BindingSetHandle, GpuBackend, PipelineHandle,
};
use crate::command::{Access, Barrier, CommandList, PipelineStages};
use crate::error::GraphicsResult;
use crate::frame::FrameSlot;
use crate::shader::{names, ShaderSource};
use crate::types::{
    BindingLayoutDescriptor, BindingType, ComputePipelineDescriptor, DrawIndirectCommand,
    ShaderStages,
};

/// One dispatch of the sort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortStep {
    /// Full bitonic sort of each window of `h` elements.
    LocalSort(u32),
    /// Mirrored compare-and-swap across blocks of `h`.
    Flip(u32),
    /// Compare-and-swap of pairs `h / 2` apart.
    Disperse(u32),
    /// The disperse cascade from `h` down to 2, inside one window.
    LocalDisperse(u32),
}

impl SortStep {
    /// Value of the `algorithm` push constant.
    pub fn algorithm(&self) -> u32 {
        match self {
            Self::LocalSort(_) => 0,
            Self::Flip(_) => 1,
            Self::Disperse(_) => 2,
            Self::LocalDisperse(_) => 3,
        }
    }

    pub fn height(&self) -> u32 {
        match *self {
            Self::LocalSort(h) | Self::Flip(h) | Self::Disperse(h) | Self::LocalDisperse(h) => h,
        }
    }
}

/// Push constants of `bitonic_sort.comp`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct SortPushConstants {
    pub height: u32,
    pub algorithm: u32,
    pub element_count: u32,
    _pad: u32,
}

/// The ordered dispatches that sort `element_count` keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitonicSchedule {
    element_count: u32,
    workgroup_size: u32,
    steps: Vec<SortStep>,
}

impl BitonicSchedule {
    /// Build the schedule. Both arguments must be powers of two.
    pub fn new(element_count: u32, workgroup_size: u32) -> Self {
        assert!(
            element_count.is_power_of_two() && workgroup_size.is_power_of_two(),
            "bitonic sort needs power-of-two sizes, got {element_count} elements and workgroup {workgroup_size}"
        );

        let window = workgroup_size.saturating_mul(2);
        let mut steps = Vec::new();
        let mut h = window.min(element_count);
        steps.push(SortStep::LocalSort(h));

        h *= 2;
        while h <= element_count {
            steps.push(SortStep::Flip(h));
            let mut hh = h / 2;
            while hh > 1 {
                if hh <= window {
                    steps.push(SortStep::LocalDisperse(hh));
                    break;
                }
                steps.push(SortStep::Disperse(hh));
                hh /= 2;
            }
            h *= 2;
        }

        Self {
            element_count,
            workgroup_size,
            steps,
        }
    }

    pub fn steps(&self) -> &[SortStep] {
        &self.steps
    }

    pub fn element_count(&self) -> u32 {
        self.element_count
    }

    pub fn workgroup_size(&self) -> u32 {
        self.workgroup_size
    }

    /// Workgroups per dispatch.
    pub fn group_count(&self) -> u32 {
        (self.element_count / self.workgroup_size.saturating_mul(2)).max(1)
    }
}

fn flip_pair(t: usize, h: usize) -> (usize, usize) {
    let half = h / 2;
    let q = (2 * t / h) * h;
    (q + t % half, q + h - t % half - 1)
}

fn disperse_pair(t: usize, h: usize) -> (usize, usize) {
    let half = h / 2;
    let q = (2 * t / h) * h;
    let a = q + t % half;
    (a, a + half)
}

fn compare_pass(keys: &mut [f32], h: usize, flip: bool) -> usize {
    let mut swaps = 0;
    for t in 0..keys.len() / 2 {
        let (a, b) = if flip { flip_pair(t, h) } else { disperse_pair(t, h) };
        if keys[a] < keys[b] {
            keys.swap(a, b);
            swaps += 1;
        }
    }
    swaps
}

fn disperse_cascade(keys: &mut [f32], from: usize) -> usize {
    let mut swaps = 0;
    let mut h = from;
    while h > 1 {
        swaps += compare_pass(keys, h, false);
        h /= 2;
    }
    swaps
}

/// Sort `keys` in descending order by running `schedule` on the CPU, the
/// same compare-and-swaps the GPU performs. Returns how many swaps were made.
pub fn sort_host(keys: &mut [f32], schedule: &BitonicSchedule) -> usize {
    assert_eq!(
        keys.len(),
        schedule.element_count() as usize,
        "key count does not match the schedule"
    );

    let mut swaps = 0;
    for step in schedule.steps() {
        let h = step.height() as usize;
        swaps += match step {
            SortStep::LocalSort(_) => {
                let mut local = 0;
                let mut hh = 2;
                while hh <= h {
                    local += compare_pass(keys, hh, true);
                    local += disperse_cascade(keys, hh / 2);
                    hh *= 2;
                }
                local
            }
            SortStep::Flip(_) => compare_pass(keys, h, true),
            SortStep::Disperse(_) => compare_pass(keys, h, false),
            SortStep::LocalDisperse(_) => disperse_cascade(keys, h),
        };
    }
    swaps
}

/// GPU side of the depth sort.
pub struct DepthSort {
    pipeline: PipelineHandle,
    binding_sets: Vec<BindingSetHandle>,
    schedule: BitonicSchedule,
}

impl DepthSort {
    pub fn binding_layout() -> BindingLayoutDescriptor {
        BindingLayoutDescriptor::new()
            .with_entry(0, BindingType::StorageBuffer, ShaderStages::COMPUTE)
            .with_label("bitonic sort")
    }

    pub fn new(
        backend: &dyn GpuBackend,
        shaders: &dyn ShaderSource,
        slots: &[FrameSlot],
        element_count: u32,
        workgroup_size: u32,
    ) -> GraphicsResult<Self> {
        let descriptor = ComputePipelineDescriptor::new(shaders.load(names::BITONIC_SORT)?)
            .with_label("bitonic sort")
            .with_binding_layout(Self::binding_layout())
            .with_push_constants(std::mem::size_of::<SortPushConstants>() as u32);
        let pipeline = backend.create_compute_pipeline(&descriptor)?;

        let mut sort = Self {
            pipeline,
            binding_sets: Vec::with_capacity(slots.len()),
            schedule: BitonicSchedule::new(element_count, workgroup_size),
        };
        for slot in slots {
            let set = backend.create_binding_set(
                pipeline,
                0,
                &[Binding::new(0, BindingResource::buffer(slot.buffers.particles))],
            );
            match set {
                Ok(set) => sort.binding_sets.push(set),
                Err(e) => {
                    sort.destroy(backend);
                    return Err(e);
                }
            }
        }
        log::debug!(
            "Depth sort ready: {} elements, {} steps",
            element_count,
            sort.schedule.steps().len()
        );
        Ok(sort)
    }

    pub fn schedule(&self) -> &BitonicSchedule {
        &self.schedule
    }

    /// Record the sort of `slot`'s particle buffer, then copy the live count
    /// into the slot's indirect draw arguments.
    pub fn record(&self, slot: &FrameSlot, commands: &mut CommandList) {
        let particles = slot.buffers.particles;
        let groups = self.schedule.group_count();

        commands.bind_pipeline(self.pipeline);
        commands.bind_binding_set(0, self.binding_sets[slot.index]);
        for (i, step) in self.schedule.steps().iter().enumerate() {
            if i > 0 {
                commands.barrier(
                    Barrier::new(PipelineStages::COMPUTE_SHADER, PipelineStages::COMPUTE_SHADER)
                        .buffer(
                            particles,
                            Access::SHADER_WRITE,
                            Access::SHADER_READ | Access::SHADER_WRITE,
                        ),
                );
            }
            commands.push_constants(&SortPushConstants {
                height: step.height(),
                algorithm: step.algorithm(),
                element_count: self.schedule.element_count(),
                _pad: 0,
            });
            commands.dispatch(groups, 1, 1);
        }

        commands.barrier(
            Barrier::new(PipelineStages::COMPUTE_SHADER, PipelineStages::TRANSFER)
                .buffer(particles, Access::SHADER_WRITE, Access::TRANSFER_READ),
        );
        commands.copy_buffer(
            particles,
            0,
            slot.buffers.draw_indirect,
            DrawIndirectCommand::INSTANCE_COUNT_OFFSET,
            4,
        );
    }

    pub fn destroy(self, backend: &dyn GpuBackend) {
        for set in self.binding_sets {
            backend.destroy_binding_set(set);
        }
        backend.destroy_pipeline(self.pipeline);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(count: usize, seed: u32) -> Vec<f32> {
        let mut state = seed;
        (0..count)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (state >> 8) as f32 / (1 << 24) as f32 * 100.0 - 50.0
            })
            .collect()
    }

    #[test]
    fn test_schedule_shape() {
        let schedule = BitonicSchedule::new(16, 2);
        assert_eq!(
            schedule.steps(),
            &[
                SortStep::LocalSort(4),
                SortStep::Flip(8),
                SortStep::LocalDisperse(4),
                SortStep::Flip(16),
                SortStep::Disperse(8),
                SortStep::LocalDisperse(4),
            ]
        );
        assert_eq!(schedule.group_count(), 4);
    }

    #[test]
    fn test_small_input_is_a_single_local_sort() {
        let schedule = BitonicSchedule::new(8, 256);
        assert_eq!(schedule.steps(), &[SortStep::LocalSort(8)]);
        assert_eq!(schedule.group_count(), 1);
    }

    #[test]
    fn test_flip_and_disperse_pairs() {
        assert_eq!(flip_pair(0, 4), (0, 3));
        assert_eq!(flip_pair(1, 4), (1, 2));
        assert_eq!(flip_pair(2, 4), (4, 7));
        assert_eq!(disperse_pair(0, 4), (0, 2));
        assert_eq!(disperse_pair(3, 4), (5, 7));
    }

    #[test]
    fn test_sorts_descending() {
        let schedule = BitonicSchedule::new(64, 4);
        let mut data = keys(64, 7);
        let mut expected = data.clone();
        expected.sort_by(|a, b| b.total_cmp(a));

        sort_host(&mut data, &schedule);
        assert_eq!(data, expected);
    }

    #[test]
    fn test_second_run_performs_no_swaps() {
        let schedule = BitonicSchedule::new(128, 8);
        let mut data = keys(128, 3);
        assert!(sort_host(&mut data, &schedule) > 0);
        assert_eq!(sort_host(&mut data, &schedule), 0);
    }

    #[test]
    fn test_dead_particles_sort_last() {
        let schedule = BitonicSchedule::new(8, 1);
        let mut data = vec![f32::NEG_INFINITY, 3.0, f32::NEG_INFINITY, 1.0, 2.0, f32::NEG_INFINITY, 5.0, 4.0];
        sort_host(&mut data, &schedule);
        assert_eq!(&data[..5], &[5.0, 4.0, 3.0, 2.0, 1.0]);
        assert!(data[5..].iter().all(|k| *k == f32::NEG_INFINITY));
    }

    #[test]
    #[should_panic(expected = "power-of-two")]
    fn test_rejects_non_power_of_two() {
        BitonicSchedule::new(12, 4);
    }
}
