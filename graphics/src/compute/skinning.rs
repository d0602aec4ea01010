//! GPU skinning.
//!
//! Every skeletal instance samples up to a handful of clips from the shared
//! animation frame pool, blends them into one local pose per bone, walks the
//! bone hierarchy and writes `bone_count` skinning matrices at
//! `instance * max_bones` in the frame's bone matrix buffer. One invocation
//! handles one instance.
//!
//! [`blend_local_pose`] and [`skin_instance`] are the CPU statement of the
//! shader's math.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Quat, Vec3, Vec4};

use crate::backend::{
    Binding, BindingResource, BindingSetHandle, BufferHandle, GpuBackend, PipelineHandle,
};
use crate::command::CommandList;
use crate::config::SkinningConfig;
use crate::error::GraphicsResult;
use crate::frame::FrameSlot;
use crate::graph::SkeletalRenderJob;
use crate::resources::ResourcePool;
use crate::shader::{names, ShaderSource};
use crate::types::{
    AnimationFrame, AnimationInstanceData, BindingLayoutDescriptor, BindingType, BoneData,
    ComputePipelineDescriptor, ShaderStages, SkeletalInstanceData,
};

/// Invocations per skinning workgroup.
pub const SKINNING_WORKGROUP: u32 = 64;

/// Workgroups needed to skin `instances` instances.
pub fn skinning_groups(instances: u32) -> u32 {
    instances.div_ceil(SKINNING_WORKGROUP)
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
struct SkinningPushConstants {
    instance_count: u32,
    max_bones: u32,
    _pad: [u32; 2],
}

/// Blend the clips in `blends` into the local transform of `bone`.
///
/// Each clip is interpolated between its two frames, then translation,
/// scale and rotation are accumulated weighted by `blend_factor`. Each
/// rotation is negated if needed to share the hemisphere of the first
/// contributing rotation, and the normalized sum is returned with `w >= 0`.
/// A bone no clip animates, or a total weight of zero, yields the identity
/// transform.
pub fn blend_local_pose(
    frames: &[AnimationFrame],
    blends: &[AnimationInstanceData],
    bone: u32,
) -> AnimationFrame {
    let mut translation = Vec3::ZERO;
    let mut scale = Vec3::ZERO;
    let mut rotation = Vec4::ZERO;
    let mut reference: Option<Quat> = None;
    let mut total = 0.0;

    for blend in blends {
        if blend.blend_factor <= 0.0 {
            continue;
        }
        let (Some(a), Some(b)) = (
            blend.frame_record(blend.frame1, bone).and_then(|i| frames.get(i)),
            blend.frame_record(blend.frame2, bone).and_then(|i| frames.get(i)),
        ) else {
            continue;
        };

        let t = blend.frame_blend.clamp(0.0, 1.0);
        let mut q = a.rotation.slerp(b.rotation, t);
        match reference {
            Some(first) if first.dot(q) < 0.0 => q = -q,
            Some(_) => {}
            None => reference = Some(q),
        }
        let w = blend.blend_factor;
        translation += a.position.lerp(b.position, t) * w;
        scale += a.scale.lerp(b.scale, t) * w;
        rotation += Vec4::from(q) * w;
        total += w;
    }

    if total <= f32::EPSILON {
        return AnimationFrame::IDENTITY;
    }
    let mut rotation = Quat::from_vec4(rotation).normalize();
    if rotation.w < 0.0 {
        rotation = -rotation;
    }
    AnimationFrame::new(translation / total, rotation, scale / total)
}

/// Skinning matrices of one instance: the blended pose composed down the
/// hierarchy, times each bone's inverse bind matrix.
///
/// `bones` is the shared hierarchy buffer and `animations` the frame's
/// animation instance buffer. A parent index that does not precede the bone
/// is treated as a root.
pub fn skin_instance(
    frames: &[AnimationFrame],
    bones: &[BoneData],
    animations: &[AnimationInstanceData],
    instance: &SkeletalInstanceData,
) -> Vec<Mat4> {
    let first = instance.animation_instance_offset as usize;
    let last = (first + instance.animation_instance_count as usize).min(animations.len());
    let blends = animations.get(first..last).unwrap_or(&[]);

    let bone_count = instance.bone_count as usize;
    let hierarchy = &bones[instance.bone_offset as usize..][..bone_count];
    let mut globals: Vec<Mat4> = Vec::with_capacity(bone_count);
    for (i, bone) in hierarchy.iter().enumerate() {
        let local = blend_local_pose(frames, blends, i as u32).to_matrix();
        let global = match usize::try_from(bone.parent) {
            Ok(parent) if parent < i => globals[parent] * local,
            _ => local,
        };
        globals.push(global);
    }
    globals
        .iter()
        .zip(hierarchy)
        .map(|(global, bone)| *global * bone.offset_matrix)
        .collect()
}

/// Instance and animation records for one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SkinningPacket {
    pub instances: Vec<SkeletalInstanceData>,
    pub animations: Vec<AnimationInstanceData>,
}

impl SkinningPacket {
    /// Pack `jobs` in `order` (the skeletal batch order). Blends past
    /// `max_animation_instances` are dropped with a warning.
    pub fn pack(
        jobs: &[SkeletalRenderJob],
        order: &[usize],
        pool: &ResourcePool,
        config: &SkinningConfig,
    ) -> Self {
        let mut packet = Self::default();
        let mut dropped_blends = 0usize;

        for &index in order.iter().take(config.max_skeletal_instances as usize) {
            let job = &jobs[index];
            let mesh = pool.get_skeletal_mesh(job.mesh);
            let animation_instance_offset = packet.animations.len() as u32;

            for blend in &job.blends {
                if packet.animations.len() >= config.max_animation_instances as usize {
                    dropped_blends += 1;
                    continue;
                }
                let animation = pool.get_animation(blend.animation);
                let (frame1, frame2, frame_blend) = animation.sample(blend.time);
                packet.animations.push(
                    AnimationInstanceData::new(
                        animation.frame_offset(),
                        frame1,
                        frame2,
                        frame_blend,
                        blend.weight,
                    )
                    .with_bone_stride(animation.bone_count()),
                );
            }

            packet.instances.push(SkeletalInstanceData {
                model: job.transform,
                bone_offset: mesh.bone_offset(),
                bone_count: mesh.bone_count(),
                animation_instance_offset,
                animation_instance_count: packet.animations.len() as u32
                    - animation_instance_offset,
            });
        }

        if dropped_blends > 0 {
            log::warn!(
                "Animation instance buffer full ({}), dropped {} blends",
                config.max_animation_instances,
                dropped_blends
            );
        }
        packet
    }

    pub fn clear(&mut self) {
        self.instances.clear();
        self.animations.clear();
    }

    pub fn instance_count(&self) -> u32 {
        self.instances.len() as u32
    }
}

/// The skinning compute pipeline and its per-slot binding sets.
pub struct SkinningStage {
    pipeline: PipelineHandle,
    binding_sets: Vec<BindingSetHandle>,
    max_bones: u32,
}

impl SkinningStage {
    pub fn binding_layout() -> BindingLayoutDescriptor {
        (0..5)
            .fold(BindingLayoutDescriptor::new(), |layout, binding| {
                layout.with_entry(binding, BindingType::StorageBuffer, ShaderStages::COMPUTE)
            })
            .with_label("skinning")
    }

    pub fn new(
        backend: &dyn GpuBackend,
        shaders: &dyn ShaderSource,
        slots: &[FrameSlot],
        frame_pool: BufferHandle,
        bone_pool: BufferHandle,
        max_bones: u32,
    ) -> GraphicsResult<Self> {
        let descriptor = ComputePipelineDescriptor::new(shaders.load(names::SKINNING)?)
            .with_label("skinning")
            .with_binding_layout(Self::binding_layout())
            .with_push_constants(std::mem::size_of::<SkinningPushConstants>() as u32);
        let pipeline = backend.create_compute_pipeline(&descriptor)?;

        let mut stage = Self {
            pipeline,
            binding_sets: Vec::with_capacity(slots.len()),
            max_bones,
        };
        for slot in slots {
            let buffers = &slot.buffers;
            let bindings = [
                buffers.skeletal_instances,
                buffers.animation_instances,
                frame_pool,
                bone_pool,
                buffers.bone_matrices,
            ]
            .iter()
            .enumerate()
            .map(|(i, &buffer)| Binding::new(i as u32, BindingResource::buffer(buffer)))
            .collect::<Vec<_>>();
            match backend.create_binding_set(pipeline, 0, &bindings) {
                Ok(set) => stage.binding_sets.push(set),
                Err(e) => {
                    stage.destroy(backend);
                    return Err(e);
                }
            }
        }
        Ok(stage)
    }

    /// Copy the packed records into `slot`'s buffers.
    pub fn write(
        &self,
        backend: &dyn GpuBackend,
        slot: &FrameSlot,
        packet: &SkinningPacket,
    ) -> GraphicsResult<()> {
        if packet.instances.is_empty() {
            return Ok(());
        }
        backend.write_buffer(
            slot.buffers.skeletal_instances,
            0,
            bytemuck::cast_slice(&packet.instances),
        )?;
        if !packet.animations.is_empty() {
            backend.write_buffer(
                slot.buffers.animation_instances,
                0,
                bytemuck::cast_slice(&packet.animations),
            )?;
        }
        Ok(())
    }

    /// Record the skinning dispatch. Nothing is recorded without instances.
    pub fn record(&self, slot: &FrameSlot, instance_count: u32, commands: &mut CommandList) {
        if instance_count == 0 {
            return;
        }
        commands.bind_pipeline(self.pipeline);
        commands.bind_binding_set(0, self.binding_sets[slot.index]);
        commands.push_constants(&SkinningPushConstants {
            instance_count,
            max_bones: self.max_bones,
            _pad: [0; 2],
        });
        commands.dispatch(skinning_groups(instance_count), 1, 1);
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
    use std::f32::consts::FRAC_PI_2;

    use super::*;

    const EPS: f32 = 1e-5;

    fn clip_frames() -> Vec<AnimationFrame> {
        // Two single-bone clips of two frames each, packed back to back.
        vec![
            AnimationFrame::new(Vec3::ZERO, Quat::IDENTITY, Vec3::ONE),
            AnimationFrame::new(Vec3::new(2.0, 0.0, 0.0), Quat::IDENTITY, Vec3::ONE),
            AnimationFrame::new(Vec3::new(0.0, 4.0, 0.0), Quat::from_rotation_y(FRAC_PI_2), Vec3::splat(2.0)),
            AnimationFrame::new(Vec3::new(0.0, 4.0, 0.0), Quat::from_rotation_y(FRAC_PI_2), Vec3::splat(2.0)),
        ]
    }

    fn blend(frame_offset: u32, frame_blend: f32, weight: f32) -> AnimationInstanceData {
        AnimationInstanceData::new(frame_offset, 0, 1, frame_blend, weight).with_bone_stride(1)
    }

    fn assert_frame_eq(a: &AnimationFrame, b: &AnimationFrame) {
        assert!(a.position.abs_diff_eq(b.position, EPS), "{a:?} != {b:?}");
        assert!(a.scale.abs_diff_eq(b.scale, EPS), "{a:?} != {b:?}");
        assert!(a.rotation.abs_diff_eq(b.rotation, EPS), "{a:?} != {b:?}");
    }

    #[test]
    fn test_blend_is_order_independent() {
        let frames = clip_frames();
        let a = blend(0, 0.5, 0.3);
        let b = blend(2, 0.0, 0.7);

        let forward = blend_local_pose(&frames, &[a, b], 0);
        let backward = blend_local_pose(&frames, &[b, a], 0);
        assert_frame_eq(&forward, &backward);

        // 0.3 * (1, 0, 0) + 0.7 * (0, 4, 0)
        assert!(forward.position.abs_diff_eq(Vec3::new(0.3, 2.8, 0.0), EPS));
        assert!(forward.scale.abs_diff_eq(Vec3::splat(1.7), EPS));
        assert!((forward.rotation.length() - 1.0).abs() < EPS);
    }

    #[test]
    fn test_no_blends_is_identity() {
        let frames = clip_frames();
        assert_frame_eq(&blend_local_pose(&frames, &[], 0), &AnimationFrame::IDENTITY);
        let silent = blend(0, 0.5, 0.0);
        assert_frame_eq(&blend_local_pose(&frames, &[silent], 0), &AnimationFrame::IDENTITY);
    }

    #[test]
    fn test_unanimated_bone_is_identity() {
        let frames = clip_frames();
        let pose = blend_local_pose(&frames, &[blend(0, 0.0, 1.0)], 3);
        assert_frame_eq(&pose, &AnimationFrame::IDENTITY);
    }

    #[test]
    fn test_opposite_hemisphere_rotations_agree() {
        let q = Quat::from_rotation_z(0.4);
        let frames = vec![
            AnimationFrame::new(Vec3::ZERO, q, Vec3::ONE),
            AnimationFrame::new(Vec3::ZERO, -q, Vec3::ONE),
        ];
        let blends = [
            AnimationInstanceData::new(0, 0, 0, 0.0, 0.5).with_bone_stride(1),
            AnimationInstanceData::new(1, 0, 0, 0.0, 0.5).with_bone_stride(1),
        ];
        let pose = blend_local_pose(&frames, &blends, 0);
        assert!(pose.rotation.abs_diff_eq(q, EPS));
    }

    #[test]
    fn test_half_turn_rotations_do_not_cancel() {
        // Either side of a half turn about Z: w has opposite signs but the
        // rotations are two degrees apart.
        let frames = vec![
            AnimationFrame::new(Vec3::ZERO, Quat::from_rotation_z(179f32.to_radians()), Vec3::ONE),
            AnimationFrame::new(Vec3::ZERO, Quat::from_rotation_z(181f32.to_radians()), Vec3::ONE),
        ];
        let blends = [
            AnimationInstanceData::new(0, 0, 0, 0.0, 0.5).with_bone_stride(1),
            AnimationInstanceData::new(1, 0, 0, 0.0, 0.5).with_bone_stride(1),
        ];
        let pose = blend_local_pose(&frames, &blends, 0);
        assert!((pose.rotation * Vec3::X).abs_diff_eq(-Vec3::X, 1e-4));
        assert!(pose.rotation.w >= 0.0);
    }

    #[test]
    fn test_skin_instance_composes_hierarchy() {
        // Bone 1 hangs off bone 0; the clip moves bone 0 up and bone 1 right.
        let frames = vec![
            AnimationFrame::new(Vec3::Y, Quat::IDENTITY, Vec3::ONE),
            AnimationFrame::new(Vec3::X, Quat::IDENTITY, Vec3::ONE),
        ];
        let bind = Mat4::from_translation(Vec3::new(0.0, -1.0, 0.0));
        let bones = [BoneData::new(-1, Mat4::IDENTITY), BoneData::new(0, bind)];
        let animations = [AnimationInstanceData::new(0, 0, 0, 0.0, 1.0).with_bone_stride(2)];
        let instance = SkeletalInstanceData {
            model: Mat4::IDENTITY,
            bone_offset: 0,
            bone_count: 2,
            animation_instance_offset: 0,
            animation_instance_count: 1,
        };

        let matrices = skin_instance(&frames, &bones, &animations, &instance);
        assert_eq!(matrices.len(), 2);
        assert!(matrices[0].abs_diff_eq(Mat4::from_translation(Vec3::Y), EPS));
        // global(1) = T(Y) * T(X), times the inverse bind T(-Y).
        assert!(matrices[1].abs_diff_eq(Mat4::from_translation(Vec3::X), EPS));
    }

    #[test]
    fn test_skin_without_animation_is_inverse_bind() {
        let bind = Mat4::from_scale(Vec3::splat(0.5));
        let bones = [BoneData::new(-1, bind), BoneData::new(5, bind)];
        let instance = SkeletalInstanceData {
            model: Mat4::IDENTITY,
            bone_offset: 0,
            bone_count: 2,
            animation_instance_offset: 0,
            animation_instance_count: 0,
        };
        let matrices = skin_instance(&[], &bones, &[], &instance);
        assert!(matrices.iter().all(|m| m.abs_diff_eq(bind, EPS)));
    }

    #[test]
    fn test_group_count() {
        assert_eq!(skinning_groups(0), 0);
        assert_eq!(skinning_groups(1), 1);
        assert_eq!(skinning_groups(64), 1);
        assert_eq!(skinning_groups(65), 2);
    }
}
