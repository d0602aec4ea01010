//! Instance batching.
//!
//! Jobs sharing a mesh and material become one instanced draw. Each batch
//! occupies a contiguous range of the frame's instance buffer, with the
//! jobs that do not cast shadows at the front of the range so the shadow
//! pass can skip them by offsetting `first_instance`:
//!
//! ```text
//! instance buffer  | b0: nsc nsc c c c | b1: c c | b2: nsc |
//! shadow draws       first+2, count 3    first, 2   (skipped)
//! ```

use std::collections::HashMap;

use ember_core::Handle;

use crate::resources::{Material, Mesh, MeshRef, SkeletalMesh};

use super::jobs::{SkeletalRenderJob, SpriteRenderJob, StaticRenderJob};

const BATCH_HASH_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Hash of a `(mesh, material)` pair.
pub fn batch_hash(mesh: u64, material: u64) -> u64 {
    let mut hash: u64 = 1;
    hash = hash.wrapping_mul(BATCH_HASH_PRIME).wrapping_add(mesh);
    hash.wrapping_mul(BATCH_HASH_PRIME).wrapping_add(material)
}

/// A job that can be grouped into a [`RenderBatch`].
pub trait BatchJob {
    type Mesh;

    fn mesh(&self) -> Handle<Self::Mesh>;
    fn material(&self) -> Handle<Material>;
    fn casts_shadows(&self) -> bool;
}

impl BatchJob for StaticRenderJob {
    type Mesh = Mesh;

    fn mesh(&self) -> Handle<Mesh> {
        self.mesh
    }

    fn material(&self) -> Handle<Material> {
        self.material
    }

    fn casts_shadows(&self) -> bool {
        self.casts_shadows
    }
}

impl BatchJob for SkeletalRenderJob {
    type Mesh = SkeletalMesh;

    fn mesh(&self) -> Handle<SkeletalMesh> {
        self.mesh
    }

    fn material(&self) -> Handle<Material> {
        self.material
    }

    fn casts_shadows(&self) -> bool {
        self.casts_shadows
    }
}

/// Mesh kinds a batch can reference.
pub trait BatchMesh: Sized {
    fn mesh_ref(handle: Handle<Self>) -> MeshRef;
}

impl BatchMesh for Mesh {
    fn mesh_ref(handle: Handle<Self>) -> MeshRef {
        MeshRef::Static(handle)
    }
}

impl BatchMesh for SkeletalMesh {
    fn mesh_ref(handle: Handle<Self>) -> MeshRef {
        MeshRef::Skeletal(handle)
    }
}

/// One instanced draw.
#[derive(Debug)]
pub struct RenderBatch<M> {
    pub mesh: Handle<M>,
    pub material: Handle<Material>,
    pub first_instance: u32,
    pub instance_count: u32,
    /// Leading instances excluded from the shadow pass.
    pub non_shadow_caster_count: u32,
}

impl<M> Clone for RenderBatch<M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M> Copy for RenderBatch<M> {}

impl<M> RenderBatch<M> {
    /// `(first_instance, instance_count)` of the shadow casters, `None` when
    /// the batch has none.
    pub fn shadow_range(&self) -> Option<(u32, u32)> {
        let casters = self.instance_count - self.non_shadow_caster_count;
        (casters > 0).then_some((
            self.first_instance + self.non_shadow_caster_count,
            casters,
        ))
    }
}

/// Batches of one job kind and the job order that fills the instance buffer.
#[derive(Debug)]
pub struct BatchPlan<M> {
    pub batches: Vec<RenderBatch<M>>,
    /// Job indices in instance buffer order.
    pub order: Vec<usize>,
    /// Jobs dropped for exceeding the capacity.
    pub dropped: usize,
}

impl<M> Default for BatchPlan<M> {
    fn default() -> Self {
        Self {
            batches: Vec::new(),
            order: Vec::new(),
            dropped: 0,
        }
    }
}

impl<M> BatchPlan<M> {
    pub fn instance_count(&self) -> u32 {
        self.order.len() as u32
    }
}

struct Group<M> {
    mesh: Handle<M>,
    material: Handle<Material>,
    non_casters: Vec<usize>,
    casters: Vec<usize>,
}

/// Groups jobs into batches, keeping batches in first-seen order.
pub struct BatchBuilder;

impl BatchBuilder {
    /// Batch at most `capacity` jobs; the rest are dropped with a warning.
    pub fn build<J: BatchJob>(jobs: &[J], capacity: u32, kind: &str) -> BatchPlan<J::Mesh> {
        let accepted = jobs.len().min(capacity as usize);
        let dropped = jobs.len() - accepted;
        if dropped > 0 {
            log::warn!(
                "{} {} jobs exceed the capacity of {}, dropping {}",
                jobs.len(),
                kind,
                capacity,
                dropped
            );
        }

        let mut groups: Vec<Group<J::Mesh>> = Vec::new();
        let mut by_hash: HashMap<u64, Vec<usize>> = HashMap::new();
        for (index, job) in jobs[..accepted].iter().enumerate() {
            let (mesh, material) = (job.mesh(), job.material());
            let candidates = by_hash
                .entry(batch_hash(mesh.raw(), material.raw()))
                .or_default();
            let group = match candidates
                .iter()
                .copied()
                .find(|&g| groups[g].mesh == mesh && groups[g].material == material)
            {
                Some(g) => g,
                None => {
                    groups.push(Group {
                        mesh,
                        material,
                        non_casters: Vec::new(),
                        casters: Vec::new(),
                    });
                    candidates.push(groups.len() - 1);
                    groups.len() - 1
                }
            };
            if job.casts_shadows() {
                groups[group].casters.push(index);
            } else {
                groups[group].non_casters.push(index);
            }
        }

        let mut plan = BatchPlan {
            batches: Vec::with_capacity(groups.len()),
            order: Vec::with_capacity(accepted),
            dropped,
        };
        for group in groups {
            let first_instance = plan.order.len() as u32;
            let non_shadow_caster_count = group.non_casters.len() as u32;
            plan.order.extend(group.non_casters);
            plan.order.extend(group.casters);
            plan.batches.push(RenderBatch {
                mesh: group.mesh,
                material: group.material,
                first_instance,
                instance_count: plan.order.len() as u32 - first_instance,
                non_shadow_caster_count,
            });
        }
        plan
    }
}

/// Consecutive sprites sharing a material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpriteBatch {
    pub material: Handle<Material>,
    pub first_instance: u32,
    pub instance_count: u32,
}

/// Group sprites by material in first-seen order, filling at most
/// `capacity` instances. Returns the batches and the sprite order.
pub fn batch_sprites(sprites: &[SpriteRenderJob], capacity: u32) -> (Vec<SpriteBatch>, Vec<usize>) {
    let accepted = sprites.len().min(capacity as usize);
    if accepted < sprites.len() {
        log::warn!(
            "{} sprites exceed the capacity of {}, dropping {}",
            sprites.len(),
            capacity,
            sprites.len() - accepted
        );
    }

    let mut groups: Vec<(Handle<Material>, Vec<usize>)> = Vec::new();
    for (index, sprite) in sprites[..accepted].iter().enumerate() {
        match groups.iter_mut().find(|(m, _)| *m == sprite.material) {
            Some((_, members)) => members.push(index),
            None => groups.push((sprite.material, vec![index])),
        }
    }

    let mut batches = Vec::with_capacity(groups.len());
    let mut order = Vec::with_capacity(accepted);
    for (material, members) in groups {
        batches.push(SpriteBatch {
            material,
            first_instance: order.len() as u32,
            instance_count: members.len() as u32,
        });
        order.extend(members);
    }
    (batches, order)
}

#[cfg(test)]
mod tests {
    use glam::Mat4;

    use super::*;
    use crate::types::SpriteInstanceData;

    fn job(mesh: u64, material: u64, casts_shadows: bool) -> StaticRenderJob {
        let job = StaticRenderJob::new(
            Handle::from_raw(mesh),
            Handle::from_raw(material),
            Mat4::IDENTITY,
        );
        if casts_shadows { job } else { job.without_shadows() }
    }

    #[test]
    fn test_hash_distinguishes_mesh_and_material() {
        assert_ne!(batch_hash(1, 2), batch_hash(2, 1));
        assert_eq!(batch_hash(3, 4), batch_hash(3, 4));
        assert_eq!(batch_hash(0, 0), BATCH_HASH_PRIME.wrapping_mul(BATCH_HASH_PRIME));
    }

    #[test]
    fn test_groups_by_mesh_and_material() {
        let jobs = [
            job(1, 1, true),
            job(2, 1, true),
            job(1, 1, true),
            job(1, 2, true),
            job(2, 1, true),
        ];
        let plan = BatchBuilder::build(&jobs, 100, "static");

        assert_eq!(plan.batches.len(), 3);
        assert_eq!(plan.order, vec![0, 2, 1, 4, 3]);
        let ranges: Vec<(u32, u32)> = plan
            .batches
            .iter()
            .map(|b| (b.first_instance, b.instance_count))
            .collect();
        assert_eq!(ranges, vec![(0, 2), (2, 2), (4, 1)]);
        assert_eq!(plan.batches[1].mesh, Handle::from_raw(2));
    }

    #[test]
    fn test_non_casters_lead_each_batch() {
        let jobs = [
            job(1, 1, true),
            job(1, 1, false),
            job(1, 1, true),
            job(1, 1, false),
        ];
        let plan = BatchBuilder::build(&jobs, 100, "static");
        let batch = plan.batches[0];

        assert_eq!(plan.order, vec![1, 3, 0, 2]);
        assert_eq!(batch.non_shadow_caster_count, 2);
        assert_eq!(batch.shadow_range(), Some((2, 2)));
    }

    #[test]
    fn test_batch_without_casters_has_no_shadow_range() {
        let plan = BatchBuilder::build(&[job(1, 1, false)], 100, "static");
        assert_eq!(plan.batches[0].shadow_range(), None);
    }

    #[test]
    fn test_capacity_drops_trailing_jobs() {
        let jobs: Vec<_> = (0..10).map(|i| job(i % 3 + 1, 1, true)).collect();
        let plan = BatchBuilder::build(&jobs, 4, "static");
        assert_eq!(plan.instance_count(), 4);
        assert_eq!(plan.dropped, 6);
        assert!(plan.order.iter().all(|&i| i < 4));
    }

    #[test]
    fn test_sprite_batches() {
        let sprite = |material: u64| SpriteRenderJob {
            material: Handle::from_raw(material),
            sprite: SpriteInstanceData::new([0.0, 0.0], [1.0, 1.0], [1.0; 4]),
        };
        let sprites = [sprite(1), sprite(2), sprite(1)];
        let (batches, order) = batch_sprites(&sprites, 2);
        assert_eq!(order, vec![0, 1]);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].first_instance, 1);
    }
}
