//! Long-lived GPU resources.
//!
//! The [`ResourcePool`] owns everything loaded outside the frame loop:
//! meshes, skeletal meshes, images, materials, animations, environment maps
//! and font atlases. Each category lives in its own [`Arena`] and is
//! addressed by a typed [`Handle`]. Handles are handed out in strictly
//! increasing order per category and are never reused.
//!
//! Releasing a resource removes it from its arena immediately but only queues
//! its backend objects in the [`DeletionQueue`]; they are destroyed once the
//! frames that may still reference them have completed.

pub mod animation;
pub mod deletion;
pub mod font;
pub mod image;
pub mod material;
pub mod mesh;
pub mod upload;

pub use animation::{Animation, AnimationData, SharedRecordBuffer};
pub use deletion::{DeletionEntry, DeletionQueue, GpuResource};
pub use font::{FontAtlas, FontAtlasData, Glyph};
pub use image::{GpuImage, ImageData, MAX_MIP_LEVELS};
pub use material::{
    EnvironmentMap, MATERIAL_TEXTURE_SLOTS, Material, MaterialDefaults, MaterialDescriptor,
    environment_binding_layout, material_binding_layout,
};
pub use mesh::{DrawInfo, Mesh, MeshData, MeshDrawInfo, MeshRef, SkeletalMesh, SkeletalMeshData};
pub use upload::ImageUploader;

use ember_core::{Arena, Handle};

use crate::backend::GpuBackend;
use crate::config::SkinningConfig;
use crate::error::GraphicsResult;
use crate::types::{AnimationFrame, BoneData};

/// Backend objects owned by a pool entry.
pub trait GpuResources {
    fn gpu_resources(&self) -> Vec<GpuResource>;
}

macro_rules! pool_category {
    (
        $field:ident: $ty:ty, $category:literal,
        $add:ident, $get:ident, $try_get:ident, $find:ident, $release:ident
    ) => {
        #[doc = concat!("Register a ", $category, " and return its handle.")]
        pub fn $add(&mut self, name: impl Into<String>, resource: $ty) -> Handle<$ty> {
            self.$field.insert(name, resource)
        }

        #[doc = concat!("Get a ", $category, ". Panics if the handle is not live.")]
        pub fn $get(&self, handle: Handle<$ty>) -> &$ty {
            match self.$field.get(handle) {
                Some(resource) => resource,
                None => panic!("invalid {} handle {}", $category, handle),
            }
        }

        pub fn $try_get(&self, handle: Handle<$ty>) -> Option<&$ty> {
            self.$field.get(handle)
        }

        pub fn $find(&self, name: &str) -> Option<Handle<$ty>> {
            self.$field.find(name)
        }

        #[doc = concat!("Remove a ", $category, " and queue its GPU objects for deferred destruction.")]
        pub fn $release(&mut self, handle: Handle<$ty>) -> bool {
            match self.$field.remove(handle) {
                Some(resource) => {
                    let frame = self.current_frame;
                    for gpu in resource.gpu_resources() {
                        self.deletion_queue.push(gpu, frame);
                    }
                    true
                }
                None => {
                    log::warn!("Release of unknown {} handle {}", $category, handle);
                    false
                }
            }
        }
    };
}

/// Arena-backed storage of every long-lived GPU resource.
#[derive(Debug)]
pub struct ResourcePool {
    meshes: Arena<Mesh>,
    skeletal_meshes: Arena<SkeletalMesh>,
    images: Arena<GpuImage>,
    materials: Arena<Material>,
    animations: Arena<Animation>,
    environment_maps: Arena<EnvironmentMap>,
    font_atlases: Arena<FontAtlas>,

    deletion_queue: DeletionQueue<GpuResource>,
    current_frame: u64,

    animation_frames: SharedRecordBuffer<AnimationFrame>,
    bones: SharedRecordBuffer<BoneData>,
    max_bones: u32,
}

impl ResourcePool {
    /// Create an empty pool and the shared animation frame and bone buffers.
    pub fn new(backend: &dyn GpuBackend, config: &SkinningConfig) -> GraphicsResult<Self> {
        let frame_records = u32::try_from(config.frame_pool_records()).unwrap_or(u32::MAX);
        let animation_frames =
            SharedRecordBuffer::new(backend, "animation frames", frame_records)?;
        let bones = match SharedRecordBuffer::new(backend, "bones", config.max_bone_records) {
            Ok(bones) => bones,
            Err(e) => {
                animation_frames.destroy(backend);
                return Err(e);
            }
        };

        Ok(Self {
            meshes: Arena::new(),
            skeletal_meshes: Arena::new(),
            images: Arena::new(),
            materials: Arena::new(),
            animations: Arena::new(),
            environment_maps: Arena::new(),
            font_atlases: Arena::new(),
            deletion_queue: DeletionQueue::new(),
            current_frame: 0,
            animation_frames,
            bones,
            max_bones: config.max_bones,
        })
    }

    pool_category!(meshes: Mesh, "mesh", add_mesh, get_mesh, try_get_mesh, find_mesh, release_mesh);
    pool_category!(
        skeletal_meshes: SkeletalMesh, "skeletal mesh",
        add_skeletal_mesh, get_skeletal_mesh, try_get_skeletal_mesh, find_skeletal_mesh,
        release_skeletal_mesh
    );
    pool_category!(images: GpuImage, "image", add_image, get_image, try_get_image, find_image, release_image);
    pool_category!(
        materials: Material, "material",
        add_material, get_material, try_get_material, find_material, release_material
    );
    pool_category!(
        animations: Animation, "animation",
        add_animation, get_animation, try_get_animation, find_animation, release_animation
    );
    pool_category!(
        environment_maps: EnvironmentMap, "environment map",
        add_environment_map, get_environment_map, try_get_environment_map,
        find_environment_map, release_environment_map
    );
    pool_category!(
        font_atlases: FontAtlas, "font atlas",
        add_font_atlas, get_font_atlas, try_get_font_atlas, find_font_atlas, release_font_atlas
    );

    /// Upload a static mesh.
    pub fn load_mesh(
        &mut self,
        backend: &dyn GpuBackend,
        name: &str,
        data: &MeshData,
    ) -> GraphicsResult<Handle<Mesh>> {
        let mesh = Mesh::create(backend, name, data)?;
        Ok(self.add_mesh(name, mesh))
    }

    /// Upload a skinned mesh and append its bones to the shared bone buffer.
    pub fn load_skeletal_mesh(
        &mut self,
        backend: &dyn GpuBackend,
        name: &str,
        data: &SkeletalMeshData,
    ) -> GraphicsResult<Handle<SkeletalMesh>> {
        let mesh = SkeletalMesh::create(backend, name, data, &mut self.bones, self.max_bones)?;
        Ok(self.add_skeletal_mesh(name, mesh))
    }

    /// Append a clip to the shared frame pool.
    pub fn load_animation(
        &mut self,
        backend: &dyn GpuBackend,
        name: &str,
        data: &AnimationData,
    ) -> GraphicsResult<Handle<Animation>> {
        let animation = Animation::create(backend, name, data, &mut self.animation_frames)?;
        Ok(self.add_animation(name, animation))
    }

    /// Draw buffers of a mesh of either kind.
    pub fn drawable(&self, mesh: MeshRef) -> &dyn DrawInfo {
        match mesh {
            MeshRef::Static(handle) => self.get_mesh(handle) as &dyn DrawInfo,
            MeshRef::Skeletal(handle) => self.get_skeletal_mesh(handle),
        }
    }

    /// Like [`drawable`](Self::drawable) but `None` for a released mesh.
    pub fn try_drawable(&self, mesh: MeshRef) -> Option<&dyn DrawInfo> {
        match mesh {
            MeshRef::Static(handle) => self.try_get_mesh(handle).map(|m| m as &dyn DrawInfo),
            MeshRef::Skeletal(handle) => self
                .try_get_skeletal_mesh(handle)
                .map(|m| m as &dyn DrawInfo),
        }
    }

    pub fn animation_frame_buffer(&self) -> &SharedRecordBuffer<AnimationFrame> {
        &self.animation_frames
    }

    pub fn bone_buffer(&self) -> &SharedRecordBuffer<BoneData> {
        &self.bones
    }

    pub fn current_frame(&self) -> u64 {
        self.current_frame
    }

    /// Advance to `current_frame` and destroy every released object whose
    /// release frame is at least [`FRAME_OVERLAP`](crate::config::FRAME_OVERLAP)
    /// frames old. Returns how many were destroyed.
    pub fn process_deletions(&mut self, current_frame: u64, backend: &dyn GpuBackend) -> usize {
        self.current_frame = current_frame;
        let destroyed = self
            .deletion_queue
            .process(current_frame, |resource| resource.destroy(backend));
        if destroyed > 0 {
            log::debug!("Frame {}: destroyed {} released resources", current_frame, destroyed);
        }
        destroyed
    }

    pub fn pending_deletions(&self) -> usize {
        self.deletion_queue.pending_count()
    }

    /// Destroy everything. The device must be idle.
    pub fn destroy(mut self, backend: &dyn GpuBackend) {
        let mut owned = Vec::new();
        owned.extend(self.meshes.drain().into_iter().flat_map(|(_, r)| r.gpu_resources()));
        owned.extend(
            self.skeletal_meshes
                .drain()
                .into_iter()
                .flat_map(|(_, r)| r.gpu_resources()),
        );
        owned.extend(self.materials.drain().into_iter().flat_map(|(_, r)| r.gpu_resources()));
        owned.extend(
            self.environment_maps
                .drain()
                .into_iter()
                .flat_map(|(_, r)| r.gpu_resources()),
        );
        owned.extend(self.images.drain().into_iter().flat_map(|(_, r)| r.gpu_resources()));
        self.animations.drain();
        self.font_atlases.drain();

        let flushed = self.deletion_queue.flush(|resource| resource.destroy(backend));
        let live = owned.len();
        for resource in owned {
            resource.destroy(backend);
        }
        self.animation_frames.destroy(backend);
        self.bones.destroy(backend);
        log::info!(
            "Resource pool destroyed ({} live, {} pending release)",
            live,
            flushed
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::config::FRAME_OVERLAP;
    use crate::types::Vertex;

    fn pool(backend: &DummyBackend) -> ResourcePool {
        ResourcePool::new(backend, &SkinningConfig::default()).unwrap()
    }

    fn triangle() -> MeshData {
        MeshData {
            vertices: vec![Vertex::default(); 3],
            indices: vec![0, 1, 2],
        }
    }

    #[test]
    fn test_handles_increase_per_category() {
        let backend = DummyBackend::new();
        let mut pool = pool(&backend);
        let a = pool.load_mesh(&backend, "a", &triangle()).unwrap();
        let b = pool.load_mesh(&backend, "b", &triangle()).unwrap();
        pool.release_mesh(a);
        let c = pool.load_mesh(&backend, "c", &triangle()).unwrap();

        assert!(a < b && b < c);
        assert_eq!(pool.find_mesh("b"), Some(b));
        assert!(pool.try_get_mesh(a).is_none());
    }

    #[test]
    #[should_panic(expected = "invalid mesh handle")]
    fn test_get_invalid_handle_panics() {
        let backend = DummyBackend::new();
        let pool = pool(&backend);
        pool.get_mesh(Handle::INVALID);
    }

    #[test]
    fn test_release_is_deferred() {
        let backend = DummyBackend::new();
        let mut pool = pool(&backend);
        let mesh = pool.load_mesh(&backend, "tri", &triangle()).unwrap();

        pool.process_deletions(10, &backend);
        assert!(pool.release_mesh(mesh));
        assert_eq!(pool.pending_deletions(), 2);

        for frame in 10..10 + FRAME_OVERLAP as u64 {
            assert_eq!(pool.process_deletions(frame, &backend), 0);
        }
        assert_eq!(pool.process_deletions(10 + FRAME_OVERLAP as u64, &backend), 2);
        assert_eq!(pool.process_deletions(20, &backend), 0);
        assert_eq!(backend.destroyed_buffers().len(), 2);
    }

    #[test]
    fn test_double_release_is_ignored() {
        let backend = DummyBackend::new();
        let mut pool = pool(&backend);
        let mesh = pool.load_mesh(&backend, "tri", &triangle()).unwrap();
        assert!(pool.release_mesh(mesh));
        assert!(!pool.release_mesh(mesh));
        assert_eq!(pool.pending_deletions(), 2);
    }

    #[test]
    fn test_destroy_frees_everything() {
        let backend = DummyBackend::new();
        let mut pool = pool(&backend);
        pool.load_mesh(&backend, "a", &triangle()).unwrap();
        let b = pool.load_mesh(&backend, "b", &triangle()).unwrap();
        pool.release_mesh(b);

        pool.destroy(&backend);
        assert_eq!(backend.live_buffer_count(), 0);
    }
}
