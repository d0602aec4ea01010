//! Static and skeletal meshes.

use ember_core::Handle;

use crate::backend::{BufferHandle, GpuBackend};
use crate::error::{GraphicsError, GraphicsResult};
use crate::types::{BoneData, BufferDescriptor, BufferUsage, SkinnedVertex, Vertex};

use super::animation::SharedRecordBuffer;
use super::deletion::GpuResource;
use super::GpuResources;

/// Static mesh geometry as produced by an asset loader.
#[derive(Debug, Clone, Default)]
pub struct MeshData {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

/// Skinned mesh geometry and its bone hierarchy.
#[derive(Debug, Clone, Default)]
pub struct SkeletalMeshData {
    pub vertices: Vec<SkinnedVertex>,
    pub indices: Vec<u32>,
    /// Bones in hierarchy order; a bone's parent precedes it.
    pub bones: Vec<BoneData>,
}

/// Buffers and counts needed to issue an indexed draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshDrawInfo {
    pub vertex_buffer: BufferHandle,
    pub index_buffer: BufferHandle,
    pub index_count: u32,
}

/// Anything the render graph can issue an indexed draw for.
pub trait DrawInfo {
    fn draw_info(&self) -> MeshDrawInfo;
}

/// A static mesh resident on the GPU.
#[derive(Debug, Clone)]
pub struct Mesh {
    vertex_buffer: BufferHandle,
    index_buffer: BufferHandle,
    index_count: u32,
}

impl Mesh {
    pub fn create(backend: &dyn GpuBackend, name: &str, data: &MeshData) -> GraphicsResult<Self> {
        let (vertex_buffer, index_buffer) =
            upload_geometry(backend, name, bytemuck::cast_slice(&data.vertices), &data.indices)?;
        Ok(Self {
            vertex_buffer,
            index_buffer,
            index_count: data.indices.len() as u32,
        })
    }
}

impl DrawInfo for Mesh {
    fn draw_info(&self) -> MeshDrawInfo {
        MeshDrawInfo {
            vertex_buffer: self.vertex_buffer,
            index_buffer: self.index_buffer,
            index_count: self.index_count,
        }
    }
}

impl GpuResources for Mesh {
    fn gpu_resources(&self) -> Vec<GpuResource> {
        vec![
            GpuResource::Buffer(self.vertex_buffer),
            GpuResource::Buffer(self.index_buffer),
        ]
    }
}

/// A skinned mesh resident on the GPU. Its bones live in the shared bone
/// buffer starting at `bone_offset`.
#[derive(Debug, Clone)]
pub struct SkeletalMesh {
    vertex_buffer: BufferHandle,
    index_buffer: BufferHandle,
    index_count: u32,
    bone_offset: u32,
    bone_count: u32,
}

impl SkeletalMesh {
    /// Upload geometry and append the bone hierarchy to `bones`. Bones past
    /// `max_bones` are dropped with a warning.
    pub fn create(
        backend: &dyn GpuBackend,
        name: &str,
        data: &SkeletalMeshData,
        bones: &mut SharedRecordBuffer<BoneData>,
        max_bones: u32,
    ) -> GraphicsResult<Self> {
        let mut hierarchy = data.bones.as_slice();
        if hierarchy.len() > max_bones as usize {
            log::warn!(
                "Skeletal mesh '{}' has {} bones, keeping the first {}",
                name,
                hierarchy.len(),
                max_bones
            );
            hierarchy = &hierarchy[..max_bones as usize];
        }
        if hierarchy.is_empty() {
            return Err(GraphicsError::InvalidParameter(format!(
                "skeletal mesh '{name}' has no bones"
            )));
        }

        let bone_offset = bones.append(backend, hierarchy)?;
        let (vertex_buffer, index_buffer) =
            upload_geometry(backend, name, bytemuck::cast_slice(&data.vertices), &data.indices)?;
        Ok(Self {
            vertex_buffer,
            index_buffer,
            index_count: data.indices.len() as u32,
            bone_offset,
            bone_count: hierarchy.len() as u32,
        })
    }

    pub fn bone_offset(&self) -> u32 {
        self.bone_offset
    }

    pub fn bone_count(&self) -> u32 {
        self.bone_count
    }
}

impl DrawInfo for SkeletalMesh {
    fn draw_info(&self) -> MeshDrawInfo {
        MeshDrawInfo {
            vertex_buffer: self.vertex_buffer,
            index_buffer: self.index_buffer,
            index_count: self.index_count,
        }
    }
}

impl GpuResources for SkeletalMesh {
    fn gpu_resources(&self) -> Vec<GpuResource> {
        vec![
            GpuResource::Buffer(self.vertex_buffer),
            GpuResource::Buffer(self.index_buffer),
        ]
    }
}

/// A mesh of either kind, as referenced by a render batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeshRef {
    Static(Handle<Mesh>),
    Skeletal(Handle<SkeletalMesh>),
}

impl MeshRef {
    /// Raw handle value, used as a batch hash input.
    pub fn raw(&self) -> u64 {
        match self {
            Self::Static(h) => h.raw(),
            Self::Skeletal(h) => h.raw(),
        }
    }
}

fn upload_geometry(
    backend: &dyn GpuBackend,
    name: &str,
    vertex_bytes: &[u8],
    indices: &[u32],
) -> GraphicsResult<(BufferHandle, BufferHandle)> {
    if vertex_bytes.is_empty() || indices.is_empty() {
        return Err(GraphicsError::InvalidParameter(format!(
            "mesh '{name}' has no geometry"
        )));
    }

    let vertex_buffer = backend.create_buffer(
        &BufferDescriptor::new(
            vertex_bytes.len() as u64,
            BufferUsage::VERTEX | BufferUsage::HOST_WRITE,
        )
        .with_label(format!("{name} vertices")),
    )?;
    let index_bytes: &[u8] = bytemuck::cast_slice(indices);
    let index_buffer = match backend.create_buffer(
        &BufferDescriptor::new(
            index_bytes.len() as u64,
            BufferUsage::INDEX | BufferUsage::HOST_WRITE,
        )
        .with_label(format!("{name} indices")),
    ) {
        Ok(buffer) => buffer,
        Err(e) => {
            backend.destroy_buffer(vertex_buffer);
            return Err(e);
        }
    };

    let written = backend
        .write_buffer(vertex_buffer, 0, vertex_bytes)
        .and_then(|()| backend.write_buffer(index_buffer, 0, index_bytes));
    if let Err(e) = written {
        backend.destroy_buffer(vertex_buffer);
        backend.destroy_buffer(index_buffer);
        return Err(e);
    }
    Ok((vertex_buffer, index_buffer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use glam::Mat4;

    fn triangle() -> MeshData {
        MeshData {
            vertices: vec![Vertex::default(); 3],
            indices: vec![0, 1, 2],
        }
    }

    #[test]
    fn test_mesh_upload() {
        let backend = DummyBackend::new();
        let mesh = Mesh::create(&backend, "tri", &triangle()).unwrap();
        let info = mesh.draw_info();
        assert_eq!(info.index_count, 3);
        assert_eq!(
            backend.buffer_contents(info.index_buffer).unwrap(),
            bytemuck::cast_slice::<u32, u8>(&[0, 1, 2]).to_vec()
        );
        assert_eq!(mesh.gpu_resources().len(), 2);
    }

    #[test]
    fn test_empty_mesh_rejected() {
        let backend = DummyBackend::new();
        assert!(Mesh::create(&backend, "empty", &MeshData::default()).is_err());
        assert_eq!(backend.live_buffer_count(), 0);
    }

    #[test]
    fn test_skeletal_mesh_truncates_bones() {
        let backend = DummyBackend::new();
        let mut bones = SharedRecordBuffer::<BoneData>::new(&backend, "bones", 16).unwrap();
        let data = SkeletalMeshData {
            vertices: vec![SkinnedVertex::default(); 3],
            indices: vec![0, 1, 2],
            bones: (0..6).map(|i| BoneData::new(i - 1, Mat4::IDENTITY)).collect(),
        };

        let first = SkeletalMesh::create(&backend, "a", &data, &mut bones, 4).unwrap();
        let second = SkeletalMesh::create(&backend, "b", &data, &mut bones, 4).unwrap();
        assert_eq!(first.bone_count(), 4);
        assert_eq!(first.bone_offset(), 0);
        assert_eq!(second.bone_offset(), 4);
        assert_eq!(bones.used(), 8);
    }
}
