//! Skeletal animation clips and the shared GPU record pools.
//!
//! All clips live in one frame pool and all bone hierarchies in one bone
//! pool, so the skinning kernel needs a single binding for each. Pools are
//! append-only: releasing a clip does not reclaim its records.

use std::marker::PhantomData;
use std::path::Path;

use bytemuck::Pod;

use crate::backend::{BufferHandle, GpuBackend};
use crate::error::{GraphicsError, GraphicsResult};
use crate::types::{AnimationFrame, BufferDescriptor, BufferUsage};

use super::deletion::GpuResource;
use super::GpuResources;

/// Decoded animation clip: `frame_count * bone_count` local transforms in
/// frame-major order, plus a timestamp per frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnimationData {
    pub frame_count: u32,
    pub bone_count: u32,
    pub frames: Vec<AnimationFrame>,
    pub times: Vec<f32>,
}

impl AnimationData {
    /// Parse the packed little-endian clip format:
    ///
    /// ```text
    /// u32 frame_count
    /// u32 bone_count
    /// AnimationFrame[frame_count * bone_count]   (48 bytes each)
    /// f32[frame_count]                           (seconds)
    /// ```
    pub fn from_bytes(bytes: &[u8]) -> GraphicsResult<Self> {
        let mut reader = ByteReader::new(bytes);
        let frame_count = reader.read_u32()?;
        let bone_count = reader.read_u32()?;

        let records = frame_count as usize * bone_count as usize;
        let mut frames = Vec::with_capacity(records);
        for _ in 0..records {
            frames.push(bytemuck::pod_read_unaligned::<AnimationFrame>(
                reader.take(AnimationFrame::SIZE)?,
            ));
        }
        let mut times = Vec::with_capacity(frame_count as usize);
        for _ in 0..frame_count {
            times.push(f32::from_bits(reader.read_u32()?));
        }

        let data = Self {
            frame_count,
            bone_count,
            frames,
            times,
        };
        data.validate()?;
        Ok(data)
    }

    /// Read and parse a packed clip file.
    pub fn load(path: &Path) -> GraphicsResult<Self> {
        let bytes = std::fs::read(path)
            .map_err(|e| GraphicsError::Io(format!("failed to read {}: {e}", path.display())))?;
        Self::from_bytes(&bytes)
    }

    pub fn validate(&self) -> GraphicsResult<()> {
        if self.frame_count == 0 || self.bone_count == 0 {
            return Err(GraphicsError::InvalidParameter(
                "animation has no frames or no bones".to_string(),
            ));
        }
        if self.frames.len() != self.frame_count as usize * self.bone_count as usize {
            return Err(GraphicsError::InvalidParameter(format!(
                "animation declares {}x{} frames but holds {}",
                self.frame_count,
                self.bone_count,
                self.frames.len()
            )));
        }
        if self.times.len() != self.frame_count as usize {
            return Err(GraphicsError::InvalidParameter(format!(
                "animation has {} frames but {} timestamps",
                self.frame_count,
                self.times.len()
            )));
        }
        Ok(())
    }
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take(&mut self, len: usize) -> GraphicsResult<&'a [u8]> {
        let end = self.offset + len;
        let slice = self.bytes.get(self.offset..end).ok_or_else(|| {
            GraphicsError::InvalidParameter(format!(
                "animation data truncated at byte {} of {}",
                self.offset,
                self.bytes.len()
            ))
        })?;
        self.offset = end;
        Ok(slice)
    }

    fn read_u32(&mut self) -> GraphicsResult<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

/// A clip stored in the shared frame pool.
#[derive(Debug, Clone, PartialEq)]
pub struct Animation {
    frame_offset: u32,
    frame_count: u32,
    bone_count: u32,
    times: Vec<f32>,
}

impl Animation {
    /// Append the clip to `pool`. If the pool cannot hold every frame, the
    /// trailing frames are dropped with a warning.
    pub fn create(
        backend: &dyn GpuBackend,
        name: &str,
        data: &AnimationData,
        pool: &mut SharedRecordBuffer<AnimationFrame>,
    ) -> GraphicsResult<Self> {
        data.validate()?;

        let fitting_frames = (pool.available() / data.bone_count).min(data.frame_count);
        if fitting_frames == 0 {
            return Err(GraphicsError::ResourceCreationFailed(format!(
                "animation frame pool is full, cannot load '{name}'"
            )));
        }
        if fitting_frames < data.frame_count {
            log::warn!(
                "Animation frame pool full: keeping {} of {} frames of '{}'",
                fitting_frames,
                data.frame_count,
                name
            );
        }

        let records = fitting_frames as usize * data.bone_count as usize;
        let frame_offset = pool.append(backend, &data.frames[..records])?;
        Ok(Self {
            frame_offset,
            frame_count: fitting_frames,
            bone_count: data.bone_count,
            times: data.times[..fitting_frames as usize].to_vec(),
        })
    }

    pub fn frame_offset(&self) -> u32 {
        self.frame_offset
    }

    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    pub fn bone_count(&self) -> u32 {
        self.bone_count
    }

    /// Timestamp of the last frame.
    pub fn duration(&self) -> f32 {
        self.times.last().copied().unwrap_or(0.0)
    }

    /// Frames surrounding `time` (looping) and the blend between them.
    pub fn sample(&self, time: f32) -> (u32, u32, f32) {
        let duration = self.duration();
        if self.frame_count < 2 || duration <= 0.0 {
            return (0, 0, 0.0);
        }
        let t = time.rem_euclid(duration);
        let next = self.times.partition_point(|&ft| ft <= t).min(self.times.len() - 1);
        let prev = next.saturating_sub(1);
        let span = self.times[next] - self.times[prev];
        let blend = if span > 0.0 {
            ((t - self.times[prev]) / span).clamp(0.0, 1.0)
        } else {
            0.0
        };
        (prev as u32, next as u32, blend)
    }
}

impl GpuResources for Animation {
    fn gpu_resources(&self) -> Vec<GpuResource> {
        Vec::new()
    }
}

/// Append-only storage buffer of `T` records shared by every resource of a
/// kind.
#[derive(Debug)]
pub struct SharedRecordBuffer<T> {
    label: String,
    buffer: BufferHandle,
    capacity: u32,
    used: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Pod> SharedRecordBuffer<T> {
    pub fn new(backend: &dyn GpuBackend, label: &str, capacity: u32) -> GraphicsResult<Self> {
        let size = u64::from(capacity) * std::mem::size_of::<T>() as u64;
        let buffer = backend.create_buffer(
            &BufferDescriptor::new(size, BufferUsage::STORAGE | BufferUsage::HOST_WRITE)
                .with_label(label),
        )?;
        Ok(Self {
            label: label.to_string(),
            buffer,
            capacity,
            used: 0,
            _marker: PhantomData,
        })
    }

    /// Write `records` after the last appended record. Returns the index of
    /// the first one.
    pub fn append(&mut self, backend: &dyn GpuBackend, records: &[T]) -> GraphicsResult<u32> {
        let count = records.len() as u32;
        if count > self.available() {
            return Err(GraphicsError::ResourceCreationFailed(format!(
                "{} is full: {} of {} records used, {} requested",
                self.label, self.used, self.capacity, count
            )));
        }
        let offset = u64::from(self.used) * std::mem::size_of::<T>() as u64;
        backend.write_buffer(self.buffer, offset, bytemuck::cast_slice(records))?;
        let first = self.used;
        self.used += count;
        Ok(first)
    }

    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn available(&self) -> u32 {
        self.capacity - self.used
    }

    pub fn destroy(self, backend: &dyn GpuBackend) {
        backend.destroy_buffer(self.buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use glam::{Quat, Vec3};

    fn clip_bytes(frame_count: u32, bone_count: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&frame_count.to_le_bytes());
        bytes.extend_from_slice(&bone_count.to_le_bytes());
        for f in 0..frame_count * bone_count {
            let frame = AnimationFrame::new(Vec3::splat(f as f32), Quat::IDENTITY, Vec3::ONE);
            bytes.extend_from_slice(bytemuck::bytes_of(&frame));
        }
        for f in 0..frame_count {
            bytes.extend_from_slice(&(f as f32 * 0.5).to_le_bytes());
        }
        bytes
    }

    #[test]
    fn test_from_bytes() {
        let data = AnimationData::from_bytes(&clip_bytes(3, 2)).unwrap();
        assert_eq!(data.frame_count, 3);
        assert_eq!(data.bone_count, 2);
        assert_eq!(data.frames.len(), 6);
        assert_eq!(data.frames[5].position, Vec3::splat(5.0));
        assert_eq!(data.times, vec![0.0, 0.5, 1.0]);
    }

    #[test]
    fn test_truncated_bytes_rejected() {
        let bytes = clip_bytes(3, 2);
        let err = AnimationData::from_bytes(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, GraphicsError::InvalidParameter(_)));
    }

    #[test]
    fn test_pool_truncates_to_whole_frames() {
        let backend = DummyBackend::new();
        let mut pool = SharedRecordBuffer::<AnimationFrame>::new(&backend, "frames", 7).unwrap();
        let data = AnimationData::from_bytes(&clip_bytes(5, 2)).unwrap();

        let clip = Animation::create(&backend, "walk", &data, &mut pool).unwrap();
        assert_eq!(clip.frame_count(), 3);
        assert_eq!(pool.used(), 6);

        let err = Animation::create(&backend, "run", &data, &mut pool).unwrap_err();
        assert!(matches!(err, GraphicsError::ResourceCreationFailed(_)));
    }

    #[test]
    fn test_sample_interpolates_and_loops() {
        let backend = DummyBackend::new();
        let mut pool = SharedRecordBuffer::<AnimationFrame>::new(&backend, "frames", 16).unwrap();
        let data = AnimationData::from_bytes(&clip_bytes(3, 1)).unwrap();
        let clip = Animation::create(&backend, "idle", &data, &mut pool).unwrap();

        assert_eq!(clip.duration(), 1.0);
        let (a, b, blend) = clip.sample(0.25);
        assert_eq!((a, b), (0, 1));
        assert!((blend - 0.5).abs() < 1e-6);

        let (a, b, blend) = clip.sample(1.75);
        assert_eq!((a, b), (1, 2));
        assert!((blend - 0.5).abs() < 1e-6);
    }
}
