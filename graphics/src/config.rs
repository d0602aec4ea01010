//! Renderer configuration.
//!
//! Every subsystem gets its own section, assembled once and passed by value
//! into the component that owns it. A config file only needs to name the
//! values it changes:
//!
//! ```toml
//! [particles]
//! max_particles = 65536
//!
//! [device]
//! vsync = false
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{GraphicsError, GraphicsResult};

/// Number of frame slots. The CPU may record at most `FRAME_OVERLAP - 1`
/// frames ahead of the GPU.
pub const FRAME_OVERLAP: usize = 2;

/// Largest supported bloom chain.
pub const MAX_BLOOM_MIPS: u32 = 12;

/// Top-level renderer configuration.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    pub frame: FrameConfig,
    pub instances: InstanceConfig,
    pub skinning: SkinningConfig,
    pub particles: ParticleConfig,
    pub graph: GraphConfig,
    pub device: DeviceConfig,
}

/// Frame scheduler settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    /// Image transitions consumed per frame; the rest stay queued.
    pub max_transitions_per_frame: usize,
    /// Upper bound on a single fence wait before it is treated as a hang.
    pub fence_timeout_ms: u64,
    /// How long an uploader blocks on a full transition queue.
    pub transition_send_timeout_ms: u64,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_transitions_per_frame: 16,
            fence_timeout_ms: 10_000,
            transition_send_timeout_ms: 1_000,
        }
    }
}

/// Per-frame instance buffer capacities.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    pub max_static_instances: u32,
    pub max_sprites: u32,
    pub max_lines: u32,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            max_static_instances: 1000,
            max_sprites: 1000,
            max_lines: 4096,
        }
    }
}

/// Skeletal animation limits.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SkinningConfig {
    pub max_skeletal_instances: u32,
    /// Bones per skeletal mesh; extra bones are dropped at load time.
    pub max_bones: u32,
    /// Frames in the shared animation pool, each `max_bones` records wide.
    pub max_animation_frames: u32,
    /// Animation blends per frame across all skeletal instances.
    pub max_animation_instances: u32,
    /// Bone hierarchy records shared by every loaded skeletal mesh.
    pub max_bone_records: u32,
}

impl SkinningConfig {
    /// Capacity of the shared frame pool in per-bone records.
    pub fn frame_pool_records(&self) -> u64 {
        u64::from(self.max_animation_frames) * u64::from(self.max_bones)
    }
}

impl Default for SkinningConfig {
    fn default() -> Self {
        Self {
            max_skeletal_instances: 100,
            max_bones: 200,
            max_animation_frames: 1000,
            max_animation_instances: 400,
            max_bone_records: 12_800,
        }
    }
}

/// Particle simulation and depth sort settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ParticleConfig {
    /// Hard ceiling on live particles. Must be a power of two.
    pub max_particles: u32,
    pub max_emitters: u32,
    /// Invocations per sort workgroup. Must be a power of two.
    pub sort_workgroup_size: u32,
}

impl Default for ParticleConfig {
    fn default() -> Self {
        Self {
            max_particles: 16_384,
            max_emitters: 64,
            sort_workgroup_size: 256,
        }
    }
}

/// Render graph settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub shadow_map_size: u32,
    pub bloom_mip_count: u32,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            shadow_map_size: 2048,
            bloom_mip_count: 6,
        }
    }
}

/// GPU backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Native Vulkan through ash.
    #[default]
    Vulkan,
    /// Recording backend without a GPU.
    Dummy,
}

/// Device and presentation settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub backend: BackendKind,
    pub validation: bool,
    pub vsync: bool,
    /// Directory holding the compiled `.spv` shader binaries.
    pub shader_dir: PathBuf,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            validation: cfg!(debug_assertions),
            vsync: true,
            shader_dir: PathBuf::from("assets/shaders"),
        }
    }
}

impl RendererConfig {
    /// Parse a config from TOML text and validate it.
    pub fn from_toml_str(text: &str) -> GraphicsResult<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| GraphicsError::Config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a config file.
    pub fn load(path: &Path) -> GraphicsResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            GraphicsError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text).map_err(|e| match e {
            GraphicsError::Config(msg) => {
                GraphicsError::Config(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    /// Check the invariants the GPU buffers and dispatches rely on.
    pub fn validate(&self) -> GraphicsResult<()> {
        let particles = &self.particles;
        if particles.max_particles < 2 || !particles.max_particles.is_power_of_two() {
            return Err(GraphicsError::Config(format!(
                "particles.max_particles must be a power of two >= 2, got {}",
                particles.max_particles
            )));
        }
        if particles.sort_workgroup_size == 0 || !particles.sort_workgroup_size.is_power_of_two()
        {
            return Err(GraphicsError::Config(format!(
                "particles.sort_workgroup_size must be a power of two, got {}",
                particles.sort_workgroup_size
            )));
        }

        let nonzero = [
            ("instances.max_static_instances", self.instances.max_static_instances),
            ("instances.max_sprites", self.instances.max_sprites),
            ("instances.max_lines", self.instances.max_lines),
            ("skinning.max_skeletal_instances", self.skinning.max_skeletal_instances),
            ("skinning.max_bones", self.skinning.max_bones),
            ("skinning.max_animation_frames", self.skinning.max_animation_frames),
            ("skinning.max_animation_instances", self.skinning.max_animation_instances),
            ("skinning.max_bone_records", self.skinning.max_bone_records),
            ("particles.max_emitters", self.particles.max_emitters),
            ("graph.shadow_map_size", self.graph.shadow_map_size),
            ("graph.bloom_mip_count", self.graph.bloom_mip_count),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, value)| *value == 0) {
            return Err(GraphicsError::Config(format!("{name} must be greater than zero")));
        }

        if self.graph.bloom_mip_count > MAX_BLOOM_MIPS {
            return Err(GraphicsError::Config(format!(
                "graph.bloom_mip_count must be at most {MAX_BLOOM_MIPS}, got {}",
                self.graph.bloom_mip_count
            )));
        }
        if self.frame.max_transitions_per_frame == 0 {
            return Err(GraphicsError::Config(
                "frame.max_transitions_per_frame must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RendererConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.skinning.max_bones, 200);
        assert_eq!(config.skinning.frame_pool_records(), 200_000);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = RendererConfig::from_toml_str(
            r#"
            [particles]
            max_particles = 1024

            [device]
            backend = "dummy"
            vsync = false
            "#,
        )
        .unwrap();

        assert_eq!(config.particles.max_particles, 1024);
        assert_eq!(config.particles.sort_workgroup_size, 256);
        assert_eq!(config.device.backend, BackendKind::Dummy);
        assert!(!config.device.vsync);
        assert_eq!(config.frame, FrameConfig::default());
    }

    #[test]
    fn test_rejects_non_power_of_two_particles() {
        let err = RendererConfig::from_toml_str("[particles]\nmax_particles = 1000\n").unwrap_err();
        assert!(matches!(err, GraphicsError::Config(ref msg) if msg.contains("max_particles")));
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let mut config = RendererConfig::default();
        config.instances.max_sprites = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, GraphicsError::Config(ref msg) if msg.contains("max_sprites")));
    }

    #[test]
    fn test_rejects_long_bloom_chain() {
        let mut config = RendererConfig::default();
        config.graph.bloom_mip_count = MAX_BLOOM_MIPS + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unknown_backend() {
        let err = RendererConfig::from_toml_str("[device]\nbackend = \"metal\"\n").unwrap_err();
        assert!(matches!(err, GraphicsError::Config(_)));
    }

    #[test]
    fn test_load_reports_missing_file() {
        let err = RendererConfig::load(Path::new("does/not/exist.toml")).unwrap_err();
        assert!(matches!(err, GraphicsError::Config(ref msg) if msg.contains("exist.toml")));
    }
}
