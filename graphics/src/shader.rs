//! SPIR-V shader binaries.
//!
//! Shaders are compiled offline; the renderer only loads the resulting
//! `.spv` words by name through a [`ShaderSource`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{GraphicsError, GraphicsResult};

/// First word of every SPIR-V module.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Shader names the renderer loads.
pub mod names {
    pub const SKINNING: &str = "skinning.comp";
    pub const PARTICLE_UPDATE: &str = "particle_update.comp";
    pub const PARTICLE_EMIT: &str = "particle_emit.comp";
    pub const BITONIC_SORT: &str = "bitonic_sort.comp";
    pub const BLOOM_DOWNSAMPLE: &str = "bloom_downsample.comp";
    pub const BLOOM_UPSAMPLE: &str = "bloom_upsample.comp";
    pub const SHADOW_VERT: &str = "shadow.vert";
    pub const SHADOW_SKINNED_VERT: &str = "shadow_skinned.vert";
    pub const STATIC_VERT: &str = "static.vert";
    pub const SKINNED_VERT: &str = "skinned.vert";
    pub const PBR_FRAG: &str = "pbr.frag";
    pub const SKYBOX_VERT: &str = "skybox.vert";
    pub const SKYBOX_FRAG: &str = "skybox.frag";
    pub const PARTICLE_VERT: &str = "particle.vert";
    pub const PARTICLE_FRAG: &str = "particle.frag";
    pub const LINE_VERT: &str = "line.vert";
    pub const LINE_FRAG: &str = "line.frag";
    pub const FULLSCREEN_VERT: &str = "fullscreen.vert";
    pub const COMPOSITE_FRAG: &str = "composite.frag";
    pub const SPRITE_VERT: &str = "sprite.vert";
    pub const SPRITE_FRAG: &str = "sprite.frag";
}

/// Supplies SPIR-V words by shader name.
pub trait ShaderSource {
    fn load(&self, name: &str) -> GraphicsResult<Vec<u32>>;
}

/// Check a SPIR-V blob and convert it to words.
pub fn spirv_words(name: &str, bytes: &[u8]) -> GraphicsResult<Vec<u32>> {
    if bytes.len() < 20 || bytes.len() % 4 != 0 {
        return Err(GraphicsError::InvalidParameter(format!(
            "shader '{name}' is not a SPIR-V module ({} bytes)",
            bytes.len()
        )));
    }
    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    if words[0] != SPIRV_MAGIC {
        return Err(GraphicsError::InvalidParameter(format!(
            "shader '{name}' has bad magic {:#010x}",
            words[0]
        )));
    }
    Ok(words)
}

/// Loads `<dir>/<name>.spv`.
#[derive(Debug, Clone)]
pub struct ShaderDirectory {
    root: PathBuf,
}

impl ShaderDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.spv"))
    }
}

impl ShaderSource for ShaderDirectory {
    fn load(&self, name: &str) -> GraphicsResult<Vec<u32>> {
        let path = self.path_of(name);
        let bytes = std::fs::read(&path)
            .map_err(|e| GraphicsError::Io(format!("failed to read {}: {e}", path.display())))?;
        log::debug!("Loaded shader '{}' ({} bytes)", name, bytes.len());
        spirv_words(name, &bytes)
    }
}

/// In-memory shaders, keyed by name.
///
/// With [`with_fallback`](Self::with_fallback) every unknown name resolves
/// to an empty module, which is enough for backends that never compile them.
#[derive(Debug, Clone, Default)]
pub struct MemoryShaderSource {
    modules: HashMap<String, Vec<u32>>,
    fallback: bool,
}

impl MemoryShaderSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fallback() -> Self {
        Self {
            modules: HashMap::new(),
            fallback: true,
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, words: Vec<u32>) {
        self.modules.insert(name.into(), words);
    }

    /// Header of a SPIR-V 1.0 module with no instructions.
    pub fn empty_module() -> Vec<u32> {
        vec![SPIRV_MAGIC, 0x0001_0000, 0, 1, 0]
    }
}

impl ShaderSource for MemoryShaderSource {
    fn load(&self, name: &str) -> GraphicsResult<Vec<u32>> {
        match self.modules.get(name) {
            Some(words) => Ok(words.clone()),
            None if self.fallback => Ok(Self::empty_module()),
            None => Err(GraphicsError::ResourceCreationFailed(format!(
                "unknown shader '{name}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spirv_magic_checked() {
        let good: Vec<u8> = MemoryShaderSource::empty_module()
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect();
        assert_eq!(spirv_words("ok", &good).unwrap()[0], SPIRV_MAGIC);

        let mut bad = good.clone();
        bad[0] = 0;
        assert!(spirv_words("bad", &bad).is_err());
        assert!(spirv_words("short", &good[..8]).is_err());
    }

    #[test]
    fn test_directory_missing_shader() {
        let dir = ShaderDirectory::new("no/such/dir");
        let err = dir.load(names::SKINNING).unwrap_err();
        assert!(matches!(err, GraphicsError::Io(ref msg) if msg.contains("skinning.comp.spv")));
    }

    #[test]
    fn test_memory_source_fallback() {
        assert!(MemoryShaderSource::new().load("x").is_err());
        assert_eq!(
            MemoryShaderSource::with_fallback().load("x").unwrap(),
            MemoryShaderSource::empty_module()
        );
    }
}
