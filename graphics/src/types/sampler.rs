//! Sampler state.
//!
//! The renderer only ever needs three samplers: a repeating anisotropic one
//! for material textures, a clamped bilinear one for full-screen passes and
//! a comparison sampler for the shadow map. Each has a preset here.

/// Texture coordinate addressing outside `[0, 1]`, applied to every axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddressMode {
    #[default]
    ClampToEdge,
    Repeat,
    MirrorRepeat,
}

/// Texel filtering for magnification, minification and mip selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FilterMode {
    #[default]
    Nearest,
    Linear,
}

/// Depth comparison used by shadow samplers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareFunction {
    Less,
    LessEqual,
    Greater,
    Always,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SamplerDescriptor {
    pub label: Option<String>,
    pub address_mode: AddressMode,
    /// Used for magnification, minification and between mips.
    pub filter: FilterMode,
    pub lod_max_clamp: f32,
    /// Turns the sampler into a comparison sampler.
    pub compare: Option<CompareFunction>,
    /// 1 disables anisotropic filtering. Clamped to the device limit.
    pub anisotropy_clamp: u16,
}

impl SamplerDescriptor {
    /// Trilinear filtering, clamped to the edge.
    pub fn linear() -> Self {
        Self {
            filter: FilterMode::Linear,
            ..Default::default()
        }
    }

    /// Repeating, 16x anisotropic sampler for material textures.
    pub fn material() -> Self {
        Self::linear()
            .with_address_mode(AddressMode::Repeat)
            .with_anisotropy(16)
            .with_label("material")
    }

    /// `LessEqual` comparison sampler for percentage-closer shadow lookups.
    pub fn shadow_compare() -> Self {
        Self::linear()
            .with_compare(CompareFunction::LessEqual)
            .with_label("shadow compare")
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_address_mode(mut self, mode: AddressMode) -> Self {
        self.address_mode = mode;
        self
    }

    pub fn with_compare(mut self, compare: CompareFunction) -> Self {
        self.compare = Some(compare);
        self
    }

    pub fn with_anisotropy(mut self, level: u16) -> Self {
        self.anisotropy_clamp = level.max(1);
        self
    }

    pub fn is_anisotropic(&self) -> bool {
        self.anisotropy_clamp > 1
    }
}

impl Default for SamplerDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            address_mode: AddressMode::ClampToEdge,
            filter: FilterMode::Nearest,
            lod_max_clamp: 32.0,
            compare: None,
            anisotropy_clamp: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        let material = SamplerDescriptor::material();
        assert_eq!(material.address_mode, AddressMode::Repeat);
        assert!(material.is_anisotropic());
        assert!(material.compare.is_none());

        let shadow = SamplerDescriptor::shadow_compare();
        assert_eq!(shadow.address_mode, AddressMode::ClampToEdge);
        assert_eq!(shadow.compare, Some(CompareFunction::LessEqual));
        assert!(!shadow.is_anisotropic());
    }

    #[test]
    fn test_zero_anisotropy_disables_it() {
        assert_eq!(SamplerDescriptor::linear().with_anisotropy(0).anisotropy_clamp, 1);
    }
}
