//! Bitmap font atlases and text layout.

use std::collections::HashMap;

use ember_core::Handle;

use crate::error::{GraphicsError, GraphicsResult};
use crate::types::SpriteInstanceData;

use super::deletion::GpuResource;
use super::image::{GpuImage, ImageData};
use super::material::Material;
use super::GpuResources;

/// Location of one character in the atlas.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Glyph {
    pub character: char,
    pub uv_offset: [f32; 2],
    pub uv_extent: [f32; 2],
    /// Width over height.
    pub aspect_ratio: f32,
}

/// Atlas pixels and the glyphs packed into them.
#[derive(Debug, Clone, PartialEq)]
pub struct FontAtlasData {
    pub image: ImageData,
    pub glyphs: Vec<Glyph>,
}

impl FontAtlasData {
    pub fn validate(&self) -> GraphicsResult<()> {
        self.image.validate()?;
        let outside = self.glyphs.iter().find(|g| {
            g.uv_offset[0] + g.uv_extent[0] > 1.0 + f32::EPSILON
                || g.uv_offset[1] + g.uv_extent[1] > 1.0 + f32::EPSILON
                || g.aspect_ratio <= 0.0
        });
        if let Some(glyph) = outside {
            return Err(GraphicsError::InvalidParameter(format!(
                "glyph {:?} lies outside the atlas",
                glyph.character
            )));
        }
        Ok(())
    }
}

/// A loaded font: its atlas image, the material sprites sample it through,
/// and the glyph table.
#[derive(Debug, Clone)]
pub struct FontAtlas {
    image: Handle<GpuImage>,
    material: Handle<Material>,
    glyphs: HashMap<char, Glyph>,
}

impl FontAtlas {
    pub fn new(image: Handle<GpuImage>, material: Handle<Material>, glyphs: &[Glyph]) -> Self {
        Self {
            image,
            material,
            glyphs: glyphs.iter().map(|g| (g.character, *g)).collect(),
        }
    }

    pub fn image(&self) -> Handle<GpuImage> {
        self.image
    }

    pub fn material(&self) -> Handle<Material> {
        self.material
    }

    pub fn glyph(&self, character: char) -> Option<&Glyph> {
        self.glyphs.get(&character)
    }

    pub fn glyph_count(&self) -> usize {
        self.glyphs.len()
    }

    /// Lay `text` out on one line starting at `origin` (left edge, vertical
    /// center). Each glyph is `height` tall and advances by its own width.
    /// Characters missing from the atlas advance by a quarter of `height`.
    pub fn layout(
        &self,
        text: &str,
        origin: [f32; 2],
        height: f32,
        color: [f32; 4],
    ) -> Vec<SpriteInstanceData> {
        let mut cursor = origin[0];
        let mut sprites = Vec::with_capacity(text.len());
        for character in text.chars() {
            let Some(glyph) = self.glyph(character) else {
                cursor += height * 0.25;
                continue;
            };
            let width = height * glyph.aspect_ratio;
            sprites.push(
                SpriteInstanceData::new([cursor + width * 0.5, origin[1]], [width, height], color)
                    .with_uv(glyph.uv_offset, glyph.uv_extent),
            );
            cursor += width;
        }
        sprites
    }
}

impl GpuResources for FontAtlas {
    // The atlas image and material are pool entries of their own.
    fn gpu_resources(&self) -> Vec<GpuResource> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ImageFormat;

    fn glyph(character: char, aspect_ratio: f32) -> Glyph {
        Glyph {
            character,
            uv_offset: [0.0, 0.0],
            uv_extent: [0.1, 0.1],
            aspect_ratio,
        }
    }

    fn atlas() -> FontAtlas {
        FontAtlas::new(
            Handle::from_raw(1),
            Handle::from_raw(1),
            &[glyph('A', 0.5), glyph('W', 1.0)],
        )
    }

    #[test]
    fn test_layout_advances_by_glyph_width() {
        let sprites = atlas().layout("AW", [10.0, 20.0], 20.0, [1.0; 4]);
        assert_eq!(sprites.len(), 2);
        assert_eq!(sprites[0].size, [10.0, 20.0]);
        assert_eq!(sprites[0].position, [15.0, 20.0]);
        assert_eq!(sprites[1].size, [20.0, 20.0]);
        assert_eq!(sprites[1].position, [30.0, 20.0]);
    }

    #[test]
    fn test_unknown_characters_leave_a_gap() {
        let sprites = atlas().layout("A A", [0.0, 0.0], 8.0, [1.0; 4]);
        assert_eq!(sprites.len(), 2);
        assert_eq!(sprites[1].position[0], 4.0 + 2.0 + 2.0);
    }

    #[test]
    fn test_validate_rejects_glyph_outside_atlas() {
        let mut bad = glyph('x', 1.0);
        bad.uv_offset = [0.95, 0.0];
        let data = FontAtlasData {
            image: ImageData::solid([255; 4], ImageFormat::Rgba8Unorm),
            glyphs: vec![bad],
        };
        assert!(data.validate().is_err());
    }
}
