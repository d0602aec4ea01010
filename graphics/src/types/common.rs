//! Common types shared across the graphics system.

// ============================================================================
// Extent2d
// ============================================================================

/// 2D extent of a surface or image in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent2d {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Extent2d {
    /// Create a new extent.
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// True if either dimension is zero, e.g. for a minimised window.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Extent of mip `level`, clamped to at least one pixel per axis.
    pub fn mip(&self, level: u32) -> Self {
        Self {
            width: self.width.checked_shr(level).unwrap_or(0).max(1),
            height: self.height.checked_shr(level).unwrap_or(0).max(1),
        }
    }

    /// Width divided by height, or 1.0 for an empty extent.
    pub fn aspect_ratio(&self) -> f32 {
        if self.is_empty() {
            1.0
        } else {
            self.width as f32 / self.height as f32
        }
    }
}

// ============================================================================
// Viewport
// ============================================================================

/// Viewport configuration for rendering.
///
/// Depth range is `[0, 1]` and the origin is the top-left corner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: 0.0,
            height: 0.0,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

impl Viewport {
    /// Create a viewport covering `extent` with the standard depth range.
    pub fn from_extent(extent: Extent2d) -> Self {
        Self {
            width: extent.width as f32,
            height: extent.height as f32,
            ..Default::default()
        }
    }
}

// ============================================================================
// Scissor Rectangle
// ============================================================================

/// Scissor rectangle for clipping rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ScissorRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl ScissorRect {
    /// Scissor covering `extent` from the origin.
    pub fn from_extent(extent: Extent2d) -> Self {
        Self {
            x: 0,
            y: 0,
            width: extent.width,
            height: extent.height,
        }
    }
}

/// Clear value for render targets.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ClearValue {
    /// Keep the previous contents.
    #[default]
    Load,
    /// Contents are undefined at the start of the pass.
    DontCare,
    /// Clear color attachment with RGBA values.
    Color([f32; 4]),
    /// Clear depth attachment.
    Depth(f32),
}

impl ClearValue {
    /// Create a color clear value.
    pub fn color(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self::Color([r, g, b, a])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mip_extent_clamps_to_one() {
        let extent = Extent2d::new(1280, 720);
        assert_eq!(extent.mip(1), Extent2d::new(640, 360));
        assert_eq!(extent.mip(10), Extent2d::new(1, 1));
        assert_eq!(extent.mip(40), Extent2d::new(1, 1));
    }

    #[test]
    fn test_empty_extent() {
        assert!(Extent2d::new(0, 720).is_empty());
        assert!(!Extent2d::new(1, 1).is_empty());
        assert_eq!(Extent2d::default().aspect_ratio(), 1.0);
    }
}
