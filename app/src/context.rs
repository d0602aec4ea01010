//! Application context handed to every [`AppHandler`](crate::AppHandler)
//! callback.

use std::sync::Arc;

use ember_graphics::{DrawableSurface, Extent2d, FrameJobs, Renderer};
use winit::window::Window;

/// The window as the renderer sees it: its current size in physical pixels.
#[derive(Clone)]
pub struct WindowSurface {
    window: Arc<Window>,
}

impl WindowSurface {
    pub fn new(window: Arc<Window>) -> Self {
        Self { window }
    }

    pub fn window(&self) -> &Window {
        &self.window
    }
}

impl DrawableSurface for WindowSurface {
    fn drawable_extent(&self) -> Extent2d {
        let size = self.window.inner_size();
        Extent2d::new(size.width, size.height)
    }
}

/// Renderer, window and frame timing.
pub struct AppContext {
    // Dropped before the window it renders to.
    pub(crate) renderer: Renderer,
    pub(crate) surface: WindowSurface,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) scale_factor: f64,
    pub(crate) frame_number: u64,
    pub(crate) delta_time: f32,
    pub(crate) elapsed_time: f32,
}

impl AppContext {
    pub(crate) fn new(renderer: Renderer, surface: WindowSurface) -> Self {
        let extent = surface.drawable_extent();
        let scale_factor = surface.window().scale_factor();
        Self {
            renderer,
            surface,
            width: extent.width,
            height: extent.height,
            scale_factor,
            frame_number: 0,
            delta_time: 0.0,
            elapsed_time: 0.0,
        }
    }

    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    /// Load resources or change the environment map.
    pub fn renderer_mut(&mut self) -> &mut Renderer {
        &mut self.renderer
    }

    /// This frame's jobs. Cleared after every rendered frame.
    pub fn jobs(&mut self) -> &mut FrameJobs {
        self.renderer.jobs()
    }

    pub fn window(&self) -> &Window {
        self.surface.window()
    }

    /// Current width in physical pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Current height in physical pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Width over height, 1.0 while minimised.
    pub fn aspect_ratio(&self) -> f32 {
        if self.height == 0 {
            1.0
        } else {
            self.width as f32 / self.height as f32
        }
    }

    pub fn scale_factor(&self) -> f64 {
        self.scale_factor
    }

    /// Frames presented so far.
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Seconds since the previous update.
    pub fn delta_time(&self) -> f32 {
        self.delta_time
    }

    /// Seconds since the app started.
    pub fn elapsed_time(&self) -> f32 {
        self.elapsed_time
    }

    pub(crate) fn sync_size(&mut self) {
        let extent = self.surface.drawable_extent();
        self.width = extent.width;
        self.height = extent.height;
    }
}
