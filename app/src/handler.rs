//! Application handler trait.

use winit::event::{KeyEvent, MouseButton};

use crate::context::AppContext;

/// Callbacks through which an application describes its frames.
///
/// # Lifecycle
///
/// 1. `on_init` - Once, after the renderer exists
/// 2. `on_update` - Every frame, before the renderer draws
/// 3. `on_resize` - After the swapchain was rebuilt for a new window size
/// 4. `on_shutdown` - Once, before the renderer is torn down
///
/// Jobs added through [`AppContext::jobs`] in `on_update` are drawn by that
/// frame and then cleared.
pub trait AppHandler {
    /// Load meshes, images and materials. Returning an error aborts startup.
    fn on_init(&mut self, _ctx: &mut AppContext) -> ember_graphics::GraphicsResult<()> {
        Ok(())
    }

    /// Called every frame. Return `false` to exit.
    fn on_update(&mut self, _ctx: &mut AppContext) -> bool {
        true
    }

    /// The new size is available in `ctx.width()` and `ctx.height()`.
    fn on_resize(&mut self, _ctx: &mut AppContext) {}

    fn on_key(&mut self, _ctx: &mut AppContext, _event: &KeyEvent) {}

    fn on_mouse_move(&mut self, _ctx: &mut AppContext, _x: f64, _y: f64) {}

    fn on_mouse_button(&mut self, _ctx: &mut AppContext, _button: MouseButton, _pressed: bool) {}

    /// Release anything the handler loaded. The renderer shuts down after
    /// this returns.
    fn on_shutdown(&mut self, _ctx: &mut AppContext) {}
}
