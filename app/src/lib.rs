//! # Ember App
//!
//! Windowed shell around the Ember renderer.
//!
//! The [`App`] owns a winit event loop and window, creates a
//! [`Renderer`](ember_graphics::Renderer) for it and calls an [`AppHandler`]
//! every frame to fill in the frame's jobs.
//!
//! ## Overview
//!
//! - [`AppHandler`] - Lifecycle callbacks that describe each frame
//! - [`AppArgs`] - Settings the shell needs, with a clap-backed [`DefaultAppArgs`]
//! - [`App`] - Event loop, window and renderer
//!
//! ## Example
//!
//! ```ignore
//! use ember_app::{App, AppArgs, AppContext, AppHandler, DefaultAppArgs};
//!
//! struct MyApp;
//!
//! impl AppHandler for MyApp {
//!     fn on_update(&mut self, ctx: &mut AppContext) -> bool {
//!         ctx.jobs().camera = my_camera(ctx.aspect_ratio());
//!         true
//!     }
//! }
//!
//! fn main() -> std::process::ExitCode {
//!     App::run(MyApp, DefaultAppArgs::parse())
//! }
//! ```

mod app;
mod args;
mod context;
mod handler;

pub use app::App;
pub use args::{AppArgs, CliBackend, DefaultAppArgs};
pub use context::{AppContext, WindowSurface};
pub use handler::AppHandler;

/// App library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Log the app library version.
pub fn init() {
    log::info!("Ember App v{} initialized", VERSION);
}
