//! Main application struct and event loop.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use winit::application::ApplicationHandler;
use winit::event::{ElementState, WindowEvent};
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::window::{Window, WindowId};

use ember_graphics::{DrawableSurface, FrameOutcome, GraphicsError, Renderer};

use crate::args::AppArgs;
use crate::context::{AppContext, WindowSurface};
use crate::handler::AppHandler;

/// Event loop, window and renderer, driving an [`AppHandler`].
///
/// # Example
///
/// ```ignore
/// use ember_app::{App, AppArgs, AppHandler, DefaultAppArgs};
///
/// struct MyApp;
/// impl AppHandler for MyApp {}
///
/// fn main() -> std::process::ExitCode {
///     App::run(MyApp, DefaultAppArgs::parse())
/// }
/// ```
pub struct App<H, A>
where
    H: AppHandler,
    A: AppArgs,
{
    handler: H,
    args: A,
    context: Option<AppContext>,
    start_time: Instant,
    last_frame_time: Instant,
    running: bool,
    failed: bool,
}

impl<H, A> App<H, A>
where
    H: AppHandler + 'static,
    A: AppArgs + 'static,
{
    pub fn new(handler: H, args: A) -> Self {
        Self {
            handler,
            args,
            context: None,
            start_time: Instant::now(),
            last_frame_time: Instant::now(),
            running: true,
            failed: false,
        }
    }

    /// Initialise logging, run the event loop until the window closes and
    /// report whether the app exited cleanly.
    pub fn run(handler: H, args: A) -> ExitCode {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

        ember_core::init();
        crate::init();

        let event_loop = match EventLoop::new() {
            Ok(event_loop) => event_loop,
            Err(e) => {
                log::error!("Failed to create event loop: {}", e);
                return ExitCode::FAILURE;
            }
        };

        let mut app = Self::new(handler, args);
        if let Err(e) = event_loop.run_app(&mut app) {
            log::error!("Event loop error: {}", e);
            return ExitCode::FAILURE;
        }
        if app.failed {
            ExitCode::FAILURE
        } else {
            ExitCode::SUCCESS
        }
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<(), GraphicsError> {
        let attributes = Window::default_attributes()
            .with_title(self.args.window_title())
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.args.window_width(),
                self.args.window_height(),
            ));
        let window = event_loop.create_window(attributes).map_err(|e| {
            GraphicsError::InitializationFailed(format!("Failed to create window: {e}"))
        })?;
        let surface = WindowSurface::new(Arc::new(window));
        log::info!("Window created");

        let config = self.args.renderer_config()?;
        let renderer =
            Renderer::with_window(config, surface.window(), surface.drawable_extent())?;
        log::info!("Renderer ready on {}", renderer.backend().name());

        let context = self.context.insert(AppContext::new(renderer, surface));
        self.handler.on_init(context)
    }

    /// Update the handler, render and react to the outcome.
    fn render_frame(&mut self) {
        let now = Instant::now();
        let delta_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;

        let Some(ctx) = &mut self.context else {
            return;
        };
        ctx.delta_time = delta_time;
        ctx.elapsed_time = now.duration_since(self.start_time).as_secs_f32();

        if !self.handler.on_update(ctx) {
            self.running = false;
            return;
        }
        {
            let (delta, elapsed) = (ctx.delta_time, ctx.elapsed_time);
            let jobs = ctx.jobs();
            jobs.delta_time = delta;
            jobs.elapsed = elapsed;
        }

        match ctx.renderer.render_frame(&ctx.surface) {
            Ok(FrameOutcome::Presented) => ctx.frame_number += 1,
            Ok(FrameOutcome::PresentedThenRecreated) => {
                ctx.frame_number += 1;
                ctx.sync_size();
                self.handler.on_resize(ctx);
            }
            Ok(FrameOutcome::SwapchainRecreated) => {
                ctx.sync_size();
                self.handler.on_resize(ctx);
            }
            Ok(FrameOutcome::Skipped) => {}
            Err(e) if e.is_fatal() => {
                log::error!("Fatal frame error: {}", e);
                self.failed = true;
                self.running = false;
                return;
            }
            Err(e) => log::error!("Frame {} failed: {}", ctx.frame_number, e),
        }

        if let Some(max_frames) = self.args.max_frames()
            && ctx.frame_number >= max_frames
        {
            log::info!("Reached max frames limit ({}), exiting", max_frames);
            self.running = false;
        }
    }

    /// Let the handler release its resources, then tear the renderer down.
    fn shutdown(&mut self) {
        let Some(mut ctx) = self.context.take() else {
            return;
        };
        self.handler.on_shutdown(&mut ctx);
        let frames = ctx.frame_number;
        if let Err(e) = ctx.renderer.shutdown() {
            log::error!("Renderer shutdown failed: {}", e);
            self.failed = true;
        }
        log::info!("Shut down after {} frames", frames);
    }
}

impl<H, A> ApplicationHandler for App<H, A>
where
    H: AppHandler + 'static,
    A: AppArgs + 'static,
{
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.context.is_some() {
            return;
        }
        if let Err(e) = self.init(event_loop) {
            log::error!("Initialization failed: {}", e);
            self.failed = true;
            self.shutdown();
            event_loop.exit();
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested");
                self.running = false;
                self.shutdown();
                event_loop.exit();
            }

            // The renderer notices the new size through a stale swapchain.
            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
            }

            WindowEvent::ScaleFactorChanged { scale_factor, .. } => {
                if let Some(ctx) = &mut self.context {
                    ctx.scale_factor = scale_factor;
                    log::info!("Scale factor changed to {}", scale_factor);
                }
            }

            WindowEvent::RedrawRequested => {
                if self.running {
                    self.render_frame();
                }
                if !self.running {
                    self.shutdown();
                    event_loop.exit();
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                if let Some(ctx) = &mut self.context {
                    self.handler.on_key(ctx, &event);
                }
            }

            WindowEvent::CursorMoved { position, .. } => {
                if let Some(ctx) = &mut self.context {
                    self.handler.on_mouse_move(ctx, position.x, position.y);
                }
            }

            WindowEvent::MouseInput { state, button, .. } => {
                if let Some(ctx) = &mut self.context {
                    let pressed = state == ElementState::Pressed;
                    self.handler.on_mouse_button(ctx, button, pressed);
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ctx) = &self.context {
            ctx.window().request_redraw();
        }
    }
}
