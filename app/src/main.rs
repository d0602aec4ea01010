//! Demo scene: a ring of lit cubes, a particle fountain and an orbiting
//! camera.
//!
//! ```bash
//! cargo run -p ember-app -- --max-frames 300
//! ```

use std::process::ExitCode;

use glam::{Mat4, Quat, Vec3, Vec4};
use winit::event::{ElementState, KeyEvent};
use winit::keyboard::{Key, NamedKey};

use ember_app::{App, AppArgs, AppContext, AppHandler, DefaultAppArgs};
use ember_core::Handle;
use ember_graphics::resources::{Material, Mesh};
use ember_graphics::types::Vertex;
use ember_graphics::{
    Camera, EmitterJob, GraphicsResult, ImageData, ImageFormat, MaterialDescriptor, MeshData,
    StaticRenderJob,
};

const CUBE_COUNT: usize = 8;

/// Unit cube with per-face normals.
fn cube() -> MeshData {
    let faces = [
        (Vec3::X, Vec3::Y),
        (Vec3::NEG_X, Vec3::Y),
        (Vec3::Y, Vec3::Z),
        (Vec3::NEG_Y, Vec3::Z),
        (Vec3::Z, Vec3::Y),
        (Vec3::NEG_Z, Vec3::Y),
    ];
    let mut mesh = MeshData::default();
    for (normal, up) in faces {
        let right = up.cross(normal);
        let base = mesh.vertices.len() as u32;
        for (u, v) in [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)] {
            let position = (normal + right * (u * 2.0 - 1.0) + up * (v * 2.0 - 1.0)) * 0.5;
            mesh.vertices.push(Vertex {
                position: position.to_array(),
                normal: normal.to_array(),
                uv: [u, 1.0 - v],
                tangent: right.extend(1.0).to_array(),
            });
        }
        mesh.indices
            .extend([base, base + 1, base + 2, base + 2, base + 3, base]);
    }
    mesh
}

#[derive(Default)]
struct Demo {
    scene: Option<(Handle<Mesh>, Handle<Material>)>,
    quit: bool,
}

impl AppHandler for Demo {
    fn on_init(&mut self, ctx: &mut AppContext) -> GraphicsResult<()> {
        let renderer = ctx.renderer_mut();
        let mesh = renderer.load_mesh("cube", &cube())?;
        let albedo = renderer.load_image(
            "cube albedo",
            &ImageData::solid([200, 120, 60, 255], ImageFormat::Rgba8Srgb),
        )?;
        let material =
            renderer.create_material("cube", MaterialDescriptor::Textured { base_color: albedo })?;
        self.scene = Some((mesh, material));
        log::info!("Demo scene loaded");
        Ok(())
    }

    fn on_update(&mut self, ctx: &mut AppContext) -> bool {
        if self.quit {
            return false;
        }
        let Some((mesh, material)) = self.scene else {
            return true;
        };

        let time = ctx.elapsed_time();
        let aspect = ctx.aspect_ratio();
        let eye = Vec3::new(time.cos() * 8.0, 3.0, time.sin() * 8.0);
        let jobs = ctx.jobs();
        jobs.camera = Camera::look_at(eye, Vec3::ZERO, 60f32.to_radians(), aspect);

        for i in 0..CUBE_COUNT {
            let angle = i as f32 / CUBE_COUNT as f32 * std::f32::consts::TAU;
            let position = Vec3::new(angle.cos() * 3.0, 0.0, angle.sin() * 3.0);
            let transform = Mat4::from_scale_rotation_translation(
                Vec3::splat(0.8),
                Quat::from_rotation_y(time + angle),
                position,
            );
            let hue = i as f32 / CUBE_COUNT as f32;
            jobs.add_static(
                StaticRenderJob::new(mesh, material, transform)
                    .with_color(Vec4::new(1.0 - hue, 0.6, hue, 1.0)),
            );
        }
        jobs.add_emitter(EmitterJob::new(Vec3::ZERO, Vec3::new(0.0, 4.0, 0.0), 16));
        jobs.add_line(Vec3::ZERO, Vec3::Y * 2.0, Vec4::new(1.0, 1.0, 0.0, 1.0));
        true
    }

    fn on_resize(&mut self, ctx: &mut AppContext) {
        log::info!("Surface is now {}x{}", ctx.width(), ctx.height());
    }

    fn on_key(&mut self, _ctx: &mut AppContext, event: &KeyEvent) {
        if event.state == ElementState::Pressed && event.logical_key == Key::Named(NamedKey::Escape)
        {
            self.quit = true;
        }
    }

    fn on_shutdown(&mut self, ctx: &mut AppContext) {
        if let Some((mesh, material)) = self.scene.take() {
            let pool = ctx.renderer_mut().pool_mut();
            pool.release_material(material);
            pool.release_mesh(mesh);
        }
    }
}

fn main() -> ExitCode {
    App::run(Demo::default(), DefaultAppArgs::parse())
}
