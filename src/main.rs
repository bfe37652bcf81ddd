//! CLI entry point: loads a glTF scene and runs the interactive path-traced
//! viewer with denoised presentation.

mod accel;
mod buffer;
mod camera;
mod context;
mod denoiser;
mod gbuffer;
mod gltf_loader;
mod image;
mod pipeline;
mod renderer;
mod scene;
mod spv_loader;

use clap::Parser;
use glam::Vec3;
use log::{error, info};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Instant;

use winit::application::ApplicationHandler;
use winit::event::{DeviceEvent, DeviceId, WindowEvent};
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::{Window, WindowId};

use camera::{Camera, MoveDirection};
use context::VulkanContext;
use renderer::Renderer;
use scene::ClassifyParams;

/// Real-time path tracer with SVGF-style denoising.
#[derive(Parser)]
#[command(name = "pathlight", about = "Vulkan ray-traced glTF viewer")]
struct Args {
    /// Path to a .glb or .gltf scene.
    scene: PathBuf,

    /// Directory containing the compiled .spv shaders.
    #[arg(long, default_value = "shaders")]
    shader_dir: PathBuf,

    /// Window width in pixels.
    #[arg(long, default_value = "1280")]
    width: u32,

    /// Window height in pixels.
    #[arg(long, default_value = "720")]
    height: u32,

    /// Exit after this many frames (soak/CI runs).
    #[arg(long)]
    max_frames: Option<u64>,

    /// Metallic factor at or above which a material shades as metal.
    #[arg(long, default_value = "0.5")]
    metallic_threshold: f32,

    /// Transmission factor at or above which a material shades as glass.
    #[arg(long, default_value = "0.5")]
    transmission_threshold: f32,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    if let Err(e) = run(args) {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), String> {
    let classify = ClassifyParams {
        metallic_threshold: args.metallic_threshold,
        transmission_threshold: args.transmission_threshold,
    };
    let scene_data = gltf_loader::load_gltf(&args.scene, classify)?;

    let event_loop =
        EventLoop::new().map_err(|e| format!("Failed to create event loop: {}", e))?;

    let mut app = App {
        args,
        scene_data,
        window: None,
        ctx: None,
        renderer: None,
        camera: Camera::new(Vec3::new(0.0, 99.0, 0.0), -90.0, 0.0),
        pressed: HashSet::new(),
        last_frame: Instant::now(),
        frames_drawn: 0,
        fatal: None,
    };

    event_loop
        .run_app(&mut app)
        .map_err(|e| format!("Event loop error: {}", e))?;

    app.teardown();

    match app.fatal {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

struct App {
    args: Args,
    scene_data: scene::SceneData,
    window: Option<Window>,
    ctx: Option<VulkanContext>,
    renderer: Option<Renderer>,
    camera: Camera,
    pressed: HashSet<KeyCode>,
    last_frame: Instant,
    frames_drawn: u64,
    fatal: Option<String>,
}

impl App {
    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<(), String> {
        let window_attrs = Window::default_attributes()
            .with_title("pathlight")
            .with_inner_size(winit::dpi::PhysicalSize::new(self.args.width, self.args.height))
            .with_resizable(false);
        let window = event_loop
            .create_window(window_attrs)
            .map_err(|e| format!("Failed to create window: {}", e))?;
        info!("Window created: {}x{}", self.args.width, self.args.height);

        let mut ctx = VulkanContext::new(&window, self.args.width, self.args.height)?;
        let renderer = Renderer::new(&mut ctx, &self.scene_data, &self.args.shader_dir)?;

        window.request_redraw();
        self.window = Some(window);
        self.ctx = Some(ctx);
        self.renderer = Some(renderer);
        self.last_frame = Instant::now();
        Ok(())
    }

    fn apply_movement(&mut self, dt: f32) {
        let moves = [
            (KeyCode::KeyW, MoveDirection::Forward),
            (KeyCode::KeyS, MoveDirection::Backward),
            (KeyCode::KeyA, MoveDirection::Left),
            (KeyCode::KeyD, MoveDirection::Right),
            (KeyCode::Space, MoveDirection::Up),
            (KeyCode::ShiftLeft, MoveDirection::Down),
        ];
        for (key, direction) in moves {
            if self.pressed.contains(&key) {
                self.camera.process_keyboard(direction, dt);
            }
        }
    }

    fn draw(&mut self) -> Result<(), String> {
        let dt = self.last_frame.elapsed().as_secs_f32();
        self.last_frame = Instant::now();
        self.apply_movement(dt);

        let (Some(ctx), Some(renderer)) = (self.ctx.as_mut(), self.renderer.as_mut()) else {
            return Ok(());
        };
        renderer.draw_frame(ctx, &self.camera)?;
        self.frames_drawn += 1;
        Ok(())
    }

    fn teardown(&mut self) {
        if let (Some(ctx), Some(mut renderer)) = (self.ctx.as_mut(), self.renderer.take()) {
            renderer.destroy(ctx);
        }
        if let Some(mut ctx) = self.ctx.take() {
            ctx.destroy();
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() {
            if let Err(e) = self.init(event_loop) {
                self.fatal = Some(e);
                event_loop.exit();
            }
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _window_id: WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Window close requested");
                event_loop.exit();
            }
            WindowEvent::KeyboardInput { event, .. } => {
                let PhysicalKey::Code(code) = event.physical_key else {
                    return;
                };
                if code == KeyCode::Escape {
                    info!("Escape pressed, closing");
                    event_loop.exit();
                    return;
                }
                if event.state.is_pressed() {
                    self.pressed.insert(code);
                } else {
                    self.pressed.remove(&code);
                }
            }
            WindowEvent::RedrawRequested => {
                if let Err(e) = self.draw() {
                    self.fatal = Some(e);
                    event_loop.exit();
                    return;
                }
                if let Some(max) = self.args.max_frames {
                    if self.frames_drawn >= max {
                        info!("Frame cap of {} reached", max);
                        event_loop.exit();
                        return;
                    }
                }
                if let Some(window) = &self.window {
                    window.request_redraw();
                }
            }
            _ => {}
        }
    }

    fn device_event(
        &mut self,
        _event_loop: &ActiveEventLoop,
        _device_id: DeviceId,
        event: DeviceEvent,
    ) {
        if let DeviceEvent::MouseMotion { delta: (dx, dy) } = event {
            self.camera.process_mouse(dx as f32, dy as f32);
        }
    }
}
