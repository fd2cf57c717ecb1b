// =============================================================================
// RENDER SANDBOX - drives render-core against a real window
// =============================================================================
//
// A spinning textured triangle. Enough to exercise every piece of the core:
//   - swapchain acquire -> render -> present with resize and minimize
//   - per-image descriptor sets (uniform buffer + texture)
//   - push constants
//   - shader hot reload (edit shaders/triangle.frag, rebuild the SPIR-V)
//
// FRAME FLOW:
// 1. Poll the shader watcher, rebuild pipelines whose shader changed
// 2. new_frame: wait for the sync slot, acquire, wait for the image
// 3. Record into the image's command list
// 4. present: submit with acquire/render semaphores, present, maybe resize
//
// Keys: ESC quits, F11 toggles fullscreen.
// =============================================================================

use anyhow::{Context, Result};
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

use render_core::buffer::{IndexBuffer, UniformBuffer, VertexBuffer};
use render_core::{Pipeline, PipelineDesc, RendererConfig, RendererContext, Swapchain, Texture};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = RendererConfig::load();

    init_logging(&config)?;
    log::info!("Starting render sandbox");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!("Present mode: {}", config.graphics.present_mode);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Initialize logging, optionally into the configured log file
fn init_logging(config: &RendererConfig) -> Result<()> {
    use env_logger::{Builder, Target};
    use log::LevelFilter;

    let mut builder = Builder::new();
    builder.filter_level(LevelFilter::Info);
    builder.parse_default_env();

    if config.debug.log_to_file {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
            .with_context(|| format!("Failed to open log file {}", config.debug.log_file))?;
        writeln!(file, "=== Render Sandbox Log ===")?;
        writeln!(file, "Started: {:?}", std::time::SystemTime::now())?;
        writeln!(file)?;
        builder.target(Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}

// =============================================================================
// SCENE
// =============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Vertex {
    position: [f32; 2],
    color: [f32; 3],
    uv: [f32; 2],
}

const VERTICES: [Vertex; 3] = [
    Vertex {
        position: [0.0, -0.6],
        color: [1.0, 0.3, 0.3],
        uv: [0.5, 0.0],
    },
    Vertex {
        position: [0.6, 0.5],
        color: [0.3, 1.0, 0.3],
        uv: [1.0, 1.0],
    },
    Vertex {
        position: [-0.6, 0.5],
        color: [0.3, 0.3, 1.0],
        uv: [0.0, 1.0],
    },
];

const INDICES: [u32; 3] = [0, 1, 2];

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Material {
    tint: [f32; 4],
}

fn checkerboard(size: u32) -> Vec<u8> {
    (0..size * size)
        .flat_map(|i| {
            let (x, y) = (i % size, i / size);
            if (x + y) % 2 == 0 {
                [255, 255, 255, 255]
            } else {
                [90, 90, 90, 255]
            }
        })
        .collect()
}

/// GPU objects the sandbox draws with
struct Scene {
    pipeline: Arc<Pipeline>,
    vertices: VertexBuffer,
    indices: IndexBuffer,
    _material: UniformBuffer,
    _checker: Arc<Texture>,
}

impl Scene {
    fn new(renderer: &RendererContext, swapchain: &Swapchain) -> Result<Self> {
        let gpu = renderer.gpu();

        let shader = renderer.shader("triangle")?;
        let pipeline = renderer.create_pipeline(
            PipelineDesc::new(shader, swapchain.render_pass().clone()),
            swapchain.image_count(),
        )?;

        let vertices = VertexBuffer::with_slice(gpu, &VERTICES)?;
        let indices = IndexBuffer::with_slice(gpu, &INDICES)?;
        let material = UniformBuffer::with_value(gpu, &Material {
            tint: [1.0, 1.0, 1.0, 1.0],
        })?;
        let checker = renderer.create_texture(8, 8, &checkerboard(8))?;

        pipeline.set_uniform_buffer(&material, 0)?;
        pipeline.set_texture(&checker, 1, 0)?;

        Ok(Self {
            pipeline,
            vertices,
            indices,
            _material: material,
            _checker: checker,
        })
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Field order matters for Drop: the scene and swapchain go before the
/// renderer context that owns the device.
struct App {
    config: RendererConfig,

    window: Option<Arc<Window>>,
    is_fullscreen: bool,

    scene: Option<Scene>,
    swapchain: Option<Swapchain>,
    renderer: Option<RendererContext>,

    // FPS tracking
    started: Instant,
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: RendererConfig) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let now = Instant::now();
        Self {
            config,
            window: None,
            is_fullscreen,
            scene: None,
            swapchain: None,
            renderer: None,
            started: now,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    fn init_renderer(&mut self, window: &Window) -> Result<()> {
        let renderer = RendererContext::init(self.config.clone())?;
        let swapchain = renderer.create_swapchain(window)?;
        let scene = Scene::new(&renderer, &swapchain)?;

        self.scene = Some(scene);
        self.swapchain = Some(swapchain);
        self.renderer = Some(renderer);
        Ok(())
    }

    /// Render one frame. Returns false when nothing was drawn (minimized).
    fn render_frame(&mut self) -> Result<bool> {
        let (Some(renderer), Some(swapchain), Some(scene)) = (&self.renderer, &mut self.swapchain, &self.scene)
        else {
            return Ok(false);
        };

        let rebuilt = renderer.process_shader_changes();
        if rebuilt > 0 {
            log::info!("{} pipelines rebuilt after shader change", rebuilt);
        }

        if !swapchain.new_frame()? {
            return Ok(false);
        }

        // Resize may have changed the image count
        renderer.sync_swapchain(swapchain)?;

        let image_index = swapchain.current_image_index();
        let extent = swapchain.extent();
        swapchain.begin_render_pass(self.config.graphics.clear_color)?;

        let aspect = extent.height as f32 / extent.width.max(1) as f32;
        let transform = Mat4::from_scale(Vec3::new(aspect, 1.0, 1.0))
            * Mat4::from_rotation_z(self.started.elapsed().as_secs_f32());

        let list = swapchain.current_command_list()?;
        scene.pipeline.bind(list, image_index)?;
        scene.pipeline.push_constants(list, &transform)?;
        list.bind_vertex_buffer(scene.vertices.raw())?;
        list.bind_index_buffer(scene.indices.raw())?;
        list.draw_indexed(INDICES.len() as u32, 1)?;

        swapchain.present()?;
        Ok(true)
    }

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                // Enter fullscreen (use current monitor)
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
        }
    }

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        if now.duration_since(self.last_fps_update).as_secs_f32() >= 1.0 {
            let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                let mode = if self.is_fullscreen { "fullscreen" } else { "windowed" };
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms) [{}]",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                    mode
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }

    /// Tear down in dependency order and drain the GPU
    fn shutdown(&mut self) {
        self.scene = None;
        self.swapchain = None;
        if let Some(renderer) = self.renderer.take() {
            if let Err(e) = renderer.shutdown() {
                log::error!("Renderer shutdown failed: {:#}", e);
            }
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_renderer(&window) {
            log::error!("Failed to initialize renderer: {:#}", e);
            event_loop.exit();
            return;
        }

        self.window = Some(window);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: winit::window::WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                // Zero size (minimized) suspends rendering inside the swapchain
                if let Some(swapchain) = self.swapchain.as_mut() {
                    swapchain.on_resize(size.width, size.height);
                }
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(true) => self.update_fps(),
                Ok(false) => {}
                Err(e) => {
                    log::error!("Render error: {:#}", e);
                    event_loop.exit();
                }
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                event_loop.exit();
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.shutdown();
        log::info!("Cleanup complete");
    }
}
