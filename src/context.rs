// Renderer context - explicit owner of everything shared across components
//
// `GpuContext` is the device plus its two queues and the deferred destroyer;
// every GPU resource keeps an `Arc` to it. `RendererContext` adds the shader
// library, the shader -> pipeline index that drives hot reload, and the
// fallback texture. Both are built once at startup and shut down explicitly.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use crate::backend::{self, GpuDevice, QueueKind};
use crate::config::RendererConfig;
use crate::framebuffer::{Framebuffer, FramebufferSpec};
use crate::handle::DeferredDestroyer;
use crate::pipeline::{Pipeline, PipelineDesc};
use crate::queue::{Queue, Timeline};
use crate::shader::{ManifestShaderSource, Shader, ShaderLibrary, ShaderSource, ShaderWatcher};
use crate::swapchain::{Swapchain, SwapchainOptions, WindowSurface};
use crate::texture::Texture;

// =============================================================================
// GPU CONTEXT
// =============================================================================

pub struct GpuContext {
    device: Arc<dyn GpuDevice>,
    graphics: Queue,
    transfer: Queue,
    destroyer: Arc<DeferredDestroyer>,
}

impl GpuContext {
    pub fn new(device: Arc<dyn GpuDevice>, max_command_lists: usize) -> Arc<Self> {
        let graphics = Timeline::new(device.clone(), QueueKind::Graphics);
        let transfer = Timeline::new(device.clone(), QueueKind::Transfer);
        let destroyer = Arc::new(DeferredDestroyer::new(
            device.clone(),
            vec![graphics.clone(), transfer.clone()],
        ));

        log::info!("GPU context ready on {} device", device.name());
        Arc::new(Self {
            graphics: Queue::new(graphics, max_command_lists),
            transfer: Queue::new(transfer, max_command_lists),
            device,
            destroyer,
        })
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    pub fn graphics(&self) -> &Queue {
        &self.graphics
    }

    pub fn transfer(&self) -> &Queue {
        &self.transfer
    }

    pub fn queue(&self, kind: QueueKind) -> &Queue {
        match kind {
            QueueKind::Graphics => &self.graphics,
            QueueKind::Transfer => &self.transfer,
        }
    }

    pub fn destroyer(&self) -> &Arc<DeferredDestroyer> {
        &self.destroyer
    }

    /// Drain every queue
    pub fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle().context("Failed to wait for device idle")?;
        self.graphics.wait()?;
        self.transfer.wait()
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        if let Err(e) = self.wait_idle() {
            log::error!("Failed to drain GPU on shutdown: {:#}", e);
        }
        if let Err(e) = self.destroyer.flush() {
            log::error!("Failed to destroy retired GPU objects: {:#}", e);
        }
    }
}

// =============================================================================
// RENDERER CONTEXT
// =============================================================================

pub struct RendererContext {
    config: RendererConfig,
    gpu: Arc<GpuContext>,
    shaders: ShaderLibrary,
    /// Shader name -> pipelines built from it
    dependents: Mutex<HashMap<String, Vec<Weak<Pipeline>>>>,
    black_texture: Option<Arc<Texture>>,
    watcher: Option<ShaderWatcher>,
    /// Generation of the swapchain the per-image sets were last sized for
    swapchain_generation: Mutex<Option<u64>>,
}

impl RendererContext {
    /// Create the configured device and read shaders from the configured directory
    pub fn init(config: RendererConfig) -> Result<Self> {
        let device = backend::create_device(&config)?;
        let source = ManifestShaderSource::new(config.shaders.directory.clone());
        Self::with_device(config, device, Box::new(source))
    }

    pub fn with_device(config: RendererConfig, device: Arc<dyn GpuDevice>, source: Box<dyn ShaderSource>) -> Result<Self> {
        let gpu = GpuContext::new(device, config.pools.max_command_lists);
        let black_texture = Texture::black(&gpu).context("Failed to create fallback texture")?;

        let watcher = match (config.shaders.hot_reload, source.watch_directory()) {
            (true, Some(directory)) if directory.is_dir() => match ShaderWatcher::new(directory) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    log::warn!("Shader hot reload disabled: {:#}", e);
                    None
                }
            },
            _ => None,
        };

        Ok(Self {
            config,
            gpu,
            shaders: ShaderLibrary::new(source),
            dependents: Mutex::new(HashMap::new()),
            black_texture: Some(black_texture),
            watcher,
            swapchain_generation: Mutex::new(None),
        })
    }

    pub fn gpu(&self) -> &Arc<GpuContext> {
        &self.gpu
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        self.gpu.device()
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn shaders(&self) -> &ShaderLibrary {
        &self.shaders
    }

    pub fn shader(&self, name: &str) -> Result<Arc<Shader>> {
        self.shaders
            .get(name)
            .with_context(|| format!("Failed to load shader '{}'", name))
    }

    pub fn black_texture(&self) -> Result<&Arc<Texture>> {
        self.black_texture
            .as_ref()
            .context("Renderer context has been shut down")
    }

    pub fn create_swapchain(&self, window: &dyn WindowSurface) -> Result<Swapchain> {
        let swapchain = Swapchain::new(&self.gpu, window, SwapchainOptions::from_config(&self.config))?;
        *self.swapchain_generation.lock() = Some(swapchain.generation());
        Ok(swapchain)
    }

    /// Resize every pipeline's per-image sets if `swapchain` was rebuilt
    /// since the last call. Call after each `new_frame`, before binding.
    /// Returns whether a rebuild was observed.
    pub fn sync_swapchain(&self, swapchain: &Swapchain) -> Result<bool> {
        let mut seen = self.swapchain_generation.lock();
        if *seen == Some(swapchain.generation()) {
            return Ok(false);
        }
        self.on_swapchain_recreated(swapchain.image_count())?;
        *seen = Some(swapchain.generation());
        log::debug!(
            "Pipelines follow swapchain generation {} ({} images)",
            swapchain.generation(),
            swapchain.image_count()
        );
        Ok(true)
    }

    /// Build a pipeline and register it for hot reload of its shader
    pub fn create_pipeline(&self, desc: PipelineDesc, image_count: usize) -> Result<Arc<Pipeline>> {
        let fallback = self.black_texture()?.clone();
        let pipeline = Pipeline::new(&self.gpu, desc, image_count, &self.config.pools, fallback)?;
        self.dependents
            .lock()
            .entry(pipeline.shader().name().to_string())
            .or_default()
            .push(Arc::downgrade(&pipeline));
        Ok(pipeline)
    }

    pub fn create_texture(&self, width: u32, height: u32, pixels: &[u8]) -> Result<Arc<Texture>> {
        Texture::from_rgba8(&self.gpu, width, height, pixels)
    }

    pub fn create_framebuffer(&self, spec: FramebufferSpec) -> Result<Framebuffer> {
        Framebuffer::new(&self.gpu, spec)
    }

    /// Live pipelines built from `shader`
    pub fn dependents_of(&self, shader: &str) -> Vec<Arc<Pipeline>> {
        let mut dependents = self.dependents.lock();
        match dependents.get_mut(shader) {
            Some(pipelines) => {
                pipelines.retain(|p| p.strong_count() > 0);
                pipelines.iter().filter_map(Weak::upgrade).collect()
            }
            None => Vec::new(),
        }
    }

    /// Reload `name` and rebuild every live pipeline using it.
    /// Returns the number of pipelines rebuilt.
    pub fn reload_shader(&self, name: &str) -> Result<usize> {
        if self.shaders.reload(name)?.is_none() {
            log::debug!("Shader '{}' changed but was never loaded", name);
            return Ok(0);
        }
        let pipelines = self.dependents_of(name);
        for pipeline in &pipelines {
            pipeline.invalidate()?;
        }
        log::info!("Shader '{}' reloaded, {} pipelines rebuilt", name, pipelines.len());
        Ok(pipelines.len())
    }

    /// Reload whatever the watcher saw change. A shader that fails to
    /// compile keeps its previous contents.
    pub fn process_shader_changes(&self) -> usize {
        let Some(watcher) = &self.watcher else {
            return 0;
        };
        let mut rebuilt = 0;
        for name in watcher.poll_changed() {
            match self.reload_shader(&name) {
                Ok(count) => rebuilt += count,
                Err(e) => log::error!("Hot reload of '{}' failed: {:#}", name, e),
            }
        }
        rebuilt
    }

    /// Reallocate per-image sets of every live pipeline
    pub fn on_swapchain_recreated(&self, image_count: usize) -> Result<()> {
        let pipelines: Vec<Arc<Pipeline>> = {
            let mut dependents = self.dependents.lock();
            dependents
                .values_mut()
                .flat_map(|pipelines| {
                    pipelines.retain(|p| p.strong_count() > 0);
                    pipelines.iter().filter_map(Weak::upgrade).collect::<Vec<_>>()
                })
                .collect()
        };
        for pipeline in pipelines {
            pipeline.set_image_count(image_count)?;
        }
        Ok(())
    }

    /// Drain the GPU and free everything the context owns
    pub fn shutdown(mut self) -> Result<()> {
        log::info!("Shutting down renderer context");
        self.gpu.wait_idle()?;
        self.watcher = None;
        self.dependents.lock().clear();
        self.black_texture = None;
        self.gpu.destroyer().flush()
    }
}
