// Swapchain - acquire, render, present
//
// N presentable images come from the platform; M sync slots (frames in
// flight, M <= N) bound how far the CPU may run ahead. Slots are indexed by
// submit count, images by whatever the platform returns at acquire time, so
// both carry their own fence value.
//
// Resize is lazy: `on_resize` only records the new size. The rebuild happens
// at the next `new_frame`, or right after `present` if the platform reported
// the surface as stale. Rebuilding drains every queue first.

use anyhow::{bail, Context, Result};
use std::sync::Arc;

use crate::backend::{
    AcquireResult, Extent2D, FenceValue, GpuDevice, ImageDesc, ImageFormat, ImageUsage, PipelineStages,
    PresentMode, PresentResult, QueueKind, RawFramebuffer, RawImage, RawImageView, RawSemaphore, RawSurface,
    RawSwapchain, SurfaceTarget, SwapchainDesc, SwapchainImages, FramebufferDesc,
};
use crate::config::RendererConfig;
use crate::context::GpuContext;
use crate::error::SwapchainError;
use crate::handle::ResourceHandle;
use crate::image::Image;
use crate::queue::{CommandList, ListState};
use crate::render_pass::RenderPass;

/// Consecutive stale acquires tolerated before giving up on a frame
const MAX_ACQUIRE_ATTEMPTS: usize = 8;

// =============================================================================
// WINDOW COLLABORATOR
// =============================================================================

/// The windowing side of presentation
pub trait WindowSurface {
    fn get_surface_extent(&self) -> Extent2D;

    fn surface_target(&self) -> Result<SurfaceTarget>;

    fn create_render_surface(&self, device: &dyn GpuDevice) -> Result<RawSurface> {
        device
            .create_surface(self.surface_target()?)
            .context("Failed to create render surface")
    }
}

impl WindowSurface for winit::window::Window {
    fn get_surface_extent(&self) -> Extent2D {
        let size = self.inner_size();
        Extent2D::new(size.width, size.height)
    }

    fn surface_target(&self) -> Result<SurfaceTarget> {
        use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

        let display = self
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        let window = self
            .window_handle()
            .context("Failed to get window handle")?
            .as_raw();
        Ok(SurfaceTarget::Native { display, window })
    }
}

/// Window-less surface for the headless device
#[derive(Debug, Clone, Copy)]
pub struct HeadlessWindow {
    pub extent: Extent2D,
}

impl WindowSurface for HeadlessWindow {
    fn get_surface_extent(&self) -> Extent2D {
        self.extent
    }

    fn surface_target(&self) -> Result<SurfaceTarget> {
        Ok(SurfaceTarget::Headless)
    }
}

// =============================================================================
// SWAPCHAIN
// =============================================================================

#[derive(Debug, Clone)]
pub struct SwapchainOptions {
    /// Presentable images to ask for (N); the platform may give more
    pub image_count: u32,
    /// Sync slots (M); clamped to the image count actually created
    pub max_frames_in_flight: usize,
    pub present_mode: PresentMode,
    pub clear_color: [f32; 4],
    pub depth: bool,
}

impl SwapchainOptions {
    pub fn from_config(config: &RendererConfig) -> Self {
        Self {
            image_count: config.graphics.image_count,
            max_frames_in_flight: config.graphics.max_frames_in_flight.max(1),
            present_mode: config.present_mode(),
            clear_color: config.graphics.clear_color,
            depth: true,
        }
    }
}

struct SyncSlot {
    image_acquired: RawSemaphore,
    render_finished: RawSemaphore,
    fence: FenceValue,
}

struct PresentableImage {
    raw: RawImage,
    view: RawImageView,
    framebuffer: RawFramebuffer,
    list: CommandList,
    /// Submission that last rendered into this image
    fence: FenceValue,
}

pub struct Swapchain {
    gpu: Arc<GpuContext>,
    options: SwapchainOptions,
    surface: RawSurface,
    raw: RawSwapchain,
    format: ImageFormat,
    extent: Extent2D,
    present_mode: PresentMode,
    render_pass: ResourceHandle<RenderPass>,
    depth: Option<ResourceHandle<Image>>,
    images: Vec<PresentableImage>,
    slots: Vec<SyncSlot>,

    frame_index: usize,
    submit_count: u64,
    current_image: usize,
    acquired: bool,
    in_render_pass: bool,
    pass_recorded: bool,

    pending_resize: Option<Extent2D>,
    rebuild_after_present: bool,
    generation: u64,
}

impl Swapchain {
    pub fn new(gpu: &Arc<GpuContext>, window: &dyn WindowSurface, options: SwapchainOptions) -> Result<Self> {
        let device = gpu.device().clone();
        let extent = window.get_surface_extent();
        if extent.is_zero_area() {
            bail!("Cannot create a swapchain for a zero-area surface");
        }

        let surface = window.create_render_surface(device.as_ref())?;
        log::info!("Creating swapchain: {}x{}", extent.width, extent.height);

        let created = match device.create_swapchain(
            &SwapchainDesc {
                surface,
                extent,
                image_count: options.image_count,
                present_mode: options.present_mode,
                format: None,
            },
            RawSwapchain::NULL,
        ) {
            Ok(created) => created,
            Err(e) => {
                device.destroy_surface(surface);
                return Err(e.context("Failed to create swapchain"));
            }
        };

        let depth_format = options.depth.then_some(ImageFormat::Depth32Float);
        let render_pass = match RenderPass::for_presentation(gpu, created.format, depth_format) {
            Ok(render_pass) => render_pass,
            Err(e) => {
                device.destroy_swapchain(created.swapchain);
                device.destroy_surface(surface);
                return Err(e);
            }
        };

        let mut swapchain = Self {
            gpu: gpu.clone(),
            options,
            surface,
            raw: RawSwapchain::NULL,
            format: created.format,
            extent: created.extent,
            present_mode: created.present_mode,
            render_pass,
            depth: None,
            images: Vec::new(),
            slots: Vec::new(),
            frame_index: 0,
            submit_count: 0,
            current_image: 0,
            acquired: false,
            in_render_pass: false,
            pass_recorded: false,
            pending_resize: None,
            rebuild_after_present: false,
            generation: 0,
        };

        // From here on Drop cleans up whatever was built
        swapchain.build_images(created, Vec::new())?;
        swapchain.build_slots()?;

        log::info!(
            "Swapchain ready: {} images, {} frames in flight, {:?}, {:?}",
            swapchain.images.len(),
            swapchain.slots.len(),
            swapchain.format,
            swapchain.present_mode
        );
        Ok(swapchain)
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn raw(&self) -> RawSwapchain {
        self.raw
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Sync slots in use (M after clamping to the image count)
    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    /// Sync slot the next present will use
    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    pub fn submit_count(&self) -> u64 {
        self.submit_count
    }

    /// Image acquired by the last `new_frame` (zero right after a rebuild)
    pub fn current_image_index(&self) -> usize {
        self.current_image
    }

    pub fn extent(&self) -> Extent2D {
        self.extent
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn present_mode(&self) -> PresentMode {
        self.present_mode
    }

    pub fn render_pass(&self) -> &ResourceHandle<RenderPass> {
        &self.render_pass
    }

    /// Bumped every time the images are rebuilt.
    ///
    /// A rebuild may change the image count, which leaves pipelines holding
    /// the wrong number of per-image sets. `RendererContext::sync_swapchain`
    /// watches this value and resizes them.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Rendering is paused until the surface has a non-zero area again
    pub fn is_suspended(&self) -> bool {
        matches!(self.pending_resize, Some(extent) if extent.is_zero_area())
    }

    pub fn image_fence(&self, index: usize) -> Option<FenceValue> {
        self.images.get(index).map(|i| i.fence)
    }

    pub fn raw_image(&self, index: usize) -> Option<RawImage> {
        self.images.get(index).map(|i| i.raw)
    }

    pub fn framebuffer(&self, index: usize) -> Option<RawFramebuffer> {
        self.images.get(index).map(|i| i.framebuffer)
    }

    /// Sync slots whose last submission has not completed
    pub fn outstanding_frames(&self) -> Result<usize> {
        let graphics = self.gpu.graphics();
        let mut count = 0;
        for slot in &self.slots {
            if !graphics.is_complete(slot.fence)? {
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn command_list_for(&mut self, index: usize) -> Result<&mut CommandList> {
        let count = self.images.len();
        match self.images.get_mut(index) {
            Some(image) => Ok(&mut image.list),
            None => Err(SwapchainError::ImageIndexOutOfRange { index, count }.into()),
        }
    }

    /// List for the image acquired by the last `new_frame`
    pub fn current_command_list(&mut self) -> Result<&mut CommandList> {
        if !self.acquired {
            return Err(SwapchainError::NotAcquired.into());
        }
        let index = self.current_image;
        self.command_list_for(index)
    }

    // -------------------------------------------------------------------------
    // Frame loop
    // -------------------------------------------------------------------------

    /// Record a new window size; the rebuild happens on the next frame
    pub fn on_resize(&mut self, width: u32, height: u32) {
        log::debug!("Resize requested: {}x{}", width, height);
        self.pending_resize = Some(Extent2D::new(width, height));
    }

    /// Acquire the next image. Returns `false` while the surface has no area.
    pub fn new_frame(&mut self) -> Result<bool> {
        if self.acquired {
            log::warn!("new_frame called twice without present; keeping image {}", self.current_image);
            return Ok(true);
        }

        if let Some(requested) = self.pending_resize {
            let target = self.target_extent(requested)?;
            if target.is_zero_area() {
                self.pending_resize = Some(target);
                return Ok(false);
            }
            self.resize(target)?;
        }

        // Bound the CPU lead: this slot's previous frame must be done
        let slot_fence = self.slots[self.frame_index].fence;
        self.gpu.graphics().wait_for(slot_fence)?;
        self.gpu.destroyer().collect()?;

        let mut attempts = 0;
        let index = loop {
            attempts += 1;
            if attempts > MAX_ACQUIRE_ATTEMPTS {
                bail!("Swapchain stayed out of date after {} rebuilds", MAX_ACQUIRE_ATTEMPTS);
            }

            let semaphore = self.slots[self.frame_index].image_acquired;
            let result = self
                .gpu
                .device()
                .acquire_next_image(self.raw, semaphore)
                .context("Failed to acquire swapchain image")?;

            match result {
                AcquireResult::Acquired { index, suboptimal } => {
                    if suboptimal {
                        log::debug!("Swapchain suboptimal on acquire, rebuilding after present");
                        self.rebuild_after_present = true;
                    }
                    break index as usize;
                }
                AcquireResult::OutOfDate => {
                    log::info!("Swapchain out of date on acquire, rebuilding");
                    let target = self.target_extent(self.pending_resize.unwrap_or(self.extent))?;
                    if target.is_zero_area() {
                        self.pending_resize = Some(target);
                        return Ok(false);
                    }
                    self.resize(target)?;
                }
            }
        };

        let count = self.images.len();
        let image = self
            .images
            .get_mut(index)
            .ok_or(SwapchainError::ImageIndexOutOfRange { index, count })?;

        // The image may come back before its old slot was waited on
        self.gpu.graphics().wait_for(image.fence)?;
        image.list.reset()?;

        self.current_image = index;
        self.acquired = true;
        self.in_render_pass = false;
        self.pass_recorded = false;
        Ok(true)
    }

    /// Begin the swapchain render pass on the current image's list
    pub fn begin_render_pass(&mut self, clear_color: [f32; 4]) -> Result<()> {
        if !self.acquired {
            return Err(SwapchainError::NotAcquired.into());
        }
        let render_pass = self.render_pass.raw();
        let extent = self.extent;
        let image = &mut self.images[self.current_image];
        if image.list.state() == ListState::Idle {
            image.list.begin()?;
        }
        image
            .list
            .begin_render_pass(render_pass, image.framebuffer, extent, clear_color)?;
        image.list.set_viewport_and_scissor(extent)?;
        self.in_render_pass = true;
        self.pass_recorded = true;
        Ok(())
    }

    pub fn end_render_pass(&mut self) -> Result<()> {
        if !self.in_render_pass {
            return Ok(());
        }
        self.images[self.current_image].list.end_render_pass()?;
        self.in_render_pass = false;
        Ok(())
    }

    /// Submit the current image's list and present it
    pub fn present(&mut self) -> Result<()> {
        if !self.acquired {
            return Err(SwapchainError::NotAcquired.into());
        }

        // The image must leave through the render pass to reach present layout
        if !self.pass_recorded {
            self.begin_render_pass(self.options.clear_color)?;
        }
        self.end_render_pass()?;

        let index = self.current_image;
        let slot = self.frame_index;
        let image_acquired = self.slots[slot].image_acquired;
        let render_finished = self.slots[slot].render_finished;

        let value = self.gpu.graphics().submit_frame(
            &mut self.images[index].list,
            Some((image_acquired, PipelineStages::COLOR_ATTACHMENT_OUTPUT)),
            Some(render_finished),
        )?;
        self.slots[slot].fence = value;
        self.images[index].fence = value;
        self.acquired = false;

        let result = self
            .gpu
            .device()
            .present(QueueKind::Graphics, self.raw, index as u32, render_finished)
            .context("Failed to present swapchain image")?;

        self.submit_count += 1;
        self.frame_index = (self.submit_count % self.slots.len() as u64) as usize;

        let stale = matches!(result, PresentResult::Suboptimal | PresentResult::OutOfDate);
        if stale {
            log::info!("Swapchain {:?} on present, rebuilding", result);
        }
        if stale || self.rebuild_after_present || self.pending_resize.is_some() {
            let target = self.target_extent(self.pending_resize.unwrap_or(self.extent))?;
            if target.is_zero_area() {
                self.pending_resize = Some(target);
            } else {
                self.resize(target)?;
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Rebuild
    // -------------------------------------------------------------------------

    /// The surface's own extent wins when the platform dictates one
    fn target_extent(&self, requested: Extent2D) -> Result<Extent2D> {
        let reported = self
            .gpu
            .device()
            .surface_extent(self.surface)
            .context("Failed to query surface extent")?;
        Ok(reported.unwrap_or(requested))
    }

    /// Drain all GPU work and rebuild images, views and framebuffers.
    ///
    /// The render pass handle survives, so pipelines built against it stay
    /// valid. A zero-area extent suspends rendering instead.
    pub fn resize(&mut self, extent: Extent2D) -> Result<()> {
        if self.acquired {
            bail!("Cannot resize the swapchain between new_frame and present");
        }
        if extent.is_zero_area() {
            log::info!("Surface has zero area, suspending rendering");
            self.pending_resize = Some(extent);
            return Ok(());
        }

        log::info!(
            "Rebuilding swapchain: {}x{} -> {}x{}",
            self.extent.width,
            self.extent.height,
            extent.width,
            extent.height
        );

        self.gpu.wait_idle()?;
        let lists = self.teardown_images()?;

        let device = self.gpu.device().clone();
        let old = self.raw;
        let created = device
            .create_swapchain(
                &SwapchainDesc {
                    surface: self.surface,
                    extent,
                    image_count: self.options.image_count,
                    present_mode: self.options.present_mode,
                    format: Some(self.format),
                },
                old,
            )
            .context("Failed to recreate swapchain")?;
        device.destroy_swapchain(old);
        self.raw = RawSwapchain::NULL;

        if created.format != self.format {
            device.destroy_swapchain(created.swapchain);
            return Err(SwapchainError::FormatChanged {
                old: self.format,
                new: created.format,
            }
            .into());
        }

        self.build_images(created, lists)?;
        self.build_slots()?;

        self.pending_resize = None;
        self.rebuild_after_present = false;
        self.current_image = 0;
        self.generation += 1;
        Ok(())
    }

    fn build_images(&mut self, created: SwapchainImages, mut lists: Vec<CommandList>) -> Result<()> {
        let device = self.gpu.device().clone();
        self.raw = created.swapchain;
        self.extent = created.extent;
        self.present_mode = created.present_mode;

        if let Some(format) = self.render_pass.depth_format() {
            let depth = Image::new(
                &self.gpu,
                ImageDesc {
                    extent: created.extent,
                    format,
                    usage: ImageUsage::DEPTH_STENCIL_ATTACHMENT,
                    mip_levels: 1,
                },
            )
            .context("Failed to create depth buffer")?;
            self.depth = Some(depth);
        }
        let depth_view = self.depth.as_ref().map(|d| d.view());

        for raw in created.images {
            let view = device
                .create_image_view(raw, created.format)
                .context("Failed to create swapchain image view")?;

            let mut attachments = vec![view];
            attachments.extend(depth_view);
            let framebuffer = match device.create_framebuffer(&FramebufferDesc {
                render_pass: self.render_pass.raw(),
                attachments,
                extent: created.extent,
            }) {
                Ok(framebuffer) => framebuffer,
                Err(e) => {
                    device.destroy_image_view(view);
                    return Err(e.context("Failed to create framebuffer"));
                }
            };

            let list = match lists.pop() {
                Some(list) => list,
                None => self.gpu.graphics().create_command_list()?,
            };

            self.images.push(PresentableImage {
                raw,
                view,
                framebuffer,
                list,
                fence: 0,
            });
        }

        log::debug!("Built {} swapchain images at {:?}", self.images.len(), self.extent);
        Ok(())
    }

    fn build_slots(&mut self) -> Result<()> {
        let device = self.gpu.device().clone();
        let wanted = self.options.max_frames_in_flight.clamp(1, self.images.len().max(1));

        while self.slots.len() > wanted {
            if let Some(slot) = self.slots.pop() {
                device.destroy_semaphore(slot.image_acquired);
                device.destroy_semaphore(slot.render_finished);
            }
        }
        while self.slots.len() < wanted {
            let image_acquired = device.create_semaphore().context("Failed to create semaphore")?;
            let render_finished = match device.create_semaphore() {
                Ok(semaphore) => semaphore,
                Err(e) => {
                    device.destroy_semaphore(image_acquired);
                    return Err(e.context("Failed to create semaphore"));
                }
            };
            self.slots.push(SyncSlot {
                image_acquired,
                render_finished,
                fence: 0,
            });
        }

        self.frame_index = (self.submit_count % self.slots.len() as u64) as usize;
        Ok(())
    }

    /// Destroy views and framebuffers; caller has drained the GPU
    fn teardown_images(&mut self) -> Result<Vec<CommandList>> {
        let device = self.gpu.device().clone();
        let mut lists = Vec::with_capacity(self.images.len());
        for image in self.images.drain(..) {
            device.destroy_framebuffer(image.framebuffer);
            device.destroy_image_view(image.view);
            let mut list = image.list;
            list.reset()?;
            lists.push(list);
        }
        self.depth = None;
        Ok(lists)
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        log::info!("Destroying swapchain");
        if let Err(e) = self.gpu.wait_idle() {
            log::error!("Failed to drain GPU before destroying swapchain: {:#}", e);
        }

        let device = self.gpu.device().clone();
        if let Err(e) = self.teardown_images() {
            log::error!("Failed to release swapchain images: {:#}", e);
        }
        for slot in self.slots.drain(..) {
            device.destroy_semaphore(slot.image_acquired);
            device.destroy_semaphore(slot.render_finished);
        }
        if !self.raw.is_null() {
            device.destroy_swapchain(self.raw);
        }
        device.destroy_surface(self.surface);
    }
}
