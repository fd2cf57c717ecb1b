// Backend module - one device interface, two implementations
//
// The core (queues, swapchain, layout tracker, binder) only talks to
// `dyn GpuDevice`. The concrete device is picked at startup from the
// configuration: Vulkan for real windows, headless for tests and tools.

pub mod headless;
pub mod types;
pub mod vulkan;

use anyhow::Result;
use std::sync::Arc;

use crate::config::{BackendKind, RendererConfig};
pub use headless::HeadlessDevice;
pub use types::*;
pub use vulkan::VulkanDevice;

/// Everything the submission/synchronization/binding core needs from a GPU.
///
/// All methods take `&self`; implementations synchronize internally so the
/// device can be shared as `Arc<dyn GpuDevice>`. Out-of-date and suboptimal
/// surfaces are reported through `AcquireResult`/`PresentResult`; every other
/// failure is an `Err` and is treated as fatal by callers.
pub trait GpuDevice: Send + Sync {
    fn name(&self) -> &str;

    // -- queue timelines ----------------------------------------------------

    /// Submit a recorded list and return the fence value that marks its completion
    fn submit(&self, queue: QueueKind, submission: &Submission) -> Result<FenceValue>;
    /// Highest fence value the GPU has finished on this queue
    fn completed_value(&self, queue: QueueKind) -> Result<FenceValue>;
    /// Block the calling thread until `value` is complete on `queue`
    fn wait_for_value(&self, queue: QueueKind, value: FenceValue) -> Result<()>;
    fn wait_idle(&self) -> Result<()>;

    // -- command lists ------------------------------------------------------

    fn allocate_command_list(&self, queue: QueueKind) -> Result<RawCommandList>;
    fn free_command_list(&self, queue: QueueKind, list: RawCommandList);
    fn reset_command_list(&self, list: RawCommandList) -> Result<()>;
    fn begin_command_list(&self, list: RawCommandList) -> Result<()>;
    fn end_command_list(&self, list: RawCommandList) -> Result<()>;
    fn record(&self, list: RawCommandList, command: &Command<'_>) -> Result<()>;

    // -- binary semaphores --------------------------------------------------

    fn create_semaphore(&self) -> Result<RawSemaphore>;
    fn destroy_semaphore(&self, semaphore: RawSemaphore);

    // -- presentation -------------------------------------------------------

    fn create_surface(&self, target: SurfaceTarget) -> Result<RawSurface>;
    fn destroy_surface(&self, surface: RawSurface);
    /// Current extent reported by the surface, if the platform dictates one
    fn surface_extent(&self, surface: RawSurface) -> Result<Option<Extent2D>>;
    fn create_swapchain(&self, desc: &SwapchainDesc, old: RawSwapchain) -> Result<SwapchainImages>;
    fn destroy_swapchain(&self, swapchain: RawSwapchain);
    fn acquire_next_image(&self, swapchain: RawSwapchain, signal: RawSemaphore) -> Result<AcquireResult>;
    fn present(
        &self,
        queue: QueueKind,
        swapchain: RawSwapchain,
        image_index: u32,
        wait: RawSemaphore,
    ) -> Result<PresentResult>;

    // -- images and buffers -------------------------------------------------

    fn create_image(&self, desc: &ImageDesc) -> Result<RawImage>;
    fn destroy_image(&self, image: RawImage);
    fn create_image_view(&self, image: RawImage, format: ImageFormat) -> Result<RawImageView>;
    fn destroy_image_view(&self, view: RawImageView);
    fn create_sampler(&self, desc: &SamplerDesc) -> Result<RawSampler>;
    fn destroy_sampler(&self, sampler: RawSampler);
    /// Buffers are host visible; `write_buffer` copies through the mapping
    fn create_buffer(&self, desc: &BufferDesc) -> Result<RawBuffer>;
    fn write_buffer(&self, buffer: RawBuffer, offset: u64, data: &[u8]) -> Result<()>;
    /// Fills `out` from host-visible buffer memory starting at `offset`
    fn read_buffer(&self, buffer: RawBuffer, offset: u64, out: &mut [u8]) -> Result<()>;
    fn destroy_buffer(&self, buffer: RawBuffer);

    // -- render targets -----------------------------------------------------

    fn create_render_pass(&self, desc: &RenderPassDesc) -> Result<RawRenderPass>;
    fn destroy_render_pass(&self, render_pass: RawRenderPass);
    fn create_framebuffer(&self, desc: &FramebufferDesc) -> Result<RawFramebuffer>;
    fn destroy_framebuffer(&self, framebuffer: RawFramebuffer);

    // -- shaders, descriptors, pipelines ------------------------------------

    fn create_shader_module(&self, words: &[u32]) -> Result<RawShaderModule>;
    fn destroy_shader_module(&self, module: RawShaderModule);
    fn create_descriptor_pool(&self, desc: &DescriptorPoolDesc) -> Result<RawDescriptorPool>;
    fn destroy_descriptor_pool(&self, pool: RawDescriptorPool);
    fn create_set_layout(&self, bindings: &[SetLayoutBinding]) -> Result<RawSetLayout>;
    fn destroy_set_layout(&self, layout: RawSetLayout);
    fn allocate_descriptor_sets(
        &self,
        pool: RawDescriptorPool,
        layouts: &[RawSetLayout],
    ) -> Result<Vec<RawDescriptorSet>>;
    fn free_descriptor_sets(&self, pool: RawDescriptorPool, sets: &[RawDescriptorSet]) -> Result<()>;
    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) -> Result<()>;
    fn create_pipeline_layout(
        &self,
        set_layouts: &[RawSetLayout],
        push_constants: &[PushConstantRange],
    ) -> Result<RawPipelineLayout>;
    fn destroy_pipeline_layout(&self, layout: RawPipelineLayout);
    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc) -> Result<RawPipeline>;
    fn destroy_pipeline(&self, pipeline: RawPipeline);
}

/// Create the device selected by `config.graphics.backend`
pub fn create_device(config: &RendererConfig) -> Result<Arc<dyn GpuDevice>> {
    match config.graphics.backend {
        BackendKind::Vulkan => {
            let enable_validation = cfg!(debug_assertions) && config.debug.validation_layers;
            let device: Arc<dyn GpuDevice> = VulkanDevice::new(&config.window.title, enable_validation)?;
            Ok(device)
        }
        BackendKind::Headless => {
            let device: Arc<dyn GpuDevice> = Arc::new(HeadlessDevice::new());
            Ok(device)
        }
    }
}
