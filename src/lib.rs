// render-core - GPU submission, synchronization and binding
//
// Leaves first:
//   handle     deferred destruction of GPU objects
//   queue      command lists stamped with timeline fence values
//   image      layout tracking and barriers (texture, buffer build on it)
//   swapchain  acquire -> render -> present with N images and M sync slots
//   framebuffer offscreen color targets that later passes sample
//   pipeline   reflection-driven layouts and per-image descriptor sets
//   context    explicit owner of the device, queues, shaders and pipelines

pub mod backend;
pub mod buffer;
pub mod config;
pub mod context;
pub mod error;
pub mod framebuffer;
pub mod handle;
pub mod image;
pub mod pipeline;
pub mod queue;
pub mod render_pass;
pub mod shader;
pub mod swapchain;
pub mod texture;

pub use backend::{GpuDevice, HeadlessDevice};
pub use buffer::{Buffer, IndexBuffer, StorageBuffer, UniformBuffer, VertexBuffer};
pub use config::RendererConfig;
pub use context::{GpuContext, RendererContext};
pub use error::{BindingError, FramebufferError, LayoutError, QueueError, SwapchainError};
pub use framebuffer::{Framebuffer, FramebufferAttachment, FramebufferSpec};
pub use handle::{DeferredDestroyer, ResourceHandle};
pub use image::Image;
pub use pipeline::{Pipeline, PipelineDesc};
pub use queue::{CommandList, Queue};
pub use render_pass::RenderPass;
pub use shader::{Shader, ShaderLibrary};
pub use swapchain::{HeadlessWindow, Swapchain, SwapchainOptions, WindowSurface};
pub use texture::Texture;
