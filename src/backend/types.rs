// Backend types - API-neutral handles, masks and descriptions
//
// Everything the core hands to a GpuDevice is expressed with these types.
// Handles are opaque u64 values (zero is null); mask bit values match Vulkan
// so the Vulkan backend converts them with `from_raw`.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Monotonic completion value on a queue timeline
pub type FenceValue = u64;

macro_rules! raw_handles {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
            pub struct $name(pub u64);

            impl $name {
                pub const NULL: Self = Self(0);

                pub fn is_null(self) -> bool {
                    self.0 == 0
                }
            }
        )*
    };
}

raw_handles! {
    /// A recording target owned by one queue
    RawCommandList,
    /// Binary GPU-GPU signal (acquire -> render -> present)
    RawSemaphore,
    RawSurface,
    RawSwapchain,
    RawImage,
    RawImageView,
    RawSampler,
    RawBuffer,
    RawRenderPass,
    RawFramebuffer,
    RawShaderModule,
    RawSetLayout,
    RawDescriptorPool,
    RawDescriptorSet,
    RawPipeline,
    RawPipelineLayout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Graphics,
    Transfer,
}

impl QueueKind {
    pub const ALL: [QueueKind; 2] = [QueueKind::Graphics, QueueKind::Transfer];

    pub fn index(self) -> usize {
        match self {
            QueueKind::Graphics => 0,
            QueueKind::Transfer => 1,
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct PipelineStages: u32 {
        const TOP_OF_PIPE             = 0x0000_0001;
        const VERTEX_INPUT            = 0x0000_0004;
        const VERTEX_SHADER           = 0x0000_0008;
        const FRAGMENT_SHADER         = 0x0000_0080;
        const EARLY_FRAGMENT_TESTS    = 0x0000_0100;
        const LATE_FRAGMENT_TESTS     = 0x0000_0200;
        const COLOR_ATTACHMENT_OUTPUT = 0x0000_0400;
        const TRANSFER                = 0x0000_1000;
        const BOTTOM_OF_PIPE          = 0x0000_2000;
        const ALL_GRAPHICS            = 0x0000_8000;
        const ALL_COMMANDS            = 0x0001_0000;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct AccessFlags: u32 {
        const SHADER_READ                    = 0x0000_0020;
        const SHADER_WRITE                   = 0x0000_0040;
        const COLOR_ATTACHMENT_READ          = 0x0000_0080;
        const COLOR_ATTACHMENT_WRITE         = 0x0000_0100;
        const DEPTH_STENCIL_ATTACHMENT_READ  = 0x0000_0200;
        const DEPTH_STENCIL_ATTACHMENT_WRITE = 0x0000_0400;
        const TRANSFER_READ                  = 0x0000_0800;
        const TRANSFER_WRITE                 = 0x0000_1000;
        const MEMORY_READ                    = 0x0000_8000;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct ShaderStages: u32 {
        const VERTEX   = 0x0000_0001;
        const FRAGMENT = 0x0000_0010;
        const ALL_GRAPHICS = 0x0000_001F;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct ImageUsage: u32 {
        const TRANSFER_SRC             = 0x0000_0001;
        const TRANSFER_DST             = 0x0000_0002;
        const SAMPLED                  = 0x0000_0004;
        const STORAGE                  = 0x0000_0008;
        const COLOR_ATTACHMENT         = 0x0000_0010;
        const DEPTH_STENCIL_ATTACHMENT = 0x0000_0020;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct BufferUsage: u32 {
        const TRANSFER_SRC = 0x0000_0001;
        const TRANSFER_DST = 0x0000_0002;
        const UNIFORM      = 0x0000_0010;
        const STORAGE      = 0x0000_0020;
        const INDEX        = 0x0000_0040;
        const VERTEX       = 0x0000_0080;
    }
}

/// Access state of an image; each maps to one Vulkan image layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageState {
    Undefined,
    TransferSrc,
    TransferDst,
    ShaderReadOnly,
    ColorAttachment,
    DepthStencilAttachment,
    General,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageFormat {
    Undefined,
    Rgba8Unorm,
    Bgra8Unorm,
    Rgb8Unorm,
    Bgr8Unorm,
    Rgba8Srgb,
    Bgra8Srgb,
    R8Unorm,
    Rgba16Float,
    Rgba32Float,
    Depth32Float,
}

impl ImageFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            ImageFormat::Undefined => 0,
            ImageFormat::R8Unorm => 1,
            ImageFormat::Rgb8Unorm | ImageFormat::Bgr8Unorm => 3,
            ImageFormat::Rgba8Unorm
            | ImageFormat::Bgra8Unorm
            | ImageFormat::Rgba8Srgb
            | ImageFormat::Bgra8Srgb
            | ImageFormat::Depth32Float => 4,
            ImageFormat::Rgba16Float => 8,
            ImageFormat::Rgba32Float => 16,
        }
    }

    pub fn is_depth(self) -> bool {
        matches!(self, ImageFormat::Depth32Float)
    }
}

/// Vertex attribute element types a shader can declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VertexFormat {
    Float1,
    Float2,
    Float3,
    Float4,
    Int1,
    Int2,
    Int3,
    Int4,
    Uint1,
    Uint2,
    Uint3,
    Uint4,
    Bool1,
}

impl VertexFormat {
    pub fn size(self) -> u32 {
        match self {
            VertexFormat::Float1 | VertexFormat::Int1 | VertexFormat::Uint1 | VertexFormat::Bool1 => 4,
            VertexFormat::Float2 | VertexFormat::Int2 | VertexFormat::Uint2 => 8,
            VertexFormat::Float3 | VertexFormat::Int3 | VertexFormat::Uint3 => 12,
            VertexFormat::Float4 | VertexFormat::Int4 | VertexFormat::Uint4 => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresentMode {
    Immediate,
    Mailbox,
    Fifo,
    FifoRelaxed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent2D {
    pub width: u32,
    pub height: u32,
}

impl Extent2D {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_zero_area(self) -> bool {
        self.width == 0 || self.height == 0
    }
}

// ---------------------------------------------------------------------------
// Descriptions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ImageDesc {
    pub extent: Extent2D,
    pub format: ImageFormat,
    pub usage: ImageUsage,
    pub mip_levels: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct SamplerDesc {
    pub linear: bool,
    pub repeat: bool,
    /// Zero disables anisotropic filtering
    pub max_anisotropy: f32,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            linear: true,
            repeat: true,
            max_anisotropy: 16.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: BufferUsage,
}

/// Where a swapchain is going to present
#[derive(Debug, Clone, Copy)]
pub enum SurfaceTarget {
    Native {
        display: raw_window_handle::RawDisplayHandle,
        window: raw_window_handle::RawWindowHandle,
    },
    Headless,
}

#[derive(Debug, Clone, Copy)]
pub struct SwapchainDesc {
    pub surface: RawSurface,
    pub extent: Extent2D,
    pub image_count: u32,
    pub present_mode: PresentMode,
    /// Format to keep across re-creation; `None` lets the device choose
    pub format: Option<ImageFormat>,
}

#[derive(Debug, Clone)]
pub struct SwapchainImages {
    pub swapchain: RawSwapchain,
    pub images: Vec<RawImage>,
    pub format: ImageFormat,
    pub extent: Extent2D,
    pub present_mode: PresentMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireResult {
    Acquired { index: u32, suboptimal: bool },
    OutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentResult {
    Presented,
    Suboptimal,
    OutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentDesc {
    pub format: ImageFormat,
    pub clear: bool,
    /// State the attachment is in before and after the pass. Ignored for
    /// presented color attachments, which start undefined.
    pub state: ImageState,
}

impl AttachmentDesc {
    pub fn color(format: ImageFormat, clear: bool) -> Self {
        Self {
            format,
            clear,
            state: ImageState::ColorAttachment,
        }
    }

    pub fn depth(format: ImageFormat, clear: bool) -> Self {
        Self {
            format,
            clear,
            state: ImageState::DepthStencilAttachment,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderPassDesc {
    /// Framebuffer attachments come in this order, depth last
    pub colors: Vec<AttachmentDesc>,
    pub depth: Option<AttachmentDesc>,
    /// Color attachment is handed to the presentation engine after the pass
    pub present: bool,
}

#[derive(Debug, Clone)]
pub struct FramebufferDesc {
    pub render_pass: RawRenderPass,
    pub attachments: Vec<RawImageView>,
    pub extent: Extent2D,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    UniformBuffer,
    StorageBuffer,
    SampledImage,
    Sampler,
    CombinedImageSampler,
    StorageImage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetLayoutBinding {
    pub binding: u32,
    pub kind: DescriptorKind,
    pub count: u32,
    pub stages: ShaderStages,
}

#[derive(Debug, Clone, Copy)]
pub struct DescriptorPoolDesc {
    pub max_sets: u32,
    pub uniform_buffers: u32,
    pub storage_buffers: u32,
    pub sampled_images: u32,
    pub samplers: u32,
    pub combined_image_samplers: u32,
    pub storage_images: u32,
}

/// One descriptor write; `slot` is the array element within the binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorWrite {
    pub set: RawDescriptorSet,
    pub binding: u32,
    pub slot: u32,
    pub resource: DescriptorResource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorResource {
    Buffer {
        kind: DescriptorKind,
        buffer: RawBuffer,
        offset: u64,
        range: u64,
    },
    Image {
        kind: DescriptorKind,
        view: RawImageView,
        sampler: RawSampler,
        state: ImageState,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PushConstantRange {
    pub stages: ShaderStages,
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CullMode {
    None,
    Front,
    #[default]
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: VertexFormat,
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexLayout {
    pub stride: u32,
    pub attributes: Vec<VertexAttribute>,
}

#[derive(Debug, Clone)]
pub struct ShaderStageModule {
    pub stage: ShaderStages,
    pub module: RawShaderModule,
    pub entry_point: String,
}

#[derive(Debug, Clone)]
pub struct GraphicsPipelineDesc {
    pub layout: RawPipelineLayout,
    pub render_pass: RawRenderPass,
    pub stages: Vec<ShaderStageModule>,
    pub vertex_layout: Option<VertexLayout>,
    pub cull_mode: CullMode,
    pub wireframe: bool,
    pub blend: BlendMode,
    pub depth_test: bool,
    /// Number of color attachments in the render pass
    pub color_attachments: u32,
}

/// Fixed-function blending applied to every color attachment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlendMode {
    #[default]
    None,
    /// Source replaces destination
    OneZero,
    /// Classic alpha blending
    SrcAlphaOneMinusSrcAlpha,
    /// Multiplies the destination by the source color
    ZeroSrcColor,
}

// ---------------------------------------------------------------------------
// Submission and recording
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct Submission {
    pub list: RawCommandList,
    pub wait: Option<(RawSemaphore, PipelineStages)>,
    pub signal: Option<RawSemaphore>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageBarrier {
    pub image: RawImage,
    pub old_state: ImageState,
    pub new_state: ImageState,
    pub src_stages: PipelineStages,
    pub src_access: AccessFlags,
    pub dst_stages: PipelineStages,
    pub dst_access: AccessFlags,
    pub depth: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// One recorded GPU instruction
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command<'a> {
    Barrier(ImageBarrier),
    BeginRenderPass {
        render_pass: RawRenderPass,
        framebuffer: RawFramebuffer,
        extent: Extent2D,
        clear_color: [f32; 4],
    },
    EndRenderPass,
    BindPipeline(RawPipeline),
    BindDescriptorSets {
        layout: RawPipelineLayout,
        first_set: u32,
        sets: &'a [RawDescriptorSet],
    },
    PushConstants {
        layout: RawPipelineLayout,
        stages: ShaderStages,
        offset: u32,
        data: &'a [u8],
    },
    SetViewport(Viewport),
    SetScissor(Extent2D),
    BindVertexBuffer {
        buffer: RawBuffer,
        offset: u64,
    },
    BindIndexBuffer {
        buffer: RawBuffer,
        offset: u64,
    },
    Draw {
        vertices: u32,
        instances: u32,
    },
    DrawIndexed {
        indices: u32,
        instances: u32,
    },
    CopyBufferToImage {
        buffer: RawBuffer,
        image: RawImage,
        extent: Extent2D,
    },
    /// Image must be in [`ImageState::TransferSrc`]
    CopyImageToBuffer {
        image: RawImage,
        buffer: RawBuffer,
        extent: Extent2D,
    },
}
