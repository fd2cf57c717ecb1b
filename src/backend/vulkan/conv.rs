// Conversions between backend types and ash types

use ash::vk::{self, Handle};

use crate::backend::types::*;

/// Raw handle <-> Vulkan handle. Zero maps to VK_NULL_HANDLE both ways.
pub(super) trait AsVk: Sized {
    type Vk: Handle;

    fn vk(self) -> Self::Vk;
    fn from_vk(handle: Self::Vk) -> Self;
}

macro_rules! as_vk {
    ($($raw:ident => $vk:ty),* $(,)?) => {
        $(
            impl AsVk for $raw {
                type Vk = $vk;

                fn vk(self) -> $vk {
                    <$vk>::from_raw(self.0)
                }

                fn from_vk(handle: $vk) -> Self {
                    $raw(handle.as_raw())
                }
            }
        )*
    };
}

as_vk! {
    RawCommandList => vk::CommandBuffer,
    RawSemaphore => vk::Semaphore,
    RawSurface => vk::SurfaceKHR,
    RawSwapchain => vk::SwapchainKHR,
    RawImage => vk::Image,
    RawImageView => vk::ImageView,
    RawSampler => vk::Sampler,
    RawBuffer => vk::Buffer,
    RawRenderPass => vk::RenderPass,
    RawFramebuffer => vk::Framebuffer,
    RawShaderModule => vk::ShaderModule,
    RawSetLayout => vk::DescriptorSetLayout,
    RawDescriptorPool => vk::DescriptorPool,
    RawDescriptorSet => vk::DescriptorSet,
    RawPipeline => vk::Pipeline,
    RawPipelineLayout => vk::PipelineLayout,
}

// Mask bit values are Vulkan's, so these are plain reinterpretations

pub(super) fn pipeline_stages(stages: PipelineStages) -> vk::PipelineStageFlags {
    vk::PipelineStageFlags::from_raw(stages.bits())
}

pub(super) fn access(access: AccessFlags) -> vk::AccessFlags {
    vk::AccessFlags::from_raw(access.bits())
}

pub(super) fn shader_stages(stages: ShaderStages) -> vk::ShaderStageFlags {
    vk::ShaderStageFlags::from_raw(stages.bits())
}

pub(super) fn image_usage(usage: ImageUsage) -> vk::ImageUsageFlags {
    vk::ImageUsageFlags::from_raw(usage.bits())
}

pub(super) fn buffer_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    vk::BufferUsageFlags::from_raw(usage.bits())
}

pub(super) fn image_layout(state: ImageState) -> vk::ImageLayout {
    match state {
        ImageState::Undefined => vk::ImageLayout::UNDEFINED,
        ImageState::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        ImageState::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ImageState::ShaderReadOnly => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ImageState::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ImageState::DepthStencilAttachment => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        ImageState::General => vk::ImageLayout::GENERAL,
    }
}

pub(super) fn format(format: ImageFormat) -> vk::Format {
    match format {
        ImageFormat::Undefined => vk::Format::UNDEFINED,
        ImageFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        ImageFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        ImageFormat::Rgb8Unorm => vk::Format::R8G8B8_UNORM,
        ImageFormat::Bgr8Unorm => vk::Format::B8G8R8_UNORM,
        ImageFormat::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
        ImageFormat::Bgra8Srgb => vk::Format::B8G8R8A8_SRGB,
        ImageFormat::R8Unorm => vk::Format::R8_UNORM,
        ImageFormat::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        ImageFormat::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        ImageFormat::Depth32Float => vk::Format::D32_SFLOAT,
    }
}

/// `None` for formats the core has no name for
pub(super) fn image_format(format: vk::Format) -> Option<ImageFormat> {
    Some(match format {
        vk::Format::R8G8B8A8_UNORM => ImageFormat::Rgba8Unorm,
        vk::Format::B8G8R8A8_UNORM => ImageFormat::Bgra8Unorm,
        vk::Format::R8G8B8_UNORM => ImageFormat::Rgb8Unorm,
        vk::Format::B8G8R8_UNORM => ImageFormat::Bgr8Unorm,
        vk::Format::R8G8B8A8_SRGB => ImageFormat::Rgba8Srgb,
        vk::Format::B8G8R8A8_SRGB => ImageFormat::Bgra8Srgb,
        vk::Format::R8_UNORM => ImageFormat::R8Unorm,
        vk::Format::R16G16B16A16_SFLOAT => ImageFormat::Rgba16Float,
        vk::Format::R32G32B32A32_SFLOAT => ImageFormat::Rgba32Float,
        vk::Format::D32_SFLOAT => ImageFormat::Depth32Float,
        _ => return None,
    })
}

pub(super) fn present_mode(mode: PresentMode) -> vk::PresentModeKHR {
    match mode {
        PresentMode::Immediate => vk::PresentModeKHR::IMMEDIATE,
        PresentMode::Mailbox => vk::PresentModeKHR::MAILBOX,
        PresentMode::Fifo => vk::PresentModeKHR::FIFO,
        PresentMode::FifoRelaxed => vk::PresentModeKHR::FIFO_RELAXED,
    }
}

pub(super) fn from_present_mode(mode: vk::PresentModeKHR) -> PresentMode {
    match mode {
        vk::PresentModeKHR::IMMEDIATE => PresentMode::Immediate,
        vk::PresentModeKHR::MAILBOX => PresentMode::Mailbox,
        vk::PresentModeKHR::FIFO_RELAXED => PresentMode::FifoRelaxed,
        _ => PresentMode::Fifo,
    }
}

pub(super) fn descriptor_type(kind: DescriptorKind) -> vk::DescriptorType {
    match kind {
        DescriptorKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        DescriptorKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        DescriptorKind::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
        DescriptorKind::Sampler => vk::DescriptorType::SAMPLER,
        DescriptorKind::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        DescriptorKind::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
    }
}

pub(super) fn vertex_format(format: VertexFormat) -> vk::Format {
    match format {
        VertexFormat::Float1 => vk::Format::R32_SFLOAT,
        VertexFormat::Float2 => vk::Format::R32G32_SFLOAT,
        VertexFormat::Float3 => vk::Format::R32G32B32_SFLOAT,
        VertexFormat::Float4 => vk::Format::R32G32B32A32_SFLOAT,
        VertexFormat::Int1 => vk::Format::R32_SINT,
        VertexFormat::Int2 => vk::Format::R32G32_SINT,
        VertexFormat::Int3 => vk::Format::R32G32B32_SINT,
        VertexFormat::Int4 => vk::Format::R32G32B32A32_SINT,
        VertexFormat::Uint1 | VertexFormat::Bool1 => vk::Format::R32_UINT,
        VertexFormat::Uint2 => vk::Format::R32G32_UINT,
        VertexFormat::Uint3 => vk::Format::R32G32B32_UINT,
        VertexFormat::Uint4 => vk::Format::R32G32B32A32_UINT,
    }
}

pub(super) fn cull_mode(mode: CullMode) -> vk::CullModeFlags {
    match mode {
        CullMode::None => vk::CullModeFlags::NONE,
        CullMode::Front => vk::CullModeFlags::FRONT,
        CullMode::Back => vk::CullModeFlags::BACK,
    }
}

pub(super) fn extent(extent: Extent2D) -> vk::Extent2D {
    vk::Extent2D {
        width: extent.width,
        height: extent.height,
    }
}

pub(super) fn aspect(depth: bool) -> vk::ImageAspectFlags {
    if depth {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_keep_vulkan_bit_values() {
        assert_eq!(
            pipeline_stages(PipelineStages::COLOR_ATTACHMENT_OUTPUT | PipelineStages::TRANSFER),
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::TRANSFER
        );
        assert_eq!(
            access(AccessFlags::SHADER_READ | AccessFlags::TRANSFER_WRITE),
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::TRANSFER_WRITE
        );
        assert_eq!(
            shader_stages(ShaderStages::VERTEX | ShaderStages::FRAGMENT),
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
        assert_eq!(
            image_usage(ImageUsage::SAMPLED | ImageUsage::DEPTH_STENCIL_ATTACHMENT),
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
        );
        assert_eq!(
            buffer_usage(BufferUsage::UNIFORM | BufferUsage::INDEX),
            vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::INDEX_BUFFER
        );
    }

    #[test]
    fn known_formats_map_back() {
        for f in [
            ImageFormat::Rgba8Unorm,
            ImageFormat::Bgra8Unorm,
            ImageFormat::Bgra8Srgb,
            ImageFormat::Depth32Float,
        ] {
            assert_eq!(image_format(format(f)), Some(f));
        }
        assert_eq!(image_format(vk::Format::A2B10G10R10_UNORM_PACK32), None);
    }

    #[test]
    fn null_handles_stay_null() {
        assert_eq!(RawImage::NULL.vk(), vk::Image::null());
        assert!(RawSwapchain::from_vk(vk::SwapchainKHR::null()).is_null());
    }
}
