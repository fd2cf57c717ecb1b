// Offscreen render targets
//
// A Framebuffer owns its color images and the render pass that writes them.
// Between passes each attachment rests in one state: color attachment, or
// general when the caller asked for extra usage such as sampling. Passes
// start and end in that state, so a finished attachment can be handed to a
// Texture or read back without further bookkeeping.
//
// `resize` swaps in new images at the new extent but keeps the render pass,
// so pipelines built for the framebuffer stay valid.

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::backend::{
    AttachmentDesc, BlendMode, Extent2D, FramebufferDesc, ImageDesc, ImageFormat, ImageState, ImageUsage,
    RawFramebuffer, RenderPassDesc,
};
use crate::context::GpuContext;
use crate::error::FramebufferError;
use crate::handle::{ResourceHandle, RetiredObject};
use crate::image::Image;
use crate::queue::CommandList;
use crate::render_pass::RenderPass;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferAttachment {
    pub format: ImageFormat,
    /// Usage on top of color attachment and transfer source
    pub additional_usage: ImageUsage,
}

impl FramebufferAttachment {
    pub fn color(format: ImageFormat) -> Self {
        Self {
            format,
            additional_usage: ImageUsage::empty(),
        }
    }

    /// Color target later passes can sample
    pub fn sampled(format: ImageFormat) -> Self {
        Self {
            format,
            additional_usage: ImageUsage::SAMPLED,
        }
    }

    fn usage(&self) -> ImageUsage {
        ImageUsage::COLOR_ATTACHMENT | ImageUsage::TRANSFER_SRC | self.additional_usage
    }

    /// State the attachment rests in between passes
    pub fn resting_state(&self) -> ImageState {
        if self.additional_usage.is_empty() {
            ImageState::ColorAttachment
        } else {
            ImageState::General
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramebufferSpec {
    pub extent: Extent2D,
    /// Clear every attachment when a pass begins instead of loading it
    pub clear_on_load: bool,
    pub attachments: Vec<FramebufferAttachment>,
    /// Blending pipelines built for this framebuffer use
    pub blend: BlendMode,
}

impl FramebufferSpec {
    pub fn new(extent: Extent2D, attachments: Vec<FramebufferAttachment>) -> Self {
        Self {
            extent,
            clear_on_load: true,
            attachments,
            blend: BlendMode::None,
        }
    }
}

pub struct Framebuffer {
    gpu: Arc<GpuContext>,
    spec: FramebufferSpec,
    render_pass: ResourceHandle<RenderPass>,
    attachments: Vec<ResourceHandle<Image>>,
    raw: RawFramebuffer,
}

impl std::fmt::Debug for Framebuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framebuffer")
            .field("raw", &self.raw)
            .field("extent", &self.spec.extent)
            .field("attachments", &self.attachments.len())
            .finish()
    }
}

impl Framebuffer {
    pub fn new(gpu: &Arc<GpuContext>, spec: FramebufferSpec) -> Result<Framebuffer> {
        check_extent(spec.extent)?;
        if spec.attachments.is_empty() {
            return Err(FramebufferError::NoAttachments.into());
        }
        if let Some((index, attachment)) = spec
            .attachments
            .iter()
            .enumerate()
            .find(|(_, a)| a.format.is_depth())
        {
            return Err(FramebufferError::DepthAttachment {
                index,
                format: attachment.format,
            }
            .into());
        }

        let render_pass = RenderPass::new(
            gpu,
            RenderPassDesc {
                colors: spec
                    .attachments
                    .iter()
                    .map(|a| AttachmentDesc {
                        format: a.format,
                        clear: spec.clear_on_load,
                        state: a.resting_state(),
                    })
                    .collect(),
                depth: None,
                present: false,
            },
        )?;

        let (attachments, raw) = build_targets(gpu, &render_pass, &spec, spec.extent)?;
        log::info!(
            "Created framebuffer {}x{} with {} attachments",
            spec.extent.width,
            spec.extent.height,
            attachments.len()
        );

        Ok(Framebuffer {
            gpu: gpu.clone(),
            spec,
            render_pass,
            attachments,
            raw,
        })
    }

    pub fn spec(&self) -> &FramebufferSpec {
        &self.spec
    }

    pub fn extent(&self) -> Extent2D {
        self.spec.extent
    }

    pub fn blend(&self) -> BlendMode {
        self.spec.blend
    }

    pub fn render_pass(&self) -> &ResourceHandle<RenderPass> {
        &self.render_pass
    }

    pub fn raw(&self) -> RawFramebuffer {
        self.raw
    }

    pub fn attachment_count(&self) -> usize {
        self.attachments.len()
    }

    /// Image behind color attachment `index`; replaced by `resize`
    pub fn attachment(&self, index: usize) -> Result<&ResourceHandle<Image>> {
        self.attachments.get(index).ok_or_else(|| {
            FramebufferError::AttachmentOutOfRange {
                index,
                count: self.attachments.len(),
            }
            .into()
        })
    }

    /// Record the start of a pass into `list`. Attachments moved out of
    /// their resting state since the last pass are moved back first.
    pub fn begin(&self, list: &mut CommandList, clear_color: [f32; 4]) -> Result<()> {
        for (image, attachment) in self.attachments.iter().zip(&self.spec.attachments) {
            let resting = attachment.resting_state();
            if image.state() != resting {
                image.set_layout(resting, Some(list))?;
            }
        }
        list.begin_render_pass(self.render_pass.raw(), self.raw, self.spec.extent, clear_color)?;
        list.set_viewport_and_scissor(self.spec.extent)
    }

    pub fn end(&self, list: &mut CommandList) -> Result<()> {
        list.end_render_pass()
    }

    /// Rebuild every attachment at `extent`. Old images stay alive until
    /// the GPU is done with them and until nothing else holds them.
    pub fn resize(&mut self, extent: Extent2D) -> Result<()> {
        check_extent(extent)?;
        if extent == self.spec.extent {
            return Ok(());
        }

        let (attachments, raw) = build_targets(&self.gpu, &self.render_pass, &self.spec, extent)?;
        self.gpu.destroyer().retire(vec![RetiredObject::Framebuffer(self.raw)]);
        self.attachments = attachments;
        self.raw = raw;
        self.spec.extent = extent;
        log::debug!("Framebuffer resized to {}x{}", extent.width, extent.height);
        Ok(())
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        self.gpu.destroyer().retire(vec![RetiredObject::Framebuffer(self.raw)]);
    }
}

fn check_extent(extent: Extent2D) -> Result<()> {
    if extent.is_zero_area() {
        return Err(FramebufferError::ZeroExtent {
            width: extent.width,
            height: extent.height,
        }
        .into());
    }
    Ok(())
}

/// Images in their resting states plus the framebuffer object binding them
fn build_targets(
    gpu: &Arc<GpuContext>,
    render_pass: &RenderPass,
    spec: &FramebufferSpec,
    extent: Extent2D,
) -> Result<(Vec<ResourceHandle<Image>>, RawFramebuffer)> {
    let mut images = Vec::with_capacity(spec.attachments.len());
    for attachment in &spec.attachments {
        let image = Image::new(
            gpu,
            ImageDesc {
                extent,
                format: attachment.format,
                usage: attachment.usage(),
                mip_levels: 1,
            },
        )?;
        image.set_layout(attachment.resting_state(), None)?;
        images.push(image);
    }

    let raw = gpu
        .device()
        .create_framebuffer(&FramebufferDesc {
            render_pass: render_pass.raw(),
            attachments: images.iter().map(|i| i.view()).collect(),
            extent,
        })
        .context("Failed to create offscreen framebuffer")?;
    Ok((images, raw))
}
