// Render target contract
//
// A RenderPass describes the attachments a pipeline renders into. The
// swapchain owns one for its images and keeps the same handle across
// resize, so pipelines built against it never need to be re-pointed.
// Offscreen framebuffers own one for their color targets in the same way.

use anyhow::{bail, Context, Result};
use std::sync::Arc;

use crate::backend::{AttachmentDesc, ImageFormat, RawRenderPass, RenderPassDesc};
use crate::context::GpuContext;
use crate::handle::{GpuResource, ResourceHandle, RetiredObject};

#[derive(Debug)]
pub struct RenderPass {
    raw: RawRenderPass,
    desc: RenderPassDesc,
}

impl RenderPass {
    pub fn new(gpu: &Arc<GpuContext>, desc: RenderPassDesc) -> Result<ResourceHandle<RenderPass>> {
        if desc.colors.is_empty() {
            bail!("Render pass needs at least one color attachment");
        }
        let raw = gpu
            .device()
            .create_render_pass(&desc)
            .context("Failed to create render pass")?;
        log::debug!("Created render pass {:?}: {:?}", raw, desc);
        Ok(ResourceHandle::new(gpu.destroyer().clone(), RenderPass { raw, desc }))
    }

    /// Clear-and-present color target with a cleared depth buffer
    pub fn for_presentation(
        gpu: &Arc<GpuContext>,
        color: ImageFormat,
        depth: Option<ImageFormat>,
    ) -> Result<ResourceHandle<RenderPass>> {
        Self::new(
            gpu,
            RenderPassDesc {
                colors: vec![AttachmentDesc::color(color, true)],
                depth: depth.map(|format| AttachmentDesc::depth(format, true)),
                present: true,
            },
        )
    }

    pub fn raw(&self) -> RawRenderPass {
        self.raw
    }

    pub fn desc(&self) -> &RenderPassDesc {
        &self.desc
    }

    /// Format of the first color attachment
    pub fn color_format(&self) -> ImageFormat {
        self.desc
            .colors
            .first()
            .map(|c| c.format)
            .unwrap_or(ImageFormat::Undefined)
    }

    pub fn color_count(&self) -> usize {
        self.desc.colors.len()
    }

    pub fn depth_format(&self) -> Option<ImageFormat> {
        self.desc.depth.map(|d| d.format)
    }
}

impl GpuResource for RenderPass {
    fn release(&mut self) -> Vec<RetiredObject> {
        vec![RetiredObject::RenderPass(self.raw)]
    }
}
