// Image layout tracker
//
// An Image remembers the state it was last transitioned to and builds the
// barrier from that state to the next one. Views that cache descriptor
// information about the image (textures) register as observers and are
// told about every transition. The Image never owns its observers.

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

use crate::backend::{
    AccessFlags, BufferDesc, BufferUsage, Extent2D, ImageBarrier, ImageDesc, ImageFormat, ImageState,
    ImageUsage, PipelineStages, RawImage, RawImageView,
};
use crate::context::GpuContext;
use crate::handle::{GpuResource, ResourceHandle, RetiredObject};
use crate::queue::CommandList;

/// Pipeline stages and access mask that bracket each state
pub fn stage_and_access(state: ImageState) -> (PipelineStages, AccessFlags) {
    match state {
        ImageState::Undefined => (PipelineStages::TOP_OF_PIPE, AccessFlags::empty()),
        ImageState::TransferSrc => (PipelineStages::TRANSFER, AccessFlags::TRANSFER_READ),
        ImageState::TransferDst => (PipelineStages::TRANSFER, AccessFlags::TRANSFER_WRITE),
        ImageState::ShaderReadOnly => (PipelineStages::FRAGMENT_SHADER, AccessFlags::SHADER_READ),
        ImageState::General => (
            PipelineStages::ALL_GRAPHICS | PipelineStages::ALL_COMMANDS,
            AccessFlags::SHADER_READ | AccessFlags::SHADER_WRITE,
        ),
        ImageState::DepthStencilAttachment => (
            PipelineStages::ALL_GRAPHICS,
            AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
                | AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | AccessFlags::SHADER_READ,
        ),
        ImageState::ColorAttachment => (
            PipelineStages::ALL_GRAPHICS,
            AccessFlags::COLOR_ATTACHMENT_WRITE | AccessFlags::SHADER_READ,
        ),
    }
}

/// Something that caches information about an image's current state
pub trait LayoutObserver: Send + Sync {
    fn on_layout_transition(&self, image: &Image, old: ImageState, new: ImageState);
}

pub struct Image {
    gpu: Arc<GpuContext>,
    raw: RawImage,
    view: RawImageView,
    desc: ImageDesc,
    state: Mutex<ImageState>,
    dependents: Mutex<Vec<Weak<dyn LayoutObserver>>>,
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("raw", &self.raw)
            .field("extent", &self.desc.extent)
            .field("format", &self.desc.format)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl Image {
    pub fn new(gpu: &Arc<GpuContext>, desc: ImageDesc) -> Result<ResourceHandle<Image>> {
        let device = gpu.device();
        let raw = device.create_image(&desc).context("Failed to create image")?;
        let view = match device.create_image_view(raw, desc.format) {
            Ok(view) => view,
            Err(e) => {
                device.destroy_image(raw);
                return Err(e.context("Failed to create image view"));
            }
        };

        log::debug!(
            "Created image {:?} {}x{} {:?}",
            raw,
            desc.extent.width,
            desc.extent.height,
            desc.format
        );

        Ok(ResourceHandle::new(
            gpu.destroyer().clone(),
            Image {
                gpu: gpu.clone(),
                raw,
                view,
                desc,
                state: Mutex::new(ImageState::Undefined),
                dependents: Mutex::new(Vec::new()),
            },
        ))
    }

    /// Sampled 2D image that can be uploaded to and read back
    pub fn new_2d(gpu: &Arc<GpuContext>, extent: Extent2D, format: ImageFormat) -> Result<ResourceHandle<Image>> {
        Self::new(
            gpu,
            ImageDesc {
                extent,
                format,
                usage: ImageUsage::SAMPLED | ImageUsage::TRANSFER_DST | ImageUsage::TRANSFER_SRC,
                mip_levels: 1,
            },
        )
    }

    pub fn raw(&self) -> RawImage {
        self.raw
    }

    pub fn view(&self) -> RawImageView {
        self.view
    }

    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    pub fn extent(&self) -> Extent2D {
        self.desc.extent
    }

    pub fn format(&self) -> ImageFormat {
        self.desc.format
    }

    pub fn usage(&self) -> ImageUsage {
        self.desc.usage
    }

    pub fn state(&self) -> ImageState {
        *self.state.lock()
    }

    pub fn barrier(&self, old: ImageState, new: ImageState) -> ImageBarrier {
        let (src_stages, src_access) = stage_and_access(old);
        let (dst_stages, dst_access) = stage_and_access(new);
        ImageBarrier {
            image: self.raw,
            old_state: old,
            new_state: new,
            src_stages,
            src_access,
            dst_stages,
            dst_access,
            depth: self.desc.format.is_depth(),
        }
    }

    /// Transition to `new_state`.
    ///
    /// With a list the barrier is appended to that recording and nothing is
    /// submitted. Without one a transfer-queue list is recorded, submitted
    /// and waited on before returning.
    pub fn set_layout(&self, new_state: ImageState, list: Option<&mut CommandList>) -> Result<()> {
        let old_state = self.state();
        let barrier = self.barrier(old_state, new_state);

        match list {
            Some(list) => list.barrier(barrier)?,
            None => {
                let transfer = self.gpu.transfer();
                let mut list = transfer.get()?;
                list.begin()?;
                list.barrier(barrier)?;
                list.end()?;
                transfer
                    .submit(list, true)
                    .context("Failed to submit layout transition")?;
            }
        }

        *self.state.lock() = new_state;
        log::debug!("Image {:?}: {:?} -> {:?}", self.raw, old_state, new_state);
        self.notify(old_state, new_state);
        Ok(())
    }

    fn notify(&self, old: ImageState, new: ImageState) {
        let observers: Vec<Arc<dyn LayoutObserver>> = {
            let mut dependents = self.dependents.lock();
            dependents.retain(|d| d.strong_count() > 0);
            dependents.iter().filter_map(Weak::upgrade).collect()
        };
        for observer in observers {
            observer.on_layout_transition(self, old, new);
        }
    }

    pub fn register_dependent(&self, dependent: Weak<dyn LayoutObserver>) {
        self.dependents.lock().push(dependent);
    }

    /// `dependent` is the address of the observer value
    pub fn unregister_dependent(&self, dependent: *const ()) {
        self.dependents
            .lock()
            .retain(|d| d.as_ptr() as *const () != dependent);
    }

    pub fn dependent_count(&self) -> usize {
        self.dependents.lock().len()
    }

    /// Copy tightly packed pixel data into the image through a staging
    /// buffer, leaving it in the state it had before (shader-read-only if
    /// it had no contents yet)
    pub fn upload(&self, data: &[u8]) -> Result<()> {
        let extent = self.desc.extent;
        let expected = extent.width as usize * extent.height as usize * self.desc.format.bytes_per_pixel() as usize;
        if data.len() != expected {
            bail!(
                "Upload of {} bytes does not match {}x{} {:?} ({} bytes)",
                data.len(),
                extent.width,
                extent.height,
                self.desc.format,
                expected
            );
        }

        let device = self.gpu.device();
        let staging = device
            .create_buffer(&BufferDesc {
                size: data.len() as u64,
                usage: BufferUsage::TRANSFER_SRC,
            })
            .context("Failed to create staging buffer")?;

        let result = (|| -> Result<()> {
            device.write_buffer(staging, 0, data)?;

            let transfer = self.gpu.transfer();
            let mut list = transfer.get()?;
            list.begin()?;
            if self.state() == ImageState::Undefined {
                self.set_layout(ImageState::ShaderReadOnly, Some(&mut list))?;
            }
            let restore = self.state();
            self.set_layout(ImageState::TransferDst, Some(&mut list))?;
            list.copy_buffer_to_image(staging, self.raw, extent)?;
            self.set_layout(restore, Some(&mut list))?;
            list.end()?;
            transfer.submit(list, true).context("Failed to submit image upload")?;
            Ok(())
        })();

        // Either waited on or never submitted
        device.destroy_buffer(staging);
        result
    }

    /// Copy the image's pixels back to the host, tightly packed.
    ///
    /// The copy goes on the graphics queue so it lands after any rendering
    /// already submitted there, and is waited on before returning. The
    /// image ends in the state it started in.
    pub fn read_back(&self) -> Result<Vec<u8>> {
        if !self.desc.usage.contains(ImageUsage::TRANSFER_SRC) {
            bail!("Image {:?} was not created for transfer reads", self.raw);
        }
        if self.desc.format.is_depth() {
            bail!("Reading back depth image {:?} is not supported", self.raw);
        }
        let restore = self.state();
        if restore == ImageState::Undefined {
            bail!("Image {:?} has no contents to read back", self.raw);
        }

        let extent = self.desc.extent;
        let size = extent.width as usize * extent.height as usize * self.desc.format.bytes_per_pixel() as usize;
        let device = self.gpu.device();
        let staging = device
            .create_buffer(&BufferDesc {
                size: size as u64,
                usage: BufferUsage::TRANSFER_DST,
            })
            .context("Failed to create staging buffer")?;

        let result = (|| -> Result<Vec<u8>> {
            let graphics = self.gpu.graphics();
            let mut list = graphics.get()?;
            list.begin()?;
            self.set_layout(ImageState::TransferSrc, Some(&mut list))?;
            list.copy_image_to_buffer(self.raw, staging, extent)?;
            self.set_layout(restore, Some(&mut list))?;
            list.end()?;
            graphics.submit(list, true).context("Failed to submit image read back")?;

            let mut pixels = vec![0; size];
            device.read_buffer(staging, 0, &mut pixels)?;
            Ok(pixels)
        })();

        device.destroy_buffer(staging);
        result
    }
}

impl GpuResource for Image {
    fn release(&mut self) -> Vec<RetiredObject> {
        vec![RetiredObject::ImageView(self.view), RetiredObject::Image(self.raw)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_matches_expected_pairs() {
        assert_eq!(
            stage_and_access(ImageState::Undefined),
            (PipelineStages::TOP_OF_PIPE, AccessFlags::empty())
        );
        assert_eq!(
            stage_and_access(ImageState::TransferDst),
            (PipelineStages::TRANSFER, AccessFlags::TRANSFER_WRITE)
        );
        assert_eq!(
            stage_and_access(ImageState::ShaderReadOnly),
            (PipelineStages::FRAGMENT_SHADER, AccessFlags::SHADER_READ)
        );
        let (stages, access) = stage_and_access(ImageState::General);
        assert!(stages.contains(PipelineStages::ALL_COMMANDS));
        assert!(access.contains(AccessFlags::SHADER_WRITE));
    }
}
