// Texture - sampled view of an Image
//
// A Texture owns a reference to its Image plus a sampler. It registers
// itself with the Image as a layout observer so that pipelines caching a
// descriptor for it can tell when the image state (and therefore the
// descriptor contents) changed.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::backend::{
    DescriptorKind, DescriptorResource, Extent2D, ImageFormat, ImageState, ImageUsage, RawImageView,
    RawSampler, SamplerDesc,
};
use crate::context::GpuContext;
use crate::handle::{ResourceHandle, RetiredObject};
use crate::image::{Image, LayoutObserver};

pub struct Texture {
    gpu: Arc<GpuContext>,
    image: ResourceHandle<Image>,
    sampler: RawSampler,
    /// Bumped on every transition of the underlying image
    version: AtomicU64,
}

impl std::fmt::Debug for Texture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Texture")
            .field("image", &self.image.raw())
            .field("sampler", &self.sampler)
            .field("version", &self.version())
            .finish()
    }
}

impl Texture {
    /// Layout a texture keeps its image in between uses
    pub fn optimal_state(usage: ImageUsage) -> ImageState {
        if usage.contains(ImageUsage::STORAGE) {
            ImageState::General
        } else {
            ImageState::ShaderReadOnly
        }
    }

    pub fn new(gpu: &Arc<GpuContext>, image: ResourceHandle<Image>, sampler: SamplerDesc) -> Result<Arc<Texture>> {
        let optimal = Self::optimal_state(image.usage());
        if image.state() != optimal {
            image.set_layout(optimal, None)?;
        }

        let sampler = gpu
            .device()
            .create_sampler(&sampler)
            .context("Failed to create texture sampler")?;

        let texture = Arc::new_cyclic(|weak: &Weak<Texture>| {
            let observer: Weak<dyn LayoutObserver> = weak.clone();
            image.register_dependent(observer);
            Texture {
                gpu: gpu.clone(),
                image,
                sampler,
                version: AtomicU64::new(0),
            }
        });
        Ok(texture)
    }

    /// 2D RGBA8 texture filled from `pixels`
    pub fn from_rgba8(gpu: &Arc<GpuContext>, width: u32, height: u32, pixels: &[u8]) -> Result<Arc<Texture>> {
        let image = Image::new_2d(gpu, Extent2D::new(width, height), ImageFormat::Rgba8Unorm)?;
        image.upload(pixels)?;
        Self::new(gpu, image, SamplerDesc::default())
    }

    /// 1x1 opaque black, bound wherever a shader samples an unassigned slot
    pub fn black(gpu: &Arc<GpuContext>) -> Result<Arc<Texture>> {
        Self::from_rgba8(gpu, 1, 1, &[0, 0, 0, 255])
    }

    pub fn image(&self) -> &ResourceHandle<Image> {
        &self.image
    }

    pub fn view(&self) -> RawImageView {
        self.image.view()
    }

    pub fn sampler(&self) -> RawSampler {
        self.sampler
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Descriptor contents for a binding of `kind`, reflecting the image's current state
    pub fn descriptor(&self, kind: DescriptorKind) -> DescriptorResource {
        let sampler = match kind {
            DescriptorKind::CombinedImageSampler | DescriptorKind::Sampler => self.sampler,
            _ => RawSampler::NULL,
        };
        DescriptorResource::Image {
            kind,
            view: self.view(),
            sampler,
            state: self.image.state(),
        }
    }
}

impl LayoutObserver for Texture {
    fn on_layout_transition(&self, _image: &Image, _old: ImageState, _new: ImageState) {
        self.version.fetch_add(1, Ordering::AcqRel);
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        self.image.unregister_dependent(self as *const Texture as *const ());
        self.gpu
            .destroyer()
            .retire(vec![RetiredObject::Sampler(self.sampler)]);
    }
}
