// Resource Handle - shared ownership with deferred GPU destruction
//
// Dropping the last handle to a GPU object does not destroy it. The raw
// objects are retired into the DeferredDestroyer together with the last
// fence value submitted on every queue, and destroyed once all of those
// values are complete. A list still recording at retirement may already
// reference the objects, so its queue's stamp stays open until that list
// is submitted and then covers the submission.

use anyhow::Result;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::Arc;

use crate::backend::{
    FenceValue, GpuDevice, RawBuffer, RawDescriptorPool, RawFramebuffer, RawImage, RawImageView,
    RawPipeline, RawPipelineLayout, RawRenderPass, RawSampler, RawSemaphore, RawSetLayout,
    RawShaderModule,
};
use crate::queue::Timeline;

/// A raw object waiting for the GPU to stop using it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetiredObject {
    Image(RawImage),
    ImageView(RawImageView),
    Sampler(RawSampler),
    Buffer(RawBuffer),
    Framebuffer(RawFramebuffer),
    RenderPass(RawRenderPass),
    Pipeline(RawPipeline),
    PipelineLayout(RawPipelineLayout),
    SetLayout(RawSetLayout),
    DescriptorPool(RawDescriptorPool),
    ShaderModule(RawShaderModule),
    Semaphore(RawSemaphore),
}

impl RetiredObject {
    fn destroy(self, device: &dyn GpuDevice) {
        match self {
            RetiredObject::Image(raw) => device.destroy_image(raw),
            RetiredObject::ImageView(raw) => device.destroy_image_view(raw),
            RetiredObject::Sampler(raw) => device.destroy_sampler(raw),
            RetiredObject::Buffer(raw) => device.destroy_buffer(raw),
            RetiredObject::Framebuffer(raw) => device.destroy_framebuffer(raw),
            RetiredObject::RenderPass(raw) => device.destroy_render_pass(raw),
            RetiredObject::Pipeline(raw) => device.destroy_pipeline(raw),
            RetiredObject::PipelineLayout(raw) => device.destroy_pipeline_layout(raw),
            RetiredObject::SetLayout(raw) => device.destroy_set_layout(raw),
            RetiredObject::DescriptorPool(raw) => device.destroy_descriptor_pool(raw),
            RetiredObject::ShaderModule(raw) => device.destroy_shader_module(raw),
            RetiredObject::Semaphore(raw) => device.destroy_semaphore(raw),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Stamp {
    value: FenceValue,
    /// Newest recording open at retirement; `value` is provisional until
    /// every recording up to it has been submitted
    open_through: Option<u64>,
}

impl Stamp {
    fn take(timeline: &Timeline) -> Self {
        Self {
            value: timeline.last_submitted(),
            open_through: timeline.newest_open_recording(),
        }
    }
}

struct Retirement {
    /// One stamp per timeline
    stamps: Vec<Stamp>,
    objects: Vec<RetiredObject>,
}

/// FIFO of retired objects, freed in retirement order
pub struct DeferredDestroyer {
    device: Arc<dyn GpuDevice>,
    timelines: Vec<Arc<Timeline>>,
    pending: Mutex<VecDeque<Retirement>>,
}

impl DeferredDestroyer {
    pub fn new(device: Arc<dyn GpuDevice>, timelines: Vec<Arc<Timeline>>) -> Self {
        Self {
            device,
            timelines,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    pub fn retire(&self, objects: Vec<RetiredObject>) {
        if objects.is_empty() {
            return;
        }
        let stamps = self.timelines.iter().map(|t| Stamp::take(t)).collect();
        self.pending.lock().push_back(Retirement { stamps, objects });
    }

    /// Retirements not yet destroyed
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    fn is_safe(&self, retirement: &mut Retirement) -> Result<bool> {
        for (timeline, stamp) in self.timelines.iter().zip(retirement.stamps.iter_mut()) {
            if let Some(id) = stamp.open_through {
                if timeline.has_open_through(id) {
                    return Ok(false);
                }
                // Those recordings are submitted now, at or below this value
                stamp.value = stamp.value.max(timeline.last_submitted());
                stamp.open_through = None;
            }
            if !timeline.is_complete(stamp.value)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Destroy everything whose stamps are complete; returns objects destroyed
    pub fn collect(&self) -> Result<usize> {
        let mut ready = Vec::new();
        let mut failure = None;
        {
            let mut pending = self.pending.lock();
            while let Some(front) = pending.front_mut() {
                match self.is_safe(front) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
                if let Some(retirement) = pending.pop_front() {
                    ready.extend(retirement.objects);
                }
            }
        }

        let count = ready.len();
        for object in ready {
            object.destroy(self.device.as_ref());
        }
        if count > 0 {
            log::debug!("Destroyed {} retired GPU objects", count);
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(count),
        }
    }

    /// Wait for the device to go idle and destroy everything pending
    pub fn flush(&self) -> Result<()> {
        let drained: Vec<Retirement> = self.pending.lock().drain(..).collect();
        if drained.is_empty() {
            return Ok(());
        }
        self.device.wait_idle()?;
        for retirement in drained {
            for object in retirement.objects {
                object.destroy(self.device.as_ref());
            }
        }
        Ok(())
    }
}

impl Drop for DeferredDestroyer {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("Failed to flush retired GPU objects: {:#}", e);
        }
    }
}

/// A value that owns raw GPU objects
pub trait GpuResource: Send + Sync {
    /// Hand over the raw objects to destroy; called once, on last drop
    fn release(&mut self) -> Vec<RetiredObject>;
}

struct Owned<T: GpuResource> {
    value: T,
    destroyer: Arc<DeferredDestroyer>,
}

impl<T: GpuResource> Drop for Owned<T> {
    fn drop(&mut self) {
        let objects = self.value.release();
        self.destroyer.retire(objects);
    }
}

/// Reference-counted handle to a GPU resource
pub struct ResourceHandle<T: GpuResource> {
    inner: Arc<Owned<T>>,
}

impl<T: GpuResource> ResourceHandle<T> {
    pub fn new(destroyer: Arc<DeferredDestroyer>, value: T) -> Self {
        Self {
            inner: Arc::new(Owned { value, destroyer }),
        }
    }

    /// Same underlying resource, not merely equal contents
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    pub fn strong_count(this: &Self) -> usize {
        Arc::strong_count(&this.inner)
    }
}

impl<T: GpuResource> Clone for ResourceHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: GpuResource> Deref for ResourceHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner.value
    }
}

impl<T: GpuResource + std::fmt::Debug> std::fmt::Debug for ResourceHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.value.fmt(f)
    }
}
