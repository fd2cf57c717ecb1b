// Images, views, samplers and buffers backed by gpu-allocator
//
// Images live in device-local memory. Buffers are host visible and stay
// mapped for their whole life, so writes are plain copies.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

use super::conv::{self, AsVk};
use super::{BufferMemory, VulkanDevice};
use crate::backend::types::*;

impl VulkanDevice {
    fn allocate_memory(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> Result<Allocation> {
        let mut allocator = self.allocator.lock();
        let allocator = allocator.as_mut().context("Allocator already destroyed")?;
        let allocation = allocator.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;
        Ok(allocation)
    }

    fn free_memory(&self, allocation: Allocation) {
        if let Some(allocator) = self.allocator.lock().as_mut() {
            if let Err(e) = allocator.free(allocation) {
                log::error!("Failed to free allocation: {}", e);
            }
        }
    }

    pub(super) fn allocate_image(&self, desc: &ImageDesc) -> Result<RawImage> {
        if desc.extent.is_zero_area() {
            anyhow::bail!("Cannot create a zero-area image");
        }

        let create_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(conv::format(desc.format))
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels.max(1))
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(conv::image_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { self.device.create_image(&create_info, None) }.context("Failed to create image")?;
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let bound = self
            .allocate_memory("image", requirements, MemoryLocation::GpuOnly, false)
            .and_then(|allocation| {
                match unsafe {
                    self.device
                        .bind_image_memory(image, allocation.memory(), allocation.offset())
                } {
                    Ok(()) => Ok(allocation),
                    Err(e) => {
                        self.free_memory(allocation);
                        Err(e).context("Failed to bind image memory")
                    }
                }
            });

        match bound {
            Ok(allocation) => {
                self.allocations.lock().images.insert(image, allocation);
                Ok(RawImage::from_vk(image))
            }
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                Err(e)
            }
        }
    }

    pub(super) fn free_image(&self, image: vk::Image) {
        unsafe { self.device.destroy_image(image, None) };
        let allocation = self.allocations.lock().images.remove(&image);
        if let Some(allocation) = allocation {
            self.free_memory(allocation);
        }
    }

    pub(super) fn build_image_view(&self, image: vk::Image, format: ImageFormat) -> Result<RawImageView> {
        let create_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(conv::format(format))
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: conv::aspect(format.is_depth()),
                base_mip_level: 0,
                level_count: vk::REMAINING_MIP_LEVELS,
                base_array_layer: 0,
                layer_count: 1,
            });

        let view =
            unsafe { self.device.create_image_view(&create_info, None) }.context("Failed to create image view")?;
        Ok(RawImageView::from_vk(view))
    }

    pub(super) fn build_sampler(&self, desc: &SamplerDesc) -> Result<RawSampler> {
        let filter = if desc.linear { vk::Filter::LINEAR } else { vk::Filter::NEAREST };
        let mipmap_mode = if desc.linear {
            vk::SamplerMipmapMode::LINEAR
        } else {
            vk::SamplerMipmapMode::NEAREST
        };
        let address_mode = if desc.repeat {
            vk::SamplerAddressMode::REPEAT
        } else {
            vk::SamplerAddressMode::CLAMP_TO_EDGE
        };
        let max_anisotropy = desc
            .max_anisotropy
            .min(self.properties.limits.max_sampler_anisotropy);

        let create_info = vk::SamplerCreateInfo::builder()
            .mag_filter(filter)
            .min_filter(filter)
            .mipmap_mode(mipmap_mode)
            .address_mode_u(address_mode)
            .address_mode_v(address_mode)
            .address_mode_w(address_mode)
            .anisotropy_enable(max_anisotropy > 0.0)
            .max_anisotropy(max_anisotropy.max(1.0))
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK);

        let sampler = unsafe { self.device.create_sampler(&create_info, None) }.context("Failed to create sampler")?;
        Ok(RawSampler::from_vk(sampler))
    }

    pub(super) fn allocate_buffer(&self, desc: &BufferDesc) -> Result<RawBuffer> {
        if desc.size == 0 {
            anyhow::bail!("Cannot create a zero-sized buffer");
        }

        let create_info = vk::BufferCreateInfo::builder()
            .size(desc.size)
            .usage(conv::buffer_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&create_info, None) }.context("Failed to create buffer")?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let bound = self
            .allocate_memory("buffer", requirements, MemoryLocation::CpuToGpu, true)
            .and_then(|allocation| {
                match unsafe {
                    self.device
                        .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
                } {
                    Ok(()) => Ok(allocation),
                    Err(e) => {
                        self.free_memory(allocation);
                        Err(e).context("Failed to bind buffer memory")
                    }
                }
            });

        match bound {
            Ok(allocation) => {
                self.allocations.lock().buffers.insert(
                    buffer,
                    BufferMemory {
                        allocation,
                        size: desc.size,
                    },
                );
                Ok(RawBuffer::from_vk(buffer))
            }
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                Err(e)
            }
        }
    }

    pub(super) fn write_mapped(&self, buffer: vk::Buffer, offset: u64, data: &[u8]) -> Result<()> {
        let mut allocations = self.allocations.lock();
        let memory = allocations.buffers.get_mut(&buffer).context("Unknown buffer")?;

        let end = offset
            .checked_add(data.len() as u64)
            .filter(|&end| end <= memory.size)
            .with_context(|| {
                format!(
                    "Write of {} bytes at {} overflows buffer of {} bytes",
                    data.len(),
                    offset,
                    memory.size
                )
            })?;

        let mapped = memory
            .allocation
            .mapped_slice_mut()
            .context("Buffer memory is not host visible")?;
        mapped[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    pub(super) fn read_mapped(&self, buffer: vk::Buffer, offset: u64, out: &mut [u8]) -> Result<()> {
        let allocations = self.allocations.lock();
        let memory = allocations.buffers.get(&buffer).context("Unknown buffer")?;

        let end = offset
            .checked_add(out.len() as u64)
            .filter(|&end| end <= memory.size)
            .with_context(|| {
                format!(
                    "Read of {} bytes at {} overflows buffer of {} bytes",
                    out.len(),
                    offset,
                    memory.size
                )
            })?;

        let mapped = memory
            .allocation
            .mapped_slice()
            .context("Buffer memory is not host visible")?;
        out.copy_from_slice(&mapped[offset as usize..end as usize]);
        Ok(())
    }

    pub(super) fn free_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) };
        let memory = self.allocations.lock().buffers.remove(&buffer);
        if let Some(memory) = memory {
            self.free_memory(memory.allocation);
        }
    }
}
