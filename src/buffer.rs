// Buffers for vertex, index, uniform and storage data
//
// All buffers are host visible and written through the device mapping.
// The typed wrappers only exist so a uniform buffer cannot be bound where
// a storage buffer is expected.

use anyhow::{bail, Context, Result};
use bytemuck::Pod;
use std::sync::Arc;

use crate::backend::{BufferDesc, BufferUsage, GpuDevice, RawBuffer};
use crate::context::GpuContext;
use crate::handle::{GpuResource, ResourceHandle, RetiredObject};

pub struct Buffer {
    device: Arc<dyn GpuDevice>,
    raw: RawBuffer,
    size: u64,
    usage: BufferUsage,
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("raw", &self.raw)
            .field("size", &self.size)
            .field("usage", &self.usage)
            .finish()
    }
}

impl Buffer {
    pub fn new(gpu: &GpuContext, size: u64, usage: BufferUsage) -> Result<ResourceHandle<Buffer>> {
        let raw = gpu
            .device()
            .create_buffer(&BufferDesc { size, usage })
            .context("Failed to create buffer")?;
        Ok(ResourceHandle::new(
            gpu.destroyer().clone(),
            Buffer {
                device: gpu.device().clone(),
                raw,
                size,
                usage,
            },
        ))
    }

    pub fn raw(&self) -> RawBuffer {
        self.raw
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub fn set_data(&self, offset: u64, data: &[u8]) -> Result<()> {
        if offset + data.len() as u64 > self.size {
            bail!(
                "Write of {} bytes at offset {} exceeds buffer size {}",
                data.len(),
                offset,
                self.size
            );
        }
        self.device
            .write_buffer(self.raw, offset, data)
            .context("Failed to write buffer")
    }

    pub fn set_value<T: Pod>(&self, value: &T) -> Result<()> {
        self.set_data(0, bytemuck::bytes_of(value))
    }

    pub fn set_slice<T: Pod>(&self, values: &[T]) -> Result<()> {
        self.set_data(0, bytemuck::cast_slice(values))
    }
}

impl GpuResource for Buffer {
    fn release(&mut self) -> Vec<RetiredObject> {
        vec![RetiredObject::Buffer(self.raw)]
    }
}

macro_rules! typed_buffer {
    ($(#[$meta:meta])* $name:ident, $usage:expr) => {
        $(#[$meta])*
        #[derive(Clone, Debug)]
        pub struct $name(ResourceHandle<Buffer>);

        impl $name {
            pub fn new(gpu: &GpuContext, size: u64) -> Result<Self> {
                Ok(Self(Buffer::new(gpu, size, $usage)?))
            }

            pub fn with_value<T: Pod>(gpu: &GpuContext, value: &T) -> Result<Self> {
                let buffer = Self::new(gpu, std::mem::size_of::<T>() as u64)?;
                buffer.set_value(value)?;
                Ok(buffer)
            }

            pub fn with_slice<T: Pod>(gpu: &GpuContext, values: &[T]) -> Result<Self> {
                let buffer = Self::new(gpu, std::mem::size_of_val(values) as u64)?;
                buffer.set_slice(values)?;
                Ok(buffer)
            }

            pub fn handle(&self) -> &ResourceHandle<Buffer> {
                &self.0
            }
        }

        impl std::ops::Deref for $name {
            type Target = Buffer;

            fn deref(&self) -> &Buffer {
                &self.0
            }
        }
    };
}

typed_buffer!(
    /// Bound to `uniform_buffer` bindings
    UniformBuffer,
    BufferUsage::UNIFORM
);
typed_buffer!(
    /// Bound to `storage_buffer` bindings
    StorageBuffer,
    BufferUsage::STORAGE
);
typed_buffer!(VertexBuffer, BufferUsage::VERTEX);
typed_buffer!(IndexBuffer, BufferUsage::INDEX);
