//! GPU buffer objects
//!
//! Buffers own their backing memory and are written by mapped-memory copy.
//! Vertex and index buffers are host-visible for simplicity of update; uniform
//! buffers stay persistently mapped so per-frame property flushes are plain
//! byte copies.

use ash::{vk, Device};

use crate::render::vulkan::{VulkanError, VulkanResult};

/// Find a memory type matching the filter and property flags
pub fn find_memory_type(
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
) -> VulkanResult<u32> {
    for i in 0..memory_properties.memory_type_count {
        if (type_filter & (1 << i)) != 0
            && memory_properties.memory_types[i as usize]
                .property_flags
                .contains(properties)
        {
            return Ok(i);
        }
    }

    Err(VulkanError::NoSuitableMemoryType)
}

/// GPU buffer with owned backing memory and RAII cleanup
pub struct Buffer {
    device: Device,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
}

/// A buffer plus its backing memory, the leaf resource of the recording layer
pub type BufferObject = Buffer;

impl Buffer {
    /// Create a new buffer with dedicated memory
    pub fn new(
        device: Device,
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> VulkanResult<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            device
                .create_buffer(&buffer_info, None)
                .map_err(VulkanError::Api)?
        };

        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let memory_type_index = find_memory_type(
            requirements.memory_type_bits,
            properties,
            &memory_properties,
        )?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        let memory = unsafe {
            device.allocate_memory(&alloc_info, None).map_err(|_| {
                VulkanError::OutOfMemory {
                    requested: requirements.size as usize,
                }
            })?
        };

        unsafe {
            device
                .bind_buffer_memory(buffer, memory, 0)
                .map_err(VulkanError::Api)?;
        }

        Ok(Self {
            device,
            buffer,
            memory,
            size,
        })
    }

    /// Create a host-visible buffer for the given usage
    pub fn host_visible(
        device: Device,
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> VulkanResult<Self> {
        Self::new(
            device,
            instance,
            physical_device,
            size,
            usage,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
    }

    /// Copy raw bytes into the buffer at the given offset by mapped-memory copy
    pub fn write_bytes(&self, offset: vk::DeviceSize, bytes: &[u8]) -> VulkanResult<()> {
        if offset + bytes.len() as vk::DeviceSize > self.size {
            return Err(VulkanError::InvalidOperation {
                reason: format!(
                    "write of {} bytes at offset {} exceeds buffer size {}",
                    bytes.len(),
                    offset,
                    self.size
                ),
            });
        }

        unsafe {
            let ptr = self
                .device
                .map_memory(
                    self.memory,
                    offset,
                    bytes.len() as vk::DeviceSize,
                    vk::MemoryMapFlags::empty(),
                )
                .map_err(VulkanError::Api)?;
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.cast::<u8>(), bytes.len());
            self.device.unmap_memory(self.memory);
        }

        Ok(())
    }

    /// Copy a slice of plain-old-data values into the buffer
    pub fn write_data<T: bytemuck::Pod>(
        &self,
        offset: vk::DeviceSize,
        data: &[T],
    ) -> VulkanResult<()> {
        self.write_bytes(offset, bytemuck::cast_slice(data))
    }

    /// Get the buffer handle
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Buffer size in bytes
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_buffer(self.buffer, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

/// Vertex buffer wrapper
pub struct VertexBuffer {
    buffer: Buffer,
    vertex_count: u32,
}

impl VertexBuffer {
    /// Create and fill a vertex buffer
    pub fn new<T: bytemuck::Pod>(
        device: Device,
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        vertices: &[T],
    ) -> VulkanResult<Self> {
        let size = std::mem::size_of_val(vertices) as vk::DeviceSize;
        let buffer = Buffer::host_visible(
            device,
            instance,
            physical_device,
            size,
            vk::BufferUsageFlags::VERTEX_BUFFER,
        )?;
        buffer.write_data(0, vertices)?;

        Ok(Self {
            buffer,
            vertex_count: vertices.len() as u32,
        })
    }

    /// Get the buffer handle
    pub fn handle(&self) -> vk::Buffer {
        self.buffer.handle()
    }

    /// Number of vertices stored
    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }
}

/// Index buffer wrapper, 16-bit indices
pub struct IndexBuffer {
    buffer: Buffer,
    index_count: u32,
}

impl IndexBuffer {
    /// Create and fill an index buffer
    pub fn new(
        device: Device,
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        indices: &[u16],
    ) -> VulkanResult<Self> {
        let size = std::mem::size_of_val(indices) as vk::DeviceSize;
        let buffer = Buffer::host_visible(
            device,
            instance,
            physical_device,
            size,
            vk::BufferUsageFlags::INDEX_BUFFER,
        )?;
        buffer.write_data(0, indices)?;

        Ok(Self {
            buffer,
            index_count: indices.len() as u32,
        })
    }

    /// Get the buffer handle
    pub fn handle(&self) -> vk::Buffer {
        self.buffer.handle()
    }

    /// Number of indices stored
    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    /// Index type of the stored indices
    pub fn index_type(&self) -> vk::IndexType {
        vk::IndexType::UINT16
    }
}

/// Persistently mapped uniform buffer
pub struct UniformBuffer {
    device: Device,
    buffer: Buffer,
    mapped: *mut u8,
}

impl UniformBuffer {
    /// Create a uniform buffer of the given byte size and map it for the
    /// lifetime of the object
    pub fn new(
        device: Device,
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        size: vk::DeviceSize,
    ) -> VulkanResult<Self> {
        let buffer = Buffer::host_visible(
            device.clone(),
            instance,
            physical_device,
            size,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
        )?;

        let mapped = unsafe {
            device
                .map_memory(buffer.memory, 0, size, vk::MemoryMapFlags::empty())
                .map_err(VulkanError::Api)?
                .cast::<u8>()
        };

        Ok(Self {
            device,
            buffer,
            mapped,
        })
    }

    /// Write bytes at the given offset through the persistent mapping
    pub fn write_at(&self, offset: usize, bytes: &[u8]) -> VulkanResult<()> {
        if offset + bytes.len() > self.buffer.size() as usize {
            return Err(VulkanError::InvalidOperation {
                reason: format!(
                    "uniform write of {} bytes at offset {} exceeds buffer size {}",
                    bytes.len(),
                    offset,
                    self.buffer.size()
                ),
            });
        }

        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.mapped.add(offset), bytes.len());
        }
        Ok(())
    }

    /// Get the buffer handle
    pub fn handle(&self) -> vk::Buffer {
        self.buffer.handle()
    }

    /// Buffer size in bytes
    pub fn size(&self) -> vk::DeviceSize {
        self.buffer.size()
    }
}

impl Drop for UniformBuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.unmap_memory(self.buffer.memory);
        }
    }
}
