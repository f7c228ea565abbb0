//! GPU image + view + sampler wrapper
//!
//! Textures are the leaf image resource: sampled textures uploaded from pixel
//! data, and render-target textures consumed as camera attachments. A target
//! created with a sample count above one owns a multisample companion image
//! that is resolved into the primary image after rendering.

use ash::{vk, Device};

use crate::render::vulkan::buffer::{find_memory_type, Buffer};
use crate::render::vulkan::commands::CommandPool;
use crate::render::vulkan::{VulkanError, VulkanResult};

struct ImageAllocation {
    image: vk::Image,
    memory: vk::DeviceMemory,
    view: vk::ImageView,
}

fn create_image(
    device: &Device,
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    extent: vk::Extent2D,
    format: vk::Format,
    samples: vk::SampleCountFlags,
    usage: vk::ImageUsageFlags,
    aspect: vk::ImageAspectFlags,
) -> VulkanResult<ImageAllocation> {
    let image_info = vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::TYPE_2D)
        .extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .format(format)
        .tiling(vk::ImageTiling::OPTIMAL)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .samples(samples);

    let image = unsafe {
        device
            .create_image(&image_info, None)
            .map_err(VulkanError::Api)?
    };

    let requirements = unsafe { device.get_image_memory_requirements(image) };
    let memory_properties =
        unsafe { instance.get_physical_device_memory_properties(physical_device) };

    let memory_type_index = find_memory_type(
        requirements.memory_type_bits,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
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
            .bind_image_memory(image, memory, 0)
            .map_err(VulkanError::Api)?;
    }

    let view_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });

    let view = unsafe {
        device
            .create_image_view(&view_info, None)
            .map_err(VulkanError::Api)?
    };

    Ok(ImageAllocation {
        image,
        memory,
        view,
    })
}

/// Record an image layout transition into the given command buffer
pub fn cmd_transition_layout(
    device: &Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    aspect: vk::ImageAspectFlags,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) {
    let (src_access, src_stage) = match old_layout {
        vk::ImageLayout::UNDEFINED => (
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::TOP_OF_PIPE,
        ),
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => (
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
        ),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => (
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::TRANSFER,
        ),
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => (
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        _ => (
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
    };

    let (dst_access, dst_stage) = match new_layout {
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => (
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
        ),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => (
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::TRANSFER,
        ),
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => (
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        ),
        _ => (
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
    };

    let barrier = vk::ImageMemoryBarrier::builder()
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        })
        .src_access_mask(src_access)
        .dst_access_mask(dst_access);

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier.build()],
        );
    }
}

/// GPU texture with RAII cleanup
pub struct Texture {
    device: Device,
    image: vk::Image,
    memory: vk::DeviceMemory,
    view: vk::ImageView,
    sampler: Option<vk::Sampler>,
    multisample: Option<ImageAllocation>,
    format: vk::Format,
    extent: vk::Extent2D,
    sample_count: vk::SampleCountFlags,
}

impl Texture {
    /// Create a color render-target texture.
    ///
    /// With a sample count above one the texture owns a multisample companion
    /// image; rendering targets the companion and resolves into the primary
    /// image, which is the one samplers see.
    pub fn color_target(
        device: Device,
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        extent: vk::Extent2D,
        format: vk::Format,
        sample_count: vk::SampleCountFlags,
    ) -> VulkanResult<Self> {
        let primary = create_image(
            &device,
            instance,
            physical_device,
            extent,
            format,
            vk::SampleCountFlags::TYPE_1,
            vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_DST,
            vk::ImageAspectFlags::COLOR,
        )?;

        let multisample = if sample_count != vk::SampleCountFlags::TYPE_1 {
            Some(create_image(
                &device,
                instance,
                physical_device,
                extent,
                format,
                sample_count,
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC,
                vk::ImageAspectFlags::COLOR,
            )?)
        } else {
            None
        };

        let sampler = Self::create_sampler(&device)?;

        log::debug!(
            "Created color target {}x{} {:?} samples {:?}",
            extent.width,
            extent.height,
            format,
            sample_count
        );

        Ok(Self {
            device,
            image: primary.image,
            memory: primary.memory,
            view: primary.view,
            sampler: Some(sampler),
            multisample,
            format,
            extent,
            sample_count,
        })
    }

    /// Create a depth render-target texture
    pub fn depth_target(
        device: Device,
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        extent: vk::Extent2D,
        format: vk::Format,
        sample_count: vk::SampleCountFlags,
    ) -> VulkanResult<Self> {
        let primary = create_image(
            &device,
            instance,
            physical_device,
            extent,
            format,
            sample_count,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            vk::ImageAspectFlags::DEPTH,
        )?;

        Ok(Self {
            device,
            image: primary.image,
            memory: primary.memory,
            view: primary.view,
            sampler: None,
            multisample: None,
            format,
            extent,
            sample_count,
        })
    }

    /// Create a sampled texture from raw pixel data via a staging buffer
    pub fn from_pixels(
        device: Device,
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        pool: &CommandPool,
        queue: vk::Queue,
        pixels: &[u8],
        extent: vk::Extent2D,
        format: vk::Format,
    ) -> VulkanResult<Self> {
        let primary = create_image(
            &device,
            instance,
            physical_device,
            extent,
            format,
            vk::SampleCountFlags::TYPE_1,
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            vk::ImageAspectFlags::COLOR,
        )?;

        let staging = Buffer::host_visible(
            device.clone(),
            instance,
            physical_device,
            pixels.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
        )?;
        staging.write_bytes(0, pixels)?;

        pool.submit_single_time(queue, |dev, cmd| {
            cmd_transition_layout(
                dev,
                cmd,
                primary.image,
                vk::ImageAspectFlags::COLOR,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            );

            let region = vk::BufferImageCopy::builder()
                .buffer_offset(0)
                .image_subresource(vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .image_extent(vk::Extent3D {
                    width: extent.width,
                    height: extent.height,
                    depth: 1,
                });

            unsafe {
                dev.cmd_copy_buffer_to_image(
                    cmd,
                    staging.handle(),
                    primary.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region.build()],
                );
            }

            cmd_transition_layout(
                dev,
                cmd,
                primary.image,
                vk::ImageAspectFlags::COLOR,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            );
        })?;

        let sampler = Self::create_sampler(&device)?;

        Ok(Self {
            device,
            image: primary.image,
            memory: primary.memory,
            view: primary.view,
            sampler: Some(sampler),
            multisample: None,
            format,
            extent,
            sample_count: vk::SampleCountFlags::TYPE_1,
        })
    }

    fn create_sampler(device: &Device) -> VulkanResult<vk::Sampler> {
        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .max_lod(1.0);

        unsafe {
            device
                .create_sampler(&sampler_info, None)
                .map_err(VulkanError::Api)
        }
    }

    /// Get the primary image handle
    pub fn image(&self) -> vk::Image {
        self.image
    }

    /// Get the primary image view
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    /// Get the sampler, if this texture is sampleable
    pub fn sampler(&self) -> Option<vk::Sampler> {
        self.sampler
    }

    /// View of the multisample companion image, if any
    pub fn multisample_view(&self) -> Option<vk::ImageView> {
        self.multisample.as_ref().map(|ms| ms.view)
    }

    /// Multisample companion image handle, if any
    pub fn multisample_image(&self) -> Option<vk::Image> {
        self.multisample.as_ref().map(|ms| ms.image)
    }

    /// Texture format
    pub fn format(&self) -> vk::Format {
        self.format
    }

    /// Texture extent
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Sample count requested at creation
    pub fn sample_count(&self) -> vk::SampleCountFlags {
        self.sample_count
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        unsafe {
            if let Some(ms) = self.multisample.take() {
                self.device.destroy_image_view(ms.view, None);
                self.device.destroy_image(ms.image, None);
                self.device.free_memory(ms.memory, None);
            }
            if let Some(sampler) = self.sampler.take() {
                self.device.destroy_sampler(sampler, None);
            }
            self.device.destroy_image_view(self.view, None);
            self.device.destroy_image(self.image, None);
            self.device.free_memory(self.memory, None);
        }
    }
}
