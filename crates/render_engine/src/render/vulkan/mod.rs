//! Low-level Vulkan wrappers
//!
//! RAII wrappers over raw Vulkan objects. Every wrapper owns a cloned
//! `ash::Device` and destroys its handles on drop; destruction ordering is
//! driven by field declaration order in the owning types.

/// Buffer objects and memory helpers
pub mod buffer;
/// Command pools and recording
pub mod commands;
/// Instance, device, and surface management
pub mod context;
/// Descriptor layouts, pools, and sets
pub mod descriptor;
/// Framebuffer wrapper
pub mod framebuffer;
/// Shader modules and graphics pipelines
pub mod pipeline;
/// Render pass construction and clear policy
pub mod render_pass;
/// Swapchain management
pub mod swapchain;
/// Semaphores, fences, frame sync
pub mod sync;
/// GPU image + view + sampler wrapper
pub mod texture;
/// GLFW window wrapper
pub mod window;

pub use buffer::{Buffer, BufferObject, IndexBuffer, UniformBuffer, VertexBuffer};
pub use commands::CommandPool;
pub use context::{
    LogicalDevice, PhysicalDeviceInfo, VulkanContext, VulkanError, VulkanInstance, VulkanResult,
};
pub use descriptor::{DescriptorPool, DescriptorSetLayout, DescriptorSetLayoutBuilder};
pub use framebuffer::Framebuffer;
pub use pipeline::{GraphicsPipeline, ShaderModule};
pub use render_pass::{ClearFlag, RenderPass, RenderTargetDesc};
pub use swapchain::Swapchain;
pub use sync::{Fence, FrameSync, Semaphore};
pub use texture::Texture;
pub use window::{Window, WindowError};
