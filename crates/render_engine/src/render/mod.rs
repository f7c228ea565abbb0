//! Rendering core
//!
//! Layered as: `backend` (capability interface), `vulkan` (RAII wrappers over
//! raw Vulkan objects), `graphics` (the frame-recording and resource-caching
//! layer: Display, Camera, Shader, Material, Renderer).

/// Graphics backend capability interface
pub mod backend;
/// Frame recording and resource caching
pub mod graphics;
/// Low-level Vulkan wrappers and primitives
pub mod vulkan;

pub use backend::{BackendCapabilities, GraphicsBackend};
pub use graphics::Display;
pub use vulkan::{VulkanError, VulkanResult};
