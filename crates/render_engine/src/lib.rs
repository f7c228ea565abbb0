//! Vulkan frame-recording and resource-caching core for a real-time 3D engine.
//!
//! The crate turns per-camera draw lists into GPU command buffers, caches the
//! GPU objects whose validity depends on render-target configuration (render
//! passes, framebuffers, pipelines, descriptor sets), and drives the
//! acquire/submit/present cycle each frame.
//!
//! Ownership flows downward: [`render::graphics::Display`] owns the device,
//! the swapchain, and arenas of cameras, shaders, materials, and renderers.
//! Cross-object references are arena keys, never shared pointers. Derived GPU
//! state (pipelines, secondary command buffers, framebuffers) is rebuilt
//! lazily through dirty flags coalesced once per frame.

/// Foundation utilities: math types, logging
pub mod foundation;

/// Configuration loading and types
pub mod config;

/// Rendering core: backend abstraction, Vulkan wrappers, frame recording
pub mod render;

pub use config::DisplayConfig;
pub use render::graphics::{
    Camera, CameraClearFlags, CameraKey, Display, Material, MaterialKey, Renderer, RendererKey,
    Shader, ShaderKey,
};
pub use render::vulkan::{VulkanError, VulkanResult};
