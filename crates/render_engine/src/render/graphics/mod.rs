//! Frame recording and resource caching
//!
//! The layer that turns "a render target plus an ordered list of draw calls"
//! into submitted GPU work. `Display` owns the device session and arenas of
//! cameras, shaders, materials, renderers, and textures; cross-object
//! references are arena keys. Dirty flags coalesce mutations into at most one
//! re-record per object per frame.

/// Camera: render target + draw-call command cache
pub mod camera;
/// Display: GPU session, swapchain, submission
pub mod display;
/// Material: descriptor/uniform binding instance
pub mod material;
/// Renderer: drawable bound to a material
pub mod renderer;
/// Shader: pipeline object cache
pub mod shader;
/// Compiled-shader byte-code cache
pub mod shader_cache;

pub use camera::{Camera, CameraClearFlags, CameraKey, RendererInstance};
pub use display::{Display, TextureKey};
pub use material::{Invalidate, Material, MaterialKey, MaterialProperty};
pub use renderer::{Renderer, RendererKey};
pub use shader::{
    SamplerBinding, Shader, ShaderDesc, ShaderKey, UniformBufferBinding, UniformLayout,
    UniformMember,
};
pub use shader_cache::{ShaderByteCache, ShaderCompiler, ShaderStage};
