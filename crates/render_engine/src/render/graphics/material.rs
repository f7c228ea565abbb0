//! Material: descriptor/uniform binding instance
//!
//! A material is one GPU-resident instance of its shader's binding layout:
//! one descriptor set, one uniform buffer per block binding, and a map of
//! named properties with per-property dirty bits. Property writes never touch
//! the GPU directly; `update_uniform_sets` flushes every dirty property once
//! per frame before command recording.

use ash::{vk, Device};
use slotmap::new_key_type;

use crate::foundation::math::{Color, Mat4, Vec4};
use crate::render::graphics::display::TextureKey;
use crate::render::graphics::shader::{Shader, ShaderKey, UniformLayout};
use crate::render::vulkan::buffer::UniformBuffer;
use crate::render::vulkan::texture::Texture;
use crate::render::vulkan::{VulkanError, VulkanResult};

new_key_type! {
    /// Arena key for materials
    pub struct MaterialKey;
}

/// Sort queue used when neither an override nor a live shader supplies one
const DEFAULT_QUEUE: i32 = 2000;

/// Upward invalidation message produced by a mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalidate {
    /// Nothing derived went stale
    None,
    /// Uniform bytes must be re-flushed before the next recording
    Uniforms,
    /// Command buffers referencing this object must be re-recorded
    Commands,
}

/// Typed value of a named material property
#[derive(Debug, Clone, PartialEq)]
pub enum MaterialProperty {
    /// Single float
    Float(f32),
    /// Single integer
    Int(i32),
    /// Four-component vector
    Vector(Vec4),
    /// RGBA color
    Color(Color),
    /// 4x4 matrix
    Matrix(Mat4),
}

impl MaterialProperty {
    /// Byte representation matching std140 scalar/vector/matrix layout
    pub fn as_bytes(&self) -> Vec<u8> {
        match self {
            Self::Float(v) => v.to_ne_bytes().to_vec(),
            Self::Int(v) => v.to_ne_bytes().to_vec(),
            Self::Vector(v) => bytemuck::cast_slice(v.as_slice()).to_vec(),
            Self::Color(c) => bytemuck::cast_slice(&c.to_array()).to_vec(),
            Self::Matrix(m) => bytemuck::cast_slice(m.as_slice()).to_vec(),
        }
    }
}

struct PropertyEntry {
    name: String,
    value: MaterialProperty,
    dirty: bool,
}

/// Named property storage with stable insertion order and dirty bits
#[derive(Default)]
pub struct PropertyBlock {
    entries: Vec<PropertyEntry>,
}

impl PropertyBlock {
    /// Store a value and mark it dirty
    pub fn set(&mut self, name: &str, value: MaterialProperty) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.name == name) {
            entry.value = value;
            entry.dirty = true;
        } else {
            self.entries.push(PropertyEntry {
                name: name.to_string(),
                value,
                dirty: true,
            });
        }
    }

    /// Read a stored value
    pub fn get(&self, name: &str) -> Option<&MaterialProperty> {
        self.entries.iter().find(|e| e.name == name).map(|e| &e.value)
    }

    /// Whether the named property is marked dirty
    pub fn is_dirty(&self, name: &str) -> bool {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .is_some_and(|e| e.dirty)
    }

    /// Whether any property is dirty
    pub fn any_dirty(&self) -> bool {
        self.entries.iter().any(|e| e.dirty)
    }

    /// Flush every dirty property through `write(buffer_index, offset, bytes)`
    /// at its reflected offset, then clear the dirty bits.
    ///
    /// A property name the layout does not declare is a programmer error.
    pub fn flush(
        &mut self,
        layout: &UniformLayout,
        mut write: impl FnMut(usize, usize, &[u8]) -> VulkanResult<()>,
    ) -> VulkanResult<()> {
        for entry in &mut self.entries {
            if !entry.dirty {
                continue;
            }

            let (buffer_index, offset, size) =
                layout.member_offset(&entry.name).ok_or_else(|| {
                    VulkanError::InvalidOperation {
                        reason: format!("Shader declares no uniform member '{}'", entry.name),
                    }
                })?;

            let bytes = entry.value.as_bytes();
            let len = bytes.len().min(size);
            write(buffer_index, offset, &bytes[..len])?;
            entry.dirty = false;
        }
        Ok(())
    }
}

struct TextureSlot {
    name: String,
    texture: Option<TextureKey>,
    dirty: bool,
}

/// Material resource owning its descriptor set and uniform buffers
pub struct Material {
    shader: ShaderKey,
    properties: PropertyBlock,
    texture_slots: Vec<TextureSlot>,
    descriptor_set: vk::DescriptorSet,
    uniform_buffers: Vec<UniformBuffer>,
    queue_override: Option<i32>,
}

impl Material {
    /// Create a material instance for the given shader.
    ///
    /// GPU-side state (descriptor set, uniform buffers) is attached by the
    /// Display factory after allocation.
    pub fn new(shader: ShaderKey) -> Self {
        Self {
            shader,
            properties: PropertyBlock::default(),
            texture_slots: Vec::new(),
            descriptor_set: vk::DescriptorSet::null(),
            uniform_buffers: Vec::new(),
            queue_override: None,
        }
    }

    /// Attach the allocated descriptor set and per-binding uniform buffers
    pub(crate) fn attach_gpu(
        &mut self,
        descriptor_set: vk::DescriptorSet,
        uniform_buffers: Vec<UniformBuffer>,
    ) {
        self.descriptor_set = descriptor_set;
        self.uniform_buffers = uniform_buffers;
    }

    /// Owning shader key
    pub fn shader(&self) -> ShaderKey {
        self.shader
    }

    /// Descriptor set bound at draw time
    pub fn descriptor_set(&self) -> vk::DescriptorSet {
        self.descriptor_set
    }

    /// Set a float property
    pub fn set_float(&mut self, name: &str, value: f32) -> Invalidate {
        self.properties.set(name, MaterialProperty::Float(value));
        Invalidate::Uniforms
    }

    /// Set an integer property
    pub fn set_int(&mut self, name: &str, value: i32) -> Invalidate {
        self.properties.set(name, MaterialProperty::Int(value));
        Invalidate::Uniforms
    }

    /// Set a vector property
    pub fn set_vector(&mut self, name: &str, value: Vec4) -> Invalidate {
        self.properties.set(name, MaterialProperty::Vector(value));
        Invalidate::Uniforms
    }

    /// Set a color property
    pub fn set_color(&mut self, name: &str, value: Color) -> Invalidate {
        self.properties.set(name, MaterialProperty::Color(value));
        Invalidate::Uniforms
    }

    /// Set a matrix property
    pub fn set_matrix(&mut self, name: &str, value: Mat4) -> Invalidate {
        self.properties.set(name, MaterialProperty::Matrix(value));
        Invalidate::Uniforms
    }

    /// Bind a texture to a named sampler slot.
    ///
    /// Texture changes invalidate command buffers, not just uniforms: the
    /// descriptor update must land before the next recording that binds it.
    pub fn set_texture(&mut self, name: &str, texture: TextureKey) -> Invalidate {
        if let Some(slot) = self.texture_slots.iter_mut().find(|s| s.name == name) {
            slot.texture = Some(texture);
            slot.dirty = true;
        } else {
            self.texture_slots.push(TextureSlot {
                name: name.to_string(),
                texture: Some(texture),
                dirty: true,
            });
        }
        Invalidate::Commands
    }

    /// Whether any sampler slot currently binds the given texture
    pub fn references_texture(&self, texture: TextureKey) -> bool {
        self.texture_slots
            .iter()
            .any(|slot| slot.texture == Some(texture))
    }

    /// Read a stored property
    pub fn get_property(&self, name: &str) -> Option<&MaterialProperty> {
        self.properties.get(name)
    }

    /// Whether the named property awaits a flush
    pub fn is_property_dirty(&self, name: &str) -> bool {
        self.properties.is_dirty(name)
    }

    /// Override the sort queue for this material
    pub fn set_queue(&mut self, queue: Option<i32>) {
        self.queue_override = queue;
    }

    /// Resolved sort queue: explicit override, else the shader's default
    pub fn queue(&self, shader: &Shader) -> i32 {
        self.resolved_queue(Some(shader))
    }

    /// Resolved sort queue when the shader may no longer be live. The
    /// material keeps a stable queue position even after its shader is
    /// destroyed, instead of falling back into the no-material group.
    pub fn resolved_queue(&self, shader: Option<&Shader>) -> i32 {
        self.queue_override
            .or_else(|| shader.map(Shader::queue))
            .unwrap_or(DEFAULT_QUEUE)
    }

    /// Flush every dirty property to the GPU.
    ///
    /// Uniform values go through the persistent mapping of their block's
    /// buffer at the reflected byte offset; texture bindings become
    /// descriptor image-info writes. Returns true when a texture binding
    /// changed, which forces re-recording of commands that bind this set.
    pub fn update_uniform_sets(
        &mut self,
        device: &Device,
        layout: &UniformLayout,
        textures: &slotmap::SlotMap<TextureKey, Texture>,
    ) -> VulkanResult<bool> {
        let Self {
            properties,
            uniform_buffers,
            ..
        } = self;

        properties.flush(layout, |buffer_index, offset, bytes| {
            uniform_buffers
                .get(buffer_index)
                .ok_or_else(|| VulkanError::InvalidOperation {
                    reason: format!("No uniform buffer for binding index {}", buffer_index),
                })?
                .write_at(offset, bytes)
        })?;

        let mut commands_stale = false;
        for slot in &mut self.texture_slots {
            if !slot.dirty {
                continue;
            }

            let binding = layout.sampler_binding(&slot.name).ok_or_else(|| {
                VulkanError::InvalidOperation {
                    reason: format!("Shader declares no sampler '{}'", slot.name),
                }
            })?;

            let Some(texture_key) = slot.texture else {
                slot.dirty = false;
                continue;
            };
            let texture = textures.get(texture_key).ok_or_else(|| {
                VulkanError::InvalidOperation {
                    reason: format!("Texture bound to '{}' was destroyed", slot.name),
                }
            })?;
            let sampler = texture.sampler().ok_or_else(|| {
                VulkanError::InvalidOperation {
                    reason: format!("Texture bound to '{}' is not sampleable", slot.name),
                }
            })?;

            let image_info = [vk::DescriptorImageInfo {
                sampler,
                image_view: texture.view(),
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            }];

            let write = vk::WriteDescriptorSet::builder()
                .dst_set(self.descriptor_set)
                .dst_binding(binding.binding)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .image_info(&image_info);

            unsafe {
                device.update_descriptor_sets(&[write.build()], &[]);
            }

            slot.dirty = false;
            commands_stale = true;
        }

        Ok(commands_stale)
    }

    /// Whether any uniform property awaits a flush
    pub fn any_uniform_dirty(&self) -> bool {
        self.properties.any_dirty()
    }

    /// Whether any texture slot awaits a descriptor write
    pub fn any_texture_dirty(&self) -> bool {
        self.texture_slots.iter().any(|s| s.dirty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::graphics::shader::{UniformBufferBinding, UniformMember};
    use approx::assert_relative_eq;

    fn layout() -> UniformLayout {
        UniformLayout {
            buffers: vec![UniformBufferBinding {
                name: "Params".to_string(),
                binding: 0,
                stage: vk::ShaderStageFlags::FRAGMENT,
                size: 32,
                members: vec![
                    UniformMember {
                        name: "x".to_string(),
                        offset: 0,
                        size: 4,
                    },
                    UniformMember {
                        name: "tint".to_string(),
                        offset: 16,
                        size: 16,
                    },
                ],
            }],
            samplers: vec![],
        }
    }

    #[test]
    fn test_flush_writes_bytes_at_reflected_offset() {
        let mut block = PropertyBlock::default();
        block.set("x", MaterialProperty::Float(2.5));

        let mut backing = vec![0u8; 32];
        block
            .flush(&layout(), |_, offset, bytes| {
                backing[offset..offset + bytes.len()].copy_from_slice(bytes);
                Ok(())
            })
            .unwrap();

        let mut raw = [0u8; 4];
        raw.copy_from_slice(&backing[0..4]);
        assert_relative_eq!(f32::from_ne_bytes(raw), 2.5);
        assert!(!block.is_dirty("x"));
    }

    #[test]
    fn test_flush_skips_clean_properties() {
        let mut block = PropertyBlock::default();
        block.set("x", MaterialProperty::Float(1.0));
        block
            .flush(&layout(), |_, _, _| Ok(()))
            .unwrap();

        // A second flush with nothing dirty must not write
        let mut writes = 0;
        block
            .flush(&layout(), |_, _, _| {
                writes += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(writes, 0);
    }

    #[test]
    fn test_flush_unknown_property_is_an_error() {
        let mut block = PropertyBlock::default();
        block.set("nonexistent", MaterialProperty::Float(1.0));

        let result = block.flush(&layout(), |_, _, _| Ok(()));
        assert!(matches!(
            result,
            Err(VulkanError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn test_color_property_bytes() {
        let mut block = PropertyBlock::default();
        block.set(
            "tint",
            MaterialProperty::Color(Color::new(1.0, 0.5, 0.25, 1.0)),
        );

        let mut backing = vec![0u8; 32];
        block
            .flush(&layout(), |_, offset, bytes| {
                backing[offset..offset + bytes.len()].copy_from_slice(bytes);
                Ok(())
            })
            .unwrap();

        let floats: &[f32] = bytemuck::cast_slice(&backing[16..32]);
        assert_eq!(floats, &[1.0, 0.5, 0.25, 1.0]);
    }

    #[test]
    fn test_set_texture_invalidates_commands() {
        let mut textures: slotmap::SlotMap<TextureKey, ()> = slotmap::SlotMap::with_key();
        let key = textures.insert(());

        let mut material = Material::new(ShaderKey::default());
        assert_eq!(material.set_float("x", 1.0), Invalidate::Uniforms);
        assert_eq!(material.set_texture("u_texture", key), Invalidate::Commands);
        assert!(material.any_texture_dirty());
    }

    #[test]
    fn test_queue_override() {
        let mut material = Material::new(ShaderKey::default());
        assert!(material.queue_override.is_none());
        material.set_queue(Some(1000));
        assert_eq!(material.queue_override, Some(1000));
    }

    #[test]
    fn test_queue_stable_without_live_shader() {
        let mut material = Material::new(ShaderKey::default());
        assert_eq!(material.resolved_queue(None), DEFAULT_QUEUE);
        material.set_queue(Some(3000));
        assert_eq!(material.resolved_queue(None), 3000);
    }

    #[test]
    fn test_references_texture() {
        let mut textures: slotmap::SlotMap<TextureKey, ()> = slotmap::SlotMap::with_key();
        let bound = textures.insert(());
        let unbound = textures.insert(());

        let mut material = Material::new(ShaderKey::default());
        assert!(!material.references_texture(bound));
        material.set_texture("u_texture", bound);
        assert!(material.references_texture(bound));
        assert!(!material.references_texture(unbound));
    }
}
