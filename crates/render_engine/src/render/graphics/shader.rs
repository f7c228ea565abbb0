//! Shader: pipeline object cache
//!
//! A graphics pipeline is only valid for the render pass it was compiled
//! against, even across passes with identical attachment formats. Each shader
//! therefore owns a map from render-pass handle to compiled pipeline, filled
//! on first use and purged before a pass is destroyed. The descriptor-set
//! layout and pipeline layout are built once per shader and shared by every
//! pipeline variant.

use std::collections::HashMap;

use ash::{vk, Device};
use slotmap::new_key_type;

use crate::render::graphics::shader_cache::{ShaderByteCache, ShaderCompiler, ShaderStage};
use crate::render::vulkan::descriptor::{DescriptorSetLayout, DescriptorSetLayoutBuilder};
use crate::render::vulkan::pipeline::{GraphicsPipeline, RenderState, ShaderModule};
use crate::render::vulkan::{VulkanError, VulkanResult};

new_key_type! {
    /// Arena key for shaders
    pub struct ShaderKey;
}

/// One named member of a uniform block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformMember {
    /// Member name as declared in the shader
    pub name: String,
    /// Byte offset within the block
    pub offset: usize,
    /// Byte size of the member
    pub size: usize,
}

/// One uniform block binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformBufferBinding {
    /// Block name
    pub name: String,
    /// Binding index within the set
    pub binding: u32,
    /// Stages that read the block
    pub stage: vk::ShaderStageFlags,
    /// Total block size in bytes
    pub size: usize,
    /// Members in declaration order
    pub members: Vec<UniformMember>,
}

/// One combined image sampler binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplerBinding {
    /// Sampler name as declared in the shader
    pub name: String,
    /// Binding index within the set
    pub binding: u32,
    /// Stages that sample it
    pub stage: vk::ShaderStageFlags,
}

/// Reflected binding layout of a shader's single descriptor set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UniformLayout {
    /// Uniform block bindings
    pub buffers: Vec<UniformBufferBinding>,
    /// Sampler bindings
    pub samplers: Vec<SamplerBinding>,
}

impl UniformLayout {
    /// Locate a named uniform member: (buffer index, byte offset, byte size)
    pub fn member_offset(&self, name: &str) -> Option<(usize, usize, usize)> {
        for (buffer_index, buffer) in self.buffers.iter().enumerate() {
            if let Some(member) = buffer.members.iter().find(|m| m.name == name) {
                return Some((buffer_index, member.offset, member.size));
            }
        }
        None
    }

    /// Locate a named sampler binding
    pub fn sampler_binding(&self, name: &str) -> Option<&SamplerBinding> {
        self.samplers.iter().find(|s| s.name == name)
    }
}

/// Everything needed to create a shader
pub struct ShaderDesc {
    /// Shader name for diagnostics
    pub name: String,
    /// Vertex stage source
    pub vertex_source: String,
    /// Fragment stage source
    pub fragment_source: String,
    /// Declared binding layout of the compiled modules
    pub uniform_layout: UniformLayout,
    /// Fixed-function state shared by all pipeline variants
    pub state: RenderState,
    /// Default material sort queue
    pub queue: i32,
}

/// Shader with a per-render-pass pipeline cache
pub struct Shader {
    device: Device,
    name: String,
    vertex_module: ShaderModule,
    fragment_module: ShaderModule,
    descriptor_layout: DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    pipelines: HashMap<vk::RenderPass, GraphicsPipeline>,
    uniform_layout: UniformLayout,
    state: RenderState,
    queue: i32,
}

impl Shader {
    /// Compile (or load from the byte-code cache) and create a shader
    pub fn new(
        device: Device,
        byte_cache: &ShaderByteCache,
        compiler: &dyn ShaderCompiler,
        desc: ShaderDesc,
    ) -> VulkanResult<Self> {
        let vertex_bytes =
            byte_cache.load_or_compile(&desc.vertex_source, ShaderStage::Vertex, compiler)?;
        let fragment_bytes =
            byte_cache.load_or_compile(&desc.fragment_source, ShaderStage::Fragment, compiler)?;

        let vertex_module =
            ShaderModule::from_bytes(device.clone(), &vertex_bytes, vk::ShaderStageFlags::VERTEX)?;
        let fragment_module = ShaderModule::from_bytes(
            device.clone(),
            &fragment_bytes,
            vk::ShaderStageFlags::FRAGMENT,
        )?;

        let mut layout_builder = DescriptorSetLayoutBuilder::new();
        for buffer in &desc.uniform_layout.buffers {
            layout_builder = layout_builder.uniform_buffer(buffer.binding, buffer.stage);
        }
        for sampler in &desc.uniform_layout.samplers {
            layout_builder = layout_builder.combined_image_sampler(sampler.binding, sampler.stage);
        }
        let descriptor_layout = layout_builder.build(device.clone())?;

        let set_layouts = [descriptor_layout.handle()];
        let pipeline_layout_info =
            vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
        let pipeline_layout = unsafe {
            device
                .create_pipeline_layout(&pipeline_layout_info, None)
                .map_err(VulkanError::Api)?
        };

        log::debug!("Created shader '{}'", desc.name);

        Ok(Self {
            device,
            name: desc.name,
            vertex_module,
            fragment_module,
            descriptor_layout,
            pipeline_layout,
            pipelines: HashMap::new(),
            uniform_layout: desc.uniform_layout,
            state: desc.state,
            queue: desc.queue,
        })
    }

    /// Get the pipeline for the given render pass, compiling it on first use.
    ///
    /// Distinct pass handles get distinct pipelines even when their
    /// attachment formats match.
    pub fn get_pipeline(
        &mut self,
        pipeline_cache: vk::PipelineCache,
        render_pass: vk::RenderPass,
        sample_count: vk::SampleCountFlags,
    ) -> VulkanResult<vk::Pipeline> {
        if let Some(pipeline) = self.pipelines.get(&render_pass) {
            return Ok(pipeline.handle());
        }

        let pipeline = GraphicsPipeline::new(
            self.device.clone(),
            pipeline_cache,
            self.pipeline_layout,
            render_pass,
            self.vertex_module.handle(),
            self.fragment_module.handle(),
            self.state,
            sample_count,
        )?;
        let handle = pipeline.handle();
        self.pipelines.insert(render_pass, pipeline);
        Ok(handle)
    }

    /// Purge the pipeline entry keyed by a render pass about to be destroyed
    pub fn on_render_pass_destroy(&mut self, render_pass: vk::RenderPass) {
        if self.pipelines.remove(&render_pass).is_some() {
            log::debug!(
                "Shader '{}' dropped pipeline for render pass {:?}",
                self.name,
                render_pass
            );
        }
    }

    /// Number of cached pipeline variants
    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    /// Reflected binding layout
    pub fn uniform_layout(&self) -> &UniformLayout {
        &self.uniform_layout
    }

    /// Descriptor set layout handle
    pub fn descriptor_layout(&self) -> vk::DescriptorSetLayout {
        self.descriptor_layout.handle()
    }

    /// Pipeline layout handle shared across pipeline variants
    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout
    }

    /// Default material sort queue
    pub fn queue(&self) -> i32 {
        self.queue
    }

    /// Shader name
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for Shader {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline_layout(self.pipeline_layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> UniformLayout {
        UniformLayout {
            buffers: vec![
                UniformBufferBinding {
                    name: "PerObject".to_string(),
                    binding: 0,
                    stage: vk::ShaderStageFlags::VERTEX,
                    size: 80,
                    members: vec![
                        UniformMember {
                            name: "u_model_matrix".to_string(),
                            offset: 0,
                            size: 64,
                        },
                        UniformMember {
                            name: "u_tint".to_string(),
                            offset: 64,
                            size: 16,
                        },
                    ],
                },
                UniformBufferBinding {
                    name: "PerMaterial".to_string(),
                    binding: 1,
                    stage: vk::ShaderStageFlags::FRAGMENT,
                    size: 8,
                    members: vec![
                        UniformMember {
                            name: "u_roughness".to_string(),
                            offset: 0,
                            size: 4,
                        },
                        UniformMember {
                            name: "u_metallic".to_string(),
                            offset: 4,
                            size: 4,
                        },
                    ],
                },
            ],
            samplers: vec![SamplerBinding {
                name: "u_texture".to_string(),
                binding: 2,
                stage: vk::ShaderStageFlags::FRAGMENT,
            }],
        }
    }

    #[test]
    fn test_member_offset_lookup() {
        let layout = layout();
        assert_eq!(layout.member_offset("u_model_matrix"), Some((0, 0, 64)));
        assert_eq!(layout.member_offset("u_tint"), Some((0, 64, 16)));
        assert_eq!(layout.member_offset("u_metallic"), Some((1, 4, 4)));
        assert_eq!(layout.member_offset("missing"), None);
    }

    #[test]
    fn test_sampler_lookup() {
        let layout = layout();
        assert_eq!(layout.sampler_binding("u_texture").map(|s| s.binding), Some(2));
        assert!(layout.sampler_binding("u_other").is_none());
    }
}
