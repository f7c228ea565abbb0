//! Render pass construction and clear policy
//!
//! A render pass is derived from a render-target description: attachment
//! formats, sample count, clear policy, and whether the target presents to
//! the swapchain or feeds later passes as a sampled texture. Pipelines are
//! compiled against a specific pass handle, so the recording layer treats the
//! handle as the cache key for everything built on top of it.

use ash::{vk, Device};

use crate::render::vulkan::{VulkanError, VulkanResult};

/// What a camera clears before drawing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearFlag {
    /// Previous contents are discarded without a clear
    Invalidate,
    /// Clear color, keep depth
    Color,
    /// Keep color, clear depth
    Depth,
    /// Clear both attachments
    ColorAndDepth,
    /// Keep both attachments; the caller guarantees their layouts
    Nothing,
}

/// Load ops derived from a clear flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOps {
    /// Color attachment load op
    pub color: vk::AttachmentLoadOp,
    /// Depth attachment load op
    pub depth: vk::AttachmentLoadOp,
}

/// Map a clear flag to attachment load ops
pub fn load_ops(flag: ClearFlag) -> LoadOps {
    match flag {
        ClearFlag::Color => LoadOps {
            color: vk::AttachmentLoadOp::CLEAR,
            depth: vk::AttachmentLoadOp::LOAD,
        },
        ClearFlag::Depth => LoadOps {
            color: vk::AttachmentLoadOp::LOAD,
            depth: vk::AttachmentLoadOp::CLEAR,
        },
        ClearFlag::ColorAndDepth => LoadOps {
            color: vk::AttachmentLoadOp::CLEAR,
            depth: vk::AttachmentLoadOp::CLEAR,
        },
        ClearFlag::Nothing => LoadOps {
            color: vk::AttachmentLoadOp::LOAD,
            depth: vk::AttachmentLoadOp::LOAD,
        },
        ClearFlag::Invalidate => LoadOps {
            color: vk::AttachmentLoadOp::DONT_CARE,
            depth: vk::AttachmentLoadOp::DONT_CARE,
        },
    }
}

/// Description of the render target a pass is built for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderTargetDesc {
    /// Color attachment format
    pub color_format: vk::Format,
    /// Depth attachment format, if a depth attachment exists
    pub depth_format: Option<vk::Format>,
    /// Sample count of the color attachment
    pub sample_count: vk::SampleCountFlags,
    /// Clear policy
    pub clear_flag: ClearFlag,
    /// Whether the target is a swapchain image
    pub present: bool,
}

/// Layouts for the color attachment of a pass built from `desc`
pub fn color_attachment_layouts(desc: &RenderTargetDesc) -> (vk::ImageLayout, vk::ImageLayout) {
    let ops = load_ops(desc.clear_flag);

    // Loading requires knowing what layout the previous pass left the image in
    let initial = if ops.color == vk::AttachmentLoadOp::LOAD {
        if desc.present {
            vk::ImageLayout::PRESENT_SRC_KHR
        } else if desc.sample_count != vk::SampleCountFlags::TYPE_1 {
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        } else {
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        }
    } else {
        vk::ImageLayout::UNDEFINED
    };

    // Multisample offscreen targets are resolved after the pass, so the
    // attachment stays in attachment layout for the transfer transition
    let final_layout = if desc.present {
        vk::ImageLayout::PRESENT_SRC_KHR
    } else if desc.sample_count != vk::SampleCountFlags::TYPE_1 {
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
    } else {
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
    };

    (initial, final_layout)
}

/// Layouts for the depth attachment of a pass built from `desc`
pub fn depth_attachment_layouts(desc: &RenderTargetDesc) -> (vk::ImageLayout, vk::ImageLayout) {
    let ops = load_ops(desc.clear_flag);
    let initial = if ops.depth == vk::AttachmentLoadOp::LOAD {
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
    } else {
        vk::ImageLayout::UNDEFINED
    };
    (initial, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
}

/// Render pass wrapper with RAII cleanup
pub struct RenderPass {
    device: Device,
    render_pass: vk::RenderPass,
    desc: RenderTargetDesc,
}

impl RenderPass {
    /// Create a render pass for the described target
    pub fn new(device: Device, desc: RenderTargetDesc) -> VulkanResult<Self> {
        let ops = load_ops(desc.clear_flag);
        let (color_initial, color_final) = color_attachment_layouts(&desc);

        let mut attachments = vec![vk::AttachmentDescription::builder()
            .format(desc.color_format)
            .samples(desc.sample_count)
            .load_op(ops.color)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(color_initial)
            .final_layout(color_final)
            .build()];

        let depth_ref;
        let mut has_depth = false;
        if let Some(depth_format) = desc.depth_format {
            let (depth_initial, depth_final) = depth_attachment_layouts(&desc);
            attachments.push(
                vk::AttachmentDescription::builder()
                    .format(depth_format)
                    .samples(desc.sample_count)
                    .load_op(ops.depth)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(depth_initial)
                    .final_layout(depth_final)
                    .build(),
            );
            has_depth = true;
        }

        let color_refs = [vk::AttachmentReference::builder()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .build()];

        depth_ref = vk::AttachmentReference::builder()
            .attachment(1)
            .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            .build();

        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if has_depth {
            subpass = subpass.depth_stencil_attachment(&depth_ref);
        }
        let subpasses = [subpass.build()];

        let dependency = vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            )
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            )
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            )
            .build();
        let dependencies = [dependency];

        let render_pass_create_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        let render_pass = unsafe {
            device
                .create_render_pass(&render_pass_create_info, None)
                .map_err(VulkanError::Api)?
        };

        log::debug!(
            "Created render pass {:?} for {:?} (present: {})",
            render_pass,
            desc.clear_flag,
            desc.present
        );

        Ok(Self {
            device,
            render_pass,
            desc,
        })
    }

    /// Get the render pass handle
    pub fn handle(&self) -> vk::RenderPass {
        self.render_pass
    }

    /// The target description this pass was built for
    pub fn desc(&self) -> &RenderTargetDesc {
        &self.desc
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_render_pass(self.render_pass, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(clear_flag: ClearFlag, present: bool, samples: vk::SampleCountFlags) -> RenderTargetDesc {
        RenderTargetDesc {
            color_format: vk::Format::B8G8R8A8_SRGB,
            depth_format: Some(vk::Format::D32_SFLOAT),
            sample_count: samples,
            clear_flag,
            present,
        }
    }

    #[test]
    fn test_clear_flag_load_ops() {
        assert_eq!(
            load_ops(ClearFlag::ColorAndDepth),
            LoadOps {
                color: vk::AttachmentLoadOp::CLEAR,
                depth: vk::AttachmentLoadOp::CLEAR
            }
        );
        assert_eq!(
            load_ops(ClearFlag::Color),
            LoadOps {
                color: vk::AttachmentLoadOp::CLEAR,
                depth: vk::AttachmentLoadOp::LOAD
            }
        );
        assert_eq!(
            load_ops(ClearFlag::Depth),
            LoadOps {
                color: vk::AttachmentLoadOp::LOAD,
                depth: vk::AttachmentLoadOp::CLEAR
            }
        );
        assert_eq!(
            load_ops(ClearFlag::Nothing),
            LoadOps {
                color: vk::AttachmentLoadOp::LOAD,
                depth: vk::AttachmentLoadOp::LOAD
            }
        );
        assert_eq!(
            load_ops(ClearFlag::Invalidate),
            LoadOps {
                color: vk::AttachmentLoadOp::DONT_CARE,
                depth: vk::AttachmentLoadOp::DONT_CARE
            }
        );
    }

    #[test]
    fn test_present_target_final_layout() {
        let (_, final_layout) = color_attachment_layouts(&desc(
            ClearFlag::ColorAndDepth,
            true,
            vk::SampleCountFlags::TYPE_1,
        ));
        assert_eq!(final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
    }

    #[test]
    fn test_offscreen_target_final_layout() {
        let (_, final_layout) = color_attachment_layouts(&desc(
            ClearFlag::ColorAndDepth,
            false,
            vk::SampleCountFlags::TYPE_1,
        ));
        assert_eq!(final_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }

    #[test]
    fn test_multisample_offscreen_stays_attachment_layout() {
        // The explicit resolve after the pass handles the transition to a
        // sampled layout
        let (_, final_layout) = color_attachment_layouts(&desc(
            ClearFlag::ColorAndDepth,
            false,
            vk::SampleCountFlags::TYPE_4,
        ));
        assert_eq!(final_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    }

    #[test]
    fn test_load_requires_known_initial_layout() {
        let (initial, _) =
            color_attachment_layouts(&desc(ClearFlag::Nothing, true, vk::SampleCountFlags::TYPE_1));
        assert_eq!(initial, vk::ImageLayout::PRESENT_SRC_KHR);

        let (initial, _) =
            color_attachment_layouts(&desc(ClearFlag::Nothing, false, vk::SampleCountFlags::TYPE_1));
        assert_eq!(initial, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

        let (initial, _) = color_attachment_layouts(&desc(
            ClearFlag::ColorAndDepth,
            true,
            vk::SampleCountFlags::TYPE_1,
        ));
        assert_eq!(initial, vk::ImageLayout::UNDEFINED);
    }

    #[test]
    fn test_depth_layouts() {
        let (initial, final_layout) =
            depth_attachment_layouts(&desc(ClearFlag::Color, true, vk::SampleCountFlags::TYPE_1));
        assert_eq!(initial, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
        assert_eq!(final_layout, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);

        let (initial, _) =
            depth_attachment_layouts(&desc(ClearFlag::Depth, true, vk::SampleCountFlags::TYPE_1));
        assert_eq!(initial, vk::ImageLayout::UNDEFINED);
    }
}
