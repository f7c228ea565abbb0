//! Graphics backend capability interface
//!
//! Display, Camera, and Shader consult this interface instead of branching on
//! a compile-time backend selection. Exactly one implementation is selected at
//! startup; today that is the Vulkan context.

use ash::vk;

/// Capabilities and format decisions a backend exposes to the recording layer
#[derive(Debug, Clone, Copy)]
pub struct BackendCapabilities {
    /// Highest supported color sample count
    pub max_color_samples: vk::SampleCountFlags,
    /// Required alignment for uniform buffer offsets
    pub min_uniform_buffer_alignment: u64,
    /// Whether anisotropic sampling is available
    pub sampler_anisotropy: bool,
}

/// Backend capability interface implemented once per graphics API
pub trait GraphicsBackend {
    /// Human-readable adapter name for diagnostics
    fn adapter_name(&self) -> String;

    /// Static capability queries
    fn capabilities(&self) -> BackendCapabilities;

    /// Depth format this backend renders depth attachments in
    fn depth_format(&self) -> vk::Format;

    /// Clamp a requested sample count to what the adapter supports
    fn clamp_sample_count(&self, requested: u32) -> vk::SampleCountFlags {
        let supported = self.capabilities().max_color_samples;
        let wanted = match requested {
            n if n >= 8 => vk::SampleCountFlags::TYPE_8,
            n if n >= 4 => vk::SampleCountFlags::TYPE_4,
            n if n >= 2 => vk::SampleCountFlags::TYPE_2,
            _ => vk::SampleCountFlags::TYPE_1,
        };

        for candidate in [
            vk::SampleCountFlags::TYPE_8,
            vk::SampleCountFlags::TYPE_4,
            vk::SampleCountFlags::TYPE_2,
        ] {
            if wanted.contains(candidate) && supported.contains(candidate) {
                return candidate;
            }
        }
        vk::SampleCountFlags::TYPE_1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedCaps(BackendCapabilities);

    impl GraphicsBackend for FixedCaps {
        fn adapter_name(&self) -> String {
            "test".to_string()
        }

        fn capabilities(&self) -> BackendCapabilities {
            self.0
        }

        fn depth_format(&self) -> vk::Format {
            vk::Format::D32_SFLOAT
        }
    }

    fn backend_with_max(max: vk::SampleCountFlags) -> FixedCaps {
        FixedCaps(BackendCapabilities {
            max_color_samples: max,
            min_uniform_buffer_alignment: 256,
            sampler_anisotropy: true,
        })
    }

    #[test]
    fn test_sample_count_clamps_to_supported() {
        let backend = backend_with_max(
            vk::SampleCountFlags::TYPE_1 | vk::SampleCountFlags::TYPE_2 | vk::SampleCountFlags::TYPE_4,
        );
        assert_eq!(backend.clamp_sample_count(8), vk::SampleCountFlags::TYPE_4);
        assert_eq!(backend.clamp_sample_count(4), vk::SampleCountFlags::TYPE_4);
        assert_eq!(backend.clamp_sample_count(2), vk::SampleCountFlags::TYPE_2);
        assert_eq!(backend.clamp_sample_count(1), vk::SampleCountFlags::TYPE_1);
        assert_eq!(backend.clamp_sample_count(0), vk::SampleCountFlags::TYPE_1);
    }

    #[test]
    fn test_sample_count_single_sample_adapter() {
        let backend = backend_with_max(vk::SampleCountFlags::TYPE_1);
        assert_eq!(backend.clamp_sample_count(8), vk::SampleCountFlags::TYPE_1);
    }
}
