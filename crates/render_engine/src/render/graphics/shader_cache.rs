//! Compiled-shader byte-code cache
//!
//! Compiling GLSL to SPIR-V is slow enough to be worth persisting. Compiled
//! byte code is stored as one flat file per content hash of the preprocessed
//! source under the configured cache directory; presence short-circuits
//! compilation entirely. The compiler itself is a collaborator supplied by
//! the embedding application.

use std::fs;
use std::path::{Path, PathBuf};

use crate::render::vulkan::{VulkanError, VulkanResult};

/// Shader stage a source string compiles for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    /// Vertex stage
    Vertex,
    /// Fragment stage
    Fragment,
}

/// Translates portable shader source into SPIR-V byte code
pub trait ShaderCompiler {
    /// Compile one source string for the given stage
    fn compile(&self, source: &str, stage: ShaderStage) -> VulkanResult<Vec<u8>>;
}

/// Flat-file cache of compiled SPIR-V keyed by source content hash
pub struct ShaderByteCache {
    dir: PathBuf,
}

impl ShaderByteCache {
    /// Open a cache rooted at `dir`, creating the directory if needed
    pub fn new(dir: impl Into<PathBuf>) -> VulkanResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| VulkanError::InvalidOperation {
            reason: format!("Failed to create shader cache dir {:?}: {}", dir, e),
        })?;
        Ok(Self { dir })
    }

    fn entry_path(&self, source: &str) -> PathBuf {
        let digest = blake3::hash(source.as_bytes());
        self.dir.join(format!("{}.cache", digest.to_hex()))
    }

    /// Fetch cached byte code for `source`, or compile and persist it
    pub fn load_or_compile(
        &self,
        source: &str,
        stage: ShaderStage,
        compiler: &dyn ShaderCompiler,
    ) -> VulkanResult<Vec<u8>> {
        let path = self.entry_path(source);

        if let Ok(bytes) = fs::read(&path) {
            log::trace!("Shader cache hit: {:?}", path.file_name());
            return Ok(bytes);
        }

        let bytes = compiler.compile(source, stage)?;

        if let Err(e) = fs::write(&path, &bytes) {
            // A failed cache write costs a recompile next run, nothing more
            log::warn!("Failed to persist shader byte code to {:?}: {}", path, e);
        } else {
            log::debug!("Shader cache store: {:?}", path.file_name());
        }

        Ok(bytes)
    }

    /// Cache directory root
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingCompiler {
        calls: AtomicUsize,
    }

    impl ShaderCompiler for CountingCompiler {
        fn compile(&self, source: &str, _stage: ShaderStage) -> VulkanResult<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(source.as_bytes().to_vec())
        }
    }

    fn temp_cache(name: &str) -> ShaderByteCache {
        let dir = std::env::temp_dir().join(format!("render_engine_shader_cache_{}", name));
        let _ = std::fs::remove_dir_all(&dir);
        ShaderByteCache::new(dir).unwrap()
    }

    #[test]
    fn test_miss_compiles_and_persists() {
        let cache = temp_cache("miss");
        let compiler = CountingCompiler {
            calls: AtomicUsize::new(0),
        };

        let bytes = cache
            .load_or_compile("void main() {}", ShaderStage::Vertex, &compiler)
            .unwrap();
        assert_eq!(bytes, b"void main() {}");
        assert_eq!(compiler.calls.load(Ordering::SeqCst), 1);

        // Second load hits the flat file, not the compiler
        let bytes = cache
            .load_or_compile("void main() {}", ShaderStage::Vertex, &compiler)
            .unwrap();
        assert_eq!(bytes, b"void main() {}");
        assert_eq!(compiler.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_distinct_sources_get_distinct_entries() {
        let cache = temp_cache("distinct");
        let compiler = CountingCompiler {
            calls: AtomicUsize::new(0),
        };

        cache
            .load_or_compile("a", ShaderStage::Vertex, &compiler)
            .unwrap();
        cache
            .load_or_compile("b", ShaderStage::Fragment, &compiler)
            .unwrap();
        assert_eq!(compiler.calls.load(Ordering::SeqCst), 2);

        let entries = std::fs::read_dir(cache.dir()).unwrap().count();
        assert_eq!(entries, 2);
    }

    #[test]
    fn test_entry_names_use_cache_suffix() {
        let cache = temp_cache("suffix");
        let compiler = CountingCompiler {
            calls: AtomicUsize::new(0),
        };
        cache
            .load_or_compile("x", ShaderStage::Vertex, &compiler)
            .unwrap();

        let entry = std::fs::read_dir(cache.dir())
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        let name = entry.file_name().into_string().unwrap();
        assert!(name.ends_with(".cache"));
    }
}
