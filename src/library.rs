//! Shader compilation: source -> library -> function -> pipeline.
//!
//! Each step is fallible on its own and reports the native diagnostic
//! verbatim. A library that failed to compile never yields a handle, so
//! there is nothing to resolve functions against.

use objc2::rc::Retained;
use objc2::runtime::ProtocolObject;
use objc2_foundation::NSString;
use objc2_metal::{
    MTLCompileOptions, MTLComputePipelineState, MTLDevice, MTLFunction, MTLLibrary,
};

use crate::cache::{source_hash, PipelineCache, PipelineKey};
use crate::config::BridgeConfig;
use crate::device::Device;
use crate::error::{non_empty_diagnostic, BridgeError, Result};

/// A compiled shader module.
pub struct Library {
    library: Retained<ProtocolObject<dyn MTLLibrary>>,
    device_id: u64,
    source_hash: u64,
    fast_math: bool,
}

// SAFETY: MTLLibrary is immutable once created.
unsafe impl Send for Library {}
unsafe impl Sync for Library {}

/// A named entry point resolved from a [`Library`].
pub struct Function {
    function: Retained<ProtocolObject<dyn MTLFunction>>,
    name: String,
    device_id: u64,
    source_hash: u64,
    fast_math: bool,
}

/// An executable kernel bound to one device.
///
/// Immutable once compiled; clones share the same native pipeline.
#[derive(Clone)]
pub struct ComputePipeline {
    state: Retained<ProtocolObject<dyn MTLComputePipelineState>>,
    entry: String,
    device_id: u64,
}

// SAFETY: MTLComputePipelineState is immutable and thread-safe.
unsafe impl Send for ComputePipeline {}
unsafe impl Sync for ComputePipeline {}

impl Device {
    /// Compile MSL source with default options (fast math off).
    pub fn compile_library(&self, source: &str) -> Result<Library> {
        self.compile_library_with(source, &BridgeConfig::default())
    }

    /// Compile MSL source using the compile options in `config`.
    pub fn compile_library_with(&self, source: &str, config: &BridgeConfig) -> Result<Library> {
        let options = compile_options(config);
        let ns_source = NSString::from_str(source);
        let library = self
            .raw()
            .newLibraryWithSource_options_error(&ns_source, Some(&options))
            .map_err(|e| BridgeError::Compilation(non_empty_diagnostic(e.to_string())))?;

        log::debug!(
            "compiled library ({} bytes of source, fast_math={})",
            source.len(),
            config.fast_math
        );
        Ok(Library {
            library,
            device_id: self.registry_id(),
            source_hash: source_hash(source),
            fast_math: config.fast_math,
        })
    }

    /// Compile a resolved function into a pipeline for this device.
    pub fn compile_pipeline(&self, function: &Function) -> Result<ComputePipeline> {
        if function.device_id != self.registry_id() {
            return Err(BridgeError::Pipeline(format!(
                "function '{}' belongs to device {:#x}, not {:#x}",
                function.name,
                function.device_id,
                self.registry_id()
            )));
        }
        let state = self
            .raw()
            .newComputePipelineStateWithFunction_error(&function.function)
            .map_err(|e| BridgeError::Pipeline(non_empty_diagnostic(e.to_string())))?;
        log::debug!(
            "created pipeline '{}' (max {} threads/threadgroup)",
            function.name,
            state.maxTotalThreadsPerThreadgroup()
        );
        Ok(ComputePipeline {
            state,
            entry: function.name.clone(),
            device_id: self.registry_id(),
        })
    }
}

#[allow(deprecated, unused_unsafe)]
fn compile_options(config: &BridgeConfig) -> Retained<MTLCompileOptions> {
    let options = MTLCompileOptions::new();
    // SAFETY: setting a plain flag on an options object we own.
    unsafe { options.setFastMathEnabled(config.fast_math) };
    options
}

impl Library {
    /// Look up an entry point by name.
    pub fn function(&self, name: &str) -> Result<Function> {
        let function = self
            .library
            .newFunctionWithName(&NSString::from_str(name))
            .ok_or_else(|| BridgeError::NotFound(name.to_string()))?;
        Ok(Function {
            function,
            name: name.to_string(),
            device_id: self.device_id,
            source_hash: self.source_hash,
            fast_math: self.fast_math,
        })
    }

    /// Names of every function the library defines.
    #[allow(unused_unsafe)]
    pub fn function_names(&self) -> Vec<String> {
        // SAFETY: read-only property of a live library.
        let names = unsafe { self.library.functionNames() };
        names.iter().map(|name| name.to_string()).collect()
    }

    pub fn source_hash(&self) -> u64 {
        self.source_hash
    }
}

impl Function {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cache key identifying the pipeline this function compiles to.
    pub fn pipeline_key(&self) -> PipelineKey {
        PipelineKey {
            device_id: self.device_id,
            source_hash: self.source_hash,
            entry: self.name.clone(),
            fast_math: self.fast_math,
        }
    }
}

impl ComputePipeline {
    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn device_id(&self) -> u64 {
        self.device_id
    }

    /// Largest threadgroup this pipeline can be dispatched with.
    pub fn max_total_threads_per_threadgroup(&self) -> usize {
        self.state.maxTotalThreadsPerThreadgroup()
    }

    pub fn thread_execution_width(&self) -> usize {
        self.state.threadExecutionWidth()
    }

    pub(crate) fn raw(&self) -> &ProtocolObject<dyn MTLComputePipelineState> {
        &self.state
    }
}

impl std::fmt::Debug for ComputePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputePipeline")
            .field("entry", &self.entry)
            .field("device_id", &self.device_id)
            .finish()
    }
}

impl PipelineCache<ComputePipeline> {
    /// Return the cached pipeline for `(device, source, entry)`, compiling on a miss.
    pub fn get_or_compile(
        &mut self,
        device: &Device,
        source: &str,
        entry: &str,
        config: &BridgeConfig,
    ) -> Result<&ComputePipeline> {
        let key =
            PipelineKey::new(device.registry_id(), source, entry).with_fast_math(config.fast_math);
        self.get_or_try_insert_with(key, || {
            let library = device.compile_library_with(source, config)?;
            let function = library.function(entry)?;
            device.compile_pipeline(&function)
        })
    }

    /// Cache every function of an already compiled library that is not cached yet.
    pub fn insert_library(
        &mut self,
        device: &Device,
        library: &Library,
        entries: &[&str],
    ) -> Result<()> {
        for entry in entries {
            let function = library.function(entry)?;
            self.get_or_try_insert_with(function.pipeline_key(), || {
                device.compile_pipeline(&function)
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels;

    #[test]
    fn test_compile_builtin_source() {
        let Ok(device) = Device::system_default() else {
            println!("Metal not available, skipping test");
            return;
        };
        let library = device.compile_library(kernels::BUILTIN_SOURCE).unwrap();
        let names = library.function_names();
        for entry in kernels::ENTRY_POINTS {
            assert!(names.iter().any(|n| n == entry), "missing {entry}");
            let function = library.function(entry).unwrap();
            let pipeline = device.compile_pipeline(&function).unwrap();
            assert_eq!(pipeline.entry(), entry);
            assert!(pipeline.max_total_threads_per_threadgroup() > 0);
        }
    }

    #[test]
    fn test_invalid_source_reports_diagnostic() {
        let Ok(device) = Device::system_default() else {
            return;
        };
        let err = device
            .compile_library("kernel void broken( { this is not msl")
            .err()
            .expect("invalid source must fail");
        match err {
            BridgeError::Compilation(diag) => assert!(!diag.trim().is_empty()),
            other => panic!("expected Compilation, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_function() {
        let Ok(device) = Device::system_default() else {
            return;
        };
        let library = device.compile_library(kernels::BUILTIN_SOURCE).unwrap();
        assert!(matches!(
            library.function("no_such_kernel"),
            Err(BridgeError::NotFound(name)) if name == "no_such_kernel"
        ));
    }

    #[test]
    fn test_cache_reuses_pipeline() {
        let Ok(device) = Device::system_default() else {
            return;
        };
        let config = BridgeConfig::default();
        let mut cache = PipelineCache::new();
        cache
            .get_or_compile(&device, kernels::BUILTIN_SOURCE, kernels::ADD, &config)
            .unwrap();
        cache
            .get_or_compile(&device, kernels::BUILTIN_SOURCE, kernels::ADD, &config)
            .unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.hits(), 1);

        assert!(cache
            .get_or_compile(&device, kernels::BUILTIN_SOURCE, "missing", &config)
            .is_err());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_cache_separates_fast_math() {
        let Ok(device) = Device::system_default() else {
            return;
        };
        let precise = BridgeConfig::default();
        let fast = BridgeConfig {
            fast_math: true,
            ..BridgeConfig::default()
        };
        let mut cache = PipelineCache::new();
        for config in [&precise, &fast, &precise, &fast] {
            cache
                .get_or_compile(&device, kernels::BUILTIN_SOURCE, kernels::SOFTMAX, config)
                .unwrap();
        }
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.misses(), 2);
        assert_eq!(cache.hits(), 2);

        let library = device
            .compile_library_with(kernels::BUILTIN_SOURCE, &fast)
            .unwrap();
        let key = library.function(kernels::SOFTMAX).unwrap().pipeline_key();
        assert!(key.fast_math);
        assert!(cache.get(&key).is_some());
    }
}
