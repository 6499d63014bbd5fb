//! Command submission: queue -> command buffer -> compute encoder -> submission.
//!
//! Dispatches within one command buffer run in encoding order, and command
//! buffers committed to one queue run in commit order. Nothing is ordered
//! across queues unless the caller waits.
//!
//! # Completion
//!
//! [`CommandBuffer::commit`] returns a [`Submission`] that borrows every
//! [`MemoryBuffer`] the buffer's dispatches bound. Until the submission is
//! consumed by [`Submission::wait`], those buffers cannot be downloaded,
//! overwritten from the host, or freed:
//!
//! ```no_run
//! # use metal_bridge::*;
//! # fn main() -> Result<()> {
//! let device = Device::system_default()?;
//! let queue = device.new_queue()?;
//! let kernels = BuiltinKernels::compile(&device, &mut PipelineCache::new(), &BridgeConfig::default())?;
//! let a = MemoryBuffer::from_slice(&device, &[1.0f32, 2.0])?;
//! let b = MemoryBuffer::from_slice(&device, &[3.0f32, 4.0])?;
//! let mut out = MemoryBuffer::zeroed::<f32>(&device, 2)?;
//!
//! let mut cmd = queue.command_buffer()?;
//! let mut encoder = cmd.compute_encoder()?;
//! encoder.dispatch_binary::<f32>(kernels.add(), &a, &b, &out, 2)?;
//! encoder.end()?;
//! let submission = cmd.commit()?;
//! // out.to_vec::<f32>() here would not compile: `out` is still borrowed.
//! submission.wait()?;
//! assert_eq!(out.to_vec::<f32>(), vec![4.0, 6.0]);
//! # Ok(())
//! # }
//! ```

use std::marker::PhantomData;
use std::ptr::NonNull;
use std::time::Duration;

use objc2::rc::Retained;
use objc2::runtime::ProtocolObject;
use objc2_foundation::NSString;
use objc2_metal::{
    MTLCommandBuffer, MTLCommandBufferStatus, MTLCommandEncoder, MTLCommandQueue,
    MTLComputeCommandEncoder, MTLDevice, MTLSize,
};

use crate::buffer::MemoryBuffer;
use crate::config::BridgeConfig;
use crate::device::Device;
use crate::error::{non_empty_diagnostic, BridgeError, Result};
use crate::grid::Grid;
use crate::library::ComputePipeline;
use crate::state::CommandBufferState;
use crate::types::{param_bytes, KernelParams};

/// Largest inline argument Metal accepts through `setBytes`.
pub const MAX_INLINE_BYTES: usize = 4096;

/// FIFO submission channel to one device.
pub struct CommandQueue {
    queue: Retained<ProtocolObject<dyn MTLCommandQueue>>,
    device_id: u64,
    config: BridgeConfig,
}

// SAFETY: MTLCommandQueue is thread-safe per Apple documentation.
unsafe impl Send for CommandQueue {}
unsafe impl Sync for CommandQueue {}

impl Device {
    /// Create a command queue with the default configuration.
    pub fn new_queue(&self) -> Result<CommandQueue> {
        CommandQueue::new(self)
    }
}

impl CommandQueue {
    pub fn new(device: &Device) -> Result<Self> {
        Self::with_config(device, &BridgeConfig::default())
    }

    /// Create a queue whose command buffers size dispatches from `config`.
    #[allow(unused_unsafe)]
    pub fn with_config(device: &Device, config: &BridgeConfig) -> Result<Self> {
        config.validate()?;
        let queue = device
            .raw()
            .newCommandQueue()
            .ok_or(BridgeError::CommandBuffer)?;
        // SAFETY: label is copied by Metal.
        unsafe { queue.setLabel(Some(&NSString::from_str(&config.label))) };
        log::debug!("created command queue '{}'", config.label);
        Ok(Self {
            queue,
            device_id: device.registry_id(),
            config: config.clone(),
        })
    }

    /// Begin a new batch of work.
    ///
    /// `'a` is the lifetime of the buffers the batch will bind; it is chosen
    /// by the compiler from the dispatches encoded into it.
    #[allow(unused_unsafe)]
    pub fn command_buffer<'a>(&self) -> Result<CommandBuffer<'a>> {
        let cmd = self.queue.commandBuffer().ok_or(BridgeError::CommandBuffer)?;
        // SAFETY: label is copied by Metal.
        unsafe { cmd.setLabel(Some(&NSString::from_str(&self.config.label))) };
        Ok(CommandBuffer {
            cmd,
            state: CommandBufferState::Created,
            dispatches: 0,
            device_id: self.device_id,
            config: self.config.clone(),
            bound: Vec::new(),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn device_id(&self) -> u64 {
        self.device_id
    }
}

/// One batch of encoded GPU work.
pub struct CommandBuffer<'a> {
    cmd: Retained<ProtocolObject<dyn MTLCommandBuffer>>,
    state: CommandBufferState,
    dispatches: usize,
    device_id: u64,
    config: BridgeConfig,
    bound: Vec<&'a MemoryBuffer>,
}

impl<'a> CommandBuffer<'a> {
    /// Open a compute encoder. The encoder borrows the command buffer
    /// exclusively, so at most one can be open at a time.
    pub fn compute_encoder(&mut self) -> Result<ComputeEncoder<'_, 'a>> {
        let next = self.state.begin_encoding()?;
        let encoder = self
            .cmd
            .computeCommandEncoder()
            .ok_or(BridgeError::Encoder)?;
        self.state = next;
        Ok(ComputeEncoder {
            encoder,
            cmd: self,
            ended: false,
        })
    }

    /// Reserve this buffer's place in the queue without starting it.
    ///
    /// Buffers enqueued in order run in that order, regardless of commit order.
    pub fn enqueue(&mut self) -> Result<()> {
        self.state = self.state.enqueue()?;
        self.cmd.enqueue();
        Ok(())
    }

    /// Hand the buffer to the GPU and return its completion token.
    pub fn commit(self) -> Result<Submission<'a>> {
        let state = self.state.commit()?;
        self.cmd.commit();
        for buffer in &self.bound {
            buffer.track(&self.cmd);
        }
        log::debug!(
            "committed command buffer with {} dispatch(es) over {} buffer(s)",
            self.dispatches,
            self.bound.len()
        );
        Ok(Submission {
            cmd: self.cmd,
            state,
            dispatches: self.dispatches,
            waited: false,
            _buffers: PhantomData,
        })
    }

    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    /// Dispatches encoded so far.
    pub fn dispatch_count(&self) -> usize {
        self.dispatches
    }
}

/// A kernel argument.
#[derive(Debug)]
pub enum Binding<'a> {
    /// A whole memory buffer at offset 0.
    Buffer(&'a MemoryBuffer),
    /// Small inline bytes, copied into the command buffer at encode time.
    Bytes(Vec<u8>),
}

impl<'a> Binding<'a> {
    pub fn buffer(buffer: &'a MemoryBuffer) -> Self {
        Binding::Buffer(buffer)
    }

    /// Inline a parameter value.
    pub fn param<T: KernelParams>(value: &T) -> Self {
        Binding::Bytes(param_bytes(value).to_vec())
    }

    fn validate(&self, index: usize, device_id: u64) -> Result<()> {
        match self {
            Binding::Buffer(buffer) if buffer.device_id() != device_id => {
                Err(BridgeError::shape(format!(
                    "binding {index}: buffer belongs to device {:#x}, not {device_id:#x}",
                    buffer.device_id()
                )))
            }
            Binding::Bytes(bytes) if bytes.is_empty() || bytes.len() > MAX_INLINE_BYTES => {
                Err(BridgeError::shape(format!(
                    "binding {index}: inline argument of {} bytes (must be 1..={MAX_INLINE_BYTES})",
                    bytes.len()
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Records dispatches into a command buffer.
///
/// Ending the encoder (explicitly or on drop) returns the command buffer to
/// a state where it can be committed or encoded into again.
pub struct ComputeEncoder<'cb, 'a> {
    encoder: Retained<ProtocolObject<dyn MTLComputeCommandEncoder>>,
    cmd: &'cb mut CommandBuffer<'a>,
    ended: bool,
}

impl<'cb, 'a> ComputeEncoder<'cb, 'a> {
    /// Append one kernel invocation.
    ///
    /// Bindings are assigned to argument indices in slice order. Nothing is
    /// encoded unless every binding is valid.
    pub fn dispatch(
        &mut self,
        pipeline: &ComputePipeline,
        bindings: &[Binding<'a>],
        grid: Grid,
    ) -> Result<()> {
        if !self.cmd.state.accepts_dispatches() {
            return Err(BridgeError::InvalidState {
                state: self.cmd.state,
                operation: "dispatch into",
            });
        }
        if pipeline.device_id() != self.cmd.device_id {
            return Err(BridgeError::Pipeline(format!(
                "pipeline '{}' was compiled for device {:#x}, not {:#x}",
                pipeline.entry(),
                pipeline.device_id(),
                self.cmd.device_id
            )));
        }
        if grid.is_empty() {
            return Err(BridgeError::shape(format!(
                "'{}': empty grid {:?}",
                pipeline.entry(),
                grid.threads()
            )));
        }
        for (index, binding) in bindings.iter().enumerate() {
            binding.validate(index, self.cmd.device_id)?;
        }

        self.encoder.setComputePipelineState(pipeline.raw());
        for (index, binding) in bindings.iter().enumerate() {
            // SAFETY: buffers are borrowed for 'a and tracked at commit, so host
            // access waits for the GPU; inline bytes are copied by Metal here.
            unsafe {
                match binding {
                    Binding::Buffer(buffer) => {
                        self.encoder
                            .setBuffer_offset_atIndex(Some(buffer.raw()), 0, index);
                    }
                    Binding::Bytes(bytes) => {
                        let ptr = NonNull::new(bytes.as_ptr() as *mut std::ffi::c_void)
                            .ok_or_else(|| BridgeError::shape("null inline argument"))?;
                        self.encoder.setBytes_length_atIndex(ptr, bytes.len(), index);
                    }
                }
            }
        }

        let threads = grid.threads();
        let group = grid.threadgroup(&self.cmd.config, pipeline.max_total_threads_per_threadgroup());
        self.encoder.dispatchThreads_threadsPerThreadgroup(
            MTLSize {
                width: threads[0],
                height: threads[1],
                depth: threads[2],
            },
            MTLSize {
                width: group[0],
                height: group[1],
                depth: group[2],
            },
        );
        for binding in bindings {
            if let Binding::Buffer(buffer) = binding {
                if !self.cmd.bound.iter().any(|b| std::ptr::eq(*b, *buffer)) {
                    self.cmd.bound.push(*buffer);
                }
            }
        }
        self.cmd.dispatches += 1;
        log::trace!(
            "dispatch '{}' grid {:?} threadgroup {:?}",
            pipeline.entry(),
            threads,
            group
        );
        Ok(())
    }

    /// Dispatches encoded into the underlying command buffer so far.
    pub fn dispatch_count(&self) -> usize {
        self.cmd.dispatches
    }

    pub(crate) fn config(&self) -> &BridgeConfig {
        &self.cmd.config
    }

    /// Close the encoder. No further dispatches can be added through it.
    pub fn end(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        self.ended = true;
        self.encoder.endEncoding();
        self.cmd.state = self.cmd.state.end_encoding()?;
        Ok(())
    }
}

impl Drop for ComputeEncoder<'_, '_> {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            log::warn!("failed to end compute encoder: {e}");
        }
    }
}

/// Outcome of a successfully completed command buffer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Completed {
    /// Dispatches the command buffer carried.
    pub dispatches: usize,
    /// Time the GPU spent executing the buffer.
    pub gpu_time: Duration,
}

/// Completion token for a committed command buffer.
///
/// Holds the borrows of every buffer the command buffer bound. Dropping it
/// without calling [`wait`](Submission::wait) blocks until the GPU is done.
/// Leaking it ends the borrows early, but host access to those buffers still
/// waits for completion.
#[must_use = "wait on the submission to observe GPU errors"]
pub struct Submission<'a> {
    cmd: Retained<ProtocolObject<dyn MTLCommandBuffer>>,
    state: CommandBufferState,
    dispatches: usize,
    waited: bool,
    _buffers: PhantomData<&'a MemoryBuffer>,
}

impl<'a> Submission<'a> {
    /// Block until the GPU finishes this command buffer.
    ///
    /// A failure covers the buffer as a whole; Metal does not say which
    /// dispatch caused it.
    pub fn wait(mut self) -> Result<Completed> {
        self.cmd.waitUntilCompleted();
        self.waited = true;

        let failed = self.cmd.status() == MTLCommandBufferStatus::Error;
        self.state = self.state.finish(!failed)?;
        if failed {
            let message = self
                .cmd
                .error()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "command buffer completed with error status".into());
            return Err(BridgeError::GpuExecution(non_empty_diagnostic(message)));
        }

        // SAFETY: timestamps are valid once the buffer has completed.
        #[allow(unused_unsafe)]
        let seconds = unsafe { self.cmd.GPUEndTime() - self.cmd.GPUStartTime() };
        Ok(Completed {
            dispatches: self.dispatches,
            gpu_time: Duration::from_secs_f64(seconds.max(0.0)),
        })
    }

    /// Whether the GPU has finished, successfully or not. Never blocks.
    pub fn is_complete(&self) -> bool {
        matches!(
            self.cmd.status(),
            MTLCommandBufferStatus::Completed | MTLCommandBufferStatus::Error
        )
    }

    pub fn dispatch_count(&self) -> usize {
        self.dispatches
    }
}

impl Drop for Submission<'_> {
    fn drop(&mut self) {
        if !self.waited {
            log::warn!(
                "submission with {} dispatch(es) dropped without wait; blocking until the GPU finishes",
                self.dispatches
            );
            self.cmd.waitUntilCompleted();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PipelineCache;
    use crate::kernels;

    fn add_pipeline(device: &Device) -> ComputePipeline {
        let mut cache = PipelineCache::new();
        cache
            .get_or_compile(device, kernels::BUILTIN_SOURCE, kernels::ADD, &BridgeConfig::default())
            .unwrap()
            .clone()
    }

    #[test]
    fn test_empty_commit_completes() {
        let Ok(device) = Device::system_default() else {
            println!("Metal not available, skipping test");
            return;
        };
        let queue = device.new_queue().unwrap();
        let cmd = queue.command_buffer().unwrap();
        assert_eq!(cmd.state(), CommandBufferState::Created);
        let done = cmd.commit().unwrap().wait().unwrap();
        assert_eq!(done.dispatches, 0);
    }

    #[test]
    fn test_encoder_state_transitions() {
        let Ok(device) = Device::system_default() else {
            return;
        };
        let queue = device.new_queue().unwrap();
        let mut cmd = queue.command_buffer().unwrap();
        {
            let encoder = cmd.compute_encoder().unwrap();
            encoder.end().unwrap();
        }
        assert_eq!(cmd.state(), CommandBufferState::Encoded);
        {
            // Dropping an open encoder ends it.
            let _encoder = cmd.compute_encoder().unwrap();
        }
        assert_eq!(cmd.state(), CommandBufferState::Encoded);
        cmd.enqueue().unwrap();
        assert!(matches!(
            cmd.compute_encoder().err(),
            Some(BridgeError::InvalidState {
                state: CommandBufferState::Enqueued,
                ..
            })
        ));
        cmd.commit().unwrap().wait().unwrap();
    }

    #[test]
    fn test_dispatch_add() {
        let Ok(device) = Device::system_default() else {
            return;
        };
        let pipeline = add_pipeline(&device);
        let queue = device.new_queue().unwrap();
        let a = MemoryBuffer::from_slice(&device, &[1.0f32, 2.0, 3.0]).unwrap();
        let b = MemoryBuffer::from_slice(&device, &[10.0f32, 20.0, 30.0]).unwrap();
        let mut out = MemoryBuffer::zeroed::<f32>(&device, 3).unwrap();

        let mut cmd = queue.command_buffer().unwrap();
        let mut encoder = cmd.compute_encoder().unwrap();
        encoder
            .dispatch(
                &pipeline,
                &[
                    Binding::buffer(&a),
                    Binding::buffer(&b),
                    Binding::buffer(&out),
                    Binding::param(&3u32),
                ],
                Grid::linear(3),
            )
            .unwrap();
        assert_eq!(encoder.dispatch_count(), 1);
        encoder.end().unwrap();
        let done = cmd.commit().unwrap().wait().unwrap();
        assert_eq!(done.dispatches, 1);
        assert_eq!(out.to_vec::<f32>(), vec![11.0, 22.0, 33.0]);
    }

    #[test]
    fn test_invalid_bindings_encode_nothing() {
        let Ok(device) = Device::system_default() else {
            return;
        };
        let pipeline = add_pipeline(&device);
        let queue = device.new_queue().unwrap();
        let a = MemoryBuffer::zeroed::<f32>(&device, 4).unwrap();

        let mut cmd = queue.command_buffer().unwrap();
        let mut encoder = cmd.compute_encoder().unwrap();
        let too_big = Binding::Bytes(vec![0; MAX_INLINE_BYTES + 1]);
        assert!(encoder
            .dispatch(&pipeline, &[Binding::buffer(&a), too_big], Grid::linear(4))
            .is_err());
        assert!(encoder
            .dispatch(&pipeline, &[Binding::buffer(&a)], Grid::linear(0))
            .is_err());
        assert_eq!(encoder.dispatch_count(), 0);
    }

    #[test]
    fn test_dropped_submission_waits() {
        let Ok(device) = Device::system_default() else {
            return;
        };
        let queue = device.new_queue().unwrap();
        let submission = queue.command_buffer().unwrap().commit().unwrap();
        drop(submission);
    }

    #[test]
    fn test_leaked_submission_host_access_waits() {
        let Ok(device) = Device::system_default() else {
            return;
        };
        let pipeline = add_pipeline(&device);
        let queue = device.new_queue().unwrap();
        let n = 1 << 22;
        let a = MemoryBuffer::from_slice(&device, &vec![1.0f32; n]).unwrap();
        let mut out = MemoryBuffer::zeroed::<f32>(&device, n).unwrap();

        let mut cmd = queue.command_buffer().unwrap();
        let mut encoder = cmd.compute_encoder().unwrap();
        encoder
            .dispatch(
                &pipeline,
                &[
                    Binding::buffer(&a),
                    Binding::buffer(&a),
                    Binding::buffer(&out),
                    Binding::param(&(n as u32)),
                ],
                Grid::linear(n),
            )
            .unwrap();
        encoder.end().unwrap();
        // Forgetting the submission skips both `wait` and its Drop.
        std::mem::forget(cmd.commit().unwrap());

        assert!(out.to_vec::<f32>().iter().all(|&v| v == 2.0));
        assert!(!out.is_in_flight());
        assert!(!a.is_in_flight());
    }
}
