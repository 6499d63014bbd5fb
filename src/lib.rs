//! metal-bridge: a minimal Metal compute bridge.
//!
//! Device discovery, GPU memory buffers, matrix/vector views over them,
//! runtime shader compilation, and command submission, with matmul,
//! matvecmul, and softmax built on top.
//!
//! ```text
//! Device -> CommandQueue -> CommandBuffer -> ComputeEncoder -> dispatch(..)
//!                                 |
//!                              commit() -> Submission -> wait() -> download
//! ```
//!
//! # Synchronization
//!
//! GPU work runs asynchronously after `commit`. Reading a buffer that an
//! in-flight command buffer still writes would be a data race, so
//! `commit` returns a [`Submission`] that keeps every bound
//! [`MemoryBuffer`] borrowed. [`MemoryBuffer::download`], `write`, and
//! `free` need exclusive access and therefore only compile after
//! [`Submission::wait`] has consumed the token. A leaked token does not
//! reopen the race: host access also blocks on any command buffer the
//! buffer was committed with that has not finished.
//!
//! The Metal-bound modules are only built on macOS. Descriptors, shape
//! validation, the command buffer state machine, the pipeline cache,
//! configuration, and the kernel source are platform independent.

pub mod cache;
pub mod caps;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod grid;
pub mod kernels;
pub mod shape;
pub mod state;
pub mod types;

#[cfg(target_os = "macos")]
pub mod buffer;
#[cfg(target_os = "macos")]
pub mod command;
#[cfg(target_os = "macos")]
pub mod device;
#[cfg(target_os = "macos")]
pub mod dispatch;
#[cfg(target_os = "macos")]
pub mod engine;
#[cfg(target_os = "macos")]
pub mod library;
#[cfg(target_os = "macos")]
pub mod view;

pub use cache::{PipelineCache, PipelineKey};
pub use caps::{DeviceInfo, GpuFamily};
pub use config::BridgeConfig;
pub use descriptor::{Element, MatrixDescriptor, VectorDescriptor};
pub use error::{BridgeError, Result};
pub use grid::Grid;
pub use state::CommandBufferState;

#[cfg(target_os = "macos")]
pub use buffer::MemoryBuffer;
#[cfg(target_os = "macos")]
pub use command::{Binding, CommandBuffer, CommandQueue, Completed, ComputeEncoder, Submission};
#[cfg(target_os = "macos")]
pub use device::Device;
#[cfg(target_os = "macos")]
pub use dispatch::BuiltinKernels;
#[cfg(target_os = "macos")]
pub use engine::Engine;
#[cfg(target_os = "macos")]
pub use library::{ComputePipeline, Function, Library};
#[cfg(target_os = "macos")]
pub use view::{Matrix, Vector};
