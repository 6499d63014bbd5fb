//! GPU-addressable memory with host copy-in and copy-out.
//!
//! Buffers use `StorageModeShared` (unified memory), so copies are plain
//! memcpys into the pages the GPU reads.
//!
//! # In-flight hazard
//!
//! Reading a buffer while a command buffer that writes it is still executing
//! returns garbage. Two things prevent it. Dispatches borrow their buffers for
//! the lifetime of the resulting [`Submission`](crate::command::Submission),
//! and `download`, `write`, and `free` need exclusive access, so the ordinary
//! path is a compile error. Each buffer also records the command buffers it
//! was committed with, and host access blocks until those have completed,
//! so a submission that was leaked instead of waited on is still safe.

use std::ptr::NonNull;
use std::sync::{Mutex, PoisonError};

use objc2::rc::Retained;
use objc2::runtime::ProtocolObject;
use objc2_metal::{
    MTLBuffer, MTLCommandBuffer, MTLCommandBufferStatus, MTLDevice, MTLResourceOptions,
};

use crate::descriptor::Element;
use crate::device::Device;
use crate::error::{BridgeError, Result};

/// A region of GPU-visible memory.
pub struct MemoryBuffer {
    buffer: Retained<ProtocolObject<dyn MTLBuffer>>,
    len: usize,
    device_id: u64,
    in_flight: Mutex<Vec<Retained<ProtocolObject<dyn MTLCommandBuffer>>>>,
}

// SAFETY: MTLBuffer and MTLCommandBuffer handles may be shared across threads;
// host access to the contents goes through &mut self.
unsafe impl Send for MemoryBuffer {}
unsafe impl Sync for MemoryBuffer {}

impl MemoryBuffer {
    /// Reserve `byte_len` bytes of zero-filled GPU memory.
    pub fn allocate(device: &Device, byte_len: usize) -> Result<Self> {
        check_len(device, byte_len)?;
        let options = MTLResourceOptions::StorageModeShared;
        let buffer = device
            .raw()
            .newBufferWithLength_options(byte_len, options)
            .ok_or_else(|| {
                BridgeError::Allocation(format!("device refused a {byte_len}-byte buffer"))
            })?;
        log::debug!("allocated {byte_len}-byte buffer");
        Ok(Self {
            buffer,
            len: byte_len,
            device_id: device.registry_id(),
            in_flight: Mutex::new(Vec::new()),
        })
    }

    /// Copy host bytes into a new buffer of the same size.
    ///
    /// Returns once the bytes are visible to the GPU.
    pub fn upload(device: &Device, bytes: &[u8]) -> Result<Self> {
        check_len(device, bytes.len())?;
        let options = MTLResourceOptions::StorageModeShared;
        // SAFETY: `bytes` is a live slice of exactly `bytes.len()` bytes; Metal
        // copies it before returning.
        let buffer = unsafe {
            let ptr = NonNull::new(bytes.as_ptr() as *mut std::ffi::c_void)
                .ok_or_else(|| BridgeError::Allocation("null host pointer".into()))?;
            device
                .raw()
                .newBufferWithBytes_length_options(ptr, bytes.len(), options)
        }
        .ok_or_else(|| {
            BridgeError::Allocation(format!("device refused a {}-byte upload", bytes.len()))
        })?;
        log::debug!("uploaded {} bytes", bytes.len());
        Ok(Self {
            buffer,
            len: bytes.len(),
            device_id: device.registry_id(),
            in_flight: Mutex::new(Vec::new()),
        })
    }

    /// Upload a typed host slice.
    pub fn from_slice<T: Element>(device: &Device, data: &[T]) -> Result<Self> {
        Self::upload(device, as_bytes(data))
    }

    /// Allocate room for `count` zeroed elements of `T`.
    pub fn zeroed<T: Element>(device: &Device, count: usize) -> Result<Self> {
        let byte_len = count
            .checked_mul(T::SIZE)
            .ok_or_else(|| BridgeError::Allocation(format!("{count} elements overflow usize")))?;
        Self::allocate(device, byte_len)
    }

    /// Copy the first `dst.len()` bytes of the buffer into `dst`.
    ///
    /// Blocks until every command buffer this buffer was committed with has
    /// completed.
    pub fn download(&mut self, dst: &mut [u8]) -> Result<()> {
        if dst.len() > self.len {
            return Err(BridgeError::OutOfBounds {
                requested: dst.len(),
                available: self.len,
            });
        }
        self.settle();
        // SAFETY: the buffer holds `self.len >= dst.len()` bytes, `settle`
        // waited out every GPU user, and &mut self keeps new ones out.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.buffer.contents().as_ptr() as *const u8,
                dst.as_mut_ptr(),
                dst.len(),
            );
        }
        Ok(())
    }

    /// Read the whole buffer back as elements of `T`; a trailing partial element is ignored.
    pub fn to_vec<T: Element>(&mut self) -> Vec<T> {
        let count = self.len / T::SIZE;
        let mut out = vec![T::default(); count];
        self.settle();
        // SAFETY: `count * T::SIZE <= self.len`, every bit pattern is a valid T,
        // and no GPU work is still using the buffer.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.buffer.contents().as_ptr() as *const u8,
                out.as_mut_ptr() as *mut u8,
                count * T::SIZE,
            );
        }
        out
    }

    /// Overwrite the start of the buffer with host bytes.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.len {
            return Err(BridgeError::OutOfBounds {
                requested: bytes.len(),
                available: self.len,
            });
        }
        self.settle();
        // SAFETY: bounds checked above; no GPU user, as in `download`.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.buffer.contents().as_ptr() as *mut u8,
                bytes.len(),
            );
        }
        Ok(())
    }

    pub fn write_slice<T: Element>(&mut self, data: &[T]) -> Result<()> {
        self.write(as_bytes(data))
    }

    /// Release the allocation.
    ///
    /// Dropping the buffer does the same; this only makes the release point
    /// explicit at the call site.
    pub fn free(self) {
        log::debug!("freeing {}-byte buffer", self.len);
        drop(self);
    }

    /// Allocated length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false: zero-length buffers cannot be allocated.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Registry ID of the owning device.
    pub fn device_id(&self) -> u64 {
        self.device_id
    }

    /// Whether a command buffer using this buffer may still be executing. Never blocks.
    pub fn is_in_flight(&self) -> bool {
        let pending = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        pending.iter().any(|cmd| !is_finished(cmd))
    }

    pub(crate) fn raw(&self) -> &ProtocolObject<dyn MTLBuffer> {
        &self.buffer
    }

    /// Record a committed command buffer that references this buffer.
    pub(crate) fn track(&self, cmd: &Retained<ProtocolObject<dyn MTLCommandBuffer>>) {
        let mut pending = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        pending.retain(|c| !is_finished(c));
        pending.push(cmd.clone());
    }

    /// Wait for every tracked command buffer to finish.
    fn settle(&mut self) {
        let pending = self
            .in_flight
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for cmd in pending.drain(..) {
            if !is_finished(&cmd) {
                log::debug!("host access to a {}-byte buffer waits for the GPU", self.len);
                cmd.waitUntilCompleted();
            }
        }
    }
}

fn is_finished(cmd: &ProtocolObject<dyn MTLCommandBuffer>) -> bool {
    matches!(
        cmd.status(),
        MTLCommandBufferStatus::Completed | MTLCommandBufferStatus::Error
    )
}

impl std::fmt::Debug for MemoryBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBuffer")
            .field("len", &self.len)
            .field("device_id", &self.device_id)
            .finish()
    }
}

fn check_len(device: &Device, byte_len: usize) -> Result<()> {
    if byte_len == 0 {
        return Err(BridgeError::Allocation(
            "cannot allocate a zero-length buffer".into(),
        ));
    }
    if byte_len > device.max_buffer_length() {
        return Err(BridgeError::Allocation(format!(
            "{byte_len} bytes exceeds the device limit of {} bytes",
            device.max_buffer_length()
        )));
    }
    Ok(())
}

pub(crate) fn as_bytes<T: Element>(data: &[T]) -> &[u8] {
    // SAFETY: Element types are plain 4-byte scalars without padding.
    unsafe { std::slice::from_raw_parts(data.as_ptr() as *const u8, std::mem::size_of_val(data)) }
}
