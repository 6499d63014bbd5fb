//! Matrix and vector views over memory buffers.
//!
//! A view borrows its buffer, so no buffer can be freed while a view of it
//! exists. Construction does not check the descriptor against the buffer;
//! that happens when the view is dispatched.

use crate::buffer::MemoryBuffer;
use crate::descriptor::{MatrixDescriptor, VectorDescriptor};

/// Row-major f32 matrix view.
#[derive(Clone, Copy, Debug)]
pub struct Matrix<'b> {
    buffer: &'b MemoryBuffer,
    desc: MatrixDescriptor,
}

impl<'b> Matrix<'b> {
    pub fn new(buffer: &'b MemoryBuffer, desc: MatrixDescriptor) -> Self {
        Self { buffer, desc }
    }

    /// View over a densely packed `rows x cols` buffer.
    pub fn packed(buffer: &'b MemoryBuffer, rows: usize, cols: usize) -> Self {
        Self::new(buffer, MatrixDescriptor::packed(rows, cols))
    }

    pub fn buffer(&self) -> &'b MemoryBuffer {
        self.buffer
    }

    pub fn descriptor(&self) -> &MatrixDescriptor {
        &self.desc
    }
}

/// Contiguous f32 vector view.
#[derive(Clone, Copy, Debug)]
pub struct Vector<'b> {
    buffer: &'b MemoryBuffer,
    desc: VectorDescriptor,
}

impl<'b> Vector<'b> {
    pub fn new(buffer: &'b MemoryBuffer, desc: VectorDescriptor) -> Self {
        Self { buffer, desc }
    }

    pub fn buffer(&self) -> &'b MemoryBuffer {
        self.buffer
    }

    pub fn descriptor(&self) -> &VectorDescriptor {
        &self.desc
    }
}
