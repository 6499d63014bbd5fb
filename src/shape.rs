//! Dispatch-time shape validation.
//!
//! Every check runs before anything is encoded: once a command buffer is
//! committed, a GPU-side failure can only be reported for the buffer as a
//! whole, never for the dispatch that caused it.

use crate::descriptor::{MatrixDescriptor, VectorDescriptor, F32_SIZE};
use crate::error::{BridgeError, Result};

/// Resolved dimensions of `out[m x n] = op(A)[m x k] * op(B)[k x n]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MatmulDims {
    pub m: usize,
    pub n: usize,
    pub k: usize,
}

/// Resolved dimensions of `y[rows] = op(M)[rows x inner] * x[inner]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MatvecDims {
    pub rows: usize,
    pub inner: usize,
}

/// Check a matrix view against the buffer it is bound to.
pub fn check_matrix_binding(name: &str, desc: &MatrixDescriptor, buffer_len: usize) -> Result<()> {
    if desc.rows == 0 || desc.cols == 0 {
        return Err(BridgeError::shape(format!(
            "{name}: empty matrix {}x{}",
            desc.rows, desc.cols
        )));
    }
    if desc.row_bytes % F32_SIZE != 0 {
        return Err(BridgeError::shape(format!(
            "{name}: row stride {} bytes is not a multiple of {F32_SIZE}",
            desc.row_bytes
        )));
    }
    let row_span = desc.cols.checked_mul(F32_SIZE).ok_or_else(|| {
        BridgeError::shape(format!("{name}: {} columns overflow a row in bytes", desc.cols))
    })?;
    if desc.row_bytes < row_span {
        return Err(BridgeError::shape(format!(
            "{name}: row stride {} bytes cannot hold {} columns",
            desc.row_bytes, desc.cols
        )));
    }
    let extent = desc.byte_extent();
    if extent > buffer_len {
        return Err(BridgeError::shape(format!(
            "{name}: descriptor spans {extent} bytes but buffer holds {buffer_len}"
        )));
    }
    // Kernels index the whole view with 32-bit arithmetic.
    check_u32(name, extent / F32_SIZE)
}

/// Check a vector view against the buffer it is bound to.
pub fn check_vector_binding(name: &str, desc: &VectorDescriptor, buffer_len: usize) -> Result<()> {
    if desc.len == 0 {
        return Err(BridgeError::shape(format!("{name}: empty vector")));
    }
    let extent = desc.byte_extent();
    if extent > buffer_len {
        return Err(BridgeError::shape(format!(
            "{name}: descriptor spans {extent} bytes but buffer holds {buffer_len}"
        )));
    }
    check_u32(name, desc.len)
}

/// Shape law for matrix multiply, after applying the transpose flags.
pub fn matmul_dims(
    a: &MatrixDescriptor,
    trans_a: bool,
    b: &MatrixDescriptor,
    trans_b: bool,
    out: &MatrixDescriptor,
) -> Result<MatmulDims> {
    let (m, k) = a.logical_shape(trans_a);
    let (k_b, n) = b.logical_shape(trans_b);
    if k != k_b {
        return Err(BridgeError::shape(format!(
            "matmul inner dimensions disagree: A is {m}x{k}, B is {k_b}x{n}"
        )));
    }
    if (out.rows, out.cols) != (m, n) {
        return Err(BridgeError::shape(format!(
            "matmul output is {}x{}, expected {m}x{n}",
            out.rows, out.cols
        )));
    }
    Ok(MatmulDims { m, n, k })
}

/// Shape law for matrix-vector multiply, after applying the transpose flag.
pub fn matvec_dims(
    matrix: &MatrixDescriptor,
    transposed: bool,
    x: &VectorDescriptor,
    y: &VectorDescriptor,
) -> Result<MatvecDims> {
    let (rows, inner) = matrix.logical_shape(transposed);
    if x.len != inner {
        return Err(BridgeError::shape(format!(
            "matvecmul: matrix is {rows}x{inner} but input vector has {} elements",
            x.len
        )));
    }
    if y.len != rows {
        return Err(BridgeError::shape(format!(
            "matvecmul: output vector has {} elements, expected {rows}",
            y.len
        )));
    }
    Ok(MatvecDims { rows, inner })
}

/// Softmax output must match the input shape exactly.
pub fn softmax_dims(input: &MatrixDescriptor, out: &MatrixDescriptor) -> Result<(usize, usize)> {
    if (input.rows, input.cols) != (out.rows, out.cols) {
        return Err(BridgeError::shape(format!(
            "softmax output is {}x{}, input is {}x{}",
            out.rows, out.cols, input.rows, input.cols
        )));
    }
    Ok((input.rows, input.cols))
}

/// Elementwise dispatch: `count` elements of `elem_size` bytes must fit in every operand.
pub fn check_elementwise(count: usize, elem_size: usize, operands: &[(&str, usize)]) -> Result<()> {
    if count == 0 {
        return Err(BridgeError::shape("element count is zero"));
    }
    check_u32("element count", count)?;
    let needed = count.saturating_mul(elem_size);
    for (name, len) in operands {
        if needed > *len {
            return Err(BridgeError::shape(format!(
                "{name}: {count} elements need {needed} bytes but buffer holds {len}"
            )));
        }
    }
    Ok(())
}

fn check_u32(name: &str, value: usize) -> Result<()> {
    if u32::try_from(value).is_err() {
        return Err(BridgeError::shape(format!(
            "{name}: dimension {value} exceeds the kernel's 32-bit index range"
        )));
    }
    Ok(())
}
