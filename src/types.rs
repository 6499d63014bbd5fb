//! Kernel parameter structs.
//!
//! All param structs are #[repr(C)] and mirror the structs declared in
//! [`crate::kernels::BUILTIN_SOURCE`] field for field.

/// Values that can be passed to a kernel inline (`setBytes`).
///
/// # Safety
/// Implementors must be `#[repr(C)]` (or a primitive) with no padding bytes,
/// so that every byte of the value is initialized.
pub unsafe trait KernelParams: Copy + 'static {}

unsafe impl KernelParams for u32 {}
unsafe impl KernelParams for i32 {}
unsafe impl KernelParams for f32 {}
unsafe impl KernelParams for MatmulParams {}
unsafe impl KernelParams for MatvecParams {}
unsafe impl KernelParams for SoftmaxParams {}

/// View a parameter value as the bytes the kernel receives.
pub fn param_bytes<T: KernelParams>(value: &T) -> &[u8] {
    // SAFETY: KernelParams guarantees no padding, so every byte is initialized.
    unsafe { std::slice::from_raw_parts(value as *const T as *const u8, std::mem::size_of::<T>()) }
}

/// Parameters for `bridge_matmul_f32`. Strides are in elements.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MatmulParams {
    pub m: u32,
    pub n: u32,
    pub k: u32,
    pub a_stride: u32,
    pub b_stride: u32,
    pub c_stride: u32,
    pub trans_a: u32,
    pub trans_b: u32,
}

/// Parameters for `bridge_matvec_f32`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MatvecParams {
    /// Logical rows of op(M), i.e. the output length.
    pub rows: u32,
    /// Logical columns of op(M), i.e. the input length.
    pub inner: u32,
    pub stride: u32,
    pub transposed: u32,
}

/// Parameters for `bridge_softmax_f32`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SoftmaxParams {
    pub rows: u32,
    pub cols: u32,
    pub in_stride: u32,
    pub out_stride: u32,
}
