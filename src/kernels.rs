//! Metal Shading Language source for the built-in kernels.
//!
//! Compiled at runtime with `newLibraryWithSource`, so there is no build.rs
//! step and no metallib to locate.
//!
//! Binary kernels share one binding layout, which `dispatch_binary` also
//! expects from user pipelines: inputs at buffers 0 and 1, output at 2, and
//! the element count as a `uint` at index 3.

pub const ADD: &str = "bridge_add_f32";
pub const SUB: &str = "bridge_sub_f32";
pub const MUL: &str = "bridge_mul_f32";
/// Adds the single float in buffer 1 to every element of buffer 0.
pub const ADD_SCALAR: &str = "bridge_add_scalar_f32";
pub const MATMUL: &str = "bridge_matmul_f32";
pub const MATVEC: &str = "bridge_matvec_f32";
pub const SOFTMAX: &str = "bridge_softmax_f32";

/// Every entry point defined in [`BUILTIN_SOURCE`].
pub const ENTRY_POINTS: [&str; 7] = [ADD, SUB, MUL, ADD_SCALAR, MATMUL, MATVEC, SOFTMAX];

pub const BUILTIN_SOURCE: &str = r#"
#include <metal_stdlib>
using namespace metal;

struct MatmulParams {
    uint m;
    uint n;
    uint k;
    uint a_stride;
    uint b_stride;
    uint c_stride;
    uint trans_a;
    uint trans_b;
};

struct MatvecParams {
    uint rows;
    uint inner;
    uint stride;
    uint transposed;
};

struct SoftmaxParams {
    uint rows;
    uint cols;
    uint in_stride;
    uint out_stride;
};

kernel void bridge_add_f32(
    device const float* in_a   [[buffer(0)]],
    device const float* in_b   [[buffer(1)]],
    device       float* result [[buffer(2)]],
    constant     uint&  count  [[buffer(3)]],
    uint index [[thread_position_in_grid]])
{
    if (index >= count) return;
    result[index] = in_a[index] + in_b[index];
}

kernel void bridge_sub_f32(
    device const float* in_a   [[buffer(0)]],
    device const float* in_b   [[buffer(1)]],
    device       float* result [[buffer(2)]],
    constant     uint&  count  [[buffer(3)]],
    uint index [[thread_position_in_grid]])
{
    if (index >= count) return;
    result[index] = in_a[index] - in_b[index];
}

kernel void bridge_mul_f32(
    device const float* in_a   [[buffer(0)]],
    device const float* in_b   [[buffer(1)]],
    device       float* result [[buffer(2)]],
    constant     uint&  count  [[buffer(3)]],
    uint index [[thread_position_in_grid]])
{
    if (index >= count) return;
    result[index] = in_a[index] * in_b[index];
}

kernel void bridge_add_scalar_f32(
    device const float* in_vec    [[buffer(0)]],
    device const float* in_scalar [[buffer(1)]],
    device       float* result    [[buffer(2)]],
    constant     uint&  count     [[buffer(3)]],
    uint index [[thread_position_in_grid]])
{
    if (index >= count) return;
    result[index] = in_vec[index] + *in_scalar;
}

// out[row, col] = sum_i op(A)[row, i] * op(B)[i, col]
// op() reads the stored matrix transposed when the flag is set.
kernel void bridge_matmul_f32(
    device const float*   A [[buffer(0)]],
    device const float*   B [[buffer(1)]],
    device       float*   C [[buffer(2)]],
    constant MatmulParams& p [[buffer(3)]],
    uint2 gid [[thread_position_in_grid]])
{
    uint col = gid.x;
    uint row = gid.y;
    if (row >= p.m || col >= p.n) return;

    float acc = 0.0f;
    for (uint i = 0; i < p.k; ++i) {
        float a = p.trans_a ? A[i * p.a_stride + row] : A[row * p.a_stride + i];
        float b = p.trans_b ? B[col * p.b_stride + i] : B[i * p.b_stride + col];
        acc = fma(a, b, acc);
    }
    C[row * p.c_stride + col] = acc;
}

kernel void bridge_matvec_f32(
    device const float*   M [[buffer(0)]],
    device const float*   x [[buffer(1)]],
    device       float*   y [[buffer(2)]],
    constant MatvecParams& p [[buffer(3)]],
    uint row [[thread_position_in_grid]])
{
    if (row >= p.rows) return;

    float acc = 0.0f;
    for (uint i = 0; i < p.inner; ++i) {
        float m = p.transposed ? M[i * p.stride + row] : M[row * p.stride + i];
        acc = fma(m, x[i], acc);
    }
    y[row] = acc;
}

// One thread per row; max-subtracted for stability.
kernel void bridge_softmax_f32(
    device const float*    X [[buffer(0)]],
    device       float*    Y [[buffer(1)]],
    constant SoftmaxParams& p [[buffer(2)]],
    uint row [[thread_position_in_grid]])
{
    if (row >= p.rows) return;
    device const float* x = X + row * p.in_stride;
    device       float* y = Y + row * p.out_stride;

    float row_max = x[0];
    for (uint c = 1; c < p.cols; ++c) {
        row_max = max(row_max, x[c]);
    }

    float sum = 0.0f;
    for (uint c = 0; c < p.cols; ++c) {
        float e = exp(x[c] - row_max);
        y[c] = e;
        sum += e;
    }

    float inv = 1.0f / sum;
    for (uint c = 0; c < p.cols; ++c) {
        y[c] *= inv;
    }
}
"#;
