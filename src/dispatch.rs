//! Built-in kernel dispatch: elementwise, matmul, matvecmul, softmax.
//!
//! Every operation validates its operands before touching the encoder. A
//! rejected call leaves the command buffer exactly as it was.

use crate::buffer::MemoryBuffer;
use crate::cache::{PipelineCache, PipelineKey};
use crate::command::{Binding, ComputeEncoder};
use crate::config::BridgeConfig;
use crate::descriptor::{Element, F32_SIZE};
use crate::device::Device;
use crate::error::{BridgeError, Result};
use crate::grid::Grid;
use crate::kernels::{self, BUILTIN_SOURCE, ENTRY_POINTS};
use crate::library::ComputePipeline;
use crate::shape::{
    check_elementwise, check_matrix_binding, check_vector_binding, matmul_dims, matvec_dims,
    softmax_dims,
};
use crate::types::{MatmulParams, MatvecParams, SoftmaxParams};
use crate::view::{Matrix, Vector};

/// Compiled pipelines for every entry point in [`BUILTIN_SOURCE`].
#[derive(Clone, Debug)]
pub struct BuiltinKernels {
    add: ComputePipeline,
    sub: ComputePipeline,
    mul: ComputePipeline,
    add_scalar: ComputePipeline,
    matmul: ComputePipeline,
    matvec: ComputePipeline,
    softmax: ComputePipeline,
}

impl BuiltinKernels {
    /// Compile the built-in library once and fetch every pipeline through `cache`.
    ///
    /// The library is only compiled if some entry point is not cached yet.
    pub fn compile(
        device: &Device,
        cache: &mut PipelineCache<ComputePipeline>,
        config: &BridgeConfig,
    ) -> Result<Self> {
        let key = |entry: &str| {
            PipelineKey::new(device.registry_id(), BUILTIN_SOURCE, entry)
                .with_fast_math(config.fast_math)
        };
        if ENTRY_POINTS.iter().any(|entry| cache.get(&key(*entry)).is_none()) {
            let library = device.compile_library_with(BUILTIN_SOURCE, config)?;
            cache.insert_library(device, &library, &ENTRY_POINTS)?;
        }

        let fetch = |entry: &str| -> Result<ComputePipeline> {
            cache
                .get(&key(entry))
                .cloned()
                .ok_or_else(|| BridgeError::NotFound(entry.to_string()))
        };
        Ok(Self {
            add: fetch(kernels::ADD)?,
            sub: fetch(kernels::SUB)?,
            mul: fetch(kernels::MUL)?,
            add_scalar: fetch(kernels::ADD_SCALAR)?,
            matmul: fetch(kernels::MATMUL)?,
            matvec: fetch(kernels::MATVEC)?,
            softmax: fetch(kernels::SOFTMAX)?,
        })
    }

    pub fn add(&self) -> &ComputePipeline {
        &self.add
    }

    pub fn sub(&self) -> &ComputePipeline {
        &self.sub
    }

    pub fn mul(&self) -> &ComputePipeline {
        &self.mul
    }

    pub fn add_scalar(&self) -> &ComputePipeline {
        &self.add_scalar
    }

    pub fn matmul(&self) -> &ComputePipeline {
        &self.matmul
    }

    pub fn matvec(&self) -> &ComputePipeline {
        &self.matvec
    }

    pub fn softmax(&self) -> &ComputePipeline {
        &self.softmax
    }
}

impl<'cb, 'a> ComputeEncoder<'cb, 'a> {
    /// Two inputs, one output, `count` elements of `T`.
    ///
    /// The pipeline must follow the binary binding layout: inputs at 0 and 1,
    /// output at 2, element count (`uint`) at 3.
    pub fn dispatch_binary<T: Element>(
        &mut self,
        pipeline: &ComputePipeline,
        a: &'a MemoryBuffer,
        b: &'a MemoryBuffer,
        out: &'a MemoryBuffer,
        count: usize,
    ) -> Result<()> {
        check_elementwise(
            count,
            T::SIZE,
            &[("a", a.len()), ("b", b.len()), ("out", out.len())],
        )?;
        self.dispatch(
            pipeline,
            &[
                Binding::buffer(a),
                Binding::buffer(b),
                Binding::buffer(out),
                Binding::param(&(count as u32)),
            ],
            Grid::linear(count),
        )
    }

    /// Like [`dispatch_binary`](Self::dispatch_binary), but `scalar` holds a
    /// single element that is combined with every element of `input`.
    pub fn dispatch_scalar<T: Element>(
        &mut self,
        pipeline: &ComputePipeline,
        input: &'a MemoryBuffer,
        scalar: &'a MemoryBuffer,
        out: &'a MemoryBuffer,
        count: usize,
    ) -> Result<()> {
        check_elementwise(count, T::SIZE, &[("input", input.len()), ("out", out.len())])?;
        check_elementwise(1, T::SIZE, &[("scalar", scalar.len())])?;
        self.dispatch(
            pipeline,
            &[
                Binding::buffer(input),
                Binding::buffer(scalar),
                Binding::buffer(out),
                Binding::param(&(count as u32)),
            ],
            Grid::linear(count),
        )
    }

    /// `out = op(a) * op(b)` with the built-in matmul kernel.
    pub fn matmul(
        &mut self,
        kernels: &BuiltinKernels,
        a: &Matrix<'a>,
        b: &Matrix<'a>,
        out: &Matrix<'a>,
        trans_a: bool,
        trans_b: bool,
    ) -> Result<()> {
        self.matmul_with(kernels.matmul(), a, b, out, trans_a, trans_b)
    }

    /// Matmul through any pipeline with the `bridge_matmul_f32` binding layout.
    pub fn matmul_with(
        &mut self,
        pipeline: &ComputePipeline,
        a: &Matrix<'a>,
        b: &Matrix<'a>,
        out: &Matrix<'a>,
        trans_a: bool,
        trans_b: bool,
    ) -> Result<()> {
        check_matrix_binding("A", a.descriptor(), a.buffer().len())?;
        check_matrix_binding("B", b.descriptor(), b.buffer().len())?;
        check_matrix_binding("out", out.descriptor(), out.buffer().len())?;
        let dims = matmul_dims(a.descriptor(), trans_a, b.descriptor(), trans_b, out.descriptor())?;

        // Dimensions and strides were range-checked above.
        let params = MatmulParams {
            m: dims.m as u32,
            n: dims.n as u32,
            k: dims.k as u32,
            a_stride: a.descriptor().row_stride() as u32,
            b_stride: b.descriptor().row_stride() as u32,
            c_stride: out.descriptor().row_stride() as u32,
            trans_a: trans_a as u32,
            trans_b: trans_b as u32,
        };
        self.dispatch(
            pipeline,
            &[
                Binding::buffer(a.buffer()),
                Binding::buffer(b.buffer()),
                Binding::buffer(out.buffer()),
                Binding::param(&params),
            ],
            Grid::planar(dims.n, dims.m),
        )
    }

    /// `y = op(matrix) * x`.
    pub fn matvecmul(
        &mut self,
        kernels: &BuiltinKernels,
        matrix: &Matrix<'a>,
        x: &Vector<'a>,
        y: &Vector<'a>,
        transposed: bool,
    ) -> Result<()> {
        self.matvecmul_with(kernels.matvec(), matrix, x, y, transposed)
    }

    pub fn matvecmul_with(
        &mut self,
        pipeline: &ComputePipeline,
        matrix: &Matrix<'a>,
        x: &Vector<'a>,
        y: &Vector<'a>,
        transposed: bool,
    ) -> Result<()> {
        check_matrix_binding("matrix", matrix.descriptor(), matrix.buffer().len())?;
        check_vector_binding("x", x.descriptor(), x.buffer().len())?;
        check_vector_binding("y", y.descriptor(), y.buffer().len())?;
        let dims = matvec_dims(matrix.descriptor(), transposed, x.descriptor(), y.descriptor())?;

        let params = MatvecParams {
            rows: dims.rows as u32,
            inner: dims.inner as u32,
            stride: matrix.descriptor().row_stride() as u32,
            transposed: transposed as u32,
        };
        self.dispatch(
            pipeline,
            &[
                Binding::buffer(matrix.buffer()),
                Binding::buffer(x.buffer()),
                Binding::buffer(y.buffer()),
                Binding::param(&params),
            ],
            Grid::linear(dims.rows),
        )
    }

    /// Row-wise softmax. `out` must have the same shape as `input`; strides may differ.
    pub fn softmax(
        &mut self,
        kernels: &BuiltinKernels,
        input: &Matrix<'a>,
        out: &Matrix<'a>,
    ) -> Result<()> {
        self.softmax_with(kernels.softmax(), input, out)
    }

    pub fn softmax_with(
        &mut self,
        pipeline: &ComputePipeline,
        input: &Matrix<'a>,
        out: &Matrix<'a>,
    ) -> Result<()> {
        check_matrix_binding("input", input.descriptor(), input.buffer().len())?;
        check_matrix_binding("out", out.descriptor(), out.buffer().len())?;
        let (rows, cols) = softmax_dims(input.descriptor(), out.descriptor())?;

        let params = SoftmaxParams {
            rows: rows as u32,
            cols: cols as u32,
            in_stride: input.descriptor().row_stride() as u32,
            out_stride: out.descriptor().row_stride() as u32,
        };
        self.dispatch(
            pipeline,
            &[
                Binding::buffer(input.buffer()),
                Binding::buffer(out.buffer()),
                Binding::param(&params),
            ],
            Grid::linear(rows),
        )
    }
}

/// Bytes needed for a packed `rows x cols` f32 matrix, saturating at `usize::MAX`.
pub fn packed_matrix_bytes(rows: usize, cols: usize) -> usize {
    rows.saturating_mul(cols).saturating_mul(F32_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{MatrixDescriptor, VectorDescriptor};

    struct Fixture {
        device: Device,
        queue: crate::command::CommandQueue,
        kernels: BuiltinKernels,
    }

    fn fixture() -> Option<Fixture> {
        let device = Device::system_default().ok()?;
        let queue = device.new_queue().ok()?;
        let mut cache = PipelineCache::new();
        let kernels = BuiltinKernels::compile(&device, &mut cache, &BridgeConfig::default()).ok()?;
        Some(Fixture {
            device,
            queue,
            kernels,
        })
    }

    #[test]
    fn test_builtin_compile_is_cached() {
        let Ok(device) = Device::system_default() else {
            println!("Metal not available, skipping test");
            return;
        };
        let mut cache = PipelineCache::new();
        let config = BridgeConfig::default();
        BuiltinKernels::compile(&device, &mut cache, &config).unwrap();
        assert_eq!(cache.len(), ENTRY_POINTS.len());
        let misses = cache.misses();
        BuiltinKernels::compile(&device, &mut cache, &config).unwrap();
        assert_eq!(cache.misses(), misses, "second compile must not rebuild");
    }

    #[test]
    fn test_matmul_2x3_by_3x3() {
        let Some(f) = fixture() else { return };
        let a_data: Vec<f32> = (1..=6).map(|v| v as f32).collect();
        let b_data: Vec<f32> = (1..=9).map(|v| v as f32).collect();
        let a = MemoryBuffer::from_slice(&f.device, &a_data).unwrap();
        let b = MemoryBuffer::from_slice(&f.device, &b_data).unwrap();
        let mut c = MemoryBuffer::allocate(&f.device, packed_matrix_bytes(2, 3)).unwrap();

        let mut cmd = f.queue.command_buffer().unwrap();
        let mut enc = cmd.compute_encoder().unwrap();
        enc.matmul(
            &f.kernels,
            &Matrix::packed(&a, 2, 3),
            &Matrix::packed(&b, 3, 3),
            &Matrix::packed(&c, 2, 3),
            false,
            false,
        )
        .unwrap();
        enc.end().unwrap();
        cmd.commit().unwrap().wait().unwrap();

        assert_eq!(c.to_vec::<f32>(), vec![30.0, 36.0, 42.0, 66.0, 81.0, 96.0]);
    }

    #[test]
    fn test_matmul_shape_mismatch_encodes_nothing() {
        let Some(f) = fixture() else { return };
        let a = MemoryBuffer::zeroed::<f32>(&f.device, 6).unwrap();
        let b = MemoryBuffer::zeroed::<f32>(&f.device, 6).unwrap();
        let c = MemoryBuffer::zeroed::<f32>(&f.device, 9).unwrap();

        let mut cmd = f.queue.command_buffer().unwrap();
        let mut enc = cmd.compute_encoder().unwrap();
        let err = enc
            .matmul(
                &f.kernels,
                &Matrix::packed(&a, 2, 3),
                &Matrix::packed(&b, 2, 3),
                &Matrix::packed(&c, 2, 3),
                false,
                false,
            )
            .unwrap_err();
        assert!(matches!(err, BridgeError::ShapeMismatch(_)));
        assert_eq!(enc.dispatch_count(), 0);
    }

    #[test]
    fn test_descriptor_larger_than_buffer_rejected() {
        let Some(f) = fixture() else { return };
        let small = MemoryBuffer::zeroed::<f32>(&f.device, 4).unwrap();
        let mut cmd = f.queue.command_buffer().unwrap();
        let mut enc = cmd.compute_encoder().unwrap();
        let view = Matrix::new(&small, MatrixDescriptor::packed(4, 4));
        assert!(matches!(
            enc.softmax(&f.kernels, &view, &view),
            Err(BridgeError::ShapeMismatch(_))
        ));
        assert_eq!(enc.dispatch_count(), 0);
    }

    #[test]
    fn test_matvec_transposed() {
        let Some(f) = fixture() else { return };
        // M = [[1, 2, 3], [4, 5, 6]]; M^T x with x = [1, 1]
        let m = MemoryBuffer::from_slice(&f.device, &[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let x = MemoryBuffer::from_slice(&f.device, &[1.0f32, 1.0]).unwrap();
        let mut y = MemoryBuffer::zeroed::<f32>(&f.device, 3).unwrap();

        let mut cmd = f.queue.command_buffer().unwrap();
        let mut enc = cmd.compute_encoder().unwrap();
        enc.matvecmul(
            &f.kernels,
            &Matrix::packed(&m, 2, 3),
            &Vector::new(&x, VectorDescriptor::new(2)),
            &Vector::new(&y, VectorDescriptor::new(3)),
            true,
        )
        .unwrap();
        enc.end().unwrap();
        cmd.commit().unwrap().wait().unwrap();
        assert_eq!(y.to_vec::<f32>(), vec![5.0, 7.0, 9.0]);
    }

    #[test]
    fn test_binary_count_checked() {
        let Some(f) = fixture() else { return };
        let a = MemoryBuffer::zeroed::<f32>(&f.device, 8).unwrap();
        let b = MemoryBuffer::zeroed::<f32>(&f.device, 4).unwrap();
        let out = MemoryBuffer::zeroed::<f32>(&f.device, 8).unwrap();
        let mut cmd = f.queue.command_buffer().unwrap();
        let mut enc = cmd.compute_encoder().unwrap();
        assert!(enc.dispatch_binary::<f32>(f.kernels.add(), &a, &b, &out, 8).is_err());
        assert!(enc.dispatch_binary::<f32>(f.kernels.add(), &a, &b, &out, 4).is_ok());
        assert_eq!(enc.dispatch_count(), 1);
    }

    #[test]
    fn test_add_scalar() {
        let Some(f) = fixture() else { return };
        let x = MemoryBuffer::from_slice(&f.device, &[1.0f32, 2.0, 3.0]).unwrap();
        let s = MemoryBuffer::from_slice(&f.device, &[0.5f32]).unwrap();
        let mut out = MemoryBuffer::zeroed::<f32>(&f.device, 3).unwrap();
        let mut cmd = f.queue.command_buffer().unwrap();
        let mut enc = cmd.compute_encoder().unwrap();
        enc.dispatch_scalar::<f32>(f.kernels.add_scalar(), &x, &s, &out, 3)
            .unwrap();
        enc.end().unwrap();
        cmd.commit().unwrap().wait().unwrap();
        assert_eq!(out.to_vec::<f32>(), vec![1.5, 2.5, 3.5]);
    }
}
