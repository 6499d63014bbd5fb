//! Synchronous convenience layer over the bridge.
//!
//! `Engine` owns a device, one queue, a pipeline cache, and the compiled
//! built-in kernels. Each operation encodes into a fresh command buffer,
//! commits it, and waits, so results are ready to read when it returns.

use crate::buffer::MemoryBuffer;
use crate::cache::PipelineCache;
use crate::command::{CommandQueue, Completed, ComputeEncoder};
use crate::config::BridgeConfig;
use crate::descriptor::{MatrixDescriptor, VectorDescriptor, F32_SIZE};
use crate::device::Device;
use crate::dispatch::BuiltinKernels;
use crate::error::{BridgeError, Result};
use crate::library::ComputePipeline;
use crate::shape::{check_matrix_binding, check_vector_binding, matmul_dims, matvec_dims};
use crate::view::{Matrix, Vector};

/// Blocking front end that runs the built-in kernels on one device.
pub struct Engine {
    device: Device,
    queue: CommandQueue,
    cache: PipelineCache<ComputePipeline>,
    kernels: BuiltinKernels,
    config: BridgeConfig,
}

impl Engine {
    /// Engine on the system default device with default configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(BridgeConfig::default())
    }

    pub fn with_config(config: BridgeConfig) -> Result<Self> {
        Self::with_device(Device::system_default()?, config)
    }

    /// Create the queue and compile the built-in kernels for `device`.
    pub fn with_device(device: Device, config: BridgeConfig) -> Result<Self> {
        config.validate()?;
        let queue = CommandQueue::with_config(&device, &config)?;
        let mut cache = PipelineCache::new();
        let kernels = BuiltinKernels::compile(&device, &mut cache, &config)?;
        log::info!(
            "engine ready on '{}' ({} built-in pipelines)",
            device.name(),
            cache.len()
        );
        Ok(Self {
            device,
            queue,
            cache,
            kernels,
            config,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn kernels(&self) -> &BuiltinKernels {
        &self.kernels
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn cache(&self) -> &PipelineCache<ComputePipeline> {
        &self.cache
    }

    /// Compile (or fetch from the cache) a pipeline from custom source.
    pub fn pipeline(&mut self, source: &str, entry: &str) -> Result<ComputePipeline> {
        self.cache
            .get_or_compile(&self.device, source, entry, &self.config)
            .cloned()
    }

    /// Upload a host slice of f32.
    pub fn upload(&self, data: &[f32]) -> Result<MemoryBuffer> {
        MemoryBuffer::from_slice(&self.device, data)
    }

    /// Zero-filled buffer of `count` f32 elements.
    pub fn alloc(&self, count: usize) -> Result<MemoryBuffer> {
        MemoryBuffer::zeroed::<f32>(&self.device, count)
    }

    /// Encode several dispatches into one command buffer, then commit and wait.
    ///
    /// Dispatches run in the order the closure encodes them.
    pub fn run<'a, F>(&self, encode: F) -> Result<Completed>
    where
        F: for<'cb> FnOnce(&mut ComputeEncoder<'cb, 'a>, &BuiltinKernels) -> Result<()>,
    {
        let mut cmd = self.queue.command_buffer()?;
        {
            let mut encoder = cmd.compute_encoder()?;
            encode(&mut encoder, &self.kernels)?;
            encoder.end()?;
        }
        cmd.commit()?.wait()
    }

    pub fn add(&self, a: &MemoryBuffer, b: &MemoryBuffer) -> Result<MemoryBuffer> {
        self.binary(a, b, |engine, a, b, out, n| engine.add_into(a, b, out, n))
    }

    pub fn sub(&self, a: &MemoryBuffer, b: &MemoryBuffer) -> Result<MemoryBuffer> {
        self.binary(a, b, |engine, a, b, out, n| engine.sub_into(a, b, out, n))
    }

    pub fn mul(&self, a: &MemoryBuffer, b: &MemoryBuffer) -> Result<MemoryBuffer> {
        self.binary(a, b, |engine, a, b, out, n| engine.mul_into(a, b, out, n))
    }

    /// `out[i] = a[i] + b[i]` for the first `count` elements.
    pub fn add_into(
        &self,
        a: &MemoryBuffer,
        b: &MemoryBuffer,
        out: &MemoryBuffer,
        count: usize,
    ) -> Result<()> {
        self.run(|enc, k| enc.dispatch_binary::<f32>(k.add(), a, b, out, count))
            .map(drop)
    }

    pub fn sub_into(
        &self,
        a: &MemoryBuffer,
        b: &MemoryBuffer,
        out: &MemoryBuffer,
        count: usize,
    ) -> Result<()> {
        self.run(|enc, k| enc.dispatch_binary::<f32>(k.sub(), a, b, out, count))
            .map(drop)
    }

    pub fn mul_into(
        &self,
        a: &MemoryBuffer,
        b: &MemoryBuffer,
        out: &MemoryBuffer,
        count: usize,
    ) -> Result<()> {
        self.run(|enc, k| enc.dispatch_binary::<f32>(k.mul(), a, b, out, count))
            .map(drop)
    }

    /// Add `scalar` to every element of `x`.
    pub fn add_scalar(&self, x: &MemoryBuffer, scalar: f32) -> Result<MemoryBuffer> {
        let count = f32_count("x", x)?;
        let out = self.alloc(count)?;
        self.add_scalar_into(x, scalar, &out, count)?;
        Ok(out)
    }

    pub fn add_scalar_into(
        &self,
        x: &MemoryBuffer,
        scalar: f32,
        out: &MemoryBuffer,
        count: usize,
    ) -> Result<()> {
        let scalar = self.upload(&[scalar])?;
        self.run(|enc, k| enc.dispatch_scalar::<f32>(k.add_scalar(), x, &scalar, out, count))
            .map(drop)
    }

    /// `op(a) * op(b)` into a new packed matrix.
    pub fn matmul(
        &self,
        a: &Matrix<'_>,
        b: &Matrix<'_>,
        trans_a: bool,
        trans_b: bool,
    ) -> Result<(MemoryBuffer, MatrixDescriptor)> {
        check_matrix_binding("A", a.descriptor(), a.buffer().len())?;
        check_matrix_binding("B", b.descriptor(), b.buffer().len())?;
        let (m, _) = a.descriptor().logical_shape(trans_a);
        let (_, n) = b.descriptor().logical_shape(trans_b);
        let desc = MatrixDescriptor::packed(m, n);
        matmul_dims(a.descriptor(), trans_a, b.descriptor(), trans_b, &desc)?;

        let out = self.alloc(desc.element_count())?;
        self.matmul_into(a, b, &Matrix::new(&out, desc), trans_a, trans_b)?;
        Ok((out, desc))
    }

    pub fn matmul_into(
        &self,
        a: &Matrix<'_>,
        b: &Matrix<'_>,
        out: &Matrix<'_>,
        trans_a: bool,
        trans_b: bool,
    ) -> Result<()> {
        self.run(|enc, k| enc.matmul(k, a, b, out, trans_a, trans_b))
            .map(drop)
    }

    /// `op(matrix) * x` into a new vector.
    pub fn matvecmul(
        &self,
        matrix: &Matrix<'_>,
        x: &Vector<'_>,
        transposed: bool,
    ) -> Result<(MemoryBuffer, VectorDescriptor)> {
        check_matrix_binding("matrix", matrix.descriptor(), matrix.buffer().len())?;
        check_vector_binding("x", x.descriptor(), x.buffer().len())?;
        let (rows, _) = matrix.descriptor().logical_shape(transposed);
        let desc = VectorDescriptor::new(rows);
        matvec_dims(matrix.descriptor(), transposed, x.descriptor(), &desc)?;

        let out = self.alloc(rows)?;
        self.matvecmul_into(matrix, x, &Vector::new(&out, desc), transposed)?;
        Ok((out, desc))
    }

    pub fn matvecmul_into(
        &self,
        matrix: &Matrix<'_>,
        x: &Vector<'_>,
        y: &Vector<'_>,
        transposed: bool,
    ) -> Result<()> {
        self.run(|enc, k| enc.matvecmul(k, matrix, x, y, transposed))
            .map(drop)
    }

    /// Row-wise softmax into a new packed matrix of the same shape.
    pub fn softmax(&self, input: &Matrix<'_>) -> Result<(MemoryBuffer, MatrixDescriptor)> {
        let shape = input.descriptor();
        check_matrix_binding("input", shape, input.buffer().len())?;
        let desc = MatrixDescriptor::packed(shape.rows, shape.cols);
        let out = self.alloc(desc.element_count())?;
        self.softmax_into(input, &Matrix::new(&out, desc))?;
        Ok((out, desc))
    }

    pub fn softmax_into(&self, input: &Matrix<'_>, out: &Matrix<'_>) -> Result<()> {
        self.run(|enc, k| enc.softmax(k, input, out)).map(drop)
    }

    fn binary(
        &self,
        a: &MemoryBuffer,
        b: &MemoryBuffer,
        op: impl FnOnce(&Self, &MemoryBuffer, &MemoryBuffer, &MemoryBuffer, usize) -> Result<()>,
    ) -> Result<MemoryBuffer> {
        let count = f32_count("a", a)?;
        if b.len() != a.len() {
            return Err(BridgeError::shape(format!(
                "operands differ in length: a is {} bytes, b is {}",
                a.len(),
                b.len()
            )));
        }
        let out = self.alloc(count)?;
        op(self, a, b, &out, count)?;
        Ok(out)
    }
}

fn f32_count(name: &str, buffer: &MemoryBuffer) -> Result<usize> {
    if buffer.len() % F32_SIZE != 0 {
        return Err(BridgeError::shape(format!(
            "{name}: {} bytes is not a whole number of f32 elements",
            buffer.len()
        )));
    }
    Ok(buffer.len() / F32_SIZE)
}
