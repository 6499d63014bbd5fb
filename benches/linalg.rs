//! Criterion benchmarks for the built-in matmul and softmax kernels.
//!
//! Measures GPU time (GPUStartTime/GPUEndTime) per committed command buffer
//! via `iter_custom`, so host-side encode cost is excluded.

#[cfg(target_os = "macos")]
mod gpu {
    use std::time::Duration;

    use criterion::{BenchmarkId, Criterion};
    use metal_bridge::{Engine, Matrix, MemoryBuffer};

    /// Deterministic pseudo-random f32 data via LCG.
    fn lcg_data(count: usize, seed: u64) -> Vec<f32> {
        let mut state = seed;
        (0..count)
            .map(|_| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                ((state >> 33) as f32 / (1u64 << 31) as f32) - 1.0
            })
            .collect()
    }

    fn square(engine: &Engine, n: usize, seed: u64) -> MemoryBuffer {
        engine
            .upload(&lcg_data(n * n, seed))
            .expect("upload benchmark matrix")
    }

    pub fn bench_matmul(c: &mut Criterion) {
        let Ok(engine) = Engine::new() else {
            eprintln!("Metal not available, skipping matmul bench");
            return;
        };
        let mut group = c.benchmark_group("matmul");
        group.sample_size(20);
        group.warm_up_time(Duration::from_secs(1));

        for n in [64usize, 256, 512] {
            let a = square(&engine, n, 42);
            let b = square(&engine, n, 137);
            let out = engine.alloc(n * n).expect("alloc output");
            group.bench_with_input(BenchmarkId::from_parameter(n), &n, |bench, &n| {
                bench.iter_custom(|iters| {
                    let mut total = Duration::ZERO;
                    for _ in 0..iters {
                        let done = engine
                            .run(|enc, k| {
                                enc.matmul(
                                    k,
                                    &Matrix::packed(&a, n, n),
                                    &Matrix::packed(&b, n, n),
                                    &Matrix::packed(&out, n, n),
                                    false,
                                    false,
                                )
                            })
                            .expect("matmul");
                        total += done.gpu_time;
                    }
                    total
                });
            });
        }
        group.finish();
    }

    pub fn bench_softmax(c: &mut Criterion) {
        let Ok(engine) = Engine::new() else {
            eprintln!("Metal not available, skipping softmax bench");
            return;
        };
        let mut group = c.benchmark_group("softmax");
        group.sample_size(20);

        for (rows, cols) in [(256usize, 256usize), (1024, 1024)] {
            let x = engine
                .upload(&lcg_data(rows * cols, 7))
                .expect("upload input");
            let out = engine.alloc(rows * cols).expect("alloc output");
            group.bench_with_input(
                BenchmarkId::new("rows_x_cols", format!("{rows}x{cols}")),
                &(rows, cols),
                |bench, &(rows, cols)| {
                    bench.iter_custom(|iters| {
                        let mut total = Duration::ZERO;
                        for _ in 0..iters {
                            let done = engine
                                .run(|enc, k| {
                                    enc.softmax(
                                        k,
                                        &Matrix::packed(&x, rows, cols),
                                        &Matrix::packed(&out, rows, cols),
                                    )
                                })
                                .expect("softmax");
                            total += done.gpu_time;
                        }
                        total
                    });
                },
            );
        }
        group.finish();
    }
}

#[cfg(target_os = "macos")]
criterion::criterion_group!(benches, gpu::bench_matmul, gpu::bench_softmax);
#[cfg(target_os = "macos")]
criterion::criterion_main!(benches);

#[cfg(not(target_os = "macos"))]
fn main() {
    eprintln!("linalg benchmarks require Metal (macOS)");
}
