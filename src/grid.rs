//! Dispatch grid and threadgroup sizing.

use crate::config::BridgeConfig;

/// Number of threads a dispatch launches. One thread per output element.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Grid {
    /// `n` threads along x.
    Linear(usize),
    /// `width x height` threads; x runs along columns, y along rows.
    Planar { width: usize, height: usize },
}

impl Grid {
    pub fn linear(threads: usize) -> Self {
        Grid::Linear(threads)
    }

    pub fn planar(width: usize, height: usize) -> Self {
        Grid::Planar { width, height }
    }

    /// Grid extent as `[width, height, depth]`.
    pub fn threads(&self) -> [usize; 3] {
        match *self {
            Grid::Linear(n) => [n, 1, 1],
            Grid::Planar { width, height } => [width, height, 1],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.threads().iter().any(|&d| d == 0)
    }

    /// Threadgroup shape for this grid.
    ///
    /// 1D grids use the configured width clamped to what the pipeline allows.
    /// 2D grids use square tiles, halved until they fit the pipeline.
    pub fn threadgroup(&self, config: &BridgeConfig, pipeline_max: usize) -> [usize; 3] {
        let pipeline_max = pipeline_max.max(1);
        match self {
            Grid::Linear(_) => [config.max_threads_per_threadgroup.min(pipeline_max).max(1), 1, 1],
            Grid::Planar { .. } => {
                let mut side = config.tile_side.max(1);
                while side > 1 && side * side > pipeline_max {
                    side /= 2;
                }
                [side, side, 1]
            }
        }
    }
}
