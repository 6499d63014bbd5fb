//! Shape metadata for tensor views.
//!
//! Descriptors are plain values: building one never touches the GPU and never
//! checks it against a buffer. The check happens at dispatch time in
//! [`crate::shape`].

mod private {
    pub trait Sealed {}
    impl Sealed for f32 {}
    impl Sealed for u32 {}
    impl Sealed for i32 {}
}

/// Scalar types that may cross the host/device boundary.
///
/// Sealed: every bit pattern of these types is a valid value, so reading GPU
/// memory back as `&[T]` is sound.
pub trait Element: private::Sealed + Copy + Default + 'static {
    /// Size in bytes.
    const SIZE: usize;
}

impl Element for f32 {
    const SIZE: usize = 4;
}

impl Element for u32 {
    const SIZE: usize = 4;
}

impl Element for i32 {
    const SIZE: usize = 4;
}

/// Size of the element type used by the built-in linear-algebra kernels.
pub const F32_SIZE: usize = <f32 as Element>::SIZE;

/// Row-major matrix layout: rows, columns, and the byte distance between rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MatrixDescriptor {
    pub rows: usize,
    pub cols: usize,
    pub row_bytes: usize,
}

impl MatrixDescriptor {
    pub fn new(rows: usize, cols: usize, row_bytes: usize) -> Self {
        Self {
            rows,
            cols,
            row_bytes,
        }
    }

    /// Densely packed f32 rows (`row_bytes == cols * 4`).
    ///
    /// An overflowing row saturates, which no binding check accepts.
    pub fn packed(rows: usize, cols: usize) -> Self {
        Self::new(rows, cols, cols.saturating_mul(F32_SIZE))
    }

    /// Bytes of backing memory the view may touch.
    pub fn byte_extent(&self) -> usize {
        self.rows.saturating_mul(self.row_bytes)
    }

    /// Row stride in elements. Only meaningful once the stride is validated.
    pub fn row_stride(&self) -> usize {
        self.row_bytes / F32_SIZE
    }

    /// `(rows, cols)` as seen by an operation, after optional transposition.
    pub fn logical_shape(&self, transposed: bool) -> (usize, usize) {
        if transposed {
            (self.cols, self.rows)
        } else {
            (self.rows, self.cols)
        }
    }

    /// Saturates at `usize::MAX`.
    pub fn element_count(&self) -> usize {
        self.rows.saturating_mul(self.cols)
    }
}

/// Contiguous f32 vector layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VectorDescriptor {
    pub len: usize,
}

impl VectorDescriptor {
    pub fn new(len: usize) -> Self {
        Self { len }
    }

    pub fn byte_extent(&self) -> usize {
        self.len.saturating_mul(F32_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packed_descriptor() {
        let d = MatrixDescriptor::packed(2, 3);
        assert_eq!(d.row_bytes, 12);
        assert_eq!(d.byte_extent(), 24);
        assert_eq!(d.row_stride(), 3);
        assert_eq!(d.element_count(), 6);
    }

    #[test]
    fn test_padded_rows_extent() {
        // 3 floats per row padded out to 16 bytes
        let d = MatrixDescriptor::new(4, 3, 16);
        assert_eq!(d.byte_extent(), 64);
        assert_eq!(d.row_stride(), 4);
    }

    #[test]
    fn test_logical_shape_transpose() {
        let d = MatrixDescriptor::packed(2, 5);
        assert_eq!(d.logical_shape(false), (2, 5));
        assert_eq!(d.logical_shape(true), (5, 2));
    }

    #[test]
    fn test_extent_saturates() {
        let d = MatrixDescriptor::new(usize::MAX, 1, 8);
        assert_eq!(d.byte_extent(), usize::MAX);
        assert_eq!(VectorDescriptor::new(usize::MAX).byte_extent(), usize::MAX);
    }

    #[test]
    fn test_huge_shapes_saturate() {
        let d = MatrixDescriptor::packed(2, usize::MAX / 2);
        assert_eq!(d.row_bytes, usize::MAX);
        assert_eq!(d.byte_extent(), usize::MAX);
        assert_eq!(MatrixDescriptor::packed(1 << 40, 1 << 40).element_count(), usize::MAX);
    }

    #[test]
    fn test_vector_extent() {
        assert_eq!(VectorDescriptor::new(7).byte_extent(), 28);
    }
}
