//! Packed depthwise weight container.
//!
//! Source weights arrive channel-major (`K x kernel_prod`: each channel's
//! taps contiguous). The kernels want the transpose, tap-major rows with
//! all channels contiguous, so one tap contributes one wide vector load per
//! channel block. Rows are padded to a multiple of 32 channels and the
//! padding is zero-filled, which lets the tail tile use full-width loads on
//! the weight side.

use crate::aligned::AlignedBuf;

/// Channel block width of the packed rows.
pub const CHANNEL_BLOCK: usize = 32;

/// An int8 depthwise filter repacked for the vector micro-kernels.
pub struct PackedDepthwiseConvMatrix {
    k: usize,
    kernel_prod: usize,
    row_stride: usize,
    data: AlignedBuf<i8>,
}

impl PackedDepthwiseConvMatrix {
    /// Pack a `K x kernel_prod` channel-major weight matrix.
    ///
    /// `smat[ch * kernel_prod + tap]` is the weight of filter tap `tap` for
    /// channel `ch`. A 3x3x3 filter has `kernel_prod == 27` with taps in
    /// depth-major order.
    pub fn new(k: usize, kernel_prod: usize, smat: &[i8]) -> Self {
        assert!(k > 0 && kernel_prod > 0);
        assert_eq!(smat.len(), k * kernel_prod, "weight matrix size mismatch");
        let row_stride = k.div_ceil(CHANNEL_BLOCK) * CHANNEL_BLOCK;
        let mut data = AlignedBuf::<i8>::zeroed(kernel_prod * row_stride);
        let packed = data.as_mut_slice();
        for tap in 0..kernel_prod {
            let row = &mut packed[tap * row_stride..tap * row_stride + k];
            for (ch, slot) in row.iter_mut().enumerate() {
                *slot = smat[ch * kernel_prod + tap];
            }
        }
        Self {
            k,
            kernel_prod,
            row_stride,
            data,
        }
    }

    /// The packed buffer: `kernel_prod` rows of `row_stride` int8 values.
    #[inline]
    pub fn packed_mat(&self) -> &[i8] {
        self.data.as_slice()
    }

    /// Number of filter taps per channel (27 for a 3x3x3 filter).
    #[inline]
    pub fn kernel_prod(&self) -> usize {
        self.kernel_prod
    }

    /// Depthwise channel count.
    #[inline]
    pub fn channels(&self) -> usize {
        self.k
    }

    /// Bytes between consecutive tap rows.
    #[inline]
    pub fn row_stride(&self) -> usize {
        self.row_stride
    }
}
