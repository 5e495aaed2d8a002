//! Error surface for the convolution entry points.
//!
//! All validation is hoisted to entry; nothing inside the per-point loops
//! can fail.

use std::fmt;

/// Errors from the depthwise convolution entry points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvError {
    /// The packed weight container was packed for a different filter shape.
    KernelProdMismatch {
        expected: usize,
        actual: usize,
    },
}

impl fmt::Display for ConvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KernelProdMismatch { expected, actual } => write!(
                f,
                "[FBGEMM_CONV_ERROR] Packed weight is expected to have kernel_prod {expected} but has {actual}"
            ),
        }
    }
}

impl std::error::Error for ConvError {}
