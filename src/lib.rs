//! qconv-kernels: quantized 3D depthwise convolution for CPUs.
//!
//! Computes 3x3x3 depthwise convolutions over uint8 activations and int8
//! weights with padding 1, fusing requantization (bias, ReLU, saturation)
//! into the per-point loop. Output points are classified by how their
//! window meets the tensor bounds; each boundary class gets a specialized
//! micro-kernel from a process-wide cache, so the interior (the bulk of the
//! work) runs branch-free AVX2 with a scalar fallback.
//!
//! Threading is caller-driven: spawn workers yourself and hand each one a
//! `(thread_id, num_threads)` pair; the engine partitions the output across
//! batch, depth and height and the workers never overlap.

pub mod aligned;
pub mod depthwise3d;
pub mod descriptor;
pub mod error;
pub mod kernels;
pub mod masks;
pub mod packing;
pub mod partition;
pub mod requantize;

pub use depthwise3d::{depthwise_3x3x3_pad_1, depthwise_3x3x3_per_channel_quantization_pad_1};
pub use descriptor::KernelDescriptor;
pub use error::ConvError;
pub use kernels::{Kernel, KernelCache};
pub use packing::PackedDepthwiseConvMatrix;
pub use requantize::Bias;
