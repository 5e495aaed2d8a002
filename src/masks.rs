//! Process-wide AVX2 tail-mask table.
//!
//! Entry `d` enables the first `d` dwords of a 256-bit lane for
//! `vpmaskmovd`-style loads. The micro-kernels use it to load the last
//! up-to-32-channel tile without reading past the caller's buffer.

/// Dword-granularity mask rows for `_mm256_maskload_epi32`.
pub type MaskTable = [[i32; 8]; 9];

pub static AVX2_TAIL_MASKS: MaskTable = [
    [0, 0, 0, 0, 0, 0, 0, 0],
    [-1, 0, 0, 0, 0, 0, 0, 0],
    [-1, -1, 0, 0, 0, 0, 0, 0],
    [-1, -1, -1, 0, 0, 0, 0, 0],
    [-1, -1, -1, -1, 0, 0, 0, 0],
    [-1, -1, -1, -1, -1, 0, 0, 0],
    [-1, -1, -1, -1, -1, -1, 0, 0],
    [-1, -1, -1, -1, -1, -1, -1, 0],
    [-1, -1, -1, -1, -1, -1, -1, -1],
];
