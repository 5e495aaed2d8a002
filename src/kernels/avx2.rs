//! AVX2 micro-kernel body.
//!
//! Channels are processed in 32-wide blocks of four 8-lane i32 groups. The
//! activation tile is loaded with a dword tail mask so the last block never
//! reads past the caller's buffer; the weight rows are padded to the block
//! width at packing time, so they always take full loads. Boundary skips
//! are loop bounds baked in through the descriptor, so the tap loop carries
//! no per-element boundary tests.

#![cfg(target_arch = "x86_64")]

use std::arch::x86_64::*;

use crate::descriptor::KernelDescriptor;
use crate::masks::MaskTable;
use crate::packing::CHANNEL_BLOCK;

/// Widen 32 unsigned bytes to four 8-lane i32 vectors.
#[target_feature(enable = "avx2")]
#[inline]
unsafe fn widen_u8(v: __m256i) -> [__m256i; 4] {
    let lo = _mm256_castsi256_si128(v);
    let hi = _mm256_extracti128_si256::<1>(v);
    [
        _mm256_cvtepu8_epi32(lo),
        _mm256_cvtepu8_epi32(_mm_srli_si128::<8>(lo)),
        _mm256_cvtepu8_epi32(hi),
        _mm256_cvtepu8_epi32(_mm_srli_si128::<8>(hi)),
    ]
}

/// Widen 32 signed bytes to four 8-lane i32 vectors.
#[target_feature(enable = "avx2")]
#[inline]
unsafe fn widen_i8(v: __m256i) -> [__m256i; 4] {
    let lo = _mm256_castsi256_si128(v);
    let hi = _mm256_extracti128_si256::<1>(v);
    [
        _mm256_cvtepi8_epi32(lo),
        _mm256_cvtepi8_epi32(_mm_srli_si128::<8>(lo)),
        _mm256_cvtepi8_epi32(hi),
        _mm256_cvtepi8_epi32(_mm_srli_si128::<8>(hi)),
    ]
}

/// Plain-fn entry so the body can sit behind a function pointer; the real
/// work happens in the `target_feature` sibling.
///
/// # Safety
/// Same contract as [`super::scalar::conv_window`], plus: the CPU must
/// support AVX2 (the generator checks before handing out this body).
#[allow(clippy::too_many_arguments)]
pub(crate) unsafe fn conv_window(
    desc: &KernelDescriptor,
    a: *const u8,
    bp: *const i8,
    c: *mut i32,
    row_offsets: *mut i32,
    h: usize,
    w: usize,
    k: usize,
    masks: &MaskTable,
    a_zero_point: i32,
    b_zero_point: *const i32,
) {
    conv_window_impl(
        desc,
        a,
        bp,
        c,
        row_offsets,
        h,
        w,
        k,
        masks,
        a_zero_point,
        b_zero_point,
    )
}

#[target_feature(enable = "avx2")]
#[allow(clippy::too_many_arguments)]
unsafe fn conv_window_impl(
    desc: &KernelDescriptor,
    a: *const u8,
    bp: *const i8,
    c: *mut i32,
    row_offsets: *mut i32,
    h: usize,
    w: usize,
    k: usize,
    masks: &MaskTable,
    a_zero_point: i32,
    _b_zero_point: *const i32,
) {
    let kp = k.div_ceil(CHANNEL_BLOCK) * CHANNEL_BLOCK;
    let t_lo = desc.prev_skip as usize;
    let t_hi = 3 - desc.next_skip as usize;
    let h_lo = desc.top_skip as usize;
    let h_hi = 3 - desc.bottom_skip as usize;
    let w_lo = desc.left_skip as usize;
    let w_hi = 3 - desc.right_skip as usize;
    let compute_sums = !row_offsets.is_null();

    let live = (t_hi - t_lo) * (h_hi - h_lo) * (w_hi - w_lo);
    let zp_v = _mm256_set1_epi32(a_zero_point);
    let pad_sum_v = _mm256_set1_epi32(a_zero_point * (27 - live) as i32);

    for block in (0..kp).step_by(CHANNEL_BLOCK) {
        let live_ch = CHANNEL_BLOCK.min(k - block);
        let mask = _mm256_loadu_si256(masks[live_ch / 4].as_ptr() as *const __m256i);

        let mut acc = [_mm256_setzero_si256(); 4];
        let mut asum = [_mm256_setzero_si256(); 4];

        for dt in t_lo..t_hi {
            for dh in h_lo..h_hi {
                for dw in w_lo..w_hi {
                    let tap = (dt * 3 + dh) * 3 + dw;
                    let a_tap = a.wrapping_add(((dt * h + dh) * w + dw) * k + block);
                    let a_bytes = _mm256_maskload_epi32(a_tap as *const i32, mask);
                    let b_bytes =
                        _mm256_loadu_si256(bp.add(tap * kp + block) as *const __m256i);
                    let av = widen_u8(a_bytes);
                    let bv = widen_i8(b_bytes);
                    for g in 0..4 {
                        acc[g] = _mm256_add_epi32(acc[g], _mm256_mullo_epi32(av[g], bv[g]));
                        if compute_sums {
                            asum[g] = _mm256_add_epi32(asum[g], av[g]);
                        }
                    }
                }
            }
        }

        if a_zero_point != 0 && live < 27 {
            for dt in 0..3 {
                for dh in 0..3 {
                    for dw in 0..3 {
                        let in_box = (t_lo..t_hi).contains(&dt)
                            && (h_lo..h_hi).contains(&dh)
                            && (w_lo..w_hi).contains(&dw);
                        if in_box {
                            continue;
                        }
                        let tap = (dt * 3 + dh) * 3 + dw;
                        let b_bytes =
                            _mm256_loadu_si256(bp.add(tap * kp + block) as *const __m256i);
                        let bv = widen_i8(b_bytes);
                        for g in 0..4 {
                            acc[g] =
                                _mm256_add_epi32(acc[g], _mm256_mullo_epi32(zp_v, bv[g]));
                        }
                    }
                }
            }
            if compute_sums {
                for s in asum.iter_mut() {
                    *s = _mm256_add_epi32(*s, pad_sum_v);
                }
            }
        }

        for g in 0..4 {
            _mm256_storeu_si256(c.add(block + g * 8) as *mut __m256i, acc[g]);
            if compute_sums {
                _mm256_storeu_si256(row_offsets.add(block + g * 8) as *mut __m256i, asum[g]);
            }
        }
    }
}
