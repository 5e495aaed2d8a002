//! Fused requantization: int32 partial sums to uint8 output.
//!
//! Per output point and channel: subtract the zero-point correction terms,
//! fold in the bias, scale by the output multiplier, round to nearest even,
//! add the output zero point and saturate. The five boolean knobs are const
//! generics so every caller monomorphizes to a straight-line loop with the
//! dead corrections compiled out.

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::*;

mod sealed {
    pub trait Sealed {}
    impl Sealed for i32 {}
    impl Sealed for f32 {}
}

/// Bias element type. Integer bias is in accumulator scale and is added
/// before the float multiply; float bias is in output scale and is divided
/// by the activation*weight scale first.
pub trait Bias: Copy + Send + Sync + sealed::Sealed + 'static {
    const IS_FLOAT: bool;

    /// Fold one channel's bias into the accumulator, yielding the value the
    /// output multiplier applies to.
    fn fold(acc: i32, bias: Self, act_times_w_scale: f32) -> f32;
}

impl Bias for i32 {
    const IS_FLOAT: bool = false;

    #[inline]
    fn fold(acc: i32, bias: Self, _act_times_w_scale: f32) -> f32 {
        (acc + bias) as f32
    }
}

impl Bias for f32 {
    const IS_FLOAT: bool = true;

    #[inline]
    fn fold(acc: i32, bias: Self, act_times_w_scale: f32) -> f32 {
        acc as f32 + bias / act_times_w_scale
    }
}

/// Requantize one output point's row of `out.len()` channels.
///
/// `b_zero_point`, `c_multiplier` and `act_times_w_scale` hold one entry in
/// per-tensor mode and `K` entries in per-channel mode. `col_offsets` must
/// be present when `A_SYMMETRIC` is false; `bias` when `HAS_BIAS` is true.
#[allow(clippy::too_many_arguments)]
pub(crate) fn requantize_row<
    const FUSE_RELU: bool,
    const HAS_BIAS: bool,
    const PER_CHANNEL: bool,
    const A_SYMMETRIC: bool,
    const B_SYMMETRIC: bool,
    B: Bias,
>(
    a_zero_point: i32,
    b_zero_point: &[i32],
    c_multiplier: &[f32],
    c_zero_point: i32,
    acc: &[i32],
    out: &mut [u8],
    row_offsets: &[i32],
    col_offsets: Option<&[i32]>,
    bias: Option<&[B]>,
    act_times_w_scale: &[f32],
) {
    #[cfg(target_arch = "x86_64")]
    if std::arch::is_x86_feature_detected!("avx2") && out.len() % 8 == 0 {
        unsafe {
            requantize_row_avx2::<FUSE_RELU, HAS_BIAS, PER_CHANNEL, A_SYMMETRIC, B_SYMMETRIC, B>(
                a_zero_point,
                b_zero_point,
                c_multiplier,
                c_zero_point,
                acc,
                out,
                row_offsets,
                col_offsets,
                bias,
                act_times_w_scale,
            );
        }
        return;
    }
    requantize_row_scalar::<FUSE_RELU, HAS_BIAS, PER_CHANNEL, A_SYMMETRIC, B_SYMMETRIC, B>(
        a_zero_point,
        b_zero_point,
        c_multiplier,
        c_zero_point,
        acc,
        out,
        row_offsets,
        col_offsets,
        bias,
        act_times_w_scale,
    );
}

#[allow(clippy::too_many_arguments)]
fn requantize_row_scalar<
    const FUSE_RELU: bool,
    const HAS_BIAS: bool,
    const PER_CHANNEL: bool,
    const A_SYMMETRIC: bool,
    const B_SYMMETRIC: bool,
    B: Bias,
>(
    a_zero_point: i32,
    b_zero_point: &[i32],
    c_multiplier: &[f32],
    c_zero_point: i32,
    acc: &[i32],
    out: &mut [u8],
    row_offsets: &[i32],
    col_offsets: Option<&[i32]>,
    bias: Option<&[B]>,
    act_times_w_scale: &[f32],
) {
    let col_offsets = col_offsets.unwrap_or(&[]);
    let bias = bias.unwrap_or(&[]);
    let lower = if FUSE_RELU { c_zero_point as i64 } else { 0 };

    for (i, slot) in out.iter_mut().enumerate() {
        let q = if PER_CHANNEL { i } else { 0 };
        let mut raw = acc[i];
        if !A_SYMMETRIC {
            raw -= a_zero_point * col_offsets[i];
        }
        if !B_SYMMETRIC {
            raw -= b_zero_point[q] * row_offsets[i];
        }
        let raw_f = if HAS_BIAS {
            B::fold(raw, bias[i], act_times_w_scale[q])
        } else {
            raw as f32
        };
        let rounded = (raw_f * c_multiplier[q]).round_ties_even() as i64 + c_zero_point as i64;
        *slot = rounded.max(lower).min(255) as u8;
    }
}

/// Vector path: 8 channels per step. `K % 8 == 0` keeps it tail-free; the
/// int32->u8 narrowing goes through the usual pack + lane extract.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
#[allow(clippy::too_many_arguments)]
unsafe fn requantize_row_avx2<
    const FUSE_RELU: bool,
    const HAS_BIAS: bool,
    const PER_CHANNEL: bool,
    const A_SYMMETRIC: bool,
    const B_SYMMETRIC: bool,
    B: Bias,
>(
    a_zero_point: i32,
    b_zero_point: &[i32],
    c_multiplier: &[f32],
    c_zero_point: i32,
    acc: &[i32],
    out: &mut [u8],
    row_offsets: &[i32],
    col_offsets: Option<&[i32]>,
    bias: Option<&[B]>,
    act_times_w_scale: &[f32],
) {
    let k = out.len();
    let col_ptr = col_offsets.map_or(std::ptr::null(), <[i32]>::as_ptr);
    let bias_ptr = bias.map_or(std::ptr::null(), <[B]>::as_ptr);
    let za_v = _mm256_set1_epi32(a_zero_point);
    let zp_out_v = _mm256_set1_epi32(c_zero_point);
    let lower_v = if FUSE_RELU {
        zp_out_v
    } else {
        _mm256_setzero_si256()
    };
    let upper_v = _mm256_set1_epi32(255);
    let mult_scalar_v = _mm256_set1_ps(c_multiplier[0]);
    let zb_scalar_v = _mm256_set1_epi32(b_zero_point[0]);
    let ats_scalar_v = _mm256_set1_ps(act_times_w_scale[0]);

    for i in (0..k).step_by(8) {
        let mut x = _mm256_loadu_si256(acc.as_ptr().add(i) as *const __m256i);
        if !A_SYMMETRIC {
            let col = _mm256_loadu_si256(col_ptr.add(i) as *const __m256i);
            x = _mm256_sub_epi32(x, _mm256_mullo_epi32(za_v, col));
        }
        if !B_SYMMETRIC {
            let zb = if PER_CHANNEL {
                _mm256_loadu_si256(b_zero_point.as_ptr().add(i) as *const __m256i)
            } else {
                zb_scalar_v
            };
            let row = _mm256_loadu_si256(row_offsets.as_ptr().add(i) as *const __m256i);
            x = _mm256_sub_epi32(x, _mm256_mullo_epi32(zb, row));
        }

        let xf = if HAS_BIAS {
            if B::IS_FLOAT {
                let b = _mm256_loadu_ps(bias_ptr.add(i) as *const f32);
                let scale = if PER_CHANNEL {
                    _mm256_loadu_ps(act_times_w_scale.as_ptr().add(i))
                } else {
                    ats_scalar_v
                };
                _mm256_add_ps(_mm256_cvtepi32_ps(x), _mm256_div_ps(b, scale))
            } else {
                let b = _mm256_loadu_si256(bias_ptr.add(i) as *const __m256i);
                _mm256_cvtepi32_ps(_mm256_add_epi32(x, b))
            }
        } else {
            _mm256_cvtepi32_ps(x)
        };
        let mult = if PER_CHANNEL {
            _mm256_loadu_ps(c_multiplier.as_ptr().add(i))
        } else {
            mult_scalar_v
        };
        let scaled = _mm256_mul_ps(xf, mult);

        // cvtps rounds to nearest even under the default MXCSR mode
        let rounded = _mm256_add_epi32(_mm256_cvtps_epi32(scaled), zp_out_v);
        let clamped = _mm256_min_epi32(_mm256_max_epi32(rounded, lower_v), upper_v);

        let packed16 = _mm256_packus_epi32(clamped, clamped);
        let packed8 = _mm256_packus_epi16(packed16, packed16);
        let lo = _mm_cvtsi128_si32(_mm256_castsi256_si128(packed8)) as u32;
        let hi = _mm_cvtsi128_si32(_mm256_extracti128_si256::<1>(packed8)) as u32;
        (out.as_mut_ptr().add(i) as *mut u32).write_unaligned(lo);
        (out.as_mut_ptr().add(i + 4) as *mut u32).write_unaligned(hi);
    }
}
