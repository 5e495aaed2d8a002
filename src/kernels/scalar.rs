//! Portable micro-kernel body.
//!
//! Reference semantics for the vector body: identical integer arithmetic,
//! one channel at a time. Used when AVX2 is unavailable and by the unit
//! tests as the ground truth for the vector path.

use crate::descriptor::KernelDescriptor;
use crate::masks::MaskTable;
use crate::packing::CHANNEL_BLOCK;

/// Accumulate one 3x3x3 window into `c[0..k]`.
///
/// Taps clipped by the descriptor's skips are treated as activations equal
/// to `a_zero_point`, so the partial sums and row offsets always cover the
/// full 27-tap receptive field. Row offsets are written iff `row_offsets`
/// is non-null.
///
/// # Safety
/// `a` must be the window base pointer (`A + ((t_in*H + h_in)*W + w_in)*K`,
/// computed with wrapping arithmetic for clipped windows); every tap the
/// descriptor keeps live must be in bounds. `bp` must hold
/// `27 * ceil(K/32)*32` packed weights, `c` (and `row_offsets` when
/// non-null) at least `ceil(K/32)*32` elements.
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
    _masks: &MaskTable,
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

    for i in 0..k {
        *c.add(i) = 0;
    }
    if compute_sums {
        for i in 0..k {
            *row_offsets.add(i) = 0;
        }
    }

    let mut live = 0usize;
    for dt in t_lo..t_hi {
        for dh in h_lo..h_hi {
            for dw in w_lo..w_hi {
                live += 1;
                let tap = (dt * 3 + dh) * 3 + dw;
                let a_tap = a.wrapping_add(((dt * h + dh) * w + dw) * k);
                let b_row = bp.add(tap * kp);
                for i in 0..k {
                    let av = *a_tap.add(i) as i32;
                    *c.add(i) += av * *b_row.add(i) as i32;
                    if compute_sums {
                        *row_offsets.add(i) += av;
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
                    let b_row = bp.add(((dt * 3 + dh) * 3 + dw) * kp);
                    for i in 0..k {
                        *c.add(i) += a_zero_point * *b_row.add(i) as i32;
                    }
                }
            }
        }
        if compute_sums {
            let pad = a_zero_point * (27 - live) as i32;
            for i in 0..k {
                *row_offsets.add(i) += pad;
            }
        }
    }
}
