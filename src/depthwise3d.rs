//! 3x3x3 depthwise convolution, padding 1, uint8 activations / int8 weights.
//!
//! The output space is walked in boundary-homogeneous bands: each spatial
//! axis splits into a leading padded band, an interior band and a trailing
//! padded band, so the interior scanlines run a tight kernel + requantize
//! loop with no boundary tests. Runtime flags (ReLU fusion, bias presence,
//! zero-point symmetry, quantization granularity) collapse into const
//! generics before the walk starts; nothing in the per-point path branches
//! on them.
//!
//! Threading is caller-driven: the caller spawns `num_threads` workers and
//! invokes an entry point once per worker with a unique `thread_id`. Each
//! call processes a disjoint (batch, depth, height) sub-range and returns
//! when its share is done.

use std::ptr;
use std::slice;

use crate::aligned::AlignedBuf;
use crate::descriptor::KernelDescriptor;
use crate::error::ConvError;
use crate::kernels::{Kernel, KernelCache};
use crate::masks::AVX2_TAIL_MASKS;
use crate::packing::{PackedDepthwiseConvMatrix, CHANNEL_BLOCK};
use crate::partition::{partition_1d, thread_partition_3d};
use crate::requantize::{requantize_row, Bias};

const PAD: usize = 1;
const KERNEL_PROD: usize = 27;

/// Output extent along one axis: `(X + 2*PAD - 3) / stride + 1`.
#[inline]
fn out_extent(extent: usize, stride: usize) -> usize {
    ((extent as isize + 2 * PAD as isize - 3) / stride as isize + 1).max(0) as usize
}

/// One axis of the output walk, split at the padded/interior boundaries and
/// clamped to this thread's `[begin, end)` assignment.
#[derive(Debug, Clone, Copy)]
struct Bands {
    begin: usize,
    lead_end: usize,
    mid_end: usize,
    end: usize,
}

impl Bands {
    fn split(begin: usize, end: usize, out_extent: usize, stride: usize) -> Self {
        let lead_end = PAD.clamp(begin, end);
        let mid_end = (out_extent + PAD)
            .saturating_sub(PAD + stride)
            .clamp(lead_end, end);
        Bands {
            begin,
            lead_end,
            mid_end,
            end,
        }
    }
}

#[derive(Clone, Copy)]
struct OutDims {
    t_out: usize,
    h_out: usize,
    w_out: usize,
}

/// Everything one variant needs, borrowed from the entry point's frame.
struct ConvParams<'a, B: Bias> {
    n: usize,
    t: usize,
    h: usize,
    w: usize,
    k: usize,
    stride_t: usize,
    stride_h: usize,
    stride_w: usize,
    a_zero_point: i32,
    a: *const u8,
    b_zero_point: &'a [i32],
    weights: &'a PackedDepthwiseConvMatrix,
    c_multiplier: &'a [f32],
    c_zero_point: i32,
    c: *mut u8,
    col_offsets: Option<&'a [i32]>,
    bias: Option<&'a [B]>,
    act_times_w_scale: &'a [f32],
    thread_id: usize,
    num_threads: usize,
}

/// Compute one output point: fetch (or reuse) the kernel for the window's
/// boundary class, accumulate the int32 partial sums, requantize into the
/// output plane.
#[allow(clippy::too_many_arguments)]
unsafe fn conv_point<
    const FUSE_RELU: bool,
    const HAS_BIAS: bool,
    const A_SYMMETRIC: bool,
    const B_SYMMETRIC: bool,
    const PER_CHANNEL: bool,
    B: Bias,
>(
    p: &ConvParams<B>,
    dims: OutDims,
    a_base: *const u8,
    c_base: *mut u8,
    t: usize,
    h: usize,
    w: usize,
    c_int32: &mut AlignedBuf<i32>,
    row_offsets: &mut AlignedBuf<i32>,
    pregenerated: Option<&Kernel>,
) {
    let t_in = t as isize * p.stride_t as isize - PAD as isize;
    let h_in = h as isize * p.stride_h as isize - PAD as isize;
    let w_in = w as isize * p.stride_w as isize - PAD as isize;

    let fetched;
    let kernel = match pregenerated {
        Some(kernel) => kernel,
        None => {
            let desc = KernelDescriptor::for_window(
                !B_SYMMETRIC,
                PER_CHANNEL,
                p.k,
                t_in,
                h_in,
                w_in,
                p.t,
                p.h,
                p.w,
            );
            fetched = KernelCache::global().get_or_create(desc);
            &fetched
        }
    };

    // Window base may point before the buffer for clipped windows; the
    // kernel only dereferences live taps, which are in bounds.
    let window = (t_in * p.h as isize + h_in) * p.w as isize + w_in;
    let a_ptr = a_base.wrapping_offset(window * p.k as isize);
    kernel.call(
        a_ptr,
        p.weights.packed_mat().as_ptr(),
        c_int32.as_mut_ptr(),
        if B_SYMMETRIC {
            ptr::null_mut()
        } else {
            row_offsets.as_mut_ptr()
        },
        p.h,
        p.w,
        p.k,
        &AVX2_TAIL_MASKS,
        p.a_zero_point,
        p.b_zero_point.as_ptr(),
    );

    let out_ptr = c_base.add(((t * dims.h_out + h) * dims.w_out + w) * p.k);
    let out = slice::from_raw_parts_mut(out_ptr, p.k);
    requantize_row::<FUSE_RELU, HAS_BIAS, PER_CHANNEL, A_SYMMETRIC, B_SYMMETRIC, B>(
        p.a_zero_point,
        p.b_zero_point,
        p.c_multiplier,
        p.c_zero_point,
        c_int32.as_slice(),
        out,
        row_offsets.as_slice(),
        p.col_offsets,
        p.bias,
        p.act_times_w_scale,
    );
}

/// All scanlines of one output depth slice `t`.
///
/// The height axis splits into its three bands; within interior-height
/// scanlines the width axis splits again, and the interior width run reuses
/// one kernel. `reuse` scopes that kernel: the caller passes a slot that
/// lives per-`t` for depth-clipped slices and for the whole call for
/// interior slices, so the fully-interior case shares a single middle
/// kernel across every batch.
#[allow(clippy::too_many_arguments)]
unsafe fn conv_scanlines<
    const FUSE_RELU: bool,
    const HAS_BIAS: bool,
    const A_SYMMETRIC: bool,
    const B_SYMMETRIC: bool,
    const PER_CHANNEL: bool,
    B: Bias,
>(
    p: &ConvParams<B>,
    dims: OutDims,
    a_base: *const u8,
    c_base: *mut u8,
    t: usize,
    hb: Bands,
    wb: Bands,
    reuse: &mut Option<Kernel>,
    c_int32: &mut AlignedBuf<i32>,
    row_offsets: &mut AlignedBuf<i32>,
) {
    for h in hb.begin..hb.lead_end {
        for w in 0..dims.w_out {
            conv_point::<FUSE_RELU, HAS_BIAS, A_SYMMETRIC, B_SYMMETRIC, PER_CHANNEL, B>(
                p, dims, a_base, c_base, t, h, w, c_int32, row_offsets, None,
            );
        }
    }
    for h in hb.lead_end..hb.mid_end {
        for w in wb.begin..wb.lead_end {
            conv_point::<FUSE_RELU, HAS_BIAS, A_SYMMETRIC, B_SYMMETRIC, PER_CHANNEL, B>(
                p, dims, a_base, c_base, t, h, w, c_int32, row_offsets, None,
            );
        }
        if wb.lead_end < wb.mid_end {
            let kernel = reuse
                .get_or_insert_with(|| {
                    let t_in = t as isize * p.stride_t as isize - PAD as isize;
                    KernelCache::global().get_or_create(KernelDescriptor::for_depth_edge(
                        !B_SYMMETRIC,
                        PER_CHANNEL,
                        p.k,
                        t_in,
                        p.t,
                    ))
                })
                .clone();
            for w in wb.lead_end..wb.mid_end {
                conv_point::<FUSE_RELU, HAS_BIAS, A_SYMMETRIC, B_SYMMETRIC, PER_CHANNEL, B>(
                    p,
                    dims,
                    a_base,
                    c_base,
                    t,
                    h,
                    w,
                    c_int32,
                    row_offsets,
                    Some(&kernel),
                );
            }
        }
        for w in wb.mid_end..wb.end {
            conv_point::<FUSE_RELU, HAS_BIAS, A_SYMMETRIC, B_SYMMETRIC, PER_CHANNEL, B>(
                p, dims, a_base, c_base, t, h, w, c_int32, row_offsets, None,
            );
        }
    }
    for h in hb.mid_end..hb.end {
        for w in 0..dims.w_out {
            conv_point::<FUSE_RELU, HAS_BIAS, A_SYMMETRIC, B_SYMMETRIC, PER_CHANNEL, B>(
                p, dims, a_base, c_base, t, h, w, c_int32, row_offsets, None,
            );
        }
    }
}

/// One fully-specialized variant: bind the thread's sub-range, allocate the
/// per-thread scratch, walk the depth bands.
unsafe fn conv_body<
    const FUSE_RELU: bool,
    const HAS_BIAS: bool,
    const A_SYMMETRIC: bool,
    const B_SYMMETRIC: bool,
    const PER_CHANNEL: bool,
    B: Bias,
>(
    p: &ConvParams<B>,
) {
    debug_assert!(p.k % 8 == 0, "channel count must be a multiple of 8");
    debug_assert!(p.t >= 1 && p.h >= 1 && p.w >= 1);
    debug_assert_eq!(p.weights.channels(), p.k);

    let dims = OutDims {
        t_out: out_extent(p.t, p.stride_t),
        h_out: out_extent(p.h, p.stride_h),
        w_out: out_extent(p.w, p.stride_w),
    };

    let kp = p.k.div_ceil(CHANNEL_BLOCK) * CHANNEL_BLOCK;
    let mut c_int32 = AlignedBuf::<i32>::zeroed(kp);
    let mut row_offsets = AlignedBuf::<i32>::zeroed(kp);

    let grid = thread_partition_3d(p.n, dims.t_out, dims.h_out, p.thread_id, p.num_threads);
    let (n_begin, n_end) = partition_1d(grid.g_thread_id, grid.g_num_threads, p.n);
    let (t_begin, t_end) = partition_1d(grid.m_thread_id, grid.m_num_threads, dims.t_out);
    let (h_begin, h_end) = partition_1d(grid.n_thread_id, grid.n_num_threads, dims.h_out);

    let tb = Bands::split(t_begin, t_end, dims.t_out, p.stride_t);
    let hb = Bands::split(h_begin, h_end, dims.h_out, p.stride_h);
    let wb = Bands::split(0, dims.w_out, dims.w_out, p.stride_w);

    let mut middle_kernel: Option<Kernel> = None;

    for n in n_begin..n_end {
        let a_base = p.a.wrapping_add(n * p.t * p.h * p.w * p.k);
        let c_base = p
            .c
            .wrapping_add(n * dims.t_out * dims.h_out * dims.w_out * p.k);

        for t in tb.begin..tb.lead_end {
            let mut edge_kernel = None;
            conv_scanlines::<FUSE_RELU, HAS_BIAS, A_SYMMETRIC, B_SYMMETRIC, PER_CHANNEL, B>(
                p,
                dims,
                a_base,
                c_base,
                t,
                hb,
                wb,
                &mut edge_kernel,
                &mut c_int32,
                &mut row_offsets,
            );
        }
        for t in tb.lead_end..tb.mid_end {
            conv_scanlines::<FUSE_RELU, HAS_BIAS, A_SYMMETRIC, B_SYMMETRIC, PER_CHANNEL, B>(
                p,
                dims,
                a_base,
                c_base,
                t,
                hb,
                wb,
                &mut middle_kernel,
                &mut c_int32,
                &mut row_offsets,
            );
        }
        for t in tb.mid_end..tb.end {
            let mut edge_kernel = None;
            conv_scanlines::<FUSE_RELU, HAS_BIAS, A_SYMMETRIC, B_SYMMETRIC, PER_CHANNEL, B>(
                p,
                dims,
                a_base,
                c_base,
                t,
                hb,
                wb,
                &mut edge_kernel,
                &mut c_int32,
                &mut row_offsets,
            );
        }
    }
}

// ── Dispatch tree ─────────────────────────────────────────────────────
//
// Collapses the runtime flags one at a time so the interior loop of every
// variant inlines a requantizer with its dead corrections compiled out.

unsafe fn dispatch_symmetry<
    const FUSE_RELU: bool,
    const HAS_BIAS: bool,
    const PER_CHANNEL: bool,
    B: Bias,
>(
    p: &ConvParams<B>,
) {
    let a_symmetric = p.a_zero_point == 0 || p.col_offsets.is_none();
    let b_symmetric = !PER_CHANNEL && p.b_zero_point[0] == 0;
    match (a_symmetric, b_symmetric) {
        (true, true) => conv_body::<FUSE_RELU, HAS_BIAS, true, true, PER_CHANNEL, B>(p),
        (true, false) => conv_body::<FUSE_RELU, HAS_BIAS, true, false, PER_CHANNEL, B>(p),
        (false, true) => conv_body::<FUSE_RELU, HAS_BIAS, false, true, PER_CHANNEL, B>(p),
        (false, false) => conv_body::<FUSE_RELU, HAS_BIAS, false, false, PER_CHANNEL, B>(p),
    }
}

unsafe fn dispatch_bias<const FUSE_RELU: bool, const PER_CHANNEL: bool, B: Bias>(
    p: &ConvParams<B>,
) {
    if p.bias.is_some() {
        dispatch_symmetry::<FUSE_RELU, true, PER_CHANNEL, B>(p)
    } else {
        dispatch_symmetry::<FUSE_RELU, false, PER_CHANNEL, B>(p)
    }
}

unsafe fn dispatch_fuse_relu<const PER_CHANNEL: bool, B: Bias>(
    p: &ConvParams<B>,
    fuse_relu: bool,
) {
    if fuse_relu {
        dispatch_bias::<true, PER_CHANNEL, B>(p)
    } else {
        dispatch_bias::<false, PER_CHANNEL, B>(p)
    }
}

fn validate(
    weights: &PackedDepthwiseConvMatrix,
    strides: (usize, usize, usize),
    num_threads: usize,
) -> Result<bool, ConvError> {
    if weights.kernel_prod() != KERNEL_PROD {
        return Err(ConvError::KernelProdMismatch {
            expected: KERNEL_PROD,
            actual: weights.kernel_prod(),
        });
    }
    let (stride_t, stride_h, stride_w) = strides;
    if stride_t == 0 || stride_h == 0 || stride_w == 0 || num_threads == 0 {
        debug_assert!(
            false,
            "stride_t == 0 || stride_h == 0 || stride_w == 0 || num_threads == 0"
        );
        log::warn!("depthwise_3x3x3: zero stride or thread count, producing no output");
        return Ok(false);
    }
    Ok(true)
}

/// 3x3x3 depthwise convolution with padding 1 and per-tensor output
/// quantization.
///
/// `a` is an `N x T x H x W x K` uint8 tensor, channel-last; `c` receives
/// the `N x T_out x H_out x W_out x K` uint8 result. `col_offsets` holds
/// `K` per-channel weight-sum corrections (pass `None` to treat the
/// activation side as symmetric). `bias` is optional and may be int32
/// (accumulator scale) or float (output scale, rescaled through
/// `act_times_w_scale`).
///
/// The caller drives threading: spawn `num_threads` workers and call this
/// once per worker with a unique `thread_id`; each call writes a disjoint
/// output sub-range. A batch of zero is a legal no-op.
///
/// # Errors
/// Fails when `b` was packed for a kernel product other than 27.
///
/// # Safety
/// `a` must be valid for `N*T*H*W*K` reads and `c` for
/// `N*T_out*H_out*W_out*K` writes across all concurrent callers. `K` must
/// be a positive multiple of 8 matching the packed weights.
#[allow(clippy::too_many_arguments)]
pub unsafe fn depthwise_3x3x3_pad_1<B: Bias>(
    n: usize,
    t: usize,
    h: usize,
    w: usize,
    k: usize,
    stride_t: usize,
    stride_h: usize,
    stride_w: usize,
    a_zero_point: i32,
    a: *const u8,
    b_zero_point: i32,
    b: &PackedDepthwiseConvMatrix,
    c_multiplier: f32,
    c_zero_point: i32,
    c: *mut u8,
    col_offsets: Option<&[i32]>,
    bias: Option<&[B]>,
    fuse_relu: bool,
    act_times_w_scale: f32,
    thread_id: usize,
    num_threads: usize,
) -> Result<(), ConvError> {
    if !validate(b, (stride_t, stride_h, stride_w), num_threads)? {
        return Ok(());
    }
    if n == 0 {
        // batch 0 is a legal request from upstream frameworks
        return Ok(());
    }
    let b_zero_point = [b_zero_point];
    let c_multiplier = [c_multiplier];
    let act_times_w_scale = [act_times_w_scale];
    let p = ConvParams {
        n,
        t,
        h,
        w,
        k,
        stride_t,
        stride_h,
        stride_w,
        a_zero_point,
        a,
        b_zero_point: &b_zero_point,
        weights: b,
        c_multiplier: &c_multiplier,
        c_zero_point,
        c,
        col_offsets,
        bias,
        act_times_w_scale: &act_times_w_scale,
        thread_id,
        num_threads,
    };
    dispatch_fuse_relu::<false, B>(&p, fuse_relu);
    Ok(())
}

/// 3x3x3 depthwise convolution with padding 1 and per-channel output
/// quantization.
///
/// Like [`depthwise_3x3x3_pad_1`], but `b_zero_point`, `c_multiplier` and
/// `act_times_w_scale` carry one entry per channel. The weight side is
/// never treated as symmetric on this path.
///
/// # Errors
/// Fails when `b` was packed for a kernel product other than 27.
///
/// # Safety
/// Same contract as [`depthwise_3x3x3_pad_1`]; the three per-channel
/// slices must hold at least `K` entries.
#[allow(clippy::too_many_arguments)]
pub unsafe fn depthwise_3x3x3_per_channel_quantization_pad_1<B: Bias>(
    n: usize,
    t: usize,
    h: usize,
    w: usize,
    k: usize,
    stride_t: usize,
    stride_h: usize,
    stride_w: usize,
    a_zero_point: i32,
    a: *const u8,
    b_zero_point: &[i32],
    b: &PackedDepthwiseConvMatrix,
    c_multiplier: &[f32],
    c_zero_point: i32,
    c: *mut u8,
    col_offsets: Option<&[i32]>,
    bias: Option<&[B]>,
    fuse_relu: bool,
    act_times_w_scale: &[f32],
    thread_id: usize,
    num_threads: usize,
) -> Result<(), ConvError> {
    if !validate(b, (stride_t, stride_h, stride_w), num_threads)? {
        return Ok(());
    }
    if n == 0 {
        return Ok(());
    }
    debug_assert!(
        b_zero_point.len() >= k && c_multiplier.len() >= k && act_times_w_scale.len() >= k
    );
    let p = ConvParams {
        n,
        t,
        h,
        w,
        k,
        stride_t,
        stride_h,
        stride_w,
        a_zero_point,
        a,
        b_zero_point,
        weights: b,
        c_multiplier,
        c_zero_point,
        c,
        col_offsets,
        bias,
        act_times_w_scale,
        thread_id,
        num_threads,
    };
    dispatch_fuse_relu::<true, B>(&p, fuse_relu);
    Ok(())
}
