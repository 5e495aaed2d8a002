//! End-to-end validation of the depthwise engine against a scalar reference
//! convolution: explicit zero-point padding, int32 accumulation, then the
//! same requantization contract.

use qconv_kernels::{
    depthwise_3x3x3_pad_1, depthwise_3x3x3_per_channel_quantization_pad_1, Bias,
    PackedDepthwiseConvMatrix,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn out_extent(extent: usize, stride: usize) -> usize {
    (extent + 2 - 3) / stride + 1
}

/// One test configuration. Weights are channel-major `K x 27`.
#[derive(Clone)]
struct Case {
    n: usize,
    t: usize,
    h: usize,
    w: usize,
    k: usize,
    strides: (usize, usize, usize),
    a: Vec<u8>,
    weights: Vec<i8>,
    a_zero_point: i32,
    b_zero_point: Vec<i32>,
    c_multiplier: Vec<f32>,
    c_zero_point: i32,
    col_offsets: Option<Vec<i32>>,
    act_times_w_scale: Vec<f32>,
    fuse_relu: bool,
    per_channel: bool,
}

impl Case {
    fn random(
        seed: u64,
        n: usize,
        dims: (usize, usize, usize),
        k: usize,
        strides: (usize, usize, usize),
        a_zero_point: i32,
        b_zero_point: i32,
        per_channel: bool,
        fuse_relu: bool,
    ) -> Self {
        let (t, h, w) = dims;
        let mut rng = StdRng::seed_from_u64(seed);
        let a: Vec<u8> = (0..n * t * h * w * k).map(|_| rng.gen()).collect();
        let weights: Vec<i8> = (0..k * 27).map(|_| rng.gen_range(-64..64)).collect();
        let col_offsets: Vec<i32> = (0..k)
            .map(|ch| (0..27).map(|tap| weights[ch * 27 + tap] as i32).sum())
            .collect();
        let (b_zero_point, c_multiplier, act_times_w_scale) = if per_channel {
            (
                (0..k as i32).map(|i| b_zero_point + i % 3 - 1).collect(),
                (0..k).map(|i| 0.001 + i as f32 * 2e-5).collect(),
                (0..k).map(|i| 0.4 + i as f32 * 1e-3).collect(),
            )
        } else {
            (vec![b_zero_point], vec![0.0015f32], vec![0.5f32])
        };
        Case {
            n,
            t,
            h,
            w,
            k,
            strides,
            a,
            weights,
            a_zero_point,
            b_zero_point,
            c_multiplier,
            c_zero_point: 5,
            col_offsets: Some(col_offsets),
            act_times_w_scale,
            fuse_relu,
            per_channel,
        }
    }

    fn out_len(&self) -> usize {
        self.n
            * out_extent(self.t, self.strides.0)
            * out_extent(self.h, self.strides.1)
            * out_extent(self.w, self.strides.2)
            * self.k
    }
}

/// Scalar oracle. Pads clipped taps with the activation zero point and
/// applies the same correction/bias/rounding pipeline as the engine.
fn reference<B: Bias>(case: &Case, bias: Option<&[B]>) -> Vec<u8> {
    let (st, sh, sw) = case.strides;
    let (t_out, h_out, w_out) = (
        out_extent(case.t, st),
        out_extent(case.h, sh),
        out_extent(case.w, sw),
    );
    let k = case.k;
    let a_sym = case.a_zero_point == 0 || case.col_offsets.is_none();
    let b_sym = !case.per_channel && case.b_zero_point[0] == 0;
    let lower = if case.fuse_relu {
        case.c_zero_point as i64
    } else {
        0
    };

    let mut out = vec![0u8; case.out_len()];
    for n in 0..case.n {
        for to in 0..t_out {
            for ho in 0..h_out {
                for wo in 0..w_out {
                    for ch in 0..k {
                        let mut acc = 0i32;
                        let mut asum = 0i32;
                        for dt in 0..3isize {
                            for dh in 0..3isize {
                                for dw in 0..3isize {
                                    let ti = to as isize * st as isize - 1 + dt;
                                    let hi = ho as isize * sh as isize - 1 + dh;
                                    let wi = wo as isize * sw as isize - 1 + dw;
                                    let inside = ti >= 0
                                        && (ti as usize) < case.t
                                        && hi >= 0
                                        && (hi as usize) < case.h
                                        && wi >= 0
                                        && (wi as usize) < case.w;
                                    let av = if inside {
                                        let idx = (((n * case.t + ti as usize) * case.h
                                            + hi as usize)
                                            * case.w
                                            + wi as usize)
                                            * k
                                            + ch;
                                        case.a[idx] as i32
                                    } else {
                                        case.a_zero_point
                                    };
                                    let tap = ((dt * 3 + dh) * 3 + dw) as usize;
                                    acc += av * case.weights[ch * 27 + tap] as i32;
                                    asum += av;
                                }
                            }
                        }
                        let q = if case.per_channel { ch } else { 0 };
                        let mut raw = acc;
                        if !a_sym {
                            raw -= case.a_zero_point * case.col_offsets.as_ref().unwrap()[ch];
                        }
                        if !b_sym {
                            raw -= case.b_zero_point[q] * asum;
                        }
                        let raw_f = match bias {
                            Some(bias) => B::fold(raw, bias[ch], case.act_times_w_scale[q]),
                            None => raw as f32,
                        };
                        let rounded = (raw_f * case.c_multiplier[q]).round_ties_even() as i64
                            + case.c_zero_point as i64;
                        let idx = (((n * t_out + to) * h_out + ho) * w_out + wo) * k + ch;
                        out[idx] = rounded.max(lower).min(255) as u8;
                    }
                }
            }
        }
    }
    out
}

#[derive(Clone, Copy)]
struct SendPtr(*mut u8);
unsafe impl Send for SendPtr {}

/// Run the engine over `num_threads` caller-spawned workers.
fn run<B: Bias>(case: &Case, bias: Option<&[B]>, num_threads: usize) -> Vec<u8> {
    let packed = PackedDepthwiseConvMatrix::new(case.k, 27, &case.weights);
    let mut out = vec![0u8; case.out_len()];
    let out_ptr = SendPtr(out.as_mut_ptr());
    let packed = &packed;
    std::thread::scope(|s| {
        for tid in 0..num_threads {
            s.spawn(move || {
                let out_ptr = out_ptr;
                let result = unsafe {
                    if case.per_channel {
                        depthwise_3x3x3_per_channel_quantization_pad_1(
                            case.n,
                            case.t,
                            case.h,
                            case.w,
                            case.k,
                            case.strides.0,
                            case.strides.1,
                            case.strides.2,
                            case.a_zero_point,
                            case.a.as_ptr(),
                            &case.b_zero_point,
                            packed,
                            &case.c_multiplier,
                            case.c_zero_point,
                            out_ptr.0,
                            case.col_offsets.as_deref(),
                            bias,
                            case.fuse_relu,
                            &case.act_times_w_scale,
                            tid,
                            num_threads,
                        )
                    } else {
                        depthwise_3x3x3_pad_1(
                            case.n,
                            case.t,
                            case.h,
                            case.w,
                            case.k,
                            case.strides.0,
                            case.strides.1,
                            case.strides.2,
                            case.a_zero_point,
                            case.a.as_ptr(),
                            case.b_zero_point[0],
                            packed,
                            case.c_multiplier[0],
                            case.c_zero_point,
                            out_ptr.0,
                            case.col_offsets.as_deref(),
                            bias,
                            case.fuse_relu,
                            case.act_times_w_scale[0],
                            tid,
                            num_threads,
                        )
                    }
                };
                result.unwrap();
            });
        }
    });
    out
}

fn assert_matches_reference<B: Bias>(case: &Case, bias: Option<&[B]>) {
    let expected = reference(case, bias);
    let actual = run(case, bias, 1);
    assert_eq!(actual, expected);
}

#[test]
fn all_boundary_output_matches_reference() {
    // 3x3x3 output: every point's window touches at least one face
    let case = Case::random(1, 1, (3, 3, 3), 8, (1, 1, 1), 3, 2, false, false);
    let bias: Vec<i32> = (0..8).map(|i| i * 50 - 200).collect();
    assert_matches_reference(&case, Some(&bias));
}

#[test]
fn interior_point_uses_shared_middle_kernel_path() {
    // 5x5x5 output: (2,2,2) and its neighbors run through the reused
    // interior kernel; the result must still match the oracle exactly
    let case = Case::random(2, 1, (5, 5, 5), 8, (1, 1, 1), 7, 1, false, false);
    assert_matches_reference::<i32>(&case, None);
}

#[test]
fn stride_two_matches_reference_at_every_point() {
    let case = Case::random(3, 2, (4, 4, 4), 32, (2, 2, 2), 5, 2, false, false);
    let bias: Vec<i32> = (0..32).map(|i| i * 13 - 100).collect();
    assert_matches_reference(&case, Some(&bias));
}

#[test]
fn mixed_strides_match_reference() {
    let case = Case::random(4, 2, (5, 4, 6), 16, (1, 2, 1), 9, 3, false, false);
    assert_matches_reference::<i32>(&case, None);
}

#[test]
fn fully_symmetric_relu_collapses_specializations() {
    let mut case = Case::random(5, 1, (3, 3, 3), 16, (1, 1, 1), 0, 0, false, true);
    case.col_offsets = None;
    assert_matches_reference::<i32>(&case, None);
}

#[test]
fn tail_mask_path_k40() {
    let case = Case::random(6, 1, (3, 3, 3), 40, (1, 1, 1), 11, 2, false, false);
    let bias: Vec<i32> = (0..40).map(|i| i * 7 - 64).collect();
    assert_matches_reference(&case, Some(&bias));
}

#[test]
fn wide_channels_k64_per_channel() {
    let case = Case::random(7, 1, (4, 4, 4), 64, (1, 1, 1), 4, 2, true, false);
    let bias: Vec<i32> = (0..64).map(|i| i * 3 - 90).collect();
    assert_matches_reference(&case, Some(&bias));
}

#[test]
fn float_bias_matches_reference() {
    let case = Case::random(8, 1, (4, 4, 4), 16, (1, 1, 1), 6, 1, false, false);
    let bias: Vec<f32> = (0..16).map(|i| i as f32 * 0.75 - 4.0).collect();
    assert_matches_reference(&case, Some(&bias));

    let case = Case::random(9, 1, (4, 4, 4), 16, (1, 1, 1), 6, 0, true, true);
    let bias: Vec<f32> = (0..16).map(|i| i as f32 * -0.5 + 2.0).collect();
    assert_matches_reference(&case, Some(&bias));
}

#[test]
fn thread_counts_produce_bitwise_identical_output() {
    let case = Case::random(10, 4, (8, 8, 8), 64, (1, 1, 1), 3, 1, true, false);
    let bias: Vec<i32> = (0..64).map(|i| i * 11 - 300).collect();
    let single = run(&case, Some(&bias), 1);
    for threads in [2usize, 4, 8] {
        let multi = run(&case, Some(&bias), threads);
        assert_eq!(single, multi, "num_threads={threads}");
    }
}

#[test]
fn thread_counts_identical_per_tensor_stride_two() {
    let case = Case::random(11, 3, (6, 7, 5), 24, (2, 1, 2), 9, 4, false, true);
    let single = run::<i32>(&case, None, 1);
    for threads in [2usize, 3, 5, 8] {
        assert_eq!(single, run::<i32>(&case, None, threads), "num_threads={threads}");
    }
}

#[test]
fn symmetric_activation_ignores_col_offsets() {
    let mut with_offsets = Case::random(12, 1, (4, 4, 4), 16, (1, 1, 1), 0, 2, false, false);
    let without_offsets = {
        let mut c = with_offsets.clone();
        c.col_offsets = None;
        c
    };
    let a = run::<i32>(&with_offsets, None, 1);
    let b = run::<i32>(&without_offsets, None, 1);
    assert_eq!(a, b);

    // perturbed offsets must not leak into the output either
    with_offsets.col_offsets = Some(vec![12345; 16]);
    assert_eq!(a, run::<i32>(&with_offsets, None, 1));
}

#[test]
fn null_col_offsets_select_the_symmetric_path() {
    // non-zero declared zero point with absent offsets: the correction is
    // dropped but the padding value is preserved
    let mut case = Case::random(13, 1, (3, 3, 3), 8, (1, 1, 1), 19, 2, false, false);
    case.col_offsets = None;
    assert_matches_reference::<i32>(&case, None);
}

#[test]
fn relu_fusion_equals_post_clamp() {
    let base = Case::random(14, 1, (4, 4, 4), 16, (1, 1, 1), 8, 3, false, false);
    let fused = {
        let mut c = base.clone();
        c.fuse_relu = true;
        c
    };
    let bias: Vec<i32> = (0..16).map(|i| i * 41 - 400).collect();
    let plain = run(&base, Some(&bias), 1);
    let relu = run(&fused, Some(&bias), 1);
    let clamped: Vec<u8> = plain
        .iter()
        .map(|&v| v.max(base.c_zero_point as u8))
        .collect();
    assert_eq!(relu, clamped);
}

#[test]
fn missing_bias_equals_zero_bias() {
    let case = Case::random(15, 1, (4, 4, 4), 16, (1, 1, 1), 5, 2, false, false);
    let none = run::<i32>(&case, None, 1);
    let zeros_i32 = run(&case, Some(&vec![0i32; 16]), 1);
    let zeros_f32 = run(&case, Some(&vec![0.0f32; 16]), 1);
    assert_eq!(none, zeros_i32);
    assert_eq!(none, zeros_f32);
}

#[test]
fn per_tensor_equals_broadcast_per_channel() {
    for (seed, zb) in [(16u64, 0i32), (17, 3)] {
        let per_tensor = Case::random(seed, 2, (4, 5, 4), 16, (1, 1, 1), 6, zb, false, false);
        let broadcast = Case {
            per_channel: true,
            b_zero_point: vec![per_tensor.b_zero_point[0]; 16],
            c_multiplier: vec![per_tensor.c_multiplier[0]; 16],
            act_times_w_scale: vec![per_tensor.act_times_w_scale[0]; 16],
            ..per_tensor.clone()
        };
        let bias: Vec<i32> = (0..16).map(|i| i * 9 - 70).collect();
        assert_eq!(
            run(&per_tensor, Some(&bias), 1),
            run(&broadcast, Some(&bias), 1),
            "zb={zb}"
        );
    }
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        /// Any small configuration matches the oracle bit for bit.
        #[test]
        fn matches_reference(
            seed in 0u64..1_000_000,
            t in 3usize..6,
            h in 3usize..6,
            w in 3usize..6,
            k in prop_oneof![Just(8usize), Just(16), Just(40)],
            stride in prop_oneof![Just((1usize, 1usize, 1usize)), Just((2, 2, 2)), Just((1, 2, 1))],
            a_zp in 0i32..32,
            b_zp in -4i32..4,
            per_channel in any::<bool>(),
            fuse_relu in any::<bool>(),
        ) {
            let case = Case::random(seed, 2, (t, h, w), k, stride, a_zp, b_zp, per_channel, fuse_relu);
            let bias: Vec<i32> = (0..k as i32).map(|i| i * 5 - 40).collect();
            let expected = reference(&case, Some(&bias[..]));
            prop_assert_eq!(run(&case, Some(&bias[..]), 1), expected.clone());
            prop_assert_eq!(run(&case, Some(&bias[..]), 3), expected);
        }
    }
}
