//! Micro-kernel generation and the process-wide kernel cache.
//!
//! A [`Kernel`] is a specialized window accumulator: the boundary descriptor
//! is baked in at generation time (skips become loop bounds) and the ISA
//! body is chosen once from runtime CPU detection. Generated kernels are
//! immutable and live for the process; the cache hands out shared handles
//! keyed by the full descriptor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::descriptor::KernelDescriptor;
use crate::masks::MaskTable;

#[cfg(target_arch = "x86_64")]
pub(crate) mod avx2;
pub(crate) mod scalar;

type KernelBodyFn = unsafe fn(
    &KernelDescriptor,
    *const u8,
    *const i8,
    *mut i32,
    *mut i32,
    usize,
    usize,
    usize,
    &MaskTable,
    i32,
    *const i32,
);

struct KernelInner {
    desc: KernelDescriptor,
    body: KernelBodyFn,
}

/// A shareable handle to one generated micro-kernel.
#[derive(Clone)]
pub struct Kernel {
    inner: Arc<KernelInner>,
}

impl Kernel {
    fn generate(desc: KernelDescriptor) -> Self {
        #[cfg(target_arch = "x86_64")]
        let body: KernelBodyFn = if std::arch::is_x86_feature_detected!("avx2") {
            avx2::conv_window
        } else {
            scalar::conv_window
        };
        #[cfg(not(target_arch = "x86_64"))]
        let body: KernelBodyFn = scalar::conv_window;

        Kernel {
            inner: Arc::new(KernelInner { desc, body }),
        }
    }

    /// The descriptor this kernel was generated for.
    #[inline]
    pub fn descriptor(&self) -> &KernelDescriptor {
        &self.inner.desc
    }

    /// Run the kernel over one output point's window.
    ///
    /// Writes `K` int32 partial sums to `c` and, iff `row_offsets` is
    /// non-null, `K` per-channel activation sums.
    ///
    /// # Safety
    /// - `a` is the window base (`A + ((t_in*H + h_in)*W + w_in)*K`); every
    ///   tap left live by the descriptor must be in bounds of the
    ///   activation buffer.
    /// - `bp` holds `27 * ceil(K/32)*32` packed weights laid out as in
    ///   [`crate::packing::PackedDepthwiseConvMatrix`].
    /// - `c` and (when non-null) `row_offsets` have room for
    ///   `ceil(K/32)*32` int32 values.
    #[allow(clippy::too_many_arguments)]
    #[inline]
    pub unsafe fn call(
        &self,
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
        (self.inner.body)(
            &self.inner.desc,
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

    #[cfg(test)]
    fn ptr_eq(&self, other: &Kernel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Process-wide descriptor -> kernel map.
///
/// Touched only at region boundaries, never inside the per-scanline loops,
/// so a single mutex is enough.
pub struct KernelCache {
    kernels: Mutex<HashMap<KernelDescriptor, Kernel>>,
}

static GLOBAL_CACHE: OnceLock<KernelCache> = OnceLock::new();

impl KernelCache {
    pub fn global() -> &'static KernelCache {
        GLOBAL_CACHE.get_or_init(|| KernelCache {
            kernels: Mutex::new(HashMap::new()),
        })
    }

    /// Fetch the kernel for `desc`, generating it on first sight.
    /// Equal descriptors always resolve to the same kernel instance.
    pub fn get_or_create(&self, desc: KernelDescriptor) -> Kernel {
        let mut kernels = self.kernels.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(kernel) = kernels.get(&desc) {
            return kernel.clone();
        }
        log::debug!(
            "generating depthwise kernel: skips=({},{},{},{},{},{}) remainder={} a_sum={}",
            desc.prev_skip,
            desc.next_skip,
            desc.top_skip,
            desc.bottom_skip,
            desc.left_skip,
            desc.right_skip,
            desc.remainder,
            desc.compute_a_sum,
        );
        let kernel = Kernel::generate(desc);
        kernels.insert(desc, kernel.clone());
        kernel
    }

    /// Number of generated kernels.
    pub fn len(&self) -> usize {
        self.kernels.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
