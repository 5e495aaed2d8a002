//! Thread partitioning for the output space.
//!
//! The output is split over threads along (batch, depth, height). The flat
//! thread id is factored onto a 3D thread grid once per call; each axis then
//! gets a ceil-div blocked 1D split. Ranges are disjoint across thread ids
//! and cover the full extent, so the writers never overlap.

/// A flat thread id mapped onto a (batch, depth, height) thread grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadPartition {
    pub g_thread_id: usize,
    pub g_num_threads: usize,
    pub m_thread_id: usize,
    pub m_num_threads: usize,
    pub n_thread_id: usize,
    pub n_num_threads: usize,
}

/// Blocked 1D split: thread `tid` of `num_threads` gets
/// `[tid*wpt, (tid+1)*wpt)` clamped to `total`, with `wpt = ceil(total/threads)`.
#[inline]
pub fn partition_1d(thread_id: usize, num_threads: usize, total: usize) -> (usize, usize) {
    debug_assert!(num_threads > 0);
    let work_per_thread = total.div_ceil(num_threads);
    (
        (thread_id * work_per_thread).min(total),
        ((thread_id + 1) * work_per_thread).min(total),
    )
}

/// Factor `num_threads` onto a `(g, m, n)` grid and locate `thread_id` in it.
///
/// The batch axis gets the largest divisor of `num_threads` not exceeding
/// `g`; the remaining threads are split between the other two axes so that
/// the largest per-thread tile is minimized.
pub fn thread_partition_3d(
    g: usize,
    m: usize,
    n: usize,
    thread_id: usize,
    num_threads: usize,
) -> ThreadPartition {
    debug_assert!(num_threads > 0);
    if num_threads == 1 {
        return ThreadPartition {
            g_thread_id: 0,
            g_num_threads: 1,
            m_thread_id: 0,
            m_num_threads: 1,
            n_thread_id: 0,
            n_num_threads: 1,
        };
    }

    let mut g_threads = 1;
    for d in (1..=num_threads).rev() {
        if num_threads % d == 0 && d <= g.max(1) {
            g_threads = d;
            break;
        }
    }
    let inner = num_threads / g_threads;

    let mut m_threads = 1;
    let mut n_threads = inner;
    let mut best = usize::MAX;
    for mt in 1..=inner {
        if inner % mt != 0 {
            continue;
        }
        let nt = inner / mt;
        let tile = m.div_ceil(mt).max(1) * n.div_ceil(nt).max(1);
        if tile < best {
            best = tile;
            m_threads = mt;
            n_threads = nt;
        }
    }

    let within = thread_id % inner;
    ThreadPartition {
        g_thread_id: thread_id / inner,
        g_num_threads: g_threads,
        m_thread_id: within / n_threads,
        m_num_threads: m_threads,
        n_thread_id: within % n_threads,
        n_num_threads: n_threads,
    }
}
