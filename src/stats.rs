//! Counters and a point-in-time snapshot of allocator state, used by
//! the invariant tests and by anyone debugging memory behaviour.  This
//! is deliberately a snapshot, not a reporting surface.
use crate::base;
use crate::collection;
use crate::constants::*;
use crate::globals;
use crate::huge;

/// Per-arena counters, maintained under the arena lock.
#[derive(Default, Clone, Copy)]
pub struct ArenaStats {
    /// Bytes currently mapped.
    pub mapped: usize,

    /// Committed pages (neither madvised nor decommitted); this counts
    /// dirty and allocated memory, in pages.
    pub committed: usize,

    pub allocated_small: usize,
    pub allocated_large: usize,
}

/// A process-wide snapshot.
#[derive(Default, Clone, Debug)]
pub struct Stats {
    // Runtime settings.
    pub opt_junk: bool,
    pub opt_zero: bool,
    pub quantum: usize,
    pub quantum_max: usize,
    pub quantum_wide: usize,
    pub quantum_wide_max: usize,
    pub subpage_max: usize,
    pub large_max: usize,
    pub chunksize: usize,
    pub page_size: usize,
    pub dirty_max: usize,

    // Current memory usage.
    pub narenas: usize,
    pub mapped: usize,
    pub allocated: usize,
    /// Committed memory that is neither allocated nor dirty nor
    /// bin-unused nor bookkeeping.
    pub waste: usize,
    pub pages_dirty: usize,
    pub pages_fresh: usize,
    pub pages_madvised: usize,
    pub bookkeeping: usize,
    pub bin_unused: usize,
}

/// Gathers a snapshot.  Complete information requires running on the
/// main thread (main-thread-only arenas are skipped elsewhere).
pub fn collect() -> Stats {
    let g = globals::g();
    let mut stats = Stats {
        opt_junk: g.opt.junk,
        opt_zero: g.opt.zero,
        quantum: QUANTUM,
        quantum_max: MAX_QUANTUM_CLASS,
        quantum_wide: QUANTUM_WIDE,
        quantum_wide_max: MAX_QUANTUM_WIDE_CLASS,
        subpage_max: g.max_sub_page_class,
        large_max: g.max_large_class,
        chunksize: CHUNK_SIZE,
        page_size: g.page_size,
        dirty_max: g.opt.dirty_max,
        ..Stats::default()
    };

    let mut non_arena_mapped = 0;

    let (huge_allocated, huge_mapped) = huge::huge_stats();
    non_arena_mapped += huge_mapped;
    stats.allocated += huge_allocated;
    debug_assert!(huge_mapped >= huge_allocated);

    let (base_mapped, base_committed) = base::base_stats();
    non_arena_mapped += base_mapped;
    stats.bookkeeping += base_committed;
    debug_assert!(base_mapped >= base_committed);

    collection::for_each_arena(|arena| unsafe {
        // Without this the arena's numbers could not be read safely.
        debug_assert!((*arena).lock.safe_on_this_thread());

        let (
            arena_mapped,
            arena_committed,
            arena_allocated,
            arena_dirty,
            arena_fresh,
            arena_madvised,
            arena_unused,
            arena_headers,
        ) = {
            let _lock = (*arena).lock.lock();

            let mut unused = 0;
            let mut headers = 0;
            for j in 0..g.num_small_classes {
                let bin = &(*arena).bins[j];
                let mut bin_unused = 0;

                for mapelm in bin.non_full_runs.iter() {
                    let run = ((*mapelm).bits & !g.page_size_mask) as *mut crate::arena::Run;
                    bin_unused += (*run).num_free as usize * bin.size_class;
                }
                if !bin.current_run.is_null() {
                    bin_unused += (*bin.current_run).num_free as usize * bin.size_class;
                }

                unused += bin_unused;
                headers += bin.num_runs as usize * bin.run_first_region_offset as usize;
            }

            (
                (*arena).stats.mapped,
                (*arena).stats.committed << g.page_size_2pow,
                (*arena).stats.allocated_small + (*arena).stats.allocated_large,
                (*arena).num_dirty << g.page_size_2pow,
                (*arena).num_fresh << g.page_size_2pow,
                (*arena).num_madvised << g.page_size_2pow,
                unused,
                headers,
            )
        };

        debug_assert!(arena_mapped >= arena_committed);
        debug_assert!(arena_committed >= arena_allocated + arena_dirty);

        stats.mapped += arena_mapped;
        stats.allocated += arena_allocated;
        stats.pages_dirty += arena_dirty;
        stats.pages_fresh += arena_fresh;
        stats.pages_madvised += arena_madvised;
        debug_assert!(
            arena_committed >= arena_allocated + arena_dirty + arena_unused + arena_headers
        );
        stats.waste +=
            arena_committed - arena_allocated - arena_dirty - arena_unused - arena_headers;
        stats.bin_unused += arena_unused;
        stats.bookkeeping += arena_headers;
        stats.narenas += 1;
    });

    // Arena chunk headers count as bookkeeping, not waste.
    let chunk_header_size = (stats.mapped / CHUNK_SIZE)
        * ((g.chunk_header_npages - 1) << g.page_size_2pow);
    stats.mapped += non_arena_mapped;
    stats.bookkeeping += chunk_header_size;
    stats.waste -= chunk_header_size;

    debug_assert!(
        stats.mapped
            >= stats.allocated + stats.waste + stats.pages_dirty + stats.bookkeeping
    );
    stats
}
