//! Arenas: the mid-level of the allocator.  An arena owns chunks, carves
//! them into page runs tracked in a size/address-ordered tree, and
//! carves small-class runs into regions handed out through per-class
//! bins.  Every mutation of a chunk's page map happens under the owning
//! arena's lock.
use std::cmp::Ordering;
use std::ptr;

use crate::chunk::{chunk_alloc, chunk_dealloc};
use crate::classes::{ClassType, FastDivisor, SizeClass};
use crate::collection;
use crate::constants::*;
use crate::extent::ChunkType;
use crate::fill::{apply_zero_or_junk, maybe_poison};
use crate::globals::{self, chunk_for_ptr, chunk_offset_for_ptr};
use crate::huge;
use crate::map;
use crate::mutex::{DoLock, MaybeMutex};
use crate::random::{os_random_u64, XorShift128Plus};
use crate::rb::{RbNode, RbOrder, RbTree};
use crate::stats::ArenaStats;

// Each page map entry stores the run address (or size) in its high bits
// and status flags in the bits below the page size:
//
//   ???????? ???????? ????---b fmckdzla
//
// ? : unallocated: run size for first/last pages, don't-care between.
//     small: run address.  large: run size for the first page only.
// b : busy   f : fresh    m : madvised   c : decommitted
// k : key    d : dirty    z : zeroed     l : large      a : allocated
//
// dirty, decommitted, madvised and fresh are mutually exclusive; a page
// is exactly one of {fresh, madvised, decommitted, dirty, in-use}.
pub const MAP_BUSY: usize = 0x100;
pub const MAP_FRESH: usize = 0x80;
pub const MAP_MADVISED: usize = 0x40;
pub const MAP_DECOMMITTED: usize = 0x20;
pub const MAP_MADVISED_OR_DECOMMITTED: usize = MAP_MADVISED | MAP_DECOMMITTED;
pub const MAP_FRESH_MADVISED_OR_DECOMMITTED: usize =
    MAP_FRESH | MAP_MADVISED | MAP_DECOMMITTED;
pub const MAP_KEY: usize = 0x10;
pub const MAP_DIRTY: usize = 0x08;
pub const MAP_ZEROED: usize = 0x04;
pub const MAP_LARGE: usize = 0x02;
pub const MAP_ALLOCATED: usize = 0x01;

/// One entry per page of an arena chunk, doubling as the linkage for the
/// available-run and non-full-run trees.
#[repr(C)]
pub struct PageMapEntry {
    pub link: RbNode<PageMapEntry>,
    pub bits: usize,
}

/// Address order on the map entries themselves: used for a bin's
/// non-full runs, where the lowest-addressed run wins.
pub struct MapEntryAddrOrder;

impl RbOrder<PageMapEntry> for MapEntryAddrOrder {
    unsafe fn node(t: *mut PageMapEntry) -> *mut RbNode<PageMapEntry> {
        ptr::addr_of_mut!((*t).link)
    }

    unsafe fn cmp(a: *const PageMapEntry, b: *const PageMapEntry) -> Ordering {
        (a as usize).cmp(&(b as usize))
    }
}

/// Size-then-address order for the available-run tree.  Synthetic keys
/// carry `MAP_KEY` and compare as address zero so a best-fit search
/// lands on the lowest-addressed run of sufficient size.
pub struct AvailRunOrder;

impl RbOrder<PageMapEntry> for AvailRunOrder {
    unsafe fn node(t: *mut PageMapEntry) -> *mut RbNode<PageMapEntry> {
        ptr::addr_of_mut!((*t).link)
    }

    unsafe fn cmp(a: *const PageMapEntry, b: *const PageMapEntry) -> Ordering {
        let mask = globals::g().page_size_mask;
        let size1 = (*a).bits & !mask;
        let size2 = (*b).bits & !mask;
        let addr1 = if (*a).bits & MAP_KEY != 0 { 0 } else { a as usize };
        size1.cmp(&size2).then(addr1.cmp(&(b as usize)))
    }
}

/// Arena chunk header; the rest of the chunk after the header pages (and
/// their trailing guard page) is run space.  The map is dimensioned for
/// the smallest supported page size; larger page sizes use a prefix.
#[repr(C)]
pub struct ArenaChunk {
    /// Arena that owns the chunk.
    pub arena: *mut Arena,

    /// Linkage for the arena's tree of dirty chunks.
    pub link_dirty: RbNode<ArenaChunk>,

    // Chunks with madvised pages form a list so the hard-purge pass can
    // find them without scanning every chunk.
    pub madvised_prev: *mut ArenaChunk,
    pub madvised_next: *mut ArenaChunk,
    pub in_madvised_list: bool,

    /// Number of dirty pages.
    pub ndirty: usize,

    /// Map of pages within the chunk tracking free/large/small state.
    pub map: [PageMapEntry; MAX_PAGES_PER_CHUNK],
}

/// Address order on dirty chunks.
pub struct DirtyChunkOrder;

impl RbOrder<ArenaChunk> for DirtyChunkOrder {
    unsafe fn node(t: *mut ArenaChunk) -> *mut RbNode<ArenaChunk> {
        ptr::addr_of_mut!((*t).link_dirty)
    }

    unsafe fn cmp(a: *const ArenaChunk, b: *const ArenaChunk) -> Ordering {
        (a as usize).cmp(&(b as usize))
    }
}

pub const RUN_MAGIC: u32 = 0x384a_df93;

/// Header of a small-class run; the region bitmap follows immediately
/// (1 bit per region, set when free).  Large runs have no header.
#[repr(C)]
pub struct Run {
    pub magic: u32,

    /// Index of the first bitmap element that might have a free region.
    pub regions_min_elm: u32,

    /// Bin this run is associated with.
    pub bin: *mut Bin,

    /// Number of free regions in the run.
    pub num_free: u32,
}

/// Size of the run header, excluding the trailing bitmap.
pub const RUN_FIXED_HEADER_SIZE: usize = core::mem::size_of::<Run>();

/// The region bitmap is an array of u32 words right after the header.
unsafe fn run_mask_ptr(run: *mut Run, elm: u32) -> *mut u32 {
    (run.add(1) as *mut u32).add(elm as usize)
}

#[repr(C)]
pub struct Bin {
    /// Current run used to service allocations of this bin's size class.
    pub current_run: *mut Run,

    /// Tree of non-full runs, visited lowest-address-first when the
    /// current run fills up.  That policy keeps objects packed and helps
    /// empty out almost-empty chunks.
    pub non_full_runs: RbTree<PageMapEntry, MapEntryAddrOrder>,

    /// Bin's size class.
    pub size_class: usize,

    /// Total number of regions in a run for this bin's size class.
    pub run_num_regions: u32,

    /// Number of bitmap elements in a run for this size class.
    pub run_num_mask_elms: u32,

    /// Offset of the first region in a run.
    pub run_first_region_offset: u32,

    /// Current number of runs in this bin, full or otherwise.
    pub num_runs: u32,

    /// Divides an offset by the size class without a division.
    pub size_divisor: FastDivisor,

    /// Total number of pages in a run for this bin's size class.
    pub run_size_pages: u8,
}

// The overhead targets for choosing run sizes, as fractions with a 4096
// denominator: 1.6% nominal, relaxed to 2.4% when the size class is
// smaller than the unavoidable overhead.
const RUN_OVERHEAD_NUM: usize = 65;
const RUN_RELAXED_OVERHEAD_NUM: usize = 98;
const OVERHEAD_DEN: usize = 4096;

impl Bin {
    fn empty() -> Bin {
        Bin {
            current_run: ptr::null_mut(),
            non_full_runs: RbTree::new(),
            size_class: 0,
            run_num_regions: 0,
            run_num_mask_elms: 0,
            run_first_region_offset: 0,
            num_runs: 0,
            size_divisor: FastDivisor::default(),
            run_size_pages: 0,
        }
    }

    /// Configures the bin for a size class by picking the smallest run
    /// size whose header overhead is acceptable.
    fn init(&mut self, size_class: SizeClass) {
        let g = globals::g();
        let size = size_class.size();
        assert!(size <= g.max_bin_class);

        self.current_run = ptr::null_mut();
        self.non_full_runs = RbTree::new();
        self.size_class = size;
        self.num_runs = 0;

        let mut try_run_size = g.page_size;
        let (try_nregs, try_mask_elms, try_reg0_offset) = loop {
            // Counter-act the first decrement in the loop below.
            let mut nregs = ((try_run_size - RUN_FIXED_HEADER_SIZE) / size) + 1;

            // Iteratively reduce the number of regions until the run
            // header and the regions no longer overlap.  A closed
            // formula would be messy: the header's bitmap length and
            // the region count depend on each other.
            let mut mask_elms;
            let mut reg0_offset;
            loop {
                nregs -= 1;
                mask_elms = (nregs >> 5) + if nregs & 31 != 0 { 1 } else { 0 };
                reg0_offset = try_run_size - nregs * size;
                if RUN_FIXED_HEADER_SIZE + 4 * mask_elms <= reg0_offset {
                    break;
                }
            }

            // Try to keep the run overhead at or below the target.
            if reg0_offset * OVERHEAD_DEN <= try_run_size * RUN_OVERHEAD_NUM {
                break (nregs, mask_elms, reg0_offset);
            }

            // If the overhead exceeds the size class, the class is small
            // and aligns poorly with the header; smaller runs are worth
            // a relaxed overhead target.
            if reg0_offset > size
                && reg0_offset * OVERHEAD_DEN <= try_run_size * RUN_RELAXED_OVERHEAD_NUM
            {
                break (nregs, mask_elms, reg0_offset);
            }

            // For small enough classes the bitmap dominates: growing the
            // run adds roughly one mask bit per size-class worth of
            // bytes, so the overhead target is unreachable.  Give up
            // once the bitmap is as large as the fixed header.
            if mask_elms * 4 >= RUN_FIXED_HEADER_SIZE {
                break (nregs, mask_elms, reg0_offset);
            }

            // Can't do better than this within the largest large class.
            if try_run_size + g.page_size > g.max_large_class {
                break (nregs, mask_elms, reg0_offset);
            }

            try_run_size += g.page_size;
        };

        assert!(RUN_FIXED_HEADER_SIZE + 4 * try_mask_elms <= try_reg0_offset);
        assert!(try_mask_elms * 32 >= try_nregs);
        assert!(try_run_size >> g.page_size_2pow <= u8::MAX as usize);

        self.run_size_pages = (try_run_size >> g.page_size_2pow) as u8;
        self.run_num_regions = try_nregs as u32;
        self.run_num_mask_elms = try_mask_elms as u32;
        self.run_first_region_offset = try_reg0_offset as u32;
        self.size_divisor = FastDivisor::new(size as u32, try_run_size as u32);
    }
}

pub const ARENA_MAGIC: u32 = 0x947d_3d24;

/// Creation parameters for `create_arena`.
#[repr(C)]
#[derive(Clone)]
pub struct ArenaParams {
    /// Maximum number of dirty pages, zero for the default.
    pub max_dirty: usize,
    pub flags: u32,
    pub max_dirty_increase_override: i32,
    pub max_dirty_decrease_override: i32,
}

pub const ARENA_FLAG_RANDOMIZE_SMALL_DEFAULT: u32 = 0;
pub const ARENA_FLAG_RANDOMIZE_SMALL_ENABLED: u32 = 1;
pub const ARENA_FLAG_RANDOMIZE_SMALL_DISABLED: u32 = 2;
pub const ARENA_FLAG_RANDOMIZE_SMALL_MASK: u32 = 0x3;
pub const ARENA_FLAG_THREAD_MAIN_THREAD_ONLY: u32 = 0x4;
pub const ARENA_FLAG_THREAD_MASK: u32 = 0x4;

impl Default for ArenaParams {
    fn default() -> ArenaParams {
        ArenaParams {
            max_dirty: 0,
            flags: 0,
            max_dirty_increase_override: 0,
            max_dirty_decrease_override: 0,
        }
    }
}

#[repr(C)]
pub struct Arena {
    /// Linkage for the collection's tree of arenas by id.
    pub link: RbNode<Arena>,

    /// Arena id: kept away from the beginning of the struct so the
    /// typed pool's free-list pointer doesn't overwrite it, letting the
    /// use-after-dispose check see the cleared id.
    pub id: u64,

    pub magic: u32,

    /// All operations on the arena require this lock; it is elided for
    /// main-thread-only arenas.
    pub lock: MaybeMutex,

    pub stats: ArenaStats,

    /// Tree of dirty-page-containing chunks this arena manages.
    chunks_dirty: RbTree<ArenaChunk, DirtyChunkOrder>,

    /// Head of the list of chunks with madvised-but-unpurged pages.
    /// Lazily maintained: a chunk stays listed even after its madvised
    /// pages get recommitted.
    madvised_head: *mut ArenaChunk,

    /// The most recently emptied chunk, cached to dampen chunk churn
    /// when the arena oscillates on the cusp of needing a new chunk.
    /// One spare per arena, so arenas can't starve each other of it.
    spare: *mut ArenaChunk,

    /// Per-arena opt-in to randomise the offset of small allocations.
    randomize_small: bool,

    /// Whether this is a private (moz_arena_*-style) arena.  Private
    /// arenas pin reallocations; public ones may migrate to another
    /// arena when the size class changes.
    pub is_private: bool,

    /// Initially null; initialised on first use outside the arena lock
    /// because the system RNG may allocate.
    prng: *mut XorShift128Plus,
    prng_initializing: bool,

    /// Pages in unused runs that are potentially dirty and not yet
    /// returned to the OS.  Bounded by the purge policy.
    pub num_dirty: usize,

    /// Pages available again without a syscall (but probably a fault).
    pub num_madvised: usize,
    pub num_fresh: usize,

    /// Maximum value allowed for `num_dirty`, before modifiers.
    pub max_dirty: usize,

    pub max_dirty_increase_override: i32,
    pub max_dirty_decrease_override: i32,

    /// Size/address-ordered tree of available runs, for
    /// first-best-fit run allocation.
    runs_avail: RbTree<PageMapEntry, AvailRunOrder>,

    /// One bin per small size class; only the first
    /// `num_small_classes` entries are live.
    pub bins: [Bin; MAX_NUM_SMALL_CLASSES],
}

/// Id order for the collection trees.
pub struct ArenaIdOrder;

impl RbOrder<Arena> for ArenaIdOrder {
    unsafe fn node(t: *mut Arena) -> *mut RbNode<Arena> {
        ptr::addr_of_mut!((*t).link)
    }

    unsafe fn cmp(a: *const Arena, b: *const Arena) -> Ordering {
        (*a).id.cmp(&(*b).id)
    }
}

unsafe fn page_map_index(chunk: *mut ArenaChunk, entry: *mut PageMapEntry) -> usize {
    let base = ptr::addr_of_mut!((*chunk).map) as usize;
    (entry as usize - base) / core::mem::size_of::<PageMapEntry>()
}

unsafe fn page_map_entry(chunk: *mut ArenaChunk, index: usize) -> *mut PageMapEntry {
    (ptr::addr_of_mut!((*chunk).map) as *mut PageMapEntry).add(index)
}

unsafe fn page_addr(chunk: *mut ArenaChunk, index: usize) -> *mut u8 {
    (chunk as usize + (index << globals::g().page_size_2pow)) as *mut u8
}

// Madvised-chunk list maintenance (double-purge bookkeeping).

unsafe fn madvised_list_remove(arena: *mut Arena, chunk: *mut ArenaChunk) {
    if !(*chunk).in_madvised_list {
        return;
    }
    let prev = (*chunk).madvised_prev;
    let next = (*chunk).madvised_next;
    if prev.is_null() {
        (*arena).madvised_head = next;
    } else {
        (*prev).madvised_next = next;
    }
    if !next.is_null() {
        (*next).madvised_prev = prev;
    }
    (*chunk).madvised_prev = ptr::null_mut();
    (*chunk).madvised_next = ptr::null_mut();
    (*chunk).in_madvised_list = false;
}

unsafe fn madvised_list_push_front(arena: *mut Arena, chunk: *mut ArenaChunk) {
    debug_assert!(!(*chunk).in_madvised_list);
    let head = (*arena).madvised_head;
    (*chunk).madvised_prev = ptr::null_mut();
    (*chunk).madvised_next = head;
    if !head.is_null() {
        (*head).madvised_prev = chunk;
    }
    (*arena).madvised_head = chunk;
    (*chunk).in_madvised_list = true;
}

impl Arena {
    /// Constructs an arena in place at `this` (typed-pool memory whose
    /// previous contents are garbage).
    pub unsafe fn init_at(this: *mut Arena, params: Option<&ArenaParams>, is_private: bool) {
        let g = globals::g();

        ptr::addr_of_mut!((*this).link).write(RbNode::new());
        ptr::addr_of_mut!((*this).id).write(0);
        ptr::addr_of_mut!((*this).magic).write(ARENA_MAGIC);
        ptr::addr_of_mut!((*this).stats).write(ArenaStats::default());
        ptr::addr_of_mut!((*this).chunks_dirty).write(RbTree::new());
        ptr::addr_of_mut!((*this).madvised_head).write(ptr::null_mut());
        ptr::addr_of_mut!((*this).spare).write(ptr::null_mut());

        let mut randomize = g.opt.randomize_small;
        let mut do_lock = DoLock::MustLock;
        let mut increase_override = 0;
        let mut decrease_override = 0;
        let mut max_dirty = g.opt.dirty_max / 8;
        if let Some(params) = params {
            match params.flags & ARENA_FLAG_RANDOMIZE_SMALL_MASK {
                ARENA_FLAG_RANDOMIZE_SMALL_ENABLED => randomize = true,
                ARENA_FLAG_RANDOMIZE_SMALL_DISABLED => randomize = false,
                _ => {}
            }
            if params.flags & ARENA_FLAG_THREAD_MASK == ARENA_FLAG_THREAD_MAIN_THREAD_ONLY {
                // Main-thread-only arenas must be created on the main
                // thread: that is what makes the lock elision sound, and
                // what keeps them consistent across fork().
                debug_assert!(collection::is_on_main_thread());
                debug_assert!(is_private);
                do_lock = DoLock::AvoidLockUnsafe;
            }
            increase_override = params.max_dirty_increase_override;
            decrease_override = params.max_dirty_decrease_override;
            if params.max_dirty != 0 {
                max_dirty = params.max_dirty;
            }
        }

        ptr::addr_of_mut!((*this).lock).write(MaybeMutex::new(do_lock));
        ptr::addr_of_mut!((*this).randomize_small).write(randomize);
        ptr::addr_of_mut!((*this).is_private).write(is_private);
        ptr::addr_of_mut!((*this).prng).write(ptr::null_mut());
        ptr::addr_of_mut!((*this).prng_initializing).write(false);
        ptr::addr_of_mut!((*this).num_dirty).write(0);
        ptr::addr_of_mut!((*this).num_madvised).write(0);
        ptr::addr_of_mut!((*this).num_fresh).write(0);
        ptr::addr_of_mut!((*this).max_dirty).write(max_dirty);
        ptr::addr_of_mut!((*this).max_dirty_increase_override).write(increase_override);
        ptr::addr_of_mut!((*this).max_dirty_decrease_override).write(decrease_override);
        ptr::addr_of_mut!((*this).runs_avail).write(RbTree::new());

        let bins = ptr::addr_of_mut!((*this).bins) as *mut Bin;
        for i in 0..MAX_NUM_SMALL_CLASSES {
            bins.add(i).write(Bin::empty());
        }
        let mut size_class = SizeClass::new(1);
        for i in 0..g.num_small_classes {
            (*bins.add(i)).init(size_class);
            if size_class.size() != g.max_bin_class {
                size_class = size_class.next();
            }
        }
    }

    pub unsafe fn is_main_thread_only(this: *const Arena) -> bool {
        !(*this).lock.lock_is_enabled()
    }

    /// The dirty-page threshold, adjusted by the process-wide modifier,
    /// itself clamped by the per-arena overrides.
    pub unsafe fn effective_max_dirty(this: *mut Arena) -> usize {
        let mut modifier = collection::default_max_dirty_page_modifier();
        if modifier != 0 {
            let arena_override = if modifier > 0 {
                (*this).max_dirty_increase_override
            } else {
                (*this).max_dirty_decrease_override
            };
            if arena_override != 0 {
                modifier = arena_override;
            }
        }

        if modifier >= 0 {
            (*this).max_dirty << modifier.min(31)
        } else {
            (*this).max_dirty >> (-modifier).min(31)
        }
    }

    /// During a commit of `req_pages` we may commit up to
    /// `remaining_pages` more to amortise syscalls, as long as the page
    /// cache (dirty + fresh + madvised) stays within bounds.
    unsafe fn extra_commit_pages(
        this: *mut Arena,
        req_pages: usize,
        remaining_pages: usize,
    ) -> usize {
        let modifier = collection::default_max_dirty_page_modifier();
        if modifier < 0 {
            return 0;
        }

        let max_page_cache = Arena::effective_max_dirty(this);
        let page_cache = (*this).num_dirty + (*this).num_fresh + (*this).num_madvised;

        if page_cache > max_page_cache {
            // Already exceeding the dirty budget even while allocating;
            // this happens with fragmentation.  Don't commit excess.
            return 0;
        }
        if modifier > 0 {
            // Keep all the pages we can without exceeding the cache
            // bound; the subtraction cannot underflow per the test
            // above.
            return remaining_pages.min(max_page_cache - page_cache);
        }

        // A quarter of the budget is a sensible minimum target for the
        // page cache, three quarters a sensible maximum; staying below
        // the top avoids an immediate purge on the next free.
        let min = max_page_cache / 4;
        let max = 3 * max_page_cache / 4;

        // Committing 32 pages at a time amortises the commit syscall.
        let mut amortisation_threshold = 32;

        let mut extra_pages = if req_pages < amortisation_threshold {
            amortisation_threshold - req_pages
        } else {
            0
        };

        if page_cache + extra_pages < min {
            extra_pages = min - page_cache;
        } else if page_cache + extra_pages > max {
            // Over the target, perhaps because the cache is fragmented;
            // halve the amortisation threshold so we may still commit a
            // little without exceeding the budget.
            amortisation_threshold /= 2;
            extra_pages = (if req_pages < amortisation_threshold {
                amortisation_threshold - req_pages
            } else {
                0
            })
            .min(max_page_cache - page_cache);
        }

        extra_pages = extra_pages.min(remaining_pages);

        // If what would remain is small enough to force another commit
        // soon, commit everything now, budget permitting.
        if (remaining_pages - extra_pages) < amortisation_threshold / 2
            && (page_cache + remaining_pages) < max_page_cache
        {
            return remaining_pages;
        }

        extra_pages
    }

    /// Carves `size` bytes out of the free run starting at `run`,
    /// committing pages as needed; the unused tail goes back into the
    /// available-run tree.  Returns false if a commit failed.
    unsafe fn split_run(this: *mut Arena, run: *mut Run, size: usize, large: bool, zero: bool) -> bool {
        let g = globals::g();
        let chunk = chunk_for_ptr(run as *const u8);
        let old_ndirty = (*chunk).ndirty;
        let run_ind = (run as usize - chunk as usize) >> g.page_size_2pow;
        let total_pages =
            ((*page_map_entry(chunk, run_ind)).bits & !g.page_size_mask) >> g.page_size_2pow;
        let need_pages = size >> g.page_size_2pow;
        debug_assert!(need_pages > 0);
        debug_assert!(need_pages <= total_pages);
        let rem_pages = total_pages - need_pages;

        if MALLOC_DECOMMIT {
            let mut i = 0;
            while i < need_pages {
                // Commit decommitted pages in batches: when one is
                // found, extend the commit over all needed adjacent
                // decommitted pages to cut syscall overhead.
                if (*page_map_entry(chunk, run_ind + i)).bits & MAP_DECOMMITTED != 0 {
                    let mut j = 0;
                    while i + j < need_pages
                        && (*page_map_entry(chunk, run_ind + i + j)).bits & MAP_DECOMMITTED != 0
                    {
                        debug_assert_eq!(
                            (*page_map_entry(chunk, run_ind + i + j)).bits
                                & (MAP_FRESH | MAP_MADVISED),
                            0
                        );
                        j += 1;
                    }

                    // At the edge of the run we may over-commit to
                    // amortise the call.
                    if i + j == need_pages {
                        let extra = Arena::extra_commit_pages(this, j, rem_pages);
                        while i + j < need_pages + extra
                            && (*page_map_entry(chunk, run_ind + i + j)).bits
                                & MAP_MADVISED_OR_DECOMMITTED
                                != 0
                        {
                            j += 1;
                        }
                    }

                    if !map::pages_commit(
                        page_addr(chunk, run_ind + i),
                        j << g.page_size_2pow,
                    ) {
                        return false;
                    }

                    // Committed pages are zero-filled; mark them so the
                    // zeroing below can skip them.
                    for k in 0..j {
                        let entry = page_map_entry(chunk, run_ind + i + k);
                        (*entry).bits =
                            ((*entry).bits & !MAP_DECOMMITTED) | MAP_ZEROED | MAP_FRESH;
                    }

                    (*this).num_fresh += j;
                    i += j;
                } else {
                    i += 1;
                }
            }
        }

        (*this).runs_avail.remove(page_map_entry(chunk, run_ind));

        // Keep track of trailing unused pages for later use.
        if rem_pages > 0 {
            let tail = page_map_entry(chunk, run_ind + need_pages);
            (*tail).bits =
                (rem_pages << g.page_size_2pow) | ((*tail).bits & g.page_size_mask);
            let last = page_map_entry(chunk, run_ind + total_pages - 1);
            (*last).bits =
                (rem_pages << g.page_size_2pow) | ((*last).bits & g.page_size_mask);
            (*this).runs_avail.insert(tail);
        }

        for i in 0..need_pages {
            let entry = page_map_entry(chunk, run_ind + i);

            if zero && (*entry).bits & MAP_ZEROED == 0 {
                ptr::write_bytes(page_addr(chunk, run_ind + i), 0, g.page_size);
            }

            // Update dirty-page accounting.
            if (*entry).bits & MAP_DIRTY != 0 {
                (*chunk).ndirty -= 1;
                (*this).num_dirty -= 1;
            } else if (*entry).bits & MAP_MADVISED != 0 {
                (*this).stats.committed += 1;
                (*this).num_madvised -= 1;
            }
            if (*entry).bits & MAP_FRESH != 0 {
                (*this).stats.committed += 1;
                (*this).num_fresh -= 1;
            }
            debug_assert_eq!((*entry).bits & MAP_DECOMMITTED, 0);

            (*entry).bits = if large {
                MAP_LARGE | MAP_ALLOCATED
            } else {
                (run as usize) | MAP_ALLOCATED
            };
        }

        // Only the first page of a large run carries the size; the lack
        // of size info on trailing pages only matters for interior
        // pointers.
        if large {
            (*page_map_entry(chunk, run_ind)).bits |= size;
        }

        if (*chunk).ndirty == 0 && old_ndirty > 0 {
            (*this).chunks_dirty.remove(chunk);
        }
        true
    }

    /// First-time setup of an OS-obtained chunk: header pages and both
    /// guard pages are decommitted, a committed band of
    /// `min_committed_pages` (plus commit amortisation) is marked
    /// fresh, and one free run spanning the usable range goes into the
    /// available-run tree.
    unsafe fn init_chunk(this: *mut Arena, chunk: *mut ArenaChunk, min_committed_pages: usize) {
        let g = globals::g();
        (*this).stats.mapped += CHUNK_SIZE;

        (*chunk).arena = this;
        (*chunk).link_dirty = RbNode::new();
        (*chunk).madvised_prev = ptr::null_mut();
        (*chunk).madvised_next = ptr::null_mut();
        (*chunk).in_madvised_list = false;

        // The header is overhead, not in-use pages.
        (*chunk).ndirty = 0;

        // First mark which pages are committed or decommitted and
        // perform the decommit; then update the map to create the runs.
        let mut i = 0;
        while i < g.chunk_header_npages - 1 {
            (*page_map_entry(chunk, i)).bits = 0;
            (*page_map_entry(chunk, i)).link = RbNode::new();
            i += 1;
        }
        (*this).stats.committed += g.chunk_header_npages - 1;

        // Decommit the last header page as a leading guard.
        map::pages_decommit(page_addr(chunk, i), g.page_size);
        (*page_map_entry(chunk, i)).bits = MAP_DECOMMITTED;
        (*page_map_entry(chunk, i)).link = RbNode::new();
        i += 1;

        // With decommit enabled, commit only the pages about to be
        // used; otherwise the whole usable range stays committed.
        let n_fresh_pages = if MALLOC_DECOMMIT {
            min_committed_pages
                + Arena::extra_commit_pages(
                    this,
                    min_committed_pages,
                    g.chunk_npages - g.chunk_header_npages - min_committed_pages - 1,
                )
        } else {
            g.chunk_npages - 1 - g.chunk_header_npages
        };

        // Committed pages start out fresh; split_run accounts for them
        // when it hands them out.
        for j in 0..n_fresh_pages {
            (*page_map_entry(chunk, i + j)).bits = MAP_ZEROED | MAP_FRESH;
            (*page_map_entry(chunk, i + j)).link = RbNode::new();
        }
        i += n_fresh_pages;
        (*this).num_fresh += n_fresh_pages;

        debug_assert!(MALLOC_DECOMMIT || i == g.chunk_npages - 1);

        // Decommit the remainder of the chunk plus the trailing guard
        // page (just the guard when decommit is disabled).
        map::pages_decommit(page_addr(chunk, i), (g.chunk_npages - i) << g.page_size_2pow);
        while i < g.chunk_npages {
            (*page_map_entry(chunk, i)).bits = MAP_DECOMMITTED;
            (*page_map_entry(chunk, i)).link = RbNode::new();
            i += 1;
        }

        debug_assert!(min_committed_pages > 0);
        debug_assert!(min_committed_pages <= g.chunk_npages - g.chunk_header_npages - 1);

        // Create one run spanning all usable pages.
        (*page_map_entry(chunk, g.chunk_header_npages)).bits |= g.max_large_class;
        (*page_map_entry(chunk, g.chunk_npages - 2)).bits |= g.max_large_class;
        (*this)
            .runs_avail
            .insert(page_map_entry(chunk, g.chunk_header_npages));
    }

    /// Makes `chunk` (now empty) the spare, returning the chunk that
    /// must be released with `chunk_dealloc` outside the arena lock (the
    /// retiring spare, if any).
    unsafe fn dealloc_chunk(this: *mut Arena, chunk: *mut ArenaChunk) -> *mut ArenaChunk {
        let g = globals::g();
        let spare = (*this).spare;
        if !spare.is_null() {
            if (*spare).ndirty > 0 {
                (*(*spare).arena).chunks_dirty.remove(spare);
                (*this).num_dirty -= (*spare).ndirty;
                (*this).stats.committed -= (*spare).ndirty;
            }

            // Count the retiring spare's madvised/fresh populations out
            // of the arena totals.
            let mut madvised = 0;
            let mut fresh = 0;
            for i in g.chunk_header_npages..g.chunk_npages - 1 {
                let bits = (*page_map_entry(spare, i)).bits;
                debug_assert!(
                    bits & (MAP_FRESH_MADVISED_OR_DECOMMITTED | MAP_DIRTY) != 0
                );
                if bits & MAP_MADVISED != 0 {
                    madvised += 1;
                } else if bits & MAP_FRESH != 0 {
                    fresh += 1;
                }
            }
            (*this).num_madvised -= madvised;
            (*this).num_fresh -= fresh;

            if MALLOC_DOUBLE_PURGE {
                madvised_list_remove(this, spare);
            }

            (*this).stats.mapped -= CHUNK_SIZE;
            (*this).stats.committed -= g.chunk_header_npages - 1;
        }

        // Take the chunk's whole-span run out of the available tree so
        // the arena stops using it; dirty-page flushing only uses the
        // dirty-chunk tree, so leaving the chunk there is fine.
        (*this)
            .runs_avail
            .remove(page_map_entry(chunk, g.chunk_header_npages));

        (*this).spare = chunk;
        spare
    }

    /// Allocates a run of `size` bytes (a page multiple) from the
    /// lowest-addressed best fit, the spare chunk, or a fresh chunk.
    unsafe fn alloc_run(this: *mut Arena, size: usize, large: bool, zero: bool) -> *mut Run {
        let g = globals::g();
        debug_assert!(size <= g.max_large_class);
        debug_assert_eq!(size & g.page_size_mask, 0);

        let key = PageMapEntry {
            link: RbNode::new(),
            bits: size | MAP_KEY,
        };
        let mapelm = (*this).runs_avail.search_or_next(&key);
        let run = if !mapelm.is_null() {
            let chunk = chunk_for_ptr(mapelm as *const u8);
            let pageind = page_map_index(chunk, mapelm);
            page_addr(chunk, pageind) as *mut Run
        } else if !(*this).spare.is_null() {
            // Use the spare.
            let chunk = (*this).spare;
            (*this).spare = ptr::null_mut();
            let run = page_addr(chunk, g.chunk_header_npages) as *mut Run;
            // Reinsert the spare's run into the tree of available runs.
            (*this)
                .runs_avail
                .insert(page_map_entry(chunk, g.chunk_header_npages));
            run
        } else {
            // No usable runs; create a new chunk to allocate from.
            let chunk = match chunk_alloc(CHUNK_SIZE, CHUNK_SIZE, false) {
                Some(chunk) => chunk.as_ptr() as *mut ArenaChunk,
                None => return ptr::null_mut(),
            };
            Arena::init_chunk(this, chunk, size >> g.page_size_2pow);
            page_addr(chunk, g.chunk_header_npages) as *mut Run
        };

        if Arena::split_run(this, run, size, large, zero) {
            run
        } else {
            ptr::null_mut()
        }
    }

    /// Returns freed pages to the OS until the arena's dirty count
    /// drops to half of `max_dirty`.  Passing one purges everything.
    pub unsafe fn purge(this: *mut Arena, max_dirty: usize) {
        let g = globals::g();

        #[cfg(debug_assertions)]
        {
            let mut ndirty = 0;
            for chunk in (*this).chunks_dirty.iter() {
                ndirty += (*chunk).ndirty;
            }
            debug_assert_eq!(ndirty, (*this).num_dirty);
        }
        debug_assert!(max_dirty == 1 || (*this).num_dirty > max_dirty);

        // Iterate downward through chunks and, within a chunk, downward
        // through pages, purging maximal dirty ranges; terminate as
        // early as possible to minimise syscalls even if that purges a
        // chunk only partially.
        while (*this).num_dirty > (max_dirty >> 1) {
            let mut madvised = false;
            let chunk = (*this).chunks_dirty.last();
            debug_assert!(!chunk.is_null());
            // Last page is decommitted as a guard page.
            debug_assert!(
                (*page_map_entry(chunk, g.chunk_npages - 1)).bits & MAP_DECOMMITTED != 0
            );
            let mut i = g.chunk_npages - 2;
            'chunk: while (*chunk).ndirty > 0 {
                debug_assert!(i >= g.chunk_header_npages);
                if (*page_map_entry(chunk, i)).bits & MAP_DIRTY != 0 {
                    let free_operation = if MALLOC_DECOMMIT {
                        MAP_DECOMMITTED
                    } else {
                        MAP_MADVISED
                    };
                    debug_assert_eq!(
                        (*page_map_entry(chunk, i)).bits & MAP_FRESH_MADVISED_OR_DECOMMITTED,
                        0
                    );
                    (*page_map_entry(chunk, i)).bits ^= free_operation | MAP_DIRTY;
                    // Find adjacent dirty pages.
                    let mut npages = 1;
                    while i > g.chunk_header_npages
                        && (*page_map_entry(chunk, i - 1)).bits & MAP_DIRTY != 0
                    {
                        i -= 1;
                        debug_assert_eq!(
                            (*page_map_entry(chunk, i)).bits
                                & MAP_FRESH_MADVISED_OR_DECOMMITTED,
                            0
                        );
                        (*page_map_entry(chunk, i)).bits ^= free_operation | MAP_DIRTY;
                        npages += 1;
                    }
                    (*chunk).ndirty -= npages;
                    (*this).num_dirty -= npages;

                    if MALLOC_DECOMMIT {
                        map::pages_decommit(
                            page_addr(chunk, i),
                            npages << g.page_size_2pow,
                        );
                    } else {
                        map::pages_madvise_free(
                            page_addr(chunk, i),
                            npages << g.page_size_2pow,
                        );
                        (*this).num_madvised += npages;
                        madvised = true;
                    }
                    (*this).stats.committed -= npages;

                    if (*this).num_dirty <= (max_dirty >> 1) {
                        break 'chunk;
                    }
                }
                if i == 0 {
                    break;
                }
                i -= 1;
            }

            if (*chunk).ndirty == 0 {
                (*this).chunks_dirty.remove(chunk);
            }
            if MALLOC_DOUBLE_PURGE && madvised {
                // The chunk might already be listed; this makes sure it
                // is at the front.
                madvised_list_remove(this, chunk);
                madvised_list_push_front(this, chunk);
            }
        }
    }

    /// Returns a run to the arena, marking its pages dirty or plainly
    /// unallocated, coalescing with free neighbours, and possibly
    /// retiring the whole chunk and/or purging.  The returned chunk (if
    /// any) must be released with `chunk_dealloc` outside the lock.
    unsafe fn dalloc_run(this: *mut Arena, run: *mut Run, dirty: bool) -> *mut ArenaChunk {
        let g = globals::g();
        let chunk = chunk_for_ptr(run as *const u8);
        let mut run_ind = (run as usize - chunk as usize) >> g.page_size_2pow;
        debug_assert!(run_ind >= g.chunk_header_npages);
        assert!(run_ind < g.chunk_npages - 1);
        let mut size;
        let mut run_pages;
        if (*page_map_entry(chunk, run_ind)).bits & MAP_LARGE != 0 {
            size = (*page_map_entry(chunk, run_ind)).bits & !g.page_size_mask;
            run_pages = size >> g.page_size_2pow;
        } else {
            run_pages = (*(*run).bin).run_size_pages as usize;
            size = run_pages << g.page_size_2pow;
        }

        // Mark pages as unallocated in the chunk map.
        if dirty {
            for i in 0..run_pages {
                let entry = page_map_entry(chunk, run_ind + i);
                debug_assert_eq!((*entry).bits & MAP_DIRTY, 0);
                (*entry).bits = MAP_DIRTY;
            }
            if (*chunk).ndirty == 0 {
                (*this).chunks_dirty.insert(chunk);
            }
            (*chunk).ndirty += run_pages;
            (*this).num_dirty += run_pages;
        } else {
            for i in 0..run_pages {
                let entry = page_map_entry(chunk, run_ind + i);
                (*entry).bits &= !(MAP_LARGE | MAP_ALLOCATED);
            }
        }
        let entry = page_map_entry(chunk, run_ind);
        (*entry).bits = size | ((*entry).bits & g.page_size_mask);
        let last = page_map_entry(chunk, run_ind + run_pages - 1);
        (*last).bits = size | ((*last).bits & g.page_size_mask);

        // Try to coalesce forward.
        if run_ind + run_pages < g.chunk_npages - 1
            && (*page_map_entry(chunk, run_ind + run_pages)).bits & MAP_ALLOCATED == 0
        {
            let nrun_size =
                (*page_map_entry(chunk, run_ind + run_pages)).bits & !g.page_size_mask;

            // Remove the successor from the available-run tree; the
            // coalesced run is inserted later.
            (*this)
                .runs_avail
                .remove(page_map_entry(chunk, run_ind + run_pages));

            size += nrun_size;
            run_pages = size >> g.page_size_2pow;

            debug_assert_eq!(
                (*page_map_entry(chunk, run_ind + run_pages - 1)).bits & !g.page_size_mask,
                nrun_size
            );
            let entry = page_map_entry(chunk, run_ind);
            (*entry).bits = size | ((*entry).bits & g.page_size_mask);
            let last = page_map_entry(chunk, run_ind + run_pages - 1);
            (*last).bits = size | ((*last).bits & g.page_size_mask);
        }

        // Try to coalesce backward.
        if run_ind > g.chunk_header_npages
            && (*page_map_entry(chunk, run_ind - 1)).bits & MAP_ALLOCATED == 0
        {
            let prun_size = (*page_map_entry(chunk, run_ind - 1)).bits & !g.page_size_mask;

            run_ind -= prun_size >> g.page_size_2pow;

            (*this).runs_avail.remove(page_map_entry(chunk, run_ind));

            size += prun_size;
            run_pages = size >> g.page_size_2pow;

            debug_assert_eq!(
                (*page_map_entry(chunk, run_ind)).bits & !g.page_size_mask,
                prun_size
            );
            let entry = page_map_entry(chunk, run_ind);
            (*entry).bits = size | ((*entry).bits & g.page_size_mask);
            let last = page_map_entry(chunk, run_ind + run_pages - 1);
            (*last).bits = size | ((*last).bits & g.page_size_mask);
        }

        // Insert into the available-run tree now that coalescing is
        // complete.
        (*this).runs_avail.insert(page_map_entry(chunk, run_ind));

        // Retire the chunk if it is now completely unused.
        let mut chunk_dealloc_delay = ptr::null_mut();
        let head = page_map_entry(chunk, g.chunk_header_npages);
        if ((*head).bits & (!g.page_size_mask | MAP_ALLOCATED)) == g.max_large_class {
            chunk_dealloc_delay = Arena::dealloc_chunk(this, chunk);
        }

        let max_dirty = Arena::effective_max_dirty(this);
        if (*this).num_dirty > max_dirty {
            Arena::purge(this, max_dirty);
        }

        chunk_dealloc_delay
    }

    /// Splits off the leading `old_size - new_size` bytes of a large run
    /// and frees them, leaving the caller the aligned tail.
    unsafe fn trim_run_head(
        this: *mut Arena,
        chunk: *mut ArenaChunk,
        run: *mut Run,
        old_size: usize,
        new_size: usize,
    ) {
        let g = globals::g();
        let pageind = (run as usize - chunk as usize) >> g.page_size_2pow;
        let head_npages = (old_size - new_size) >> g.page_size_2pow;
        debug_assert!(old_size > new_size);

        // Update the map so the leading run appears separately
        // allocated before freeing it.
        (*page_map_entry(chunk, pageind)).bits =
            (old_size - new_size) | MAP_LARGE | MAP_ALLOCATED;
        (*page_map_entry(chunk, pageind + head_npages)).bits =
            new_size | MAP_LARGE | MAP_ALLOCATED;

        let no_chunk = Arena::dalloc_run(this, run, false);
        // There is still at least one allocated run in the chunk.
        debug_assert!(no_chunk.is_null());
    }

    /// Splits off and frees the trailing `old_size - new_size` bytes of
    /// a large run.
    unsafe fn trim_run_tail(
        this: *mut Arena,
        chunk: *mut ArenaChunk,
        run: *mut Run,
        old_size: usize,
        new_size: usize,
        dirty: bool,
    ) {
        let g = globals::g();
        let pageind = (run as usize - chunk as usize) >> g.page_size_2pow;
        let npages = new_size >> g.page_size_2pow;
        debug_assert!(old_size > new_size);

        (*page_map_entry(chunk, pageind)).bits = new_size | MAP_LARGE | MAP_ALLOCATED;
        (*page_map_entry(chunk, pageind + npages)).bits =
            (old_size - new_size) | MAP_LARGE | MAP_ALLOCATED;

        let no_chunk =
            Arena::dalloc_run(this, (run as usize + new_size) as *mut Run, dirty);
        debug_assert!(no_chunk.is_null());
    }

    /// Finds or creates a run with a free region for `bin`.
    unsafe fn get_non_full_bin_run(this: *mut Arena, bin: *mut Bin) -> *mut Run {
        let g = globals::g();

        let mapelm = (*bin).non_full_runs.first();
        if !mapelm.is_null() {
            // This run is guaranteed to have available space.
            (*bin).non_full_runs.remove(mapelm);
            return ((*mapelm).bits & !g.page_size_mask) as *mut Run;
        }
        // No existing runs have any space available; allocate one.
        let run = Arena::alloc_run(
            this,
            ((*bin).run_size_pages as usize) << g.page_size_2pow,
            false,
            false,
        );
        if run.is_null() {
            return ptr::null_mut();
        }
        if run == (*bin).current_run {
            return run;
        }

        // Initialise run internals: all regions free.
        (*run).bin = bin;
        let mask_elms = (*bin).run_num_mask_elms;
        for i in 0..mask_elms - 1 {
            *run_mask_ptr(run, i) = u32::MAX;
        }
        let remainder = (*bin).run_num_regions & 31;
        *run_mask_ptr(run, mask_elms - 1) = if remainder == 0 {
            u32::MAX
        } else {
            // The last element has spare bits that must stay unset.
            u32::MAX >> (32 - remainder)
        };
        (*run).regions_min_elm = 0;
        (*run).num_free = (*bin).run_num_regions;
        (*run).magic = RUN_MAGIC;

        (*bin).num_runs += 1;
        run
    }

    /// Picks a free bit in `mask`, randomising the starting position
    /// when the arena's PRNG is enabled.  `rng_pos` caches the random
    /// rotation across bitmap words of one allocation.
    unsafe fn find_free_bit_in_mask(this: *mut Arena, mask: u32, rng_pos: &mut u32) -> u32 {
        if !(*this).prng.is_null() {
            if *rng_pos == u32::MAX {
                *rng_pos = ((*(*this).prng).next() % 32) as u32;
            }
            let rotated = mask.rotate_right(*rng_pos);
            (rotated.trailing_zeros() + *rng_pos) % 32
        } else {
            mask.trailing_zeros()
        }
    }

    /// Claims a free region in `run`.
    unsafe fn run_reg_alloc(this: *mut Arena, run: *mut Run, bin: *mut Bin) -> *mut u8 {
        let mut rng_pos = u32::MAX;
        debug_assert_eq!((*run).magic, RUN_MAGIC);
        debug_assert!((*run).regions_min_elm < (*bin).run_num_mask_elms);

        // The first probe is unrolled so regions_min_elm only gets
        // updated when the scan moves past its word.
        let mut i = (*run).regions_min_elm;
        let mut mask = *run_mask_ptr(run, i);
        if mask != 0 {
            let bit = Arena::find_free_bit_in_mask(this, mask, &mut rng_pos);
            let regind = (i << 5) + bit;
            debug_assert!(regind < (*bin).run_num_regions);
            let ret = (run as usize
                + (*bin).run_first_region_offset as usize
                + (*bin).size_class * regind as usize) as *mut u8;
            mask ^= 1 << bit;
            *run_mask_ptr(run, i) = mask;
            return ret;
        }

        i += 1;
        while i < (*bin).run_num_mask_elms {
            let mut mask = *run_mask_ptr(run, i);
            if mask != 0 {
                let bit = Arena::find_free_bit_in_mask(this, mask, &mut rng_pos);
                let regind = (i << 5) + bit;
                debug_assert!(regind < (*bin).run_num_regions);
                let ret = (run as usize
                    + (*bin).run_first_region_offset as usize
                    + (*bin).size_class * regind as usize) as *mut u8;
                mask ^= 1 << bit;
                *run_mask_ptr(run, i) = mask;
                // Nothing before this element contains a free region.
                (*run).regions_min_elm = i;
                return ret;
            }
            i += 1;
        }
        unreachable!("run advertised free regions but its bitmap is full");
    }

    /// Small allocation path.
    pub unsafe fn malloc_small(this: *mut Arena, size: usize, zero: bool) -> *mut u8 {
        let size_class = SizeClass::new(size);
        let size = size_class.size();
        let bin = ptr::addr_of_mut!((*this).bins[size_class.bin_index()]);
        debug_assert_eq!(size, (*bin).size_class);

        let ret;
        {
            let guard = (*this).lock.lock();

            if (*this).randomize_small
                && (*this).prng.is_null()
                && !(*this).prng_initializing
            {
                // Another thread could race here, and the system RNG may
                // allocate, so flag the initialisation and drop the lock
                // while gathering entropy.
                (*this).prng_initializing = true;
                (*this).lock.raw_unlock();
                let seed0 = os_random_u64();
                let seed1 = os_random_u64();
                let backing = crate::base::base_alloc(
                    core::mem::size_of::<XorShift128Plus>(),
                ) as *mut XorShift128Plus;
                if !backing.is_null() {
                    backing.write(XorShift128Plus::new(seed0, seed1));
                }
                (*this).lock.raw_lock();
                (*this).prng = backing;
                (*this).prng_initializing = false;
            }

            let mut run = (*bin).current_run;
            if run.is_null() || (*run).num_free == 0 {
                run = Arena::get_non_full_bin_run(this, bin);
                (*bin).current_run = run;
            }
            if run.is_null() {
                return ptr::null_mut();
            }
            debug_assert_eq!((*run).magic, RUN_MAGIC);
            debug_assert!((*run).num_free > 0);
            ret = Arena::run_reg_alloc(this, run, bin);
            (*run).num_free -= 1;

            (*this).stats.allocated_small += size;
            drop(guard);
        }

        if zero {
            ptr::write_bytes(ret, 0, size);
        } else {
            apply_zero_or_junk(ret, size);
        }
        ret
    }

    pub unsafe fn malloc_large(this: *mut Arena, size: usize, zero: bool) -> *mut u8 {
        let size = globals::g().page_ceiling(size);

        let ret;
        {
            let _guard = (*this).lock.lock();
            ret = Arena::alloc_run(this, size, true, zero) as *mut u8;
            if ret.is_null() {
                return ptr::null_mut();
            }
            (*this).stats.allocated_large += size;
        }

        if !zero {
            apply_zero_or_junk(ret, size);
        }
        ret
    }

    pub unsafe fn malloc(this: *mut Arena, size: usize, zero: bool) -> *mut u8 {
        debug_assert_eq!((*this).magic, ARENA_MAGIC);
        debug_assert!(size != 0);
        let g = globals::g();

        if size <= g.max_bin_class {
            Arena::malloc_small(this, size, zero)
        } else if size <= g.max_large_class {
            Arena::malloc_large(this, size, zero)
        } else {
            huge::malloc_huge(this, size, zero)
        }
    }

    /// Large allocation with more than page alignment: over-allocate by
    /// `alloc_size` and trim the misaligned head and surplus tail.
    unsafe fn palloc_large(
        this: *mut Arena,
        alignment: usize,
        size: usize,
        alloc_size: usize,
    ) -> *mut u8 {
        let g = globals::g();
        debug_assert_eq!(size & g.page_size_mask, 0);
        debug_assert_eq!(alignment & g.page_size_mask, 0);

        let mut ret;
        {
            let _guard = (*this).lock.lock();
            ret = Arena::alloc_run(this, alloc_size, true, false) as *mut u8;
            if ret.is_null() {
                return ptr::null_mut();
            }

            let chunk = chunk_for_ptr(ret);
            let offset = ret as usize & (alignment - 1);
            debug_assert_eq!(offset & g.page_size_mask, 0);
            debug_assert!(offset < alloc_size);
            if offset == 0 {
                Arena::trim_run_tail(this, chunk, ret as *mut Run, alloc_size, size, false);
            } else {
                let leadsize = alignment - offset;
                if leadsize > 0 {
                    Arena::trim_run_head(
                        this,
                        chunk,
                        ret as *mut Run,
                        alloc_size,
                        alloc_size - leadsize,
                    );
                    ret = (ret as usize + leadsize) as *mut u8;
                }
                let trailsize = alloc_size - leadsize - size;
                if trailsize != 0 {
                    debug_assert!(trailsize < alloc_size);
                    Arena::trim_run_tail(
                        this,
                        chunk,
                        ret as *mut Run,
                        size + trailsize,
                        size,
                        false,
                    );
                }
            }

            (*this).stats.allocated_large += size;
        }

        apply_zero_or_junk(ret, size);
        ret
    }

    /// Aligned allocation of any size.
    pub unsafe fn palloc(this: *mut Arena, alignment: usize, size: usize) -> *mut u8 {
        let g = globals::g();

        // Round size up to the nearest multiple of alignment.  For each
        // small size class, every object is aligned at the smallest
        // power of two that is non-zero in the base-two representation
        // of the size, so the rounded request lands correctly aligned.
        let ceil_size = alignment_ceiling(size, alignment);
        // (ceil_size < size) protects against overflow for maximal
        // alignment and size.
        if ceil_size < size {
            return ptr::null_mut();
        }

        let ret;
        if ceil_size <= g.page_size
            || (alignment <= g.page_size && ceil_size <= g.max_large_class)
        {
            ret = Arena::malloc(this, ceil_size, false);
        } else {
            // We can't achieve sub-page alignment, so round up the
            // alignment permanently to simplify the arithmetic.
            let alignment = g.page_ceiling(alignment);
            let ceil_size = g.page_ceiling(size);

            // Overflow checks: the new ceil_size may now be *equal* to
            // the maximal alignment, not just greater.
            if ceil_size < size || ceil_size.checked_add(alignment).is_none() {
                return ptr::null_mut();
            }

            // The over-size run that guarantees the alignment exists.
            let run_size = if ceil_size >= alignment {
                ceil_size + alignment - g.page_size
            } else {
                // The doubling may wrap, but then run_size exceeds
                // every class and the bogus value is never used.
                alignment.wrapping_shl(1).wrapping_sub(g.page_size)
            };

            if run_size <= g.max_large_class {
                ret = Arena::palloc_large(this, alignment, ceil_size, run_size);
            } else if alignment <= CHUNK_SIZE {
                ret = huge::malloc_huge(this, ceil_size, false);
            } else {
                ret = huge::palloc_huge(this, ceil_size, alignment, false);
            }
        }

        debug_assert_eq!(ret as usize & (alignment - 1), 0);
        ret
    }

    /// Frees a small region.  Returns a chunk to release outside the
    /// lock, if the containing run emptied the chunk.
    pub unsafe fn dalloc_small(
        this: *mut Arena,
        chunk: *mut ArenaChunk,
        ptr_in: *mut u8,
        mapelm: *mut PageMapEntry,
    ) -> *mut ArenaChunk {
        let g = globals::g();
        let run = ((*mapelm).bits & !g.page_size_mask) as *mut Run;
        debug_assert_eq!((*run).magic, RUN_MAGIC);
        let bin = (*run).bin;
        let size = (*bin).size_class;
        debug_assert!(
            ptr_in as usize >= run as usize + (*bin).run_first_region_offset as usize
        );

        run_reg_dalloc(run, bin, ptr_in, size);
        (*run).num_free += 1;
        let mut dealloc_chunk = ptr::null_mut();

        if (*run).num_free == (*bin).run_num_regions {
            // The run is empty: pull it out of the bin structures and
            // give the pages back to the arena.
            if run == (*bin).current_run {
                (*bin).current_run = ptr::null_mut();
            } else if (*bin).run_num_regions != 1 {
                // One-region runs never enter the non-full tree: they go
                // from full to empty directly.
                let run_pageind = (run as usize - chunk as usize) >> g.page_size_2pow;
                let run_mapelm = page_map_entry(chunk, run_pageind);
                debug_assert_eq!((*bin).non_full_runs.search(run_mapelm), run_mapelm);
                (*bin).non_full_runs.remove(run_mapelm);
            }
            (*run).magic = 0;
            dealloc_chunk = Arena::dalloc_run(this, run, true);
            (*bin).num_runs -= 1;
        } else if (*run).num_free == 1 && run != (*bin).current_run {
            // The run went from full to non-full: it becomes the
            // current run if it is the lowest-addressed non-full one,
            // otherwise it enters the non-full tree.
            if (*bin).current_run.is_null() {
                (*bin).current_run = run;
            } else if (run as usize) < (*bin).current_run as usize {
                let runcur = (*bin).current_run;
                if (*runcur).num_free > 0 {
                    // Reinsert the displaced current run.
                    let runcur_chunk = chunk_for_ptr(runcur as *const u8);
                    let runcur_pageind =
                        (runcur as usize - runcur_chunk as usize) >> g.page_size_2pow;
                    let runcur_mapelm = page_map_entry(runcur_chunk, runcur_pageind);
                    debug_assert!((*bin).non_full_runs.search(runcur_mapelm).is_null());
                    (*bin).non_full_runs.insert(runcur_mapelm);
                }
                (*bin).current_run = run;
            } else {
                let run_pageind = (run as usize - chunk as usize) >> g.page_size_2pow;
                let run_mapelm = page_map_entry(chunk, run_pageind);
                debug_assert!((*bin).non_full_runs.search(run_mapelm).is_null());
                (*bin).non_full_runs.insert(run_mapelm);
            }
        }
        (*this).stats.allocated_small -= size;

        dealloc_chunk
    }

    /// Frees a large allocation.  Same delayed-chunk contract as
    /// `dalloc_small`.
    pub unsafe fn dalloc_large(
        this: *mut Arena,
        chunk: *mut ArenaChunk,
        ptr_in: *mut u8,
    ) -> *mut ArenaChunk {
        let g = globals::g();
        debug_assert_eq!(ptr_in as usize & g.page_size_mask, 0);
        let pageind = (ptr_in as usize - chunk as usize) >> g.page_size_2pow;
        let size = (*page_map_entry(chunk, pageind)).bits & !g.page_size_mask;

        (*this).stats.allocated_large -= size;

        Arena::dalloc_run(this, ptr_in as *mut Run, true)
    }

    /// In-place shrink of a large allocation.
    unsafe fn ralloc_shrink_large(
        this: *mut Arena,
        chunk: *mut ArenaChunk,
        ptr_in: *mut u8,
        size: usize,
        old_size: usize,
    ) {
        debug_assert!(size < old_size);

        let _guard = (*this).lock.lock();
        Arena::trim_run_tail(this, chunk, ptr_in as *mut Run, old_size, size, true);
        (*this).stats.allocated_large -= old_size - size;
    }

    /// In-place growth of a large allocation into the free run that
    /// follows it, when there is one and it suffices.
    unsafe fn ralloc_grow_large(
        this: *mut Arena,
        chunk: *mut ArenaChunk,
        ptr_in: *mut u8,
        size: usize,
        old_size: usize,
    ) -> bool {
        let g = globals::g();
        let pageind = (ptr_in as usize - chunk as usize) >> g.page_size_2pow;
        let npages = old_size >> g.page_size_2pow;

        let _guard = (*this).lock.lock();
        debug_assert_eq!(
            old_size,
            (*page_map_entry(chunk, pageind)).bits & !g.page_size_mask
        );

        debug_assert!(size > old_size);
        if pageind + npages < g.chunk_npages - 1
            && (*page_map_entry(chunk, pageind + npages)).bits & MAP_ALLOCATED == 0
            && (*page_map_entry(chunk, pageind + npages)).bits & !g.page_size_mask
                >= size - old_size
        {
            // The next run is free and large enough.  Split it and merge
            // its first part with the existing allocation.
            if !Arena::split_run(
                this,
                page_addr(chunk, pageind + npages) as *mut Run,
                size - old_size,
                true,
                false,
            ) {
                return false;
            }

            (*page_map_entry(chunk, pageind)).bits = size | MAP_LARGE | MAP_ALLOCATED;
            (*page_map_entry(chunk, pageind + npages)).bits = MAP_LARGE | MAP_ALLOCATED;

            (*this).stats.allocated_large += size - old_size;
            return true;
        }

        false
    }

    unsafe fn ralloc_small_or_large(
        this: *mut Arena,
        ptr_in: *mut u8,
        size: usize,
        old_size: usize,
    ) -> *mut u8 {
        let g = globals::g();
        let size_class = SizeClass::new(size);

        // Try to avoid moving the allocation.
        if old_size <= g.max_large_class && size_class.size() == old_size {
            if size < old_size {
                maybe_poison((ptr_in as usize + size) as *mut u8, old_size - size);
            }
            return ptr_in;
        }
        if size_class.ty() == ClassType::Large
            && old_size > g.max_bin_class
            && old_size <= g.max_large_class
        {
            let chunk = chunk_for_ptr(ptr_in);
            if size_class.size() < old_size {
                // Fill before shrinking to avoid a window where the
                // freed tail holds live-looking data.
                maybe_poison((ptr_in as usize + size) as *mut u8, old_size - size);
                Arena::ralloc_shrink_large(this, chunk, ptr_in, size_class.size(), old_size);
                return ptr_in;
            }
            if Arena::ralloc_grow_large(this, chunk, ptr_in, size_class.size(), old_size) {
                apply_zero_or_junk((ptr_in as usize + old_size) as *mut u8, size - old_size);
                return ptr_in;
            }
        }

        // The classes differ enough that the object has to move.
        // Non-private arenas may switch arenas here.
        let dest = if (*this).is_private {
            this
        } else {
            collection::choose_arena(size)
        };
        let ret = Arena::malloc(dest, size, false);
        if ret.is_null() {
            return ptr::null_mut();
        }

        // Junk/zero filling is already done by malloc.
        let copy_size = size.min(old_size);
        ptr::copy_nonoverlapping(ptr_in, ret, copy_size);
        idalloc(ptr_in, this);
        ret
    }

    pub unsafe fn ralloc(
        this: *mut Arena,
        ptr_in: *mut u8,
        size: usize,
        old_size: usize,
    ) -> *mut u8 {
        debug_assert_eq!((*this).magic, ARENA_MAGIC);
        debug_assert!(!ptr_in.is_null());
        debug_assert!(size != 0);

        if size <= globals::g().max_large_class {
            Arena::ralloc_small_or_large(this, ptr_in, size, old_size)
        } else {
            huge::ralloc_huge(this, ptr_in, size, old_size)
        }
    }

    /// Forces the OS to reclaim this arena's madvised pages (platforms
    /// with lazy purge), reclassifying them as fresh.
    pub unsafe fn hard_purge(this: *mut Arena) {
        let _guard = (*this).lock.lock();
        while !(*this).madvised_head.is_null() {
            let chunk = (*this).madvised_head;
            madvised_list_remove(this, chunk);
            let npages = hard_purge_chunk(chunk);
            (*this).num_madvised -= npages;
            (*this).num_fresh += npages;
        }
    }

    /// Checks the arena is empty and resets it for disposal.  Crashes
    /// if allocations are still live.
    pub unsafe fn assert_empty_and_reset(this: *mut Arena) {
        let g = globals::g();
        {
            let _guard = (*this).lock.lock();
            assert!(
                (*this).stats.allocated_small == 0 && (*this).stats.allocated_large == 0,
                "disposing of a non-empty arena"
            );
            for i in 0..g.num_small_classes {
                assert!(
                    (*this).bins[i].non_full_runs.is_empty(),
                    "disposing of an arena with a non-empty bin"
                );
            }
        }
        let spare = (*this).spare;
        if !spare.is_null() {
            (*this).spare = ptr::null_mut();
            chunk_dealloc(spare as *mut u8, CHUNK_SIZE, ChunkType::Arena);
        }
        huge::assert_no_huge_for_arena(this);
        (*this).id = 0;
        (*this).magic = 0;
    }
}

/// Releases a region back to its run's bitmap, crashing on double-free.
unsafe fn run_reg_dalloc(run: *mut Run, bin: *mut Bin, ptr_in: *mut u8, size: usize) {
    debug_assert_eq!((*run).magic, RUN_MAGIC);

    // A real division here costs over 20% of allocator throughput, so
    // multiply by the precomputed inverse instead.
    let diff =
        (ptr_in as usize - run as usize - (*bin).run_first_region_offset as usize) as u32;
    debug_assert!(
        diff as usize <= ((*bin).run_size_pages as usize) << globals::g().page_size_2pow
    );
    let regind = (*bin).size_divisor.divide(diff);
    debug_assert_eq!(diff as usize, regind as usize * size);
    debug_assert!(regind < (*bin).run_num_regions);

    let elm = regind >> 5;
    if elm < (*run).regions_min_elm {
        (*run).regions_min_elm = elm;
    }
    let bit = regind & 31;
    assert_eq!(
        *run_mask_ptr(run, elm) & (1 << bit),
        0,
        "double-free of small allocation"
    );
    *run_mask_ptr(run, elm) |= 1 << bit;
}

/// See the matching logic in `Arena::purge`: decommit-and-recommit every
/// madvised range of the chunk so the OS drops the resident pages, and
/// mark them fresh.
unsafe fn hard_purge_chunk(chunk: *mut ArenaChunk) -> usize {
    let g = globals::g();
    let mut total_npages = 0;
    let mut i = g.chunk_header_npages;
    while i < g.chunk_npages {
        let mut npages = 0;
        while i + npages < g.chunk_npages
            && (*page_map_entry(chunk, i + npages)).bits & MAP_MADVISED != 0
        {
            let entry = page_map_entry(chunk, i + npages);
            debug_assert_eq!((*entry).bits & (MAP_FRESH | MAP_DECOMMITTED), 0);
            (*entry).bits ^= MAP_MADVISED | MAP_FRESH;
            npages += 1;
        }

        if npages > 0 {
            map::pages_decommit(page_addr(chunk, i), npages << g.page_size_2pow);
            let ok = map::pages_commit(page_addr(chunk, i), npages << g.page_size_2pow);
            debug_assert!(ok);
        }
        total_npages += npages;
        i += npages + 1;
    }

    total_npages
}

/// Resolves the allocation size for an in-chunk (small or large)
/// pointer.
pub unsafe fn in_chunk_alloc_size(
    chunk: *mut ArenaChunk,
    pageind: usize,
) -> usize {
    let g = globals::g();
    let mapbits = (*page_map_entry(chunk, pageind)).bits;
    debug_assert!(mapbits & MAP_ALLOCATED != 0);

    if mapbits & MAP_LARGE == 0 {
        let run = (mapbits & !g.page_size_mask) as *mut Run;
        debug_assert_eq!((*run).magic, RUN_MAGIC);
        (*(*run).bin).size_class
    } else {
        let size = mapbits & !g.page_size_mask;
        debug_assert!(size != 0);
        size
    }
}

/// Frees a pointer known to lie inside an arena chunk (non-zero chunk
/// offset).  `expected_arena` crashes mismatched per-arena frees.
pub unsafe fn arena_dalloc(ptr_in: *mut u8, offset: usize, expected_arena: *mut Arena) {
    debug_assert!(!ptr_in.is_null());
    debug_assert!(offset != 0);
    debug_assert_eq!(chunk_offset_for_ptr(ptr_in), offset);
    let g = globals::g();

    let chunk = (ptr_in as usize - offset) as *mut ArenaChunk;
    let arena = (*chunk).arena;
    debug_assert!(!arena.is_null());
    debug_assert_eq!((*arena).magic, ARENA_MAGIC);
    assert!(
        expected_arena.is_null() || arena == expected_arena,
        "freeing a pointer through the wrong arena"
    );

    let pageind = offset >> g.page_size_2pow;
    if globals::g().opt.poison != crate::options::PoisonType::None {
        let size = in_chunk_alloc_size(chunk, pageind);
        maybe_poison(ptr_in, size);
    }

    let chunk_dealloc_delay;
    {
        let _guard = (*arena).lock.lock();
        let mapelm = page_map_entry(chunk, pageind);
        assert_eq!(
            (*mapelm).bits & (MAP_FRESH_MADVISED_OR_DECOMMITTED | MAP_ZEROED),
            0,
            "freeing in a page with bad bits"
        );
        assert!(
            (*mapelm).bits & MAP_ALLOCATED != 0,
            "double-free or free of unallocated memory"
        );
        if (*mapelm).bits & MAP_LARGE == 0 {
            chunk_dealloc_delay = Arena::dalloc_small(arena, chunk, ptr_in, mapelm);
        } else {
            chunk_dealloc_delay = Arena::dalloc_large(arena, chunk, ptr_in);
        }
    }

    if !chunk_dealloc_delay.is_null() {
        chunk_dealloc(
            chunk_dealloc_delay as *mut u8,
            CHUNK_SIZE,
            ChunkType::Arena,
        );
    }
}

/// Frees any pointer owned by the allocator, checking it belongs to
/// `arena` when one is given.
pub unsafe fn idalloc(ptr_in: *mut u8, arena: *mut Arena) {
    debug_assert!(!ptr_in.is_null());
    let offset = chunk_offset_for_ptr(ptr_in);
    if offset != 0 {
        arena_dalloc(ptr_in, offset, arena);
    } else {
        huge::huge_dalloc(ptr_in, arena);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_map_flags_stay_below_page_mask() {
        // Flags share the word with page-aligned sizes/addresses.
        assert!(MAP_BUSY < MIN_PAGE_SIZE);
        let all = MAP_BUSY
            | MAP_FRESH
            | MAP_MADVISED
            | MAP_DECOMMITTED
            | MAP_KEY
            | MAP_DIRTY
            | MAP_ZEROED
            | MAP_LARGE
            | MAP_ALLOCATED;
        assert_eq!(all & !(globals::g().page_size_mask), 0);
    }

    #[test]
    fn run_header_layout() {
        // The bitmap must start right after the header fields.
        assert_eq!(RUN_FIXED_HEADER_SIZE % 4, 0);
        assert!(RUN_FIXED_HEADER_SIZE <= 32);
    }

    #[test]
    fn bin_init_meets_overhead_targets() {
        let g = globals::g();
        let mut size_class = SizeClass::new(1);
        loop {
            let mut bin = Bin::empty();
            bin.init(size_class);

            let run_size = (bin.run_size_pages as usize) << g.page_size_2pow;
            let header = bin.run_first_region_offset as usize;

            // Regions fill the run exactly after the header.
            assert_eq!(
                header + bin.run_num_regions as usize * bin.size_class,
                run_size,
                "class {}",
                bin.size_class
            );
            // The bitmap fits between the fixed header and region 0.
            assert!(
                RUN_FIXED_HEADER_SIZE + 4 * bin.run_num_mask_elms as usize <= header
            );
            assert!(bin.run_num_mask_elms as usize * 32 >= bin.run_num_regions as usize);

            // The chosen run size respects one of the exit conditions:
            // nominal overhead, relaxed overhead, a header-dominated
            // class, or the run-size cap.
            let nominal = header * OVERHEAD_DEN <= run_size * RUN_OVERHEAD_NUM;
            let relaxed = header > bin.size_class
                && header * OVERHEAD_DEN <= run_size * RUN_RELAXED_OVERHEAD_NUM;
            let bitmap_bound = bin.run_num_mask_elms as usize * 4 >= RUN_FIXED_HEADER_SIZE;
            let capped = run_size + g.page_size > g.max_large_class;
            assert!(
                nominal || relaxed || bitmap_bound || capped,
                "class {} run_size {} header {}",
                bin.size_class,
                run_size,
                header
            );

            // The fast divisor round-trips every region offset.
            for regind in 0..bin.run_num_regions {
                let offset = regind as usize * bin.size_class;
                assert_eq!(bin.size_divisor.divide(offset as u32), regind);
            }

            if size_class.size() >= g.max_bin_class {
                break;
            }
            size_class = size_class.next();
        }
    }
}
