//! Huge allocations: requests larger than any arena run get whole
//! chunks straight from the chunk manager, tracked in an address-keyed
//! tree of extent nodes.  The node records the nominal (page-ceiled)
//! size; the chunk-ceiled remainder is decommitted and acts as a guard.
use std::cell::UnsafeCell;
use std::ptr;

use crate::arena::{idalloc, Arena};
use crate::chunk::{chunk_alloc, chunk_dealloc};
use crate::collection;
use crate::constants::{chunk_ceiling, CHUNK_SIZE, CHUNK_SIZE_MASK};

/// The chunk-ceiled footprint of a huge request plus its guard page.
/// Wraps on overflow; callers detect that as a result below `size`.
fn guarded_chunk_ceiling(size: usize, page_size: usize) -> usize {
    size.wrapping_add(page_size)
        .wrapping_add(CHUNK_SIZE_MASK)
        & !CHUNK_SIZE_MASK
}
use crate::extent::{ChunkType, ExtentByAddr, ExtentBounds, ExtentNode, EXTENT_POOL};
use crate::fill::{apply_zero_or_junk, maybe_poison};
use crate::globals;
use crate::map;
use crate::mutex::Mutex;
use crate::rb::RbTree;

struct HugeState {
    tree: RbTree<ExtentNode, ExtentByAddr>,
    allocated: usize,
    mapped: usize,
}

struct HugeRegistry {
    mtx: Mutex,
    state: UnsafeCell<HugeState>,
}

unsafe impl Sync for HugeRegistry {}

static HUGE: HugeRegistry = HugeRegistry {
    mtx: Mutex::new(),
    state: UnsafeCell::new(HugeState {
        tree: RbTree::new(),
        allocated: 0,
        mapped: 0,
    }),
};

// Fork integration; see the hooks in `collection`.
pub unsafe fn huge_raw_lock() {
    HUGE.mtx.raw_lock();
}

pub unsafe fn huge_raw_unlock() {
    HUGE.mtx.raw_unlock();
}

pub unsafe fn huge_reinit() {
    HUGE.mtx.reinit();
}

/// (allocated, mapped) byte totals, for the stats snapshot.
pub fn huge_stats() -> (usize, usize) {
    let _guard = HUGE.mtx.lock();
    let state = unsafe { &*HUGE.state.get() };
    (state.allocated, state.mapped)
}

pub unsafe fn malloc_huge(arena: *mut Arena, size: usize, zero: bool) -> *mut u8 {
    palloc_huge(arena, size, CHUNK_SIZE, zero)
}

pub unsafe fn palloc_huge(
    arena: *mut Arena,
    size: usize,
    alignment: usize,
    zero: bool,
) -> *mut u8 {
    let g = globals::g();

    // The region between the page-aligned and the chunk-aligned size
    // becomes a guard, so force that region into existence even when
    // the two would coincide.
    let csize = guarded_chunk_ceiling(size, g.page_size);
    if csize < size {
        // size was large enough to cause wrap-around.
        return ptr::null_mut();
    }

    // An extent node to track the chunk.
    let node = EXTENT_POOL.alloc();
    if node.is_null() {
        return ptr::null_mut();
    }

    // One or more contiguous chunks for this request.
    let ret = match chunk_alloc(csize, alignment, false) {
        Some(ret) => ret.as_ptr(),
        None => {
            EXTENT_POOL.dealloc(node);
            return ptr::null_mut();
        }
    };
    let psize = g.page_ceiling(size);

    (*node) = ExtentNode::key(ret, psize);
    (*node).chunk_type = ChunkType::Huge;
    (*node).arena = arena;
    (*node).arena_id = (*arena).id;

    {
        let _guard = HUGE.mtx.lock();
        let state = &mut *HUGE.state.get();
        state.tree.insert(node);

        // Although csize bytes are mapped, only psize count as
        // allocated: the tail is decommitted below, so a program that
        // stays within `malloc_usable_size` never makes it resident.
        state.allocated += psize;
        state.mapped += csize;
    }

    map::pages_decommit((ret as usize + psize) as *mut u8, csize - psize);

    if !zero {
        apply_zero_or_junk(ret, psize);
    }

    ret
}

pub unsafe fn ralloc_huge(
    arena: *mut Arena,
    ptr_in: *mut u8,
    size: usize,
    old_size: usize,
) -> *mut u8 {
    let g = globals::g();

    // Avoid moving the allocation when the chunk-ceiled size does not
    // change: commit or decommit the delta pages in place instead.
    if old_size > g.max_large_class
        && guarded_chunk_ceiling(size, g.page_size)
            == guarded_chunk_ceiling(old_size, g.page_size)
    {
        let psize = g.page_ceiling(size);
        if size < old_size {
            maybe_poison((ptr_in as usize + size) as *mut u8, old_size - size);
        }
        if psize < old_size {
            map::pages_decommit((ptr_in as usize + psize) as *mut u8, old_size - psize);

            // Update the recorded size.
            let key = ExtentNode::key(ptr_in, 0);
            let _guard = HUGE.mtx.lock();
            let state = &mut *HUGE.state.get();
            let node = state.tree.search(&key);
            debug_assert!(!node.is_null());
            debug_assert_eq!((*node).size, old_size);
            assert_eq!((*node).arena, arena);
            state.allocated -= old_size - psize;
            // mapped is unchanged: nothing was (un)mapped.
            (*node).size = psize;
        } else if psize > old_size {
            if !map::pages_commit((ptr_in as usize + old_size) as *mut u8, psize - old_size)
            {
                return ptr::null_mut();
            }

            // Grow the recorded size so malloc_usable_size never
            // reports less than what realloc granted.
            let key = ExtentNode::key(ptr_in, 0);
            let _guard = HUGE.mtx.lock();
            let state = &mut *HUGE.state.get();
            let node = state.tree.search(&key);
            debug_assert!(!node.is_null());
            debug_assert_eq!((*node).size, old_size);
            assert_eq!((*node).arena, arena);
            state.allocated += psize - old_size;
            (*node).size = psize;
        }

        if size > old_size {
            apply_zero_or_junk((ptr_in as usize + old_size) as *mut u8, size - old_size);
        }
        return ptr_in;
    }

    // The size classes differ: allocate new space and copy.  Only
    // non-private arenas may migrate to another arena.
    let dest = if (*arena).is_private {
        arena
    } else {
        collection::choose_arena(size)
    };
    let ret = malloc_huge(dest, size, false);
    if ret.is_null() {
        return ptr::null_mut();
    }

    let copy_size = size.min(old_size);
    if copy_size >= CHUNK_SIZE {
        map::pages_copy(ret, ptr_in, copy_size);
    } else {
        ptr::copy_nonoverlapping(ptr_in, ret, copy_size);
    }
    idalloc(ptr_in, arena);
    ret
}

pub unsafe fn huge_dalloc(ptr_in: *mut u8, arena: *mut Arena) {
    let node;
    let mapped;
    {
        let key = ExtentNode::key(ptr_in, 0);
        let _guard = HUGE.mtx.lock();
        let state = &mut *HUGE.state.get();

        node = state.tree.search(&key);
        assert!(!node.is_null(), "double-free of huge allocation");
        debug_assert_eq!((*node).addr, ptr_in);
        assert!(arena.is_null() || (*node).arena == arena);
        // Defends against the node's arena having been disposed of and
        // its memory reused: the recorded id no longer matches then.
        assert_eq!(
            (*node).arena_id,
            (*(*node).arena).id,
            "huge allocation outlived its arena"
        );
        state.tree.remove(node);

        mapped = chunk_ceiling((*node).size + globals::g().page_size);
        state.allocated -= (*node).size;
        state.mapped -= mapped;
    }

    chunk_dealloc((*node).addr, mapped, ChunkType::Huge);
    EXTENT_POOL.dealloc(node);
}

/// Usable size of a huge allocation, if `ptr` is the base of one.
pub unsafe fn huge_alloc_size(ptr_in: *const u8) -> Option<usize> {
    let key = ExtentNode::key(ptr_in as *mut u8, 0);
    let _guard = HUGE.mtx.lock();
    let state = &*HUGE.state.get();
    let node = state.tree.search(&key);
    if node.is_null() {
        None
    } else {
        Some((*node).size)
    }
}

/// Size and owning arena of the huge allocation based at `ptr`,
/// crash-checking the arena liveness like `huge_dalloc` does.
pub unsafe fn huge_alloc_info(ptr_in: *const u8) -> Option<(usize, *mut Arena)> {
    let key = ExtentNode::key(ptr_in as *mut u8, 0);
    let _guard = HUGE.mtx.lock();
    let state = &*HUGE.state.get();
    let node = state.tree.search(&key);
    if node.is_null() {
        return None;
    }
    assert_eq!(
        (*node).arena_id,
        (*(*node).arena).id,
        "huge allocation outlived its arena"
    );
    Some(((*node).size, (*node).arena))
}

/// Resolves any pointer (interior included) into the huge allocation
/// containing it: (base, size, arena id).
pub unsafe fn huge_ptr_lookup(ptr_in: *const u8) -> Option<(*mut u8, usize, u64)> {
    let key = ExtentNode::key(ptr_in as *mut u8, 0);
    let _guard = HUGE.mtx.lock();
    let state = &*HUGE.state.get();
    let node = state.tree.search_with::<ExtentBounds>(&key);
    if node.is_null() {
        None
    } else {
        Some(((*node).addr, (*node).size, (*(*node).arena).id))
    }
}

/// Disposal-time check that no huge allocation still references the
/// arena.  Expensive, so debug builds only.
pub unsafe fn assert_no_huge_for_arena(arena: *mut Arena) {
    #[cfg(debug_assertions)]
    {
        let _guard = HUGE.mtx.lock();
        let state = &*HUGE.state.get();
        for node in state.tree.iter() {
            assert!(
                (*node).arena_id != (*arena).id,
                "disposing of an arena with live huge allocations"
            );
        }
    }
    #[cfg(not(debug_assertions))]
    {
        let _ = arena;
    }
}
