//! The malloc-compatible operation set.  Every public entry point, Rust
//! or C, funnels through here; the `arena` parameter selects the
//! explicit-arena flavour of each call (null means "choose for me").
use std::ptr;

use crate::arena::{arena_dalloc, Arena, ArenaParams};
use crate::classes::SizeClass;
use crate::collection;
use crate::constants::MALLOC_DOUBLE_PURGE;
use crate::globals::{self, chunk_for_ptr, chunk_offset_for_ptr};
use crate::huge;
#[cfg(feature = "phc")]
use crate::phc;

#[cfg(unix)]
const ENOMEM: i32 = libc::ENOMEM;
#[cfg(windows)]
const ENOMEM: i32 = 12;

fn set_oom_errno() {
    errno::set_errno(errno::Errno(ENOMEM));
}

#[cfg(feature = "phc")]
fn arena_id_of(arena: *mut Arena) -> Option<u64> {
    if arena.is_null() {
        None
    } else {
        Some(unsafe { (*arena).id })
    }
}

/// Classification of an arbitrary address, as reported by `ptr_info`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PtrInfoTag {
    /// Not a pointer the allocator knows about.
    Unknown,
    /// The base of a live allocation.
    LiveAlloc,
    /// A freed region or page-slot allocation.
    FreedAlloc,
    /// A freed page, possibly still dirty.
    FreedPage,
}

#[derive(Clone, Copy, Debug)]
pub struct PtrInfo {
    pub tag: PtrInfoTag,
    /// Base address of the containing allocation, when known.
    pub addr: *mut u8,
    pub size: usize,
    pub arena_id: u64,
}

impl PtrInfo {
    fn unknown() -> PtrInfo {
        PtrInfo {
            tag: PtrInfoTag::Unknown,
            addr: ptr::null_mut(),
            size: 0,
            arena_id: 0,
        }
    }
}

/// Size and owning arena for a pointer assumed valid (the realloc/free
/// paths).  Huge lookups release-assert the arena is still live.
unsafe fn alloc_info(ptr_in: *mut u8) -> (usize, *mut Arena) {
    let offset = chunk_offset_for_ptr(ptr_in);
    if offset != 0 {
        let chunk = chunk_for_ptr(ptr_in);
        let arena = (*chunk).arena;
        let pageind = offset >> globals::g().page_size_2pow;
        (crate::arena::in_chunk_alloc_size(chunk, pageind), arena)
    } else {
        match huge::huge_alloc_info(ptr_in) {
            Some((size, arena)) => (size, arena),
            None => panic!("realloc of an unknown pointer"),
        }
    }
}

pub(crate) fn malloc_in(arena: *mut Arena, size: usize) -> *mut u8 {
    let ret = malloc_internal(arena, size, false);
    if ret.is_null() {
        set_oom_errno();
    }
    ret
}

fn malloc_internal(arena: *mut Arena, size: usize, zero: bool) -> *mut u8 {
    if !collection::malloc_init() {
        return ptr::null_mut();
    }
    let size = size.max(1);

    #[cfg(feature = "phc")]
    {
        let ret = phc::maybe_page_alloc(arena_id_of(arena), size, 1, zero);
        if !ret.is_null() {
            return ret;
        }
    }

    let arena = if arena.is_null() {
        collection::choose_arena(size)
    } else {
        arena
    };
    unsafe { Arena::malloc(arena, size, zero) }
}

pub fn malloc(size: usize) -> *mut u8 {
    malloc_in(ptr::null_mut(), size)
}

pub(crate) fn calloc_in(arena: *mut Arena, num: usize, size: usize) -> *mut u8 {
    let ret = match num.checked_mul(size) {
        Some(total) => malloc_internal(arena, total, true),
        None => ptr::null_mut(),
    };
    if ret.is_null() {
        set_oom_errno();
    }
    ret
}

pub fn calloc(num: usize, size: usize) -> *mut u8 {
    calloc_in(ptr::null_mut(), num, size)
}

pub(crate) fn memalign_in(arena: *mut Arena, alignment: usize, size: usize) -> *mut u8 {
    debug_assert!(alignment.is_power_of_two());

    if !collection::malloc_init() {
        return ptr::null_mut();
    }
    let size = size.max(1);
    let alignment = alignment.max(core::mem::size_of::<usize>());

    #[cfg(feature = "phc")]
    {
        let ret = phc::maybe_page_alloc(arena_id_of(arena), size, alignment, false);
        if !ret.is_null() {
            return ret;
        }
    }

    let arena = if arena.is_null() {
        collection::choose_arena(size)
    } else {
        arena
    };
    unsafe { Arena::palloc(arena, alignment, size) }
}

pub fn memalign(alignment: usize, size: usize) -> *mut u8 {
    memalign_in(ptr::null_mut(), alignment, size)
}

/// POSIX-shaped aligned allocation.  Note one deliberate divergence
/// from POSIX: a non-power-of-two alignment is rounded up instead of
/// failing with EINVAL.
pub fn posix_memalign(out: &mut *mut u8, alignment: usize, size: usize) -> i32 {
    let alignment = alignment
        .max(core::mem::size_of::<usize>())
        .next_power_of_two();
    let ret = memalign(alignment, size);
    if ret.is_null() {
        *out = ptr::null_mut();
        return ENOMEM;
    }
    *out = ret;
    0
}

pub fn aligned_alloc(alignment: usize, size: usize) -> *mut u8 {
    if alignment == 0 || !alignment.is_power_of_two() || size % alignment != 0 {
        return ptr::null_mut();
    }
    memalign(alignment, size)
}

pub fn valloc(size: usize) -> *mut u8 {
    memalign(globals::g().page_size, size)
}

pub(crate) fn realloc_in(arena: *mut Arena, ptr_in: *mut u8, size: usize) -> *mut u8 {
    let size = size.max(1);

    let ret;
    if !ptr_in.is_null() {
        assert!(collection::malloc_init());

        #[cfg(feature = "phc")]
        {
            if phc::is_phc_ptr(ptr_in) {
                return phc_realloc(arena, ptr_in, size);
            }
        }

        unsafe {
            let (old_size, owner) = alloc_info(ptr_in);
            assert!(
                arena.is_null() || owner == arena,
                "realloc through the wrong arena"
            );
            ret = Arena::ralloc(owner, ptr_in, size, old_size);
        }
    } else {
        ret = malloc_internal(arena, size, false);
    }

    if ret.is_null() {
        set_oom_errno();
    }
    ret
}

pub fn realloc(ptr_in: *mut u8, size: usize) -> *mut u8 {
    realloc_in(ptr::null_mut(), ptr_in, size)
}

/// Reallocation of a guarded page-slot allocation: shrink in place,
/// grow by migrating back into the main allocator (honouring the arena
/// the allocation was nominally made from).
#[cfg(feature = "phc")]
fn phc_realloc(arena: *mut Arena, ptr_in: *mut u8, size: usize) -> *mut u8 {
    let old_usable = phc::usable_size(ptr_in);
    if size <= old_usable {
        return ptr_in;
    }

    let recorded = phc::ptr_arena_id(ptr_in);
    let dest = match (arena.is_null(), recorded) {
        (false, _) => arena,
        (true, Some(id)) => collection::get_by_id(id, true),
        (true, None) => ptr::null_mut(),
    };
    let new_ptr = malloc_internal(dest, size, false);
    if new_ptr.is_null() {
        set_oom_errno();
        return ptr::null_mut();
    }
    unsafe { ptr::copy_nonoverlapping(ptr_in, new_ptr, old_usable) };
    phc::page_free(recorded, ptr_in);
    new_ptr
}

pub(crate) fn free_in(arena: *mut Arena, ptr_in: *mut u8) {
    #[cfg(feature = "phc")]
    {
        if phc::is_phc_ptr(ptr_in) {
            phc::page_free(arena_id_of(arena), ptr_in);
            return;
        }
    }

    let offset = chunk_offset_for_ptr(ptr_in);
    if offset != 0 {
        assert!(collection::malloc_init());
        unsafe { arena_dalloc(ptr_in, offset, arena) };
    } else if !ptr_in.is_null() {
        assert!(collection::malloc_init());
        unsafe { huge::huge_dalloc(ptr_in, arena) };
    }
}

pub fn free(ptr_in: *mut u8) {
    free_in(ptr::null_mut(), ptr_in);
}

/// The size class an allocation of `size` would be rounded to.  Pure;
/// `malloc_usable_size(malloc(n)) == malloc_good_size(n)` always holds.
pub fn malloc_good_size(size: usize) -> usize {
    let g = globals::g();
    let size = size.max(1);
    if size <= g.max_large_class {
        SizeClass::new(size).size()
    } else {
        // Huge: page-ceiled (not chunk-ceiled), matching the size the
        // huge layer records as allocated.
        g.page_ceiling(size)
    }
}

pub fn malloc_usable_size(ptr_in: *const u8) -> usize {
    if ptr_in.is_null() || !collection::malloc_init() {
        return 0;
    }

    #[cfg(feature = "phc")]
    {
        if phc::is_phc_ptr(ptr_in) {
            return phc::usable_size(ptr_in);
        }
    }

    unsafe {
        let chunk = chunk_for_ptr(ptr_in);
        if chunk.is_null() {
            return 0;
        }
        if chunk as usize != ptr_in as usize {
            if crate::chunk::CHUNK_RTREE.get(chunk as *const u8).is_null() {
                return 0;
            }
            let pageind = chunk_offset_for_ptr(ptr_in) >> globals::g().page_size_2pow;
            crate::arena::in_chunk_alloc_size(chunk, pageind)
        } else {
            huge::huge_alloc_size(ptr_in).unwrap_or(0)
        }
    }
}

/// Classifies an arbitrary address: live allocation, freed allocation,
/// freed page, or unknown.  Tolerates wild pointers.
pub fn ptr_info(ptr_in: *const u8) -> PtrInfo {
    // Null, or within one chunk's size of null, can't be ours; nor can
    // anything be before the allocator is up.
    let chunk = chunk_for_ptr(ptr_in);
    if chunk.is_null() || !collection::malloc_init() {
        return PtrInfo::unknown();
    }

    #[cfg(feature = "phc")]
    {
        if phc::is_phc_ptr(ptr_in) {
            return phc_ptr_info(ptr_in);
        }
    }

    unsafe {
        // Huge allocations first: secondary chunks of a multi-chunk
        // huge allocation are not in the radix tree.
        if let Some((addr, size, arena_id)) = huge::huge_ptr_lookup(ptr_in) {
            return PtrInfo {
                tag: PtrInfoTag::LiveAlloc,
                addr,
                size,
                arena_id,
            };
        }

        if crate::chunk::CHUNK_RTREE.get(chunk as *const u8).is_null() {
            return PtrInfo::unknown();
        }

        let g = globals::g();
        let mut pageind = chunk_offset_for_ptr(ptr_in) >> g.page_size_2pow;
        if pageind < g.chunk_header_npages {
            // Within the chunk header.
            return PtrInfo::unknown();
        }

        let arena_id = (*(*chunk).arena).id;
        let entry = |i: usize| -> usize {
            unsafe {
                (*(ptr::addr_of!((*chunk).map) as *const crate::arena::PageMapEntry)
                    .add(i))
                .bits
            }
        };
        let mut mapbits = entry(pageind);

        if mapbits & crate::arena::MAP_ALLOCATED == 0 {
            let page_addr = (ptr_in as usize & !g.page_size_mask) as *mut u8;
            return PtrInfo {
                tag: PtrInfoTag::FreedPage,
                addr: page_addr,
                size: g.page_size,
                arena_id,
            };
        }

        if mapbits & crate::arena::MAP_LARGE != 0 {
            // Only the first page of a large allocation records its
            // size; scan back from interior pointers.
            let size = loop {
                let size = mapbits & !g.page_size_mask;
                if size != 0 {
                    break size;
                }
                pageind -= 1;
                if pageind < g.chunk_header_npages {
                    return PtrInfo::unknown();
                }
                mapbits = entry(pageind);
                if mapbits & crate::arena::MAP_LARGE == 0 {
                    return PtrInfo::unknown();
                }
            };
            let addr = (chunk as usize + (pageind << g.page_size_2pow)) as *mut u8;
            return PtrInfo {
                tag: PtrInfoTag::LiveAlloc,
                addr,
                size,
                arena_id,
            };
        }

        // A small allocation.
        let run = (mapbits & !g.page_size_mask) as *mut crate::arena::Run;
        debug_assert_eq!((*run).magic, crate::arena::RUN_MAGIC);
        let bin = (*run).bin;
        let size = (*bin).size_class;

        let reg0_addr = run as usize + (*bin).run_first_region_offset as usize;
        if (ptr_in as usize) < reg0_addr {
            // In the run header.
            return PtrInfo::unknown();
        }

        let regind = (ptr_in as usize - reg0_addr) / size;
        let addr = (reg0_addr + regind * size) as *mut u8;

        // Freed regions have their bitmap bit set.
        let elm = (regind >> 5) as u32;
        let bit = regind & 31;
        let mask = *((run.add(1) as *const u32).add(elm as usize));
        let tag = if mask & (1 << bit) != 0 {
            PtrInfoTag::FreedAlloc
        } else {
            PtrInfoTag::LiveAlloc
        };

        PtrInfo {
            tag,
            addr,
            size,
            arena_id,
        }
    }
}

#[cfg(feature = "phc")]
fn phc_ptr_info(ptr_in: *const u8) -> PtrInfo {
    match phc::ptr_page_state(ptr_in) {
        Some((live, base, usable, arena_id)) => PtrInfo {
            tag: if live {
                PtrInfoTag::LiveAlloc
            } else {
                PtrInfoTag::FreedAlloc
            },
            addr: base,
            size: usable,
            arena_id: arena_id.unwrap_or(0),
        },
        None => PtrInfo::unknown(),
    }
}

// Arena control surface.

/// Creates a private arena and returns its id.
pub fn create_arena_with_params(params: &ArenaParams) -> u64 {
    if !collection::malloc_init() {
        return 0;
    }
    let arena = collection::create_arena(true, Some(params));
    unsafe { (*arena).id }
}

pub fn create_arena() -> u64 {
    create_arena_with_params(&ArenaParams::default())
}

/// Disposes of a private arena; it must be empty.
pub fn dispose_arena(arena_id: u64) {
    let arena = collection::get_by_id(arena_id, true);
    assert!(!arena.is_null());
    collection::dispose_arena(arena);
}

pub fn arena_malloc(arena_id: u64, size: usize) -> *mut u8 {
    malloc_in(collection::get_by_id(arena_id, true), size)
}

pub fn arena_calloc(arena_id: u64, num: usize, size: usize) -> *mut u8 {
    calloc_in(collection::get_by_id(arena_id, true), num, size)
}

pub fn arena_realloc(arena_id: u64, ptr_in: *mut u8, size: usize) -> *mut u8 {
    realloc_in(collection::get_by_id(arena_id, true), ptr_in, size)
}

pub fn arena_free(arena_id: u64, ptr_in: *mut u8) {
    free_in(collection::get_by_id(arena_id, true), ptr_in)
}

pub fn arena_memalign(arena_id: u64, alignment: usize, size: usize) -> *mut u8 {
    memalign_in(collection::get_by_id(arena_id, true), alignment, size)
}

/// Process-wide signed shift on each arena's effective dirty maximum.
pub fn set_max_dirty_page_modifier(modifier: i32) {
    collection::set_default_max_dirty_page_modifier(modifier);
}

/// Pins the calling thread to an arena of its own (or back to the
/// default arena).
pub fn thread_local_arena(enabled: bool) {
    if collection::malloc_init() {
        collection::thread_local_arena(enabled);
    }
}

/// Declares the calling thread to be the main thread.
pub fn set_main_thread() {
    if collection::malloc_init() {
        collection::set_main_thread();
    }
}

/// Forces lazily-purged (madvised) pages out of the resident set, where
/// the platform needs it; a no-op elsewhere.
pub fn purge_freed_pages() {
    if MALLOC_DOUBLE_PURGE {
        collection::for_each_arena(|arena| unsafe { Arena::hard_purge(arena) });
    }
}

/// Purges dirty pages on every arena down to (nearly) zero.
pub fn free_dirty_pages() {
    collection::for_each_arena(|arena| unsafe {
        let _guard = (*arena).lock.lock();
        Arena::purge(arena, 1);
    });
}
