//! The chunk manager: hands out chunk-aligned spans of address space,
//! recycling previously freed spans before asking the OS for more.  Free
//! spans live in two trees with the same contents, one ordered by
//! (size, address) for best-fit allocation and one by address for
//! coalescing with neighbours.
use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::constants::{alignment_addr2offset, alignment_ceiling, CHUNK_SIZE, CHUNK_SIZE_MASK, RECYCLE_LIMIT};
use crate::extent::{ChunkType, ExtentBySize, ExtentByAddr, ExtentNode, EXTENT_POOL};
use crate::globals::chunk_offset_for_ptr;
use crate::map;
use crate::mutex::Mutex;
use crate::rb::RbTree;
use crate::rtree::AddressRadixTree;

/// Ownership test for `free`: an address belongs to us iff its chunk is
/// registered here.  Base-allocator chunks are deliberately absent.
pub static CHUNK_RTREE: AddressRadixTree = AddressRadixTree::new();

struct ChunkTrees {
    // Trees of chunks that were previously allocated (they differ only
    // in node ordering), used when allocating chunks to re-use address
    // space.
    by_size: RbTree<ExtentNode, ExtentBySize>,
    by_addr: RbTree<ExtentNode, ExtentByAddr>,
}

struct ChunkRegistry {
    mtx: Mutex,
    trees: UnsafeCell<ChunkTrees>,
    // Updated atomically so callers outside the lock can observe it.
    recycled_size: AtomicUsize,
}

unsafe impl Sync for ChunkRegistry {}

static CHUNKS: ChunkRegistry = ChunkRegistry {
    mtx: Mutex::new(),
    trees: UnsafeCell::new(ChunkTrees {
        by_size: RbTree::new(),
        by_addr: RbTree::new(),
    }),
    recycled_size: AtomicUsize::new(0),
};

/// The current amount of recycled bytes.
pub fn recycled_size() -> usize {
    CHUNKS.recycled_size.load(Ordering::Acquire)
}

// On Windows, calls to VirtualAlloc and VirtualFree must be matched,
// making it awkward to recycle allocations of varying sizes.  Only
// exactly-one-chunk spans are recycled there.
fn can_recycle(size: usize) -> bool {
    if cfg!(windows) {
        size == CHUNK_SIZE
    } else {
        true
    }
}

fn chunk_alloc_mmap_slow(size: usize, alignment: usize) -> Option<NonNull<u8>> {
    let alloc_size = size.checked_add(alignment - map::real_page_size())?;
    loop {
        let pages = map::pages_map(std::ptr::null_mut(), alloc_size)?;
        let leadsize =
            alignment_ceiling(pages.as_ptr() as usize, alignment) - pages.as_ptr() as usize;
        match map::pages_trim(pages.as_ptr(), alloc_size, leadsize, size) {
            Some(ret) => return Some(ret),
            // Lost the address-space race (Windows); try again.
            None => continue,
        }
    }
}

fn chunk_alloc_mmap(size: usize, alignment: usize) -> Option<NonNull<u8>> {
    // Ideally, there would be a way to specify alignment to mmap().  In
    // the absence of such a feature, over-sizing and trimming works but
    // always costs one or two unmap calls.  Optimistically try mapping
    // precisely the right amount first; that usually suffices.
    let ret = map::pages_map(std::ptr::null_mut(), size)?;
    let offset = alignment_addr2offset(ret.as_ptr() as usize, alignment);
    if offset != 0 {
        map::pages_unmap(ret.as_ptr(), size);
        return chunk_alloc_mmap_slow(size, alignment);
    }
    Some(ret)
}

fn chunk_recycle(size: usize, alignment: usize) -> Option<NonNull<u8>> {
    let alloc_size = size.checked_add(alignment - CHUNK_SIZE)?;
    let key = ExtentNode::key(std::ptr::null_mut(), alloc_size);

    unsafe {
        // A raw pointer rather than a reference: the lock gets dropped
        // and retaken below, and the trees belong to whoever holds it.
        let trees = CHUNKS.trees.get();

        CHUNKS.mtx.raw_lock();
        let node = (*trees).by_size.search_or_next(&key);
        if node.is_null() {
            CHUNKS.mtx.raw_unlock();
            return None;
        }
        let leadsize = alignment_ceiling((*node).addr as usize, alignment)
            - (*node).addr as usize;
        debug_assert!((*node).size >= leadsize + size);
        let trailsize = (*node).size - leadsize - size;
        let ret = ((*node).addr as usize + leadsize) as *mut u8;

        // All recycled chunks are zeroed (they were purged on release).
        debug_assert_eq!((*node).chunk_type, ChunkType::Zeroed);

        // Remove the node from the trees; pieces of it may go back in.
        (*trees).by_size.remove(node);
        (*trees).by_addr.remove(node);
        let mut node = node;
        if leadsize != 0 {
            // Insert the leading space as a smaller chunk.
            (*node).size = leadsize;
            (*trees).by_size.insert(node);
            (*trees).by_addr.insert(node);
            node = std::ptr::null_mut();
        }
        if trailsize != 0 {
            // Insert the trailing space as a smaller chunk.
            if node.is_null() {
                // An additional node is required, but the pool can
                // allocate a new base chunk.  Drop the lock to avoid
                // deadlock; if node allocation fails, give the result
                // back before reporting failure.
                CHUNKS.mtx.raw_unlock();
                node = EXTENT_POOL.alloc();
                if node.is_null() {
                    chunk_dealloc(ret, size, ChunkType::Zeroed);
                    return None;
                }
                CHUNKS.mtx.raw_lock();
            }
            (*node).addr = (ret as usize + size) as *mut u8;
            (*node).size = trailsize;
            (*node).chunk_type = ChunkType::Zeroed;
            (*trees).by_size.insert(node);
            (*trees).by_addr.insert(node);
            node = std::ptr::null_mut();
        }

        CHUNKS.recycled_size.fetch_sub(size, Ordering::Release);
        CHUNKS.mtx.raw_unlock();

        if !node.is_null() {
            EXTENT_POOL.dealloc(node);
        }
        if !map::pages_commit(ret, size) {
            return None;
        }

        NonNull::new(ret)
    }
}

/// Allocates `size` bytes of chunk-aligned system memory (`size` is a
/// multiple of the chunk size).  `base` indicates the memory will feed
/// the base allocator, which can't be served by recycling because of
/// possible deadlock or infinite recursion.
pub fn chunk_alloc(size: usize, alignment: usize, base: bool) -> Option<NonNull<u8>> {
    assert!(size != 0);
    assert_eq!(size & CHUNK_SIZE_MASK, 0);
    assert!(alignment != 0);
    assert_eq!(alignment & CHUNK_SIZE_MASK, 0);

    let mut ret = None;
    if can_recycle(size) && !base {
        ret = chunk_recycle(size, alignment);
    }
    if ret.is_none() {
        ret = chunk_alloc_mmap(size, alignment);
    }
    if let Some(ptr) = ret {
        if !base {
            if !CHUNK_RTREE.set(ptr.as_ptr(), ptr.as_ptr()) {
                chunk_dealloc(ptr.as_ptr(), size, ChunkType::Unknown);
                return None;
            }
        }
        debug_assert_eq!(chunk_offset_for_ptr(ptr.as_ptr()), 0);
    }

    ret
}

/// Feeds a span into the recycle trees, coalescing with its address
/// neighbours.  Mixed-type coalesced spans become `Recycled`.
fn chunk_record(chunk: *mut u8, size: usize, mut chunk_type: ChunkType) {
    if chunk_type != ChunkType::Zeroed
        && map::pages_purge(chunk, size, chunk_type == ChunkType::Huge)
    {
        chunk_type = ChunkType::Zeroed;
    }

    // Allocate a node before acquiring the chunk mutex even though it
    // might not be needed: the pool may itself allocate a new base
    // chunk, which would deadlock if the mutex were already held.
    let xnode = EXTENT_POOL.alloc();
    // Deferred release of a coalesced-away predecessor node.
    let mut xprev: *mut ExtentNode = std::ptr::null_mut();
    let mut xnode_used = false;

    unsafe {
        let _guard = CHUNKS.mtx.lock();
        let trees = &mut *CHUNKS.trees.get();

        let key = ExtentNode::key((chunk as usize + size) as *mut u8, 0);
        let next = trees.by_addr.search_or_next(&key);
        let node;
        if !next.is_null() && (*next).addr == key.addr {
            // Coalesce with the following address range.  This does not
            // change the position within by_addr, so only re-file the
            // node in by_size.
            trees.by_size.remove(next);
            (*next).addr = chunk;
            (*next).size += size;
            if (*next).chunk_type != chunk_type {
                (*next).chunk_type = ChunkType::Recycled;
            }
            trees.by_size.insert(next);
            node = next;
        } else {
            // Coalescing forward failed, so insert a new node.
            if xnode.is_null() {
                // Node allocation failed, which is an exceedingly
                // unlikely failure.  Leak the chunk; its pages have
                // already been purged, so this is only a virtual memory
                // leak.
                return;
            }
            node = xnode;
            xnode_used = true;
            (*node).addr = chunk;
            (*node).size = size;
            (*node).chunk_type = chunk_type;
            trees.by_addr.insert(node);
            trees.by_size.insert(node);
        }

        // Try to coalesce backward.
        let prev = trees.by_addr.prev(node);
        if !prev.is_null() && ((*prev).addr as usize + (*prev).size) == chunk as usize {
            // Coalesce with the previous address range.
            trees.by_size.remove(prev);
            trees.by_addr.remove(prev);

            trees.by_size.remove(node);
            (*node).addr = (*prev).addr;
            (*node).size += (*prev).size;
            if (*node).chunk_type != (*prev).chunk_type {
                (*node).chunk_type = ChunkType::Recycled;
            }
            trees.by_size.insert(node);

            xprev = prev;
        }

        CHUNKS.recycled_size.fetch_add(size, Ordering::Release);
    }

    // Release spare nodes after unlocking.
    if !xnode.is_null() && !xnode_used {
        EXTENT_POOL.dealloc(xnode);
    }
    if !xprev.is_null() {
        EXTENT_POOL.dealloc(xprev);
    }
}

/// Returns a chunk span for potential recycling.  Spans above the
/// recycle limit are trimmed to fit and the excess unmapped.
pub fn chunk_dealloc(chunk: *mut u8, size: usize, chunk_type: ChunkType) {
    assert!(!chunk.is_null());
    assert_eq!(chunk_offset_for_ptr(chunk), 0);
    assert!(size != 0);
    assert_eq!(size & CHUNK_SIZE_MASK, 0);

    CHUNK_RTREE.unset(chunk);

    if can_recycle(size) {
        let recycled_so_far = recycled_size();
        // In case some race condition put us above the limit.
        if recycled_so_far < RECYCLE_LIMIT {
            let recycle_remaining = RECYCLE_LIMIT - recycled_so_far;
            let to_recycle;
            if size > recycle_remaining {
                to_recycle = recycle_remaining;
                // Drop pages that would overflow the recycle limit.
                let _ = map::pages_trim(chunk, size, 0, to_recycle);
            } else {
                to_recycle = size;
            }
            chunk_record(chunk, to_recycle, chunk_type);
            return;
        }
    }

    map::pages_unmap(chunk, size);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_alloc_is_aligned_and_registered() {
        let chunk = chunk_alloc(CHUNK_SIZE, CHUNK_SIZE, false).expect("chunk_alloc");
        assert_eq!(chunk.as_ptr() as usize & CHUNK_SIZE_MASK, 0);
        assert_eq!(CHUNK_RTREE.get(chunk.as_ptr()), chunk.as_ptr());

        // The memory is committed and writable.
        unsafe { std::ptr::write_bytes(chunk.as_ptr(), 0x5c, CHUNK_SIZE) };

        chunk_dealloc(chunk.as_ptr(), CHUNK_SIZE, ChunkType::Unknown);
        assert!(CHUNK_RTREE.get(chunk.as_ptr()).is_null());
        assert!(recycled_size() <= RECYCLE_LIMIT);
    }

    #[test]
    fn base_chunks_skip_registration() {
        let chunk = chunk_alloc(CHUNK_SIZE, CHUNK_SIZE, true).expect("chunk_alloc");
        assert_eq!(chunk.as_ptr() as usize & CHUNK_SIZE_MASK, 0);
        assert!(CHUNK_RTREE.get(chunk.as_ptr()).is_null());
        // Base chunks are never returned; leak it like base does.
    }

    #[test]
    fn recycled_chunks_come_back_zeroed() {
        let chunk = chunk_alloc(CHUNK_SIZE, CHUNK_SIZE, false).expect("chunk_alloc");
        unsafe { std::ptr::write_bytes(chunk.as_ptr(), 0xff, CHUNK_SIZE) };
        chunk_dealloc(chunk.as_ptr(), CHUNK_SIZE, ChunkType::Unknown);

        // Allocating again may or may not return the same span (other
        // tests run concurrently), but whatever comes back must read as
        // zero whether it was recycled or freshly mapped.
        let next = chunk_alloc(CHUNK_SIZE, CHUNK_SIZE, false).expect("chunk_alloc");
        let base = next.as_ptr();
        for offset in (0..CHUNK_SIZE).step_by(4096) {
            assert_eq!(unsafe { std::ptr::read(base.add(offset)) }, 0);
        }
        chunk_dealloc(base, CHUNK_SIZE, ChunkType::Unknown);
    }

    #[test]
    fn multi_chunk_spans() {
        if cfg!(windows) {
            return;
        }
        let span = chunk_alloc(4 * CHUNK_SIZE, CHUNK_SIZE, false).expect("chunk_alloc");
        assert_eq!(span.as_ptr() as usize & CHUNK_SIZE_MASK, 0);
        unsafe { std::ptr::write_bytes(span.as_ptr(), 0x11, 4 * CHUNK_SIZE) };
        chunk_dealloc(span.as_ptr(), 4 * CHUNK_SIZE, ChunkType::Huge);
        assert!(recycled_size() <= RECYCLE_LIMIT);
    }
}
