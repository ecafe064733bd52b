//! Address radix tree: a constant-depth trie keyed by the upper bits of
//! an address, answering "does this chunk belong to us?" on every free.
//! Reads are lock-free (release/acquire on the slot chain); slot-chain
//! creation happens under a dedicated mutex.  Nodes come from the base
//! allocator and are never freed during the process lifetime.
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::base;
use crate::constants::{log2, CACHELINE_SIZE, CHUNK_SIZE};
use crate::mutex::Mutex;

const PTR_BITS: usize = core::mem::size_of::<usize>() * 8;

/// Number of significant address bits: everything above the in-chunk
/// offset.
const BITS: usize = PTR_BITS - log2(CHUNK_SIZE);

/// Size of each radix tree node (as a power of 2).  This impacts tree
/// depth.
#[cfg(target_pointer_width = "64")]
const NODE_SIZE: usize = CACHELINE_SIZE;
#[cfg(not(target_pointer_width = "64"))]
const NODE_SIZE: usize = 16 * 1024;

const BITS_PER_LEVEL: usize = log2(NODE_SIZE) - log2(core::mem::size_of::<usize>());
const BITS_AT_LEVEL1: usize = if BITS % BITS_PER_LEVEL != 0 {
    BITS % BITS_PER_LEVEL
} else {
    BITS_PER_LEVEL
};
const HEIGHT: usize = (BITS + BITS_PER_LEVEL - 1) / BITS_PER_LEVEL;

static_assertions::const_assert!(BITS_AT_LEVEL1 + (HEIGHT - 1) * BITS_PER_LEVEL == BITS);

/// A node is an array of slots; interior slots hold child node pointers,
/// leaf slots hold the stored values.  Slots are atomics so that the
/// unsynchronised read path pairs with the locked write path.
type Slot = AtomicUsize;

pub struct AddressRadixTree {
    // Guards slot-chain creation only; reads walk the tree without it.
    mtx: Mutex,
    root: AtomicUsize,
}

unsafe impl Sync for AddressRadixTree {}

impl AddressRadixTree {
    pub const fn new() -> AddressRadixTree {
        AddressRadixTree {
            mtx: Mutex::new(),
            root: AtomicUsize::new(0),
        }
    }

    fn alloc_node(slots: usize) -> *mut Slot {
        base::base_calloc(slots, core::mem::size_of::<Slot>()) as *mut Slot
    }

    unsafe fn root_node(&self, create: bool) -> *mut Slot {
        let mut root = self.root.load(Ordering::Acquire) as *mut Slot;
        if root.is_null() && create {
            root = Self::alloc_node(1 << BITS_AT_LEVEL1);
            if !root.is_null() {
                self.root.store(root as usize, Ordering::Release);
            }
        }
        root
    }

    /// Walks to the leaf slot for `key`, optionally creating the
    /// intermediate nodes.  Creation requires the lock to be held.
    unsafe fn slot(&self, key: usize, create: bool) -> *mut Slot {
        let mut node = self.root_node(create);
        if node.is_null() {
            return ptr::null_mut();
        }

        let mut lshift = 0;
        for i in 0..HEIGHT - 1 {
            let bits = if i == 0 { BITS_AT_LEVEL1 } else { BITS_PER_LEVEL };
            let subkey = (key << lshift) >> (PTR_BITS - bits);
            lshift += bits;

            let slot = node.add(subkey);
            let mut child = (*slot).load(Ordering::Acquire) as *mut Slot;
            if child.is_null() && create {
                child = Self::alloc_node(1 << BITS_PER_LEVEL);
                if !child.is_null() {
                    (*slot).store(child as usize, Ordering::Release);
                }
            }
            if child.is_null() {
                return ptr::null_mut();
            }
            node = child;
        }

        // The last level holds values rather than node pointers.
        let bits = if HEIGHT == 1 { BITS_AT_LEVEL1 } else { BITS_PER_LEVEL };
        let subkey = (key << lshift) >> (PTR_BITS - bits);
        node.add(subkey)
    }

    /// Lock-free lookup.  Returns the stored value for the chunk
    /// containing `addr`, or null.
    pub fn get(&self, addr: *const u8) -> *mut u8 {
        let slot = unsafe { self.slot(addr as usize, false) };
        let ret = if slot.is_null() {
            ptr::null_mut()
        } else {
            unsafe { (*slot).load(Ordering::Acquire) as *mut u8 }
        };

        // Suppose a chunk of ours were unmapped and the address range
        // reused by another allocator without invalidating this reader's
        // view; the tree would claim memory we had discarded.  That
        // interleaving shouldn't be possible, but the locked re-read
        // below keeps debug builds honest about it.
        #[cfg(debug_assertions)]
        {
            let _guard = self.mtx.lock();
            let slot = unsafe { self.slot(addr as usize, false) };
            if slot.is_null() {
                debug_assert!(ret.is_null());
            } else {
                debug_assert_eq!(ret as usize, unsafe {
                    (*slot).load(Ordering::Relaxed)
                });
            }
        }

        ret
    }

    /// Stores `value` for the chunk containing `addr`.  Returns whether
    /// the value was properly set (node creation can hit OOM).
    pub fn set(&self, addr: *const u8, value: *mut u8) -> bool {
        let _guard = self.mtx.lock();
        let slot = unsafe { self.slot(addr as usize, true) };
        if slot.is_null() {
            return false;
        }
        unsafe { (*slot).store(value as usize, Ordering::Release) };
        true
    }

    pub fn unset(&self, addr: *const u8) -> bool {
        self.set(addr, ptr::null_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_on_empty_tree() {
        let tree = AddressRadixTree::new();
        assert!(tree.get(0x1234_5678 as *const u8).is_null());
    }

    #[test]
    fn set_get_unset() {
        let tree = AddressRadixTree::new();
        let addr = (41 * CHUNK_SIZE) as *const u8;
        let value = 0xdead_0000 as *mut u8;

        assert!(tree.set(addr, value));
        assert_eq!(tree.get(addr), value);
        // Only the upper address bits are keyed: interior addresses of
        // the chunk share the slot, the next chunk does not.
        assert_eq!(tree.get((41 * CHUNK_SIZE + 12345) as *const u8), value);
        assert!(tree.get((42 * CHUNK_SIZE) as *const u8).is_null());

        assert!(tree.unset(addr));
        assert!(tree.get(addr).is_null());
    }

    #[test]
    fn many_disjoint_chunks() {
        let tree = AddressRadixTree::new();
        for i in 1..100usize {
            let addr = (i * CHUNK_SIZE) as *const u8;
            assert!(tree.set(addr, addr as *mut u8));
        }
        for i in 1..100usize {
            let addr = (i * CHUNK_SIZE) as *const u8;
            assert_eq!(tree.get(addr), addr as *mut u8);
        }
    }
}
