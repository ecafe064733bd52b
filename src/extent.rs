//! Extent nodes describe an (address, size) span of chunks.  The chunk
//! recycler keeps them in two trees at once (best-fit by size, coalesce
//! by address); the huge allocator keys them by address and records the
//! owning arena.  Nodes are drawn from a typed base pool and recycled
//! through its free list, never freed.
use std::cmp::Ordering;
use std::ptr;

use crate::base::TypedPool;
use crate::rb::{RbNode, RbOrder};

/// What a chunk-sized span of address space is currently used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkType {
    Unknown,
    /// Only contains zeroes.
    Zeroed,
    /// Backs arena runs.
    Arena,
    /// Backs a huge allocation.
    Huge,
    /// Stored for future use by the chunk recycler.
    Recycled,
}

pub struct ExtentNode {
    /// Linkage for the size/address-ordered tree used for chunk
    /// recycling.
    pub link_by_size: RbNode<ExtentNode>,

    /// Linkage for the address-ordered trees (chunk coalescing, huge
    /// lookups).
    pub link_by_addr: RbNode<ExtentNode>,

    /// First byte of the span this node is responsible for.
    pub addr: *mut u8,

    /// Total span size.
    pub size: usize,

    /// Used by the chunk recycler.
    pub chunk_type: ChunkType,

    /// Owning arena, for huge allocations.  Non-owning: the arena can
    /// only go away once no huge node references it.
    pub arena: *mut crate::arena::Arena,

    /// Meant to match `(*arena).id`, which only holds while the arena
    /// hasn't been disposed of.
    pub arena_id: u64,
}

impl ExtentNode {
    /// A blank node usable as a synthetic tree key.
    pub fn key(addr: *mut u8, size: usize) -> ExtentNode {
        ExtentNode {
            link_by_size: RbNode::new(),
            link_by_addr: RbNode::new(),
            addr,
            size,
            chunk_type: ChunkType::Unknown,
            arena: ptr::null_mut(),
            arena_id: 0,
        }
    }
}

pub static EXTENT_POOL: TypedPool<ExtentNode> = TypedPool::new();

/// Size-then-address order, for best-fit recycling.
pub struct ExtentBySize;

impl RbOrder<ExtentNode> for ExtentBySize {
    unsafe fn node(t: *mut ExtentNode) -> *mut RbNode<ExtentNode> {
        ptr::addr_of_mut!((*t).link_by_size)
    }

    unsafe fn cmp(a: *const ExtentNode, b: *const ExtentNode) -> Ordering {
        (*a).size
            .cmp(&(*b).size)
            .then((*a).addr.cmp(&(*b).addr))
    }
}

/// Address order, for coalescing and huge lookups.
pub struct ExtentByAddr;

impl RbOrder<ExtentNode> for ExtentByAddr {
    unsafe fn node(t: *mut ExtentNode) -> *mut RbNode<ExtentNode> {
        ptr::addr_of_mut!((*t).link_by_addr)
    }

    unsafe fn cmp(a: *const ExtentNode, b: *const ExtentNode) -> Ordering {
        (*a).addr.cmp(&(*b).addr)
    }
}

/// Address order where a key compares equal to any node whose span
/// contains it; used to resolve interior pointers of huge allocations.
pub struct ExtentBounds;

impl RbOrder<ExtentNode> for ExtentBounds {
    unsafe fn node(t: *mut ExtentNode) -> *mut RbNode<ExtentNode> {
        ptr::addr_of_mut!((*t).link_by_addr)
    }

    unsafe fn cmp(a: *const ExtentNode, b: *const ExtentNode) -> Ordering {
        let key_addr = (*a).addr as usize;
        let node_addr = (*b).addr as usize;
        let node_size = (*b).size;

        if node_addr <= key_addr && key_addr < node_addr + node_size {
            return Ordering::Equal;
        }
        key_addr.cmp(&node_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rb::RbTree;

    #[test]
    fn bounds_order_matches_interior_pointers() {
        unsafe {
            let mut tree: RbTree<ExtentNode, ExtentByAddr> = RbTree::new();
            let a = EXTENT_POOL.alloc();
            let b = EXTENT_POOL.alloc();
            *a = ExtentNode::key(0x10_0000 as *mut u8, 0x10_0000);
            *b = ExtentNode::key(0x40_0000 as *mut u8, 0x20_0000);
            tree.insert(a);
            tree.insert(b);

            // Searching the address tree under the bounds order is how
            // interior huge pointers are resolved.
            let key = ExtentNode::key(0x41_2345 as *mut u8, 0);
            assert_eq!(tree.search_with::<ExtentBounds>(&key), b);
            let key = ExtentNode::key(0x3f_ffff as *mut u8, 0);
            assert!(tree.search_with::<ExtentBounds>(&key).is_null());
            let key = ExtentNode::key(0x10_0000 as *mut u8, 0);
            assert_eq!(tree.search_with::<ExtentBounds>(&key), a);

            tree.remove(a);
            tree.remove(b);
            EXTENT_POOL.dealloc(a);
            EXTENT_POOL.dealloc(b);
        }
    }

    #[test]
    fn size_order_breaks_ties_by_address() {
        unsafe {
            let mut tree: RbTree<ExtentNode, ExtentBySize> = RbTree::new();
            let nodes: Vec<*mut ExtentNode> = [
                (0x30_0000usize, 0x10_0000usize),
                (0x10_0000, 0x10_0000),
                (0x50_0000, 0x20_0000),
            ]
            .iter()
            .map(|&(addr, size)| {
                let n = EXTENT_POOL.alloc();
                *n = ExtentNode::key(addr as *mut u8, size);
                tree.insert(n);
                n
            })
            .collect();

            // Best fit for one chunk: the lowest-addressed of the two
            // one-chunk nodes.
            let key = ExtentNode::key(ptr::null_mut(), 0x10_0000);
            let hit = tree.search_or_next(&key);
            assert_eq!((*hit).addr as usize, 0x10_0000);

            // Best fit for 1.5 chunks: only the two-chunk node works.
            let key = ExtentNode::key(ptr::null_mut(), 0x18_0000);
            let hit = tree.search_or_next(&key);
            assert_eq!((*hit).addr as usize, 0x50_0000);

            for n in nodes {
                tree.remove(n);
                EXTENT_POOL.dealloc(n);
            }
        }
    }
}
