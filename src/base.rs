//! The base allocator services the allocator's own metadata: extent
//! nodes, arena structs, radix tree nodes, PRNG state.  It is a bump
//! allocator fed whole chunks, carved in cacheline-size quanta so that
//! metadata never shares a cache line, and it never frees; `TypedPool`
//! overlays per-type free lists for the structures that recycle.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use std::cell::UnsafeCell;
use std::ptr;

use crate::chunk;
use crate::constants::{cacheline_ceiling, chunk_ceiling, CACHELINE_SIZE, CHUNK_SIZE};
use crate::globals;
use crate::map;
use crate::mutex::Mutex;

struct BaseState {
    /// Current chunk being carved for internal allocations.
    pages: *mut u8,
    next_addr: *mut u8,
    next_decommitted: *mut u8,
    /// Address immediately past the current chunk.
    past_addr: *mut u8,
    mapped: usize,
    committed: usize,
}

pub struct BaseAlloc {
    mtx: Mutex,
    state: UnsafeCell<BaseState>,
}

unsafe impl Sync for BaseAlloc {}

static BASE: BaseAlloc = BaseAlloc {
    mtx: Mutex::new(),
    state: UnsafeCell::new(BaseState {
        pages: ptr::null_mut(),
        next_addr: ptr::null_mut(),
        next_decommitted: ptr::null_mut(),
        past_addr: ptr::null_mut(),
        mapped: 0,
        committed: 0,
    }),
};

impl BaseState {
    /// Replaces the current chunk with a fresh one large enough for
    /// `min_size` more bytes.  Returns whether that failed.
    fn grow(&mut self, min_size: usize) -> bool {
        debug_assert!(min_size != 0);
        let csize = chunk_ceiling(min_size);
        let pages = match chunk::chunk_alloc(csize, CHUNK_SIZE, /* base */ true) {
            Some(pages) => pages.as_ptr(),
            None => return true,
        };
        self.pages = pages;
        self.next_addr = pages;
        self.past_addr = (pages as usize + csize) as *mut u8;
        // Leave enough pages for min_size committed, since otherwise
        // they would have to be immediately recommitted.
        let pminsize = globals::g().page_ceiling(min_size);
        self.next_decommitted = (pages as usize + pminsize) as *mut u8;
        if pminsize < csize {
            map::pages_decommit(self.next_decommitted, csize - pminsize);
        }
        self.mapped += csize;
        self.committed += pminsize;
        false
    }

    fn alloc(&mut self, size: usize) -> *mut u8 {
        // Round up to a multiple of the cacheline size.
        let csize = cacheline_ceiling(size);

        // Make sure there's enough space for the allocation.
        if (self.next_addr as usize) + csize > self.past_addr as usize {
            if self.grow(csize) {
                return ptr::null_mut();
            }
        }
        let ret = self.next_addr;
        self.next_addr = (self.next_addr as usize + csize) as *mut u8;
        // Make sure enough pages are committed for the new allocation.
        if self.next_addr as usize > self.next_decommitted as usize {
            let pnext = globals::g().page_ceiling(self.next_addr as usize) as *mut u8;
            let len = pnext as usize - self.next_decommitted as usize;
            if !map::pages_commit(self.next_decommitted, len) {
                return ptr::null_mut();
            }
            self.committed += len;
            self.next_decommitted = pnext;
        }
        ret
    }
}

/// Allocates `size` bytes of cacheline-aligned metadata memory, or null.
/// The memory is never returned to the OS.
#[ensures(ret.is_null() || ret as usize % CACHELINE_SIZE == 0,
          "base allocations never share a cache line")]
pub fn base_alloc(size: usize) -> *mut u8 {
    let _guard = BASE.mtx.lock();
    unsafe { (*BASE.state.get()).alloc(size) }
}

/// As `base_alloc`, zero-filled.
pub fn base_calloc(number: usize, size: usize) -> *mut u8 {
    let total = match number.checked_mul(size) {
        Some(total) => total,
        None => return ptr::null_mut(),
    };
    let ret = base_alloc(total);
    if !ret.is_null() {
        unsafe { ptr::write_bytes(ret, 0, total) };
    }
    ret
}

// Fork integration; see the hooks in `collection`.
pub unsafe fn base_raw_lock() {
    BASE.mtx.raw_lock();
}

pub unsafe fn base_raw_unlock() {
    BASE.mtx.raw_unlock();
}

pub unsafe fn base_reinit() {
    BASE.mtx.reinit();
}

/// Mapped/committed byte counts, for the stats snapshot.
pub fn base_stats() -> (usize, usize) {
    let _guard = BASE.mtx.lock();
    let state = unsafe { &*BASE.state.get() };
    (state.mapped, state.committed)
}

/// A specialisation of the base allocator with a per-type free list:
/// `dealloc` pushes onto the list instead of returning memory, and
/// `alloc` pops before falling back to `base_alloc`.  This is how freed
/// extent nodes and disposed arenas survive beyond their use.
pub struct TypedPool<T> {
    first_free: UnsafeCell<*mut T>,
}

unsafe impl<T> Sync for TypedPool<T> {}

impl<T> TypedPool<T> {
    pub const fn new() -> TypedPool<T> {
        TypedPool {
            first_free: UnsafeCell::new(ptr::null_mut()),
        }
    }

    pub fn alloc(&self) -> *mut T {
        debug_assert!(core::mem::size_of::<T>() >= core::mem::size_of::<*mut T>());
        {
            let _guard = BASE.mtx.lock();
            let head = unsafe { *self.first_free.get() };
            if !head.is_null() {
                // The first word of a free node links to the next one.
                unsafe { *self.first_free.get() = *(head as *mut *mut T) };
                return head;
            }
        }
        base_alloc(core::mem::size_of::<T>()) as *mut T
    }

    pub fn dealloc(&self, node: *mut T) {
        let _guard = BASE.mtx.lock();
        unsafe {
            *(node as *mut *mut T) = *self.first_free.get();
            *self.first_free.get() = node;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::CACHELINE_SIZE;

    #[test]
    fn base_alloc_is_cacheline_aligned() {
        for size in [1usize, 7, 63, 64, 65, 1000] {
            let ptr = base_alloc(size);
            assert!(!ptr.is_null());
            assert_eq!(ptr as usize % CACHELINE_SIZE, 0);
            // The memory is writable.
            unsafe { ptr::write_bytes(ptr, 0xab, size) };
        }
    }

    #[test]
    fn base_calloc_zeroes() {
        let ptr = base_calloc(16, 8);
        assert!(!ptr.is_null());
        for i in 0..128 {
            assert_eq!(unsafe { ptr::read(ptr.add(i)) }, 0);
        }
    }

    #[test]
    fn base_calloc_overflow() {
        assert!(base_calloc(usize::MAX, 2).is_null());
    }

    #[test]
    fn typed_pool_recycles() {
        struct Widget {
            _a: usize,
            _b: usize,
        }
        static POOL: TypedPool<Widget> = TypedPool::new();

        let first = POOL.alloc();
        assert!(!first.is_null());
        let second = POOL.alloc();
        assert!(!second.is_null());
        assert_ne!(first, second);

        POOL.dealloc(first);
        // LIFO reuse of the freed node.
        assert_eq!(POOL.alloc(), first);

        POOL.dealloc(second);
        POOL.dealloc(first);
        assert_eq!(POOL.alloc(), first);
        assert_eq!(POOL.alloc(), second);
    }
}
