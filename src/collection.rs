//! Bookkeeping for all the arenas in the process.  Arenas fall in three
//! trees keyed by id: public arenas (the default arena and thread-local
//! ones, sequential ids), private arenas (random ids), and
//! main-thread-only arenas, which are only ever touched from the main
//! thread and can therefore be looked up without the collection lock.
//! Their ids carry a tag bit so `get_by_id` knows which tree to use.
use std::cell::{Cell, UnsafeCell};
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use crate::arena::{Arena, ArenaIdOrder, ArenaParams, ARENA_FLAG_THREAD_MAIN_THREAD_ONLY, ARENA_FLAG_THREAD_MASK};
use crate::base::TypedPool;
use crate::constants::MAX_QUANTUM_CLASS;
use crate::mutex::{thread_id, Mutex};
use crate::random::os_random_u64;
use crate::rb::RbTree;

const MAIN_THREAD_ARENA_BIT: u64 = 0x1;

pub static ARENA_POOL: TypedPool<Arena> = TypedPool::new();

struct CollectionInner {
    default_arena: *mut Arena,
    last_public_id: u64,
    arenas: RbTree<Arena, ArenaIdOrder>,
    private_arenas: RbTree<Arena, ArenaIdOrder>,
    main_thread_arenas: RbTree<Arena, ArenaIdOrder>,
}

pub struct ArenaCollection {
    mtx: Mutex,
    inner: UnsafeCell<CollectionInner>,
    default_max_dirty_modifier: AtomicI32,
    // Thread id of the main thread, zero until `set_main_thread`.
    main_thread: AtomicUsize,
}

unsafe impl Sync for ArenaCollection {}

static ARENAS: ArenaCollection = ArenaCollection {
    mtx: Mutex::new(),
    inner: UnsafeCell::new(CollectionInner {
        default_arena: ptr::null_mut(),
        last_public_id: 0,
        arenas: RbTree::new(),
        private_arenas: RbTree::new(),
        main_thread_arenas: RbTree::new(),
    }),
    default_max_dirty_modifier: AtomicI32::new(0),
    main_thread: AtomicUsize::new(0),
};

thread_local! {
    static THREAD_ARENA: Cell<*mut Arena> = Cell::new(ptr::null_mut());
}

lazy_static::lazy_static! {
    static ref MALLOC_INITIALIZED: bool = malloc_init_hard();
}

/// Brings the allocator up (idempotent).  Returns whether it is usable.
#[inline]
pub fn malloc_init() -> bool {
    *MALLOC_INITIALIZED
}

fn malloc_init_hard() -> bool {
    // The default arena gets the whole dirty-page budget; other arenas
    // default to a fraction of it.
    let params = ArenaParams {
        max_dirty: crate::globals::g().opt.dirty_max,
        ..ArenaParams::default()
    };
    let default_arena = create_arena_internal(false, Some(&params));
    if default_arena.is_null() {
        return false;
    }

    unsafe { (*ARENAS.inner.get()).default_arena = default_arena };
    THREAD_ARENA.with(|cell| cell.set(default_arena));

    // Keep the allocator's locks consistent across fork().
    #[cfg(unix)]
    unsafe {
        libc::pthread_atfork(
            Some(prefork),
            Some(postfork_parent),
            Some(postfork_child),
        );
    }

    true
}

pub fn default_arena() -> *mut Arena {
    if !malloc_init() {
        return ptr::null_mut();
    }
    unsafe { (*ARENAS.inner.get()).default_arena }
}

/// The process-wide signed shift applied to every arena's effective
/// dirty-page budget (e.g. by memory-pressure observers).
pub fn default_max_dirty_page_modifier() -> i32 {
    ARENAS.default_max_dirty_modifier.load(Ordering::Relaxed)
}

pub fn set_default_max_dirty_page_modifier(modifier: i32) {
    ARENAS
        .default_max_dirty_modifier
        .store(modifier, Ordering::Relaxed);
}

/// Records the calling thread as the main thread, enabling
/// main-thread-only arenas and complete stats iteration.
pub fn set_main_thread() {
    let _guard = ARENAS.mtx.lock();
    debug_assert_eq!(ARENAS.main_thread.load(Ordering::Relaxed), 0);
    ARENAS.main_thread.store(thread_id(), Ordering::Relaxed);
}

pub fn is_on_main_thread() -> bool {
    let main = ARENAS.main_thread.load(Ordering::Relaxed);
    main != 0 && main == thread_id()
}

/// True when on the main thread or when no main thread was declared.
pub fn is_on_main_thread_weak() -> bool {
    let main = ARENAS.main_thread.load(Ordering::Relaxed);
    main == 0 || main == thread_id()
}

/// After a fork the child may be running on any thread, so the recorded
/// main-thread identity is cleared rather than adopted.
fn reset_main_thread() {
    ARENAS.main_thread.store(0, Ordering::Relaxed);
}

fn arena_id_is_main_thread_only(id: u64) -> bool {
    id & MAIN_THREAD_ARENA_BIT != 0
}

fn make_rand_arena_id(is_main_thread_only: bool) -> u64 {
    loop {
        // Cryptographically random ids make private arenas hard to
        // guess for an attacker with partial control of the process.
        let mut rand = os_random_u64();
        if is_main_thread_only {
            rand |= MAIN_THREAD_ARENA_BIT;
        } else {
            rand &= !MAIN_THREAD_ARENA_BIT;
        }
        // Zero is reserved for disposed arenas.
        if rand != 0 {
            return rand;
        }
    }
}

unsafe fn get_by_id_internal(
    tree: &RbTree<Arena, ArenaIdOrder>,
    arena_id: u64,
) -> *mut Arena {
    // A placeholder key carrying only the id; the order never looks at
    // anything else.
    let mut key = core::mem::MaybeUninit::<Arena>::uninit();
    ptr::addr_of_mut!((*key.as_mut_ptr()).id).write(arena_id);
    tree.search(key.as_ptr())
}

/// Looks up an arena by id, crashing on stale ids (e.g. a disposed
/// arena's).
pub fn get_by_id(arena_id: u64, is_private: bool) -> *mut Arena {
    if !malloc_init() {
        return ptr::null_mut();
    }

    unsafe {
        if is_private && arena_id_is_main_thread_only(arena_id) {
            // Main-thread-only arenas are only touched from the main
            // thread, so no lock is needed here.
            let result =
                get_by_id_internal(&(*ARENAS.inner.get()).main_thread_arenas, arena_id);
            assert!(!result.is_null(), "no such arena");
            return result;
        }

        let _guard = ARENAS.mtx.lock();
        let inner = &*ARENAS.inner.get();
        let tree = if is_private {
            &inner.private_arenas
        } else {
            &inner.arenas
        };
        let result = get_by_id_internal(tree, arena_id);
        assert!(!result.is_null(), "no such arena");
        result
    }
}

fn create_arena_internal(is_private: bool, params: Option<&ArenaParams>) -> *mut Arena {
    let arena = ARENA_POOL.alloc();
    if arena.is_null() {
        // OOM here is inconvenient to propagate; checking for failure
        // in the fast path isn't worth it.  Punt to the default arena.
        log::warn!("error initializing arena");
        return unsafe { (*ARENAS.inner.get()).default_arena };
    }
    unsafe {
        Arena::init_at(arena, params, is_private);

        let _guard = ARENAS.mtx.lock();
        let inner = &mut *ARENAS.inner.get();

        if !is_private {
            // Sequential ids are fine for public arenas.
            (*arena).id = inner.last_public_id;
            inner.last_public_id += 1;
            inner.arenas.insert(arena);
            return arena;
        }

        let main_thread_only = Arena::is_main_thread_only(arena);
        let tree = if main_thread_only {
            &mut inner.main_thread_arenas
        } else {
            &mut inner.private_arenas
        };
        let mut arena_id;
        loop {
            arena_id = make_rand_arena_id(main_thread_only);
            // Regenerate until the id isn't in use by a live arena.
            if get_by_id_internal(tree, arena_id).is_null() {
                break;
            }
        }
        (*arena).id = arena_id;
        tree.insert(arena);
        arena
    }
}

/// Creates an arena.  Public creation happens once, for the default
/// arena and thread-local ones; everything else is private.
pub fn create_arena(is_private: bool, params: Option<&ArenaParams>) -> *mut Arena {
    if !malloc_init() {
        return ptr::null_mut();
    }
    if let Some(params) = params {
        if params.flags & ARENA_FLAG_THREAD_MASK == ARENA_FLAG_THREAD_MAIN_THREAD_ONLY {
            assert!(is_private);
        }
    }
    create_arena_internal(is_private, params)
}

/// Disposes of an empty private arena; crashes if it still has live
/// allocations.
pub fn dispose_arena(arena: *mut Arena) {
    unsafe {
        {
            let _guard = ARENAS.mtx.lock();
            let inner = &mut *ARENAS.inner.get();
            let tree = if Arena::is_main_thread_only(arena) {
                &mut inner.main_thread_arenas
            } else {
                &mut inner.private_arenas
            };
            assert!(
                get_by_id_internal(tree, (*arena).id) == arena,
                "arena not in tree"
            );
            tree.remove(arena);
        }
        Arena::assert_empty_and_reset(arena);
        ARENA_POOL.dealloc(arena);
    }
}

/// Picks the arena for a fresh allocation: the thread's pinned arena
/// for small requests, the default arena otherwise (large and huge
/// allocations don't benefit from thread pinning).
pub fn choose_arena(size: usize) -> *mut Arena {
    if !malloc_init() {
        return ptr::null_mut();
    }

    let ret = if size > MAX_QUANTUM_CLASS {
        default_arena()
    } else {
        let cached = THREAD_ARENA.with(|cell| cell.get());
        if cached.is_null() {
            // Nothing in TLS yet: pin this thread to the default arena.
            thread_local_arena(false)
        } else {
            cached
        }
    };

    debug_assert!(!ret.is_null());
    ret
}

/// Pins the current thread to an arena of its own, or back to the
/// default one.  Returns the thread's arena.  Thread-local arenas are
/// public: they only exist to reduce contention, so reallocations may
/// still migrate out of them.
pub fn thread_local_arena(enabled: bool) -> *mut Arena {
    let arena = if enabled {
        create_arena(false, None)
    } else {
        default_arena()
    };
    THREAD_ARENA.with(|cell| cell.set(arena));
    arena
}

/// Runs `f` on every arena: public, private, then (when callable from
/// the main thread) main-thread-only ones.  The collection lock is held
/// throughout.
pub fn for_each_arena(mut f: impl FnMut(*mut Arena)) {
    if !malloc_init() {
        return;
    }
    let _guard = ARENAS.mtx.lock();
    unsafe {
        let inner = &*ARENAS.inner.get();
        for arena in inner.arenas.iter() {
            f(arena);
        }
        for arena in inner.private_arenas.iter() {
            f(arena);
        }
        if is_on_main_thread_weak() {
            for arena in inner.main_thread_arenas.iter() {
                f(arena);
            }
        }
    }
}

// Fork integration: the pre-fork hook takes every allocator lock in
// lock order so the child snapshots them unheld; the child-side hook
// reinitialises them, dropping pre-fork waiters, and clears the
// main-thread identity.

#[cfg(unix)]
unsafe fn for_each_arena_unlocked(inner: &CollectionInner, mut f: impl FnMut(*mut Arena)) {
    for arena in inner.arenas.iter() {
        f(arena);
    }
    for arena in inner.private_arenas.iter() {
        f(arena);
    }
    for arena in inner.main_thread_arenas.iter() {
        f(arena);
    }
}

#[cfg(unix)]
unsafe extern "C" fn prefork() {
    ARENAS.mtx.raw_lock();
    let inner = &*ARENAS.inner.get();
    for_each_arena_unlocked(inner, |arena| unsafe { (*arena).lock.raw_lock() });
    crate::huge::huge_raw_lock();
    crate::base::base_raw_lock();
}

#[cfg(unix)]
unsafe extern "C" fn postfork_parent() {
    crate::base::base_raw_unlock();
    crate::huge::huge_raw_unlock();
    let inner = &*ARENAS.inner.get();
    for_each_arena_unlocked(inner, |arena| unsafe { (*arena).lock.raw_unlock() });
    ARENAS.mtx.raw_unlock();
}

#[cfg(unix)]
unsafe extern "C" fn postfork_child() {
    crate::base::base_reinit();
    crate::huge::huge_reinit();
    let inner = &*ARENAS.inner.get();
    for_each_arena_unlocked(inner, |arena| unsafe { (*arena).lock.reinit() });
    ARENAS.mtx.reinit();
    reset_main_thread();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_arena_exists() {
        assert!(malloc_init());
        let default = default_arena();
        assert!(!default.is_null());
        unsafe {
            assert!(!(*default).is_private);
        }
    }

    #[test]
    fn choose_arena_pins_thread() {
        let first = choose_arena(16);
        let second = choose_arena(16);
        assert_eq!(first, second);
        // Large requests always go to the default arena.
        assert_eq!(choose_arena(MAX_QUANTUM_CLASS + 1), default_arena());
    }

    #[test]
    fn thread_local_arena_round_trip() {
        std::thread::spawn(|| {
            let pinned = thread_local_arena(true);
            assert_ne!(pinned, default_arena());
            assert_eq!(choose_arena(16), pinned);
            let back = thread_local_arena(false);
            assert_eq!(back, default_arena());
            assert_eq!(choose_arena(16), default_arena());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn private_arena_ids_are_tagged_and_unique() {
        let a = create_arena(true, None);
        let b = create_arena(true, None);
        unsafe {
            assert_ne!((*a).id, 0);
            assert_ne!((*b).id, 0);
            assert_ne!((*a).id, (*b).id);
            assert!(!arena_id_is_main_thread_only((*a).id));
            assert_eq!(get_by_id((*a).id, true), a);
        }
        dispose_arena(a);
        dispose_arena(b);
    }

    #[test]
    fn modifier_round_trips() {
        assert_eq!(default_max_dirty_page_modifier(), 0);
        set_default_max_dirty_page_modifier(2);
        assert_eq!(default_max_dirty_page_modifier(), 2);
        set_default_max_dirty_page_modifier(0);
    }
}
