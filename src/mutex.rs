//! Locking primitives built directly on the OS (pthread mutexes, SRW
//! locks).  The standard library's locks are not usable here: fork
//! handlers must be able to reinitialise a lock in the child while it is
//! formally held, and allocator locks must never allocate.
use std::cell::UnsafeCell;

#[cfg(unix)]
type RawMutex = libc::pthread_mutex_t;
#[cfg(windows)]
type RawMutex = winapi::um::minwinbase::SRWLOCK;

pub struct Mutex {
    inner: UnsafeCell<RawMutex>,
}

unsafe impl Send for Mutex {}
unsafe impl Sync for Mutex {}

impl Mutex {
    #[cfg(unix)]
    pub const fn new() -> Mutex {
        Mutex {
            inner: UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER),
        }
    }

    #[cfg(windows)]
    pub const fn new() -> Mutex {
        Mutex {
            inner: UnsafeCell::new(winapi::um::minwinbase::SRWLOCK_INIT),
        }
    }

    #[inline]
    pub fn lock(&self) -> MutexGuard<'_> {
        unsafe { self.raw_lock() };
        MutexGuard { mutex: self }
    }

    /// # Safety
    ///
    /// Every `raw_lock` must be paired with exactly one `raw_unlock` on
    /// the same thread.  Prefer `lock()`.
    #[inline]
    pub unsafe fn raw_lock(&self) {
        #[cfg(unix)]
        libc::pthread_mutex_lock(self.inner.get());
        #[cfg(windows)]
        winapi::um::synchapi::AcquireSRWLockExclusive(self.inner.get());
    }

    /// # Safety
    ///
    /// The lock must be held by the current thread.
    #[inline]
    pub unsafe fn raw_unlock(&self) {
        #[cfg(unix)]
        libc::pthread_mutex_unlock(self.inner.get());
        #[cfg(windows)]
        winapi::um::synchapi::ReleaseSRWLockExclusive(self.inner.get());
    }

    /// Reinitialises the lock in a freshly forked child, dropping any
    /// pre-fork waiters.
    ///
    /// # Safety
    ///
    /// Only the forking thread may be running when this is called.
    pub unsafe fn reinit(&self) {
        #[cfg(unix)]
        {
            *self.inner.get() = libc::PTHREAD_MUTEX_INITIALIZER;
        }
        #[cfg(windows)]
        {
            *self.inner.get() = winapi::um::minwinbase::SRWLOCK_INIT;
        }
    }
}

pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

impl Drop for MutexGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        unsafe { self.mutex.raw_unlock() };
    }
}

/// Returns an opaque identifier for the current thread, usable for
/// single-threaded-access assertions.
#[inline]
pub fn thread_id() -> usize {
    #[cfg(unix)]
    {
        unsafe { libc::pthread_self() as usize }
    }
    #[cfg(windows)]
    {
        unsafe { winapi::um::processthreadsapi::GetCurrentThreadId() as usize }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum DoLock {
    /// The structure is shared between threads: really lock.
    MustLock,
    /// The structure is only ever touched from one thread: elide the
    /// lock and assert the access pattern instead.
    AvoidLockUnsafe,
}

/// A mutex that may be elided for structures accessed from a single
/// thread only (main-thread-only arenas).  When elided, debug builds
/// assert that every access comes from the owning thread.
pub struct MaybeMutex {
    mutex: Mutex,
    lock_enabled: bool,
    owner: UnsafeCell<usize>,
}

unsafe impl Send for MaybeMutex {}
unsafe impl Sync for MaybeMutex {}

impl MaybeMutex {
    pub fn new(do_lock: DoLock) -> MaybeMutex {
        MaybeMutex {
            mutex: Mutex::new(),
            lock_enabled: do_lock == DoLock::MustLock,
            owner: UnsafeCell::new(if do_lock == DoLock::MustLock {
                0
            } else {
                thread_id()
            }),
        }
    }

    #[inline]
    pub fn lock_is_enabled(&self) -> bool {
        self.lock_enabled
    }

    /// Whether the current thread may access the protected structure at
    /// all: always true for real locks, owner-only otherwise.
    #[inline]
    pub fn safe_on_this_thread(&self) -> bool {
        self.lock_enabled || unsafe { *self.owner.get() } == thread_id()
    }

    #[inline]
    pub fn lock(&self) -> MaybeMutexGuard<'_> {
        if self.lock_enabled {
            unsafe { self.mutex.raw_lock() };
        } else {
            debug_assert!(
                self.safe_on_this_thread(),
                "lock-free structure accessed off its owning thread"
            );
        }
        MaybeMutexGuard { mutex: self }
    }

    pub unsafe fn raw_lock(&self) {
        if self.lock_enabled {
            self.mutex.raw_lock();
        }
    }

    pub unsafe fn raw_unlock(&self) {
        if self.lock_enabled {
            self.mutex.raw_unlock();
        }
    }

    /// See `Mutex::reinit`; additionally adopts the forking thread as
    /// the new owner of elided locks.
    pub unsafe fn reinit(&self) {
        self.mutex.reinit();
        *self.owner.get() = thread_id();
    }
}

pub struct MaybeMutexGuard<'a> {
    mutex: &'a MaybeMutex,
}

impl Drop for MaybeMutexGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        if self.mutex.lock_enabled {
            unsafe { self.mutex.mutex.raw_unlock() };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn guard_releases() {
        let mutex = Mutex::new();
        {
            let _guard = mutex.lock();
        }
        // A second acquisition would deadlock if the guard leaked.
        let _guard = mutex.lock();
    }

    #[test]
    fn mutual_exclusion() {
        static MUTEX: Mutex = Mutex::new();
        static COUNTER: AtomicUsize = AtomicUsize::new(0);

        let threads: Vec<_> = (0..4)
            .map(|_| {
                std::thread::spawn(|| {
                    for _ in 0..1000 {
                        let _guard = MUTEX.lock();
                        // Non-atomic read-modify-write under the lock.
                        let v = COUNTER.load(Ordering::Relaxed);
                        COUNTER.store(v + 1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(COUNTER.load(Ordering::Relaxed), 4000);
    }

    #[test]
    fn elided_lock_tracks_owner() {
        let maybe = MaybeMutex::new(DoLock::AvoidLockUnsafe);
        assert!(!maybe.lock_is_enabled());
        assert!(maybe.safe_on_this_thread());
        let _guard = maybe.lock();
    }

    #[test]
    fn real_lock_is_safe_everywhere() {
        let maybe = MaybeMutex::new(DoLock::MustLock);
        assert!(maybe.lock_is_enabled());
        assert!(maybe.safe_on_this_thread());
    }
}
