//! The OS page facade: thin pure-Rust wrappers around the virtual-memory
//! primitives (mmap/munmap on POSIX, VirtualAlloc/VirtualFree on
//! Windows).  Everything above this module speaks in page-granular ranges
//! and never touches the OS directly.
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

use std::ptr::NonNull;

#[cfg(windows)]
use std::sync::atomic::{AtomicBool, Ordering};

/// Returns the kernel page size.  Constant for the lifetime of a process.
#[ensures(ret > 0 && ret & (ret - 1) == 0, "page size must be a power of 2")]
#[ensures(ret <= crate::constants::CHUNK_SIZE, "pages are smaller than chunks")]
#[inline]
pub fn real_page_size() -> usize {
    lazy_static::lazy_static! {
        static ref PAGE_SIZE: usize = kernel_page_size();
    }

    *PAGE_SIZE
}

#[cfg(unix)]
fn kernel_page_size() -> usize {
    let result = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    assert!(result > 0, "unable to find the page size: errno={}", errno::errno());
    result as usize
}

#[cfg(windows)]
fn kernel_page_size() -> usize {
    use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};

    let mut info: SYSTEM_INFO = Default::default();
    unsafe { GetSystemInfo(&mut info) };
    info.dwPageSize as usize
}

// On Windows, a commit may transiently fail while the page file grows.
// Rather than reporting OOM immediately we stall and retry a bounded
// number of times: 10 attempts for the main process, half that for
// others, sleeping 50ms between attempts.
#[cfg(windows)]
const STALL_MAX_ATTEMPTS: usize = 10;
#[cfg(windows)]
const STALL_DELAY_MS: u32 = 50;

#[cfg(windows)]
static MAIN_PROCESS: AtomicBool = AtomicBool::new(true);

/// Tells the facade whether this is the application's main process; child
/// processes get a shorter commit-retry budget.
#[cfg(windows)]
pub fn set_main_process(is_main: bool) {
    MAIN_PROCESS.store(is_main, Ordering::Relaxed);
}

#[cfg(not(windows))]
pub fn set_main_process(_is_main: bool) {}

/// Drop-in wrapper around VirtualAlloc.  When out of memory, stalls and
/// retries in hopes that the page file is about to be expanded.  On a
/// successful retry the original last-error state is restored so that
/// process-wide error telemetry isn't polluted.
#[cfg(windows)]
unsafe fn virtual_alloc_stalling(
    addr: *mut u8,
    size: usize,
    alloc_type: u32,
    protect: u32,
) -> *mut u8 {
    use winapi::shared::winerror::{ERROR_COMMITMENT_LIMIT, ERROR_NOT_ENOUGH_MEMORY};
    use winapi::um::errhandlingapi::{GetLastError, SetLastError};
    use winapi::um::memoryapi::VirtualAlloc;
    use winapi::um::synchapi::Sleep;
    use winapi::um::winnt::MEM_COMMIT;

    fn is_oom_error() -> bool {
        let err = unsafe { winapi::um::errhandlingapi::GetLastError() };
        err == ERROR_COMMITMENT_LIMIT || err == ERROR_NOT_ENOUGH_MEMORY
    }

    let last_error = GetLastError();

    let ptr = VirtualAlloc(addr as _, size, alloc_type, protect) as *mut u8;
    if !ptr.is_null() {
        return ptr;
    }
    // We can't do anything for errors other than OOM, and have no
    // strategy for resolving MEM_RESERVE failures.
    if !is_oom_error() || (alloc_type & MEM_COMMIT) == 0 {
        return std::ptr::null_mut();
    }

    let max_attempts = if MAIN_PROCESS.load(Ordering::Relaxed) {
        STALL_MAX_ATTEMPTS
    } else {
        STALL_MAX_ATTEMPTS / 2
    };
    for _ in 0..max_attempts {
        Sleep(STALL_DELAY_MS);
        let ptr = VirtualAlloc(addr as _, size, alloc_type, protect) as *mut u8;
        if !ptr.is_null() {
            // The OOM was handled after all; don't report it.
            if is_oom_error() {
                SetLastError(last_error);
            }
            return ptr;
        }
        if !is_oom_error() {
            return std::ptr::null_mut();
        }
    }

    std::ptr::null_mut()
}

/// Attempts to map `size` bytes of read-write anonymous memory.  When
/// `addr` is non-null the mapping must land exactly there; a mapping that
/// comes back anywhere else is released and treated as failure.
pub fn pages_map(addr: *mut u8, size: usize) -> Option<NonNull<u8>> {
    assert!(
        size > 0 && size % real_page_size() == 0,
        "bad mapping size={} page_size={}",
        size,
        real_page_size()
    );

    let ret = pages_map_raw(addr, size);

    match ret {
        Some(ptr) if !addr.is_null() && ptr.as_ptr() != addr => {
            // We succeeded in mapping memory, but not in the right place.
            pages_unmap(ptr.as_ptr(), size);
            None
        }
        other => other,
    }
}

// Some 64-bit platforms hand out addresses with the top 17 bits set,
// which embedders (JS engines in particular) cannot represent.  There
// the kernel honours address hints precisely enough that mapping at a
// hint just below that boundary keeps the bits clear; a result that
// still violates the constraint is unmapped and treated as failure.
#[cfg(all(target_arch = "sparc64", target_os = "linux"))]
fn pages_map_raw(addr: *mut u8, size: usize) -> Option<NonNull<u8>> {
    const START: usize = 0x0000_0700_0000_0000;
    const END: usize = 0x0000_8000_0000_0000;
    const HIGH_BITS: usize = 0xffff_8000_0000_0000;

    if !addr.is_null() {
        return pages_map_plain(addr, size);
    }
    let mut hint = START;
    while hint + size <= END {
        if let Some(region) = pages_map_plain(hint as *mut u8, size) {
            if (region.as_ptr() as usize + (size - 1)) & HIGH_BITS == 0 {
                return Some(region);
            }
            pages_unmap(region.as_ptr(), size);
        }
        hint += crate::constants::CHUNK_SIZE;
    }
    None
}

#[cfg(all(unix, not(all(target_arch = "sparc64", target_os = "linux"))))]
fn pages_map_raw(addr: *mut u8, size: usize) -> Option<NonNull<u8>> {
    pages_map_plain(addr, size)
}

#[cfg(unix)]
fn pages_map_plain(addr: *mut u8, size: usize) -> Option<NonNull<u8>> {
    // No MAP_FIXED here: it can replace existing mappings, and we only
    // want to create new ones.
    let ret = unsafe {
        libc::mmap(
            addr as *mut libc::c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        )
    };
    if ret == libc::MAP_FAILED {
        return None;
    }

    NonNull::new(ret as *mut u8)
}

#[cfg(windows)]
fn pages_map_raw(addr: *mut u8, size: usize) -> Option<NonNull<u8>> {
    use winapi::um::winnt::{MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE};

    let ret = unsafe {
        virtual_alloc_stalling(addr, size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE)
    };
    NonNull::new(ret)
}

/// Releases a mapping obtained from `pages_map`.
pub fn pages_unmap(addr: *mut u8, size: usize) {
    assert!(!addr.is_null());
    assert!(
        size % real_page_size() == 0,
        "bad unmapping size={} page_size={}",
        size,
        real_page_size()
    );

    #[cfg(unix)]
    {
        if unsafe { libc::munmap(addr as *mut libc::c_void, size) } == -1 {
            log::warn!("error in munmap: {}", errno::errno());
        }
    }
    #[cfg(windows)]
    {
        use winapi::um::memoryapi::VirtualFree;
        use winapi::um::winnt::MEM_RELEASE;

        let _ = size;
        if unsafe { VirtualFree(addr as _, 0, MEM_RELEASE) } == 0 {
            log::warn!("error in VirtualFree");
        }
    }
}

/// Commits pages so they can be written to.  Returns whether the pages
/// were committed; the only failure mode is out of backing store.
/// Committed pages read as zero.
#[must_use]
pub fn pages_commit(addr: *mut u8, size: usize) -> bool {
    #[cfg(unix)]
    {
        let ret = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_FIXED | libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        ret != libc::MAP_FAILED
    }
    #[cfg(windows)]
    {
        use winapi::um::winnt::{MEM_COMMIT, PAGE_READWRITE};

        // The range may span multiple VirtualAlloc'ed regions that were
        // recycled into one span, so committing it in one go may not be
        // valid.  Since we allocate at least a chunk at a time, we may
        // touch any region in chunk-sized increments.
        let chunk_size = crate::constants::CHUNK_SIZE;
        let mut addr = addr;
        let mut size = size;
        let mut stride = size.min(chunk_size - (addr as usize & (chunk_size - 1)));
        while size > 0 {
            if unsafe { virtual_alloc_stalling(addr, stride, MEM_COMMIT, PAGE_READWRITE) }
                .is_null()
            {
                return false;
            }
            addr = (addr as usize + stride) as *mut u8;
            size -= stride;
            stride = size.min(chunk_size);
        }
        true
    }
}

/// Decommits pages: their backing store is reclaimed and any access
/// faults until `pages_commit` is called again.  Must not fail; the one
/// POSIX failure mode (no room for a replacement mapping) aborts the
/// process with an annotation distinguishing address-space exhaustion.
pub fn pages_decommit(addr: *mut u8, size: usize) {
    #[cfg(unix)]
    {
        let ret = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                size,
                libc::PROT_NONE,
                libc::MAP_FIXED | libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if ret == libc::MAP_FAILED {
            if errno::errno().0 == libc::ENOMEM {
                panic!(
                    "[unhandlable oom] failed to mmap, likely no more mappings available"
                );
            }
            panic!("failed to decommit pages: {}", errno::errno());
        }
    }
    #[cfg(windows)]
    {
        use winapi::um::memoryapi::VirtualFree;
        use winapi::um::winnt::MEM_DECOMMIT;

        // Same chunk-sized stride reasoning as pages_commit.  Decommitted
        // ranges access-violate on read and write and thus also act as
        // guard regions.
        let chunk_size = crate::constants::CHUNK_SIZE;
        let mut addr = addr;
        let mut size = size;
        let mut stride = size.min(chunk_size - (addr as usize & (chunk_size - 1)));
        while size > 0 {
            if unsafe { VirtualFree(addr as _, stride, MEM_DECOMMIT) } == 0 {
                panic!("failed to decommit pages");
            }
            addr = (addr as usize + stride) as *mut u8;
            size -= stride;
            stride = size.min(chunk_size);
        }
    }
}

/// Purges and releases the pages in `[addr, addr + length)` to the OS.
/// Returns whether the pages are guaranteed to be full of zeroes when
/// the function returns.  `_force_zero` explicitly requests that
/// guarantee.
pub fn pages_purge(addr: *mut u8, length: usize, _force_zero: bool) -> bool {
    pages_decommit(addr, length);
    true
}

/// Removes `leadsize` bytes of slop before and everything after
/// `leadsize + size` from a fresh `alloc_size`-byte mapping, returning
/// the interior pointer.  On Windows mappings can only be released
/// whole, so the range is unmapped and remapped in place instead, which
/// can fail if another thread races for the address space.
pub fn pages_trim(
    addr: *mut u8,
    alloc_size: usize,
    leadsize: usize,
    size: usize,
) -> Option<NonNull<u8>> {
    assert!(alloc_size >= leadsize + size);
    let ret = (addr as usize + leadsize) as *mut u8;

    #[cfg(windows)]
    {
        pages_unmap(addr, alloc_size);
        match pages_map(ret, size) {
            Some(ptr) => {
                debug_assert_eq!(ptr.as_ptr(), ret);
                Some(ptr)
            }
            None => None,
        }
    }
    #[cfg(not(windows))]
    {
        let trailsize = alloc_size - leadsize - size;
        if leadsize != 0 {
            pages_unmap(addr, leadsize);
        }
        if trailsize != 0 {
            pages_unmap((ret as usize + size) as *mut u8, trailsize);
        }
        NonNull::new(ret)
    }
}

/// Lets the OS reclaim the physical pages backing the range without
/// changing the mapping; the contents become undefined and the pages
/// fault back in (zero-filled for MADV_DONTNEED, lazily for MADV_FREE).
#[cfg(not(windows))]
pub fn pages_madvise_free(addr: *mut u8, size: usize) {
    // Newer Linux kernels support MADV_FREE but reclaim so lazily that
    // RSS measurements become useless; stick to MADV_DONTNEED there.
    // Darwin gets MADV_FREE, paired with the hard-purge pass.
    #[cfg(target_os = "macos")]
    let advice = libc::MADV_FREE;
    #[cfg(not(target_os = "macos"))]
    let advice = libc::MADV_DONTNEED;

    let err = unsafe { libc::madvise(addr as *mut libc::c_void, size, advice) };
    if err != 0 {
        log::warn!(
            "madvise failure: addr={:p} size={:#x} {}",
            addr,
            size,
            errno::errno()
        );
    }
}

#[cfg(windows)]
pub fn pages_madvise_free(_addr: *mut u8, _size: usize) {
    unreachable!("dirty pages are decommitted, never madvised");
}

/// Copies `n` bytes between page-aligned, non-overlapping mappings.
/// Plain memcpy is competitive for the copy sizes the realloc path
/// produces, so no remapping tricks are attempted.
pub unsafe fn pages_copy(dest: *mut u8, src: *const u8, n: usize) {
    debug_assert_eq!(dest as usize & (real_page_size() - 1), 0);
    debug_assert_eq!(src as usize & (real_page_size() - 1), 0);
    std::ptr::copy_nonoverlapping(src, dest, n);
}

#[test]
fn test_page_size() {
    assert_ne!(real_page_size(), 0);
    assert!(real_page_size().is_power_of_two());
}

// Simulate a chunk allocation workflow: overallocate, trim the slop,
// decommit and recommit part of the remaining range.
#[test]
fn smoke_test() {
    let region_size = 1usize << 21;
    let page_size = real_page_size();

    let base = pages_map(std::ptr::null_mut(), 3 * region_size).expect("map should succeed");

    // Drop the bottom and top `region_size` bytes from the range.
    let mid = pages_trim(base.as_ptr(), 3 * region_size, region_size, region_size)
        .expect("trim should succeed");

    // Scribble on it, decommit a page, commit it back, scribble again.
    unsafe { std::ptr::write_bytes(mid.as_ptr(), 0xa5, region_size) };
    pages_decommit(mid.as_ptr(), page_size);
    assert!(pages_commit(mid.as_ptr(), page_size));
    // Committed-back pages read as zero.
    assert_eq!(unsafe { std::ptr::read(mid.as_ptr()) }, 0);
    unsafe { std::ptr::write_bytes(mid.as_ptr(), 0x5a, page_size) };

    pages_unmap(mid.as_ptr(), region_size);
}

#[test]
fn purge_zeroes() {
    let page_size = real_page_size();
    let ptr = pages_map(std::ptr::null_mut(), page_size).expect("map should succeed");

    unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0xff, page_size) };
    let zeroed = pages_purge(ptr.as_ptr(), page_size, true);
    assert!(zeroed);
    assert!(pages_commit(ptr.as_ptr(), page_size));
    assert_eq!(unsafe { std::ptr::read(ptr.as_ptr()) }, 0);

    pages_unmap(ptr.as_ptr(), page_size);
}
