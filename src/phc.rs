//! The probabilistic heap checker: a small fraction of page-or-smaller
//! allocations gets diverted onto single-page slots surrounded by guard
//! pages.  Buffer overflows and underflows then fault in a guard page,
//! and use-after-free faults in the decommitted slot, instead of
//! silently corrupting neighbouring allocations.  Freed slots sit in
//! quarantine for a randomised delay before reuse so stale pointers
//! keep crashing for a while.
//!
//! Throughout this module time is measured in allocation events rather
//! than seconds: delays are decremented per allocation, and the shared
//! clock advances by the amount of thread-local delay consumed.
use std::cell::{Cell, UnsafeCell};
use std::ptr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crate::constants::CHUNK_SIZE;
use crate::fill::{apply_zero_or_junk, maybe_poison};
use crate::globals;
use crate::map;
use crate::mutex::Mutex;
use crate::random::{os_random_u64, XorShift128Plus};

/// Number of allocation slots.  Each sits between two guard pages, so
/// the region holds `2 * slots + 1` pages.
#[cfg(not(feature = "test_only_small_constants"))]
fn default_num_slots(page_size: usize) -> usize {
    if page_size == 4096 {
        256
    } else {
        64
    }
}

#[cfg(feature = "test_only_small_constants")]
fn default_num_slots(_page_size: usize) -> usize {
    16
}

// Average delays, in allocation events.  The first allocation delay is
// longer so that start-up allocations (often long-lived and already
// well-tested) don't exhaust the slots.
const AVG_FIRST_ALLOC_DELAY: u32 = 64 * 1024;
const AVG_ALLOC_DELAY: u32 = 16 * 1024;
const AVG_PAGE_REUSE_DELAY: u32 = 256;

/// How long a disabled thread waits before looking at the shared delay
/// again.
const DELAY_BACKOFF: u32 = 64;

const TIME_MAX: u64 = u64::MAX;

/// Truncate a random value to (1 ..= avg_delay * 2), averaging close to
/// `avg_delay`.  The average must be a power of two.
fn rnd_to_delay(avg_delay: u32, rnd: u64) -> u32 {
    debug_assert!(avg_delay.is_power_of_two());
    ((rnd & (avg_delay as u64 * 2 - 1)) + 1) as u32
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PhcState {
    /// Serve no new page allocations; frees of existing ones still
    /// work.  The default until the host enables the checker.
    OnlyFree,
    Enabled,
}

/// What an address means to the checker.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PtrKind {
    Nothing,
    GuardPage,
    AllocPage(usize),
}

/// A captured stack, when the `phc_stacks` feature is on.
#[derive(Clone, Default)]
pub struct StackTrace {
    pub pcs: Vec<usize>,
}

impl StackTrace {
    fn capture() -> StackTrace {
        #[cfg(feature = "phc_stacks")]
        {
            // The walker may allocate; the per-thread disable flag stops
            // the allocation from re-entering the checker.
            let _disabled = DisableOnCurrentThread::new();
            let mut pcs = Vec::with_capacity(24);
            backtrace::trace(|frame| {
                pcs.push(frame.ip() as usize);
                pcs.len() < 24
            });
            StackTrace { pcs }
        }
        #[cfg(not(feature = "phc_stacks"))]
        StackTrace { pcs: Vec::new() }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum SlotState {
    NeverAllocated,
    InUse,
    Freed,
}

struct Slot {
    state: SlotState,
    /// Arena the allocation nominally belongs to.  Meaningless within
    /// the checker (slots have no arenas), but a later realloc that
    /// outgrows the page must go to the right arena.
    arena_id: Option<u64>,
    /// Start of the allocation; not the page start unless the request
    /// was exactly a page.
    base_addr: *mut u8,
    alloc_stack: Option<StackTrace>,
    free_stack: Option<StackTrace>,
    /// When the slot leaves quarantine, against the shared clock; in
    /// use means `TIME_MAX`.
    reuse_time: u64,
}

impl Slot {
    const fn new() -> Slot {
        Slot {
            state: SlotState::NeverAllocated,
            arena_id: None,
            base_addr: ptr::null_mut(),
            alloc_stack: None,
            free_stack: None,
            reuse_time: 0,
        }
    }
}

struct PhcInner {
    slots: Vec<Slot>,
    rng: XorShift128Plus,
    /// Allocation-event clock.
    now: u64,
    in_use: usize,
}

/// One checker instance: a guarded slot region plus its bookkeeping.
/// The process has one global instance; tests build small private ones.
pub struct Phc {
    mtx: Mutex,
    inner: UnsafeCell<PhcInner>,
    pages_start: usize,
    pages_limit: usize,
    num_slots: usize,
}

unsafe impl Sync for Phc {}

impl Phc {
    /// Reserves and guards the slot region.  The backing pages come
    /// from the main allocator so the region is chunk-aligned, which
    /// keeps foreign pointer arithmetic from landing in checker memory;
    /// the allocator's own trailing guard page doubles as our last
    /// guard.
    pub fn new(num_slots: usize) -> Option<Phc> {
        let page_size = globals::g().page_size;
        let num_all_pages = num_slots * 2 + 1;
        let all_pages_size = num_all_pages * page_size;
        let jemalloc_size = all_pages_size - page_size;

        let pages = crate::alloc_api::memalign(CHUNK_SIZE, jemalloc_size);
        if pages.is_null() {
            return None;
        }

        // Make every page inaccessible; slots get committed one at a
        // time as they are handed out.
        map::pages_decommit(pages, jemalloc_size);

        let mut slots = Vec::with_capacity(num_slots);
        slots.resize_with(num_slots, Slot::new);

        Some(Phc {
            mtx: Mutex::new(),
            inner: UnsafeCell::new(PhcInner {
                slots,
                rng: XorShift128Plus::new(os_random_u64(), os_random_u64()),
                now: 0,
                in_use: 0,
            }),
            pages_start: pages as usize,
            pages_limit: pages as usize + all_pages_size,
            num_slots,
        })
    }

    fn page_size(&self) -> usize {
        globals::g().page_size
    }

    /// Classifies a pointer.  Even-indexed pages are guards, odd ones
    /// are slots.
    pub fn ptr_kind(&self, addr: *const u8) -> PtrKind {
        let addr = addr as usize;
        if addr < self.pages_start || addr >= self.pages_limit {
            return PtrKind::Nothing;
        }
        let page_index = (addr - self.pages_start) / self.page_size();
        if page_index & 1 == 1 {
            PtrKind::AllocPage(page_index / 2)
        } else {
            PtrKind::GuardPage
        }
    }

    /// Address of a slot's page.
    fn slot_page_ptr(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.num_slots);
        (self.pages_start + (2 * index + 1) * self.page_size()) as *mut u8
    }

    /// Attempts to divert an allocation onto a slot.  `size` and
    /// `alignment` must already have been screened for eligibility.
    pub fn page_alloc(
        &self,
        arena_id: Option<u64>,
        size: usize,
        alignment: usize,
        zero: bool,
    ) -> *mut u8 {
        let page_size = self.page_size();
        debug_assert!(size <= page_size && alignment <= page_size);

        let (index, base_addr) = {
            let _guard = self.mtx.lock();
            let inner = unsafe { &mut *self.inner.get() };

            // Pick a random starting slot and take the first one that
            // is neither in use nor still in quarantine; randomising
            // the start randomises reuse.
            let start = (inner.rng.next() % self.num_slots as u64) as usize;
            let mut found = None;
            for i in 0..self.num_slots {
                let index = (start + i) % self.num_slots;
                let slot = &inner.slots[index];
                let allocatable = match slot.state {
                    SlotState::InUse => false,
                    SlotState::NeverAllocated => true,
                    SlotState::Freed => inner.now >= slot.reuse_time,
                };
                if allocatable {
                    found = Some(index);
                    break;
                }
            }
            let index = match found {
                Some(index) => index,
                None => return ptr::null_mut(),
            };

            // Allocations sit at the end of the page so overflows hit
            // the following guard page immediately.
            let page = self.slot_page_ptr(index);
            let offset = (page_size - size) & !(alignment - 1);
            let base_addr = (page as usize + offset) as *mut u8;

            if !map::pages_commit(page, page_size) {
                return ptr::null_mut();
            }

            let slot = &mut inner.slots[index];
            debug_assert_ne!(slot.state, SlotState::InUse);
            slot.state = SlotState::InUse;
            slot.arena_id = arena_id;
            slot.base_addr = base_addr;
            slot.free_stack = None;
            slot.reuse_time = TIME_MAX;
            inner.in_use += 1;

            (index, base_addr)
        };

        // Stack capture may allocate, so it happens outside the lock;
        // the slot is already ours.
        let stack = StackTrace::capture();
        {
            let _guard = self.mtx.lock();
            let inner = unsafe { &mut *self.inner.get() };
            inner.slots[index].alloc_stack = Some(stack);
        }

        unsafe {
            if zero {
                ptr::write_bytes(base_addr, 0, size);
            } else {
                apply_zero_or_junk(base_addr, size);
            }
        }
        base_addr
    }

    /// Usable size of an in-use or freed slot allocation: from the
    /// pointer to the end of its page.
    pub fn usable_size(&self, index: usize) -> usize {
        let _guard = self.mtx.lock();
        let inner = unsafe { &*self.inner.get() };
        let slot = &inner.slots[index];
        debug_assert_ne!(slot.state, SlotState::NeverAllocated);
        self.page_size() - (slot.base_addr as usize & (self.page_size() - 1))
    }

    /// Whether the allocation at `index` is currently live and based at
    /// `ptr`; used to crash loudly on invalid frees.
    fn check_in_use(&self, ptr_in: *const u8, index: usize) {
        let _guard = self.mtx.lock();
        let inner = unsafe { &*self.inner.get() };
        let slot = &inner.slots[index];
        assert!(
            slot.state == SlotState::InUse,
            "invalid free or double-free of guarded allocation"
        );
        assert!(
            slot.base_addr as *const u8 == ptr_in,
            "free of an interior pointer of a guarded allocation"
        );
    }

    /// Frees a slot allocation: poison, decommit (so use-after-free
    /// faults), and quarantine for a randomised delay.
    pub fn page_free(&self, arena_id: Option<u64>, ptr_in: *mut u8, index: usize) {
        self.check_in_use(ptr_in, index);
        let stack = StackTrace::capture();

        let _guard = self.mtx.lock();
        let inner = unsafe { &mut *self.inner.get() };
        let page_size = self.page_size();

        let slot = &mut inner.slots[index];
        if arena_id.is_some() {
            assert_eq!(slot.arena_id, arena_id, "freeing through the wrong arena");
        }

        let usable = page_size - (slot.base_addr as usize & (page_size - 1));
        unsafe { maybe_poison(slot.base_addr, usable) };

        let page = self.slot_page_ptr(index);
        map::pages_decommit(page, page_size);

        let reuse_delay = rnd_to_delay(AVG_PAGE_REUSE_DELAY, inner.rng.next());
        let slot = &mut inner.slots[index];
        slot.state = SlotState::Freed;
        slot.free_stack = Some(stack);
        slot.reuse_time = inner.now + reuse_delay as u64;
        inner.in_use -= 1;
    }

    /// The arena id recorded at allocation time, for reallocations that
    /// must leave the checker.
    pub fn slot_arena_id(&self, index: usize) -> Option<u64> {
        let _guard = self.mtx.lock();
        let inner = unsafe { &*self.inner.get() };
        inner.slots[index].arena_id
    }

    fn advance_now(&self, delta: u64) {
        let _guard = self.mtx.lock();
        let inner = unsafe { &mut *self.inner.get() };
        inner.now += delta;
    }

    fn next_delay(&self, first: bool) -> u32 {
        let _guard = self.mtx.lock();
        let inner = unsafe { &mut *self.inner.get() };
        let avg = if first {
            AVG_FIRST_ALLOC_DELAY
        } else {
            AVG_ALLOC_DELAY
        };
        rnd_to_delay(avg, inner.rng.next())
    }

    #[cfg(test)]
    fn in_use(&self) -> usize {
        let _guard = self.mtx.lock();
        unsafe { (*self.inner.get()).in_use }
    }
}

// Global instance and the fast-path machinery in front of it.

static STATE: AtomicU8 = AtomicU8::new(0); // 0 = OnlyFree, 1 = Enabled
static PAGES_START: AtomicUsize = AtomicUsize::new(0);
static PAGES_LIMIT: AtomicUsize = AtomicUsize::new(0);

lazy_static::lazy_static! {
    static ref PHC: Option<Phc> = {
        let phc = Phc::new(default_num_slots(globals::g().page_size));
        if let Some(ref phc) = phc {
            PAGES_START.store(phc.pages_start, Ordering::Release);
            PAGES_LIMIT.store(phc.pages_limit, Ordering::Release);
        }
        phc
    };
}

thread_local! {
    // Re-entry and stack-walk guard.
    static TLS_DISABLED: Cell<bool> = Cell::new(false);
    // Allocations remaining until this thread consults the checker.
    static TLS_ALLOC_DELAY: Cell<u32> = Cell::new(0);
    static TLS_LAST_DELAY: Cell<u32> = Cell::new(0);
    static TLS_EVER_ALLOCATED: Cell<bool> = Cell::new(false);
}

/// Enables or disables diversion of new allocations.  Frees always
/// work.  Enabling forces the slot region into existence.
pub fn set_state(state: PhcState) {
    if state == PhcState::Enabled && PHC.is_none() {
        // Region allocation failed; stay in OnlyFree.
        return;
    }
    STATE.store(
        match state {
            PhcState::OnlyFree => 0,
            PhcState::Enabled => 1,
        },
        Ordering::Release,
    );
}

pub fn state() -> PhcState {
    if STATE.load(Ordering::Acquire) == 1 {
        PhcState::Enabled
    } else {
        PhcState::OnlyFree
    }
}

/// RAII disable of the checker on the current thread, used around
/// anything that may both allocate and already hold checker state
/// (stack walking in particular).
pub struct DisableOnCurrentThread {
    was_disabled: bool,
}

impl DisableOnCurrentThread {
    pub fn new() -> DisableOnCurrentThread {
        let was_disabled = TLS_DISABLED.with(|cell| cell.replace(true));
        DisableOnCurrentThread { was_disabled }
    }
}

impl Drop for DisableOnCurrentThread {
    fn drop(&mut self) {
        TLS_DISABLED.with(|cell| cell.set(self.was_disabled));
    }
}

pub fn disable_on_current_thread() {
    TLS_DISABLED.with(|cell| cell.set(true));
}

pub fn reenable_on_current_thread() {
    TLS_DISABLED.with(|cell| cell.set(false));
}

/// The fast inline check on the malloc path: counts down the thread's
/// allocation delay and, when it trips, asks the checker for a page.
/// Returns null when the allocation should proceed normally.
pub fn maybe_page_alloc(
    arena_id: Option<u64>,
    size: usize,
    alignment: usize,
    zero: bool,
) -> *mut u8 {
    if state() != PhcState::Enabled {
        return ptr::null_mut();
    }
    let page_size = globals::g().page_size;
    if size > page_size || alignment > page_size || !alignment.is_power_of_two() {
        return ptr::null_mut();
    }

    let delay = TLS_ALLOC_DELAY.with(|cell| cell.get());
    if delay > 1 {
        TLS_ALLOC_DELAY.with(|cell| cell.set(delay - 1));
        return ptr::null_mut();
    }

    if TLS_DISABLED.with(|cell| cell.get()) {
        // Don't touch the checker from this thread for a while.
        TLS_ALLOC_DELAY.with(|cell| cell.set(DELAY_BACKOFF));
        return ptr::null_mut();
    }

    let phc = match PHC.as_ref() {
        Some(phc) => phc,
        None => return ptr::null_mut(),
    };

    // The consumed delay advances the shared clock, which is what ages
    // quarantined slots.
    phc.advance_now(TLS_LAST_DELAY.with(|cell| cell.get()) as u64);

    let first = !TLS_EVER_ALLOCATED.with(|cell| cell.replace(true));
    let next = phc.next_delay(first);
    TLS_ALLOC_DELAY.with(|cell| cell.set(next));
    TLS_LAST_DELAY.with(|cell| cell.set(next));

    phc.page_alloc(arena_id, size, alignment, zero)
}

/// The tight range test run on every free: does the checker own this
/// address?
#[inline]
pub fn is_phc_ptr(ptr_in: *const u8) -> bool {
    let addr = ptr_in as usize;
    let start = PAGES_START.load(Ordering::Acquire);
    start != 0 && addr >= start && addr < PAGES_LIMIT.load(Ordering::Acquire)
}

/// Routes a free of a checker-owned pointer.  Crashes on guard-page
/// addresses and invalid slot frees.
pub fn page_free(arena_id: Option<u64>, ptr_in: *mut u8) {
    let phc = PHC.as_ref().expect("a phc pointer implies the region exists");
    match phc.ptr_kind(ptr_in) {
        PtrKind::Nothing => unreachable!("not a phc pointer"),
        PtrKind::GuardPage => panic!("free of a guard page address"),
        PtrKind::AllocPage(index) => phc.page_free(arena_id, ptr_in, index),
    }
}

/// Usable size for a checker-owned pointer.
pub fn usable_size(ptr_in: *const u8) -> usize {
    let phc = PHC.as_ref().expect("a phc pointer implies the region exists");
    match phc.ptr_kind(ptr_in) {
        PtrKind::AllocPage(index) => phc.usable_size(index),
        _ => 0,
    }
}

/// Arena recorded for a checker-owned allocation.
pub fn ptr_arena_id(ptr_in: *const u8) -> Option<u64> {
    let phc = PHC.as_ref()?;
    match phc.ptr_kind(ptr_in) {
        PtrKind::AllocPage(index) => phc.slot_arena_id(index),
        _ => None,
    }
}

/// For `ptr_info`: (live, base, usable, arena id) of the slot holding
/// `ptr`, or None for guard pages and untouched slots.
pub fn ptr_page_state(ptr_in: *const u8) -> Option<(bool, *mut u8, usize, Option<u64>)> {
    let phc = PHC.as_ref()?;
    let index = match phc.ptr_kind(ptr_in) {
        PtrKind::AllocPage(index) => index,
        _ => return None,
    };
    let _guard = phc.mtx.lock();
    let inner = unsafe { &*phc.inner.get() };
    let slot = &inner.slots[index];
    match slot.state {
        SlotState::NeverAllocated => None,
        state => {
            let usable =
                phc.page_size() - (slot.base_addr as usize & (phc.page_size() - 1));
            Some((
                state == SlotState::InUse,
                slot.base_addr,
                usable,
                slot.arena_id,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_phc() -> Phc {
        Phc::new(8).expect("slot region should map")
    }

    #[test]
    fn ptr_kind_classification() {
        let phc = test_phc();
        let page_size = globals::g().page_size;

        assert_eq!(phc.ptr_kind(ptr::null()), PtrKind::Nothing);
        assert_eq!(
            phc.ptr_kind((phc.pages_start - 1) as *const u8),
            PtrKind::Nothing
        );
        // Page 0 is a guard, page 1 the first slot.
        assert_eq!(
            phc.ptr_kind(phc.pages_start as *const u8),
            PtrKind::GuardPage
        );
        assert_eq!(
            phc.ptr_kind((phc.pages_start + page_size) as *const u8),
            PtrKind::AllocPage(0)
        );
        assert_eq!(
            phc.ptr_kind((phc.pages_start + 2 * page_size) as *const u8),
            PtrKind::GuardPage
        );
        assert_eq!(
            phc.ptr_kind((phc.pages_limit - 1) as *const u8),
            PtrKind::GuardPage
        );
    }

    #[test]
    fn alloc_lands_at_page_end_between_guards() {
        let phc = test_phc();
        let page_size = globals::g().page_size;

        let ptr = phc.page_alloc(None, 48, 1, false);
        assert!(!ptr.is_null());
        let index = match phc.ptr_kind(ptr) {
            PtrKind::AllocPage(index) => index,
            kind => panic!("unexpected kind {:?}", kind),
        };
        // The allocation abuts the end of its page so overflow faults.
        assert_eq!((ptr as usize & (page_size - 1)) + 48, page_size);
        assert_eq!(phc.usable_size(index), 48);

        // The memory is writable.
        unsafe { ptr::write_bytes(ptr, 0xaa, 48) };

        phc.page_free(None, ptr, index);
        assert_eq!(phc.in_use(), 0);
    }

    #[test]
    fn aligned_alloc_respects_alignment() {
        let phc = test_phc();
        for alignment in [1usize, 2, 8, 64, 512] {
            let ptr = phc.page_alloc(None, 100, alignment, false);
            assert!(!ptr.is_null());
            assert_eq!(ptr as usize % alignment, 0);
            // Alignment can only round the base down, never below a
            // hundred usable bytes.
            let index = match phc.ptr_kind(ptr) {
                PtrKind::AllocPage(index) => index,
                kind => panic!("unexpected kind {:?}", kind),
            };
            assert!(phc.usable_size(index) >= 100);
            phc.page_free(None, ptr, index);
        }
    }

    #[test]
    fn zeroed_allocations_are_zero() {
        let phc = test_phc();
        let ptr = phc.page_alloc(None, 256, 1, true);
        assert!(!ptr.is_null());
        for i in 0..256 {
            assert_eq!(unsafe { ptr::read(ptr.add(i)) }, 0);
        }
        let index = match phc.ptr_kind(ptr) {
            PtrKind::AllocPage(index) => index,
            _ => unreachable!(),
        };
        phc.page_free(None, ptr, index);
    }

    #[test]
    fn quarantine_delays_reuse() {
        let phc = test_phc();

        // Fill every slot, then free them all: nothing is allocatable
        // until the clock advances past the reuse delay.
        let mut live = Vec::new();
        for _ in 0..8 {
            let ptr = phc.page_alloc(None, 16, 1, false);
            assert!(!ptr.is_null());
            live.push(ptr);
        }
        assert!(phc.page_alloc(None, 16, 1, false).is_null());

        for ptr in live {
            let index = match phc.ptr_kind(ptr) {
                PtrKind::AllocPage(index) => index,
                _ => unreachable!(),
            };
            phc.page_free(None, ptr, index);
        }
        assert!(
            phc.page_alloc(None, 16, 1, false).is_null(),
            "freed slots must stay quarantined"
        );

        // Advancing the clock far enough releases the quarantine.
        phc.advance_now(2 * AVG_PAGE_REUSE_DELAY as u64 + 2);
        let ptr = phc.page_alloc(None, 16, 1, false);
        assert!(!ptr.is_null());
        let index = match phc.ptr_kind(ptr) {
            PtrKind::AllocPage(index) => index,
            _ => unreachable!(),
        };
        phc.page_free(None, ptr, index);
    }

    #[test]
    #[should_panic(expected = "double-free")]
    fn double_free_crashes() {
        let phc = test_phc();
        let ptr = phc.page_alloc(None, 32, 1, false);
        let index = match phc.ptr_kind(ptr) {
            PtrKind::AllocPage(index) => index,
            _ => unreachable!(),
        };
        phc.page_free(None, ptr, index);
        phc.page_free(None, ptr, index);
    }

    #[test]
    fn arena_id_is_checked_and_recorded() {
        let phc = test_phc();
        let ptr = phc.page_alloc(Some(42), 32, 1, false);
        let index = match phc.ptr_kind(ptr) {
            PtrKind::AllocPage(index) => index,
            _ => unreachable!(),
        };
        assert_eq!(phc.slot_arena_id(index), Some(42));
        phc.page_free(Some(42), ptr, index);
    }

    #[test]
    fn disable_flag_nests() {
        assert!(!TLS_DISABLED.with(|cell| cell.get()));
        {
            let _outer = DisableOnCurrentThread::new();
            assert!(TLS_DISABLED.with(|cell| cell.get()));
            {
                let _inner = DisableOnCurrentThread::new();
                assert!(TLS_DISABLED.with(|cell| cell.get()));
            }
            assert!(TLS_DISABLED.with(|cell| cell.get()));
        }
        assert!(!TLS_DISABLED.with(|cell| cell.get()));
    }
}
