//! Compile-time constants that don't depend on the runtime page size.
//! Anything derived from the page size lives in `globals` instead.

/// Log2 of a power-of-two constant, for use in constant expressions.
pub const fn log2(x: usize) -> usize {
    assert!(x.is_power_of_two(), "log2 of a non-power-of-two");
    x.trailing_zeros() as usize
}

// Our size classes are inclusive ranges of memory sizes.  By describing
// the minimums and how memory is allocated in each range the maximums can
// be calculated.

/// Smallest size class to support.  On Windows the smallest allocation
/// must be two pointers wide; elsewhere even `malloc(1)` must reserve a
/// word's worth of memory.
pub const MIN_TINY_CLASS: usize = if cfg!(windows) {
    2 * core::mem::size_of::<usize>()
} else {
    core::mem::size_of::<usize>()
};

/// Maximum tiny size class.
pub const MAX_TINY_CLASS: usize = 8;

/// Smallest quantum-spaced size class; tiny classes are powers of two, so
/// this is twice the largest of them.
pub const MIN_QUANTUM_CLASS: usize = MAX_TINY_CLASS * 2;
pub const MIN_QUANTUM_WIDE_CLASS: usize = 512;
pub const MIN_SUBPAGE_CLASS: usize = 4096;

/// Spacing of the quantum and quantum-wide ranges.
pub const QUANTUM: usize = 16;
pub const QUANTUM_MASK: usize = QUANTUM - 1;
pub const QUANTUM_WIDE: usize = 256;
pub const QUANTUM_WIDE_MASK: usize = QUANTUM_WIDE - 1;

pub const MAX_QUANTUM_CLASS: usize = MIN_QUANTUM_WIDE_CLASS - QUANTUM;
pub const MAX_QUANTUM_WIDE_CLASS: usize = MIN_SUBPAGE_CLASS - QUANTUM_WIDE;

/// Number of (2^n)-spaced tiny classes.  The range is empty on targets
/// whose minimum allocation already exceeds the largest tiny class.
pub const NUM_TINY_CLASSES: usize = if MIN_TINY_CLASS <= MAX_TINY_CLASS {
    log2(MAX_TINY_CLASS) - log2(MIN_TINY_CLASS) + 1
} else {
    0
};

/// Number of quantum- and quantum-wide-spaced classes.  The spacing is
/// added before subtracting so an empty range doesn't underflow.
pub const NUM_QUANTUM_CLASSES: usize =
    (MAX_QUANTUM_CLASS + QUANTUM - MIN_QUANTUM_CLASS) / QUANTUM;
pub const NUM_QUANTUM_WIDE_CLASSES: usize =
    (MAX_QUANTUM_WIDE_CLASS + QUANTUM_WIDE - MIN_QUANTUM_WIDE_CLASS) / QUANTUM_WIDE;

/// Size and alignment of the chunks we request from the OS's virtual
/// memory system.
pub const CHUNK_SIZE: usize = 1 << 20;
pub const CHUNK_SIZE_MASK: usize = CHUNK_SIZE - 1;

/// Maximum size of an L1 cache line.  Over-estimates are okay (up to a
/// point); under-estimates cause false sharing.
pub const CACHELINE_SIZE: usize =
    if cfg!(all(target_os = "macos", target_arch = "aarch64")) {
        128
    } else {
        64
    };

/// Recycle at most this much chunk address space.  128 MiB keeps at most
/// 6.25% of a 32-bit address space around for later use.
#[cfg(not(feature = "test_only_small_constants"))]
pub const RECYCLE_LIMIT: usize = 128 << 20;
#[cfg(feature = "test_only_small_constants")]
pub const RECYCLE_LIMIT: usize = 8 << 20;

/// Default maximum number of dirty pages per arena; individual arenas
/// default to an eighth of this, the main arena uses it whole.
pub const DIRTY_MAX_DEFAULT: usize = 1 << 8;

/// Fill values.  Junk marks fresh allocations when junk filling is on,
/// poison overwrites freed memory.
pub const ALLOC_JUNK: u8 = 0xe4;
pub const ALLOC_POISON: u8 = 0xe5;

/// Default poison length; larger than a cache line and a multiple of it.
pub const POISON_SIZE_DEFAULT: usize = 256;

/// Whether unused dirty pages are decommitted rather than madvised away.
/// VirtualAlloc-style commit charging makes decommit mandatory there.
pub const MALLOC_DECOMMIT: bool = cfg!(windows);

/// Whether the OS purges madvised pages lazily, requiring the explicit
/// double-purge pass (`Arena::hard_purge`) to make RSS trustworthy.
pub const MALLOC_DOUBLE_PURGE: bool = cfg!(target_os = "macos");

/// An upper bound on pages per chunk, reached with the smallest supported
/// page size.  The chunk header's page map is dimensioned with this; when
/// the runtime page size is larger only a prefix of the map is used.
pub const MIN_PAGE_SIZE: usize = 4096;
pub const MAX_PAGE_SIZE: usize = 65536;
pub const MAX_PAGES_PER_CHUNK: usize = CHUNK_SIZE / MIN_PAGE_SIZE;

/// Upper bound on the number of sub-page classes, reached with the
/// largest supported page size (4 KiB .. 32 KiB powers of two).
pub const MAX_NUM_SUBPAGE_CLASSES: usize =
    log2(MAX_PAGE_SIZE / 2) - log2(MIN_SUBPAGE_CLASS) + 1;

/// Upper bound on the number of small size classes; arenas dimension
/// their bin arrays with this and use a runtime-sized prefix.
pub const MAX_NUM_SMALL_CLASSES: usize = NUM_TINY_CLASSES
    + NUM_QUANTUM_CLASSES
    + NUM_QUANTUM_WIDE_CLASSES
    + MAX_NUM_SUBPAGE_CLASSES;

/// Return the smallest chunk multiple that is >= `s`.
pub const fn chunk_ceiling(s: usize) -> usize {
    (s + CHUNK_SIZE_MASK) & !CHUNK_SIZE_MASK
}

/// Return the smallest cacheline multiple that is >= `s`.
pub const fn cacheline_ceiling(s: usize) -> usize {
    (s + (CACHELINE_SIZE - 1)) & !(CACHELINE_SIZE - 1)
}

/// Return the smallest quantum multiple that is >= `s`.
pub const fn quantum_ceiling(s: usize) -> usize {
    (s + QUANTUM_MASK) & !QUANTUM_MASK
}

pub const fn quantum_wide_ceiling(s: usize) -> usize {
    (s + QUANTUM_WIDE_MASK) & !QUANTUM_WIDE_MASK
}

/// Return the offset between `a` and the nearest aligned address at or
/// below `a`.
pub fn alignment_addr2offset(a: usize, alignment: usize) -> usize {
    a & (alignment - 1)
}

/// Return the smallest `alignment` multiple that is >= `s`.  Wraps on
/// overflow; callers detect that as the result comparing below `s`.
pub fn alignment_ceiling(s: usize, alignment: usize) -> usize {
    s.wrapping_add(alignment - 1) & !(alignment - 1)
}

static_assertions::const_assert!(QUANTUM.is_power_of_two());
static_assertions::const_assert!(QUANTUM_WIDE.is_power_of_two());
static_assertions::const_assert!(MIN_SUBPAGE_CLASS.is_power_of_two());
static_assertions::const_assert!(MAX_QUANTUM_CLASS % QUANTUM == 0);
static_assertions::const_assert!(MAX_QUANTUM_WIDE_CLASS % QUANTUM_WIDE == 0);
static_assertions::const_assert!(QUANTUM < QUANTUM_WIDE);
static_assertions::const_assert!(QUANTUM >= core::mem::size_of::<usize>());
static_assertions::const_assert!(QUANTUM_WIDE <= MAX_QUANTUM_CLASS);
static_assertions::const_assert!(CHUNK_SIZE >= MIN_PAGE_SIZE);
static_assertions::const_assert!(QUANTUM * 4 <= CHUNK_SIZE);
static_assertions::const_assert!(POISON_SIZE_DEFAULT >= CACHELINE_SIZE);
static_assertions::const_assert!(POISON_SIZE_DEFAULT % CACHELINE_SIZE == 0);

#[test]
fn class_ranges_line_up() {
    // The quantum range starts right after the tiny range and ends right
    // before the quantum-wide range, which ends right before sub-page.
    assert_eq!(MIN_QUANTUM_CLASS, 16);
    assert_eq!(MAX_QUANTUM_CLASS, 496);
    assert_eq!(MIN_QUANTUM_WIDE_CLASS, 512);
    assert_eq!(MAX_QUANTUM_WIDE_CLASS, 3840);
    assert_eq!(NUM_QUANTUM_CLASSES, 31);
    assert_eq!(NUM_QUANTUM_WIDE_CLASSES, 14);
    assert_eq!(chunk_ceiling(1), CHUNK_SIZE);
    assert_eq!(chunk_ceiling(CHUNK_SIZE), CHUNK_SIZE);
    assert_eq!(chunk_ceiling(CHUNK_SIZE + 1), 2 * CHUNK_SIZE);
}
