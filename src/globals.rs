//! Runtime globals: everything derived from the allocator page size,
//! which is only known once the kernel page size has been queried and
//! the options string parsed.  Computed once, read everywhere.
use crate::constants::*;
use crate::map;
use crate::options::Options;

pub struct Globals {
    /// The allocator page size: the kernel page size, possibly doubled
    /// by `P` options, within [4 KiB, 64 KiB].
    pub page_size: usize,
    pub page_size_2pow: u32,
    pub page_size_mask: usize,

    /// Number of pages in a chunk.
    pub chunk_npages: usize,

    /// Number of pages taken by a chunk header plus its leading guard
    /// page.
    pub chunk_header_npages: usize,

    /// One chunk, minus the header, minus the trailing guard page.
    pub max_large_class: usize,

    /// Largest sub-page size class, or zero if there are none.
    pub max_sub_page_class: usize,

    /// Number of sub-page bins.
    pub num_sub_page_classes: usize,

    /// Number of all small-allocated classes.
    pub num_small_classes: usize,

    /// The largest size served from bins.
    pub max_bin_class: usize,

    pub opt: Options,
}

lazy_static::lazy_static! {
    static ref GLOBALS: Globals = Globals::init();
}

/// Returns the process-wide globals, initialising them on first use.
#[inline]
pub fn g() -> &'static Globals {
    &GLOBALS
}

impl Globals {
    fn init() -> Globals {
        let real_page_size = map::real_page_size();
        assert!(real_page_size.is_power_of_two());

        let opt = Options::from_env();

        let mut page_size = real_page_size << opt.page_size_shift.min(31);
        if page_size < MIN_PAGE_SIZE || page_size > MAX_PAGE_SIZE {
            // The shift went out of bounds; fall back to the largest
            // supported page size that the kernel page size divides.
            page_size = MAX_PAGE_SIZE.max(real_page_size);
        }
        assert_eq!(
            page_size % real_page_size,
            0,
            "allocator page size must be a multiple of the kernel's"
        );

        let page_size_2pow = page_size.trailing_zeros();
        let page_size_mask = page_size - 1;
        let chunk_npages = CHUNK_SIZE >> page_size_2pow;

        let header_bytes = core::mem::size_of::<crate::arena::ArenaChunk>();
        let chunk_header_npages =
            1 + (((header_bytes + page_size_mask) & !page_size_mask) >> page_size_2pow);

        let max_large_class =
            CHUNK_SIZE - page_size - (chunk_header_npages << page_size_2pow);

        let max_sub_page_class = if page_size / 2 >= MIN_SUBPAGE_CLASS {
            page_size / 2
        } else {
            0
        };
        let num_sub_page_classes = if max_sub_page_class != 0 {
            log2(max_sub_page_class) - log2(MIN_SUBPAGE_CLASS) + 1
        } else {
            0
        };
        let num_small_classes = NUM_TINY_CLASSES
            + NUM_QUANTUM_CLASSES
            + NUM_QUANTUM_WIDE_CLASSES
            + num_sub_page_classes;
        let max_bin_class = if max_sub_page_class != 0 {
            max_sub_page_class
        } else {
            MAX_QUANTUM_WIDE_CLASS
        };

        assert!(max_sub_page_class >= MIN_SUBPAGE_CLASS || max_sub_page_class == 0);
        assert!(max_large_class >= max_sub_page_class);
        assert!(max_large_class > max_bin_class);
        assert!(num_small_classes <= MAX_NUM_SMALL_CLASSES);
        assert!(chunk_npages <= MAX_PAGES_PER_CHUNK);
        assert!(
            NUM_QUANTUM_WIDE_CLASSES == 0
                || QUANTUM_WIDE <= MIN_SUBPAGE_CLASS - MAX_QUANTUM_CLASS
        );

        Globals {
            page_size,
            page_size_2pow,
            page_size_mask,
            chunk_npages,
            chunk_header_npages,
            max_large_class,
            max_sub_page_class,
            num_sub_page_classes,
            num_small_classes,
            max_bin_class,
            opt,
        }
    }

    /// Return the smallest pagesize multiple that is >= `s`.
    #[inline]
    pub fn page_ceiling(&self, s: usize) -> usize {
        (s + self.page_size_mask) & !self.page_size_mask
    }

    /// Return the smallest power of two that is >= `s` (sub-page class
    /// rounding).
    #[inline]
    pub fn subpage_ceiling(&self, s: usize) -> usize {
        s.next_power_of_two()
    }
}

/// Return the chunk address for allocation address `ptr`.
#[inline]
pub fn chunk_for_ptr(ptr: *const u8) -> *mut crate::arena::ArenaChunk {
    ((ptr as usize) & !CHUNK_SIZE_MASK) as *mut crate::arena::ArenaChunk
}

/// Return the chunk offset of address `ptr`.
#[inline]
pub fn chunk_offset_for_ptr(ptr: *const u8) -> usize {
    (ptr as usize) & CHUNK_SIZE_MASK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn globals_are_coherent() {
        let g = g();
        assert!(g.page_size.is_power_of_two());
        assert!(g.page_size >= MIN_PAGE_SIZE && g.page_size <= MAX_PAGE_SIZE);
        assert_eq!(g.chunk_npages << g.page_size_2pow, CHUNK_SIZE);
        assert_eq!(
            g.max_large_class,
            CHUNK_SIZE - g.page_size - (g.chunk_header_npages << g.page_size_2pow)
        );
        // The chunk header fits in its pages with the guard to spare.
        assert!(
            core::mem::size_of::<crate::arena::ArenaChunk>()
                <= (g.chunk_header_npages - 1) << g.page_size_2pow
        );
        assert_eq!(g.page_ceiling(1), g.page_size);
        assert_eq!(g.page_ceiling(g.page_size), g.page_size);
        assert_eq!(g.subpage_ceiling(3000), 4096);
    }

    #[test]
    fn chunk_addressing() {
        let addr = (5 * CHUNK_SIZE + 12345) as *const u8;
        assert_eq!(chunk_for_ptr(addr) as usize, 5 * CHUNK_SIZE);
        assert_eq!(chunk_offset_for_ptr(addr), 12345);
    }
}
