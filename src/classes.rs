//! Size classification: maps a requested byte count to the canonical
//! class it is served from, and provides the fast-divisor used to turn
//! a region offset back into a region index without dividing.
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

use crate::constants::*;
use crate::globals;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClassType {
    Tiny,
    Quantum,
    QuantumWide,
    SubPage,
    Large,
}

/// A size class an in-arena allocation is rounded up to.  Huge requests
/// never construct one of these; route them before classifying.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeClass {
    ty: ClassType,
    size: usize,
}

impl SizeClass {
    #[requires(size <= globals::g().max_large_class,
               "huge requests have no size class")]
    #[ensures(ret.size() >= size, "classes cover the request")]
    pub fn new(size: usize) -> SizeClass {
        let g = globals::g();
        if size <= MAX_TINY_CLASS {
            SizeClass {
                ty: ClassType::Tiny,
                size: size.next_power_of_two().max(MIN_TINY_CLASS),
            }
        } else if size <= MAX_QUANTUM_CLASS {
            SizeClass {
                ty: ClassType::Quantum,
                size: quantum_ceiling(size),
            }
        } else if size <= MAX_QUANTUM_WIDE_CLASS {
            SizeClass {
                ty: ClassType::QuantumWide,
                size: quantum_wide_ceiling(size),
            }
        } else if size <= g.max_sub_page_class {
            SizeClass {
                ty: ClassType::SubPage,
                size: g.subpage_ceiling(size),
            }
        } else if size <= g.max_large_class {
            SizeClass {
                ty: ClassType::Large,
                size: g.page_ceiling(size),
            }
        } else {
            panic!("invalid size class request: {}", size);
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn ty(&self) -> ClassType {
        self.ty
    }

    pub fn next(&self) -> SizeClass {
        SizeClass::new(self.size + 1)
    }

    /// Index of the bin serving this class.  Bit-log and table
    /// arithmetic only; the layout is tiny classes, then quantum, then
    /// quantum-wide, then sub-page.
    pub fn bin_index(&self) -> usize {
        match self.ty {
            ClassType::Tiny => log2(self.size / MIN_TINY_CLASS),
            ClassType::Quantum => {
                NUM_TINY_CLASSES + (self.size / QUANTUM) - (MIN_QUANTUM_CLASS / QUANTUM)
            }
            ClassType::QuantumWide => {
                NUM_TINY_CLASSES + NUM_QUANTUM_CLASSES + (self.size / QUANTUM_WIDE)
                    - (MIN_QUANTUM_WIDE_CLASS / QUANTUM_WIDE)
            }
            ClassType::SubPage => {
                NUM_TINY_CLASSES
                    + NUM_QUANTUM_CLASSES
                    + NUM_QUANTUM_WIDE_CLASSES
                    + (log2(self.size) - log2(MIN_SUBPAGE_CLASS))
            }
            ClassType::Large => panic!("large allocations are not served from bins"),
        }
    }
}

// Fast division
//
// During deallocation we want to divide by the size class.  To divide by
// a number D that is not a power of two we multiply by (2^17 / D) and
// then right shift by 17 positions:  X / D  becomes  (X * m) >> p, with
// m computed as formula 26 from Section 10-9 "Unsigned Division by
// Divisors >= 1" in Henry S. Warren, Jr.'s Hacker's Delight, 2nd Ed.
#[derive(Clone, Copy, Default)]
pub struct FastDivisor {
    // The shift amount is chosen to minimise the size of m while working
    // for divisors up to 65536 in steps of 16, so the inverted divisor
    // fits in 16 bits.
    m: u16,
}

impl FastDivisor {
    const P: u32 = 17;

    pub fn new(div: u32, max: u32) -> FastDivisor {
        assert!(div <= max);
        assert!((1u32 << Self::P) >= div);

        let m = ((1u32 << Self::P) + div - 1 - (((1u32 << Self::P) - 1) % div)) / div;

        // Make sure that max * m does not overflow.
        assert!(max < u32::MAX / m);
        assert!(m <= u16::MAX as u32);
        let divisor = FastDivisor { m: m as u16 };

        // Test that all the divisions in the range we expect would work.
        #[cfg(debug_assertions)]
        {
            let mut num = 0;
            while num < max {
                assert_eq!(num / div, divisor.divide(num));
                num += div;
            }
        }

        divisor
    }

    /// The multiplication happens in u32 regardless of m's width: m is
    /// zero-extended first, and u32 is the cheapest multiplication.
    #[inline]
    pub fn divide(&self, num: u32) -> u32 {
        debug_assert!(self.m != 0);
        (num * self.m as u32) >> Self::P
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn rounding_table() {
        // Spot checks for every class type, assuming a 4 KiB page.
        assert_eq!(SizeClass::new(1).size(), MIN_TINY_CLASS.max(1));
        assert_eq!(SizeClass::new(8).size(), 8usize.max(MIN_TINY_CLASS));
        assert_eq!(SizeClass::new(9).size(), 16);
        assert_eq!(SizeClass::new(16).size(), 16);
        assert_eq!(SizeClass::new(17).size(), 32);
        assert_eq!(SizeClass::new(96).size(), 96);
        assert_eq!(SizeClass::new(496).size(), 496);
        assert_eq!(SizeClass::new(497).size(), 512);
        assert_eq!(SizeClass::new(513).size(), 768);
        assert_eq!(SizeClass::new(3840).size(), 3840);
        let g = globals::g();
        if g.max_sub_page_class == 0 {
            assert_eq!(SizeClass::new(3841).ty(), ClassType::Large);
            assert_eq!(SizeClass::new(3841).size(), g.page_size);
        }
        assert_eq!(SizeClass::new(g.page_size + 1).size(), 2 * g.page_size);
        assert_eq!(SizeClass::new(g.max_large_class).size(), g.max_large_class);
    }

    #[test]
    fn rounding_is_idempotent() {
        let g = globals::g();
        let mut class = SizeClass::new(1);
        loop {
            assert_eq!(SizeClass::new(class.size()).size(), class.size());
            assert_eq!(SizeClass::new(class.size()), class);
            if class.size() >= g.max_large_class {
                break;
            }
            class = class.next();
        }
    }

    #[test]
    fn bin_indices_are_dense() {
        let g = globals::g();
        let mut class = SizeClass::new(1);
        let mut expected = 0;
        while class.size() <= g.max_bin_class {
            assert_eq!(class.bin_index(), expected, "class {}", class.size());
            expected += 1;
            class = class.next();
        }
        assert_eq!(expected, g.num_small_classes);
    }

    #[test]
    fn boundary_between_small_and_large() {
        let g = globals::g();
        assert_ne!(SizeClass::new(g.max_bin_class).ty(), ClassType::Large);
        assert_eq!(SizeClass::new(g.max_bin_class + 1).ty(), ClassType::Large);
    }

    #[test]
    fn fast_divisor_exhaustive_for_bin_shapes() {
        // Every divisor a bin can configure: quantum multiples up to the
        // largest bin class, against the largest possible run.
        let g = globals::g();
        let mut div = QUANTUM;
        while div <= g.max_bin_class {
            let max = (g.max_large_class).min(128 * 1024) as u32;
            let divisor = FastDivisor::new(div as u32, max);
            let mut num = 0u32;
            while num < max {
                assert_eq!(num / div as u32, divisor.divide(num));
                num += div as u32;
            }
            div += QUANTUM;
        }
    }

    proptest! {
        #[test]
        fn class_always_covers_request(size in 1usize..=128 * 1024) {
            let g = globals::g();
            prop_assume!(size <= g.max_large_class);
            let class = SizeClass::new(size);
            prop_assert!(class.size() >= size);
            // No class skips past another boundary.
            prop_assert!(class.size() <= g.page_ceiling(size).max(MIN_TINY_CLASS));
        }
    }
}
