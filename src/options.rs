//! Parser for the process-wide options string (conventionally taken from
//! the `QUARRY_OPTIONS` environment variable).  Options are single
//! letters, optionally preceded by a decimal repeat/argument prefix:
//!
//! | letter  | effect                                               |
//! |---------|------------------------------------------------------|
//! | `f`/`F` | halve / double the dirty-page maximum (N times)      |
//! | `j`/`J` | junk fill off / on                                   |
//! | `q`     | poison freed memory: off                             |
//! | `Q`     | poison some (N cache lines); `QQ` poisons everything |
//! | `z`/`Z` | zero fill off / on                                   |
//! | `P`     | multiply the allocator page size by 2^N              |
//! | `r`/`R` | randomised region selection in bins off / on         |

use crate::constants::{
    CACHELINE_SIZE, DIRTY_MAX_DEFAULT, POISON_SIZE_DEFAULT,
};

const USIZE_BITS: usize = core::mem::size_of::<usize>() * 8;

/// How much of a freed allocation gets overwritten with the poison byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoisonType {
    None,
    Some,
    All,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Options {
    pub junk: bool,
    pub zero: bool,
    pub poison: PoisonType,
    pub poison_size: usize,
    pub dirty_max: usize,
    pub randomize_small: bool,
    /// Number of doublings to apply to the allocator page size.
    pub page_size_shift: u32,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            junk: false,
            zero: false,
            poison: PoisonType::Some,
            poison_size: POISON_SIZE_DEFAULT,
            dirty_max: DIRTY_MAX_DEFAULT,
            randomize_small: true,
            page_size_shift: 0,
        }
    }
}

impl Options {
    /// Parses an options string on top of the defaults.  Unknown letters
    /// are reported and skipped rather than failing the whole string; the
    /// allocator must come up even with a garbled environment.
    pub fn parse(opts: &str) -> Options {
        let mut options = Options::default();
        let mut chars = opts.chars().peekable();

        while let Some(&c) = chars.peek() {
            // All options are single letters, some take a *prefix*
            // numeric argument.
            let mut prefix_arg: usize = 0;
            let mut c = c;
            while c.is_ascii_digit() {
                prefix_arg = prefix_arg
                    .saturating_mul(10)
                    .saturating_add((c as u8 - b'0') as usize);
                chars.next();
                match chars.peek() {
                    Some(&next) => c = next,
                    None => return options,
                }
            }
            chars.next();

            match c {
                'f' => {
                    let arg = if prefix_arg != 0 { prefix_arg } else { 1 };
                    options.dirty_max = if arg >= USIZE_BITS {
                        0
                    } else {
                        options.dirty_max >> arg
                    };
                }
                'F' => {
                    let mut arg = if prefix_arg != 0 { prefix_arg } else { 1 };
                    if options.dirty_max == 0 {
                        options.dirty_max = 1;
                        arg -= 1;
                    }
                    options.dirty_max = if arg >= USIZE_BITS {
                        0
                    } else {
                        options.dirty_max << arg
                    };
                    if options.dirty_max == 0 {
                        // The shift pushed every bit out; clamp to the
                        // largest power of two that fits instead.
                        options.dirty_max = 1 << (USIZE_BITS - 1);
                    }
                }
                'j' => options.junk = false,
                'J' => options.junk = true,
                'q' => options.poison = PoisonType::None,
                'Q' => {
                    if chars.peek() == Some(&'Q') {
                        chars.next();
                        options.poison = PoisonType::All;
                    } else {
                        options.poison = PoisonType::Some;
                        if prefix_arg != 0 {
                            options.poison_size = CACHELINE_SIZE * prefix_arg;
                        }
                    }
                }
                'z' => options.zero = false,
                'Z' => options.zero = true,
                'P' => {
                    let arg = if prefix_arg != 0 { prefix_arg } else { 1 };
                    options.page_size_shift =
                        options.page_size_shift.saturating_add(arg.min(31) as u32);
                }
                'r' => options.randomize_small = false,
                'R' => options.randomize_small = true,
                _ => {
                    log::warn!("unsupported character in allocator options: {:?}", c);
                }
            }
        }

        options
    }

    /// Parses the conventional environment variable, if set.
    pub fn from_env() -> Options {
        match std::env::var("QUARRY_OPTIONS") {
            Ok(val) => Options::parse(&val),
            Err(_) => Options::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = Options::parse("");
        assert_eq!(options, Options::default());
        assert!(!options.junk);
        assert!(!options.zero);
        assert_eq!(options.poison, PoisonType::Some);
        assert_eq!(options.dirty_max, DIRTY_MAX_DEFAULT);
        assert!(options.randomize_small);
    }

    #[test]
    fn dirty_max_halving_and_doubling() {
        assert_eq!(Options::parse("f").dirty_max, DIRTY_MAX_DEFAULT / 2);
        assert_eq!(Options::parse("2f").dirty_max, DIRTY_MAX_DEFAULT / 4);
        assert_eq!(Options::parse("F").dirty_max, DIRTY_MAX_DEFAULT * 2);
        assert_eq!(Options::parse("3F").dirty_max, DIRTY_MAX_DEFAULT * 8);
        // Halving to zero then doubling resurrects from one.
        let opts = Options::parse("100fF");
        assert_eq!(opts.dirty_max, 1);
    }

    #[test]
    fn dirty_max_overflow_clamps() {
        let opts = Options::parse("99F");
        assert_eq!(opts.dirty_max, 1 << (core::mem::size_of::<usize>() * 8 - 1));
    }

    #[test]
    fn fill_flags() {
        let opts = Options::parse("JZ");
        assert!(opts.junk);
        assert!(opts.zero);
        let opts = Options::parse("JjZz");
        assert!(!opts.junk);
        assert!(!opts.zero);
    }

    #[test]
    fn poison_levels() {
        assert_eq!(Options::parse("q").poison, PoisonType::None);
        assert_eq!(Options::parse("QQ").poison, PoisonType::All);
        let opts = Options::parse("4Q");
        assert_eq!(opts.poison, PoisonType::Some);
        assert_eq!(opts.poison_size, 4 * CACHELINE_SIZE);
    }

    #[test]
    fn page_size_shift() {
        assert_eq!(Options::parse("P").page_size_shift, 1);
        assert_eq!(Options::parse("2P").page_size_shift, 2);
        assert_eq!(Options::parse("PP").page_size_shift, 2);
    }

    #[test]
    fn randomize_toggle() {
        assert!(!Options::parse("r").randomize_small);
        assert!(Options::parse("rR").randomize_small);
    }

    #[test]
    fn unknown_letters_are_skipped() {
        let opts = Options::parse("Jx7yZ");
        assert!(opts.junk);
        assert!(opts.zero);
    }
}
