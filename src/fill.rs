//! Junk, zero and poison fills, applied according to the process-wide
//! options.
use crate::constants::{ALLOC_JUNK, ALLOC_POISON};
use crate::globals;
use crate::options::PoisonType;

/// Overwrites (part of) a freed allocation with the poison byte, per the
/// configured poison level.
///
/// # Safety
///
/// `ptr` must be valid for writes of `size` bytes.
pub unsafe fn maybe_poison(ptr: *mut u8, size: usize) {
    let opt = &globals::g().opt;
    let len = match opt.poison {
        PoisonType::None => return,
        PoisonType::Some => size.min(opt.poison_size),
        PoisonType::All => size,
    };
    debug_assert!(len != 0 && len <= size);
    std::ptr::write_bytes(ptr, ALLOC_POISON, len);
}

/// Fills a fresh allocation with junk or zeroes depending on the junk
/// and zero options.
///
/// # Safety
///
/// `ptr` must be valid for writes of `size` bytes.
pub unsafe fn apply_zero_or_junk(ptr: *mut u8, size: usize) {
    let opt = &globals::g().opt;
    if opt.junk {
        std::ptr::write_bytes(ptr, ALLOC_JUNK, size);
    } else if opt.zero {
        std::ptr::write_bytes(ptr, 0, size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poison_respects_limit() {
        let opt = &globals::g().opt;
        let mut buf = vec![0u8; 1024];
        unsafe { maybe_poison(buf.as_mut_ptr(), buf.len()) };
        match opt.poison {
            PoisonType::None => assert!(buf.iter().all(|&b| b == 0)),
            PoisonType::Some => {
                let limit = opt.poison_size.min(buf.len());
                assert!(buf[..limit].iter().all(|&b| b == ALLOC_POISON));
                assert!(buf[limit..].iter().all(|&b| b == 0));
            }
            PoisonType::All => assert!(buf.iter().all(|&b| b == ALLOC_POISON)),
        }
    }
}
