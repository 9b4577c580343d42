//! Module for [`StaticBreak`].

use super::{
    BreakError,
    ProgramBreak,
};
use crate::block::ALIGNMENT;
use core::marker::PhantomData;
use core::ptr::NonNull;

/// Program break over a fixed, caller-provided memory region. The break starts at the
/// beginning of the region (aligned up to [`ALIGNMENT`]) and can move between that base
/// (lower bound) and the end of the region (upper bound). Moves outside of these bounds
/// are refused and leave the break untouched.
///
/// This is the typical setup of a kernel or an embedded runtime, where the heap lives in
/// a static array. The memory is not touched by this type, only handed out.
#[derive(Debug)]
pub struct StaticBreak<'a> {
    base: NonNull<u8>,
    /// Usable bytes starting at `base`.
    capacity: usize,
    /// Current break, relative to `base`.
    offset: usize,
    logging: bool,
    _mem: PhantomData<&'a mut [u8]>,
}

// SAFETY: the type is logically a `&'a mut [u8]`, which is `Send`.
unsafe impl Send for StaticBreak<'_> {}

impl<'a> StaticBreak<'a> {
    /// Creates a new break that hands out `mem`. Leading bytes that are not aligned
    /// to [`ALIGNMENT`] are skipped.
    pub fn new(mem: &'a mut [u8]) -> Self {
        let len = mem.len();
        let ptr = mem.as_mut_ptr();
        let padding = ptr.align_offset(ALIGNMENT).min(len);
        // SAFETY: `padding <= len`, so the result is in bounds or one past the end.
        let base = unsafe { NonNull::new_unchecked(ptr.add(padding)) };
        Self {
            base,
            capacity: len - padding,
            offset: 0,
            logging: true,
            _mem: PhantomData,
        }
    }

    /// Lowest address the break can have.
    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Maximum number of bytes the break can hand out.
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of bytes currently between base and break.
    pub const fn used(&self) -> usize {
        self.offset
    }
}

impl ProgramBreak for StaticBreak<'_> {
    fn sbrk(&mut self, delta: isize) -> Result<*mut u8, BreakError> {
        let old = self.offset;
        if delta > 0 {
            let new = old
                .checked_add(delta as usize)
                .ok_or(BreakError::Overflow)?;
            if new > self.capacity {
                if self.logging {
                    log::warn!(
                        "[sbrk] out of the upperbound! upperbound: {:#x}, old: {:#x}, new: {:#x}",
                        self.capacity,
                        old,
                        new
                    );
                }
                return Err(BreakError::Exhausted);
            }
            self.offset = new;
            if self.logging {
                log::trace!("[sbrk] break expanded to offset {:#x}", new);
            }
        } else if delta < 0 {
            let new = match old.checked_sub(delta.unsigned_abs()) {
                Some(new) => new,
                None => {
                    if self.logging {
                        log::warn!(
                            "[sbrk] out of the lowerbound! old: {:#x}, delta: {}",
                            old,
                            delta
                        );
                    }
                    return Err(BreakError::BelowBase);
                }
            };
            self.offset = new;
            if self.logging {
                log::trace!("[sbrk] break shrinked to offset {:#x}", new);
            }
        }
        // SAFETY: `old <= capacity`, so this is in bounds or one past the end.
        Ok(unsafe { self.base.as_ptr().add(old) })
    }

    fn set_logging(&mut self, enabled: bool) {
        self.logging = enabled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligns_base() {
        let mut mem = [0_u64; 8];
        let bytes = unsafe { core::slice::from_raw_parts_mut(mem.as_mut_ptr().cast::<u8>(), 64) };
        // cut off the first byte => base must skip to the next aligned address
        let brk = StaticBreak::new(&mut bytes[1..]);
        assert_eq!(0, brk.base() as usize % ALIGNMENT);
        assert_eq!(64 - ALIGNMENT, brk.capacity());
    }

    #[test]
    fn test_bounds() {
        let mut mem = [0_u64; 8];
        let bytes = unsafe { core::slice::from_raw_parts_mut(mem.as_mut_ptr().cast::<u8>(), 64) };
        let mut brk = StaticBreak::new(bytes);
        let base = brk.base();

        assert_eq!(base, brk.sbrk(0).unwrap());
        assert_eq!(base, brk.sbrk(48).unwrap());
        assert_eq!(48, brk.used());
        // would exceed the region
        assert_eq!(Err(BreakError::Exhausted), brk.sbrk(17));
        assert_eq!(48, brk.used());
        assert_eq!(unsafe { base.add(48) }, brk.sbrk(16).unwrap());
        assert_eq!(64, brk.used());

        assert_eq!(unsafe { base.add(64) }, brk.sbrk(-32).unwrap());
        assert_eq!(Err(BreakError::BelowBase), brk.sbrk(-33));
        assert_eq!(32, brk.used());

        brk.brk(base).unwrap();
        assert_eq!(0, brk.used());
        assert_eq!(Err(BreakError::BelowBase), brk.sbrk(-1));
    }

    #[test]
    fn test_empty_region() {
        let mut brk = StaticBreak::new(&mut []);
        assert_eq!(0, brk.capacity());
        assert!(brk.sbrk(0).is_ok());
        assert_eq!(Err(BreakError::Exhausted), brk.sbrk(1));
    }
}
