//! The boundary to the environment: a primitive that moves the end of the heap's address
//! range. This is the only thing the allocator needs from the outside world.
//!
//! The semantics follow the classic POSIX program break. [`ProgramBreak::sbrk`] moves the
//! break relatively and returns the previous break. With a delta of zero it just queries
//! the current break. [`ProgramBreak::brk`] sets the break to an exact address, which
//! is how the heap gives memory back when its last block becomes free.
//!
//! [`StaticBreak`] implements the primitive on top of a fixed chunk of memory, e.g. a
//! [`StaticAlignedMem`] in the data section of a kernel.

mod static_aligned_mem;
mod static_break;

pub use static_aligned_mem::StaticAlignedMem;
pub use static_break::StaticBreak;

/// Possible errors when the break is moved.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BreakError {
    /// The break can't grow any further.
    Exhausted,
    /// The break would move below the start of the managed region.
    BelowBase,
    /// The requested delta is not representable.
    Overflow,
}

/// Abstraction over an `sbrk`-like primitive. The heap that uses an implementation of this
/// trait assumes that it is the only one who moves the break.
pub trait ProgramBreak {
    /// Moves the break by `delta` bytes and returns the previous break, i.e. the
    /// start of the new memory when the break grows. `delta == 0` queries the break.
    fn sbrk(&mut self, delta: isize) -> Result<*mut u8, BreakError>;

    /// Sets the break to `addr`.
    fn brk(&mut self, addr: *mut u8) -> Result<(), BreakError> {
        let current = self.sbrk(0)? as usize;
        let addr = addr as usize;
        let delta = if addr >= current {
            isize::try_from(addr - current).map_err(|_| BreakError::Overflow)?
        } else {
            // `-isize::MIN` is not representable; such a shrink can't be valid anyway
            -isize::try_from(current - addr).map_err(|_| BreakError::Overflow)?
        };
        self.sbrk(delta).map(|_| ())
    }

    /// Turns diagnostics of the implementation on or off. A break behind the lock of
    /// a global allocator must not log: a logger that allocates would re-enter the lock.
    fn set_logging(&mut self, _enabled: bool) {}
}
