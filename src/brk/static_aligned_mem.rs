//! Module for [`StaticAlignedMem`].

use super::StaticBreak;

/// Page-aligned byte array that backs a [`StaticBreak`], typically as `static mut` in
/// the data section of a kernel or runtime. Because the heap then starts at a page
/// boundary, block offsets are the same on every run.
///
/// The memory must land in a writeable section; `static mut` takes care of that.
#[derive(Debug)]
#[repr(align(4096))]
pub struct StaticAlignedMem<const N: usize>([u8; N]);

impl<const N: usize> StaticAlignedMem<N> {
    pub const fn new() -> Self {
        Self([0; N])
    }

    pub fn data_mut(&mut self) -> &mut [u8; N] {
        &mut self.0
    }

    /// Hands the whole memory out as program break.
    pub fn as_break(&mut self) -> StaticBreak<'_> {
        StaticBreak::new(&mut self.0)
    }
}

impl<const N: usize> Default for StaticAlignedMem<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brk::ProgramBreak;
    use std::boxed::Box;

    #[test]
    fn test_aligned() {
        let mut mem = Box::new(StaticAlignedMem::<4096>::new());
        assert_eq!(mem.data_mut().as_mut_ptr() as usize % 4096, 0);
    }

    #[test]
    fn test_as_break_covers_everything() {
        let mut mem = Box::new(StaticAlignedMem::<8192>::new());
        let first = mem.data_mut().as_mut_ptr();
        let mut brk = mem.as_break();
        assert_eq!(8192, brk.capacity());
        assert_eq!(first, brk.sbrk(8192).unwrap());
    }
}
