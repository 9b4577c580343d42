//! In-band block headers and the [`BlockRef`] handle to them.
//!
//! Every block of the heap consists of a [`BlockHeader`] directly followed by its payload:
//!
//! ```text
//!   addr(B)            addr(B) + HEADER_SIZE          addr(B) + HEADER_SIZE + payload_size
//!   |                  |                              |
//!   v                  v                              v
//!   +------------------+------------------------------+------------------+-----
//!   | header of B      | payload of B                 | header of next   | ...
//!   +------------------+------------------------------+------------------+-----
//!                      ^
//!                      `- pointer handed out to the user (== header.payload_start)
//! ```
//!
//! Raw header memory is only touched in this module. Everything else works with
//! [`BlockRef`], a copyable handle that may only exist for header memory that the heap
//! owns.

use core::mem::{
    align_of,
    size_of,
};
use core::ptr::NonNull;

/// Alignment of every payload and every payload size. Pointer width, so that every
/// primitive type fits.
pub const ALIGNMENT: usize = align_of::<usize>();

/// Size of the metadata in front of every payload.
pub const HEADER_SIZE: usize = size_of::<BlockHeader>();

// headers are placed at payload boundaries; this only works if the sizes line up
const _: () = assert!(HEADER_SIZE % ALIGNMENT == 0);
const _: () = assert!(align_of::<BlockHeader>() <= ALIGNMENT);

/// Helper macro for bits.
macro_rules! bit {
    ($num: literal) => {
        1 << $num
    };
}

bitflags::bitflags! {
    /// State of a block.
    pub(crate) struct BlockFlags: u8 {
        /// The payload is available for reuse.
        const FREE = bit!(0);
    }
}

/// Per-block metadata stored directly in heap memory.
#[derive(Debug)]
#[repr(C)]
pub(crate) struct BlockHeader {
    /// Usable bytes after the header.
    payload_size: usize,
    /// Next block in address order; `None` for the last block.
    next: Option<BlockRef>,
    /// Previous block in address order; `None` for the root.
    prev: Option<BlockRef>,
    /// Address of the first payload byte. Null for poisoned headers.
    payload_start: *mut u8,
    /// Raw bits of [`BlockFlags`]. Kept raw to detect garbage.
    flags: u8,
}

/// Handle to a block header inside the heap.
///
/// A handle is only created by [`BlockRef::write`] or [`BlockRef::from_payload`]; all
/// accessors rely on the memory behind it being valid header memory of a live heap.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct BlockRef(NonNull<BlockHeader>);

impl BlockRef {
    /// Writes a fresh header at `at` and returns the handle to it.
    ///
    /// # Safety
    /// `at` must be aligned to [`ALIGNMENT`], writable for [`HEADER_SIZE`] +
    /// `payload_size` bytes and owned by the heap as long as the handle is used.
    pub(crate) unsafe fn write(
        at: NonNull<u8>,
        payload_size: usize,
        flags: BlockFlags,
        prev: Option<Self>,
        next: Option<Self>,
    ) -> Self {
        let header = at.cast::<BlockHeader>();
        header.as_ptr().write(BlockHeader {
            payload_size,
            next,
            prev,
            payload_start: at.as_ptr().add(HEADER_SIZE),
            flags: flags.bits(),
        });
        Self(header)
    }

    /// Returns the handle of the (candidate) header in front of `payload`. The header
    /// may be garbage; check [`Self::recorded_payload_start`] before trusting it.
    ///
    /// # Safety
    /// The [`HEADER_SIZE`] bytes in front of `payload` must be readable heap memory and
    /// `payload` must be aligned to [`ALIGNMENT`].
    pub(crate) unsafe fn from_payload(payload: NonNull<u8>) -> Self {
        Self(NonNull::new_unchecked(
            payload.as_ptr().sub(HEADER_SIZE).cast::<BlockHeader>(),
        ))
    }

    fn raw(self) -> *mut BlockHeader {
        self.0.as_ptr()
    }

    /// Address of the header.
    pub(crate) fn addr(self) -> usize {
        self.raw() as usize
    }

    /// Pointer to the header; the place where the block starts.
    pub(crate) fn as_ptr(self) -> *mut u8 {
        self.raw().cast()
    }

    /// Pointer to the first payload byte, computed from the header address.
    pub(crate) fn payload(self) -> NonNull<u8> {
        // SAFETY: a header is always followed by its payload, still inside the heap
        unsafe { NonNull::new_unchecked(self.as_ptr().add(HEADER_SIZE)) }
    }

    /// First address behind the payload. This is where the next block starts.
    pub(crate) fn end(self) -> usize {
        self.addr()
            .wrapping_add(HEADER_SIZE)
            .wrapping_add(self.payload_size())
    }

    pub(crate) fn payload_size(self) -> usize {
        // SAFETY: the handle points to header memory (see type description)
        unsafe { (*self.raw()).payload_size }
    }

    pub(crate) fn set_payload_size(self, size: usize) {
        // SAFETY: the handle points to header memory (see type description)
        unsafe { (*self.raw()).payload_size = size }
    }

    /// Decoded flags; `None` if unknown bits are set, i.e. the header is garbage.
    pub(crate) fn flags(self) -> Option<BlockFlags> {
        // SAFETY: the handle points to header memory (see type description)
        BlockFlags::from_bits(unsafe { (*self.raw()).flags })
    }

    pub(crate) fn is_free(self) -> bool {
        self.flags()
            .map(|f| f.contains(BlockFlags::FREE))
            .unwrap_or(false)
    }

    pub(crate) fn set_free(self, free: bool) {
        let mut flags = self.flags().unwrap_or_else(BlockFlags::empty);
        flags.set(BlockFlags::FREE, free);
        // SAFETY: the handle points to header memory (see type description)
        unsafe { (*self.raw()).flags = flags.bits() }
    }

    pub(crate) fn next(self) -> Option<Self> {
        // SAFETY: the handle points to header memory (see type description)
        unsafe { (*self.raw()).next }
    }

    pub(crate) fn set_next(self, next: Option<Self>) {
        // SAFETY: the handle points to header memory (see type description)
        unsafe { (*self.raw()).next = next }
    }

    pub(crate) fn prev(self) -> Option<Self> {
        // SAFETY: the handle points to header memory (see type description)
        unsafe { (*self.raw()).prev }
    }

    pub(crate) fn set_prev(self, prev: Option<Self>) {
        // SAFETY: the handle points to header memory (see type description)
        unsafe { (*self.raw()).prev = prev }
    }

    /// The payload address as recorded in the header.
    pub(crate) fn recorded_payload_start(self) -> *mut u8 {
        // SAFETY: the handle points to header memory (see type description)
        unsafe { (*self.raw()).payload_start }
    }

    /// Makes the header unrecognizable, so that a stale pointer to its payload no longer
    /// validates. Used when the block stops existing.
    pub(crate) fn poison(self) {
        // SAFETY: the handle points to header memory (see type description)
        unsafe {
            (*self.raw()).payload_start = core::ptr::null_mut();
            (*self.raw()).next = None;
            (*self.raw()).prev = None;
        }
    }
}

/// Rounds `size` up to the next multiple of [`ALIGNMENT`]. `None` on overflow.
#[inline]
pub(crate) const fn align_up(size: usize) -> Option<usize> {
    let mask = ALIGNMENT - 1;
    match size.checked_add(mask) {
        Some(v) => Some(v & !mask),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        // size, 2 links, payload_start + padded flags
        assert_eq!(5 * size_of::<usize>(), HEADER_SIZE);
        assert_eq!(0, HEADER_SIZE % ALIGNMENT);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(Some(0), align_up(0));
        assert_eq!(Some(ALIGNMENT), align_up(1));
        assert_eq!(Some(ALIGNMENT), align_up(ALIGNMENT));
        assert_eq!(Some(2 * ALIGNMENT), align_up(ALIGNMENT + 1));
        assert_eq!(None, align_up(usize::MAX));
    }

    #[test]
    fn test_write_and_read_back() {
        let mut mem = [0_usize; 16];
        let at = NonNull::new(mem.as_mut_ptr().cast::<u8>()).unwrap();
        let block = unsafe { BlockRef::write(at, 48, BlockFlags::FREE, None, None) };

        assert_eq!(at.as_ptr(), block.as_ptr());
        assert_eq!(48, block.payload_size());
        assert!(block.is_free());
        assert_eq!(block.payload().as_ptr(), block.recorded_payload_start());
        assert_eq!(block.addr() + HEADER_SIZE + 48, block.end());

        block.set_free(false);
        assert!(!block.is_free());
        assert_eq!(Some(BlockFlags::empty()), block.flags());

        let same = unsafe { BlockRef::from_payload(block.payload()) };
        assert_eq!(block, same);

        block.poison();
        assert!(block.recorded_payload_start().is_null());
    }

    #[test]
    fn test_garbage_flags() {
        let mut mem = [0_usize; 8];
        let at = NonNull::new(mem.as_mut_ptr().cast::<u8>()).unwrap();
        let block = unsafe { BlockRef::write(at, 8, BlockFlags::empty(), None, None) };
        unsafe { (*block.raw()).flags = 0xf0 };
        assert_eq!(None, block.flags());
        assert!(!block.is_free());
    }
}
