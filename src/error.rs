//! Module for [`HeapError`].

use core::fmt::{
    Display,
    Formatter,
};
use enum_iterator::IntoEnumIterator;

/// Possible errors of the heap. Every variant has a stable numeric code (see [`Self::val`]),
/// so that the C-style front end can remember the last error in a single atomic byte,
/// similar to `errno`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoEnumIterator)]
#[repr(u8)]
pub enum HeapError {
    /// The program break can't be moved any further, i.e. the environment
    /// has no more memory for us.
    OutOfMemory = 1,
    /// The pointer was never handed out by this heap, points into the middle of
    /// a payload, or was already released.
    InvalidPointer = 2,
    /// Computing the size of a request overflowed, e.g. `count * size` in
    /// [`crate::Heap::zero_allocate`].
    SizeOverflow = 3,
    /// Requests for zero bytes are rejected.
    ZeroSize = 4,
    /// A block header behind a valid pointer is inconsistent. Either the caller wrote
    /// out of bounds of its allocation or there is a bug in the heap.
    Corruption = 5,
}

impl HeapError {
    pub const fn val(self) -> u8 {
        self as u8
    }

    /// Short, human readable description.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OutOfMemory => "out of memory",
            Self::InvalidPointer => "invalid pointer",
            Self::SizeOverflow => "size overflow",
            Self::ZeroSize => "zero-sized request",
            Self::Corruption => "heap corruption",
        }
    }
}

impl TryFrom<u8> for HeapError {
    type Error = ();

    fn try_from(val: u8) -> Result<Self, Self::Error> {
        // generated during compile time; probably not recognized by IDE
        for variant in Self::into_enum_iter() {
            if variant.val() == val {
                return Ok(variant);
            }
        }
        Err(())
    }
}

impl Display for HeapError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
