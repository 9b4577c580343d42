//! Module for [`HeapConfig`].

use crate::block::ALIGNMENT;

/// Tunables of a [`crate::Heap`]. All constructors are `const`, so the config can be part
/// of a static initializer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HeapConfig {
    min_split_remainder: usize,
    strict_validation: bool,
    logging: bool,
}

impl HeapConfig {
    /// Smallest payload that a block carved off during a split may have.
    /// Splitting off less than that only creates fragmentation.
    pub const DEFAULT_MIN_SPLIT_REMAINDER: usize = 8;

    /// Default configuration.
    pub const fn new() -> Self {
        Self {
            min_split_remainder: Self::DEFAULT_MIN_SPLIT_REMAINDER,
            strict_validation: false,
            logging: true,
        }
    }

    /// Sets the minimum payload of a split remainder. Rounded up to [`ALIGNMENT`].
    /// A value of zero still requires room for the header of the remainder.
    pub const fn with_min_split_remainder(mut self, bytes: usize) -> Self {
        let mask = ALIGNMENT - 1;
        // saturate instead of overflow; such a remainder never fits anyway
        self.min_split_remainder = match bytes.checked_add(mask) {
            Some(v) => v & !mask,
            None => usize::MAX & !mask,
        };
        self
    }

    /// If enabled, a pointer passed to `release`/`reallocate` must additionally be found
    /// by walking the block list. This costs O(n) per call but also catches forged
    /// headers inside a payload.
    pub const fn with_strict_validation(mut self, strict: bool) -> Self {
        self.strict_validation = strict;
        self
    }

    /// If disabled, the heap emits no log records. A heap behind a lock must not log
    /// while the lock is held: a logger that allocates would re-enter the lock.
    pub const fn with_logging(mut self, logging: bool) -> Self {
        self.logging = logging;
        self
    }

    pub const fn min_split_remainder(&self) -> usize {
        self.min_split_remainder
    }

    pub const fn strict_validation(&self) -> bool {
        self.strict_validation
    }

    pub const fn logging(&self) -> bool {
        self.logging
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::new()
    }
}
