//! Module for [`BlockDirectory`].

use crate::block::{
    BlockFlags,
    BlockRef,
    HEADER_SIZE,
};
use core::ptr::NonNull;

/// Result of [`BlockDirectory::find_free`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum FreeSearch {
    /// First free block in address order that is large enough.
    Found(BlockRef),
    /// No block fits. `last` is the last block of the heap, i.e. the block after
    /// which a new block must be linked when the heap grows. `None` if there
    /// are no blocks at all.
    Exhausted { last: Option<BlockRef> },
}

/// Doubly linked, address-ordered list of all blocks of a heap. The directory only
/// knows the root; every other block is reached through the in-band links.
///
/// All methods that change the links complete the whole splice before they return,
/// hence no caller ever observes a half-linked state.
#[derive(Debug, Default)]
pub(crate) struct BlockDirectory {
    root: Option<BlockRef>,
}

impl BlockDirectory {
    pub(crate) const fn new() -> Self {
        Self { root: None }
    }

    pub(crate) const fn root(&self) -> Option<BlockRef> {
        self.root
    }

    pub(crate) const fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Iterates all blocks in address order.
    pub(crate) const fn iter(&self) -> Blocks {
        Blocks { current: self.root }
    }

    /// First-fit search for a free block with a payload of at least `min_size` bytes.
    pub(crate) fn find_free(&self, min_size: usize) -> FreeSearch {
        let mut last = None;
        for block in self.iter() {
            if block.is_free() && block.payload_size() >= min_size {
                return FreeSearch::Found(block);
            }
            last = Some(block);
        }
        FreeSearch::Exhausted { last }
    }

    /// Finds the block whose payload starts at `payload` by walking the whole list.
    pub(crate) fn find_by_payload(&self, payload: usize) -> Option<BlockRef> {
        self.iter()
            .take_while(|block| block.addr() < payload)
            .find(|block| block.payload().as_ptr() as usize == payload)
    }

    /// Writes a new allocated block at `at` and links it after `last`, or makes it the
    /// root if `last` is `None`.
    ///
    /// # Safety
    /// `at` must be the end of `last` (or the heap start for the root), aligned, and the
    /// heap must own `HEADER_SIZE + payload_size` bytes from there.
    pub(crate) unsafe fn append(
        &mut self,
        last: Option<BlockRef>,
        at: NonNull<u8>,
        payload_size: usize,
    ) -> BlockRef {
        debug_assert!(last.map(|l| l.next().is_none()).unwrap_or(self.root.is_none()));
        let block = BlockRef::write(at, payload_size, BlockFlags::empty(), last, None);
        match last {
            Some(last) => last.set_next(Some(block)),
            None => self.root = Some(block),
        }
        block
    }

    /// Shrinks `block` to `requested_size` and links a new free block directly behind it
    /// that covers the rest. Returns the new block.
    ///
    /// The caller must make sure that the rest has room for a header plus the minimum
    /// remainder; see [`crate::HeapConfig::min_split_remainder`]. The new block may end
    /// up next to another free block. Fusing them is up to the caller.
    pub(crate) fn split(&mut self, block: BlockRef, requested_size: usize) -> BlockRef {
        let old_size = block.payload_size();
        debug_assert!(old_size >= requested_size + HEADER_SIZE);
        let rest_size = old_size - requested_size - HEADER_SIZE;

        // SAFETY: the rest lies completely inside the payload of `block`, which is
        // owned by the heap; `requested_size` is aligned, hence the header address is.
        let rest = unsafe {
            let at = NonNull::new_unchecked(block.payload().as_ptr().add(requested_size));
            BlockRef::write(at, rest_size, BlockFlags::FREE, Some(block), block.next())
        };

        if let Some(next) = block.next() {
            next.set_prev(Some(rest));
        }
        block.set_next(Some(rest));
        block.set_payload_size(requested_size);
        rest
    }

    /// Absorbs the free successor of `block` into `block`. The successor's header
    /// becomes part of the payload of `block` and is poisoned.
    pub(crate) fn fuse_with_next(&mut self, block: BlockRef) {
        let next = match block.next() {
            Some(next) => next,
            None => {
                debug_assert!(false, "fuse_with_next() on the last block");
                return;
            }
        };
        debug_assert!(next.is_free());

        block.set_payload_size(block.payload_size() + HEADER_SIZE + next.payload_size());
        let after = next.next();
        block.set_next(after);
        if let Some(after) = after {
            after.set_prev(Some(block));
        }
        next.poison();
    }

    /// Unlinks the last block. The memory is no longer part of the directory afterwards.
    pub(crate) fn remove_tail(&mut self, block: BlockRef) {
        debug_assert!(block.next().is_none());
        match block.prev() {
            Some(prev) => prev.set_next(None),
            None => self.root = None,
        }
        block.poison();
    }
}

/// Iterator over all blocks of a [`BlockDirectory`], in address order.
#[derive(Debug)]
pub(crate) struct Blocks {
    current: Option<BlockRef>,
}

impl Iterator for Blocks {
    type Item = BlockRef;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.current?;
        self.current = block.next();
        Some(block)
    }
}
