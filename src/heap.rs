//! Module for [`Heap`], the allocation engine.
//!
//! Design summary:
//! - Contiguous heap between the heap start and the program break (high-water mark).
//! - One in-band header per block; blocks form an address-ordered, doubly linked list.
//! - First-fit search; too large free blocks are split.
//! - Released blocks are fused with free neighbours; there are never two adjacent
//!   free blocks after a public operation returns.
//! - When the last block becomes free, the program break retreats.

use crate::block::{
    align_up,
    BlockRef,
    ALIGNMENT,
    HEADER_SIZE,
};
use crate::brk::ProgramBreak;
use crate::config::HeapConfig;
use crate::directory::{
    BlockDirectory,
    FreeSearch,
};
use crate::error::HeapError;
use arrayvec::ArrayVec;
use core::ptr::NonNull;

/// Logs through `log` unless the heap was configured to be silent, see
/// [`HeapConfig::with_logging`].
macro_rules! heap_log {
    ($heap: expr, $level: ident, $($arg: tt)+) => {
        if $heap.config.logging() {
            log::$level!($($arg)+);
        }
    };
}

/// Counters that describe the state of a [`Heap`].
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Number of blocks, free and allocated.
    pub blocks: usize,
    /// Number of free blocks.
    pub free_blocks: usize,
    /// Payload bytes of allocated blocks.
    pub allocated_bytes: usize,
    /// Payload bytes of free blocks.
    pub free_bytes: usize,
    /// Bytes between heap start and high-water mark, headers included.
    pub heap_size: usize,
}

/// One block as reported by [`Heap::layout`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    /// Offset of the block header from the heap start.
    pub offset: usize,
    pub payload_size: usize,
    pub free: bool,
}

/// A heap on top of a [`ProgramBreak`]. It implements the semantics of the C allocation
/// family (`malloc`, `calloc`, `realloc`, `free`) with first-fit reuse of free blocks.
///
/// The heap is single-threaded: every operation takes `&mut self`. Wrap it into a lock
/// if it is shared, e.g. with [`crate::GlobalBrkAllocator`].
///
/// The heap must be the only user of its program break. Memory is only requested from
/// the break when no free block fits and it is given back as soon as the last block of
/// the heap becomes free.
#[derive(Debug)]
pub struct Heap<B: ProgramBreak> {
    brk: B,
    config: HeapConfig,
    /// Set when the break is touched for the first time.
    start: Option<NonNull<u8>>,
    /// Bytes between `start` and the high-water mark.
    size: usize,
    directory: BlockDirectory,
}

// SAFETY: the heap exclusively owns the memory behind its break; the raw pointers in
// the headers never point outside of it.
unsafe impl<B: ProgramBreak + Send> Send for Heap<B> {}

impl<B: ProgramBreak> Heap<B> {
    /// Creates a heap with the default [`HeapConfig`]. The break is not touched
    /// before the first allocation.
    pub const fn new(brk: B) -> Self {
        Self::with_config(brk, HeapConfig::new())
    }

    pub const fn with_config(brk: B, config: HeapConfig) -> Self {
        Self {
            brk,
            config,
            start: None,
            size: 0,
            directory: BlockDirectory::new(),
        }
    }

    pub const fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// The underlying program break.
    pub const fn program_break(&self) -> &B {
        &self.brk
    }

    /// Start of the heap. `None` until the first allocation.
    pub const fn start(&self) -> Option<NonNull<u8>> {
        self.start
    }

    /// Current end of the heap (exclusive). Equals [`Self::start`] if the heap holds no
    /// blocks.
    pub fn high_water_mark(&self) -> Option<NonNull<u8>> {
        self.start.map(|start| {
            // SAFETY: `size` bytes from `start` belong to the heap
            unsafe { NonNull::new_unchecked(start.as_ptr().add(self.size)) }
        })
    }

    /// Allocates at least `size` bytes. The payload is aligned to [`ALIGNMENT`].
    ///
    /// Zero-sized requests are rejected with [`HeapError::ZeroSize`].
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        if size == 0 {
            return Err(HeapError::ZeroSize);
        }
        let aligned_size = align_up(size).ok_or(HeapError::SizeOverflow)?;

        let block = match self.directory.find_free(aligned_size) {
            FreeSearch::Found(block) => {
                block.set_free(false);
                self.carve(block, aligned_size);
                block
            }
            FreeSearch::Exhausted { last } => self.extend(last, aligned_size)?,
        };

        let ptr = block.payload();
        heap_log!(
            self,
            trace,
            "allocate: size={} block={} ptr={:?}",
            size,
            block.payload_size(),
            ptr
        );
        Ok(ptr)
    }

    /// Allocates `count * elem_size` bytes and fills them with zeroes.
    /// An overflowing multiplication fails with [`HeapError::SizeOverflow`].
    pub fn zero_allocate(
        &mut self,
        count: usize,
        elem_size: usize,
    ) -> Result<NonNull<u8>, HeapError> {
        let size = count
            .checked_mul(elem_size)
            .ok_or(HeapError::SizeOverflow)?;
        let ptr = self.allocate(size)?;
        // `allocate` succeeded, so this can't overflow
        let aligned_size = align_up(size).ok_or(HeapError::SizeOverflow)?;
        // SAFETY: the payload has at least `aligned_size` bytes
        unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0, aligned_size) };
        Ok(ptr)
    }

    /// Releases the block behind `ptr`. The block gets fused with its free neighbours;
    /// if it ends up being the last block of the heap, the memory goes back to the
    /// program break.
    ///
    /// A pointer that doesn't pass [`Self::is_valid`] is rejected with
    /// [`HeapError::InvalidPointer`] and the heap stays untouched.
    pub fn release(&mut self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        let mut block = self.validated_block(ptr)?;
        heap_log!(self, trace, "release: ptr={:?} block={}", ptr, block.payload_size());
        block.set_free(true);

        while let Some(prev) = block.prev().filter(|prev| prev.is_free()) {
            self.directory.fuse_with_next(prev);
            block = prev;
        }
        while block.next().map(|next| next.is_free()).unwrap_or(false) {
            self.directory.fuse_with_next(block);
        }

        self.retreat_if_tail(block);
        Ok(())
    }

    /// Resizes the allocation behind `ptr` to at least `new_size` bytes. The first
    /// `min(old size, new_size)` bytes are preserved.
    ///
    /// - `ptr == None` behaves like [`Self::allocate`].
    /// - If the block is already large enough, or can take over its free successor, the
    ///   same pointer is returned. A now unused tail of the block is split off.
    /// - Otherwise, the data moves to a new block and the old block is released.
    ///
    /// On error, the original allocation is untouched and still valid.
    /// `new_size == 0` is rejected with [`HeapError::ZeroSize`].
    pub fn reallocate(
        &mut self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Result<NonNull<u8>, HeapError> {
        let ptr = match ptr {
            Some(ptr) => ptr,
            None => return self.allocate(new_size),
        };
        let block = self.validated_block(ptr)?;
        if new_size == 0 {
            return Err(HeapError::ZeroSize);
        }
        let aligned_size = align_up(new_size).ok_or(HeapError::SizeOverflow)?;
        let old_size = block.payload_size();

        if old_size >= aligned_size {
            heap_log!(self, trace, "reallocate: shrink {:?} {}->{}", ptr, old_size, new_size);
            self.carve(block, aligned_size);
            return Ok(ptr);
        }

        if let Some(next) = block.next().filter(|next| next.is_free()) {
            if old_size + HEADER_SIZE + next.payload_size() >= aligned_size {
                heap_log!(self, trace, "reallocate: grow {:?} {}->{}", ptr, old_size, new_size);
                self.directory.fuse_with_next(block);
                self.carve(block, aligned_size);
                return Ok(ptr);
            }
        }

        // copy first, release afterwards: a failing allocation must keep the old block
        let new_ptr = self.allocate(new_size)?;
        // SAFETY: both payloads are large enough and distinct blocks never overlap
        unsafe {
            core::ptr::copy_nonoverlapping(
                ptr.as_ptr(),
                new_ptr.as_ptr(),
                old_size.min(new_size),
            )
        };
        self.release(ptr)?;
        heap_log!(
            self,
            trace,
            "reallocate: moved {:?}->{:?} {}->{}",
            ptr,
            new_ptr,
            old_size,
            new_size
        );
        Ok(new_ptr)
    }

    /// Checks whether `ptr` is the payload of an allocated block of this heap:
    /// - the heap holds blocks,
    /// - `ptr` lies between heap start and high-water mark,
    /// - the header in front of `ptr` records `ptr` as its payload start, and
    /// - the block is not free.
    ///
    /// With [`HeapConfig::strict_validation`], the block must also be part of the block
    /// list. This is an O(1) check otherwise.
    pub fn is_valid(&self, ptr: *const u8) -> bool {
        self.lookup(ptr).is_some()
    }

    /// Number of usable bytes behind `ptr`. May be larger than requested.
    pub fn usable_size(&self, ptr: NonNull<u8>) -> Result<usize, HeapError> {
        self.validated_block(ptr).map(BlockRef::payload_size)
    }

    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            heap_size: self.size,
            ..HeapStats::default()
        };
        for block in self.directory.iter() {
            stats.blocks += 1;
            if block.is_free() {
                stats.free_blocks += 1;
                stats.free_bytes += block.payload_size();
            } else {
                stats.allocated_bytes += block.payload_size();
            }
        }
        stats
    }

    /// Snapshot of the first `N` blocks in address order. Doesn't allocate.
    pub fn layout<const N: usize>(&self) -> ArrayVec<BlockInfo, N> {
        let start = self.start_addr();
        self.directory
            .iter()
            .take(N)
            .map(|block| BlockInfo {
                offset: block.addr() - start,
                payload_size: block.payload_size(),
                free: block.is_free(),
            })
            .collect()
    }

    /// Walks all blocks and checks the invariants of the heap:
    /// - blocks are contiguous and ordered and cover the heap exactly,
    /// - every header is consistent,
    /// - no two adjacent blocks are free.
    ///
    /// Returns [`HeapError::Corruption`] if one of them is broken. Unlike the checks of
    /// `release` and `reallocate`, this never panics.
    pub fn verify(&self) -> Result<(), HeapError> {
        let end = self.end_addr();
        let mut expected = self.start_addr();
        let mut prev_free = false;
        for block in self.directory.iter() {
            let violation = if block.addr() != expected || block.addr() >= end {
                Some("gap or overlap between blocks")
            } else if block.recorded_payload_start() != block.payload().as_ptr() {
                Some("payload start doesn't match the header")
            } else if let Err(what) = self.check_header(block) {
                Some(what)
            } else if prev_free && block.is_free() {
                Some("two adjacent free blocks")
            } else {
                None
            };
            if let Some(what) = violation {
                heap_log!(self, error, "heap corruption: {} (block {:#x})", what, block.addr());
                return Err(HeapError::Corruption);
            }
            prev_free = block.is_free();
            expected = block.end();
        }
        if expected != end {
            heap_log!(self, error, "heap corruption: last block doesn't end at the break");
            return Err(HeapError::Corruption);
        }
        Ok(())
    }

    fn start_addr(&self) -> usize {
        self.start.map(|s| s.as_ptr() as usize).unwrap_or(0)
    }

    fn end_addr(&self) -> usize {
        self.start_addr() + self.size
    }

    /// Marks the heap start on first use. If the break is not aligned, it is bumped to
    /// the next aligned address once; the skipped bytes are never used.
    fn bootstrap(&mut self) -> Result<NonNull<u8>, HeapError> {
        if let Some(start) = self.start {
            return Ok(start);
        }
        let current = self.brk.sbrk(0).map_err(|e| {
            heap_log!(self, debug, "can't query the program break: {:?}", e);
            HeapError::OutOfMemory
        })?;
        let padding = current.align_offset(ALIGNMENT);
        if padding != 0 {
            let delta = isize::try_from(padding).map_err(|_| HeapError::OutOfMemory)?;
            self.brk.sbrk(delta).map_err(|e| {
                heap_log!(self, debug, "can't align the program break: {:?}", e);
                HeapError::OutOfMemory
            })?;
        }
        // SAFETY: the break handed out `padding` bytes from `current`
        let start =
            NonNull::new(unsafe { current.add(padding) }).ok_or(HeapError::OutOfMemory)?;
        heap_log!(self, debug, "heap starts at {:?}", start);
        self.start = Some(start);
        Ok(start)
    }

    /// Grows the heap by one allocated block with a payload of `size` bytes and links it
    /// after `last`. On error, nothing changed.
    fn extend(&mut self, last: Option<BlockRef>, size: usize) -> Result<BlockRef, HeapError> {
        let total = size
            .checked_add(HEADER_SIZE)
            .ok_or(HeapError::SizeOverflow)?;
        let delta = isize::try_from(total).map_err(|_| HeapError::SizeOverflow)?;
        let start = self.bootstrap()?;

        let at = self.brk.sbrk(delta).map_err(|e| {
            heap_log!(self, debug, "can't grow the heap by {} bytes: {:?}", total, e);
            HeapError::OutOfMemory
        })?;
        if at as usize != self.end_addr() {
            // someone else moved the break; the new memory isn't adjacent to our blocks
            heap_log!(
                self,
                error,
                "program break moved behind our back: expected {:#x}, got {:?}",
                self.end_addr(),
                at
            );
            if let Err(e) = self.brk.sbrk(-delta) {
                // the heap now holds memory it doesn't track
                heap_log!(self, error, "can't give back {} foreign bytes: {:?}", total, e);
            }
            return Err(HeapError::Corruption);
        }

        // SAFETY: the break just handed out `total` bytes at the end of the heap. The
        // address is derived from `start` to stay inside of the heap's memory.
        let block = unsafe {
            let at = NonNull::new_unchecked(start.as_ptr().add(self.size));
            self.directory.append(last, at, size)
        };
        self.size += total;
        heap_log!(self, debug, "heap grew by {} bytes to {} bytes", total, self.size);
        Ok(block)
    }

    /// Reduces `block` (allocated or free) to `size` bytes if the rest is worth an own
    /// block. The rest becomes a free block, is fused with a free successor and goes
    /// back to the break if it is the last block.
    fn carve(&mut self, block: BlockRef, size: usize) {
        let spare = block.payload_size() - size;
        if spare < HEADER_SIZE.saturating_add(self.config.min_split_remainder()) {
            return;
        }
        let rest = self.directory.split(block, size);
        if rest.next().map(|next| next.is_free()).unwrap_or(false) {
            self.directory.fuse_with_next(rest);
        }
        self.retreat_if_tail(rest);
    }

    /// Gives the memory of `block` back to the break if it is free and the last block.
    fn retreat_if_tail(&mut self, block: BlockRef) {
        if !block.is_free() || block.next().is_some() {
            return;
        }
        match self.brk.brk(block.as_ptr()) {
            Ok(()) => {
                self.size = block.addr() - self.start_addr();
                self.directory.remove_tail(block);
                heap_log!(self, debug, "heap shrank to {} bytes", self.size);
            }
            Err(e) => {
                // not fatal; the block stays as free tail
                heap_log!(self, warn, "can't shrink the heap: {:?}", e);
            }
        }
    }

    /// Finds the allocated block whose payload starts at `ptr`, see [`Self::is_valid`].
    fn lookup(&self, ptr: *const u8) -> Option<BlockRef> {
        let start = self.start?;
        if self.directory.is_empty() {
            return None;
        }
        let addr = ptr as usize;
        let start_addr = start.as_ptr() as usize;
        if addr < start_addr + HEADER_SIZE || addr >= self.end_addr() || addr % ALIGNMENT != 0 {
            return None;
        }

        // SAFETY: the header lies inside of the heap; derived from `start` so that we only
        // read our own memory
        let block = unsafe {
            let payload = start.as_ptr().add(addr - start_addr);
            BlockRef::from_payload(NonNull::new_unchecked(payload))
        };
        if block.recorded_payload_start() as usize != addr || block.is_free() {
            return None;
        }
        if self.config.strict_validation() && self.directory.find_by_payload(addr).is_none() {
            return None;
        }
        Some(block)
    }

    /// Like [`Self::lookup`] but also checks the header for consistency before anyone
    /// trusts its fields.
    fn validated_block(&self, ptr: NonNull<u8>) -> Result<BlockRef, HeapError> {
        let block = self.lookup(ptr.as_ptr()).ok_or_else(|| {
            heap_log!(self, warn, "rejected invalid pointer {:?}", ptr);
            HeapError::InvalidPointer
        })?;
        match self.check_header(block) {
            Ok(()) => Ok(block),
            Err(what) => Err(self.corruption(what, block)),
        }
    }

    /// Plausibility checks of a single header against the heap bounds and its
    /// neighbours. Neighbours are only dereferenced after their address checked out.
    fn check_header(&self, block: BlockRef) -> Result<(), &'static str> {
        let start = self.start_addr();
        let end = self.end_addr();

        if block.flags().is_none() {
            return Err("unknown flag bits");
        }
        let size = block.payload_size();
        if size % ALIGNMENT != 0 {
            return Err("unaligned payload size");
        }
        let block_end = block
            .addr()
            .checked_add(HEADER_SIZE)
            .and_then(|a| a.checked_add(size))
            .ok_or("payload size overflows")?;
        if block_end > end {
            return Err("payload exceeds the heap");
        }

        match block.next() {
            Some(next) => {
                if next.addr() != block_end || block_end >= end {
                    return Err("next block is not adjacent");
                }
                if next.prev() != Some(block) {
                    return Err("next block doesn't link back");
                }
            }
            None => {
                if block_end != end {
                    return Err("last block doesn't end at the high-water mark");
                }
            }
        }

        match block.prev() {
            Some(prev) => {
                let prev_addr = prev.addr();
                if prev_addr < start || prev_addr >= block.addr() || prev_addr % ALIGNMENT != 0 {
                    return Err("previous block out of order");
                }
                if prev.next() != Some(block) || prev.end() != block.addr() {
                    return Err("previous block doesn't link forward");
                }
            }
            None => {
                if self.directory.root() != Some(block) {
                    return Err("first block is not the root");
                }
            }
        }
        Ok(())
    }

    /// Corrupted heap: fatal in debug builds, reported otherwise.
    fn corruption(&self, what: &str, block: BlockRef) -> HeapError {
        heap_log!(self, error, "heap corruption: {} (block at {:#x})", what, block.addr());
        if cfg!(debug_assertions) {
            panic!("heap corruption: {} (block at {:#x})", what, block.addr());
        }
        HeapError::Corruption
    }
}
