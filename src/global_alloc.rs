//! See [`GlobalBrkAllocator`].

use crate::block::ALIGNMENT;
use crate::brk::ProgramBreak;
use crate::config::HeapConfig;
use crate::error::HeapError;
use crate::heap::Heap;
use crate::sync::mutex::SimpleMutex;
use core::alloc::{
    GlobalAlloc,
    Layout,
};
use core::mem::size_of;
use core::ptr::NonNull;
use core::sync::atomic::{
    AtomicU8,
    Ordering,
};

/// No error recorded.
const NO_ERROR: u8 = 0;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GlobalBrkAllocatorError {
    Uninitialized,
    AlreadyInitialized,
}

/// Wrapping struct around [`Heap`] which enables the usage of the heap in a global
/// context, i.e. as global allocator or as the `malloc` family of a C runtime.
///
/// The struct synchronizes all accesses to the heap with one lock. Nothing logs while
/// the lock is held, so the allocator can serve a logger that allocates.
///
/// The C-style entry points report failures as null pointers and remember the error
/// (see [`Self::last_error`]), like `errno`. Calls on an uninitialized allocator count
/// as [`HeapError::OutOfMemory`] (`free`: [`HeapError::InvalidPointer`]). The
/// [`GlobalAlloc`] implementation only returns null and never writes the last error.
///
/// It must be initialized first by calling [`Self::init`].
#[derive(Debug)]
pub struct GlobalBrkAllocator<B: ProgramBreak> {
    heap: SimpleMutex<Option<Heap<B>>>,
    last_error: AtomicU8,
}

impl<B: ProgramBreak> GlobalBrkAllocator<B> {
    pub const fn new() -> Self {
        Self {
            heap: SimpleMutex::new(None),
            last_error: AtomicU8::new(NO_ERROR),
        }
    }

    /// Initializes the allocator with the program break it manages.
    /// This operation can be done once.
    pub fn init(&self, brk: B) -> Result<(), GlobalBrkAllocatorError> {
        self.init_with_config(brk, HeapConfig::new())
    }

    /// Like [`Self::init`]. Logging of the heap and of the break is always turned off;
    /// see [`HeapConfig::with_logging`].
    pub fn init_with_config(
        &self,
        mut brk: B,
        config: HeapConfig,
    ) -> Result<(), GlobalBrkAllocatorError> {
        brk.set_logging(false);
        let config = config.with_logging(false);
        let initialized = {
            let mut lock = self.heap.lock();
            if lock.is_some() {
                false
            } else {
                lock.replace(Heap::with_config(brk, config));
                true
            }
        };

        // the lock is released; logging is safe from here on
        if initialized {
            log::debug!("initialized the allocator:");
            log::debug!("  min split remainder: {}", config.min_split_remainder());
            log::debug!("  strict validation: {}", config.strict_validation());
            Ok(())
        } else {
            log::error!("Allocator already initialized!");
            Err(GlobalBrkAllocatorError::AlreadyInitialized)
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.heap.lock().is_some()
    }

    /// Executes `f` with exclusive access to the heap. Useful for inspection, e.g.
    /// [`Heap::verify`] or [`Heap::stats`].
    ///
    /// `f` must neither allocate nor log, otherwise it dead-locks.
    pub fn with_heap<R>(
        &self,
        f: impl FnOnce(&mut Heap<B>) -> R,
    ) -> Result<R, GlobalBrkAllocatorError> {
        let mut lock = self.heap.lock();
        let heap = lock
            .as_mut()
            .ok_or(GlobalBrkAllocatorError::Uninitialized)?;
        Ok(f(heap))
    }

    /// The error of the last failed call of the C-style entry points, if any.
    pub fn last_error(&self) -> Option<HeapError> {
        HeapError::try_from(self.last_error.load(Ordering::Relaxed)).ok()
    }

    /// Like [`Self::last_error`] but also resets the error.
    pub fn take_last_error(&self) -> Option<HeapError> {
        HeapError::try_from(self.last_error.swap(NO_ERROR, Ordering::Relaxed)).ok()
    }

    fn record(&self, err: HeapError) {
        self.last_error.store(err.val(), Ordering::Relaxed);
    }

    /// Runs `f` on the locked heap; failures become a null pointer and the last error.
    fn c_call(
        &self,
        f: impl FnOnce(&mut Heap<B>) -> Result<NonNull<u8>, HeapError>,
    ) -> *mut u8 {
        match self.with_heap(f) {
            Ok(Ok(ptr)) => ptr.as_ptr(),
            Ok(Err(e)) => {
                if e == HeapError::Corruption {
                    log::error!("heap corruption detected");
                }
                self.record(e);
                core::ptr::null_mut()
            }
            Err(_) => {
                log::error!("allocator is uninitialized");
                self.record(HeapError::OutOfMemory);
                core::ptr::null_mut()
            }
        }
    }

    /// Runs `f` on the locked heap for [`GlobalAlloc`]. Never logs, because the logger
    /// may allocate, and never touches the last error of the C-style entry points.
    fn rust_call(
        &self,
        f: impl FnOnce(&mut Heap<B>) -> Result<NonNull<u8>, HeapError>,
    ) -> *mut u8 {
        match self.with_heap(f) {
            Ok(Ok(ptr)) => ptr.as_ptr(),
            _ => core::ptr::null_mut(),
        }
    }

    /// `malloc`: at least `size` bytes or null.
    pub fn malloc(&self, size: usize) -> *mut u8 {
        self.c_call(|heap| heap.allocate(size))
    }

    /// `calloc`: `count * size` zeroed bytes or null. Null also if the multiplication
    /// overflows.
    pub fn calloc(&self, count: usize, size: usize) -> *mut u8 {
        self.c_call(|heap| heap.zero_allocate(count, size))
    }

    /// `realloc`:
    /// - `ptr == null` behaves like [`Self::malloc`],
    /// - `size == 0` frees `ptr` and returns null,
    /// - on failure, null is returned and `ptr` stays valid.
    ///
    /// This method shadows [`GlobalAlloc::realloc`] in method calls; call that one as
    /// `GlobalAlloc::realloc(&allocator, ptr, layout, new_size)`.
    pub fn realloc(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        if size == 0 {
            self.free(ptr);
            return core::ptr::null_mut();
        }
        self.c_call(|heap| heap.reallocate(NonNull::new(ptr), size))
    }

    /// `free`: null is ignored. Invalid pointers are logged and recorded as last error,
    /// the heap is not touched.
    pub fn free(&self, ptr: *mut u8) {
        let ptr = match NonNull::new(ptr) {
            Some(ptr) => ptr,
            None => return,
        };
        match self.with_heap(|heap| heap.release(ptr)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log::warn!("free({:?}) ignored: {}", ptr, e);
                self.record(e);
            }
            Err(_) => {
                log::error!("allocator is uninitialized");
                self.record(HeapError::InvalidPointer);
            }
        }
    }
}

impl<B: ProgramBreak> Default for GlobalBrkAllocator<B> {
    fn default() -> Self {
        Self::new()
    }
}

/// Size of the slot in front of an over-aligned pointer that holds the pointer
/// returned by the heap.
const BACKREF_SIZE: usize = size_of::<*mut u8>();

/// Places an allocation with an alignment above [`ALIGNMENT`] inside of a larger heap
/// allocation. Returns the aligned pointer.
///
/// # Safety
/// `raw` must point to at least `size + align` bytes, `align` must be a power of two
/// larger than [`ALIGNMENT`].
unsafe fn place_over_aligned(raw: NonNull<u8>, align: usize) -> *mut u8 {
    let slot_end = raw.as_ptr().add(BACKREF_SIZE);
    let aligned = slot_end.add(slot_end.align_offset(align));
    aligned.cast::<*mut u8>().sub(1).write(raw.as_ptr());
    aligned
}

/// Counterpart of [`place_over_aligned`].
///
/// # Safety
/// `ptr` must come from [`place_over_aligned`].
unsafe fn over_aligned_origin(ptr: *mut u8) -> *mut u8 {
    ptr.cast::<*mut u8>().sub(1).read()
}

unsafe impl<B: ProgramBreak + Send> GlobalAlloc for GlobalBrkAllocator<B> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // DON'T USE RECURSIVE ALLOCATING HERE
        // LIKE format!() or log::*!().. otherwise infinite loop because of the (dead)lock

        // zero-sized layouts are allowed here, the heap doesn't know them
        let size = layout.size().max(1);
        if layout.align() <= ALIGNMENT {
            return self.rust_call(|heap| heap.allocate(size));
        }

        let raw = match size.checked_add(layout.align()) {
            Some(total) => self.rust_call(|heap| heap.allocate(total)),
            None => return core::ptr::null_mut(),
        };
        match NonNull::new(raw) {
            Some(raw) => place_over_aligned(raw, layout.align()),
            None => raw,
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // DON'T USE RECURSIVE ALLOCATING HERE
        // LIKE format!() or log::*!().. otherwise infinite loop because of the (dead)lock

        let ptr = if layout.align() <= ALIGNMENT {
            ptr
        } else {
            over_aligned_origin(ptr)
        };
        if let Some(ptr) = NonNull::new(ptr) {
            // a foreign pointer breaks the contract of `GlobalAlloc`; the heap stays
            // untouched and there is no one to report to
            let _ = self.with_heap(|heap| heap.release(ptr));
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= ALIGNMENT {
            return self.rust_call(|heap| heap.reallocate(NonNull::new(ptr), new_size.max(1)));
        }

        let new_layout = Layout::from_size_align_unchecked(new_size, layout.align());
        let new_ptr = self.alloc(new_layout);
        if !new_ptr.is_null() {
            core::ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
            self.dealloc(ptr, layout);
        }
        new_ptr
    }
}
