//! Helpers for the unit tests.

use crate::brk::StaticBreak;
use arrayvec::ArrayString;
use core::cell::Cell;
use core::fmt::Write;
use log::{
    LevelFilter,
    Log,
    Metadata,
    Record,
};
use std::alloc::{
    alloc_zeroed,
    dealloc,
    Layout,
};

static LOGGER: TestLogger = TestLogger;

thread_local! {
    /// Called for every record logged by the current thread.
    static HOOK: Cell<Option<fn(&Record)>> = Cell::new(None);
}

/// Prints log messages of the heap to stdout; the test harness captures them.
#[derive(Debug)]
pub struct TestLogger;

impl TestLogger {
    /// Can be called by every test; only the first call installs the logger.
    pub fn init() {
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(LevelFilter::Debug);
        }
    }

    /// Installs a callback that sees every record of the current thread.
    pub fn set_hook(hook: Option<fn(&Record)>) {
        HOOK.with(|h| h.set(hook));
    }
}

impl Log for TestLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if let Some(hook) = HOOK.with(Cell::get) {
            hook(record);
        }
        let mut buf = ArrayString::<256>::new();
        // longer messages are cut; good enough for tests
        let _ = write!(&mut buf, "[{:?}] {}", record.level(), record.args());
        println!("{}", buf);
    }

    fn flush(&self) {}
}

/// Page-aligned, zeroed memory from the std heap that backs a [`StaticBreak`].
/// Used instead of [`crate::brk::StaticAlignedMem`] for sizes that don't fit
/// on the stack of a test thread.
#[derive(Debug)]
pub struct TestMem {
    ptr: *mut u8,
    layout: Layout,
}

// SAFETY: owns its memory exclusively, like a `Box<[u8]>`
unsafe impl Send for TestMem {}

impl TestMem {
    pub fn new(size: usize) -> Self {
        assert!(size > 0);
        let layout = Layout::from_size_align(size, 4096).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        Self { ptr, layout }
    }

    pub fn as_break(&mut self) -> StaticBreak<'_> {
        StaticBreak::new(unsafe { core::slice::from_raw_parts_mut(self.ptr, self.layout.size()) })
    }

    pub fn base(&self) -> *mut u8 {
        self.ptr
    }
}

impl Drop for TestMem {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) }
    }
}

/// Small deterministic PRNG for the randomized tests.
#[derive(Debug)]
pub struct XorShift(u64);

impl XorShift {
    pub const fn new(seed: u64) -> Self {
        Self(seed | 1)
    }

    pub fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    /// Random number in `0..n`.
    pub fn below(&mut self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }
}
