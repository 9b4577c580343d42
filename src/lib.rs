//! **Br**ea**k** **Alloc**ator library.
//!
//! A first-fit heap allocator for runtimes without a standard library. The only thing it
//! needs from its environment is a primitive that moves the end of the address space,
//! i.e. something like `sbrk`. See [`brk::ProgramBreak`].
//!
//! The heap keeps an address-ordered, doubly linked list of block headers in-band, right
//! in front of each payload. Free blocks get reused first-fit, split if they are too
//! large and fused with their free neighbours on release. When the last block of the heap
//! becomes free, the memory goes back to the environment.
//!
//! The two most important types are [`heap::Heap`] (one heap, single-threaded) and
//! [`global_alloc::GlobalBrkAllocator`] (lock-guarded, usable as `#[global_allocator]`
//! and as a `malloc`/`calloc`/`realloc`/`free` replacement).

#![cfg_attr(not(test), no_std)]
#![deny(
    clippy::all,
    clippy::cargo,
    clippy::nursery,
    // clippy::restriction,
    // clippy::pedantic
)]
// now allow a few rules which are denied by the above statement
// --> they are ridiculous and not necessary
#![allow(
    clippy::suboptimal_flops,
    clippy::redundant_pub_crate,
    clippy::fallible_impl_from
)]
// I can not influence this; this is the problem of some dependencies
#![allow(clippy::multiple_crate_versions)]
#![deny(missing_debug_implementations)]
#![deny(rustdoc::all)]
// I see a benefit here: Even tho it might not be usable from the outside world,
// it may contain useful information about how the implementation works.
#![allow(rustdoc::private_intra_doc_links)]
#![allow(rustdoc::missing_doc_code_examples)]

#[allow(unused)]
#[cfg_attr(test, macro_use)]
#[cfg(test)]
extern crate std;

mod block;
pub mod brk;
pub mod config;
mod directory;
pub mod error;
pub mod global_alloc;
pub mod heap;
pub mod sync;

#[cfg(test)]
mod test_utils;

pub use block::{
    ALIGNMENT,
    HEADER_SIZE,
};
pub use config::HeapConfig;
pub use error::HeapError;
pub use global_alloc::{
    GlobalBrkAllocator,
    GlobalBrkAllocatorError,
};
pub use heap::{
    BlockInfo,
    Heap,
    HeapStats,
};
