//! # tagalloc - A Boundary-Tag Heap Allocator
//!
//! This crate provides a user-space **explicit free list allocator** with
//! boundary-tag coalescing. It manages one contiguous region that only grows
//! at its end, obtained from a primitive such as `sbrk(2)`.
//!
//! ## Overview
//!
//! ```text
//!   Heap Region:
//!
//!   ┌──────────────────────────────────────────────────────────────────────┐
//!   │ pad │ prologue │  A1  │  free  │  A2  │  A3  │    free     │ epilogue │
//!   └──────────────────────────────────────────────────────────────────────┘
//!   ▲                          ▲                        ▲                  ▲
//!   │                          └────── free list ───────┘                  │
//!  base                         (address ordered)                         brk
//! ```
//!
//! Each block starts with a header and ends with a footer holding the same
//! `size | allocated` word, so the blocks on both sides of any block can be
//! found in constant time. Free blocks additionally hold the free-list links
//! in their otherwise unused payload.
//!
//! ```text
//!   Allocated block:                 Free block:
//!   ┌────────┬───────────┬────────┐  ┌────────┬──────┬──────┬─────┬────────┐
//!   │ size:a │  payload  │ size:a │  │ size:f │ pred │ succ │ ... │ size:f │
//!   └────────┴───────────┴────────┘  └────────┴──────┴──────┴─────┴────────┘
//!            ▲                                ▲
//!            └── pointer returned to user     └── pointer stored in the list
//! ```
//!
//! ## Crate Structure
//!
//! ```text
//!   tagalloc
//!   ├── align      - Alignment macros (align!, align_to!, checked_align!)
//!   ├── block      - Boundary tag codec and block offset arithmetic
//!   ├── checker    - Heap consistency checker
//!   ├── config     - HeapConfig and FitPolicy
//!   ├── error      - HeapError, ReleaseFault, Violation
//!   ├── free_list  - Address-ordered explicit free list
//!   ├── heap       - Allocator
//!   ├── locked     - LockedAllocator (GlobalAlloc behind one lock)
//!   └── region     - HeapRegion and the Sbrk / Reserved growth primitives
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use tagalloc::{Allocator, HeapConfig};
//!
//! let mut heap = Allocator::reserved(1 << 20, HeapConfig::default()).unwrap();
//!
//! let ptr = heap.allocate(24).unwrap();
//! unsafe { ptr.as_ptr().cast::<u64>().write(42) };
//!
//! let ptr = heap.reallocate(ptr.as_ptr(), 200).unwrap().unwrap();
//! assert_eq!(unsafe { ptr.as_ptr().cast::<u64>().read() }, 42);
//!
//! heap.release(ptr.as_ptr()).unwrap();
//! assert!(heap.check(false).is_empty());
//! ```
//!
//! ## How It Works
//!
//! - **allocate**: the request plus tags is rounded up to a double word and
//!   looked up in the free list (first fit by default). A large enough
//!   remainder is split off as a new free block. When nothing fits, the
//!   region grows by at least one chunk and the new space is merged with any
//!   free block in front of it.
//! - **release**: the block is marked free and merged with free neighbors,
//!   so no two free blocks are ever adjacent.
//! - **reallocate**: shrinks in place, grows in place into a free successor
//!   or the end of the region, and only otherwise moves the data.
//!
//! ## Limitations
//!
//! - **Single-threaded core**: `Allocator` takes `&mut self`; share it
//!   through `LockedAllocator`.
//! - **Double-word alignment only**: stricter layouts are refused.
//! - **No shrinking**: the region is never given back to the system.
//! - **Unix-only**: requires `libc` for `sbrk` and `mmap`.

pub mod align;
pub mod block;
pub mod checker;
pub mod config;
pub mod error;
pub mod free_list;
pub mod heap;
pub mod locked;
pub mod region;

pub use block::Tag;
pub use checker::Validator;
pub use config::{CHUNK_SIZE, FitPolicy, HeapConfig};
pub use error::{HeapError, ReleaseFault, Violation};
pub use heap::{Allocator, BlockInfo, HeapStats};
pub use locked::LockedAllocator;
pub use region::{DEFAULT_RESERVATION, Grow, HeapRegion, Reserved, Sbrk};
