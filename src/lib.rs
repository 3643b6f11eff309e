#![cfg_attr(feature = "allocator-api", feature(allocator_api))]

//! Fixed-region heap allocator. The heap is handed one contiguous byte
//! region when it is created and serves every allocation, deallocation and
//! reallocation out of that region, never growing it and never calling the
//! platform allocator. That trades internal fragmentation for bounded,
//! predictable per-request work, which is the right trade in realtime and
//! embedded programs whose maximum working set is known up front.
//!
//! Three layers compose the allocator, bottom to top:
//!
//! - [`chunk`] — the in-band header prefixed to every chunk, carrying the
//!   size, the physical-adjacency back link and a pair of slots that are
//!   either free list links or a used marker.
//! - [`bin`] — the segregated free lists: one doubly linked list per
//!   power-of-two size class.
//! - [`heap`] — [`Heap`] itself: region initialisation, the bounded
//!   two-pass search, splitting and eager coalescing.
//!
//! [`HeapAllocator`] bundles a heap with an inline buffer of compile time
//! size, and [`LockedHeapAllocator`] wraps that in a lock so it can serve as
//! `#[global_allocator]`.

use std::ptr::NonNull;

mod align;
mod allocator;
mod bin;
mod chunk;
mod heap;

/// Non-null pointer to `T`. We use this in most cases instead of `*mut T`
/// because the compiler will yell at us if we don't write code for the
/// `None` case. It is also how "pointer or null" results surface in the
/// public API: `None` is the null.
pub type Pointer<T> = Option<NonNull<T>>;

pub use align::ALLOC_ALIGN;
pub use allocator::{HeapAllocator, LockedHeapAllocator};
pub use bin::{BIN_COUNT, BIN_MAX_LOOKUPS};
pub use chunk::MIN_ALLOC_SIZE;
pub use heap::Heap;
