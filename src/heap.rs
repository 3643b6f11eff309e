use std::{ptr, ptr::NonNull};

use crate::{
    align::{self, ALLOC_ALIGN},
    bin::{bin_index, Bin, BIN_COUNT, BIN_MAX_LOOKUPS},
    chunk::{Chunk, CHUNK_HEADER_SIZE, MIN_ALLOC_SIZE},
    Pointer,
};

/// Fixed-region heap allocator. The heap owns a contiguous byte region
/// supplied once through [`Heap::init`] and services arbitrary interleavings
/// of [`Heap::alloc`], [`Heap::dealloc`] and [`Heap::realloc`] against it,
/// never calling the platform allocator.
///
/// The region is tiled by chunks, each prefixed with an in-band [`Chunk`]
/// header, walked in address order through the headers' `prev_adj` links and
/// the sizes. Free chunks additionally hang off one of the [`BIN_COUNT`] size
/// class bins. This is the whole picture:
///
/// ```text
///              bins[1]              bins[6]
///                 |                    |
///                 v                    v
/// +------------+------+------------+--------+------------+----------+
/// | Used chunk | Free | Used chunk |  Free  | Used chunk | Sentinel |
/// +------------+------+------------+--------+------------+----------+
/// ^ region start                                 region end ^
/// ```
///
/// Coalescing is eager: no two adjacent chunks are ever left both free, so
/// the zero size used sentinel at the high end is the only terminator the
/// merge loops need.
///
/// All operations run to completion without blocking or allocating auxiliary
/// memory; the only mutable state is the region itself and the bin heads
/// stored here. The type is neither `Send` nor `Sync`, concurrent mutation
/// has to be prevented by whoever wraps it (see
/// [`crate::allocator::LockedHeapAllocator`]).
pub struct Heap {
    /// One free list per size class.
    bins: [Bin; BIN_COUNT],
}

/// Effective chunk size for a request of `size` bytes: rounded up so that
/// size plus header is a multiple of [`ALLOC_ALIGN`]. `None` on arithmetic
/// overflow, which no chunk could satisfy anyway.
fn effective_size(size: usize) -> Option<usize> {
    let total = size.checked_add(CHUNK_HEADER_SIZE + ALLOC_ALIGN - 1)?;
    Some(align::align_down(total) - CHUNK_HEADER_SIZE)
}

impl Heap {
    /// Builds a heap with no region attached. Every bin is empty; the first
    /// call must be [`Heap::init`].
    pub const fn new() -> Self {
        const BIN: Bin = Bin::new();
        Self {
            bins: [BIN; BIN_COUNT],
        }
    }

    /// Attaches the region to this heap: rounds the start up to
    /// [`ALLOC_ALIGN`], writes the used sentinel at the high end and shapes
    /// everything in between into one free chunk.
    ///
    /// # Safety
    ///
    /// - `region` must be valid for reads and writes for `len` bytes and
    ///   exclusively owned by this heap until the heap is discarded.
    /// - Must be called exactly once per heap, before any other operation.
    /// - `len` must leave room for two headers plus a minimum chunk after
    ///   alignment, i.e. at least `2 * 32 + 16 + 16` bytes.
    pub unsafe fn init(&mut self, region: NonNull<u8>, len: usize) {
        let misalign = region.as_ptr().addr() % ALLOC_ALIGN;
        let padding = if misalign == 0 { 0 } else { ALLOC_ALIGN - misalign };

        debug_assert!(
            len >= padding + 2 * CHUNK_HEADER_SIZE + MIN_ALLOC_SIZE,
            "heap: region of {len} bytes cannot hold a single allocation"
        );

        let start = region.as_ptr().add(padding);
        let usable = align::align_down(len - padding);

        let first = NonNull::new_unchecked(start.cast::<Chunk>());
        first
            .as_ptr()
            .write(Chunk::new_free(usable - 2 * CHUNK_HEADER_SIZE, None));

        let mut sentinel =
            NonNull::new_unchecked(start.add(usable - CHUNK_HEADER_SIZE).cast::<Chunk>());
        sentinel.as_ptr().write(Chunk::new_free(0, Some(first)));
        sentinel.as_mut().mark_used();

        self.insert_into_bin(first);
    }

    /// Allocates a chunk that can fit at least `size` bytes and returns its
    /// payload address, aligned to [`ALLOC_ALIGN`]. Returns `None` when
    /// `size` is zero or when no free chunk is large enough.
    ///
    /// The search is a two-pass walk over the bins, starting at the size
    /// class of the request. The first pass inspects at most
    /// [`BIN_MAX_LOOKUPS`] nodes per bin, bounding the common path at
    /// `BIN_COUNT * BIN_MAX_LOOKUPS` visits. The second pass repeats without
    /// the cap, for the rare case of a fitting chunk sitting behind a long
    /// prefix of marginally too small ones in the same power-of-two band.
    ///
    /// # Safety
    ///
    /// [`Heap::init`] must have been called.
    pub unsafe fn alloc(&mut self, size: usize) -> Pointer<u8> {
        if size == 0 {
            return None;
        }

        let size = effective_size(size)?;
        let (mut chunk, index) = self.find_free_chunk(size)?;

        // Remove under the index the search saw it in. The split below
        // changes the size the bin assignment was keyed on.
        self.bins[index].remove(chunk);
        self.split_if_possible(chunk, size);
        chunk.as_mut().mark_used();

        Some(Chunk::payload_address_of(chunk))
    }

    /// Returns the chunk at `address` to the heap, eagerly merging it with
    /// free neighbours. `None` is a no-op.
    ///
    /// A non-null address that is misaligned or whose header fails the used
    /// check is a caller bug and panics before any state is touched; see
    /// [`Heap::checked_chunk_at`].
    ///
    /// # Safety
    ///
    /// A non-null `address` must have been returned by [`Heap::alloc`] or
    /// [`Heap::realloc`] on this heap and not freed since.
    pub unsafe fn dealloc(&mut self, address: Pointer<u8>) {
        let Some(address) = address else {
            return;
        };

        let mut chunk = self.checked_chunk_at(address, "dealloc");

        // Merge into the preceding chunk first, because that changes the
        // address the merged chunk lives at.
        if let Some(mut prev) = chunk.as_ref().prev_adj {
            if !prev.as_ref().is_used() {
                self.remove_from_bin(prev);
                prev.as_mut().size += chunk.as_ref().total_size();

                let mut after = Chunk::next_adj_of(prev);
                after.as_mut().prev_adj = Some(prev);

                chunk.as_mut().poison_links();
                chunk = prev;
            }
        }

        self.coalesce_forward(chunk);
        self.insert_into_bin(chunk);
    }

    /// Resizes the allocation at `address` to at least `new_size` bytes,
    /// preserving payload contents up to the smaller of the two sizes.
    ///
    /// - A `None` address allocates.
    /// - A zero `new_size` deallocates and returns `None`.
    /// - Growing absorbs a free right neighbour when that yields enough
    ///   space; otherwise the contents move to a fresh chunk. On exhaustion
    ///   `None` is returned and the original allocation is untouched.
    /// - Shrinking splits the tail off in place when it can hold a chunk of
    ///   its own; the address never changes.
    ///
    /// # Safety
    ///
    /// Same contract as [`Heap::dealloc`] for non-null addresses.
    pub unsafe fn realloc(&mut self, address: Pointer<u8>, new_size: usize) -> Pointer<u8> {
        let Some(address) = address else {
            return self.alloc(new_size);
        };

        if new_size == 0 {
            self.dealloc(Some(address));
            return None;
        }

        let mut chunk = self.checked_chunk_at(address, "realloc");
        let size = effective_size(new_size)?;

        if size > chunk.as_ref().size {
            let next = Chunk::next_adj_of(chunk);
            let merged_size = chunk.as_ref().size + CHUNK_HEADER_SIZE + next.as_ref().size;

            if !next.as_ref().is_used() && merged_size >= size {
                self.remove_from_bin(next);
                chunk.as_mut().size = merged_size;

                let mut after = Chunk::next_adj_of(chunk);
                after.as_mut().prev_adj = Some(chunk);
            } else {
                // The old chunk is only released once the new one is
                // secured, so running out of memory here leaves the
                // original allocation intact.
                let new_address = self.alloc(new_size)?;
                ptr::copy_nonoverlapping(
                    address.as_ptr(),
                    new_address.as_ptr(),
                    chunk.as_ref().size,
                );
                self.dealloc(Some(address));

                return Some(new_address);
            }
        }

        // Shrink requests land here directly; grow requests fall through in
        // case the absorbed neighbour made the chunk larger than needed.
        self.split_if_possible(chunk, size);

        Some(address)
    }

    /// Validates a caller supplied payload address and recovers its header.
    /// Misalignment or a header that is not marked used means the pointer
    /// never came from this heap or was already freed. Both are
    /// non-recoverable caller bugs: guessing would risk corrupting unrelated
    /// allocations, so the check panics instead, before anything is mutated.
    unsafe fn checked_chunk_at(&self, address: NonNull<u8>, operation: &str) -> NonNull<Chunk> {
        assert!(
            align::is_aligned(address.as_ptr().addr()),
            "heap: {operation} of misaligned pointer {address:?}"
        );

        let chunk = Chunk::from_payload_address(address);
        assert!(
            chunk.as_ref().is_used(),
            "heap: {operation} of pointer {address:?} which is not an allocated chunk (double free or corruption)"
        );

        chunk
    }

    /// Two-pass search described at [`Heap::alloc`]. Returns the winning
    /// chunk together with the index of the bin it is currently linked in,
    /// so the caller can remove it before resizing it.
    unsafe fn find_free_chunk(&self, size: usize) -> Option<(NonNull<Chunk>, usize)> {
        let start = bin_index(size);

        self.scan_bins(start, size, Some(BIN_MAX_LOOKUPS))
            .or_else(|| self.scan_bins(start, size, None))
    }

    /// Walks the free lists of bins `start..`, accepting the first chunk
    /// that fits. `max_lookups` caps the nodes inspected per bin; `None`
    /// walks each list to the end.
    unsafe fn scan_bins(
        &self,
        start: usize,
        size: usize,
        max_lookups: Option<usize>,
    ) -> Option<(NonNull<Chunk>, usize)> {
        for index in start..BIN_COUNT {
            let mut lookups = 0;
            let mut current = self.bins[index].head();

            while let Some(chunk) = current {
                if max_lookups.is_some_and(|max| lookups == max) {
                    break;
                }

                if chunk.as_ref().size >= size {
                    return Some((chunk, index));
                }

                lookups += 1;
                current = chunk.as_ref().next_free();
            }
        }

        None
    }

    /// Chunk splitting algorithm. Let's say a chunk that can hold 144 bytes
    /// took a request for 32. The tail would be wasted on the caller, so it
    /// becomes a chunk of its own:
    ///
    /// **Before**:
    ///
    /// ```text
    ///         +-->  +-----------+
    ///         |     |   Header  | <- 32 bytes.
    /// Chunk   |     +-----------+
    ///         |     |  Payload  | <- 144 bytes.
    ///         +-->  +-----------+
    /// ```
    ///
    /// **After**:
    ///
    /// ```text
    ///         +-->  +-----------+
    ///         |     |   Header  | <- 32 bytes.
    /// Chunk   |     +-----------+
    ///         |     |  Payload  | <- 32 bytes.
    ///         +-->  +-----------+
    ///         |     |   Header  | <- 32 bytes.
    /// Tail    |     +-----------+
    ///         |     |  Payload  | <- 144 - 32 - 32 = 80 bytes.
    ///         +-->  +-----------+
    /// ```
    ///
    /// The split only happens when the tail can hold a real chunk, meaning
    /// more than a header plus [`MIN_ALLOC_SIZE`]; otherwise the chunk keeps
    /// its slack. The tail is merged with its right neighbour when that one
    /// is free, which keeps the no-adjacent-free-chunks rule intact on the
    /// shrinking realloc path. On the allocation path the neighbour is never
    /// free, the chunk being split was free itself until a moment ago.
    ///
    /// `chunk` must not be linked in any bin; its size and the adjacency
    /// chain are rewritten here.
    unsafe fn split_if_possible(&mut self, mut chunk: NonNull<Chunk>, size: usize) {
        if chunk.as_ref().size <= size + CHUNK_HEADER_SIZE + MIN_ALLOC_SIZE {
            return;
        }

        let tail_size = chunk.as_ref().size - size - CHUNK_HEADER_SIZE;
        chunk.as_mut().size = size;

        let tail_address = Chunk::payload_address_of(chunk).as_ptr().add(size);
        let tail = NonNull::new_unchecked(tail_address.cast::<Chunk>());
        tail.as_ptr().write(Chunk::new_free(tail_size, Some(chunk)));

        let mut after = Chunk::next_adj_of(tail);
        after.as_mut().prev_adj = Some(tail);

        self.coalesce_forward(tail);
        self.insert_into_bin(tail);
    }

    /// Merges the chunk following `chunk` into it when that chunk is free.
    /// The inverse of [`Heap::split_if_possible`]:
    ///
    /// ```text
    /// +----------------+---------------+
    /// |     Chunk      |     Next      |
    /// +----------------+---------------+
    ///        ^                 |
    ///        |                 |
    ///        +-----------------+
    ///         Merge next into chunk
    /// ```
    ///
    /// One step suffices: eager coalescing means the chunk after a free one
    /// is always used. The sentinel is permanently used, so the merge never
    /// runs off the region.
    unsafe fn coalesce_forward(&mut self, mut chunk: NonNull<Chunk>) {
        let next = Chunk::next_adj_of(chunk);
        if next.as_ref().is_used() {
            return;
        }

        self.remove_from_bin(next);
        chunk.as_mut().size += next.as_ref().total_size();

        let mut after = Chunk::next_adj_of(chunk);
        after.as_mut().prev_adj = Some(chunk);
    }

    /// Links a free chunk into the bin of its size class.
    #[inline]
    unsafe fn insert_into_bin(&mut self, chunk: NonNull<Chunk>) {
        self.bins[bin_index(chunk.as_ref().size)].insert(chunk);
    }

    /// Unlinks a free chunk from the bin of its size class. Only correct
    /// while the size is the one the chunk was inserted under.
    #[inline]
    unsafe fn remove_from_bin(&mut self, chunk: NonNull<Chunk>) {
        self.bins[bin_index(chunk.as_ref().size)].remove(chunk);
    }

    #[cfg(test)]
    pub(crate) fn bins(&self) -> &[Bin; BIN_COUNT] {
        &self.bins
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}
