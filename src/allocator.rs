use std::{
    alloc::{GlobalAlloc, Layout},
    cell::{Cell, UnsafeCell},
    mem::MaybeUninit,
    ptr,
    ptr::NonNull,
    sync::Mutex,
};

use crate::{align::ALLOC_ALIGN, heap::Heap, Pointer};

/// Backing bytes for [`HeapAllocator`]. Aligned to the chunk alignment so
/// region initialisation never has to skip leading padding and the full
/// `HEAP_SIZE` stays usable.
#[repr(align(16))]
struct Storage<const HEAP_SIZE: usize> {
    // Only ever accessed through pointer casts from the struct address.
    _bytes: MaybeUninit<[u8; HEAP_SIZE]>,
}

/// A [`Heap`] bundled with its own region: a byte buffer of compile time
/// size stored inline in the struct. Nothing is set up until the first
/// allocation, so placing one of these in a `static` costs no startup work.
///
/// ```rust
/// use fralloc::HeapAllocator;
///
/// let allocator = HeapAllocator::<4096>::new();
///
/// unsafe {
///     let address = allocator.alloc(128).unwrap();
///     // The payload is aligned and at least as big as requested.
///     assert_eq!(address.as_ptr() as usize % 16, 0);
///     allocator.dealloc(Some(address));
/// }
/// ```
///
/// With `ERROR_ON_FAILURE` set, running out of memory panics with a message
/// naming the operation instead of returning `None`, for callers that have
/// no way to handle exhaustion anyway:
///
/// ```rust
/// use fralloc::HeapAllocator;
///
/// let allocator = HeapAllocator::<4096, true>::new();
///
/// unsafe {
///     // Either a usable pointer or a panic, never `None`.
///     let address = allocator.alloc(128).unwrap();
///     allocator.dealloc(Some(address));
/// }
/// ```
///
/// # Single-threadedness
///
/// All methods take `&self` and mutate through [`UnsafeCell`], which makes
/// the type `!Sync`: the compiler rejects sharing it across threads, which
/// is exactly the contract the heap requires. See [`LockedHeapAllocator`]
/// for the lock-wrapped version.
///
/// # Moving
///
/// The free lists hold absolute pointers into the inline buffer, so the
/// struct must not be moved once the first allocation has been made. Keep it
/// in a `static` or another place that outlives every pointer it handed out.
pub struct HeapAllocator<const HEAP_SIZE: usize, const ERROR_ON_FAILURE: bool = false> {
    heap: UnsafeCell<Heap>,
    storage: UnsafeCell<Storage<HEAP_SIZE>>,
    initialized: Cell<bool>,
}

impl<const HEAP_SIZE: usize, const ERROR_ON_FAILURE: bool>
    HeapAllocator<HEAP_SIZE, ERROR_ON_FAILURE>
{
    /// Builds the allocator without touching the buffer. The heap attaches
    /// itself to the buffer on the first call to [`HeapAllocator::alloc`] or
    /// [`HeapAllocator::realloc`].
    pub const fn new() -> Self {
        Self {
            heap: UnsafeCell::new(Heap::new()),
            storage: UnsafeCell::new(Storage {
                _bytes: MaybeUninit::uninit(),
            }),
            initialized: Cell::new(false),
        }
    }

    /// Mutable access to the heap, initialising it against the inline
    /// buffer on the first call.
    unsafe fn heap(&self) -> &mut Heap {
        let heap = &mut *self.heap.get();

        if !self.initialized.get() {
            self.initialized.set(true);
            let region = NonNull::new_unchecked(self.storage.get().cast::<u8>());
            heap.init(region, HEAP_SIZE);
        }

        heap
    }

    /// Allocates `size` bytes from the inline buffer. See [`Heap::alloc`].
    ///
    /// # Safety
    ///
    /// The struct must not be moved afterwards, see the type docs.
    pub unsafe fn alloc(&self, size: usize) -> Pointer<u8> {
        let address = self.heap().alloc(size);

        if ERROR_ON_FAILURE && address.is_none() {
            panic!("fixed heap of {HEAP_SIZE} bytes exhausted by alloc({size})");
        }

        address
    }

    /// Returns an allocation to the inline buffer. See [`Heap::dealloc`].
    ///
    /// # Safety
    ///
    /// A non-null `address` must have been obtained from this allocator and
    /// not freed since.
    pub unsafe fn dealloc(&self, address: Pointer<u8>) {
        (*self.heap.get()).dealloc(address);
    }

    /// Resizes an allocation. `old_size` is the size the caller currently
    /// tracks for `address`; when `new_size` matches it the pointer is
    /// returned unchanged without touching any metadata. Everything else
    /// behaves like [`Heap::realloc`].
    ///
    /// # Safety
    ///
    /// Same contract as [`HeapAllocator::dealloc`] for non-null addresses,
    /// plus the no-move rule from the type docs.
    pub unsafe fn realloc(
        &self,
        address: Pointer<u8>,
        new_size: usize,
        old_size: usize,
    ) -> Pointer<u8> {
        if address.is_some() && new_size == old_size {
            return address;
        }

        let new_address = self.heap().realloc(address, new_size);

        if ERROR_ON_FAILURE && new_size != 0 && new_address.is_none() {
            panic!("fixed heap of {HEAP_SIZE} bytes exhausted by realloc({new_size})");
        }

        new_address
    }
}

impl<const HEAP_SIZE: usize, const ERROR_ON_FAILURE: bool> Default
    for HeapAllocator<HEAP_SIZE, ERROR_ON_FAILURE>
{
    fn default() -> Self {
        Self::new()
    }
}

/// [`HeapAllocator`] behind a [`Mutex`], which is what makes a fixed heap
/// usable as the global allocator: [`GlobalAlloc`] demands `Sync`, and the
/// heap itself must never be entered by two threads at once.
///
/// ```no_run
/// use fralloc::LockedHeapAllocator;
///
/// #[global_allocator]
/// static ALLOCATOR: LockedHeapAllocator<{ 16 * 1024 * 1024 }> =
///     LockedHeapAllocator::new();
///
/// fn main() {
///     let values = vec![1, 2, 3];
///     assert_eq!(values.len(), 3);
/// }
/// ```
///
/// Alignment requests above 16 are refused with a null return, the chunk
/// layout cannot satisfy them.
pub struct LockedHeapAllocator<const HEAP_SIZE: usize> {
    allocator: Mutex<HeapAllocator<HEAP_SIZE, false>>,
}

// The inner allocator is full of raw pointers and therefore not `Send`, but
// the pointers only ever reference the buffer living right next to them and
// the `Mutex` serialises every access, so handing the whole bundle to
// another thread is fine.
unsafe impl<const HEAP_SIZE: usize> Sync for LockedHeapAllocator<HEAP_SIZE> {}

impl<const HEAP_SIZE: usize> LockedHeapAllocator<HEAP_SIZE> {
    pub const fn new() -> Self {
        Self {
            allocator: Mutex::new(HeapAllocator::new()),
        }
    }
}

impl<const HEAP_SIZE: usize> Default for LockedHeapAllocator<HEAP_SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl<const HEAP_SIZE: usize> GlobalAlloc for LockedHeapAllocator<HEAP_SIZE> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALLOC_ALIGN {
            return ptr::null_mut();
        }

        match self.allocator.lock() {
            Ok(allocator) => allocator
                .alloc(layout.size())
                .map_or(ptr::null_mut(), NonNull::as_ptr),
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Ok(allocator) = self.allocator.lock() {
            allocator.dealloc(NonNull::new(ptr));
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALLOC_ALIGN {
            return ptr::null_mut();
        }

        match self.allocator.lock() {
            Ok(allocator) => allocator
                .realloc(NonNull::new(ptr), new_size, layout.size())
                .map_or(ptr::null_mut(), NonNull::as_ptr),
            Err(_) => ptr::null_mut(),
        }
    }
}

/// Implementation of the unstable [`std::alloc::Allocator`] trait, so the
/// fixed heap can back individual collections through the allocator API.
/// Only compiled with the `allocator-api` crate feature, which requires a
/// nightly toolchain.
#[cfg(feature = "allocator-api")]
mod allocator_api {
    use std::{
        alloc::{AllocError, Allocator, Layout},
        ptr,
        ptr::NonNull,
    };

    use super::HeapAllocator;
    use crate::{align::ALLOC_ALIGN, chunk::Chunk};

    /// The trait allows zero size allocations but the heap does not, so
    /// those become dangling, well aligned slices that are recognised and
    /// dropped on deallocation.
    fn dangling_slice(layout: Layout) -> NonNull<[u8]> {
        let address = unsafe { NonNull::new_unchecked(ptr::without_provenance_mut(layout.align())) };
        NonNull::slice_from_raw_parts(address, 0)
    }

    /// The payload the heap hands out is usually bigger than the request
    /// because of size rounding; report the real size back through the
    /// returned slice like the trait encourages.
    unsafe fn slice_for(address: NonNull<u8>) -> NonNull<[u8]> {
        let size = Chunk::from_payload_address(address).as_ref().size;
        NonNull::slice_from_raw_parts(address, size)
    }

    unsafe impl<const HEAP_SIZE: usize, const ERROR_ON_FAILURE: bool> Allocator
        for HeapAllocator<HEAP_SIZE, ERROR_ON_FAILURE>
    {
        fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
            if layout.align() > ALLOC_ALIGN {
                return Err(AllocError);
            }

            if layout.size() == 0 {
                return Ok(dangling_slice(layout));
            }

            unsafe {
                let address = self.alloc(layout.size()).ok_or(AllocError)?;
                Ok(slice_for(address))
            }
        }

        unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
            if layout.size() == 0 {
                return;
            }

            self.dealloc(Some(ptr));
        }

        unsafe fn grow(
            &self,
            ptr: NonNull<u8>,
            old_layout: Layout,
            new_layout: Layout,
        ) -> Result<NonNull<[u8]>, AllocError> {
            if new_layout.align() > ALLOC_ALIGN {
                return Err(AllocError);
            }

            if old_layout.size() == 0 {
                return self.allocate(new_layout);
            }

            let address = self
                .realloc(Some(ptr), new_layout.size(), old_layout.size())
                .ok_or(AllocError)?;

            Ok(slice_for(address))
        }

        unsafe fn shrink(
            &self,
            ptr: NonNull<u8>,
            old_layout: Layout,
            new_layout: Layout,
        ) -> Result<NonNull<[u8]>, AllocError> {
            if new_layout.align() > ALLOC_ALIGN {
                return Err(AllocError);
            }

            if new_layout.size() == 0 {
                self.deallocate(ptr, old_layout);
                return Ok(dangling_slice(new_layout));
            }

            let address = self
                .realloc(Some(ptr), new_layout.size(), old_layout.size())
                .ok_or(AllocError)?;

            Ok(slice_for(address))
        }
    }
}
