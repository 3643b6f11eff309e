use fralloc::{HeapAllocator, Pointer};

fn print_alloc(address: Pointer<u8>, size: usize) {
    println!("Requested {size} bytes of memory");
    println!("Received this address: {address:?}");
}

fn main() {
    let allocator = HeapAllocator::<{ 64 * 1024 }>::new();

    unsafe {
        let addr1 = allocator.alloc(1);
        print_alloc(addr1, 1);

        let addr2 = allocator.alloc(1024);
        print_alloc(addr2, 1024);

        let addr3 = allocator.alloc(4096);
        print_alloc(addr3, 4096);

        println!("\nGrowing the second allocation in place if possible...");
        let grown = allocator.realloc(addr2, 2048, 1024);
        println!("Realloc of 2048 bytes: {grown:?}");

        println!("\nDeallocating everything...");
        allocator.dealloc(addr1);
        allocator.dealloc(grown);
        allocator.dealloc(addr3);

        println!("Exhausting the heap on purpose...");
        let too_big = allocator.alloc(128 * 1024);
        println!("Alloc of 128 KiB out of a 64 KiB heap: {too_big:?}");
    }
}
