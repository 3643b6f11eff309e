use fralloc::LockedHeapAllocator;

const HEAP_SIZE: usize = 16 * 1024 * 1024;

// Every allocation the program makes, including the ones the runtime does
// before `main`, comes out of this fixed 16 MiB buffer. Nothing is ever
// requested from the operating system.
#[global_allocator]
static ALLOCATOR: LockedHeapAllocator<HEAP_SIZE> = LockedHeapAllocator::new();

const BLOCK: usize = 1024 * 1024;

fn main() {
    println!(
        "Running against a fixed {} MiB heap that never grows.",
        HEAP_SIZE >> 20
    );

    // Far below the ceiling, collections behave like they would on the
    // platform allocator.
    let greeting = "every chunk is carved out of the static buffer".to_uppercase();
    println!("{greeting}");

    // Now walk straight into the ceiling: keep taking 1 MiB blocks until
    // the region runs dry. `try_reserve` surfaces the allocator's null
    // instead of aborting the process.
    let mut blocks: Vec<Vec<u8>> = Vec::new();
    loop {
        let mut block: Vec<u8> = Vec::new();
        if block.try_reserve_exact(BLOCK).is_err() {
            break;
        }
        block.resize(BLOCK, 0xAB);
        blocks.push(block);
    }
    println!(
        "Exhausted after {} x 1 MiB blocks; the next one failed instead of growing the heap.",
        blocks.len()
    );

    // Dropping the blocks coalesces the region back into one big free
    // chunk, so a large allocation fits again.
    let count = blocks.len();
    drop(blocks);

    let mut big: Vec<u8> = Vec::new();
    match big.try_reserve_exact(count.saturating_sub(1) * BLOCK) {
        Ok(()) => {
            big.resize(big.capacity(), 0x42);
            println!(
                "After freeing, a {} MiB allocation fits again at {:?}.",
                big.capacity() >> 20,
                big.as_ptr()
            );
        }
        Err(error) => println!("Large allocation still failing: {error}."),
    }
}
