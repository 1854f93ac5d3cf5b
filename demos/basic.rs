use regionalloc::{
    Allocator, AllocatorExt, FixedAllocator, HeapAllocator, HeapConfig, LinearAllocator, Result,
};

fn log_alloc(name: &str, size: usize, addr: *mut u8) {
    println!("[{name}] Requested {size} bytes of memory");
    println!("[{name}] Received this address: {addr:?}");
}

fn main() -> Result<()> {
    // Long lived blocks of one size.
    let mut fixed: FixedAllocator = FixedAllocator::new(0x1000, 64, 16)?;
    let a = fixed.allocate_default(64)?;
    log_alloc("fixed", 64, a.as_ptr());
    unsafe { fixed.deallocate(a) };
    println!("[fixed] {} of {} blocks available", fixed.available(), fixed.capacity());

    // Per frame scratch memory.
    let mut frame: LinearAllocator = LinearAllocator::new(0x10000)?;
    for index in 0..3 {
        frame.push_marker()?;
        let scratch = frame.allocate(100 * (index + 1), 8)?;
        log_alloc("linear", 100 * (index + 1), scratch.as_ptr());
        frame.pop_marker();
    }
    println!("[linear] offset after the frames: {}", frame.offset());

    // Anything else.
    let mut heap: HeapAllocator = HeapAllocator::new(HeapConfig {
        region_count: 2,
        ..HeapConfig::default()
    })?;

    for size in [8, 50, 300, 4000] {
        let pointer = heap.allocate_default(size)?;
        log_alloc("heap", size, pointer.as_ptr());

        if let Some(pool) = heap.pool_for_size(size, 16) {
            println!("[heap] served by the {} bytes pool", pool.object_size());
        }

        unsafe { heap.deallocate(pointer) };
    }

    let values = heap.construct_array::<u32>(16)?;
    unsafe { heap.destruct_array(values) };

    println!("[heap] {} idle regions", heap.free_list().len());

    Ok(())
}
