use std::alloc::Layout;
use std::ptr::NonNull;

use spanmalloc::Heap;

fn log_alloc(layout: Layout, addr: Option<NonNull<u8>>) {
    println!("Requested {} bytes of memory", layout.size());
    println!("Received this address: {addr:?}");
}

fn main() {
    env_logger::init();
    let heap = Heap::new();

    let l1 = Layout::new::<u64>();
    let addr1 = heap.allocate(l1.size());
    log_alloc(l1, addr1);

    let l2 = Layout::array::<u8>(8).unwrap();
    let addr2 = heap.allocate(l2.size());
    log_alloc(l2, addr2);

    let l3 = Layout::array::<u8>(16).unwrap();
    let addr3 = heap.allocate(l3.size());
    log_alloc(l3, addr3);

    let grown = heap.resize(addr3, 256);
    println!("Grew third block to 256 bytes: {grown:?}");

    heap.release(addr1);
    heap.release(addr2);
    heap.release(grown);
}
