use spanmalloc::Heap;

#[global_allocator]
static ALLOCATOR: Heap = Heap::new();

fn main() {
    env_logger::init();
    let mut v = Vec::with_capacity(64);
    v.extend(0..64u32);
    println!("sum via the global allocator: {}", v.iter().sum::<u32>());
}
