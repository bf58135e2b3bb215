use buddy_malloc::Allocator;

pub fn main() {
    env_logger::init();

    let matches = clap::App::new("buddy_malloc_cli")
        .version("0.1.0")
        .author("Isaac Woods")
        .about("Runs a scripted workload against buddy_malloc and dumps its statistics")
        .subcommand(clap::SubCommand::with_name("demo").about("Runs the built-in demonstration workload"))
        .get_matches();

    if matches.subcommand_matches("demo").is_some() || matches.subcommand_name().is_none() {
        run_demo();
    }
}

/// A small scripted workload touching every path the allocator exposes: a run
/// of buddy-path allocations and frees, an mmap-sized request, and a resize
/// that grows across orders.
fn run_demo() {
    let mut allocator = Allocator::new();

    log::info!("allocating four small blocks");
    let blocks: Vec<*mut u8> = [50usize, 100, 200, 400].iter().map(|&n| allocator.allocate(n)).collect();
    for (n, ptr) in [50usize, 100, 200, 400].iter().zip(&blocks) {
        if ptr.is_null() {
            log::warn!("allocate({n}) failed");
        }
    }
    print_stats(&allocator, "after four small allocations");

    log::info!("freeing them in reverse order");
    for &ptr in blocks.iter().rev() {
        unsafe { allocator.free(ptr) };
    }
    print_stats(&allocator, "after freeing all four");

    log::info!("allocating a block beyond the mmap threshold");
    let big = allocator.allocate(150 * 1024);
    print_stats(&allocator, "after one large mmap allocation");
    unsafe { allocator.free(big) };

    log::info!("growing a small block across several orders via resize");
    let mut ptr = allocator.allocate(50);
    for target in [80, 300, 1000] {
        ptr = unsafe { allocator.resize(ptr, target) };
        if ptr.is_null() {
            log::warn!("resize to {target} failed");
            break;
        }
    }
    print_stats(&allocator, "after growing one block to 1000 bytes");
    unsafe { allocator.free(ptr) };
}

fn print_stats(allocator: &Allocator, label: &str) {
    println!("-- {label} --");
    println!("  free blocks:      {}", allocator.num_free_blocks());
    println!("  free bytes:       {}", allocator.num_free_bytes());
    println!("  allocated blocks: {}", allocator.num_allocated_blocks());
    println!("  allocated bytes:  {}", allocator.num_allocated_bytes());
    println!("  metadata bytes:   {}", allocator.num_meta_data_bytes());
}
