//! Print the referrer tree of one object in a heap dump.
//!
//! # Usage
//!
//! ```bash
//! reftree app.heapdump 0x1f4 --depth 4
//! ```

use clap::Parser;
use heapwatch::cli;
use heapwatch::heap::Heap;
use heapwatch::refbrowser::ReferrerTree;
use heapwatch::render;
use heapwatch::{ObjectId, Runtime};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "reftree")]
#[command(about = "Show what refers to an object in a heap dump")]
#[command(version)]
struct Args {
    /// Heap dump to inspect (.gz is decompressed)
    dump: PathBuf,

    /// Object id, decimal or 0x-prefixed hex
    #[arg(value_parser = parse_id)]
    id: u64,

    /// Maximum number of referrer levels
    #[arg(short, long, default_value = "3")]
    depth: usize,

    /// Show objects again each time they refer to something
    #[arg(long)]
    repeat: bool,
}

fn parse_id(s: &str) -> Result<u64, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    eprintln!("Loading dump: {}", args.dump.display());
    let dump = cli::open_dump(&args.dump)?;
    let root = ObjectId(args.id);
    let object = dump
        .resolve_object(args.id)
        .ok_or_else(|| format!("object {} is not in the dump", root))?;
    eprintln!(
        "  {} ({} bytes, {} referrers)",
        object.type_name,
        object
            .size
            .map_or_else(|| "unknown".to_string(), |s| s.to_string()),
        dump.referrers_of(args.id).len()
    );

    let mut heap = Heap::from_dump(&dump);

    let tree = ReferrerTree::new()
        .max_depth(args.depth)
        .repeat(args.repeat)
        .build(&mut heap, root);
    if !heap.contains(root) {
        return Err(format!("object {} is unreachable from the dump's roots", root).into());
    }
    eprintln!("{} nodes, root {}", tree.node_count(), heap.describe(root));

    print!("{}", render::format_tree(&tree, None));

    Ok(())
}

fn main() -> ExitCode {
    cli::init_logging();
    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
