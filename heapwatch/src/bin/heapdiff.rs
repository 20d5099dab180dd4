//! Compare two heap dumps to find memory leaks.
//!
//! This tool computes the per-type diff between two dumps of the same
//! process and outputs:
//! - Object types that grew or shrank (count and size deltas)
//! - Optionally, the individual objects that appeared or disappeared
//!
//! # Usage
//!
//! ```bash
//! heapdiff baseline.heapdump target.heapdump -o diff.ndjson
//! heapdiff baseline.heapdump target.heapdump --format table
//! ```

use clap::{Parser, ValueEnum};
use heapwatch::cli;
use heapwatch::diff;
use heapwatch::heap::Heap;
use heapwatch::render::{self, SummaryOptions};
use heapwatch::summary;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    Table,
    Ndjson,
}

#[derive(Parser, Debug)]
#[command(name = "heapdiff")]
#[command(about = "Compare heap dumps to find memory leaks")]
#[command(version)]
struct Args {
    /// Baseline heap dump (before the leak)
    baseline: PathBuf,

    /// Target heap dump (after the leak)
    target: PathBuf,

    /// Output file (defaults to stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "ndjson")]
    format: Format,

    /// Report up to this many added and removed objects (ndjson only)
    #[arg(short = 'n', long, default_value = "0")]
    objects: usize,

    /// Drop objects unreachable from each dump's roots first
    #[arg(long)]
    collect: bool,
}

fn load(path: &Path, collect: bool) -> Result<Heap, Box<dyn std::error::Error>> {
    let dump = cli::open_dump(path)?;
    let mut heap = Heap::from_dump(&dump);
    eprintln!("  {} objects, {} roots", dump.objects.len(), dump.roots.len());
    if collect {
        eprintln!("  collected {} unreachable objects", heap.collect());
    }
    Ok(heap)
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    eprintln!("Loading baseline: {}", args.baseline.display());
    let baseline = load(&args.baseline, args.collect)?;

    eprintln!("Loading target: {}", args.target.display());
    let target = load(&args.target, args.collect)?;

    eprintln!("Computing diff...");
    let before = heapwatch::census::objects(&baseline, true);
    let after = heapwatch::census::objects(&target, true);
    let rows = summary::sweep(summary::diff_summaries(
        &summary::summarize(&baseline, &before),
        &summary::summarize(&target, &after),
    ));

    let objects = (args.objects > 0).then(|| {
        let mut objects = diff::diff_objects_across(&baseline, &before, &target, &after);
        objects.added.truncate(args.objects);
        objects.removed.truncate(args.objects);
        objects
    });

    eprintln!(
        "Found {} changed types, {:+} objects, {:+} bytes",
        rows.len(),
        rows.total_count(),
        rows.total_size()
    );

    let mut writer: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(std::io::stdout()),
    };
    match args.format {
        Format::Table => {
            let options = SummaryOptions {
                limit: usize::MAX,
                ..SummaryOptions::default()
            };
            write!(writer, "{}", render::format_summary(&rows, &options))?
        }
        Format::Ndjson => render::write_diff_ndjson(
            &mut writer,
            &rows,
            objects.as_ref(),
            args.baseline.to_str().unwrap_or("baseline"),
            args.target.to_str().unwrap_or("target"),
        )?,
    }
    writer.flush()?;

    if let Some(path) = &args.output {
        eprintln!("Wrote diff to {}", path.display());
    }

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
