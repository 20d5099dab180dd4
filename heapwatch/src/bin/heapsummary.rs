//! Summarize the objects in a heap dump by type.
//!
//! # Usage
//!
//! ```bash
//! heapsummary app.heapdump --sort count --limit 20
//! heapsummary app.heapdump.gz --format ndjson -o summary.ndjson
//! ```

use clap::{Parser, ValueEnum};
use heapwatch::census::{self, Filter};
use heapwatch::cli;
use heapwatch::heap::Heap;
use heapwatch::render::{self, Order, SortBy, SummaryOptions};
use heapwatch::summary;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    Table,
    Ndjson,
}

#[derive(Parser, Debug)]
#[command(name = "heapsummary")]
#[command(about = "Summarize heap dump objects by type")]
#[command(version)]
struct Args {
    /// Heap dump to summarize (.gz is decompressed)
    dump: PathBuf,

    /// Sort rows by type, count or size
    #[arg(short, long, default_value = "size")]
    sort: String,

    /// Sort order: ascending or descending
    #[arg(long, default_value = "descending")]
    order: String,

    /// Maximum number of table rows
    #[arg(short = 'n', long, default_value = "15")]
    limit: usize,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    format: Format,

    /// Only count objects of this type
    #[arg(long = "type")]
    type_name: Option<String>,

    /// Only count objects at least this many bytes large
    #[arg(long)]
    min_size: Option<u64>,

    /// Only count objects at most this many bytes large
    #[arg(long)]
    max_size: Option<u64>,

    /// Drop objects unreachable from the dump's roots first
    #[arg(long)]
    collect: bool,

    /// Output file (defaults to stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let options = SummaryOptions {
        limit: args.limit,
        sort: args.sort.parse::<SortBy>()?,
        order: args.order.parse::<Order>()?,
    };

    eprintln!("Loading dump: {}", args.dump.display());
    let dump = cli::open_dump(&args.dump)?;
    let mut heap = Heap::from_dump(&dump);
    eprintln!("  {} objects, {} roots", dump.objects.len(), dump.roots.len());

    if args.collect {
        let reclaimed = heap.collect();
        eprintln!("  collected {} unreachable objects", reclaimed);
    }

    let mut objects = census::objects(&heap, true);
    if args.type_name.is_some() || args.min_size.is_some() || args.max_size.is_some() {
        let filter = Filter {
            type_key: args.type_name.map(Into::into),
            min_size: args.min_size,
            max_size: args.max_size,
        };
        objects = census::filter(&heap, objects.as_slice(), &filter)?.into_iter().collect();
    }
    eprintln!(
        "Census: {} objects, {} bytes",
        objects.len(),
        census::total_size(&heap, objects.as_slice())
    );

    let rows = summary::summarize(&heap, &objects);

    let mut writer: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(std::io::stdout()),
    };
    match args.format {
        Format::Table => write!(writer, "{}", render::format_summary(&rows, &options))?,
        Format::Ndjson => {
            let source = args.dump.to_str().unwrap_or("dump");
            render::write_summary_ndjson(&mut writer, &rows, source)?
        }
    }
    writer.flush()?;

    if let Some(path) = &args.output {
        eprintln!("Wrote summary to {}", path.display());
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
