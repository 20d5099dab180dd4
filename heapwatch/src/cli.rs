//! Helpers shared by the command line tools.

use heapdump::{HeapDump, ParseError};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Install the logger. The level comes from `RUST_LOG` and defaults to `warn`.
pub fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .format_timestamp(None)
        .init();
}

/// Whether `path` names a gzip-compressed dump.
pub fn is_gzip(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "gz")
}

/// Open and parse a heap dump. Files ending in `.gz` are decompressed.
pub fn open_dump(path: &Path) -> Result<HeapDump, ParseError> {
    let file = File::open(path)?;
    let reader: Box<dyn Read> = if is_gzip(path) {
        Box::new(flate2::read::GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    HeapDump::parse(BufReader::new(reader))
}
