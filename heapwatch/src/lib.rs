//! Memory usage inspection for managed heaps.
//!
//! heapwatch answers "what is in my heap, what changed, and what keeps this
//! object alive" for any runtime that implements [`Runtime`].
//!
//! # Modules
//!
//! - [`census`] - Enumerate live objects, filter them and total their sizes
//! - [`summary`] - Group a census into per-type rows, diff and sweep summaries
//! - [`diff`] - Identity-level diff of two censuses
//! - [`tracker`] - Diff snapshots over time without counting its own bookkeeping
//! - [`refbrowser`] - Build referrer trees for leak diagnosis
//! - [`render`] - Summary tables, ASCII trees and NDJSON output
//! - [`cli`] - Logging setup and dump loading for the command line tools
//! - [`heap`] - An arena heap implementing the runtime traits, loadable from
//!   [`heapdump`] files
//!
//! # Example
//!
//! ```no_run
//! use heapwatch::heap::Heap;
//! use heapwatch::render::{format_summary, SummaryOptions};
//! use heapwatch::{census, summary};
//! use std::fs::File;
//!
//! let dump = heapdump::HeapDump::parse(File::open("app.heapdump").unwrap()).unwrap();
//! let heap = Heap::from_dump(&dump);
//!
//! let rows = summary::summarize(&heap, &census::objects(&heap, true));
//! print!("{}", format_summary(&rows, &SummaryOptions::default()));
//! ```

pub mod census;
pub mod cli;
pub mod diff;
pub mod heap;
pub mod refbrowser;
pub mod render;
pub mod runtime;
pub mod summary;
pub mod tracker;

pub use heapdump;
pub use runtime::{CapabilityError, ManagedHeap, ObjectId, Runtime, TypeKey};
pub use summary::{Diff, Row, Summary};
pub use tracker::{Tracker, TrackerConfig};
