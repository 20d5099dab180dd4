//! Change tracking between heap snapshots.
//!
//! A [`Tracker`] takes a snapshot when it is created and every time
//! [`Tracker::diff`] is called, so each diff shows what changed since the
//! previous call. Snapshots can also be archived under a key with
//! [`Tracker::store`] and compared later.
//!
//! # Bookkeeping and self-exclusion
//!
//! Stored snapshots live inside the inspected heap: the baseline and every
//! archive entry are materialized as a snapshot container, one row object per
//! summary row and one type-name object per row, and archive entries hang off
//! an archive container together with a key object. Left alone, these objects
//! would show up as growth in every diff.
//!
//! With [`TrackerConfig::ignore_self`] enabled the tracker records every
//! handle it materialized and drops them from each new census. A handle is
//! only dropped while all of its referrers are tracker objects too and it has
//! no root handles beyond the tracker's own: once the application refers to
//! or roots a stored snapshot, that object is counted like any other
//! application object.
//!
//! Each ignoring snapshot forces a full collection first, so bookkeeping
//! released by earlier calls does not linger as garbage. The collection is
//! process-wide and visible to every other observer of the heap. The walk
//! over the bookkeeping is proportional to the total size of all archived
//! snapshots; keep the archive small.

use crate::census;
use crate::runtime::{CapabilityError, ManagedHeap, ObjectId, TypeKey};
use crate::summary::{self, Diff, Summary};
use log::debug;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Type of the materialized snapshot container.
pub const SNAPSHOT_TYPE: &str = "heapwatch.Snapshot";
/// Type of one materialized summary row.
pub const ROW_TYPE: &str = "heapwatch.SummaryRow";
/// Type of the type-name string held by each row.
pub const TYPE_NAME_TYPE: &str = "heapwatch.TypeName";
/// Type of the archive container.
pub const ARCHIVE_TYPE: &str = "heapwatch.Archive";
/// Type of an archive key string.
pub const KEY_TYPE: &str = "heapwatch.ArchiveKey";

const CONTAINER_HEADER_SIZE: u64 = 56;
const SLOT_SIZE: u64 = 8;
const ROW_SIZE: u64 = 64;
const STRING_HEADER_SIZE: u64 = 49;

/// Errors raised by tracker operations.
#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("heap rejected tracker bookkeeping: {0}")]
    Capability(#[from] CapabilityError),
}

pub type Result<T> = std::result::Result<T, TrackerError>;

/// Configuration for a [`Tracker`].
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Exclude the tracker's own bookkeeping objects from snapshots.
    pub ignore_self: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self { ignore_self: true }
    }
}

/// A summary together with the heap objects materialized for it.
#[derive(Debug, Clone)]
struct StoredSnapshot {
    summary: Summary,
    /// The snapshot container.
    handle: ObjectId,
    /// Every materialized object, `handle` first.
    owned: Vec<ObjectId>,
}

#[derive(Debug, Clone)]
struct ArchiveEntry {
    key_handle: ObjectId,
    snapshot: StoredSnapshot,
}

/// Tracker-owned handles mapped to the number of root handles the tracker
/// itself holds on each.
type Owned = HashMap<ObjectId, usize>;

fn string_size(s: &str) -> u64 {
    STRING_HEADER_SIZE + s.len() as u64
}

/// Write `summary` into the heap. The container is returned unreferenced and
/// unrooted; the caller links it in.
fn materialize<H: ManagedHeap + ?Sized>(heap: &mut H, summary: Summary) -> Result<StoredSnapshot> {
    let handle = heap.allocate(
        TypeKey::from(SNAPSHOT_TYPE),
        CONTAINER_HEADER_SIZE + SLOT_SIZE * summary.len() as u64,
        true,
    );
    let mut owned = Vec::with_capacity(1 + 2 * summary.len());
    owned.push(handle);

    for row in &summary {
        let row_handle = heap.allocate(TypeKey::from(ROW_TYPE), ROW_SIZE, true);
        let name_handle = heap.allocate(
            TypeKey::from(TYPE_NAME_TYPE),
            string_size(row.type_key.as_str()),
            false,
        );
        heap.add_reference(handle, row_handle)?;
        heap.add_reference(row_handle, name_handle)?;
        owned.push(row_handle);
        owned.push(name_handle);
    }

    Ok(StoredSnapshot {
        summary,
        handle,
        owned,
    })
}

/// Tracks heap changes between snapshots.
///
/// The tracker takes the heap by `&mut` on every call and must always be used
/// with the heap it was created on.
#[derive(Debug)]
pub struct Tracker {
    config: TrackerConfig,
    baseline: StoredSnapshot,
    archive: HashMap<String, ArchiveEntry>,
    archive_handle: ObjectId,
}

impl Tracker {
    /// Create a tracker and take its first baseline snapshot.
    pub fn new<H: ManagedHeap + ?Sized>(heap: &mut H, config: TrackerConfig) -> Result<Self> {
        let archive_handle = heap.allocate(TypeKey::from(ARCHIVE_TYPE), CONTAINER_HEADER_SIZE, true);
        heap.add_root(archive_handle)?;

        let owned = Owned::from([(archive_handle, 1)]);
        let summary = if config.ignore_self {
            snapshot_excluding(heap, &owned)
        } else {
            plain_snapshot(&*heap)
        };

        let baseline = materialize(heap, summary)?;
        heap.add_root(baseline.handle)?;

        Ok(Self {
            config,
            baseline,
            archive: HashMap::new(),
            archive_handle,
        })
    }

    pub fn ignores_self(&self) -> bool {
        self.config.ignore_self
    }

    /// The snapshot the next parameterless [`diff`](Self::diff) compares against.
    pub fn baseline(&self) -> &Summary {
        &self.baseline.summary
    }

    /// Take a snapshot of the heap.
    ///
    /// Without `ignore_self` this is a plain summary of a census. With it, a
    /// collection is forced and the tracker's bookkeeping is removed from the
    /// census before summarizing.
    pub fn make_snapshot<H: ManagedHeap + ?Sized>(&self, heap: &mut H) -> Summary {
        if !self.config.ignore_self {
            return plain_snapshot(&*heap);
        }
        let owned = self.bookkeeping();
        snapshot_excluding(heap, &owned)
    }

    /// Every heap object the tracker currently owns.
    pub fn owned_objects(&self) -> Vec<ObjectId> {
        let mut owned: Vec<ObjectId> = self.bookkeeping().into_keys().collect();
        owned.sort_unstable();
        owned
    }

    /// Walk the bookkeeping structures. The archive container and the
    /// baseline container are rooted once by the tracker; everything else is
    /// held through references only.
    fn bookkeeping(&self) -> Owned {
        let mut owned = Owned::new();
        owned.insert(self.archive_handle, 1);
        for entry in self.archive.values() {
            owned.insert(entry.key_handle, 0);
            owned.extend(entry.snapshot.owned.iter().map(|&id| (id, 0)));
        }
        owned.extend(self.baseline.owned.iter().map(|&id| (id, 0)));
        owned.insert(self.baseline.handle, 1);

        debug!(
            "tracker bookkeeping: {} archived snapshots, {} objects",
            self.archive.len(),
            owned.len()
        );

        owned
    }

    /// Compute a swept diff between snapshots.
    ///
    /// - no snapshots: the baseline against a fresh snapshot;
    /// - only `snapshot_a`: `snapshot_a` against a fresh snapshot;
    /// - both: `snapshot_a` against `snapshot_b`.
    ///
    /// Whenever a fresh snapshot is taken it becomes the new baseline.
    /// Passing `snapshot_b` without `snapshot_a` is an error.
    pub fn diff<H: ManagedHeap + ?Sized>(
        &mut self,
        heap: &mut H,
        snapshot_a: Option<&Summary>,
        snapshot_b: Option<&Summary>,
    ) -> Result<Diff> {
        let diff = match (snapshot_a, snapshot_b) {
            (None, Some(_)) => {
                return Err(TrackerError::InvalidArgument(
                    "snapshot_b cannot be given without snapshot_a".to_string(),
                ));
            }
            (Some(a), Some(b)) => summary::diff_summaries(a, b),
            (a, None) => {
                let fresh = self.make_snapshot(heap);
                let diff = summary::diff_summaries(a.unwrap_or(&self.baseline.summary), &fresh);
                self.replace_baseline(heap, fresh)?;
                diff
            }
        };

        Ok(summary::sweep(diff))
    }

    fn replace_baseline<H: ManagedHeap + ?Sized>(&mut self, heap: &mut H, summary: Summary) -> Result<()> {
        let baseline = materialize(heap, summary)?;
        heap.add_root(baseline.handle)?;
        let old = std::mem::replace(&mut self.baseline, baseline);
        heap.remove_root(old.handle);
        Ok(())
    }

    /// Take a snapshot and archive it under `key`, replacing any snapshot
    /// stored under the same key.
    pub fn store<H: ManagedHeap + ?Sized>(&mut self, heap: &mut H, key: impl Into<String>) -> Result<()> {
        let key = key.into();
        let fresh = self.make_snapshot(heap);
        let snapshot = materialize(heap, fresh)?;

        let key_handle = heap.allocate(TypeKey::from(KEY_TYPE), string_size(&key), false);
        heap.add_reference(self.archive_handle, key_handle)?;
        heap.add_reference(self.archive_handle, snapshot.handle)?;

        debug!("archived snapshot '{}' ({} rows)", key, snapshot.summary.len());
        if let Some(old) = self.archive.insert(
            key,
            ArchiveEntry {
                key_handle,
                snapshot,
            },
        ) {
            self.unlink(heap, &old);
        }

        Ok(())
    }

    /// Remove the snapshot archived under `key`.
    ///
    /// Deleting a key that is not archived is a no-op; the return value tells
    /// whether anything was removed.
    pub fn delete<H: ManagedHeap + ?Sized>(&mut self, heap: &mut H, key: &str) -> bool {
        match self.archive.remove(key) {
            Some(entry) => {
                self.unlink(heap, &entry);
                true
            }
            None => false,
        }
    }

    fn unlink<H: ManagedHeap + ?Sized>(&self, heap: &mut H, entry: &ArchiveEntry) {
        heap.remove_reference(self.archive_handle, entry.key_handle);
        heap.remove_reference(self.archive_handle, entry.snapshot.handle);
    }

    /// The snapshot archived under `key`.
    pub fn archived(&self, key: &str) -> Option<&Summary> {
        self.archive.get(key).map(|e| &e.snapshot.summary)
    }

    /// Archived keys in ascending order.
    pub fn archived_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.archive.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    /// Heap handle of the snapshot container archived under `key`.
    ///
    /// Applications that keep a reference to this object keep the snapshot
    /// container counted in later snapshots.
    pub fn snapshot_handle(&self, key: &str) -> Option<ObjectId> {
        self.archive.get(key).map(|e| e.snapshot.handle)
    }
}

fn plain_snapshot<H: ManagedHeap + ?Sized>(heap: &H) -> Summary {
    summary::summarize(heap, &census::objects(heap, true))
}

/// Collect, then summarize a census without the owned objects that are held
/// by the tracker alone: every referrer is owned and no root handle exists
/// beyond the ones the tracker holds.
fn snapshot_excluding<H: ManagedHeap + ?Sized>(heap: &mut H, owned: &Owned) -> Summary {
    heap.force_collection();

    let excluded: HashSet<ObjectId> = owned
        .iter()
        .filter(|&(&id, _)| heap.type_of(id).is_ok())
        .filter(|&(&id, &roots)| heap.root_count(id) <= roots)
        .filter(|&(&id, _)| heap.referrers_of(id).iter().all(|r| owned.contains_key(r)))
        .map(|(&id, _)| id)
        .collect();

    let mut census = census::objects(&*heap, true);
    let before = census.len();
    census.retain(|id| !excluded.contains(&id));
    debug!(
        "snapshot: excluded {} of {} owned objects from a census of {}",
        before - census.len(),
        owned.len(),
        before
    );

    summary::summarize(&*heap, &census)
}
