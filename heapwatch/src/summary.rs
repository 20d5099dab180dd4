//! Per-type aggregation of a census and summary arithmetic.
//!
//! A [`Summary`] keeps one row per [`TypeKey`]: how many objects of that type
//! were seen and how many bytes they occupy. Summaries are much smaller than
//! the census they come from and hold no handles, so keeping them around does
//! not keep the inspected objects alive.
//!
//! The same row shape represents a diff: [`diff_summaries`] yields signed
//! deltas and [`sweep`] drops the rows that did not change.

use crate::census::Census;
use crate::runtime::{CapabilityError, ObjectId, Runtime, TypeKey};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// One summary row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Row {
    pub type_key: TypeKey,
    pub count: i64,
    pub total_size: i64,
}

impl Row {
    pub fn new(type_key: impl Into<TypeKey>, count: i64, total_size: i64) -> Self {
        Self {
            type_key: type_key.into(),
            count,
            total_size,
        }
    }

    /// Whether both count and size are zero.
    pub fn is_zero(&self) -> bool {
        self.count == 0 && self.total_size == 0
    }

    fn negated(&self) -> Self {
        Self {
            type_key: self.type_key.clone(),
            count: self.count.saturating_neg(),
            total_size: self.total_size.saturating_neg(),
        }
    }
}

/// Per-type aggregate of a census. Row order carries no meaning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Summary {
    rows: Vec<Row>,
}

/// A summary holding `right - left` deltas.
pub type Diff = Summary;

impl Summary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a summary from rows. Callers guarantee one row per key.
    pub fn from_rows(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Row> {
        self.rows.iter()
    }

    pub fn get(&self, type_key: &TypeKey) -> Option<&Row> {
        self.rows.iter().find(|r| r.type_key == *type_key)
    }

    /// Sum of all row counts.
    pub fn total_count(&self) -> i64 {
        self.rows.iter().map(|r| r.count).sum()
    }

    /// Sum of all row sizes.
    pub fn total_size(&self) -> i64 {
        self.rows.iter().map(|r| r.total_size).sum()
    }

    /// Remove one object of `type_key` and `size` bytes from the summary.
    ///
    /// If no row for the type exists a negative row is added. Sizes beyond
    /// `i64::MAX` saturate.
    pub fn subtract(&mut self, type_key: &TypeKey, size: u64) {
        let size = i64::try_from(size).unwrap_or(i64::MAX);
        match self.rows.iter_mut().find(|r| r.type_key == *type_key) {
            Some(row) => {
                row.count -= 1;
                row.total_size = row.total_size.saturating_sub(size);
            }
            None => self.rows.push(Row::new(type_key.clone(), -1, -size)),
        }
    }

    /// Remove `id`'s contribution, resolving its type and size through `rt`.
    pub fn subtract_object<R: Runtime + ?Sized>(
        &mut self,
        rt: &R,
        id: ObjectId,
    ) -> Result<(), CapabilityError> {
        let type_key = rt.type_of(id)?;
        let size = rt.size_of(id)?;
        self.subtract(&type_key, size);
        Ok(())
    }
}

impl<'a> IntoIterator for &'a Summary {
    type Item = &'a Row;
    type IntoIter = std::slice::Iter<'a, Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

impl FromIterator<Row> for Summary {
    fn from_iter<I: IntoIterator<Item = Row>>(iter: I) -> Self {
        Summary {
            rows: iter.into_iter().collect(),
        }
    }
}

/// Summarize a census by runtime type.
pub fn summarize<R: Runtime + ?Sized>(rt: &R, census: &Census) -> Summary {
    summarize_with(rt, census, |id| rt.type_of(id))
}

/// Summarize a census, grouping objects by `classify`.
///
/// Objects whose class or size is unavailable are skipped with a warning, as
/// are sizes too large for a row. Row totals saturate at `i64::MAX`.
pub fn summarize_with<R, F>(rt: &R, census: &Census, mut classify: F) -> Summary
where
    R: Runtime + ?Sized,
    F: FnMut(ObjectId) -> Result<TypeKey, CapabilityError>,
{
    let mut index: HashMap<TypeKey, usize> = HashMap::new();
    let mut rows: Vec<Row> = Vec::new();

    for id in census.iter() {
        let classified = classify(id).and_then(|t| rt.size_of(id).map(|size| (t, size)));
        let (type_key, size) = match classified {
            Ok(pair) => pair,
            Err(e) => {
                warn!("ignoring object in summary: {}", e);
                continue;
            }
        };

        let Ok(size) = i64::try_from(size) else {
            warn!("ignoring object in summary: size of {} ({} bytes) out of range", id, size);
            continue;
        };

        match index.get(&type_key) {
            Some(&pos) => {
                let row = &mut rows[pos];
                row.count += 1;
                row.total_size = row.total_size.saturating_add(size);
            }
            None => {
                index.insert(type_key.clone(), rows.len());
                rows.push(Row::new(type_key, 1, size));
            }
        }
    }

    Summary::from_rows(rows)
}

/// Compute `right - left` row by row.
///
/// Rows present on both sides give their difference, rows only in `right`
/// are copied and rows only in `left` are negated. Unchanged rows are kept
/// with zero values; use [`sweep`] to drop them. Each side must hold at most
/// one row per type key.
pub fn diff_summaries(left: &Summary, right: &Summary) -> Diff {
    let left_index: HashMap<&TypeKey, &Row> = left.iter().map(|r| (&r.type_key, r)).collect();
    let right_keys: HashSet<&TypeKey> = right.iter().map(|r| &r.type_key).collect();

    let mut rows: Vec<Row> = Vec::with_capacity(left.len().max(right.len()));

    for row_r in right {
        match left_index.get(&row_r.type_key) {
            Some(row_l) => rows.push(Row::new(
                row_r.type_key.clone(),
                row_r.count - row_l.count,
                row_r.total_size.saturating_sub(row_l.total_size),
            )),
            None => rows.push(row_r.clone()),
        }
    }

    for row_l in left {
        if !right_keys.contains(&row_l.type_key) {
            rows.push(row_l.negated());
        }
    }

    Summary::from_rows(rows)
}

/// Drop rows whose count and size are both zero.
pub fn sweep(diff: Diff) -> Diff {
    diff.into_rows().into_iter().filter(|r| !r.is_zero()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;
    use proptest::prelude::*;

    fn row(key: &str, count: i64, size: i64) -> Row {
        Row::new(key, count, size)
    }

    fn sorted(summary: Summary) -> Vec<Row> {
        let mut rows = summary.into_rows();
        rows.sort_by(|a, b| a.type_key.cmp(&b.type_key));
        rows
    }

    #[test]
    fn summarize_golden_fixture() {
        // [1, "a", "b", 4, 5]
        let mut heap = Heap::new();
        let sizes = [("int", 28u64), ("str", 50), ("str", 50), ("int", 28), ("int", 32)];
        let census: Census = sizes
            .iter()
            .map(|(t, size)| heap.alloc_leaf(*t, *size))
            .collect();

        let summary = summarize(&heap, &census);

        assert_eq!(summary.len(), 2);
        assert_eq!(summary.get(&"int".into()), Some(&row("int", 3, 88)));
        assert_eq!(summary.get(&"str".into()), Some(&row("str", 2, 100)));
        assert_eq!(summary.total_count(), 5);
    }

    #[test]
    fn summarize_empty_census() {
        let heap = Heap::new();
        let summary = summarize(&heap, &Census::default());
        assert!(summary.is_empty());
    }

    #[test]
    fn summarize_skips_unsized_objects() {
        let mut heap = Heap::new();
        let census: Census = vec![heap.alloc("list", 56), heap.alloc_unsized("opaque")]
            .into_iter()
            .collect();

        let summary = summarize(&heap, &census);

        assert_eq!(summary.rows(), &[row("list", 1, 56)]);
    }

    #[test]
    fn summarize_skips_out_of_range_sizes() {
        let mut heap = Heap::new();
        let census: Census = vec![heap.alloc("blob", u64::MAX), heap.alloc("blob", 64)]
            .into_iter()
            .collect();

        let summary = summarize(&heap, &census);

        assert_eq!(summary.rows(), &[row("blob", 1, 64)]);
    }

    #[test]
    fn dump_sizes_beyond_i64_are_skipped() {
        let data = concat!(
            r#"{"type":"header","format":"heapdump","version":"1.0","runtime":"test"}"#,
            "\n",
            r#"{"type":"object","id":1,"type_name":"blob","size":18446744073709551615}"#,
            "\n",
        );
        let dump = heapdump::HeapDump::parse(data.as_bytes()).unwrap();
        let heap = Heap::from_dump(&dump);

        let summary = summarize(&heap, &crate::census::objects(&heap, true));

        assert!(summary.is_empty());
    }

    #[test]
    fn summarize_saturates_large_totals() {
        let mut heap = Heap::new();
        let max = i64::MAX as u64;
        let census: Census = vec![heap.alloc("blob", max), heap.alloc("blob", max)]
            .into_iter()
            .collect();

        let summary = summarize(&heap, &census);

        assert_eq!(summary.rows(), &[row("blob", 2, i64::MAX)]);
        let diff = diff_summaries(&summary, &Summary::new());
        assert_eq!(diff.rows(), &[row("blob", -2, -i64::MAX)]);
    }

    #[test]
    fn summarize_with_custom_classifier() {
        let mut heap = Heap::new();
        let census: Census = [10u64, 200, 30, 400]
            .into_iter()
            .map(|size| heap.alloc("bytes", size))
            .collect();

        let summary = summarize_with(&heap, &census, |id| {
            let size = heap.size_of(id)?;
            Ok(if size >= 100 { "large" } else { "small" }.into())
        });

        assert_eq!(
            sorted(summary),
            vec![row("large", 2, 600), row("small", 2, 40)]
        );
    }

    #[test]
    fn diff_matches_and_negates() {
        let left = Summary::from_rows(vec![row("int", 4, 96), row("dict", 2, 512)]);
        let right = Summary::from_rows(vec![row("int", 6, 144), row("list", 1, 40)]);

        let diff = diff_summaries(&left, &right);

        assert_eq!(
            sorted(diff),
            vec![row("dict", -2, -512), row("int", 2, 48), row("list", 1, 40)]
        );
    }

    #[test]
    fn diff_keeps_zero_rows_until_swept() {
        let left = Summary::from_rows(vec![row("str", 3, 126), row("int", 1, 28)]);
        let right = Summary::from_rows(vec![row("str", 3, 126), row("int", 1, 32)]);

        let diff = diff_summaries(&left, &right);
        assert_eq!(diff.len(), 2);

        let swept = sweep(diff);
        assert_eq!(swept.rows(), &[row("int", 0, 4)]);
    }

    #[test]
    fn subtract_existing_and_missing_rows() {
        let mut summary = Summary::from_rows(vec![row("list", 3, 168)]);

        summary.subtract(&"list".into(), 56);
        summary.subtract(&"tuple".into(), 48);

        assert_eq!(
            sorted(summary),
            vec![row("list", 2, 112), row("tuple", -1, -48)]
        );
    }

    #[test]
    fn subtract_saturates_large_sizes() {
        let mut summary = Summary::from_rows(vec![row("blob", 1, 10)]);

        summary.subtract(&"blob".into(), u64::MAX);

        assert_eq!(summary.rows(), &[row("blob", 0, 10 - i64::MAX)]);
    }

    #[test]
    fn subtract_object_resolves_through_runtime() {
        let mut heap = Heap::new();
        let id = heap.alloc("list", 56);
        let mut summary = Summary::from_rows(vec![row("list", 1, 56)]);

        summary.subtract_object(&heap, id).unwrap();

        assert!(sweep(summary).is_empty());
    }

    fn arb_summary() -> impl Strategy<Value = Summary> {
        prop::collection::hash_map("[a-e]", (0i64..50, 0i64..5000), 0..5).prop_map(|m| {
            m.into_iter()
                .map(|(k, (count, size))| Row::new(k, count, size))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn summarize_counts_every_object(sizes in prop::collection::vec((0usize..4, 1u64..512), 0..64)) {
            let types = ["int", "str", "list", "dict"];
            let mut heap = Heap::new();
            let census: Census = sizes
                .iter()
                .map(|(t, size)| heap.alloc(types[*t], *size))
                .collect();

            let summary = summarize(&heap, &census);

            let mut keys: Vec<&TypeKey> = summary.iter().map(|r| &r.type_key).collect();
            keys.sort();
            keys.dedup();
            prop_assert_eq!(keys.len(), summary.len());
            prop_assert_eq!(summary.total_count(), census.len() as i64);
            prop_assert_eq!(summary.total_size(), sizes.iter().map(|(_, s)| *s as i64).sum::<i64>());
        }

        #[test]
        fn diff_with_self_sweeps_to_empty(a in arb_summary()) {
            prop_assert!(sweep(diff_summaries(&a, &a)).is_empty());
        }

        #[test]
        fn diff_counts_sum_to_total_delta(a in arb_summary(), b in arb_summary()) {
            let diff = diff_summaries(&a, &b);
            prop_assert_eq!(diff.total_count(), b.total_count() - a.total_count());
            prop_assert_eq!(diff.total_size(), b.total_size() - a.total_size());
        }

        #[test]
        fn sweep_is_idempotent(a in arb_summary(), b in arb_summary()) {
            let once = sweep(diff_summaries(&a, &b));
            let twice = sweep(once.clone());
            prop_assert_eq!(once, twice);
        }
    }
}
