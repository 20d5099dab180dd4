//! Identity-level difference between two censuses.

use crate::census::Census;
use crate::runtime::{ObjectId, Runtime, TypeKey};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// Objects that appeared and disappeared between two censuses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ObjectDiff {
    /// Objects in the right census missing from the left one.
    pub added: Vec<ObjectId>,
    /// Objects in the left census missing from the right one.
    pub removed: Vec<ObjectId>,
}

impl ObjectDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Census bucketed by type. Objects with no type share the `None` bucket.
type Buckets = HashMap<Option<TypeKey>, HashSet<ObjectId>>;

fn bucket<R: Runtime + ?Sized>(rt: &R, census: &Census) -> Buckets {
    let mut buckets: Buckets = HashMap::new();
    for id in census.iter() {
        buckets.entry(rt.type_of(id).ok()).or_default().insert(id);
    }
    buckets
}

/// Objects only in `right` (added) and only in `left` (removed).
///
/// Both sides are partitioned by type first, so identity comparisons only
/// happen between objects of the same type. Types must be resolved through
/// `rt` while both censuses are still meaningful; objects freed since the
/// left census was taken land in the untyped bucket.
pub fn diff_objects<R: Runtime + ?Sized>(rt: &R, left: &Census, right: &Census) -> ObjectDiff {
    diff_objects_across(rt, left, rt, right)
}

/// Like [`diff_objects`], with each census typed by the runtime it was taken
/// from. Comparing two dumps of one process goes through here: an id that was
/// freed and reused for an object of another type counts as removed and
/// added.
pub fn diff_objects_across<L, R>(left_rt: &L, left: &Census, right_rt: &R, right: &Census) -> ObjectDiff
where
    L: Runtime + ?Sized,
    R: Runtime + ?Sized,
{
    let left_buckets = bucket(left_rt, left);
    let right_buckets = bucket(right_rt, right);
    let empty: HashSet<ObjectId> = HashSet::new();

    let mut added: Vec<ObjectId> = Vec::new();
    for (type_key, right_ids) in &right_buckets {
        let left_ids = left_buckets.get(type_key).unwrap_or(&empty);
        added.extend(right_ids.difference(left_ids).copied());
    }

    let mut removed: Vec<ObjectId> = Vec::new();
    for (type_key, left_ids) in &left_buckets {
        let right_ids = right_buckets.get(type_key).unwrap_or(&empty);
        removed.extend(left_ids.difference(right_ids).copied());
    }

    added.sort_unstable();
    removed.sort_unstable();

    ObjectDiff { added, removed }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::census;
    use crate::heap::Heap;
    use crate::runtime::ManagedHeap;

    #[test]
    fn added_and_removed_by_identity() {
        let mut heap = Heap::new();
        let a = heap.alloc("list", 56);
        let b = heap.alloc("list", 56);
        let c = heap.alloc("dict", 232);
        let d = heap.alloc("str", 50);

        let left: Census = vec![a, b, c].into_iter().collect();
        let right: Census = vec![b, c, d].into_iter().collect();

        let diff = diff_objects(&heap, &left, &right);

        assert_eq!(diff.added, vec![d]);
        assert_eq!(diff.removed, vec![a]);
    }

    #[test]
    fn equal_censuses_have_no_diff() {
        let mut heap = Heap::new();
        let ids: Census = (0..10).map(|_| heap.alloc("tuple", 48)).collect();

        assert!(diff_objects(&heap, &ids, &ids).is_empty());
    }

    #[test]
    fn freed_objects_are_reported_as_removed() {
        let mut heap = Heap::new();
        let keep = heap.alloc_rooted("list", 56);
        let temp = heap.alloc("list", 56);
        let leaf = heap.alloc_leaf("str", 50);
        heap.add_reference(temp, leaf).unwrap();

        let before = census::objects(&heap, true);
        heap.collect();
        let fresh = heap.alloc_rooted("dict", 232);
        let after = census::objects(&heap, true);

        let diff = diff_objects(&heap, &before, &after);

        assert_eq!(diff.added, vec![fresh]);
        assert_eq!(diff.removed, vec![temp, leaf]);
        assert!(after.contains(keep));
    }

    #[test]
    fn reused_ids_across_heaps() {
        let mut before = Heap::new();
        let kept = before.alloc_rooted("dict", 232);
        let reused = before.alloc_rooted("list", 56);

        let mut after = before.clone();
        after.remove_root(reused);
        after.collect();
        let mut dump = after.to_dump(heapdump::Header::new("test"));
        dump.objects.insert(
            reused.0,
            heapdump::Object {
                id: reused.0,
                type_name: "tuple".to_string(),
                size: Some(48),
                container: true,
                referents: vec![],
            },
        );
        dump.roots.push(heapdump::Root { id: reused.0, name: None });
        let after = Heap::from_dump(&dump);

        let left = census::objects(&before, true);
        let right = census::objects(&after, true);

        assert!(diff_objects(&after, &left, &right).is_empty());
        let diff = diff_objects_across(&before, &left, &after, &right);
        assert_eq!(diff.added, vec![reused]);
        assert_eq!(diff.removed, vec![reused]);
        assert!(right.contains(kept));
    }
}
