//! Arena-backed managed heap.
//!
//! [`Heap`] models the heap of a garbage collected runtime: objects live in
//! an arena keyed by [`ObjectId`], refer to each other through explicit
//! edges, and survive a collection only while reachable from a root. Ids are
//! handed out monotonically and never reused, so identities stay unambiguous
//! across snapshots.
//!
//! Heap dumps load into a `Heap` with [`Heap::from_dump`], which makes the
//! whole toolkit usable on heaps captured from other processes.

use crate::runtime::{CapabilityError, ManagedHeap, ObjectId, Runtime, TypeKey};
use heapdump::{Header, HeapDump, Object, Root};
use log::debug;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
struct HeapObject {
    type_key: TypeKey,
    size: Option<u64>,
    container: bool,
    referents: Vec<ObjectId>,
}

/// Statistics about collections performed on a heap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionStats {
    pub collections: u64,
    pub reclaimed: u64,
}

/// A managed heap with mark-sweep collection.
#[derive(Debug, Clone, Default)]
pub struct Heap {
    objects: HashMap<ObjectId, HeapObject>,
    /// Root handle counts; an object may be rooted several times.
    roots: HashMap<ObjectId, usize>,
    next_id: u64,
    stats: CollectionStats,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Self::default()
        }
    }

    fn insert(&mut self, type_key: TypeKey, size: Option<u64>, container: bool) -> ObjectId {
        // Default-constructed heaps start at 0; skip it so ids are never zero.
        self.next_id = self.next_id.max(1);
        let id = ObjectId(self.next_id);
        self.next_id += 1;
        self.objects.insert(
            id,
            HeapObject {
                type_key,
                size,
                container,
                referents: Vec::new(),
            },
        );
        id
    }

    /// Allocate a container object.
    pub fn alloc(&mut self, type_key: impl Into<TypeKey>, size: u64) -> ObjectId {
        self.insert(type_key.into(), Some(size), true)
    }

    /// Allocate a leaf object the collector does not track (ints, strings).
    pub fn alloc_leaf(&mut self, type_key: impl Into<TypeKey>, size: u64) -> ObjectId {
        self.insert(type_key.into(), Some(size), false)
    }

    /// Allocate a container whose size the runtime cannot report.
    pub fn alloc_unsized(&mut self, type_key: impl Into<TypeKey>) -> ObjectId {
        self.insert(type_key.into(), None, true)
    }

    /// Allocate a rooted container, the usual shape of an application object.
    pub fn alloc_rooted(&mut self, type_key: impl Into<TypeKey>, size: u64) -> ObjectId {
        let id = self.alloc(type_key, size);
        *self.roots.entry(id).or_insert(0) += 1;
        id
    }

    /// Allocate a leaf referenced from `owner`.
    pub fn alloc_leaf_in(
        &mut self,
        owner: ObjectId,
        type_key: impl Into<TypeKey>,
        size: u64,
    ) -> Result<ObjectId, CapabilityError> {
        if !self.objects.contains_key(&owner) {
            return Err(CapabilityError::UnknownObject(owner));
        }
        let id = self.alloc_leaf(type_key, size);
        self.add_reference(owner, id)?;
        Ok(id)
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    /// Number of objects currently in the arena, garbage included.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn is_rooted(&self, id: ObjectId) -> bool {
        self.roots.contains_key(&id)
    }

    /// Rooted objects in ascending id order.
    pub fn roots(&self) -> Vec<ObjectId> {
        let mut roots: Vec<ObjectId> = self.roots.keys().copied().collect();
        roots.sort_unstable();
        roots
    }

    pub fn stats(&self) -> CollectionStats {
        self.stats
    }

    fn mark(&self) -> HashSet<ObjectId> {
        let mut marked: HashSet<ObjectId> = HashSet::with_capacity(self.objects.len());
        let mut stack: Vec<ObjectId> = self.roots.keys().copied().collect();

        while let Some(id) = stack.pop() {
            if !marked.insert(id) {
                continue;
            }
            if let Some(object) = self.objects.get(&id) {
                stack.extend(object.referents.iter().copied());
            }
        }

        marked
    }

    /// Reclaim every object not reachable from a root. Returns the number of
    /// objects reclaimed.
    pub fn collect(&mut self) -> usize {
        let marked = self.mark();
        let before = self.objects.len();
        self.objects.retain(|id, _| marked.contains(id));
        let reclaimed = before - self.objects.len();

        self.stats.collections += 1;
        self.stats.reclaimed += reclaimed as u64;
        debug!(
            "collection #{}: reclaimed {} of {} objects",
            self.stats.collections, reclaimed, before
        );

        reclaimed
    }

    /// Build a heap from a parsed dump, keeping the dump's object ids.
    pub fn from_dump(dump: &HeapDump) -> Self {
        let mut heap = Heap::new();

        for object in dump.objects.values() {
            heap.objects.insert(
                ObjectId(object.id),
                HeapObject {
                    type_key: TypeKey::new(object.type_name.clone()),
                    size: object.size,
                    container: object.container,
                    referents: object.referents.iter().copied().map(ObjectId).collect(),
                },
            );
            heap.next_id = heap.next_id.max(object.id + 1);
        }

        for root in &dump.roots {
            *heap.roots.entry(ObjectId(root.id)).or_insert(0) += 1;
        }

        heap
    }

    /// Export the heap as a dump.
    pub fn to_dump(&self, header: Header) -> HeapDump {
        let mut dump = HeapDump::new(header);

        for (id, object) in &self.objects {
            dump.objects.insert(
                id.0,
                Object {
                    id: id.0,
                    type_name: object.type_key.to_string(),
                    size: object.size,
                    container: object.container,
                    referents: object.referents.iter().map(|r| r.0).collect(),
                },
            );
        }

        for root in self.roots() {
            for _ in 0..self.roots[&root] {
                dump.roots.push(Root {
                    id: root.0,
                    name: None,
                });
            }
        }

        dump
    }

    fn object(&self, id: ObjectId) -> Result<&HeapObject, CapabilityError> {
        self.objects
            .get(&id)
            .ok_or(CapabilityError::UnknownObject(id))
    }
}

impl Runtime for Heap {
    fn live_objects(&self) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = self
            .objects
            .iter()
            .filter(|(_, o)| o.container)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    fn size_of(&self, id: ObjectId) -> Result<u64, CapabilityError> {
        self.object(id)?
            .size
            .ok_or(CapabilityError::SizeUnavailable(id))
    }

    fn type_of(&self, id: ObjectId) -> Result<TypeKey, CapabilityError> {
        Ok(self.object(id)?.type_key.clone())
    }

    fn is_container(&self, id: ObjectId) -> bool {
        self.objects.get(&id).is_some_and(|o| o.container)
    }

    fn referents_of(&self, id: ObjectId) -> Vec<ObjectId> {
        self.objects
            .get(&id)
            .map(|o| o.referents.clone())
            .unwrap_or_default()
    }

    fn referrers_of(&self, id: ObjectId) -> Vec<ObjectId> {
        let mut referrers: Vec<ObjectId> = self
            .objects
            .iter()
            .filter(|(_, o)| o.referents.contains(&id))
            .map(|(from, _)| *from)
            .collect();
        referrers.sort_unstable();
        referrers
    }

    fn root_count(&self, id: ObjectId) -> usize {
        self.roots.get(&id).copied().unwrap_or(0)
    }

    fn force_collection(&mut self) {
        self.collect();
    }
}

impl ManagedHeap for Heap {
    fn allocate(&mut self, type_key: TypeKey, size: u64, container: bool) -> ObjectId {
        self.insert(type_key, Some(size), container)
    }

    fn add_reference(&mut self, from: ObjectId, to: ObjectId) -> Result<(), CapabilityError> {
        if !self.objects.contains_key(&to) {
            return Err(CapabilityError::UnknownObject(to));
        }
        let object = self
            .objects
            .get_mut(&from)
            .ok_or(CapabilityError::UnknownObject(from))?;
        object.referents.push(to);
        Ok(())
    }

    fn remove_reference(&mut self, from: ObjectId, to: ObjectId) {
        if let Some(object) = self.objects.get_mut(&from) {
            if let Some(pos) = object.referents.iter().position(|r| *r == to) {
                object.referents.remove(pos);
            }
        }
    }

    fn add_root(&mut self, id: ObjectId) -> Result<(), CapabilityError> {
        if !self.objects.contains_key(&id) {
            return Err(CapabilityError::UnknownObject(id));
        }
        *self.roots.entry(id).or_insert(0) += 1;
        Ok(())
    }

    fn remove_root(&mut self, id: ObjectId) {
        if let Some(count) = self.roots.get_mut(&id) {
            *count -= 1;
            if *count == 0 {
                self.roots.remove(&id);
            }
        }
    }
}
