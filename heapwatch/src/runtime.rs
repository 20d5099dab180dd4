//! Capabilities a managed runtime must provide to be inspected.
//!
//! Everything heapwatch knows about a heap it learns through [`Runtime`]:
//! which objects are alive, what type and size they have, and how they refer
//! to each other. [`ManagedHeap`] adds the allocation capabilities the
//! [`Tracker`](crate::tracker::Tracker) needs to keep its own snapshots inside
//! the inspected heap.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Opaque identity of a heap object.
///
/// Two objects are the same census entry iff their ids are equal, regardless
/// of their contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u64> for ObjectId {
    fn from(id: u64) -> Self {
        ObjectId(id)
    }
}

/// Stable classifier for an object's type, usually its qualified type name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeKey(String);

impl TypeKey {
    pub fn new(name: impl Into<String>) -> Self {
        TypeKey(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TypeKey {
    fn from(name: &str) -> Self {
        TypeKey(name.to_string())
    }
}

impl From<String> for TypeKey {
    fn from(name: String) -> Self {
        TypeKey(name)
    }
}

/// A per-object introspection query the runtime could not answer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("size of object {0} is unavailable")]
    SizeUnavailable(ObjectId),

    #[error("type of object {0} is unavailable")]
    TypeUnavailable(ObjectId),

    #[error("object {0} is not alive")]
    UnknownObject(ObjectId),
}

/// Read access to a managed heap.
pub trait Runtime {
    /// Objects in the runtime's live-object registry.
    ///
    /// Registries usually track only container objects; leaf objects are
    /// found through the referents of containers.
    fn live_objects(&self) -> Vec<ObjectId>;

    fn size_of(&self, id: ObjectId) -> Result<u64, CapabilityError>;

    fn type_of(&self, id: ObjectId) -> Result<TypeKey, CapabilityError>;

    /// Whether the collector tracks `id` as a container.
    fn is_container(&self, id: ObjectId) -> bool;

    /// Objects `id` refers to directly.
    fn referents_of(&self, id: ObjectId) -> Vec<ObjectId>;

    /// Objects referring to `id` directly. Root handles are not objects and
    /// are never listed; see [`root_count`](Self::root_count).
    fn referrers_of(&self, id: ObjectId) -> Vec<ObjectId>;

    /// Number of root handles holding `id`.
    fn root_count(&self, id: ObjectId) -> usize;

    /// Run a full collection cycle.
    ///
    /// This is a process-wide side effect: every observer of the heap sees
    /// unreachable objects disappear.
    fn force_collection(&mut self);

    /// Human readable label for an object, used by referrer trees.
    fn describe(&self, id: ObjectId) -> String {
        match self.type_of(id) {
            Ok(type_key) => format!("{} {}", type_key, id),
            Err(_) => format!("<unknown> {}", id),
        }
    }
}

/// Allocation capabilities of a managed heap.
///
/// The tracker materializes its stored snapshots through these, so its
/// bookkeeping is visible to the census exactly like application objects.
pub trait ManagedHeap: Runtime {
    /// Allocate a new object. The object starts unrooted and unreferenced.
    fn allocate(&mut self, type_key: TypeKey, size: u64, container: bool) -> ObjectId;

    fn add_reference(&mut self, from: ObjectId, to: ObjectId) -> Result<(), CapabilityError>;

    /// Remove one reference from `from` to `to`. Missing references are ignored.
    fn remove_reference(&mut self, from: ObjectId, to: ObjectId);

    fn add_root(&mut self, id: ObjectId) -> Result<(), CapabilityError>;

    /// Drop one root handle of `id`. The object is reclaimed by the next
    /// collection if nothing else keeps it alive.
    fn remove_root(&mut self, id: ObjectId);
}
