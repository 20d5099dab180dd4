//! Enumeration of live heap objects.
//!
//! A census is taken from the runtime's live-object registry. Registries only
//! list container objects, so the first-level referents of every container
//! that are not containers themselves (ints, strings and other leaves) are
//! pulled in explicitly. Duplicates are removed by identity.
//!
//! Walking the registry is proportional to heap size; on large heaps a census
//! is a noticeable pause for the caller.

use crate::runtime::{ObjectId, Runtime, TypeKey};
use log::warn;
use std::collections::HashSet;
use thiserror::Error;

/// Errors raised by census queries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CensusError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, CensusError>;

/// A collection of live object identities at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Census {
    handles: Vec<ObjectId>,
}

impl Census {
    /// Wrap handles as they are, duplicates included.
    pub fn from_handles(handles: Vec<ObjectId>) -> Self {
        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.handles.iter().copied()
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.handles.contains(&id)
    }

    /// Keep only the handles for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(ObjectId) -> bool) {
        self.handles.retain(|id| keep(*id));
    }

    pub fn as_slice(&self) -> &[ObjectId] {
        &self.handles
    }

    pub fn into_handles(self) -> Vec<ObjectId> {
        self.handles
    }
}

impl FromIterator<ObjectId> for Census {
    fn from_iter<I: IntoIterator<Item = ObjectId>>(iter: I) -> Self {
        Census {
            handles: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Census {
    type Item = ObjectId;
    type IntoIter = std::vec::IntoIter<ObjectId>;

    fn into_iter(self) -> Self::IntoIter {
        self.handles.into_iter()
    }
}

/// Take a census of every live object.
///
/// With `remove_dups` the result holds each identity once. Order is
/// unspecified.
pub fn objects<R: Runtime + ?Sized>(rt: &R, remove_dups: bool) -> Census {
    let registry = rt.live_objects();
    let mut handles: Vec<ObjectId> = Vec::with_capacity(registry.len() * 2);

    for &id in &registry {
        handles.extend(
            rt.referents_of(id)
                .into_iter()
                .filter(|referent| !rt.is_container(*referent)),
        );
    }
    handles.extend(registry);

    if remove_dups {
        handles = remove_duplicates(handles);
    }

    Census::from_handles(handles)
}

/// Remove duplicate identities, keeping the first occurrence of each.
pub fn remove_duplicates(handles: impl IntoIterator<Item = ObjectId>) -> Vec<ObjectId> {
    let mut seen: HashSet<ObjectId> = HashSet::new();
    let mut result = Vec::new();

    for id in handles {
        if seen.insert(id) {
            result.push(id);
        }
    }

    result
}

/// Referents of `id` up to `level` levels of indirection, without duplicates.
///
/// `level` 1 returns the direct referents only; `level` 0 returns nothing.
pub fn referents<R: Runtime + ?Sized>(rt: &R, id: ObjectId, level: usize) -> Vec<ObjectId> {
    let mut result: Vec<ObjectId> = Vec::new();
    let mut frontier = vec![id];

    for _ in 0..level {
        let next: Vec<ObjectId> = frontier
            .iter()
            .flat_map(|&o| rt.referents_of(o))
            .collect();
        result.extend(next.iter().copied());
        frontier = next;
    }

    remove_duplicates(result)
}

/// Total size of `handles` in bytes. Objects the runtime cannot size are
/// skipped with a warning.
pub fn total_size<R: Runtime + ?Sized>(rt: &R, handles: &[ObjectId]) -> u64 {
    handles
        .iter()
        .filter_map(|&id| match rt.size_of(id) {
            Ok(size) => Some(size),
            Err(e) => {
                warn!("ignoring object in size total: {}", e);
                None
            }
        })
        .sum()
}

/// Sort handles by size in bytes, smallest first. Unsized objects come first.
pub fn sort_by_size<R: Runtime + ?Sized>(rt: &R, handles: &mut [ObjectId]) {
    handles.sort_by_cached_key(|&id| rt.size_of(id).ok());
}

/// Selection criteria for [`filter`].
#[derive(Debug, Clone, Default)]
pub struct Filter {
    /// Keep only objects of this type.
    pub type_key: Option<TypeKey>,
    /// Minimum size in bytes, inclusive.
    pub min_size: Option<u64>,
    /// Maximum size in bytes, inclusive.
    pub max_size: Option<u64>,
}

impl Filter {
    pub fn of_type(type_key: impl Into<TypeKey>) -> Self {
        Self {
            type_key: Some(type_key.into()),
            ..Self::default()
        }
    }

    pub fn min_size(mut self, min: u64) -> Self {
        self.min_size = Some(min);
        self
    }

    pub fn max_size(mut self, max: u64) -> Self {
        self.max_size = Some(max);
        self
    }
}

/// Keep the objects matching `filter`.
///
/// Size bounds exclude objects whose size is unavailable.
pub fn filter<R: Runtime + ?Sized>(
    rt: &R,
    handles: &[ObjectId],
    filter: &Filter,
) -> Result<Vec<ObjectId>> {
    if let (Some(min), Some(max)) = (filter.min_size, filter.max_size) {
        if min > max {
            return Err(CensusError::InvalidArgument(format!(
                "minimum size {} exceeds maximum size {}",
                min, max
            )));
        }
    }

    let bounded = filter.min_size.is_some() || filter.max_size.is_some();

    Ok(handles
        .iter()
        .copied()
        .filter(|&id| match &filter.type_key {
            Some(wanted) => rt.type_of(id).is_ok_and(|t| t == *wanted),
            None => true,
        })
        .filter(|&id| {
            if !bounded {
                return true;
            }
            match rt.size_of(id) {
                Ok(size) => {
                    filter.min_size.is_none_or(|min| size >= min)
                        && filter.max_size.is_none_or(|max| size <= max)
                }
                Err(_) => false,
            }
        })
        .collect())
}
