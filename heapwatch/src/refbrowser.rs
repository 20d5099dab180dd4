//! Trees of referrers for manual leak diagnosis.
//!
//! A referrer tree starts at one object and branches into the objects that
//! refer to it, then the objects referring to those, and so on up to a depth
//! limit. Reading a tree from a leaked object upward usually shows what keeps
//! it alive.
//!
//! ```no_run
//! use heapwatch::heap::Heap;
//! use heapwatch::refbrowser::ReferrerTree;
//! use heapwatch::render::format_tree;
//! # let mut heap = Heap::new();
//! # let leaked = heap.alloc("list", 56);
//!
//! let tree = ReferrerTree::new().max_depth(4).build(&mut heap, leaked);
//! print!("{}", format_tree(&tree, None));
//! ```

use crate::runtime::{ObjectId, Runtime, TypeKey};
use std::collections::HashSet;
use std::fmt;

/// Label function: receives the object and its type, if known.
pub type LabelFn = Box<dyn Fn(ObjectId, Option<&TypeKey>) -> String>;

/// An object in a referrer tree together with the objects referring to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: ObjectId,
    pub label: String,
    pub children: Vec<Child>,
}

/// A branch of a [`Node`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Child {
    Node(Node),
    /// Referrer already shown elsewhere in the tree.
    Seen(String),
}

impl Child {
    pub fn label(&self) -> &str {
        match self {
            Child::Node(node) => &node.label,
            Child::Seen(marker) => marker,
        }
    }

    pub fn as_node(&self) -> Option<&Node> {
        match self {
            Child::Node(node) => Some(node),
            Child::Seen(_) => None,
        }
    }
}

impl fmt::Display for Child {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl Node {
    fn new(id: ObjectId, label: String) -> Self {
        Self {
            id,
            label,
            children: Vec::new(),
        }
    }

    /// Child nodes, skipping repeat markers.
    pub fn child_nodes(&self) -> impl Iterator<Item = &Node> {
        self.children.iter().filter_map(Child::as_node)
    }

    /// Number of levels below this node.
    pub fn depth(&self) -> usize {
        self.child_nodes().map(|c| c.depth() + 1).max().unwrap_or(0)
    }

    /// Number of nodes in this subtree, this node included.
    pub fn node_count(&self) -> usize {
        1 + self.child_nodes().map(Node::node_count).sum::<usize>()
    }

    /// Find the first node for `id` in depth-first order.
    pub fn find_mut(&mut self, id: ObjectId) -> Option<&mut Node> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter_mut().find_map(|child| match child {
            Child::Node(node) => node.find_mut(id),
            Child::Seen(_) => None,
        })
    }

    /// Rebuild the subtree below this node `depth` levels deep.
    ///
    /// Interactive browsers build shallow trees and expand the nodes a user
    /// opens. Like [`ReferrerTree::build`] this forces a collection.
    pub fn expand<R: Runtime + ?Sized>(&mut self, rt: &mut R, tree: &ReferrerTree, depth: usize) {
        rt.force_collection();
        let mut included = HashSet::new();
        included.insert(self.id);
        *self = tree.walk(&*rt, self.id, depth, &mut included);
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

/// Builder for referrer trees.
pub struct ReferrerTree {
    max_depth: usize,
    repeat: bool,
    label: Option<LabelFn>,
    ignore: HashSet<ObjectId>,
}

impl Default for ReferrerTree {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ReferrerTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferrerTree")
            .field("max_depth", &self.max_depth)
            .field("repeat", &self.repeat)
            .field("custom_label", &self.label.is_some())
            .field("ignore", &self.ignore.len())
            .finish()
    }
}

impl ReferrerTree {
    pub fn new() -> Self {
        Self {
            max_depth: 3,
            repeat: false,
            label: None,
            ignore: HashSet::new(),
        }
    }

    /// Maximum number of referrer levels below the root. Defaults to 3.
    pub fn max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Whether an object may appear more than once in the tree. When false,
    /// repeated referrers become [`Child::Seen`] markers.
    pub fn repeat(mut self, repeat: bool) -> Self {
        self.repeat = repeat;
        self
    }

    /// Label nodes with `f` instead of [`Runtime::describe`].
    pub fn str_func(mut self, f: impl Fn(ObjectId, Option<&TypeKey>) -> String + 'static) -> Self {
        self.label = Some(Box::new(f));
        self
    }

    /// Never treat these objects as referrers.
    ///
    /// Handles held only for inspection, such as a tracker's bookkeeping,
    /// belong here.
    pub fn ignore(mut self, ids: impl IntoIterator<Item = ObjectId>) -> Self {
        self.ignore.extend(ids);
        self
    }

    /// Build the referrer tree of `root`.
    ///
    /// A full collection is forced first so that garbage does not show up as
    /// referrers. The collection is visible to every observer of the heap.
    pub fn build<R: Runtime + ?Sized>(&self, rt: &mut R, root: ObjectId) -> Node {
        rt.force_collection();
        let mut included = HashSet::new();
        included.insert(root);
        self.walk(&*rt, root, self.max_depth, &mut included)
    }

    fn label_of<R: Runtime + ?Sized>(&self, rt: &R, id: ObjectId) -> String {
        match &self.label {
            Some(f) => f(id, rt.type_of(id).ok().as_ref()),
            None => rt.describe(id),
        }
    }

    fn frame<R: Runtime + ?Sized>(&self, rt: &R, id: ObjectId, depth: usize) -> Frame {
        let pending = if depth == 0 {
            Vec::new()
        } else {
            rt.referrers_of(id)
        };
        Frame {
            node: Node::new(id, self.label_of(rt, id)),
            pending: pending.into_iter(),
            depth,
        }
    }

    /// Depth-first walk with an explicit stack, so the depth limit is not
    /// bounded by the call stack.
    fn walk<R: Runtime + ?Sized>(
        &self,
        rt: &R,
        id: ObjectId,
        depth: usize,
        included: &mut HashSet<ObjectId>,
    ) -> Node {
        let mut stack = vec![self.frame(rt, id, depth)];

        while let Some(frame) = stack.last_mut() {
            if let Some(referrer) = frame.pending.next() {
                if self.ignore.contains(&referrer) {
                    continue;
                }
                if !self.repeat && included.contains(&referrer) {
                    let marker = format!(
                        "{} (already included, id={})",
                        self.label_of(rt, referrer),
                        referrer
                    );
                    frame.node.children.push(Child::Seen(marker));
                    continue;
                }
                included.insert(referrer);
                let child_depth = frame.depth - 1;
                stack.push(self.frame(rt, referrer, child_depth));
                continue;
            }

            let Some(done) = stack.pop() else { break };
            match stack.last_mut() {
                Some(parent) => parent.node.children.push(Child::Node(done.node)),
                None => return done.node,
            }
        }

        Node::new(id, self.label_of(rt, id))
    }
}

/// A node under construction and the referrers still to visit.
struct Frame {
    node: Node,
    pending: std::vec::IntoIter<ObjectId>,
    depth: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;
    use crate::runtime::ManagedHeap;

    /// One rooted string held by three lists, all kept by one module.
    fn shared_string() -> (Heap, ObjectId, Vec<ObjectId>) {
        let mut heap = Heap::new();
        let module = heap.alloc_rooted("module", 1024);
        let root = heap.alloc_leaf_in(module, "str", 53).unwrap();
        let lists: Vec<ObjectId> = (0..3)
            .map(|_| {
                let list = heap.alloc("list", 64);
                heap.add_reference(module, list).unwrap();
                heap.add_reference(list, root).unwrap();
                list
            })
            .collect();
        (heap, root, lists)
    }

    #[test]
    fn depth_zero_has_no_children() {
        let (mut heap, root, _) = shared_string();

        let tree = ReferrerTree::new().max_depth(0).build(&mut heap, root);

        assert_eq!(tree.id, root);
        assert!(tree.children.is_empty());
    }

    #[test]
    fn children_are_referrers() {
        let (mut heap, root, lists) = shared_string();

        let tree = ReferrerTree::new().max_depth(1).build(&mut heap, root);

        let ids: Vec<ObjectId> = tree.child_nodes().map(|n| n.id).collect();
        assert_eq!(ids.len(), 4);
        for list in &lists {
            assert!(ids.contains(list));
        }
        assert!(tree.child_nodes().all(|n| n.children.is_empty()));
        assert_eq!(tree.depth(), 1);
    }

    #[test]
    fn repeated_referrers_become_markers() {
        let (mut heap, root, _) = shared_string();
        let module = heap.roots()[0];

        let tree = ReferrerTree::new().max_depth(2).build(&mut heap, root);

        // The module refers to the string directly and to every list.
        let markers: Vec<&str> = tree
            .child_nodes()
            .flat_map(|n| n.children.iter())
            .filter_map(|c| match c {
                Child::Seen(marker) => Some(marker.as_str()),
                Child::Node(_) => None,
            })
            .collect();
        assert_eq!(markers.len(), 3);
        let expected = format!("module {} (already included, id={})", module, module);
        assert!(markers.iter().all(|m| *m == expected));
    }

    #[test]
    fn repeat_allows_duplicates() {
        let (mut heap, root, _) = shared_string();

        let tree = ReferrerTree::new()
            .max_depth(2)
            .repeat(true)
            .build(&mut heap, root);

        assert!(tree
            .child_nodes()
            .flat_map(|n| n.children.iter())
            .all(|c| matches!(c, Child::Node(_))));
        // root + 4 referrers + module above each of the 3 lists
        assert_eq!(tree.node_count(), 8);
    }

    #[test]
    fn ignored_objects_are_skipped() {
        let (mut heap, root, lists) = shared_string();

        let tree = ReferrerTree::new()
            .max_depth(1)
            .ignore(lists.iter().copied())
            .build(&mut heap, root);

        assert_eq!(tree.children.len(), 1);
    }

    #[test]
    fn custom_labels() {
        let (mut heap, root, _) = shared_string();

        let tree = ReferrerTree::new()
            .max_depth(1)
            .str_func(|_, type_key| match type_key {
                Some(t) => t.to_string(),
                None => "?".to_string(),
            })
            .build(&mut heap, root);

        assert_eq!(tree.label, "str");
        let mut labels: Vec<&str> = tree.children.iter().map(Child::label).collect();
        labels.sort_unstable();
        assert_eq!(labels, vec!["list", "list", "list", "module"]);
    }

    #[test]
    fn garbage_is_not_a_referrer() {
        let (mut heap, root, _) = shared_string();
        let garbage = heap.alloc("list", 64);
        heap.add_reference(garbage, root).unwrap();

        let tree = ReferrerTree::new().max_depth(1).build(&mut heap, root);

        assert!(!heap.contains(garbage));
        assert_eq!(tree.children.len(), 4);
    }

    #[test]
    fn long_referrer_chains() {
        let mut heap = Heap::new();
        let target = heap.alloc("node", 40);
        let mut last = target;
        for _ in 0..3000 {
            let holder = heap.alloc("node", 40);
            heap.add_reference(holder, last).unwrap();
            last = holder;
        }
        heap.add_root(last).unwrap();

        let tree = ReferrerTree::new().max_depth(usize::MAX).build(&mut heap, target);

        let mut levels = 0;
        let mut node = &tree;
        while let Some(parent) = node.child_nodes().next() {
            levels += 1;
            node = parent;
        }
        assert_eq!(levels, 3000);
        assert_eq!(node.id, last);
    }

    #[test]
    fn expand_deepens_a_node() {
        let (mut heap, root, lists) = shared_string();
        let builder = ReferrerTree::new().max_depth(1);
        let mut tree = builder.build(&mut heap, root);

        let node = tree.find_mut(lists[0]).unwrap();
        assert!(node.children.is_empty());
        node.expand(&mut heap, &builder, 1);

        assert_eq!(node.children.len(), 1);
        assert_eq!(tree.depth(), 2);
    }
}
