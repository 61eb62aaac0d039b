//! Logical-order tracking for concurrently executing tasks.
//!
//! A [`SchedulingContext`] records *where in the program* a task was created,
//! independent of when it actually runs. Each context knows its parent and its
//! position among its siblings, and renders the chain from the root as a
//! dotted label (`"3.1.0"`). Log records tagged with that label can be sorted
//! back into the program-order hierarchy even though concurrent tasks
//! interleaved them on the wire.
//!
//! Contexts only point at their parent, never at their children, so a tree of
//! contexts is dropped as soon as the last task or log record holding a leaf
//! goes away.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::ContextId;

/// Process-wide numbering of root contexts.
static ROOT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Process-wide construction counter shared by every context.
static CREATION_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
struct Node {
    id: ContextId,
    parent: Option<SchedulingContext>,
    created_order: u64,
    next_child: AtomicU64,
}

/// An immutable, cheaply clonable position in the task-creation tree.
///
/// Cloning shares the same node; two clones have the same label. Use
/// [`SchedulingContext::child`] to create a new position.
#[derive(Debug, Clone)]
pub struct SchedulingContext {
    node: Arc<Node>,
}

impl SchedulingContext {
    /// Creates a fresh context under `parent`, or a new root when `parent`
    /// is `None`.
    pub fn new_child(parent: Option<&SchedulingContext>) -> Self {
        let id = match parent {
            Some(p) => p.node.next_child.fetch_add(1, Ordering::Relaxed),
            None => ROOT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
        };
        Self {
            node: Arc::new(Node {
                id: ContextId::new(id),
                parent: parent.cloned(),
                created_order: CREATION_SEQUENCE.fetch_add(1, Ordering::Relaxed),
                next_child: AtomicU64::new(0),
            }),
        }
    }

    /// Creates a new root context.
    pub fn root() -> Self {
        Self::new_child(None)
    }

    /// Creates the next child of `self`.
    pub fn child(&self) -> Self {
        Self::new_child(Some(self))
    }

    /// Position of this context among its siblings (or among roots).
    pub fn id(&self) -> ContextId {
        self.node.id
    }

    pub fn parent(&self) -> Option<&SchedulingContext> {
        self.node.parent.as_ref()
    }

    /// Value of the process-wide construction counter when this context was
    /// created. Strictly greater than the value of every ancestor.
    pub fn created_order(&self) -> u64 {
        self.node.created_order
    }

    /// Number of ancestors; zero for a root.
    pub fn depth(&self) -> usize {
        self.ancestors().count()
    }

    /// Iterates over this context's ancestors, nearest first.
    pub fn ancestors(&self) -> impl Iterator<Item = &SchedulingContext> {
        std::iter::successors(self.parent(), |ctx| ctx.parent())
    }

    /// Returns the ids from the root down to `self`.
    pub fn path(&self) -> Vec<ContextId> {
        let mut ids: Vec<ContextId> = std::iter::once(self)
            .chain(self.ancestors())
            .map(SchedulingContext::id)
            .collect();
        ids.reverse();
        ids
    }

    /// Renders the root-to-self id chain as a dotted label, e.g. `"3.1.0"`.
    ///
    /// The label depends only on the id chain.
    pub fn label(&self) -> String {
        self.path()
            .iter()
            .map(ContextId::to_string)
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Returns `true` if `self` is `other` or one of its descendants.
    pub fn descends_from(&self, other: &SchedulingContext) -> bool {
        std::iter::once(self)
            .chain(self.ancestors())
            .any(|ctx| Arc::ptr_eq(&ctx.node, &other.node))
    }
}

impl std::fmt::Display for SchedulingContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn siblings_differ_only_in_trailing_component() {
        let root = SchedulingContext::root();
        let first = root.child();
        let second = root.child();

        let root_label = root.label();
        assert_eq!(first.label(), format!("{root_label}.0"));
        assert_eq!(second.label(), format!("{root_label}.1"));
    }

    #[test]
    fn label_is_stable_across_calls_and_clones() {
        let ctx = SchedulingContext::root().child().child();
        let clone = ctx.clone();
        assert_eq!(ctx.label(), ctx.label());
        assert_eq!(ctx.label(), clone.label());
        assert_eq!(ctx.to_string(), ctx.label());
    }

    #[test]
    fn nested_children_extend_the_parent_label() {
        let root = SchedulingContext::root();
        let task = root.child();
        let _other_task = root.child();
        let step_a = task.child();
        let step_b = task.child();

        assert_eq!(step_a.label(), format!("{}.0", task.label()));
        assert_eq!(step_b.label(), format!("{}.1", task.label()));
        assert_eq!(step_b.depth(), 2);
        assert!(step_b.descends_from(&root));
        assert!(step_b.descends_from(&task));
        assert!(!task.descends_from(&step_b));
    }

    #[test]
    fn parent_is_created_before_child() {
        let root = SchedulingContext::root();
        let child = root.child();
        let grandchild = child.child();
        assert!(root.created_order() < child.created_order());
        assert!(child.created_order() < grandchild.created_order());
        assert_eq!(grandchild.parent().map(SchedulingContext::id), Some(child.id()));
        assert!(root.parent().is_none());
    }

    #[test]
    fn path_lists_ids_from_root() {
        let root = SchedulingContext::root();
        let _skip = root.child();
        let child = root.child();
        let grandchild = child.child();
        assert_eq!(
            grandchild.path(),
            vec![root.id(), ContextId::new(1), ContextId::new(0)]
        );
    }

    #[test]
    fn children_created_from_concurrent_tasks_get_unique_ids() {
        let root = SchedulingContext::root();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let root = root.clone();
                std::thread::spawn(move || root.child().id())
            })
            .collect();
        let mut ids: Vec<u64> = handles
            .into_iter()
            .map(|h| h.join().unwrap().as_u64())
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..8).collect::<Vec<_>>());
    }
}
