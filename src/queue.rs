//! # Task Queues
//!
//! Ordered collections of task handles. The tasks themselves live in an
//! arena; a [`Queue`] only owns a sequence of handles. Exclusive membership
//! is enforced by a residency table ([`Links`]): every node has one slot
//! recording the tag of the queue it currently sits in.
//!
//! ```text
//!   Links            ready (tag 3)        sem.waiting (tag 7)
//!   ┌───┬──────┐     ┌───┬───┬───┐        ┌───┐
//!   │ 0 │  -   │     │ 2 │ 5 │ 4 │        │ 3 │
//!   │ 2 │ 3    │     └───┴───┴───┘        └───┘
//!   │ 3 │ 7    │
//!   │ 4 │ 3    │
//!   │ 5 │ 3    │
//!   └───┴──────┘
//! ```
//!
//! A node can be appended only while its slot is empty; it can be removed
//! only from the queue whose tag its slot holds.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use std::collections::VecDeque;

/// Anything that can be queued: a small copyable handle that indexes a
/// residency slot.
pub trait Node: Copy + Eq + fmt::Debug {
    fn slot(self) -> usize;
}

/// Identity of one queue instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueTag(u64);

impl QueueTag {
    fn fresh() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        QueueTag(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Rejected queue operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// The node has no residency slot.
    UnknownNode,
    /// The node already sits in a queue.
    AlreadyQueued,
    /// Removal from an empty queue.
    Empty,
    /// The node is not a member of this queue.
    NotMember,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QueueError::UnknownNode => "element does not exist",
            QueueError::AlreadyQueued => "element belongs to another queue",
            QueueError::Empty => "queue is empty",
            QueueError::NotMember => "element does not belong to the queue",
        })
    }
}

impl std::error::Error for QueueError {}

// ---------------------------------------------------------------------------
// Residency table
// ---------------------------------------------------------------------------

/// Per-node record of the queue a node currently resides in.
#[derive(Debug, Default)]
pub struct Links {
    slots: Vec<Option<QueueTag>>,
}

impl Links {
    pub const fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Make room for nodes `0..count`. New slots start unlinked.
    pub fn grow_to(&mut self, count: usize) {
        if self.slots.len() < count {
            self.slots.resize(count, None);
        }
    }

    /// Whether the node sits in any queue.
    pub fn is_linked<N: Node>(&self, node: N) -> bool {
        matches!(self.slots.get(node.slot()), Some(Some(_)))
    }

    /// Tag of the queue holding the node.
    pub fn residence<N: Node>(&self, node: N) -> Option<QueueTag> {
        self.slots.get(node.slot()).copied().flatten()
    }

    fn slot_mut<N: Node>(&mut self, node: N) -> Option<&mut Option<QueueTag>> {
        self.slots.get_mut(node.slot())
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Insertion-ordered queue of nodes with residency-checked membership.
pub struct Queue<N: Node> {
    tag: QueueTag,
    label: &'static str,
    items: VecDeque<N>,
}

impl<N: Node> Queue<N> {
    /// Create an empty queue. `label` names it in diagnostics.
    pub fn new(label: &'static str) -> Self {
        Self {
            tag: QueueTag::fresh(),
            label,
            items: VecDeque::new(),
        }
    }

    pub fn tag(&self) -> QueueTag {
        self.tag
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Append `node` at the back.
    ///
    /// Fails without touching anything if the node is unknown to `links` or
    /// already resides in a queue (this one included).
    pub fn append(&mut self, links: &mut Links, node: N) -> Result<(), QueueError> {
        let Some(slot) = links.slot_mut(node) else {
            return Err(self.reject("append", node, QueueError::UnknownNode));
        };
        if slot.is_some() {
            return Err(self.reject("append", node, QueueError::AlreadyQueued));
        }
        *slot = Some(self.tag);
        self.items.push_back(node);
        Ok(())
    }

    /// Remove `node` from wherever it sits in this queue and return it.
    pub fn remove(&mut self, links: &mut Links, node: N) -> Result<N, QueueError> {
        if self.items.is_empty() {
            return Err(self.reject("remove", node, QueueError::Empty));
        }
        let tag = self.tag;
        let Some(slot) = links.slot_mut(node) else {
            return Err(self.reject("remove", node, QueueError::UnknownNode));
        };
        if *slot != Some(tag) {
            return Err(self.reject("remove", node, QueueError::NotMember));
        }
        let Some(pos) = self.items.iter().position(|&n| n == node) else {
            return Err(self.reject("remove", node, QueueError::NotMember));
        };
        *slot = None;
        self.items.remove(pos);
        Ok(node)
    }

    /// Remove and return the front node.
    pub fn pop_front(&mut self, links: &mut Links) -> Option<N> {
        let node = self.items.pop_front()?;
        if let Some(slot) = links.slot_mut(node) {
            *slot = None;
        }
        Some(node)
    }

    pub fn front(&self) -> Option<N> {
        self.items.front().copied()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, node: N) -> bool {
        self.items.contains(&node)
    }

    /// Nodes front to back.
    pub fn iter(&self) -> impl Iterator<Item = N> + '_ {
        self.items.iter().copied()
    }

    /// Visit every node once, front to back.
    pub fn foreach(&self, mut f: impl FnMut(N)) {
        for &node in &self.items {
            f(node);
        }
    }

    /// Fold every node into an accumulator, front to back.
    pub fn reduce<A>(&self, seed: A, f: impl FnMut(A, N) -> A) -> A {
        self.items.iter().copied().fold(seed, f)
    }

    fn reject(&self, op: &str, node: N, err: QueueError) -> QueueError {
        log::warn!("queue {}: {} {:?}: {}", self.label, op, node, err);
        err
    }
}

impl<N: Node> fmt::Debug for Queue<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: ", self.label)?;
        f.debug_list().entries(self.items.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct N(usize);

    impl Node for N {
        fn slot(self) -> usize {
            self.0
        }
    }

    fn links(count: usize) -> Links {
        let mut links = Links::new();
        links.grow_to(count);
        links
    }

    #[test]
    fn test_append_preserves_insertion_order() {
        let mut links = links(4);
        let mut q = Queue::new("q");
        for i in [2, 0, 3, 1] {
            q.append(&mut links, N(i)).unwrap();
        }
        let order: Vec<_> = q.iter().map(|n| n.0).collect();
        assert_eq!(order, vec![2, 0, 3, 1]);
        assert_eq!(q.len(), 4);
        assert_eq!(q.front(), Some(N(2)));
    }

    #[test]
    fn test_round_trip_leaves_everything_unlinked() {
        let mut links = links(6);
        let mut q = Queue::new("q");
        for i in 0..6 {
            q.append(&mut links, N(i)).unwrap();
        }
        // Middle, head, tail, then the rest.
        for i in [3, 0, 5, 1, 4, 2] {
            assert_eq!(q.remove(&mut links, N(i)), Ok(N(i)));
            assert!(!links.is_linked(N(i)));
        }
        assert!(q.is_empty());
        assert_eq!(q.remove(&mut links, N(0)), Err(QueueError::Empty));
    }

    #[test]
    fn test_removing_head_advances_front() {
        let mut links = links(3);
        let mut q = Queue::new("q");
        for i in 0..3 {
            q.append(&mut links, N(i)).unwrap();
        }
        q.remove(&mut links, N(0)).unwrap();
        assert_eq!(q.front(), Some(N(1)));
        q.remove(&mut links, N(1)).unwrap();
        q.remove(&mut links, N(2)).unwrap();
        assert_eq!(q.front(), None);
    }

    #[test]
    fn test_double_append_is_rejected() {
        let mut links = links(2);
        let mut a = Queue::new("a");
        let mut b = Queue::new("b");
        a.append(&mut links, N(0)).unwrap();

        assert_eq!(a.append(&mut links, N(0)), Err(QueueError::AlreadyQueued));
        assert_eq!(b.append(&mut links, N(0)), Err(QueueError::AlreadyQueued));
        assert_eq!(a.len(), 1);
        assert!(b.is_empty());
        assert_eq!(links.residence(N(0)), Some(a.tag()));
    }

    #[test]
    fn test_remove_from_wrong_queue_is_rejected() {
        let mut links = links(2);
        let mut a = Queue::new("a");
        let mut b = Queue::new("b");
        a.append(&mut links, N(0)).unwrap();
        b.append(&mut links, N(1)).unwrap();

        assert_eq!(b.remove(&mut links, N(0)), Err(QueueError::NotMember));
        assert_eq!(links.residence(N(0)), Some(a.tag()));
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn test_unknown_node_is_rejected() {
        let mut links = links(1);
        let mut q = Queue::new("q");
        assert_eq!(q.append(&mut links, N(7)), Err(QueueError::UnknownNode));
        q.append(&mut links, N(0)).unwrap();
        assert_eq!(q.remove(&mut links, N(7)), Err(QueueError::UnknownNode));
    }

    #[test]
    fn test_pop_front_unlinks() {
        let mut links = links(2);
        let mut q = Queue::new("q");
        q.append(&mut links, N(1)).unwrap();
        q.append(&mut links, N(0)).unwrap();

        assert_eq!(q.pop_front(&mut links), Some(N(1)));
        assert!(!links.is_linked(N(1)));
        assert!(links.is_linked(N(0)));
        // A popped node may join another queue.
        let mut other = Queue::new("other");
        other.append(&mut links, N(1)).unwrap();
    }

    #[test]
    fn test_foreach_and_reduce_visit_front_to_back() {
        let mut links = links(5);
        let mut q = Queue::new("q");
        for i in [4, 1, 3] {
            q.append(&mut links, N(i)).unwrap();
        }
        let mut seen = Vec::new();
        q.foreach(|n| seen.push(n.0));
        assert_eq!(seen, vec![4, 1, 3]);

        let first_odd = q.reduce(None, |acc, n| acc.or(if n.0 % 2 == 1 { Some(n) } else { None }));
        assert_eq!(first_odd, Some(N(1)));
        assert_eq!(q.reduce(0, |acc, n| acc + n.0), 8);
    }

    #[test]
    fn test_tags_are_unique() {
        let a: Queue<N> = Queue::new("a");
        let b: Queue<N> = Queue::new("b");
        assert_ne!(a.tag(), b.tag());
    }
}
