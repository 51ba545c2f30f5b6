//! Rank vectors and the pairing heap used by the reactor.

use alloc::vec::Vec;

use crate::model::ProcessId;

/// A publisher's fixed position in the reactive DAG.
///
/// Comparison is lexicographic, with one twist: a longer vector that
/// agrees with a shorter one on every shared prefix sorts *before* it.
/// That makes a publisher created while running inside another
/// publisher sort strictly after its creator, and a sibling sort after
/// everything born before it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Rank(Vec<u32>);

impl Rank {
    /// The empty rank, used only for the implicit top-level root.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Derives a child rank: appends `child_index` to `self` and
    /// returns the extended vector. The caller is responsible for
    /// incrementing its own child counter beforehand.
    pub fn child(&self, child_index: u32) -> Self {
        let mut v = self.0.clone();
        v.push(child_index);
        Self(v)
    }

    /// `lt(x, y)`: does `self` sort strictly before `other`?
    pub fn lt(&self, other: &Rank) -> bool {
        let shared = self.0.len().min(other.0.len());
        for i in 0..shared {
            if self.0[i] != other.0[i] {
                return self.0[i] < other.0[i];
            }
        }
        // Prefix-equal up to the shorter length: the longer one is less.
        self.0.len() > other.0.len()
    }
}

/// Pairing-heap node links, stored inline in the process arena slot
/// rather than in a separate heap-node allocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapLinks {
    pub child: Option<ProcessId>,
    pub sibling: Option<ProcessId>,
}

/// A pairing heap of scheduled processes, ordered by publisher rank.
///
/// Links live inside each process's own arena slot (see
/// [`crate::model::Process::heap`]), so the heap itself is just the
/// root id — no separate node allocation per entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct Heap {
    root: Option<ProcessId>,
}

impl Heap {
    pub fn new() -> Self {
        Self { root: None }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn peek(&self) -> Option<ProcessId> {
        self.root
    }

    pub fn enqueue(
        &mut self,
        p: ProcessId,
        get_links: &mut impl FnMut(ProcessId) -> &mut HeapLinks,
        rank_of: &impl Fn(ProcessId) -> Rank,
    ) {
        self.root = Some(match self.root {
            None => p,
            Some(root) => link_nodes(p, root, get_links, rank_of),
        });
    }

    /// Removes and returns the current root, re-forming the heap from
    /// its children by pairing siblings left-to-right then folding
    /// the resulting list right-to-left with [`link_nodes`].
    pub fn dequeue(
        &mut self,
        get_links: &mut impl FnMut(ProcessId) -> &mut HeapLinks,
        rank_of: &impl Fn(ProcessId) -> Rank,
    ) -> Option<ProcessId> {
        let root = self.root.take()?;
        let first_child = get_links(root).child.take();
        self.root = merge_pairs(first_child, get_links, rank_of);
        Some(root)
    }
}

fn link_nodes(
    x: ProcessId,
    y: ProcessId,
    get_links: &mut impl FnMut(ProcessId) -> &mut HeapLinks,
    rank_of: &impl Fn(ProcessId) -> Rank,
) -> ProcessId {
    let (parent, child) = if rank_of(x).lt(&rank_of(y)) { (x, y) } else { (y, x) };
    let parent_links = get_links(parent);
    let old_first_child = parent_links.child;
    parent_links.child = Some(child);
    get_links(child).sibling = old_first_child;
    parent
}

/// Pairs siblings left-to-right, then folds the resulting list
/// right-to-left with [`link_nodes`].
fn merge_pairs(
    head: Option<ProcessId>,
    get_links: &mut impl FnMut(ProcessId) -> &mut HeapLinks,
    rank_of: &impl Fn(ProcessId) -> Rank,
) -> Option<ProcessId> {
    let Some(a) = head else { return None };
    let a_sibling = get_links(a).sibling.take();
    let Some(b) = a_sibling else { return Some(a) };
    let rest = get_links(b).sibling.take();
    let paired = link_nodes(a, b, get_links, rank_of);
    let rest_merged = merge_pairs(rest, get_links, rank_of);
    match rest_merged {
        None => Some(paired),
        Some(other) => Some(link_nodes(paired, other, get_links, rank_of)),
    }
}
