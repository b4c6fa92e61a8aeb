//! Incrementally resizing hash index.
//!
//! `HMap` is a chained hash table built from two tables: `primary`, which
//! receives every insert, and `retiring`, which only exists while a resize
//! is in flight. Growing never rehashes the whole table at once. Instead,
//! every `insert`, `lookup` and `pop` first moves a bounded number of nodes
//! from `retiring` into `primary`, so the cost of a resize is spread over
//! many calls and the worst-case latency of a single call does not depend
//! on the size of the table.
//!
//! ## Nodes
//!
//! Entries are intrusive nodes: each `HNode` carries a precomputed hash code
//! and a forward link next to the caller's record. The index never computes
//! hashes and never compares records; callers provide the hash code when
//! building a node and an equality predicate on every search.
//!
//! Nodes live in a slab arena and are addressed by `NodeId` handles. Chains
//! link handles, not pointers, so migrating a node between tables only
//! rewrites links and the handle stays valid until the node is popped.
//!
//! ```text
//!  primary (2n buckets)            retiring (n buckets)
//!  |0|1|2|3|...                    |0|1|2|...        <- cursor
//!   |   |                               |
//!  [a] [c]                             [x] -> [y]
//!   |
//!  [b]
//! ```

use slab::Slab;
use tracing::debug;

/// Number of buckets allocated by the first insert.
const INITIAL_BUCKETS: usize = 4;

/// Entries per bucket that trigger a resize.
pub const MAX_LOAD_FACTOR: usize = 8;

/// Units of migration work performed per call while resizing.
pub const RESIZE_WORK: usize = 128;

/// Handle to a node stored in an `HMap`.
pub type NodeId = usize;

/// An intrusive hash node: hash code, forward link, and the caller's record.
#[derive(Debug)]
pub struct HNode<T> {
    hcode: u64,
    next: Option<NodeId>,
    value: T,
}

impl<T> HNode<T> {
    /// Create an unlinked node with a precomputed hash code.
    pub fn new(hcode: u64, value: T) -> Self {
        Self {
            hcode,
            next: None,
            value,
        }
    }

    pub fn hcode(&self) -> u64 {
        self.hcode
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut T {
        &mut self.value
    }

    pub fn into_value(self) -> T {
        self.value
    }
}

/// One bucket array with its chains.
#[derive(Debug, Default)]
struct HTab {
    /// Chain heads. Empty until the first insert.
    slots: Box<[Option<NodeId>]>,
    mask: usize,
    size: usize,
}

impl HTab {
    fn with_buckets(n: usize) -> Self {
        assert!(n.is_power_of_two(), "bucket count must be a power of two");
        Self {
            slots: vec![None; n].into_boxed_slice(),
            mask: n - 1,
            size: 0,
        }
    }

    fn is_allocated(&self) -> bool {
        !self.slots.is_empty()
    }

    fn buckets(&self) -> usize {
        self.slots.len()
    }

    fn bucket_of(&self, hcode: u64) -> usize {
        (hcode as usize) & self.mask
    }

    /// Push a node at the head of its chain.
    fn link<T>(&mut self, nodes: &mut Slab<HNode<T>>, id: NodeId) {
        let pos = self.bucket_of(nodes[id].hcode);
        nodes[id].next = self.slots[pos];
        self.slots[pos] = Some(id);
        self.size += 1;
    }

    /// Find a matching node, returning `(predecessor, node)`.
    fn find<T, F>(
        &self,
        nodes: &Slab<HNode<T>>,
        hcode: u64,
        eq: &mut F,
    ) -> Option<(Option<NodeId>, NodeId)>
    where
        F: FnMut(&T) -> bool,
    {
        if !self.is_allocated() {
            return None;
        }

        let mut prev = None;
        let mut cur = self.slots[self.bucket_of(hcode)];
        while let Some(id) = cur {
            let node = &nodes[id];
            if node.hcode == hcode && eq(&node.value) {
                return Some((prev, id));
            }
            prev = Some(id);
            cur = node.next;
        }
        None
    }

    /// Remove a node from its chain given its predecessor.
    fn unlink<T>(&mut self, nodes: &mut Slab<HNode<T>>, prev: Option<NodeId>, id: NodeId) {
        let next = nodes[id].next.take();
        match prev {
            Some(prev) => nodes[prev].next = next,
            None => {
                let pos = self.bucket_of(nodes[id].hcode);
                self.slots[pos] = next;
            }
        }
        self.size -= 1;
    }
}

/// Hash index with progressive (incremental) resizing.
#[derive(Debug)]
pub struct HMap<T> {
    nodes: Slab<HNode<T>>,
    primary: HTab,
    /// Old table being drained. `Some` only while resizing.
    retiring: Option<HTab>,
    /// Next bucket of `retiring` to drain.
    cursor: usize,
    resize_work: usize,
}

impl<T> Default for HMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HMap<T> {
    pub fn new() -> Self {
        Self::with_resize_work(RESIZE_WORK)
    }

    /// Create an index that performs `work` units of migration per call.
    pub fn with_resize_work(work: usize) -> Self {
        Self {
            nodes: Slab::new(),
            primary: HTab::default(),
            retiring: None,
            cursor: 0,
            resize_work: work.max(1),
        }
    }

    /// Insert a node into the primary table.
    ///
    /// The index does not check for duplicates; callers look up first when
    /// they need replace semantics.
    pub fn insert(&mut self, node: HNode<T>) -> NodeId {
        if !self.primary.is_allocated() {
            self.primary = HTab::with_buckets(INITIAL_BUCKETS);
        }

        let id = self.nodes.insert(node);
        self.primary.link(&mut self.nodes, id);

        if self.retiring.is_none()
            && self.primary.size / self.primary.buckets() >= MAX_LOAD_FACTOR
        {
            self.start_resizing();
        }
        self.help_resizing();
        id
    }

    /// Find the node with `hcode` for which `eq` holds.
    pub fn lookup<F>(&mut self, hcode: u64, mut eq: F) -> Option<&mut HNode<T>>
    where
        F: FnMut(&T) -> bool,
    {
        self.help_resizing();

        let found = self
            .primary
            .find(&self.nodes, hcode, &mut eq)
            .or_else(|| {
                self.retiring
                    .as_ref()
                    .and_then(|tab| tab.find(&self.nodes, hcode, &mut eq))
            });

        match found {
            Some((_, id)) => self.nodes.get_mut(id),
            None => None,
        }
    }

    /// Remove and return the node with `hcode` for which `eq` holds.
    pub fn pop<F>(&mut self, hcode: u64, mut eq: F) -> Option<HNode<T>>
    where
        F: FnMut(&T) -> bool,
    {
        self.help_resizing();

        if let Some((prev, id)) = self.primary.find(&self.nodes, hcode, &mut eq) {
            self.primary.unlink(&mut self.nodes, prev, id);
            return Some(self.nodes.remove(id));
        }

        let retiring = self.retiring.as_mut()?;
        let (prev, id) = retiring.find(&self.nodes, hcode, &mut eq)?;
        retiring.unlink(&mut self.nodes, prev, id);
        let node = self.nodes.remove(id);
        self.finish_resizing_if_drained();
        Some(node)
    }

    /// Number of nodes in the index.
    pub fn size(&self) -> usize {
        self.primary.size + self.retiring.as_ref().map_or(0, |tab| tab.size)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Free both bucket arrays and every node, leaving an empty index.
    pub fn destroy(&mut self) {
        self.nodes = Slab::new();
        self.primary = HTab::default();
        self.retiring = None;
        self.cursor = 0;
    }

    pub fn get(&self, id: NodeId) -> Option<&HNode<T>> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut HNode<T>> {
        self.nodes.get_mut(id)
    }

    /// Iterate over all nodes in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = &HNode<T>> {
        self.nodes.iter().map(|(_, node)| node)
    }

    /// Whether a resize is in flight.
    pub fn is_resizing(&self) -> bool {
        self.retiring.is_some()
    }

    /// Bucket count of the primary table (0 before the first insert).
    pub fn bucket_count(&self) -> usize {
        self.primary.buckets()
    }

    fn start_resizing(&mut self) {
        debug_assert!(self.retiring.is_none());
        let buckets = self.primary.buckets() * 2;
        let old = std::mem::replace(&mut self.primary, HTab::with_buckets(buckets));
        debug!(
            from = old.buckets(),
            to = buckets,
            entries = old.size,
            "Starting incremental resize"
        );
        self.retiring = Some(old);
        self.cursor = 0;
    }

    /// Move up to `resize_work` nodes from `retiring` into `primary`.
    ///
    /// Skipping an empty bucket counts as a unit of work too, so a sparse
    /// retiring table cannot stall a single call.
    fn help_resizing(&mut self) {
        let Some(retiring) = self.retiring.as_mut() else {
            return;
        };

        let mut work = 0;
        while work < self.resize_work && retiring.size > 0 {
            match retiring.slots[self.cursor] {
                None => self.cursor += 1,
                Some(id) => {
                    retiring.slots[self.cursor] = self.nodes[id].next.take();
                    retiring.size -= 1;
                    self.primary.link(&mut self.nodes, id);
                }
            }
            work += 1;
        }

        self.finish_resizing_if_drained();
    }

    fn finish_resizing_if_drained(&mut self) {
        if self.retiring.as_ref().is_some_and(|tab| tab.size == 0) {
            self.retiring = None;
            self.cursor = 0;
            debug!(buckets = self.primary.buckets(), "Incremental resize finished");
        }
    }
}
