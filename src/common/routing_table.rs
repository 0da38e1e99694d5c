//! Kademlia routing table with bucket splitting.
//!
//! The table starts with a single k-bucket covering the whole id space. Bucket `i`
//! holds contacts sharing exactly `i` leading bits with the local id, except the last
//! bucket, which holds every contact sharing at least `i` bits; that is the only
//! bucket that covers the local id, and the only one that is ever split.

use std::time::{Duration, Instant};

use crate::common::{Id, Node, NUM_BUCKETS};

/// K = the default maximum size of a k-bucket.
pub const MAX_BUCKET_SIZE_K: usize = 20;

#[derive(Debug, Clone)]
/// Kademlia routing table
pub struct RoutingTable {
    id: Id,
    buckets: Vec<KBucket>,
}

#[derive(Debug, Clone, PartialEq)]
/// Result of [RoutingTable::update].
pub enum UpdateOutcome {
    /// The node is this table's own id.
    Ignored,
    /// The node was already known, and is now the freshest in its bucket.
    Refreshed,
    /// The node was added to its bucket.
    Inserted,
    /// The bucket is full and can't be split, the node was kept as a replacement candidate.
    ///
    /// `ping` is the least recently seen node of that bucket, that should be pinged and
    /// [evicted](RoutingTable::evict) if it doesn't respond. It is `None` if a ping is
    /// already inflight for that bucket.
    Full { ping: Option<Node> },
}

impl RoutingTable {
    /// Create a new [RoutingTable] with a given id.
    pub fn new(id: Id) -> Self {
        RoutingTable {
            id,
            buckets: vec![KBucket::new(Instant::now())],
        }
    }

    /// Returns the [Id] of this node, where the distance is measured from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Returns the k-buckets ordered by the length of the prefix they share with [Self::id].
    pub fn buckets(&self) -> &[KBucket] {
        &self.buckets
    }

    // === Public Methods ===

    /// Insert or refresh a node.
    pub fn update(&mut self, node: Node) -> UpdateOutcome {
        self.update_at(node, Instant::now())
    }

    pub(crate) fn update_at(&mut self, mut node: Node, now: Instant) -> UpdateOutcome {
        if node.id == self.id {
            return UpdateOutcome::Ignored;
        }

        node.last_seen = now;

        loop {
            let index = self.bucket_index(&node.id);
            let can_split = index == self.buckets.len() - 1 && self.buckets.len() < NUM_BUCKETS;
            let bucket = &mut self.buckets[index];

            bucket.last_touched = now;

            if let Some(position) = bucket.position(&node.id) {
                bucket.nodes.remove(position);
                bucket.nodes.insert(0, node);

                return UpdateOutcome::Refreshed;
            }

            if bucket.nodes.len() < MAX_BUCKET_SIZE_K {
                bucket.replacements.retain(|n| n.id != node.id);
                bucket.nodes.insert(0, node);

                return UpdateOutcome::Inserted;
            }

            if can_split {
                self.split_last();
                continue;
            }

            bucket.add_replacement(node);

            let ping = if bucket.pinging.is_none() {
                let oldest = bucket.nodes.last().cloned();
                bucket.pinging = oldest.as_ref().map(|n| n.id);
                oldest
            } else {
                None
            };

            return UpdateOutcome::Full { ping };
        }
    }

    /// Remove an unresponsive node, replacing it with the freshest replacement candidate if any.
    ///
    /// Returns the promoted replacement.
    pub fn evict(&mut self, node_id: &Id) -> Option<Node> {
        let index = self.bucket_index(node_id);
        let bucket = &mut self.buckets[index];

        if bucket.pinging.as_ref() == Some(node_id) {
            bucket.pinging = None;
        }

        let position = bucket.position(node_id)?;
        bucket.nodes.remove(position);

        if bucket.replacements.is_empty() {
            return None;
        }

        let replacement = bucket.replacements.remove(0);
        bucket.nodes.insert(0, replacement.clone());

        Some(replacement)
    }

    /// The pinged node responded, the bucket may ping again on the next overflow.
    pub fn ping_answered(&mut self, node_id: &Id) {
        let index = self.bucket_index(node_id);
        let bucket = &mut self.buckets[index];

        if bucket.pinging.as_ref() == Some(node_id) {
            bucket.pinging = None;
        }
    }

    /// Remove a node from this routing table.
    pub fn remove(&mut self, node_id: &Id) {
        let index = self.bucket_index(node_id);
        self.buckets[index].nodes.retain(|node| &node.id != node_id);
    }

    /// Return up to `count` nodes sorted by ascending distance to the target.
    ///
    /// Equal distances (only possible with duplicate ids) prefer the most recently seen node.
    pub fn find_closest(&self, target: &Id, count: usize) -> Vec<Node> {
        let mut closest: Vec<Node> = Vec::with_capacity(count);
        let start = self.bucket_index(target);

        // Nodes in the target's bucket are closer than nodes in any further bucket,
        // which are all closer than nodes in any nearer bucket, so scanning these
        // tiers in order and stopping after a complete tier is exact.
        closest.extend(self.buckets[start].nodes.iter().cloned());

        if closest.len() < count {
            for bucket in &self.buckets[start + 1..] {
                closest.extend(bucket.nodes.iter().cloned());
            }
        }

        for bucket in self.buckets[..start].iter().rev() {
            if closest.len() >= count {
                break;
            }
            closest.extend(bucket.nodes.iter().cloned());
        }

        closest.sort_by(|a, b| {
            target
                .closer(&a.id, &b.id)
                .then_with(|| b.last_seen.cmp(&a.last_seen))
        });
        closest.truncate(count);

        closest
    }

    /// Return the indices of buckets that were not touched within `threshold`.
    pub fn stale_buckets(&self, threshold: Duration) -> Vec<usize> {
        self.stale_buckets_at(threshold, Instant::now())
    }

    pub(crate) fn stale_buckets_at(&self, threshold: Duration, now: Instant) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, bucket)| now.saturating_duration_since(bucket.last_touched) >= threshold)
            .map(|(index, _)| index)
            .collect()
    }

    /// Mark the bucket covering `target` as recently used.
    pub fn touch(&mut self, target: &Id) {
        self.touch_at(target, Instant::now())
    }

    pub(crate) fn touch_at(&mut self, target: &Id, now: Instant) {
        let index = self.bucket_index(target);
        self.buckets[index].last_touched = now;
    }

    /// A random [Id] within the range covered by the bucket at `index`.
    pub fn random_id_in_bucket(&self, index: usize) -> Id {
        if index >= self.buckets.len() - 1 {
            self.id.random_within(index)
        } else {
            self.id.random_with_prefix(index)
        }
    }

    /// Returns `true` if this routing table is empty.
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|bucket| bucket.is_empty())
    }

    /// Return the number of nodes in this routing table.
    pub fn size(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.nodes.len()).sum()
    }

    /// Returns an iterator over the nodes in this routing table.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.buckets.iter().flat_map(|bucket| bucket.nodes.iter())
    }

    /// Export an owned vector of nodes from this routing table.
    pub fn to_owned_nodes(&self) -> Vec<Node> {
        self.nodes().cloned().collect()
    }

    /// Turn this routing table to a list of bootstrapping nodes.
    pub fn to_bootstrap(&self) -> Vec<String> {
        self.nodes().map(|n| n.address().to_string()).collect()
    }

    pub fn contains(&self, node_id: &Id) -> bool {
        self.buckets[self.bucket_index(node_id)]
            .position(node_id)
            .is_some()
    }

    // === Private Methods ===

    fn bucket_index(&self, id: &Id) -> usize {
        self.id.prefix_len(id).min(self.buckets.len() - 1)
    }

    /// Split the last bucket by the next prefix bit.
    fn split_last(&mut self) {
        let index = self.buckets.len() - 1;
        let id = self.id;

        let last = &mut self.buckets[index];
        let mut next = KBucket::new(last.last_touched);

        let (far, near): (Vec<Node>, Vec<Node>) = last
            .nodes
            .drain(..)
            .partition(|node| id.prefix_len(&node.id) == index);
        last.nodes = far;
        next.nodes = near;

        let (far, near): (Vec<Node>, Vec<Node>) = last
            .replacements
            .drain(..)
            .partition(|node| id.prefix_len(&node.id) == index);
        last.replacements = far;
        next.replacements = near;

        if let Some(pinging) = last.pinging {
            if id.prefix_len(&pinging) != index {
                last.pinging = None;
                next.pinging = Some(pinging);
            }
        }

        self.buckets.push(next);
    }
}

/// Kbuckets are similar to LRU caches that checks and evicts unresponsive nodes,
/// without dropping any responsive nodes in the process.
#[derive(Debug, Clone)]
pub struct KBucket {
    /// Nodes in the k-bucket, freshest first.
    nodes: Vec<Node>,
    /// Candidates waiting for a spot, freshest first.
    replacements: Vec<Node>,
    /// The least recently seen node currently being pinged.
    pinging: Option<Id>,
    last_touched: Instant,
}

impl KBucket {
    fn new(now: Instant) -> Self {
        KBucket {
            nodes: Vec::with_capacity(MAX_BUCKET_SIZE_K),
            replacements: Vec::new(),
            pinging: None,
            last_touched: now,
        }
    }

    // === Getters ===

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn replacements(&self) -> &[Node] {
        &self.replacements
    }

    pub fn last_touched(&self) -> Instant {
        self.last_touched
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    // === Private Methods ===

    fn position(&self, id: &Id) -> Option<usize> {
        self.nodes.iter().position(|n| &n.id == id)
    }

    fn add_replacement(&mut self, node: Node) {
        self.replacements.retain(|n| n.id != node.id);
        self.replacements.insert(0, node);
        self.replacements.truncate(MAX_BUCKET_SIZE_K);
    }
}
