//! Manage iterative lookups, round by round.

use std::collections::HashSet;

use tracing::{debug, trace};

use crate::common::{ClosestNodes, Id, Node, MAX_BUCKET_SIZE_K};

/// Lookup parallelism: how many nodes are queried per round.
pub const ALPHA: usize = 3;

/// An iterative process of concurrently sending a request to the closest known nodes to
/// the target, collecting closer nodes from their responses, and repeating until a round
/// discovers nothing closer. A final round then queries whatever is left unvisited among
/// the k closest candidates.
///
/// This type only decides who to query next, the caller sends the requests and reports
/// back with [Self::add_response].
#[derive(Debug)]
pub(crate) struct IterativeQuery {
    /// Every node we heard of, queried or not.
    closest: ClosestNodes,
    /// Nodes that answered.
    responders: ClosestNodes,
    visited: HashSet<Id>,
    responded: HashSet<Id>,
    /// Closest node known before the current round started.
    best_before_round: Option<Id>,
    rounds: usize,
    /// The last round, querying the unvisited among the k closest.
    final_round: bool,
    done: bool,
}

impl IterativeQuery {
    pub fn new(target: Id, seeds: impl IntoIterator<Item = Node>) -> Self {
        let mut closest = ClosestNodes::new(target);

        for node in seeds {
            closest.add(node);
        }

        trace!(?target, seeds = closest.len(), "New lookup");

        Self {
            closest,
            responders: ClosestNodes::new(target),
            visited: HashSet::new(),
            responded: HashSet::new(),
            best_before_round: None,
            rounds: 0,
            final_round: false,
            done: false,
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.closest.target()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    // === Public Methods ===

    /// Select up to [ALPHA] of the closest nodes not yet queried, and mark them as visited.
    /// The final round selects every unvisited node among the k closest instead.
    ///
    /// Returns an empty list once the lookup is done.
    pub fn next_round(&mut self) -> Vec<Node> {
        if self.done {
            return vec![];
        }

        if self.final_round {
            return self.finish();
        }

        let best = self.closest.nodes().first().map(|node| node.id);

        let converged = if self.rounds > 0 && best == self.best_before_round {
            debug!(target = ?self.target(), rounds = self.rounds, "Round found nothing closer");
            true
        } else if self.responders.len() >= MAX_BUCKET_SIZE_K && !self.has_closer_unvisited() {
            debug!(target = ?self.target(), rounds = self.rounds, "K nodes responded");
            true
        } else {
            false
        };

        let candidates = self.closest.nodes().iter();

        // Once converged, query every remaining candidate among the k closest at once.
        let round = if converged {
            candidates
                .take(MAX_BUCKET_SIZE_K)
                .filter(|node| !self.visited.contains(&node.id))
                .cloned()
                .collect::<Vec<_>>()
        } else {
            candidates
                .filter(|node| !self.visited.contains(&node.id))
                .take(ALPHA)
                .cloned()
                .collect::<Vec<_>>()
        };
        self.final_round = converged;

        if round.is_empty() {
            return self.finish();
        }

        for node in &round {
            self.visited.insert(node.id);
        }

        self.best_before_round = best;
        self.rounds += 1;

        round
    }

    /// Record a node's answer, and the nodes it says are close to the target.
    pub fn add_response(&mut self, from: Node, nodes: impl IntoIterator<Item = Node>) {
        for node in nodes {
            self.closest.add(node);
        }

        self.responded.insert(from.id);
        self.closest.add(from.clone());
        self.responders.add(from);
    }

    /// The k closest nodes observed, sorted by distance to the target, excluding
    /// nodes that were queried and never answered.
    pub fn into_closest(self) -> Vec<Node> {
        let Self {
            closest,
            visited,
            responded,
            ..
        } = self;

        closest
            .into_iter()
            .filter(|node| !visited.contains(&node.id) || responded.contains(&node.id))
            .take(MAX_BUCKET_SIZE_K)
            .collect()
    }

    // === Private Methods ===

    fn finish(&mut self) -> Vec<Node> {
        self.done = true;

        debug!(
            target = ?self.target(),
            candidates = self.closest.len(),
            visited = self.visited.len(),
            responders = self.responders.len(),
            "Done lookup"
        );

        vec![]
    }

    /// Is any unvisited candidate closer than the k-th closest responder.
    fn has_closer_unvisited(&self) -> bool {
        let kth = match self.responders.nodes().get(MAX_BUCKET_SIZE_K - 1) {
            Some(node) => node.id,
            None => return true,
        };
        let target = self.target();

        self.closest
            .nodes()
            .iter()
            .take_while(|node| target.closer(&node.id, &kth).is_lt())
            .any(|node| !self.visited.contains(&node.id))
    }
}
