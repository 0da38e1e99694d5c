use std::vec::IntoIter;

use crate::common::{Id, Node};

#[derive(Debug, Clone)]
/// Nodes sorted by their distance to a target, without duplicate ids.
pub struct ClosestNodes {
    target: Id,
    nodes: Vec<Node>,
}

impl ClosestNodes {
    pub fn new(target: Id) -> Self {
        Self {
            target,
            nodes: Vec::with_capacity(200),
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.target
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    // === Public Methods ===

    /// Insert a node at its sorted position, returns `false` if it was already there.
    pub fn add(&mut self, node: Node) -> bool {
        let seek = node.id.distance(&self.target);

        match self
            .nodes
            .binary_search_by(|node| node.id.distance(&self.target).cmp(&seek))
        {
            Err(pos) => {
                self.nodes.insert(pos, node);
                true
            }
            Ok(_) => false,
        }
    }
}

impl IntoIterator for ClosestNodes {
    type Item = Node;
    type IntoIter = IntoIter<Node>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.into_iter()
    }
}

impl<'a> IntoIterator for &'a ClosestNodes {
    type Item = &'a Node;
    type IntoIter = std::slice::Iter<'a, Node>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add() {
        let target = Id::random();

        let mut closest_nodes = ClosestNodes::new(target);

        for _ in 0..10 {
            let node = Node::random();
            assert!(closest_nodes.add(node.clone()));
            assert!(!closest_nodes.add(node));
        }

        assert_eq!(closest_nodes.nodes().len(), 10);

        let distances = closest_nodes
            .nodes()
            .iter()
            .map(|n| n.id.distance(&target))
            .collect::<Vec<_>>();

        let mut sorted = distances.clone();
        sorted.sort();

        assert_eq!(sorted, distances);
    }
}
