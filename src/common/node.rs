//! Struct and implementation of the Node entry in the Kademlia routing table
use std::{
    fmt::{self, Debug, Formatter},
    net::SocketAddrV4,
    time::Instant,
};

use crate::common::Id;

#[derive(Clone)]
/// Node entry in Kademlia routing table, also used as a publisher contact in the record store.
pub struct Node {
    pub id: Id,
    pub address: SocketAddrV4,
    pub(crate) last_seen: Instant,
}

impl Node {
    /// Creates a new Node from an id and socket address.
    pub fn new(id: Id, address: SocketAddrV4) -> Node {
        Node {
            id,
            address,
            last_seen: Instant::now(),
        }
    }

    /// Creates a node with random Id for testing purposes.
    pub fn random() -> Node {
        Node::new(Id::random(), SocketAddrV4::new(0.into(), 0))
    }

    #[cfg(test)]
    pub(crate) fn unique(i: usize) -> Node {
        Node::new(
            Id::random(),
            SocketAddrV4::new((i as u32).into(), (i % u16::MAX as usize) as u16),
        )
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn address(&self) -> SocketAddrV4 {
        self.address
    }

    /// When did we last hear from this node.
    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    // === Public Methods ===

    /// Node [Self::id] and [Self::address] are the same as the other node's.
    pub fn same_contact(&self, other: &Node) -> bool {
        self.id == other.id && self.address == other.address
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.same_contact(other)
    }
}

impl Eq for Node {}

impl Debug for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("address", &self.address)
            .finish()
    }
}
