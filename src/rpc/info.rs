use std::net::SocketAddrV4;

use crate::common::Id;

use super::Rpc;

/// Information and statistics about this node.
#[derive(Debug, Clone)]
pub struct Info {
    id: Id,
    local_addr: SocketAddrV4,
    routing_table_size: usize,
    records: usize,
    inflight_requests: usize,
}

impl Info {
    /// This Node's [Id]
    pub fn id(&self) -> &Id {
        &self.id
    }
    /// Local UDP Ipv4 socket address that this node is listening on.
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }
    /// Number of contacts in the routing table.
    pub fn routing_table_size(&self) -> usize {
        self.routing_table_size
    }
    /// Number of records stored for other nodes, and ourselves.
    pub fn records(&self) -> usize {
        self.records
    }
    /// Requests still waiting for a response.
    pub fn inflight_requests(&self) -> usize {
        self.inflight_requests
    }
}

impl From<&Rpc> for Info {
    fn from(rpc: &Rpc) -> Self {
        Self {
            id: *rpc.id(),
            local_addr: rpc.local_addr(),
            routing_table_size: rpc.routing_table().size(),
            records: rpc.records().len(),
            inflight_requests: rpc.transactions().len(),
        }
    }
}
