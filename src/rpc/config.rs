use std::net::SocketAddrV4;
use std::time::Duration;

use crate::common::Id;

use super::{
    DEFAULT_BOOTSTRAP_NODES, DEFAULT_MAX_TRIES, DEFAULT_PORT, DEFAULT_REQUEST_TIMEOUT,
    MAINTENANCE_INTERVAL, T_EXPIRE, T_REFRESH, T_REPLICATE, T_REPUBLISH,
};

#[derive(Debug, Clone)]
/// Dht Configurations
pub struct Config {
    /// Local address to bind the UDP socket to.
    ///
    /// Defaults to `0.0.0.0:4444`
    pub address: SocketAddrV4,
    /// Bootstrap nodes as `host:port`.
    ///
    /// Defaults to [DEFAULT_BOOTSTRAP_NODES]
    pub bootstrap: Vec<String>,
    /// Explicit node Id.
    ///
    /// Defaults to None, where a random Id is generated at startup.
    pub id: Option<Id>,
    /// Port announced to other nodes as where this node serves announced content.
    ///
    /// Defaults to None, where the port of [Self::address] is used.
    pub peer_port: Option<u16>,
    /// How long to wait for a response before retrying a request.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]
    pub request_timeout: Duration,
    /// How many times a request is sent before it is considered timed out.
    ///
    /// Defaults to [DEFAULT_MAX_TRIES]
    pub max_tries: usize,
    /// Maintenance intervals.
    pub timings: Timings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: SocketAddrV4::new([0, 0, 0, 0].into(), DEFAULT_PORT),
            bootstrap: DEFAULT_BOOTSTRAP_NODES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            id: None,
            peer_port: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_tries: DEFAULT_MAX_TRIES,
            timings: Timings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Intervals driving records expiry and background maintenance.
pub struct Timings {
    /// Time after which a stored record is dropped, unless stored again.
    pub expire: Duration,
    /// Time after which an untouched k-bucket is refreshed with a lookup.
    pub refresh: Duration,
    /// Interval between replicating stored records to the closest nodes.
    pub replicate: Duration,
    /// Time after which an announced key is announced again.
    pub republish: Duration,
    /// How often maintenance checks which of the above is due.
    pub maintenance_interval: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            expire: T_EXPIRE,
            refresh: T_REFRESH,
            replicate: T_REPLICATE,
            republish: T_REPUBLISH,
            maintenance_interval: MAINTENANCE_INTERVAL,
        }
    }
}
