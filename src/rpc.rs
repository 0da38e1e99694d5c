//! K-RPC implementation: node state shared between the reader, the dispatcher,
//! the maintenance loop and callers.

mod config;
mod info;
mod iterative_query;
mod maintenance;
pub mod server;
mod socket;
mod transactions;

use std::net::{SocketAddrV4, ToSocketAddrs};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};

use crate::common::{
    messages::to_v4, FindNodeRequestArguments, FindValueRequestArguments,
    FindValueResponseArguments, Id, Message, MessageType, Node, RequestSpecific,
    ResponseSpecific, RoutingTable, StoreRequestArguments, TransactionId, UpdateOutcome,
    STORE_SUCCESS_RESPONSE,
};

pub use config::{Config, Timings};
pub use info::Info;
pub use iterative_query::ALPHA;
pub use maintenance::{Maintenance, MaintenanceDecisions};
pub use server::{Record, RecordStore};
pub use socket::{KrpcSocket, SendMessageError, MTU};
pub use transactions::{PendingRequest, Reply, RequestError, Transactions};

use iterative_query::IterativeQuery;

pub const DEFAULT_BOOTSTRAP_NODES: [&str; 3] = [
    "lbrynet1.lbry.io:4444",
    "lbrynet2.lbry.io:4444",
    "lbrynet3.lbry.io:4444",
];

pub const DEFAULT_PORT: u16 = 4444;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_TRIES: usize = 3;

/// Time after which a stored record expires.
pub const T_EXPIRE: Duration = Duration::from_secs(86400);
/// Time after which an untouched bucket needs refreshing.
pub const T_REFRESH: Duration = Duration::from_secs(3600);
/// Interval between replicating stored records.
pub const T_REPLICATE: Duration = Duration::from_secs(3600);
/// Time after which an original publisher republishes a key.
pub const T_REPUBLISH: Duration = Duration::from_secs(86400);
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
/// Internal Rpc called in the Dht threads.
pub struct Rpc {
    id: Id,
    config: Config,
    socket: Arc<KrpcSocket>,
    routing_table: RwLock<RoutingTable>,
    records: RwLock<RecordStore>,
    transactions: Transactions,
    /// Pings to the least recently seen node of full buckets.
    eviction_pings: Mutex<Vec<EvictionPing>>,
}

#[derive(Debug)]
struct EvictionPing {
    node: Node,
    request: PendingRequest,
}

/// Result of an iterative lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// The closest nodes found, sorted by distance to the target.
    Nodes(Vec<Node>),
    /// Publishers of the looked up key, as returned by the first node that had any.
    Values(Vec<Node>),
}

impl Rpc {
    /// Bind the socket and create an empty node.
    pub fn new(config: Config) -> Result<Self, std::io::Error> {
        let id = config.id.unwrap_or_else(Id::random);
        let socket = Arc::new(KrpcSocket::bind(config.address)?);

        info!(?id, local_addr = ?socket.local_addr(), "Listening");

        Ok(Rpc {
            id,
            routing_table: RwLock::new(RoutingTable::new(id)),
            records: RwLock::new(RecordStore::new(
                config.timings.expire,
                config.timings.republish,
            )),
            transactions: Transactions::new(
                socket.clone(),
                id,
                config.request_timeout,
                config.max_tries,
            ),
            socket,
            config,
            eviction_pings: Mutex::new(Vec::new()),
        })
    }

    // === Getters ===

    /// Returns the node's Id
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Returns the address the server is listening to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.socket.local_addr()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn socket(&self) -> &KrpcSocket {
        &self.socket
    }

    pub fn routing_table(&self) -> RwLockReadGuard<'_, RoutingTable> {
        self.routing_table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn records(&self) -> RwLockReadGuard<'_, RecordStore> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn transactions(&self) -> &Transactions {
        &self.transactions
    }

    /// The port announced to other nodes along our store requests.
    pub fn peer_port(&self) -> u16 {
        self.config
            .peer_port
            .unwrap_or_else(|| self.local_addr().port())
    }

    // === Inbound ===

    /// Decode and handle a single datagram.
    ///
    /// Malformed packets, uncorrelated answers and our own traffic are logged and dropped.
    pub fn handle_packet(&self, bytes: &[u8], from: SocketAddrV4) {
        let message = match Message::from_bytes(bytes) {
            Ok(message) => message,
            Err(error) => {
                debug!(context = "socket_validation", ?from, ?error, "Dropping malformed packet");
                return;
            }
        };

        trace!(context = "socket_message_receiving", ?message, ?from);

        if message.node_id == self.id {
            warn!(?from, "Ignoring a message claiming our own id");
            return;
        }

        match &message.message_type {
            MessageType::Request(request) => {
                server::handle_request(self, from, message.transaction_id, request);

                self.add_node(Node::new(message.node_id, from));
            }
            MessageType::Response(_) | MessageType::Error(_) => {
                // The responder is known before whoever waits on the answer wakes up.
                self.transactions.resolve_with(&message, from, || {
                    self.add_node(Node::new(message.node_id, from))
                });
            }
        }
    }

    /// Advance request retries and timeouts, and conclude eviction pings.
    pub fn tick(&self) {
        self.transactions.tick();

        let concluded = {
            let mut pings = self.eviction_pings.lock().unwrap_or_else(PoisonError::into_inner);
            let mut concluded = vec![];

            pings.retain(|ping| match ping.request.try_result() {
                Some(result) => {
                    concluded.push((ping.node.clone(), result));
                    false
                }
                None => true,
            });

            concluded
        };

        for (node, result) in concluded {
            let mut routing_table = self.routing_table_mut();

            match result {
                Ok(reply) if reply.from.id == node.id => routing_table.ping_answered(&node.id),
                _ => {
                    let promoted = routing_table.evict(&node.id);
                    debug!(evicted = ?node, ?promoted, "Evicted unresponsive node");
                }
            }
        }
    }

    /// Add or refresh a node in the routing table, pinging the oldest node of a full bucket.
    pub fn add_node(&self, node: Node) {
        let outcome = self.routing_table_mut().update(node);

        if let UpdateOutcome::Full { ping: Some(oldest) } = outcome {
            match self.transactions.send(oldest.address, RequestSpecific::Ping) {
                Ok(request) => self
                    .eviction_pings
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(EvictionPing {
                        node: oldest,
                        request,
                    }),
                Err(error) => {
                    debug!(?oldest, ?error, "Failed to ping, evicting");
                    self.routing_table_mut().evict(&oldest.id);
                }
            }
        }
    }

    // === Outbound ===

    /// Send a request and return a handle to its outcome.
    pub fn request(
        &self,
        to: SocketAddrV4,
        request: RequestSpecific,
    ) -> Result<PendingRequest, RequestError> {
        self.transactions.send(to, request)
    }

    /// Ping an address and return the Id of the node behind it.
    pub fn ping(&self, address: SocketAddrV4) -> Result<Id, RequestError> {
        let reply = self.request(address, RequestSpecific::Ping)?.wait()?;

        Ok(reply.from.id)
    }

    /// Ask a node to store us, or another publisher, as a source of `key`.
    pub fn store(
        &self,
        to: SocketAddrV4,
        key: Id,
        publisher_id: Id,
        port: u16,
    ) -> Result<PendingRequest, RequestError> {
        self.request(
            to,
            RequestSpecific::Store(StoreRequestArguments {
                key,
                publisher_id,
                port,
            }),
        )
    }

    /// Iterative node lookup, returns the closest nodes to the target.
    pub fn lookup_node(&self, target: Id) -> Vec<Node> {
        match self.lookup(
            target,
            RequestSpecific::FindNode(FindNodeRequestArguments { target }),
        ) {
            Lookup::Nodes(nodes) | Lookup::Values(nodes) => nodes,
        }
    }

    /// Iterative value lookup, returns the publishers of a key.
    ///
    /// Returns local records without any network traffic if there are any.
    pub fn find_value(&self, key: Id) -> Vec<Node> {
        let local = self.records().get(&key);
        if !local.is_empty() {
            return local;
        }

        match self.lookup(key, RequestSpecific::FindValue(FindValueRequestArguments { key })) {
            Lookup::Values(values) => values,
            Lookup::Nodes(_) => vec![],
        }
    }

    /// Store ourselves as a publisher of `key` at the closest nodes, and remember it
    /// as an original record to republish.
    ///
    /// Returns the number of nodes that acknowledged the store.
    pub fn announce(&self, key: Id) -> usize {
        let port = self.peer_port();
        let publisher = Node::new(self.id, SocketAddrV4::new(*self.local_addr().ip(), port));

        self.records_mut()
            .publish_at(key, publisher.clone(), Instant::now());

        let nodes = self.lookup_node(key);

        let stored = self.store_at(&nodes, key, &publisher);

        debug!(?key, closest = nodes.len(), stored, "Announced");

        stored
    }

    /// Populate the routing table from the bootstrap nodes.
    ///
    /// Bootstrap nodes that fail to resolve or to respond are skipped.
    pub fn join(&self) {
        let local_addr = self.local_addr();

        let pings = self
            .config
            .bootstrap
            .iter()
            .flat_map(|bootstrap| match bootstrap.to_socket_addrs() {
                Ok(addresses) => addresses.collect::<Vec<_>>(),
                Err(error) => {
                    debug!(?bootstrap, ?error, "Failed to resolve bootstrap node");
                    vec![]
                }
            })
            .filter_map(|address| to_v4(address).ok())
            .filter(|address| address != &local_addr)
            .filter_map(|address| self.request(address, RequestSpecific::Ping).ok())
            .collect::<Vec<_>>();

        // Responding bootstrap nodes are added to the routing table by the dispatcher.
        for ping in pings {
            let _ = ping.wait();
        }

        self.lookup_node(self.id);

        let table_size = self.routing_table().size();

        if table_size == 0 {
            error!("Could not bootstrap the routing table");
        } else {
            info!(table_size, "Populated the routing table");
        }
    }

    /// Run the maintenance that is due.
    pub fn maintain(&self, maintenance: &mut Maintenance) {
        let removed = self.records_mut().expire(Instant::now());
        if removed > 0 {
            debug!(removed, "Expired records");
        }

        let decisions = maintenance.decisions(&self.routing_table(), &self.records());

        if decisions.rejoin && !self.config.bootstrap.is_empty() {
            self.join();
        }

        for target in decisions.refresh_targets {
            trace!(?target, "Refreshing bucket");
            self.lookup_node(target);
        }

        for key in decisions.replicate {
            // Our own records are announced again on republish instead.
            let records = self
                .records()
                .records(&key)
                .iter()
                .filter(|record| record.publisher.id != self.id)
                .cloned()
                .collect::<Vec<_>>();
            if records.is_empty() {
                continue;
            }

            let nodes = self.lookup_node(key);

            for record in records {
                let stored = self.store_at(&nodes, key, &record.publisher);
                trace!(?key, publisher = ?record.publisher, stored, "Replicated");
            }
        }

        for key in decisions.republish {
            trace!(?key, "Republishing");
            self.announce(key);
        }
    }

    /// Time out every pending request.
    pub fn shutdown(&self) {
        self.transactions.shutdown();
        self.eviction_pings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    // === Private Methods ===

    pub(crate) fn routing_table_mut(&self) -> RwLockWriteGuard<'_, RoutingTable> {
        self.routing_table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn records_mut(&self) -> RwLockWriteGuard<'_, RecordStore> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn respond(&self, to: SocketAddrV4, transaction_id: TransactionId, message_type: MessageType) {
        let message = Message {
            transaction_id,
            node_id: self.id,
            message_type,
        };

        if let Err(error) = self.socket.send(to, &message) {
            debug!(?to, ?error, "Failed to send response");
        }
    }

    /// Send concurrent store requests, and count the acknowledgements.
    fn store_at(&self, nodes: &[Node], key: Id, publisher: &Node) -> usize {
        let requests = nodes
            .iter()
            .filter_map(|node| {
                self.store(node.address, key, publisher.id, publisher.address.port())
                    .ok()
            })
            .collect::<Vec<_>>();

        requests
            .into_iter()
            .map(PendingRequest::wait)
            .filter(|result| {
                matches!(
                    result,
                    Ok(Reply {
                        response: ResponseSpecific::Success(marker),
                        ..
                    }) if marker == STORE_SUCCESS_RESPONSE
                )
            })
            .count()
    }

    /// Query closer and closer nodes to the target, [ALPHA] at a time, until no
    /// closer nodes are found, or a node returns values.
    fn lookup(&self, target: Id, request: RequestSpecific) -> Lookup {
        let seeds = {
            let mut routing_table = self.routing_table_mut();
            routing_table.touch(&target);
            routing_table.find_closest(&target, ALPHA)
        };

        let mut query = IterativeQuery::new(target, seeds);

        while !query.is_done() {
            let requests = query
                .next_round()
                .into_iter()
                .filter_map(|node| match self.request(node.address, request.clone()) {
                    Ok(pending) => Some((node, pending)),
                    Err(error) => {
                        debug!(?node, ?error, "Failed to send lookup request");
                        None
                    }
                })
                .collect::<Vec<_>>();

            for (node, pending) in requests {
                match pending.wait() {
                    Ok(Reply {
                        from,
                        response: ResponseSpecific::Nodes(nodes),
                    }) => {
                        let id = self.id;
                        query.add_response(from, nodes.into_iter().filter(|n| n.id != id));
                    }
                    Ok(Reply {
                        from,
                        response: ResponseSpecific::Values(FindValueResponseArguments { key, values }),
                    }) => {
                        if key == target {
                            debug!(?target, ?from, values = values.len(), "Found values");
                            return Lookup::Values(values);
                        }

                        debug!(?target, ?key, ?from, "Values for another key");
                        query.add_response(from, vec![]);
                    }
                    Ok(Reply { from, .. }) => query.add_response(from, vec![]),
                    Err(error) => trace!(?node, ?error, "No response during lookup"),
                }
            }
        }

        Lookup::Nodes(query.into_closest())
    }
}

#[cfg(test)]
mod test {
    use std::thread;

    use crate::common::{MAX_BUCKET_SIZE_K, PING_SUCCESS_RESPONSE};

    use super::*;

    fn rpc_with(request_timeout: Duration, timings: Timings) -> Rpc {
        Rpc::new(Config {
            address: SocketAddrV4::new([127, 0, 0, 1].into(), 0),
            bootstrap: vec![],
            request_timeout,
            max_tries: 1,
            timings,
            ..Default::default()
        })
        .unwrap()
    }

    fn rpc() -> Rpc {
        rpc_with(Duration::from_millis(200), Timings::default())
    }

    fn receive(socket: &KrpcSocket) -> Option<Message> {
        let deadline = Instant::now() + Duration::from_millis(300);

        while Instant::now() < deadline {
            if let Some((bytes, _)) = socket.recv_from() {
                return Some(Message::from_bytes(bytes).unwrap());
            }
        }

        None
    }

    fn answer(request: &Message, node_id: Id, response: ResponseSpecific) -> Vec<u8> {
        Message {
            transaction_id: request.transaction_id,
            node_id,
            message_type: MessageType::Response(response),
        }
        .to_bytes()
        .unwrap()
    }

    /// Answer every request `peer` receives until `done` returns true, returns the store requests.
    fn serve(
        rpc: &Rpc,
        peer: &KrpcSocket,
        peer_id: Id,
        find_value: impl Fn(Id) -> ResponseSpecific,
        done: impl Fn() -> bool,
    ) -> Vec<StoreRequestArguments> {
        let mut stores = vec![];

        while !done() {
            let Some((bytes, _)) = peer.recv_from() else {
                continue;
            };
            let request = Message::from_bytes(bytes).unwrap();

            let response = match &request.message_type {
                MessageType::Request(RequestSpecific::Store(store)) => {
                    stores.push(store.clone());
                    ResponseSpecific::Success(STORE_SUCCESS_RESPONSE.to_string())
                }
                MessageType::Request(RequestSpecific::FindValue(args)) => find_value(args.key),
                MessageType::Request(RequestSpecific::FindNode(_)) => {
                    ResponseSpecific::Nodes(vec![])
                }
                _ => ResponseSpecific::Success(PING_SUCCESS_RESPONSE.to_string()),
            };

            rpc.handle_packet(&answer(&request, peer_id, response), peer.local_addr());
        }

        stores
    }

    #[test]
    fn ignore_messages_claiming_our_id() {
        let rpc = rpc();
        let peer = KrpcSocket::localhost().unwrap();

        let store = Message {
            transaction_id: TransactionId::random(),
            node_id: *rpc.id(),
            message_type: MessageType::Request(RequestSpecific::Store(StoreRequestArguments {
                key: Id::random(),
                publisher_id: *rpc.id(),
                port: 3333,
            })),
        };

        rpc.handle_packet(&store.to_bytes().unwrap(), peer.local_addr());

        let pong = answer(
            &store,
            *rpc.id(),
            ResponseSpecific::Success(PING_SUCCESS_RESPONSE.to_string()),
        );
        rpc.handle_packet(&pong, peer.local_addr());

        assert!(receive(&peer).is_none());
        assert!(rpc.routing_table().is_empty());
        assert!(rpc.records().is_empty());
    }

    #[test]
    fn invalid_request_still_records_the_sender() {
        let rpc = rpc();
        let peer = KrpcSocket::localhost().unwrap();
        let peer_id = Id::random();

        // findNode with a 20 bytes target.
        let mut packet = b"d1:0i0e1:120:".to_vec();
        packet.extend_from_slice(&[7; 20]);
        packet.extend_from_slice(b"1:248:");
        packet.extend_from_slice(peer_id.as_bytes());
        packet.extend_from_slice(b"1:38:findNode1:4l20:");
        packet.extend_from_slice(&[1; 20]);
        packet.extend_from_slice(b"ee");

        rpc.handle_packet(&packet, peer.local_addr());

        assert!(receive(&peer).is_none());
        assert_eq!(rpc.routing_table().size(), 1);
        assert!(rpc.routing_table().contains(&peer_id));
    }

    #[test]
    fn responder_is_known_before_the_requester_wakes_up() {
        let rpc = rpc();
        let peer = KrpcSocket::localhost().unwrap();
        let peer_id = Id::random();

        let pending = rpc.request(peer.local_addr(), RequestSpecific::Ping).unwrap();
        let request = receive(&peer).unwrap();

        let known = thread::scope(|scope| {
            let waiter = scope.spawn(|| {
                let reply = pending.wait();
                reply.is_ok() && rpc.routing_table().contains(&peer_id)
            });

            rpc.handle_packet(
                &answer(
                    &request,
                    peer_id,
                    ResponseSpecific::Success(PING_SUCCESS_RESPONSE.to_string()),
                ),
                peer.local_addr(),
            );

            waiter.join().unwrap()
        });

        assert!(known);
    }

    /// Fill the bucket of far nodes, and overflow it with one more.
    fn overflow(rpc: &Rpc, address: SocketAddrV4) -> (Node, Node) {
        let far = || Node::new(rpc.id().random_with_prefix(0), address);

        let nodes = (0..MAX_BUCKET_SIZE_K).map(|_| far()).collect::<Vec<_>>();
        for node in &nodes {
            rpc.add_node(node.clone());
        }

        let newcomer = far();
        rpc.add_node(newcomer.clone());

        (nodes[0].clone(), newcomer)
    }

    fn settle_pings(rpc: &Rpc) {
        let deadline = Instant::now() + Duration::from_secs(2);

        while !rpc.eviction_pings.lock().unwrap().is_empty() && Instant::now() < deadline {
            rpc.tick();
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn unanswered_ping_evicts_oldest() {
        let rpc = rpc_with(Duration::from_millis(50), Timings::default());
        let silent = KrpcSocket::localhost().unwrap();

        let (oldest, newcomer) = overflow(&rpc, silent.local_addr());

        assert_eq!(rpc.eviction_pings.lock().unwrap().len(), 1);
        assert!(!rpc.routing_table().contains(&newcomer.id));

        let ping = receive(&silent).unwrap();
        assert_eq!(ping.message_type, MessageType::Request(RequestSpecific::Ping));

        settle_pings(&rpc);

        assert!(rpc.eviction_pings.lock().unwrap().is_empty());
        assert!(!rpc.routing_table().contains(&oldest.id));
        assert!(rpc.routing_table().contains(&newcomer.id));
        assert_eq!(rpc.routing_table().size(), MAX_BUCKET_SIZE_K);
    }

    #[test]
    fn answered_ping_keeps_oldest() {
        let rpc = rpc();
        let peer = KrpcSocket::localhost().unwrap();

        let (oldest, newcomer) = overflow(&rpc, peer.local_addr());

        let ping = receive(&peer).unwrap();
        rpc.handle_packet(
            &answer(
                &ping,
                oldest.id,
                ResponseSpecific::Success(PING_SUCCESS_RESPONSE.to_string()),
            ),
            peer.local_addr(),
        );

        settle_pings(&rpc);

        assert!(rpc.routing_table().contains(&oldest.id));
        assert!(!rpc.routing_table().contains(&newcomer.id));
    }

    #[test]
    fn maintain_replicates_and_republishes() {
        let rpc = rpc_with(
            Duration::from_millis(200),
            Timings {
                replicate: Duration::ZERO,
                republish: Duration::ZERO,
                ..Default::default()
            },
        );
        let peer = KrpcSocket::localhost().unwrap();
        let peer_id = Id::random();

        rpc.add_node(Node::new(peer_id, peer.local_addr()));

        let stored = Id::random();
        let other = Node::new(Id::random(), SocketAddrV4::new([127, 0, 0, 1].into(), 3333));
        rpc.records_mut().insert(stored, other.clone());

        let announced = Id::random();
        let own = Node::new(*rpc.id(), rpc.local_addr());
        rpc.records_mut()
            .publish_at(announced, own, Instant::now());

        let mut maintenance = Maintenance::new(rpc.config().timings);

        let stores = thread::scope(|scope| {
            let maintain = scope.spawn(|| rpc.maintain(&mut maintenance));

            serve(
                &rpc,
                &peer,
                peer_id,
                |_| ResponseSpecific::Nodes(vec![]),
                || maintain.is_finished(),
            )
        });

        assert!(stores.contains(&StoreRequestArguments {
            key: stored,
            publisher_id: other.id,
            port: 3333,
        }));
        assert!(stores.contains(&StoreRequestArguments {
            key: announced,
            publisher_id: *rpc.id(),
            port: rpc.peer_port(),
        }));
        // Our own record is only sent by the republish.
        assert_eq!(
            stores.iter().filter(|store| store.key == announced).count(),
            1
        );
    }

    #[test]
    fn values_for_another_key_are_ignored() {
        let rpc = rpc();
        let peer = KrpcSocket::localhost().unwrap();
        let peer_id = Id::random();

        rpc.add_node(Node::new(peer_id, peer.local_addr()));

        let key = Id::random();

        let values = thread::scope(|scope| {
            let lookup = scope.spawn(|| rpc.find_value(key));

            serve(
                &rpc,
                &peer,
                peer_id,
                |_| {
                    ResponseSpecific::Values(FindValueResponseArguments {
                        key: Id::random(),
                        values: vec![Node::new(
                            Id::random(),
                            SocketAddrV4::new([127, 0, 0, 1].into(), 3333),
                        )],
                    })
                },
                || lookup.is_finished(),
            );

            lookup.join().unwrap()
        });

        assert!(values.is_empty());
    }
}
