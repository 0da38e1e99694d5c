//! Dht node.

use std::{
    fmt::{self, Debug, Formatter},
    net::SocketAddrV4,
    sync::{Arc, Mutex, PoisonError},
    thread::{self, JoinHandle},
    time::Duration,
};

use tracing::{debug, info};

use crate::{
    common::{Id, Node},
    rpc::{Config, Info, Maintenance, RequestError, Rpc, Timings},
};

/// How often the dispatcher advances request timeouts when no packets arrive.
const TICK_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
/// Kademlia Dht node.
///
/// Cloning a [Dht] returns another handle to the same node, which shuts down
/// when [Dht::shutdown] is called or the last handle is dropped.
pub struct Dht(Arc<Inner>);

#[derive(Debug, Default, Clone)]
/// Dht node builder
pub struct DhtBuilder(Config);

impl DhtBuilder {
    /// Local address to bind the UDP socket to.
    pub fn address(&mut self, address: SocketAddrV4) -> &mut Self {
        self.0.address = address;

        self
    }

    /// Port to listen on, keeping the configured ip.
    pub fn port(&mut self, port: u16) -> &mut Self {
        self.0.address.set_port(port);

        self
    }

    /// Set bootstrapping nodes.
    pub fn bootstrap<T: ToString>(&mut self, bootstrap: &[T]) -> &mut Self {
        self.0.bootstrap = bootstrap.iter().map(|b| b.to_string()).collect();

        self
    }

    /// Set an explicit node Id instead of a random one.
    pub fn id(&mut self, id: Id) -> &mut Self {
        self.0.id = Some(id);

        self
    }

    /// Port announced to other nodes when announcing a key.
    pub fn peer_port(&mut self, port: u16) -> &mut Self {
        self.0.peer_port = Some(port);

        self
    }

    /// UDP socket request timeout duration, for each try.
    pub fn request_timeout(&mut self, request_timeout: Duration) -> &mut Self {
        self.0.request_timeout = request_timeout;

        self
    }

    /// How many times a request is sent before timing out.
    pub fn max_tries(&mut self, max_tries: usize) -> &mut Self {
        self.0.max_tries = max_tries;

        self
    }

    /// Override records expiry and maintenance intervals.
    pub fn timings(&mut self, timings: Timings) -> &mut Self {
        self.0.timings = timings;

        self
    }

    /// Create a Dht node.
    pub fn build(&self) -> Result<Dht, std::io::Error> {
        Dht::new(self.0.clone())
    }
}

impl Dht {
    /// Create a new Dht node.
    ///
    /// Could return an error if it failed to bind to the specified
    /// address or port.
    pub fn new(config: Config) -> Result<Self, std::io::Error> {
        let rpc = Arc::new(Rpc::new(config)?);

        let (shutdown_sender, shutdown_receiver) = flume::bounded::<()>(1);
        let (joined_sender, joined_receiver) = flume::bounded::<()>(1);
        let (packets_sender, packets_receiver) = flume::unbounded::<(Vec<u8>, SocketAddrV4)>();

        let reader = {
            let rpc = rpc.clone();
            let shutdown = shutdown_receiver.clone();

            thread::Builder::new()
                .name("lbry-dht-reader".to_string())
                .spawn(move || run_reader(&rpc, &shutdown, packets_sender))?
        };

        let dispatcher = {
            let rpc = rpc.clone();

            thread::Builder::new()
                .name("lbry-dht-dispatcher".to_string())
                .spawn(move || run_dispatcher(&rpc, packets_receiver))?
        };

        let maintenance = {
            let rpc = rpc.clone();

            thread::Builder::new()
                .name("lbry-dht-maintenance".to_string())
                .spawn(move || run_maintenance(&rpc, &shutdown_receiver, joined_sender))?
        };

        Ok(Dht(Arc::new(Inner {
            rpc,
            joined: joined_receiver,
            running: Mutex::new(Some(Running {
                shutdown: shutdown_sender,
                threads: vec![reader, dispatcher, maintenance],
            })),
        })))
    }

    /// Returns a builder to edit settings before creating a Dht node.
    pub fn builder() -> DhtBuilder {
        DhtBuilder::default()
    }

    /// Create a new node with the default configurations.
    pub fn client() -> Result<Self, std::io::Error> {
        Dht::builder().build()
    }

    // === Getters ===

    /// Information and statistics about this [Dht] node.
    pub fn info(&self) -> Result<Info, DhtWasShutdown> {
        let rpc = self.rpc()?;

        Ok(Info::from(rpc))
    }

    /// Turn this node's routing table to a list of bootstraping nodes.
    pub fn to_bootstrap(&self) -> Result<Vec<String>, DhtWasShutdown> {
        Ok(self.rpc()?.routing_table().to_bootstrap())
    }

    // === Public Methods ===

    /// Wait until the initial bootstrapping is done.
    ///
    /// Returns true if the routing table has any nodes.
    pub fn bootstrapped(&self) -> Result<bool, DhtWasShutdown> {
        // Disconnected once the join is over.
        let _ = self.0.joined.recv();

        Ok(!self.rpc()?.routing_table().is_empty())
    }

    /// Ping a node, returning its [Id].
    ///
    /// Returns [RequestError::Timeout] if this node was shutdown.
    pub fn ping(&self, address: SocketAddrV4) -> Result<Id, RequestError> {
        self.0.rpc.ping(address)
    }

    /// Find the closest responding nodes to a target.
    pub fn lookup_node(&self, target: Id) -> Result<Vec<Node>, DhtWasShutdown> {
        Ok(self.rpc()?.lookup_node(target))
    }

    /// Find nodes that announced a key.
    pub fn find_value(&self, key: Id) -> Result<Vec<Node>, DhtWasShutdown> {
        Ok(self.rpc()?.find_value(key))
    }

    /// Announce this node as a publisher of `key` to the closest nodes.
    ///
    /// The announcement is republished periodically, for as long as this node runs.
    /// Returns the number of nodes that stored the announcement.
    pub fn announce(&self, key: Id) -> Result<usize, DhtWasShutdown> {
        Ok(self.rpc()?.announce(key))
    }

    /// Stop all threads and time out all pending requests.
    pub fn shutdown(&self) {
        self.0.shutdown();
    }

    // === Private Methods ===

    fn rpc(&self) -> Result<&Rpc, DhtWasShutdown> {
        if self.0.is_shutdown() {
            return Err(DhtWasShutdown);
        }

        Ok(&self.0.rpc)
    }
}

struct Inner {
    rpc: Arc<Rpc>,
    joined: flume::Receiver<()>,
    running: Mutex<Option<Running>>,
}

struct Running {
    shutdown: flume::Sender<()>,
    threads: Vec<JoinHandle<()>>,
}

impl Inner {
    fn is_shutdown(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    fn shutdown(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(Running { shutdown, threads }) = running else {
            return;
        };

        // Disconnects every thread's shutdown receiver.
        drop(shutdown);
        self.rpc.shutdown();

        for handle in threads {
            let _ = handle.join();
        }

        info!(id = ?self.rpc.id(), "Dht was shutdown");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Debug for Inner {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dht")
            .field("id", self.rpc.id())
            .field("local_addr", &self.rpc.local_addr())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

fn is_shutdown(shutdown: &flume::Receiver<()>) -> bool {
    matches!(shutdown.try_recv(), Err(flume::TryRecvError::Disconnected))
}

/// Forward datagrams to the dispatcher until shutdown.
fn run_reader(
    rpc: &Rpc,
    shutdown: &flume::Receiver<()>,
    packets: flume::Sender<(Vec<u8>, SocketAddrV4)>,
) {
    while !is_shutdown(shutdown) {
        if let Some(packet) = rpc.socket().recv_from() {
            if packets.send(packet).is_err() {
                break;
            }
        }
    }

    debug!("Reader stopped");
}

/// Handle packets in arrival order, and advance timeouts, until the reader stops.
fn run_dispatcher(rpc: &Rpc, packets: flume::Receiver<(Vec<u8>, SocketAddrV4)>) {
    loop {
        match packets.recv_timeout(TICK_INTERVAL) {
            Ok((bytes, from)) => rpc.handle_packet(&bytes, from),
            Err(flume::RecvTimeoutError::Timeout) => {}
            Err(flume::RecvTimeoutError::Disconnected) => break,
        }

        rpc.tick();
    }

    debug!("Dispatcher stopped");
}

/// Join the network, then run maintenance every interval until shutdown.
fn run_maintenance(rpc: &Rpc, shutdown: &flume::Receiver<()>, joined: flume::Sender<()>) {
    if !rpc.config().bootstrap.is_empty() {
        rpc.join();
    }
    drop(joined);

    let mut maintenance = Maintenance::new(rpc.config().timings);
    let interval = rpc.config().timings.maintenance_interval;

    while let Err(flume::RecvTimeoutError::Timeout) = shutdown.recv_timeout(interval) {
        rpc.maintain(&mut maintenance);
    }

    debug!("Maintenance stopped");
}

/// Create a testnet of Dht nodes to run tests against instead of the real network.
#[derive(Debug)]
pub struct Testnet {
    pub bootstrap: Vec<String>,
    pub nodes: Vec<Dht>,
}

impl Testnet {
    /// Create `count` nodes on localhost, all bootstrapped off the first one.
    pub fn new(count: usize) -> Result<Testnet, std::io::Error> {
        let mut nodes: Vec<Dht> = vec![];
        let mut bootstrap = vec![];

        for i in 0..count {
            let mut builder = Dht::builder();
            builder.address(SocketAddrV4::new([127, 0, 0, 1].into(), 0));

            if i == 0 {
                let node = builder.bootstrap::<String>(&[]).build()?;

                let info = node
                    .info()
                    .map_err(|error| std::io::Error::new(std::io::ErrorKind::Other, error))?;
                bootstrap.push(info.local_addr().to_string());

                nodes.push(node)
            } else {
                let node = builder.bootstrap(&bootstrap).build()?;
                let _ = node.bootstrapped();

                nodes.push(node)
            }
        }

        Ok(Self { bootstrap, nodes })
    }
}

#[derive(thiserror::Error, Debug)]
#[error("Dht was shutdown")]
/// Calling methods on a [Dht] node after it was shutdown.
pub struct DhtWasShutdown;
