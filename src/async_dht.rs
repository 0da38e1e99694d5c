//! AsyncDht node.

use std::net::SocketAddrV4;
use std::thread;

use crate::{
    common::{Id, Node},
    dht::{Dht, DhtWasShutdown},
    rpc::{Info, RequestError},
};

impl Dht {
    /// Return an async version of the Dht client.
    pub fn as_async(self) -> AsyncDht {
        AsyncDht(self)
    }
}

#[derive(Debug, Clone)]
/// Async version of the Dht node.
pub struct AsyncDht(Dht);

impl AsyncDht {
    // === Getters ===

    /// Information and statistics about this [Dht] node.
    pub async fn info(&self) -> Result<Info, DhtWasShutdown> {
        self.0.info()
    }

    /// Turn this node's routing table to a list of bootstraping nodes.
    pub async fn to_bootstrap(&self) -> Result<Vec<String>, DhtWasShutdown> {
        self.0.to_bootstrap()
    }

    // === Public Methods ===

    /// Shutdown the node, and wait for its threads to stop.
    pub async fn shutdown(&mut self) {
        let dht = self.0.clone();

        let _ = blocking(move || dht.shutdown()).recv_async().await;
    }

    /// Wait until the bootstraping is done.
    ///
    /// Returns true if the bootstraping was successful.
    pub async fn bootstrapped(&self) -> Result<bool, DhtWasShutdown> {
        let dht = self.0.clone();

        blocking(move || dht.bootstrapped())
            .recv_async()
            .await
            .map_err(|_| DhtWasShutdown)?
    }

    /// Ping a node, returning its [Id].
    pub async fn ping(&self, address: SocketAddrV4) -> Result<Id, RequestError> {
        let dht = self.0.clone();

        blocking(move || dht.ping(address))
            .recv_async()
            .await
            .map_err(|_| RequestError::Timeout)?
    }

    /// Find the closest responding nodes to a target.
    pub async fn lookup_node(&self, target: Id) -> Result<Vec<Node>, DhtWasShutdown> {
        let dht = self.0.clone();

        blocking(move || dht.lookup_node(target))
            .recv_async()
            .await
            .map_err(|_| DhtWasShutdown)?
    }

    /// Find nodes that announced a key.
    pub async fn find_value(&self, key: Id) -> Result<Vec<Node>, DhtWasShutdown> {
        let dht = self.0.clone();

        blocking(move || dht.find_value(key))
            .recv_async()
            .await
            .map_err(|_| DhtWasShutdown)?
    }

    /// Announce this node as a publisher of `key` to the closest nodes.
    pub async fn announce(&self, key: Id) -> Result<usize, DhtWasShutdown> {
        let dht = self.0.clone();

        blocking(move || dht.announce(key))
            .recv_async()
            .await
            .map_err(|_| DhtWasShutdown)?
    }
}

/// Run a blocking call on a helper thread, the receiver gets its result.
fn blocking<T, F>(f: F) -> flume::Receiver<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (sender, receiver) = flume::bounded::<T>(1);

    // A failed spawn drops the sender, which the caller sees as a disconnected receiver.
    let _ = thread::Builder::new()
        .name("lbry-dht-async".to_string())
        .spawn(move || {
            let _ = sender.send(f());
        });

    receiver
}
