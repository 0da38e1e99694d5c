//! Outstanding requests awaiting a correlated response or error.
//!
//! Every request gets a fresh [TransactionId] and a pending entry before it hits the
//! socket. A pending entry ends exactly once: resolved by a matching response, failed
//! by a matching error, or timed out after its retries run out.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::common::{
    ErrorSpecific, Id, Message, MessageType, Node, RequestSpecific, ResponseSpecific,
    TransactionId,
};

use super::socket::{KrpcSocket, SendMessageError};

#[derive(Debug)]
struct Pending {
    to: SocketAddrV4,
    /// Encoded request, resent verbatim on retry.
    bytes: Vec<u8>,
    sent_at: Instant,
    tries_left: usize,
    sender: flume::Sender<Result<Reply, RequestError>>,
}

#[derive(Debug, Clone, PartialEq)]
/// A successful response, and the node that sent it.
pub struct Reply {
    pub from: Node,
    pub response: ResponseSpecific,
}

#[derive(Debug)]
pub struct Transactions {
    socket: Arc<KrpcSocket>,
    id: Id,
    request_timeout: Duration,
    max_tries: usize,
    pending: Mutex<HashMap<TransactionId, Pending>>,
    /// Set on shutdown, new requests time out immediately.
    closed: AtomicBool,
}

impl Transactions {
    pub fn new(
        socket: Arc<KrpcSocket>,
        id: Id,
        request_timeout: Duration,
        max_tries: usize,
    ) -> Self {
        Self {
            socket,
            id,
            request_timeout,
            max_tries: max_tries.max(1),
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    // === Getters ===

    /// Number of requests still waiting for an answer.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// The longest a [PendingRequest] can wait, all retries included.
    pub fn max_wait(&self) -> Duration {
        self.request_timeout * self.max_tries as u32
    }

    // === Public Methods ===

    /// Send a request and return a handle to await its outcome.
    pub fn send(
        &self,
        to: SocketAddrV4,
        request: RequestSpecific,
    ) -> Result<PendingRequest, RequestError> {
        let (sender, receiver) = flume::bounded(1);

        let (transaction_id, bytes) = {
            let mut pending = self.lock();

            if self.closed.load(Ordering::Acquire) {
                return Err(RequestError::Timeout);
            }

            let mut transaction_id = TransactionId::random();
            while pending.contains_key(&transaction_id) {
                transaction_id = TransactionId::random();
            }

            let message = Message {
                transaction_id,
                node_id: self.id,
                message_type: MessageType::Request(request),
            };
            let bytes = message.to_bytes().map_err(SendMessageError::from)?;

            pending.insert(
                transaction_id,
                Pending {
                    to,
                    bytes: bytes.clone(),
                    sent_at: Instant::now(),
                    tries_left: self.max_tries - 1,
                    sender,
                },
            );

            (transaction_id, bytes)
        };

        if let Err(error) = self.socket.send_bytes(to, &bytes) {
            self.lock().remove(&transaction_id);

            return Err(SendMessageError::from(error).into());
        }

        trace!(context = "request_sent", ?transaction_id, ?to);

        Ok(PendingRequest {
            transaction_id,
            receiver,
            max_wait: self.max_wait(),
        })
    }

    /// Correlate an incoming response or error with its pending request.
    ///
    /// Returns `false` for requests, and for unknown, duplicate, late or misaddressed
    /// answers, which are logged and dropped.
    pub fn resolve(&self, message: &Message, from: SocketAddrV4) -> bool {
        self.resolve_with(message, from, || {})
    }

    /// Same as [Self::resolve], but runs `on_match` before the waiting handle is woken up.
    pub fn resolve_with(
        &self,
        message: &Message,
        from: SocketAddrV4,
        on_match: impl FnOnce(),
    ) -> bool {
        let result = match &message.message_type {
            MessageType::Request(_) => return false,
            MessageType::Response(response) => Ok(Reply {
                from: Node::new(message.node_id, from),
                response: response.clone(),
            }),
            MessageType::Error(ErrorSpecific { exception, args }) => Err(RequestError::Remote {
                exception: exception.clone(),
                args: args.clone(),
            }),
        };

        let pending = {
            let mut pending = self.lock();

            match pending.get(&message.transaction_id) {
                Some(entry) if compare_socket_addr(&entry.to, &from) => {
                    pending.remove(&message.transaction_id)
                }
                Some(_) => {
                    debug!(
                        context = "transaction",
                        transaction_id = ?message.transaction_id,
                        ?from,
                        "Answer from an unexpected address"
                    );
                    return false;
                }
                None => None,
            }
        };

        match pending {
            Some(pending) => {
                on_match();
                let _ = pending.sender.send(result);
                true
            }
            None => {
                debug!(
                    context = "transaction",
                    transaction_id = ?message.transaction_id,
                    ?from,
                    "Unknown or late transaction"
                );
                false
            }
        }
    }

    /// Retry or time out requests that went unanswered for longer than the request timeout.
    pub fn tick(&self) {
        self.tick_at(Instant::now())
    }

    pub(crate) fn tick_at(&self, now: Instant) {
        let mut resend = vec![];

        {
            let mut pending = self.lock();

            pending.retain(|transaction_id, entry| {
                if now.saturating_duration_since(entry.sent_at) < self.request_timeout {
                    return true;
                }

                if entry.tries_left > 0 {
                    entry.tries_left -= 1;
                    entry.sent_at = now;
                    resend.push((entry.to, entry.bytes.clone()));

                    return true;
                }

                trace!(context = "transaction", ?transaction_id, to = ?entry.to, "Timed out");
                let _ = entry.sender.send(Err(RequestError::Timeout));

                false
            });
        }

        for (to, bytes) in resend {
            if let Err(error) = self.socket.send_bytes(to, &bytes) {
                debug!(context = "transaction", ?to, ?error, "Failed to resend request");
            }
        }
    }

    /// Time out every pending request, and any request sent afterwards.
    pub fn shutdown(&self) {
        let mut pending = self.lock();
        self.closed.store(true, Ordering::Release);

        for (_, entry) in pending.drain() {
            let _ = entry.sender.send(Err(RequestError::Timeout));
        }
    }

    // === Private Methods ===

    fn lock(&self) -> MutexGuard<'_, HashMap<TransactionId, Pending>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Handle to the eventual outcome of a request sent with [Transactions::send].
#[derive(Debug)]
pub struct PendingRequest {
    transaction_id: TransactionId,
    receiver: flume::Receiver<Result<Reply, RequestError>>,
    max_wait: Duration,
}

impl PendingRequest {
    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    /// Block until the request is resolved.
    pub fn wait(self) -> Result<Reply, RequestError> {
        // Ticking resolves it within `max_wait`, unless the node stopped ticking.
        match self.receiver.recv_timeout(self.max_wait * 2) {
            Ok(result) => result,
            Err(_) => Err(RequestError::Timeout),
        }
    }

    /// Returns the outcome if the request is already resolved.
    pub fn try_result(&self) -> Option<Result<Reply, RequestError>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(flume::TryRecvError::Empty) => None,
            Err(flume::TryRecvError::Disconnected) => Some(Err(RequestError::Timeout)),
        }
    }

    #[cfg(feature = "async")]
    pub async fn wait_async(self) -> Result<Reply, RequestError> {
        match self.receiver.recv_async().await {
            Ok(result) => result,
            Err(_) => Err(RequestError::Timeout),
        }
    }
}

#[derive(thiserror::Error, Debug)]
/// Outcome of a failed request.
pub enum RequestError {
    /// No answer after exhausting all retries.
    #[error("Request timed out")]
    Timeout,

    /// The remote node answered with an error message.
    #[error("Remote error: {exception}")]
    Remote {
        exception: String,
        args: Vec<Vec<u8>>,
    },

    #[error(transparent)]
    Send(#[from] SendMessageError),
}

fn compare_socket_addr(a: &SocketAddrV4, b: &SocketAddrV4) -> bool {
    if a.port() != b.port() {
        return false;
    }

    if a.ip().is_unspecified() {
        return true;
    }

    a.ip() == b.ip()
}

#[cfg(test)]
mod test {
    use crate::common::{FindNodeRequestArguments, PING_SUCCESS_RESPONSE};

    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(200);

    fn setup(max_tries: usize) -> (Transactions, KrpcSocket) {
        let socket = Arc::new(KrpcSocket::localhost().unwrap());
        let transactions = Transactions::new(socket, Id::random(), TIMEOUT, max_tries);
        let peer = KrpcSocket::localhost().unwrap();

        (transactions, peer)
    }

    fn receive(peer: &KrpcSocket) -> Message {
        loop {
            if let Some((bytes, _)) = peer.recv_from() {
                return Message::from_bytes(bytes).unwrap();
            }
        }
    }

    fn pong(request: &Message, node_id: Id) -> Message {
        Message {
            transaction_id: request.transaction_id,
            node_id,
            message_type: MessageType::Response(ResponseSpecific::Success(
                PING_SUCCESS_RESPONSE.to_string(),
            )),
        }
    }

    #[test]
    fn resolved_exactly_once() {
        let (transactions, peer) = setup(3);
        let peer_id = Id::random();

        let handle = transactions
            .send(peer.local_addr(), RequestSpecific::Ping)
            .unwrap();
        assert_eq!(transactions.len(), 1);

        let request = receive(&peer);
        assert_eq!(request.transaction_id, handle.transaction_id());

        let response = pong(&request, peer_id);

        assert!(transactions.resolve(&response, peer.local_addr()));
        assert!(transactions.is_empty());

        // A late duplicate is a no-op.
        assert!(!transactions.resolve(&response, peer.local_addr()));

        let reply = handle.wait().unwrap();
        assert_eq!(reply.from.id, peer_id);
        assert_eq!(reply.from.address, peer.local_addr());
    }

    #[test]
    fn on_match_runs_before_wake_up() {
        let (transactions, peer) = setup(3);

        let handle = transactions
            .send(peer.local_addr(), RequestSpecific::Ping)
            .unwrap();
        let response = pong(&receive(&peer), Id::random());

        let mut ran = false;
        assert!(transactions.resolve_with(&response, peer.local_addr(), || {
            assert!(handle.try_result().is_none());
            ran = true;
        }));

        assert!(ran);
        assert!(handle.wait().is_ok());

        // Unmatched answers never run it.
        assert!(!transactions.resolve_with(&response, peer.local_addr(), || {
            panic!("no pending request left")
        }));
    }

    #[test]
    fn remote_error() {
        let (transactions, peer) = setup(3);

        let handle = transactions
            .send(
                peer.local_addr(),
                RequestSpecific::FindNode(FindNodeRequestArguments {
                    target: Id::random(),
                }),
            )
            .unwrap();

        let request = receive(&peer);

        let error = Message {
            transaction_id: request.transaction_id,
            node_id: Id::random(),
            message_type: MessageType::Error(ErrorSpecific {
                exception: "ValueError".to_string(),
                args: vec![],
            }),
        };

        assert!(transactions.resolve(&error, peer.local_addr()));

        assert!(matches!(
            handle.wait(),
            Err(RequestError::Remote { exception, .. }) if exception == "ValueError"
        ));
    }

    #[test]
    fn ignore_unexpected_address() {
        let (transactions, peer) = setup(3);
        let imposter = KrpcSocket::localhost().unwrap();

        let handle = transactions
            .send(peer.local_addr(), RequestSpecific::Ping)
            .unwrap();

        let request = receive(&peer);
        let response = pong(&request, Id::random());

        assert!(!transactions.resolve(&response, imposter.local_addr()));
        assert!(handle.try_result().is_none());

        assert!(transactions.resolve(&response, peer.local_addr()));
        assert!(handle.try_result().unwrap().is_ok());
    }

    #[test]
    fn retry_then_timeout() {
        let (transactions, peer) = setup(3);

        let handle = transactions
            .send(peer.local_addr(), RequestSpecific::Ping)
            .unwrap();

        let first = receive(&peer);
        let start = Instant::now();

        // Not yet.
        transactions.tick_at(start);
        assert!(handle.try_result().is_none());

        // Two retries, sent verbatim.
        transactions.tick_at(start + TIMEOUT);
        assert_eq!(receive(&peer), first);
        transactions.tick_at(start + TIMEOUT * 2);
        assert_eq!(receive(&peer), first);
        assert!(handle.try_result().is_none());

        transactions.tick_at(start + TIMEOUT * 3);

        assert!(transactions.is_empty());
        assert!(matches!(handle.wait(), Err(RequestError::Timeout)));

        // A response after the timeout is dropped.
        assert!(!transactions.resolve(&pong(&first, Id::random()), peer.local_addr()));
    }

    #[test]
    fn shutdown_times_out_everything() {
        let (transactions, peer) = setup(3);

        let handles = (0..5)
            .map(|_| {
                transactions
                    .send(peer.local_addr(), RequestSpecific::Ping)
                    .unwrap()
            })
            .collect::<Vec<_>>();

        transactions.shutdown();
        assert!(transactions.is_empty());

        for handle in handles {
            assert!(matches!(handle.wait(), Err(RequestError::Timeout)));
        }

        assert!(matches!(
            transactions.send(peer.local_addr(), RequestSpecific::Ping),
            Err(RequestError::Timeout)
        ));
    }
}
