//! Request handlers, and the records stored on behalf of other nodes.

mod records;

use std::net::SocketAddrV4;

use tracing::{debug, trace};

use crate::common::{
    ErrorSpecific, FindNodeRequestArguments, FindValueRequestArguments,
    FindValueResponseArguments, InvalidRequest, InvalidRequestReason, MessageType, Node,
    RequestSpecific, ResponseSpecific, StoreRequestArguments, TransactionId, MAX_BUCKET_SIZE_K,
    PING_SUCCESS_RESPONSE, STORE_SUCCESS_RESPONSE,
};

pub use records::{Record, RecordStore, MAX_PUBLISHERS_PER_KEY};

use super::Rpc;

/// Exception name of the error sent back for invalid store requests.
pub const VALUE_ERROR: &str = "ValueError";

/// Answer a request, if it deserves an answer.
///
/// Updating the routing table with the requester is left to the caller.
pub fn handle_request(
    rpc: &Rpc,
    from: SocketAddrV4,
    transaction_id: TransactionId,
    request: &RequestSpecific,
) {
    let message_type = match request {
        RequestSpecific::Ping => MessageType::Response(ResponseSpecific::Success(
            PING_SUCCESS_RESPONSE.to_string(),
        )),
        RequestSpecific::Store(StoreRequestArguments {
            key,
            publisher_id,
            port,
        }) => {
            // The publisher is reachable at the packet's source ip, and the announced port.
            let publisher = Node::new(*publisher_id, SocketAddrV4::new(*from.ip(), *port));

            trace!(?key, ?publisher, "Storing record");
            rpc.records_mut().insert(*key, publisher);

            MessageType::Response(ResponseSpecific::Success(
                STORE_SUCCESS_RESPONSE.to_string(),
            ))
        }
        RequestSpecific::FindNode(FindNodeRequestArguments { target }) => MessageType::Response(
            ResponseSpecific::Nodes(rpc.routing_table().find_closest(target, MAX_BUCKET_SIZE_K)),
        ),
        RequestSpecific::FindValue(FindValueRequestArguments { key }) => {
            // Our own record carries the bound ip, which is useless to others when unspecified.
            let values = rpc
                .records()
                .get(key)
                .into_iter()
                .filter(|publisher| !publisher.address.ip().is_unspecified())
                .collect::<Vec<_>>();

            if values.is_empty() {
                MessageType::Response(ResponseSpecific::Nodes(
                    rpc.routing_table().find_closest(key, MAX_BUCKET_SIZE_K),
                ))
            } else {
                MessageType::Response(ResponseSpecific::Values(FindValueResponseArguments {
                    key: *key,
                    values,
                }))
            }
        }
        RequestSpecific::Invalid(InvalidRequest {
            method,
            reason: InvalidRequestReason::EmptyKey,
        }) => {
            debug!(?from, ?method, "Rejecting store with an empty key");

            MessageType::Error(ErrorSpecific {
                exception: VALUE_ERROR.to_string(),
                args: vec![b"blob hash is empty".to_vec()],
            })
        }
        RequestSpecific::Invalid(InvalidRequest { method, reason }) => {
            debug!(?from, ?method, ?reason, "Dropping invalid request");
            return;
        }
    };

    rpc.respond(from, transaction_id, message_type);
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use crate::common::{Id, Message, RoutingTable};
    use crate::rpc::{socket::KrpcSocket, Config};

    use super::*;

    fn rpc() -> Rpc {
        Rpc::new(Config {
            address: SocketAddrV4::new([127, 0, 0, 1].into(), 0),
            bootstrap: vec![],
            ..Default::default()
        })
        .unwrap()
    }

    /// Send a request from a fresh socket, handle it, and return the answer if any.
    fn exchange(rpc: &Rpc, request: RequestSpecific) -> Option<Message> {
        let client = KrpcSocket::localhost().unwrap();

        handle_request(
            rpc,
            client.local_addr(),
            TransactionId([3; 20]),
            &request,
        );

        let deadline = std::time::Instant::now() + Duration::from_millis(500);
        while std::time::Instant::now() < deadline {
            if let Some((bytes, _)) = client.recv_from() {
                return Some(Message::from_bytes(bytes).unwrap());
            }
        }

        None
    }

    #[test]
    fn ping() {
        let rpc = rpc();

        let response = exchange(&rpc, RequestSpecific::Ping).unwrap();

        assert_eq!(response.transaction_id, TransactionId([3; 20]));
        assert_eq!(response.node_id, *rpc.id());
        assert_eq!(
            response.message_type,
            MessageType::Response(ResponseSpecific::Success("pong".to_string()))
        );
    }

    #[test]
    fn store_then_find_value() {
        let rpc = rpc();

        let key = Id::random();
        let publisher_id = Id::random();

        let response = exchange(
            &rpc,
            RequestSpecific::Store(StoreRequestArguments {
                key,
                publisher_id,
                port: 3333,
            }),
        )
        .unwrap();
        assert_eq!(
            response.message_type,
            MessageType::Response(ResponseSpecific::Success("OK".to_string()))
        );

        let response = exchange(
            &rpc,
            RequestSpecific::FindValue(FindValueRequestArguments { key }),
        )
        .unwrap();

        assert_eq!(
            response.message_type,
            MessageType::Response(ResponseSpecific::Values(FindValueResponseArguments {
                key,
                values: vec![Node::new(
                    publisher_id,
                    SocketAddrV4::new([127, 0, 0, 1].into(), 3333)
                )],
            }))
        );
    }

    #[test]
    fn find_value_falls_back_to_nodes() {
        let rpc = rpc();

        for _ in 0..30 {
            rpc.routing_table_mut().update(Node::random());
        }

        let key = Id::random();
        let response = exchange(
            &rpc,
            RequestSpecific::FindValue(FindValueRequestArguments { key }),
        )
        .unwrap();

        let expected = rpc.routing_table().find_closest(&key, MAX_BUCKET_SIZE_K);

        assert_eq!(
            response.message_type,
            MessageType::Response(ResponseSpecific::Nodes(expected))
        );
    }

    #[test]
    fn unspecified_publisher_address_is_not_served() {
        let rpc = rpc();

        let key = Id::random();
        let reachable = Node::new(Id::random(), SocketAddrV4::new([127, 0, 0, 1].into(), 3333));

        rpc.records_mut().publish_at(
            key,
            Node::new(*rpc.id(), SocketAddrV4::new([0, 0, 0, 0].into(), 4444)),
            std::time::Instant::now(),
        );

        let response = exchange(
            &rpc,
            RequestSpecific::FindValue(FindValueRequestArguments { key }),
        )
        .unwrap();
        assert!(matches!(
            response.message_type,
            MessageType::Response(ResponseSpecific::Nodes(_))
        ));

        rpc.records_mut().insert(key, reachable.clone());

        let response = exchange(
            &rpc,
            RequestSpecific::FindValue(FindValueRequestArguments { key }),
        )
        .unwrap();
        assert_eq!(
            response.message_type,
            MessageType::Response(ResponseSpecific::Values(FindValueResponseArguments {
                key,
                values: vec![reachable],
            }))
        );
    }

    #[test]
    fn find_node() {
        let rpc = rpc();
        let mut expected_table = RoutingTable::new(*rpc.id());

        for _ in 0..5 {
            let node = Node::random();
            rpc.routing_table_mut().update(node.clone());
            expected_table.update(node);
        }

        let target = Id::random();
        let response = exchange(
            &rpc,
            RequestSpecific::FindNode(FindNodeRequestArguments { target }),
        )
        .unwrap();

        match response.message_type {
            MessageType::Response(ResponseSpecific::Nodes(nodes)) => {
                assert_eq!(nodes, expected_table.find_closest(&target, MAX_BUCKET_SIZE_K))
            }
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn empty_store_key_gets_an_error() {
        let rpc = rpc();

        let response = exchange(
            &rpc,
            RequestSpecific::Invalid(InvalidRequest {
                method: "store".to_string(),
                reason: InvalidRequestReason::EmptyKey,
            }),
        )
        .unwrap();

        assert!(matches!(
            response.message_type,
            MessageType::Error(ErrorSpecific { exception, .. }) if exception == VALUE_ERROR
        ));
        assert!(rpc.records().is_empty());
    }

    #[test]
    fn invalid_requests_get_no_answer() {
        let rpc = rpc();

        for reason in [
            InvalidRequestReason::InvalidIdLength(20),
            InvalidRequestReason::UnknownMethod,
            InvalidRequestReason::MissingArgument,
        ] {
            let response = exchange(
                &rpc,
                RequestSpecific::Invalid(InvalidRequest {
                    method: "findNode".to_string(),
                    reason,
                }),
            );

            assert!(response.is_none());
        }
    }
}
