//! Serialize and deserialize DHT messages.
//!
//! Every message is a bencoded dictionary keyed by `"0"`..`"4"`, where `"0"` holds the
//! message type discriminant. Decoding reads that discriminant first, then decodes the
//! whole packet into one of three fixed shapes: request, response or error.

mod internal;

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use serde_bencode::value::Value;
use serde_bytes::ByteBuf;

use crate::common::{Id, Node, ID_SIZE};
use crate::{Error, Result};

/// The size of a transaction id in bytes.
pub const TRANSACTION_ID_SIZE: usize = 20;
/// Compact node info: Id + 4 bytes IPv4 + 2 bytes big-endian port.
pub const COMPACT_NODE_INFO_LENGTH: usize = ID_SIZE + 6;

pub const PING_METHOD: &str = "ping";
pub const STORE_METHOD: &str = "store";
pub const FIND_NODE_METHOD: &str = "findNode";
pub const FIND_VALUE_METHOD: &str = "findValue";

pub const PING_SUCCESS_RESPONSE: &str = "pong";
pub const STORE_SUCCESS_RESPONSE: &str = "OK";

const LBRYID_FIELD: &[u8] = b"lbryid";
const PORT_FIELD: &[u8] = b"port";

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// Opaque token correlating a response or error with the request that caused it.
pub struct TransactionId(pub [u8; TRANSACTION_ID_SIZE]);

impl TransactionId {
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Self> {
        let bytes = bytes.as_ref();

        let tid: [u8; TRANSACTION_ID_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::InvalidTransactionId(bytes.to_vec()))?;

        Ok(Self(tid))
    }
}

impl Debug for TransactionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Tid(")?;
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct Message {
    pub transaction_id: TransactionId,

    /// The Id of the node that sent this message.
    pub node_id: Id,

    pub message_type: MessageType,
}

#[derive(Debug, PartialEq, Clone)]
pub enum MessageType {
    Request(RequestSpecific),

    Response(ResponseSpecific),

    Error(ErrorSpecific),
}

#[derive(Debug, PartialEq, Clone)]
pub enum RequestSpecific {
    Ping,
    Store(StoreRequestArguments),
    FindNode(FindNodeRequestArguments),
    FindValue(FindValueRequestArguments),

    /// A request with a well formed header, but an unknown method or bad arguments.
    Invalid(InvalidRequest),
}

#[derive(Debug, PartialEq, Clone)]
pub enum ResponseSpecific {
    /// `pong` for ping, `OK` for store.
    Success(String),
    /// Closest nodes to the requested target.
    Nodes(Vec<Node>),
    /// Publishers found for a key.
    Values(FindValueResponseArguments),
}

#[derive(Debug, PartialEq, Clone)]
pub struct ErrorSpecific {
    pub exception: String,
    pub args: Vec<Vec<u8>>,
}

// === STORE ===

#[derive(Debug, PartialEq, Clone)]
pub struct StoreRequestArguments {
    pub key: Id,
    pub publisher_id: Id,
    /// The port the publisher serves the content on.
    pub port: u16,
}

// === FIND_NODE ===

#[derive(Debug, PartialEq, Clone)]
pub struct FindNodeRequestArguments {
    pub target: Id,
}

// === FIND_VALUE ===

#[derive(Debug, PartialEq, Clone)]
pub struct FindValueRequestArguments {
    pub key: Id,
}

#[derive(Debug, PartialEq, Clone)]
pub struct FindValueResponseArguments {
    pub key: Id,
    pub values: Vec<Node>,
}

// === INVALID ===

#[derive(Debug, PartialEq, Clone)]
pub struct InvalidRequest {
    pub method: String,
    pub reason: InvalidRequestReason,
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum InvalidRequestReason {
    UnknownMethod,
    MissingArgument,
    InvalidIdLength(usize),
    InvalidPort,
    EmptyKey,
}

impl RequestSpecific {
    pub fn method(&self) -> &str {
        match self {
            RequestSpecific::Ping => PING_METHOD,
            RequestSpecific::Store(_) => STORE_METHOD,
            RequestSpecific::FindNode(_) => FIND_NODE_METHOD,
            RequestSpecific::FindValue(_) => FIND_VALUE_METHOD,
            RequestSpecific::Invalid(invalid) => &invalid.method,
        }
    }
}

impl Message {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let transaction_id = self.transaction_id.0.to_vec();
        let node_id = self.node_id.to_vec();

        let bytes = match &self.message_type {
            MessageType::Request(request) => internal::DHTRequest {
                message_type: internal::REQUEST_TYPE,
                transaction_id,
                node_id,
                method: request.method().as_bytes().to_vec(),
                args: request_args(request),
            }
            .to_bytes()?,
            MessageType::Response(response) => internal::DHTResponse {
                message_type: internal::RESPONSE_TYPE,
                transaction_id,
                node_id,
                payload: response_payload(response),
            }
            .to_bytes()?,
            MessageType::Error(error) => internal::DHTError {
                message_type: internal::ERROR_TYPE,
                transaction_id,
                node_id,
                exception: error.exception.as_bytes().to_vec(),
                args: error.args.iter().cloned().map(ByteBuf::from).collect(),
            }
            .to_bytes()?,
        };

        Ok(bytes)
    }

    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Message> {
        let bytes = bytes.as_ref();

        match internal::DHTMessageHeader::from_bytes(bytes)?.message_type {
            internal::REQUEST_TYPE => {
                let request = internal::DHTRequest::from_bytes(bytes)?;

                Ok(Message {
                    transaction_id: TransactionId::from_bytes(&request.transaction_id)?,
                    node_id: Id::from_bytes(&request.node_id)?,
                    message_type: MessageType::Request(parse_request(
                        &request.method,
                        &request.args,
                    )?),
                })
            }
            internal::RESPONSE_TYPE => {
                let response = internal::DHTResponse::from_bytes(bytes)?;

                Ok(Message {
                    transaction_id: TransactionId::from_bytes(&response.transaction_id)?,
                    node_id: Id::from_bytes(&response.node_id)?,
                    message_type: MessageType::Response(parse_payload(response.payload)?),
                })
            }
            internal::ERROR_TYPE => {
                let error = internal::DHTError::from_bytes(bytes)?;

                Ok(Message {
                    transaction_id: TransactionId::from_bytes(&error.transaction_id)?,
                    node_id: Id::from_bytes(&error.node_id)?,
                    message_type: MessageType::Error(ErrorSpecific {
                        exception: String::from_utf8_lossy(&error.exception).to_string(),
                        args: error.args.into_iter().map(ByteBuf::into_vec).collect(),
                    }),
                })
            }
            other => Err(Error::InvalidMessageType(other)),
        }
    }

    /// If the response contains closer nodes to the target, return that!
    pub fn get_closer_nodes(&self) -> Option<&[Node]> {
        match &self.message_type {
            MessageType::Response(ResponseSpecific::Nodes(nodes)) => Some(nodes),
            _ => None,
        }
    }
}

fn request_args(request: &RequestSpecific) -> Vec<Value> {
    match request {
        RequestSpecific::Ping | RequestSpecific::Invalid(_) => vec![],
        RequestSpecific::FindNode(FindNodeRequestArguments { target }) => {
            vec![Value::Bytes(target.to_vec())]
        }
        RequestSpecific::FindValue(FindValueRequestArguments { key }) => {
            vec![Value::Bytes(key.to_vec())]
        }
        RequestSpecific::Store(StoreRequestArguments {
            key,
            publisher_id,
            port,
        }) => {
            let mut payload = HashMap::new();
            payload.insert(LBRYID_FIELD.to_vec(), Value::Bytes(publisher_id.to_vec()));
            payload.insert(PORT_FIELD.to_vec(), Value::Int((*port).into()));

            vec![Value::Bytes(key.to_vec()), Value::Dict(payload)]
        }
    }
}

fn parse_request(method: &[u8], args: &[Value]) -> Result<RequestSpecific> {
    let method = String::from_utf8_lossy(method).to_string();

    let invalid = |reason| {
        Ok(RequestSpecific::Invalid(InvalidRequest {
            method: method.clone(),
            reason,
        }))
    };

    match method.as_str() {
        PING_METHOD => Ok(RequestSpecific::Ping),
        FIND_NODE_METHOD | FIND_VALUE_METHOD => {
            let id = match args.first() {
                Some(Value::Bytes(bytes)) => bytes,
                _ => return invalid(InvalidRequestReason::MissingArgument),
            };
            let id = match Id::from_bytes(id) {
                Ok(id) => id,
                Err(_) => return invalid(InvalidRequestReason::InvalidIdLength(id.len())),
            };

            if method == FIND_NODE_METHOD {
                Ok(RequestSpecific::FindNode(FindNodeRequestArguments {
                    target: id,
                }))
            } else {
                Ok(RequestSpecific::FindValue(FindValueRequestArguments { key: id }))
            }
        }
        STORE_METHOD => {
            let key = match args.first() {
                Some(Value::Bytes(bytes)) if bytes.is_empty() => {
                    return invalid(InvalidRequestReason::EmptyKey)
                }
                Some(Value::Bytes(bytes)) => bytes,
                _ => return invalid(InvalidRequestReason::MissingArgument),
            };
            let key = match Id::from_bytes(key) {
                Ok(key) => key,
                Err(_) => return invalid(InvalidRequestReason::InvalidIdLength(key.len())),
            };

            let payload = match args.get(1) {
                Some(Value::Dict(payload)) => payload,
                _ => return invalid(InvalidRequestReason::MissingArgument),
            };

            let publisher_id = match payload.get(LBRYID_FIELD) {
                Some(Value::Bytes(bytes)) => match Id::from_bytes(bytes) {
                    Ok(id) => id,
                    Err(_) => {
                        return invalid(InvalidRequestReason::InvalidIdLength(bytes.len()))
                    }
                },
                _ => return invalid(InvalidRequestReason::MissingArgument),
            };

            let port = match payload.get(PORT_FIELD) {
                Some(Value::Int(port)) => match u16::try_from(*port) {
                    Ok(port) => port,
                    Err(_) => return invalid(InvalidRequestReason::InvalidPort),
                },
                _ => return invalid(InvalidRequestReason::MissingArgument),
            };

            Ok(RequestSpecific::Store(StoreRequestArguments {
                key,
                publisher_id,
                port,
            }))
        }
        _ => invalid(InvalidRequestReason::UnknownMethod),
    }
}

fn response_payload(response: &ResponseSpecific) -> Value {
    match response {
        ResponseSpecific::Success(marker) => Value::Bytes(marker.as_bytes().to_vec()),
        ResponseSpecific::Nodes(nodes) => nodes_to_value(nodes),
        ResponseSpecific::Values(FindValueResponseArguments { key, values }) => {
            let mut dict = HashMap::new();
            dict.insert(key.to_vec(), nodes_to_value(values));

            Value::Dict(dict)
        }
    }
}

fn parse_payload(payload: Value) -> Result<ResponseSpecific> {
    match payload {
        Value::Bytes(marker) => Ok(ResponseSpecific::Success(
            String::from_utf8_lossy(&marker).to_string(),
        )),
        Value::List(list) => Ok(ResponseSpecific::Nodes(value_to_nodes(list)?)),
        Value::Dict(dict) => {
            let (key, values) = dict
                .into_iter()
                .find(|(key, _)| key.len() == ID_SIZE)
                .ok_or(Error::InvalidPayload("found values without a key"))?;

            let values = match values {
                Value::List(list) => value_to_nodes(list)?,
                _ => return Err(Error::InvalidPayload("found values are not a list")),
            };

            Ok(ResponseSpecific::Values(FindValueResponseArguments {
                key: Id::from_bytes(key)?,
                values,
            }))
        }
        Value::Int(_) => Err(Error::InvalidPayload("integer response payload")),
    }
}

fn nodes_to_value(nodes: &[Node]) -> Value {
    Value::List(
        nodes
            .iter()
            .map(|node| Value::Bytes(node_to_compact(node)))
            .collect(),
    )
}

fn value_to_nodes(list: Vec<Value>) -> Result<Vec<Node>> {
    list.into_iter()
        .map(|value| match value {
            Value::Bytes(bytes) => compact_to_node(&bytes),
            _ => Err(Error::InvalidPayload("compact node info is not a byte string")),
        })
        .collect()
}

/// Encode a node as compact node info.
pub fn node_to_compact(node: &Node) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(COMPACT_NODE_INFO_LENGTH);

    bytes.extend_from_slice(node.id.as_bytes());
    bytes.extend_from_slice(&sockaddr_to_bytes(&node.address));

    bytes
}

/// Decode compact node info.
///
/// IPv6 compact node info (18 address bytes) is recognized, but not supported.
pub fn compact_to_node(bytes: &[u8]) -> Result<Node> {
    match bytes.len() {
        COMPACT_NODE_INFO_LENGTH => {}
        len if len == ID_SIZE + 18 => return Err(Error::Ipv6Unsupported),
        len => return Err(Error::InvalidCompactNodeInfo(len)),
    }

    let id = Id::from_bytes(&bytes[..ID_SIZE])?;

    let address = &bytes[ID_SIZE..];
    let ip = Ipv4Addr::new(address[0], address[1], address[2], address[3]);
    let port = u16::from_be_bytes([address[4], address[5]]);

    Ok(Node::new(id, SocketAddrV4::new(ip, port)))
}

pub fn sockaddr_to_bytes(sockaddr: &SocketAddrV4) -> [u8; 6] {
    let mut bytes = [0_u8; 6];

    bytes[..4].copy_from_slice(&sockaddr.ip().octets());
    bytes[4..].copy_from_slice(&sockaddr.port().to_be_bytes());

    bytes
}

/// Convert a [SocketAddr] to [SocketAddrV4], as only IPv4 fits the compact node info.
pub fn to_v4(address: SocketAddr) -> Result<SocketAddrV4> {
    match address {
        SocketAddr::V4(address) => Ok(address),
        SocketAddr::V6(_) => Err(Error::Ipv6Unsupported),
    }
}
