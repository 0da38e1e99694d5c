use serde::{Deserialize, Serialize};
use serde_bencode::value::Value;
use serde_bytes::ByteBuf;

pub const REQUEST_TYPE: i64 = 0;
pub const RESPONSE_TYPE: i64 = 1;
pub const ERROR_TYPE: i64 = 2;

/// Just the discriminant, decoded before anything else.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct DHTMessageHeader {
    #[serde(rename = "0")]
    pub message_type: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTRequest {
    #[serde(rename = "0")]
    pub message_type: i64,

    #[serde(rename = "1", with = "serde_bytes")]
    pub transaction_id: Vec<u8>,

    #[serde(rename = "2", with = "serde_bytes")]
    pub node_id: Vec<u8>,

    #[serde(rename = "3", with = "serde_bytes")]
    pub method: Vec<u8>,

    #[serde(default)]
    #[serde(rename = "4")]
    pub args: Vec<Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTResponse {
    #[serde(rename = "0")]
    pub message_type: i64,

    #[serde(rename = "1", with = "serde_bytes")]
    pub transaction_id: Vec<u8>,

    #[serde(rename = "2", with = "serde_bytes")]
    pub node_id: Vec<u8>,

    /// A success marker, a list of compact node infos, or a dictionary of found values.
    #[serde(rename = "3")]
    pub payload: Value,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTError {
    #[serde(rename = "0")]
    pub message_type: i64,

    #[serde(rename = "1", with = "serde_bytes")]
    pub transaction_id: Vec<u8>,

    #[serde(rename = "2", with = "serde_bytes")]
    pub node_id: Vec<u8>,

    #[serde(rename = "3", with = "serde_bytes")]
    pub exception: Vec<u8>,

    #[serde(default)]
    #[serde(rename = "4")]
    pub args: Vec<ByteBuf>,
}

impl DHTMessageHeader {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_bencode::Error> {
        serde_bencode::from_bytes(bytes)
    }
}

impl DHTRequest {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_bencode::Error> {
        serde_bencode::from_bytes(bytes)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        serde_bencode::to_bytes(self)
    }
}

impl DHTResponse {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_bencode::Error> {
        serde_bencode::from_bytes(bytes)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        serde_bencode::to_bytes(self)
    }
}

impl DHTError {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_bencode::Error> {
        serde_bencode::from_bytes(bytes)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        serde_bencode::to_bytes(self)
    }
}
