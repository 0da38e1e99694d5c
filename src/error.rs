//! Main Crate Error

#[derive(thiserror::Error, Debug)]
/// Lbry DHT crate error enum.
pub enum Error {
    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    #[error("Failed to parse packet bytes: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    /// Id or key is not [crate::ID_SIZE] bytes long.
    #[error("Invalid Id size, expected 48, got {0}")]
    InvalidIdSize(usize),

    /// Id is not a valid hex encoded 48 bytes.
    #[error("Invalid Id encoding: {0}")]
    InvalidIdEncoding(String),

    /// Indicates that the message transaction_id is not 20 bytes.
    #[error("Invalid transaction_id: {0:?}")]
    InvalidTransactionId(Vec<u8>),

    /// The message type discriminant is not one of request, response or error.
    #[error("Invalid message type: {0}")]
    InvalidMessageType(i64),

    #[error("Invalid compact node info length: {0}")]
    InvalidCompactNodeInfo(usize),

    #[error("Invalid response payload: {0}")]
    InvalidPayload(&'static str),

    #[error("IPv6 is not supported")]
    Ipv6Unsupported,
}
