#![doc = include_str!("../README.md")]
//! ## Feature flags
#![doc = document_features::document_features!()]
//!

// Public modules
mod common;
mod error;

#[cfg(feature = "async")]
pub mod async_dht;
mod dht;
pub mod rpc;

pub use crate::common::{
    messages, ClosestNodes, Id, KBucket, Node, RoutingTable, UpdateOutcome, ID_SIZE,
    MAX_BUCKET_SIZE_K, NUM_BUCKETS,
};
pub use dht::{Dht, DhtBuilder, DhtWasShutdown, Testnet};
pub use error::Error;
pub use rpc::{Config, Info, RequestError, Timings};

// Alias Result to be the crate Result.
pub type Result<T, E = Error> = core::result::Result<T, E>;
