//! Miscellaneous common structs used throughout the library.

mod closest_nodes;
mod id;
pub mod messages;
mod node;
mod routing_table;

pub use closest_nodes::*;
pub use id::*;
pub use messages::*;
pub use node::*;
pub use routing_table::*;
