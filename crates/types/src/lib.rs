//! Sentinel federation data model.
//!
//! Types shared by every layer of the federation stack. Nothing in here performs
//! I/O; the network, consensus and privacy crates build behaviour on top of it.
//!
//! ## Modules
//! - `node`: federation node descriptors and status
//! - `message`: the signed message envelope exchanged between nodes
//! - `proposal`: consensus proposals and votes
//! - `signal`: threat signals and their privacy-safe shared projection

pub mod message;
pub mod node;
pub mod proposal;
pub mod signal;

pub use message::*;
pub use node::*;
pub use proposal::*;
pub use signal::*;
