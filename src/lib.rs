//! Proof-of-Indexing node
//!
//! A peer-to-peer node that:
//! - relays signed gossip messages across the fleet with TTL and hop bounds
//! - mines double SHA-256 blocks committing to claimed indexing work
//! - retargets difficulty Bitcoin-style every adjustment period
//! - submits mints to the settlement layer strictly one at a time

pub mod config;
pub mod crypto;
pub mod difficulty;
pub mod error;
pub mod gossip;
pub mod mempool;
pub mod mint;
pub mod node;
pub mod pow;
pub mod types;
pub mod utils;
pub mod worker;

pub use config::Config;
pub use error::{Error, Result};
pub use node::{NodeHandle, NodeLauncher, NodeStatus};
pub use types::*;

/// Application information
pub const APP_NAME: &str = "poi-node";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const APP_DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
