// Cluster-aware Redis client: slot routing, redirects, replica reads

pub mod client;
pub mod cluster;
pub mod command;
pub mod config;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod pubsub;

// Re-export commonly used types
pub use client::{NodeClient, SlotRange};
pub use cluster::node::NodeHandle;
pub use cluster::slots::{key_hash_slot, random_slot, CLUSTER_SLOTS};
pub use cluster::{keys_hash_slot, ClusterClient};
pub use command::{Cmd, CommandInfo};
pub use config::ClusterConfig;
pub use error::{ClusterError, Redirect, RedirectKind};
pub use pool::PoolStats;
pub use protocol::{RespParser, RespSerializer, RespValue};
pub use pubsub::{ClusterPubSub, PubSubMessage};
