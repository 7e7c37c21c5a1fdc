//! Shared types used across the wardnet coordination crates: the node
//! identifier, the cluster directory, the wire frame, and the handful of
//! tunables every component reads from configuration.

pub mod config;
pub mod frame;

pub use config::{ClusterConfig, PeerInfo};
pub use frame::Frame;

/// Unique identifier for a node in the cluster. Higher id = higher Bully
/// priority. Fixed at startup; the cluster membership never changes.
pub type NodeId = u32;

/// Seconds since `UNIX_EPOCH`, as carried on the wire. Only used for
/// informational logging and for the `ts` field on `MUTEX_REQUEST`, where
/// it is the authoritative ordering key (see [`frame::Frame::MutexRequest`]).
pub fn unix_timestamp() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
