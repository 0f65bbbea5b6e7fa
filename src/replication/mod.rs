//! ReplicationManager: master-slave and multi-master replication of durable
//! records, with conflict detection, resolution, and lag tracking (§4.4).

mod manager;
mod record;

pub use manager::{ApplyHandler, Consistency, NodeReplicationStatus, ReplicationManager, ReplicationStatusSnapshot};
pub use record::{merge_version_vectors, vectors_conflict, ReplicationRecord};
