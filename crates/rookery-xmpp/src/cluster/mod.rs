//! Cluster plumbing: the coordination KV store, membership and the
//! cross-instance router.

pub mod kv;
pub mod members;
pub mod router;

pub use kv::{KvError, KvEvent, KvEventType, KvStore, KvWatchStream, MemoryKv};
pub use members::MemberList;
pub use router::{ClusterRouter, InProcessClusterRouter, NoopClusterRouter};
