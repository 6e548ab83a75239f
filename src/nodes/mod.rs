//! Node discovery, health tracking and selection.
//!
//! [`NodeCache`] keeps a scored pool of public nodes fresh in the background.
//! [`NodeManager`] sits in front of either a cache or a fixed list and tracks
//! which node a single client is routed to.

pub mod cache;
pub mod clock;
pub mod directory;
pub mod fallback;
pub mod manager;
pub mod probe;
pub mod record;
pub mod selection;
pub mod snapshot;

pub use cache::{NodeCache, NodeCacheBuilder, NodeCacheSettings};
pub use clock::{Clock, ManualClock, SystemClock};
pub use directory::{DiscoveryError, HttpNodeDirectory, NodeDirectory};
pub use fallback::{MAX_RECOMMENDED_NODE_TIMEOUT_SECS, Network, default_nodes, trusted_nodes};
pub use manager::{NodeManager, NodeStatus, NodeStatusEntry};
pub use probe::{HttpProber, NodeProber, ProbeOutcome};
pub use record::NodeRecord;
pub use snapshot::{NodeSnapshot, SnapshotError, SnapshotStore};
