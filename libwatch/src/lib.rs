pub mod backoff;
pub mod coordinator;
pub mod engine;
pub mod kv;
pub mod session;
pub mod with_xline;

pub use backoff::{BackoffPolicy, InvalidBoundsError};
pub use coordinator::{SnapshotSink, TopologyWatchCoordinator};
pub use engine::{LongPollEngine, SnapshotCallback, WatchOptions};
pub use kv::{KvClient, KvError, Snapshot};
pub use session::{LongPollSession, SessionState};
