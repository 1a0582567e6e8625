//! Per-shard orchestration engine for backing up and restoring partitioned
//! columnar-database table data to an S3-compatible object store.

pub mod error;
pub mod model;
pub mod object_store;
pub mod orchestrator;
pub mod parts;
pub mod pool;
pub mod remote;
pub mod restore;
pub mod retry;
pub mod ttl;

pub use error::{BackupError, Result};
pub use model::{
    BackupUnitId, CompressionMethod, Outcome, PartDescriptor, Replica, Shard, Topology,
    VerifyMode,
};
pub use object_store::{ObjectStore, ObjectStoreOptions, VerifyReport};
pub use orchestrator::{BackupUnitConfig, UnitResult};
pub use pool::{ClusterPool, ReplicaHandle};
pub use restore::{RestoreUnitConfig, run_unit as run_restore_unit};
pub use ttl::{resolve_ttl_cutoff, format_partition_key, PartitionScope};
