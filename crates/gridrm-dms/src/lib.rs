#![warn(missing_docs)]

//! GridRM data management: replica management across storage endpoints and the file catalog

pub mod accounting;
pub mod batch;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod integrity;
pub mod localfs;
pub mod manager;
pub mod memory;
pub mod register;
pub mod removal;
pub mod replicate;
pub mod selection;
pub mod storage;
pub mod transfer;
pub mod types;

pub use accounting::{AccountingRecord, AccountingSink, FinalStatus};
pub use batch::{envelope, BatchResult, ItemError, ItemSet, Items};
pub use catalog::{Catalog, CatalogOp, CatalogSet};
pub use config::{ConfigSource, DmsConfig, LiveConfig};
pub use dispatch::{OpArgs, OpValue};
pub use error::{DmsError, DmsResult, ErrorKind};
pub use identity::{CallerIdentity, CredentialProvider, PathPermissions};
pub use integrity::IntegrityReporter;
pub use localfs::LocalStorage;
pub use manager::ReplicaManager;
pub use memory::{MemoryCatalog, MemoryGrid, MemoryStorage};
pub use removal::{RemovalFailure, SiteFailure};
pub use replicate::ReplicateOptions;
pub use selection::{RankedReplica, SourceCandidate};
pub use storage::{StorageBackend, StorageOp, StorageRegistry, StorageResolver};
pub use types::{
    FileEntry, FileRecord, ProblematicReplica, PutReport, ReplicaEntry, ReplicaHostEntry,
    ReplicaStatus, ReplicaStatusEntry, ReplicateReport, ReplicationOutcome,
};
