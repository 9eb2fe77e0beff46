//! File catalog capability, the named-operation registry and catalog selection.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::batch::BatchResult;
use crate::error::{DmsError, DmsResult};
use crate::identity::PathPermissions;
use crate::types::{
    DirectoryListing, DirectorySize, FileEntry, FileRecord, ReplicaEntry, ReplicaHostEntry,
    ReplicaStatus, ReplicaStatusEntry,
};

/// Catalog operations reachable through the generic dispatcher.
///
/// Operations marked keyed need a payload for every item: a target for links,
/// an SE for status lookups, or a structured entry for the registration and
/// replica record operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CatalogOp {
    /// `getReplicas`
    GetReplicas,
    /// `getReplicaStatus` (keyed LFN to SE)
    GetReplicaStatus,
    /// `getFileSize`
    GetFileSize,
    /// `getFileMetadata`
    GetFileMetadata,
    /// `exists`
    Exists,
    /// `isFile`
    IsFile,
    /// `removeFile`
    RemoveFile,
    /// `addFile` (keyed LFN to file entry)
    AddFile,
    /// `addReplica` (keyed LFN to replica entry)
    AddReplica,
    /// `removeReplica` (keyed LFN to replica entry)
    RemoveReplica,
    /// `setReplicaStatus` (keyed LFN to status entry)
    SetReplicaStatus,
    /// `setReplicaHost` (keyed LFN to host entry)
    SetReplicaHost,
    /// `isDirectory`
    IsDirectory,
    /// `listDirectory`
    ListDirectory,
    /// `getDirectoryMetadata`
    GetDirectoryMetadata,
    /// `getDirectorySize`
    GetDirectorySize,
    /// `createDirectory`
    CreateDirectory,
    /// `removeDirectory`
    RemoveDirectory,
    /// `isLink`
    IsLink,
    /// `readLink`
    ReadLink,
    /// `createLink` (keyed link to target)
    CreateLink,
    /// `removeLink`
    RemoveLink,
    /// `getDirectoryReplicas`
    GetDirectoryReplicas,
}

impl CatalogOp {
    /// Every dispatchable operation.
    pub const ALL: [CatalogOp; 23] = [
        CatalogOp::GetReplicas,
        CatalogOp::GetReplicaStatus,
        CatalogOp::GetFileSize,
        CatalogOp::GetFileMetadata,
        CatalogOp::Exists,
        CatalogOp::IsFile,
        CatalogOp::RemoveFile,
        CatalogOp::AddFile,
        CatalogOp::AddReplica,
        CatalogOp::RemoveReplica,
        CatalogOp::SetReplicaStatus,
        CatalogOp::SetReplicaHost,
        CatalogOp::IsDirectory,
        CatalogOp::ListDirectory,
        CatalogOp::GetDirectoryMetadata,
        CatalogOp::GetDirectorySize,
        CatalogOp::CreateDirectory,
        CatalogOp::RemoveDirectory,
        CatalogOp::IsLink,
        CatalogOp::ReadLink,
        CatalogOp::CreateLink,
        CatalogOp::RemoveLink,
        CatalogOp::GetDirectoryReplicas,
    ];

    /// Operations every catalog must implement.
    pub const FILE_OPS: [CatalogOp; 11] = [
        CatalogOp::GetReplicas,
        CatalogOp::GetReplicaStatus,
        CatalogOp::GetFileSize,
        CatalogOp::GetFileMetadata,
        CatalogOp::Exists,
        CatalogOp::IsFile,
        CatalogOp::RemoveFile,
        CatalogOp::AddFile,
        CatalogOp::AddReplica,
        CatalogOp::RemoveReplica,
        CatalogOp::SetReplicaStatus,
    ];

    /// Wire name of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            CatalogOp::GetReplicas => "getReplicas",
            CatalogOp::GetReplicaStatus => "getReplicaStatus",
            CatalogOp::GetFileSize => "getFileSize",
            CatalogOp::GetFileMetadata => "getFileMetadata",
            CatalogOp::Exists => "exists",
            CatalogOp::IsFile => "isFile",
            CatalogOp::RemoveFile => "removeFile",
            CatalogOp::AddFile => "addFile",
            CatalogOp::AddReplica => "addReplica",
            CatalogOp::RemoveReplica => "removeReplica",
            CatalogOp::SetReplicaStatus => "setReplicaStatus",
            CatalogOp::SetReplicaHost => "setReplicaHost",
            CatalogOp::IsDirectory => "isDirectory",
            CatalogOp::ListDirectory => "listDirectory",
            CatalogOp::GetDirectoryMetadata => "getDirectoryMetadata",
            CatalogOp::GetDirectorySize => "getDirectorySize",
            CatalogOp::CreateDirectory => "createDirectory",
            CatalogOp::RemoveDirectory => "removeDirectory",
            CatalogOp::IsLink => "isLink",
            CatalogOp::ReadLink => "readLink",
            CatalogOp::CreateLink => "createLink",
            CatalogOp::RemoveLink => "removeLink",
            CatalogOp::GetDirectoryReplicas => "getDirectoryReplicas",
        }
    }

    /// Whether the operation modifies the catalog.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            CatalogOp::RemoveFile
                | CatalogOp::AddFile
                | CatalogOp::AddReplica
                | CatalogOp::RemoveReplica
                | CatalogOp::SetReplicaStatus
                | CatalogOp::SetReplicaHost
                | CatalogOp::CreateDirectory
                | CatalogOp::RemoveDirectory
                | CatalogOp::CreateLink
                | CatalogOp::RemoveLink
        )
    }
}

impl fmt::Display for CatalogOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CatalogOp {
    type Err = DmsError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        CatalogOp::ALL
            .iter()
            .copied()
            .find(|op| op.as_str() == name)
            .ok_or_else(|| DmsError::UnsupportedOperation {
                op: name.to_string(),
                target: "file catalog".to_string(),
            })
    }
}

/// Capability interface of a file catalog.
///
/// Every bulk call either fails as a whole with
/// [`DmsError::CatalogUnavailable`] or returns a [`BatchResult`] keyed by the
/// LFN (or path) it was given.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Catalog name.
    fn name(&self) -> &str;

    /// Dispatchable operations the catalog implements.
    fn supported_operations(&self) -> Vec<CatalogOp> {
        CatalogOp::FILE_OPS.to_vec()
    }

    /// Replicas of each LFN as SE to PFN. Problematic replicas are included only with `all_status`.
    async fn get_replicas(
        &self,
        lfns: &[String],
        all_status: bool,
    ) -> DmsResult<BatchResult<BTreeMap<String, String>>>;

    /// Status of the replica of each LFN at the given SE.
    async fn get_replica_status(
        &self,
        replicas: &BTreeMap<String, String>,
    ) -> DmsResult<BatchResult<ReplicaStatus>>;

    /// Registered size.
    async fn get_file_size(&self, lfns: &[String]) -> DmsResult<BatchResult<u64>>;

    /// Full file record.
    async fn get_file_metadata(&self, lfns: &[String]) -> DmsResult<BatchResult<FileRecord>>;

    /// Whether each LFN is registered.
    async fn exists(&self, lfns: &[String]) -> DmsResult<BatchResult<bool>>;

    /// Whether each path is a file (as opposed to a directory or link).
    async fn is_file(&self, lfns: &[String]) -> DmsResult<BatchResult<bool>>;

    /// Register files together with their first replica.
    async fn add_file(&self, entries: &[FileEntry]) -> DmsResult<BatchResult<bool>>;

    /// Register additional replicas.
    async fn add_replica(&self, entries: &[ReplicaEntry]) -> DmsResult<BatchResult<bool>>;

    /// Remove file records (and any replica records left).
    async fn remove_file(&self, lfns: &[String]) -> DmsResult<BatchResult<bool>>;

    /// Remove replica records.
    async fn remove_replica(&self, entries: &[ReplicaEntry]) -> DmsResult<BatchResult<bool>>;

    /// Change replica status.
    async fn set_replica_status(
        &self,
        entries: &[ReplicaStatusEntry],
    ) -> DmsResult<BatchResult<bool>>;

    /// Permission record governing `path`.
    async fn path_permissions(&self, path: &str) -> DmsResult<PathPermissions>;

    /// Move replica records to another SE name, keeping their PFN.
    async fn set_replica_host(
        &self,
        _entries: &[ReplicaHostEntry],
    ) -> DmsResult<BatchResult<bool>> {
        Err(self.unsupported(CatalogOp::SetReplicaHost))
    }

    /// Replicas of the files directly below each directory, LFN to SE to PFN.
    async fn directory_replicas(
        &self,
        _paths: &[String],
        _all_status: bool,
    ) -> DmsResult<BatchResult<BTreeMap<String, BTreeMap<String, String>>>> {
        Err(self.unsupported(CatalogOp::GetDirectoryReplicas))
    }

    /// Whether each path is a directory.
    async fn is_directory(&self, _paths: &[String]) -> DmsResult<BatchResult<bool>> {
        Err(self.unsupported(CatalogOp::IsDirectory))
    }

    /// Entries directly below each directory.
    async fn list_directory(
        &self,
        _paths: &[String],
    ) -> DmsResult<BatchResult<DirectoryListing>> {
        Err(self.unsupported(CatalogOp::ListDirectory))
    }

    /// Ownership and mode of each directory.
    async fn directory_metadata(
        &self,
        _paths: &[String],
    ) -> DmsResult<BatchResult<PathPermissions>> {
        Err(self.unsupported(CatalogOp::GetDirectoryMetadata))
    }

    /// Number and total size of the files directly below each directory.
    async fn directory_size(&self, _paths: &[String]) -> DmsResult<BatchResult<DirectorySize>> {
        Err(self.unsupported(CatalogOp::GetDirectorySize))
    }

    /// Create directories (and missing parents).
    async fn create_directory(&self, _paths: &[String]) -> DmsResult<BatchResult<bool>> {
        Err(self.unsupported(CatalogOp::CreateDirectory))
    }

    /// Remove empty directories.
    async fn remove_directory(&self, _paths: &[String]) -> DmsResult<BatchResult<bool>> {
        Err(self.unsupported(CatalogOp::RemoveDirectory))
    }

    /// Whether each path is a link.
    async fn is_link(&self, _paths: &[String]) -> DmsResult<BatchResult<bool>> {
        Err(self.unsupported(CatalogOp::IsLink))
    }

    /// Target of each link.
    async fn read_link(&self, _paths: &[String]) -> DmsResult<BatchResult<String>> {
        Err(self.unsupported(CatalogOp::ReadLink))
    }

    /// Create links; keys are link paths, values their targets.
    async fn create_link(&self, _links: &BTreeMap<String, String>) -> DmsResult<BatchResult<bool>> {
        Err(self.unsupported(CatalogOp::CreateLink))
    }

    /// Remove links.
    async fn remove_link(&self, _paths: &[String]) -> DmsResult<BatchResult<bool>> {
        Err(self.unsupported(CatalogOp::RemoveLink))
    }

    /// Error returned for an operation the catalog does not implement.
    fn unsupported(&self, op: CatalogOp) -> DmsError {
        DmsError::UnsupportedOperation {
            op: op.to_string(),
            target: self.name().to_string(),
        }
    }
}

/// Named catalogs with a default. Selection never mutates the set.
#[derive(Clone)]
pub struct CatalogSet {
    default: String,
    catalogs: BTreeMap<String, Arc<dyn Catalog>>,
}

impl CatalogSet {
    /// A set holding one catalog, which is also the default.
    pub fn single(catalog: Arc<dyn Catalog>) -> Self {
        let default = catalog.name().to_string();
        let mut catalogs = BTreeMap::new();
        catalogs.insert(default.clone(), catalog);
        Self { default, catalogs }
    }

    /// Add another catalog addressable by name.
    pub fn with(mut self, catalog: Arc<dyn Catalog>) -> Self {
        self.catalogs.insert(catalog.name().to_string(), catalog);
        self
    }

    /// Make the named catalog the default.
    pub fn with_default(mut self, name: &str) -> DmsResult<Self> {
        if !self.catalogs.contains_key(name) {
            return Err(DmsError::catalog(format!("unknown catalog {}", name)));
        }
        self.default = name.to_string();
        Ok(self)
    }

    /// Name of the default catalog.
    pub fn default_name(&self) -> &str {
        &self.default
    }

    /// Names of all catalogs.
    pub fn names(&self) -> Vec<String> {
        self.catalogs.keys().cloned().collect()
    }

    /// The named catalog, or the default when `selector` is `None` or empty.
    pub fn select(&self, selector: Option<&str>) -> DmsResult<Arc<dyn Catalog>> {
        let name = match selector {
            Some(name) if !name.is_empty() => name,
            _ => self.default.as_str(),
        };
        self.catalogs
            .get(name)
            .cloned()
            .ok_or_else(|| DmsError::catalog(format!("unknown catalog {}", name)))
    }
}

impl fmt::Debug for CatalogSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogSet")
            .field("default", &self.default)
            .field("catalogs", &self.catalogs.keys().collect::<Vec<_>>())
            .finish()
    }
}
