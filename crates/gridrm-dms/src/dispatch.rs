//! Generic bulk dispatch of named catalog and storage operations.
//!
//! Every capability operation is reachable by name through one of two
//! dispatchers. The name is parsed into a [`CatalogOp`] or [`StorageOp`] and
//! checked against the target's advertised operations before any call is
//! made. Replica operations resolve LFNs to the PFN at a named endpoint first
//! and report their results keyed by LFN again.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::batch::{BatchResult, ItemError, ItemSet, Items};
use crate::catalog::CatalogOp;
use crate::error::{DmsError, DmsResult, ErrorKind};
use crate::identity::PathPermissions;
use crate::manager::ReplicaManager;
use crate::storage::StorageOp;
use crate::types::{
    DirectoryListing, DirectorySize, FileEntry, FileRecord, PhysicalMetadata, ReplicaEntry,
    ReplicaHostEntry, ReplicaStatus, ReplicaStatusEntry,
};

/// Extra arguments some operations need.
#[derive(Debug, Clone, Default)]
pub struct OpArgs {
    /// Include replicas of every status (`getReplicas`).
    pub all_status: bool,
    /// Pin or staging lifetime; the configured default when unset.
    pub lifetime: Option<Duration>,
    /// Local directory for `getFile`.
    pub local_path: Option<PathBuf>,
    /// Expected size for `replicateFile`.
    pub expected_size: u64,
    /// Protocols for `getAccessUrl`; the third-party protocols when empty.
    pub protocols: Vec<String>,
    /// File entries for `addFile`, by LFN.
    pub files: BTreeMap<String, FileEntry>,
    /// Replica entries for `addReplica` and `removeReplica`, by LFN.
    pub replicas: BTreeMap<String, ReplicaEntry>,
    /// Status entries for `setReplicaStatus`, by LFN.
    pub statuses: BTreeMap<String, ReplicaStatusEntry>,
    /// Host entries for `setReplicaHost`, by LFN.
    pub hosts: BTreeMap<String, ReplicaHostEntry>,
}

impl OpArgs {
    /// Arguments for an operation writing into `local_path`.
    pub fn with_local_path(local_path: impl Into<PathBuf>) -> Self {
        Self {
            local_path: Some(local_path.into()),
            ..Self::default()
        }
    }

    /// Arguments for a pin or staging request of `lifetime`.
    pub fn with_lifetime(lifetime: Duration) -> Self {
        Self {
            lifetime: Some(lifetime),
            ..Self::default()
        }
    }
}

/// Per-item value returned by a dispatched operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OpValue {
    /// Boolean answer or completion flag.
    Flag(bool),
    /// Size in bytes.
    Size(u64),
    /// Text such as an access URL, link target or request identifier.
    Text(String),
    /// Replica locations, SE to PFN.
    Replicas(BTreeMap<String, String>),
    /// Replica status.
    Status(ReplicaStatus),
    /// Catalog file record.
    File(FileRecord),
    /// Physical file metadata.
    Physical(PhysicalMetadata),
    /// Directory contents.
    Listing(DirectoryListing),
    /// Directory size summary.
    DirSize(DirectorySize),
    /// Directory permission record.
    Permissions(PathPermissions),
    /// Local file written by a download.
    Path(PathBuf),
    /// Replica locations of the files in a directory, LFN to SE to PFN.
    DirectoryReplicas(BTreeMap<String, BTreeMap<String, String>>),
}

impl OpValue {
    /// The boolean, if this is a [`OpValue::Flag`].
    pub fn into_flag(self) -> Option<bool> {
        match self {
            OpValue::Flag(v) => Some(v),
            _ => None,
        }
    }

    /// The size, if this is a [`OpValue::Size`].
    pub fn into_size(self) -> Option<u64> {
        match self {
            OpValue::Size(v) => Some(v),
            _ => None,
        }
    }

    /// The text, if this is a [`OpValue::Text`].
    pub fn into_text(self) -> Option<String> {
        match self {
            OpValue::Text(v) => Some(v),
            _ => None,
        }
    }

    /// The replica map, if this is a [`OpValue::Replicas`].
    pub fn into_replicas(self) -> Option<BTreeMap<String, String>> {
        match self {
            OpValue::Replicas(v) => Some(v),
            _ => None,
        }
    }

    /// The status, if this is a [`OpValue::Status`].
    pub fn into_status(self) -> Option<ReplicaStatus> {
        match self {
            OpValue::Status(v) => Some(v),
            _ => None,
        }
    }

    /// The file record, if this is a [`OpValue::File`].
    pub fn into_file(self) -> Option<FileRecord> {
        match self {
            OpValue::File(v) => Some(v),
            _ => None,
        }
    }

    /// The physical metadata, if this is a [`OpValue::Physical`].
    pub fn into_physical(self) -> Option<PhysicalMetadata> {
        match self {
            OpValue::Physical(v) => Some(v),
            _ => None,
        }
    }

    /// The listing, if this is a [`OpValue::Listing`].
    pub fn into_listing(self) -> Option<DirectoryListing> {
        match self {
            OpValue::Listing(v) => Some(v),
            _ => None,
        }
    }

    /// The size summary, if this is a [`OpValue::DirSize`].
    pub fn into_dir_size(self) -> Option<DirectorySize> {
        match self {
            OpValue::DirSize(v) => Some(v),
            _ => None,
        }
    }

    /// The permission record, if this is a [`OpValue::Permissions`].
    pub fn into_permissions(self) -> Option<PathPermissions> {
        match self {
            OpValue::Permissions(v) => Some(v),
            _ => None,
        }
    }

    /// The local path, if this is a [`OpValue::Path`].
    pub fn into_path(self) -> Option<PathBuf> {
        match self {
            OpValue::Path(v) => Some(v),
            _ => None,
        }
    }

    /// The per-file replica map, if this is a [`OpValue::DirectoryReplicas`].
    pub fn into_directory_replicas(self) -> Option<BTreeMap<String, BTreeMap<String, String>>> {
        match self {
            OpValue::DirectoryReplicas(v) => Some(v),
            _ => None,
        }
    }
}

/// Narrow a dispatched batch to one value type.
fn typed<T>(batch: BatchResult<OpValue>, extract: fn(OpValue) -> Option<T>) -> BatchResult<T> {
    let mut out = BatchResult::new();
    for (item, error) in batch.failed {
        out.fail(item, error);
    }
    for (item, value) in batch.successful {
        match extract(value) {
            Some(value) => {
                out.succeed(item, value);
            }
            None => out.fail(
                item,
                ItemError::new(ErrorKind::UnsupportedOperation, "unexpected result type"),
            ),
        }
    }
    out
}

fn require_keyed(items: &ItemSet, op: &str) -> DmsResult<BTreeMap<String, String>> {
    let keyed = items.keyed();
    if keyed.len() != items.len() {
        return Err(DmsError::invalid_input(format!(
            "{} needs a payload for every item",
            op
        )));
    }
    Ok(keyed)
}

/// The entry supplied for every item, in item order.
fn entries_for<T: Clone>(
    ids: &[String],
    entries: &BTreeMap<String, T>,
    lfn_of: fn(&T) -> &str,
    op: &str,
) -> DmsResult<Vec<T>> {
    ids.iter()
        .map(|id| match entries.get(id) {
            Some(entry) if lfn_of(entry) == id => Ok(entry.clone()),
            Some(entry) => Err(DmsError::invalid_input(format!(
                "{} entry for {} names {}",
                op,
                id,
                lfn_of(entry)
            ))),
            None => Err(DmsError::invalid_input(format!(
                "{} has no entry for {}",
                op, id
            ))),
        })
        .collect()
}

/// Index entries by their LFN.
fn by_lfn<T>(entries: Vec<T>, lfn_of: fn(&T) -> &str) -> (Vec<String>, BTreeMap<String, T>) {
    let mut lfns = Vec::with_capacity(entries.len());
    let mut indexed = BTreeMap::new();
    for entry in entries {
        let lfn = lfn_of(&entry).to_string();
        lfns.push(lfn.clone());
        indexed.insert(lfn, entry);
    }
    (lfns, indexed)
}

fn file_lfn(entry: &FileEntry) -> &str {
    &entry.lfn
}

fn replica_lfn(entry: &ReplicaEntry) -> &str {
    &entry.lfn
}

fn status_lfn(entry: &ReplicaStatusEntry) -> &str {
    &entry.lfn
}

fn host_lfn(entry: &ReplicaHostEntry) -> &str {
    &entry.lfn
}

impl ReplicaManager {
    /// Run a named catalog operation over `items`.
    pub async fn execute_catalog_op(
        &self,
        items: impl Into<Items>,
        operation: &str,
        args: &OpArgs,
        catalog: Option<&str>,
    ) -> DmsResult<BatchResult<OpValue>> {
        let items = ItemSet::normalize(items)?;
        let op: CatalogOp = operation.parse()?;
        let file_catalog = self.catalog(catalog)?;
        if !file_catalog.supported_operations().contains(&op) {
            return Err(DmsError::UnsupportedOperation {
                op: operation.to_string(),
                target: file_catalog.name().to_string(),
            });
        }
        if op.is_write() {
            info!(op = %op, catalog = file_catalog.name(), count = items.len(), "catalog write");
        } else {
            debug!(op = %op, catalog = file_catalog.name(), count = items.len(), "catalog call");
        }

        let ids = items.ids();
        let batch = match op {
            CatalogOp::GetReplicas => file_catalog
                .get_replicas(&ids, args.all_status)
                .await?
                .map_values(OpValue::Replicas),
            CatalogOp::GetReplicaStatus => {
                let keyed = require_keyed(&items, operation)?;
                file_catalog
                    .get_replica_status(&keyed)
                    .await?
                    .map_values(OpValue::Status)
            }
            CatalogOp::GetFileSize => file_catalog
                .get_file_size(&ids)
                .await?
                .map_values(OpValue::Size),
            CatalogOp::GetFileMetadata => file_catalog
                .get_file_metadata(&ids)
                .await?
                .map_values(OpValue::File),
            CatalogOp::Exists => file_catalog.exists(&ids).await?.map_values(OpValue::Flag),
            CatalogOp::IsFile => file_catalog.is_file(&ids).await?.map_values(OpValue::Flag),
            CatalogOp::RemoveFile => file_catalog
                .remove_file(&ids)
                .await?
                .map_values(OpValue::Flag),
            CatalogOp::AddFile => {
                let entries = entries_for(&ids, &args.files, file_lfn, operation)?;
                file_catalog
                    .add_file(&entries)
                    .await?
                    .map_values(OpValue::Flag)
            }
            CatalogOp::AddReplica => {
                let entries = entries_for(&ids, &args.replicas, replica_lfn, operation)?;
                file_catalog
                    .add_replica(&entries)
                    .await?
                    .map_values(OpValue::Flag)
            }
            CatalogOp::RemoveReplica => {
                let entries = entries_for(&ids, &args.replicas, replica_lfn, operation)?;
                file_catalog
                    .remove_replica(&entries)
                    .await?
                    .map_values(OpValue::Flag)
            }
            CatalogOp::SetReplicaStatus => {
                let entries = entries_for(&ids, &args.statuses, status_lfn, operation)?;
                file_catalog
                    .set_replica_status(&entries)
                    .await?
                    .map_values(OpValue::Flag)
            }
            CatalogOp::SetReplicaHost => {
                let entries = entries_for(&ids, &args.hosts, host_lfn, operation)?;
                file_catalog
                    .set_replica_host(&entries)
                    .await?
                    .map_values(OpValue::Flag)
            }
            CatalogOp::IsDirectory => file_catalog
                .is_directory(&ids)
                .await?
                .map_values(OpValue::Flag),
            CatalogOp::ListDirectory => file_catalog
                .list_directory(&ids)
                .await?
                .map_values(OpValue::Listing),
            CatalogOp::GetDirectoryMetadata => file_catalog
                .directory_metadata(&ids)
                .await?
                .map_values(OpValue::Permissions),
            CatalogOp::GetDirectorySize => file_catalog
                .directory_size(&ids)
                .await?
                .map_values(OpValue::DirSize),
            CatalogOp::CreateDirectory => file_catalog
                .create_directory(&ids)
                .await?
                .map_values(OpValue::Flag),
            CatalogOp::RemoveDirectory => file_catalog
                .remove_directory(&ids)
                .await?
                .map_values(OpValue::Flag),
            CatalogOp::IsLink => file_catalog.is_link(&ids).await?.map_values(OpValue::Flag),
            CatalogOp::ReadLink => file_catalog
                .read_link(&ids)
                .await?
                .map_values(OpValue::Text),
            CatalogOp::CreateLink => {
                let keyed = require_keyed(&items, operation)?;
                file_catalog
                    .create_link(&keyed)
                    .await?
                    .map_values(OpValue::Flag)
            }
            CatalogOp::RemoveLink => file_catalog
                .remove_link(&ids)
                .await?
                .map_values(OpValue::Flag),
            CatalogOp::GetDirectoryReplicas => file_catalog
                .directory_replicas(&ids, args.all_status)
                .await?
                .map_values(OpValue::DirectoryReplicas),
        };
        Ok(batch)
    }

    /// Run a named operation on the storage endpoint `se` over PFNs.
    ///
    /// `putFile` and `putDirectory` take PFN to local path items,
    /// `replicateFile` takes destination to source PFN items.
    pub async fn execute_storage_op(
        &self,
        se: &str,
        items: impl Into<Items>,
        operation: &str,
        args: &OpArgs,
    ) -> DmsResult<BatchResult<OpValue>> {
        let items = ItemSet::normalize(items)?;
        let op: StorageOp = operation.parse()?;
        let backend = self.valid_backend(se)?;
        if !backend.supported_operations().contains(&op) {
            return Err(backend.unsupported(op));
        }
        debug!(op = %op, se, count = items.len(), "storage call");

        let pfns = items.ids();
        let lifetime = || {
            args.lifetime
                .unwrap_or_else(|| self.config().snapshot().default_pin_lifetime())
        };
        let local_paths = || -> DmsResult<BTreeMap<String, PathBuf>> {
            Ok(require_keyed(&items, operation)?
                .into_iter()
                .map(|(pfn, path)| (pfn, PathBuf::from(path)))
                .collect())
        };

        let batch = match op {
            StorageOp::Exists => backend.exists(&pfns).await?.map_values(OpValue::Flag),
            StorageOp::IsFile => backend.is_file(&pfns).await?.map_values(OpValue::Flag),
            StorageOp::GetFileSize => backend.file_size(&pfns).await?.map_values(OpValue::Size),
            StorageOp::GetFileMetadata => backend
                .file_metadata(&pfns)
                .await?
                .map_values(OpValue::Physical),
            StorageOp::GetAccessUrl => {
                let protocols = if args.protocols.is_empty() {
                    self.config().snapshot().third_party_protocols
                } else {
                    args.protocols.clone()
                };
                backend
                    .access_url(&pfns, &protocols)
                    .await?
                    .map_values(OpValue::Text)
            }
            StorageOp::GetFile => {
                let local_path = args.local_path.as_deref().ok_or_else(|| {
                    DmsError::invalid_input("getFile needs a local destination directory")
                })?;
                tokio::fs::create_dir_all(local_path).await?;
                backend
                    .get_file(&pfns, local_path)
                    .await?
                    .map_values(OpValue::Path)
            }
            StorageOp::PutFile => backend
                .put_file(&local_paths()?)
                .await?
                .map_values(OpValue::Size),
            StorageOp::PutDirectory => backend
                .put_directory(&local_paths()?)
                .await?
                .map_values(OpValue::Size),
            StorageOp::ReplicateFile => {
                let transfers = require_keyed(&items, operation)?;
                backend
                    .replicate_file(&transfers, args.expected_size)
                    .await?
                    .map_values(OpValue::Size)
            }
            StorageOp::RemoveFile => backend.remove_file(&pfns).await?.map_values(OpValue::Flag),
            StorageOp::PrestageFile => backend
                .prestage(&pfns, lifetime())
                .await?
                .map_values(OpValue::Text),
            StorageOp::PrestageFileStatus => backend
                .prestage_status(&pfns)
                .await?
                .map_values(OpValue::Flag),
            StorageOp::PinFile => backend
                .pin(&pfns, lifetime())
                .await?
                .map_values(OpValue::Text),
            StorageOp::ReleaseFile => backend.release(&pfns).await?.map_values(OpValue::Flag),
            StorageOp::RetransferOnlineFile => backend
                .retransfer_online(&pfns)
                .await?
                .map_values(OpValue::Flag),
        };
        Ok(batch)
    }

    /// Run a named storage operation on the replicas of `lfns` at `se`.
    ///
    /// LFNs without a replica at `se` fail with `NotFound`.
    pub async fn execute_replica_storage_op(
        &self,
        se: &str,
        lfns: impl Into<Items>,
        operation: &str,
        args: &OpArgs,
        catalog: Option<&str>,
    ) -> DmsResult<BatchResult<OpValue>> {
        let items = ItemSet::normalize(lfns)?;
        let ids = items.ids();
        let replicas = self
            .catalog(catalog)?
            .get_replicas(&ids, args.all_status)
            .await?;

        let mut result = BatchResult::new();
        for lfn in ids {
            if !replicas.successful.contains_key(&lfn) && !replicas.failed.contains_key(&lfn) {
                result.fail(
                    lfn,
                    ItemError::new(ErrorKind::CatalogUnavailable, "replicas not reported"),
                );
            }
        }
        for (lfn, error) in replicas.failed {
            result.fail(lfn, error);
        }
        let mut pfn_to_lfn = BTreeMap::new();
        for (lfn, at) in replicas.successful {
            match at.get(se) {
                Some(pfn) => {
                    pfn_to_lfn.insert(pfn.clone(), lfn);
                }
                None => result.fail(
                    lfn.clone(),
                    ItemError::new(
                        ErrorKind::NotFound,
                        format!("{} has no replica at {}", lfn, se),
                    ),
                ),
            }
        }
        if pfn_to_lfn.is_empty() {
            return Ok(result);
        }

        let pfns: Vec<String> = pfn_to_lfn.keys().cloned().collect();
        let batch = self.execute_storage_op(se, pfns, operation, args).await?;
        result.merge(batch.remap_items(&pfn_to_lfn));
        Ok(result)
    }

    /// Single-item form of [`ReplicaManager::execute_catalog_op`].
    pub async fn execute_single_catalog_op(
        &self,
        item: &str,
        operation: &str,
        args: &OpArgs,
        catalog: Option<&str>,
    ) -> DmsResult<OpValue> {
        self.execute_catalog_op(item, operation, args, catalog)
            .await?
            .into_single(item)
    }

    /// Single-item form of [`ReplicaManager::execute_storage_op`].
    pub async fn execute_single_storage_op(
        &self,
        se: &str,
        pfn: &str,
        operation: &str,
        args: &OpArgs,
    ) -> DmsResult<OpValue> {
        self.execute_storage_op(se, pfn, operation, args)
            .await?
            .into_single(pfn)
    }

    /// Single-item form of [`ReplicaManager::execute_replica_storage_op`].
    pub async fn execute_single_replica_storage_op(
        &self,
        se: &str,
        lfn: &str,
        operation: &str,
        args: &OpArgs,
        catalog: Option<&str>,
    ) -> DmsResult<OpValue> {
        self.execute_replica_storage_op(se, lfn, operation, args, catalog)
            .await?
            .into_single(lfn)
    }

    /// Replica locations of `lfns`, SE to PFN.
    pub async fn get_catalog_replicas(
        &self,
        lfns: impl Into<Items>,
        all_status: bool,
        catalog: Option<&str>,
    ) -> DmsResult<BatchResult<BTreeMap<String, String>>> {
        let args = OpArgs {
            all_status,
            ..OpArgs::default()
        };
        let batch = self
            .execute_catalog_op(lfns, CatalogOp::GetReplicas.as_str(), &args, catalog)
            .await?;
        Ok(typed(batch, OpValue::into_replicas))
    }

    /// Status of replicas given as LFN to SE.
    pub async fn get_catalog_replica_status(
        &self,
        replicas: BTreeMap<String, String>,
        catalog: Option<&str>,
    ) -> DmsResult<BatchResult<ReplicaStatus>> {
        let batch = self
            .execute_catalog_op(
                replicas,
                CatalogOp::GetReplicaStatus.as_str(),
                &OpArgs::default(),
                catalog,
            )
            .await?;
        Ok(typed(batch, OpValue::into_status))
    }

    /// Create catalog links given as link to target.
    pub async fn create_catalog_link(
        &self,
        links: BTreeMap<String, String>,
        catalog: Option<&str>,
    ) -> DmsResult<BatchResult<bool>> {
        let batch = self
            .execute_catalog_op(links, CatalogOp::CreateLink.as_str(), &OpArgs::default(), catalog)
            .await?;
        Ok(typed(batch, OpValue::into_flag))
    }

    /// Register files with their first replica, without permission checks or accounting.
    pub async fn add_catalog_file(
        &self,
        entries: Vec<FileEntry>,
        catalog: Option<&str>,
    ) -> DmsResult<BatchResult<bool>> {
        let (lfns, files) = by_lfn(entries, file_lfn);
        let args = OpArgs {
            files,
            ..OpArgs::default()
        };
        let batch = self
            .execute_catalog_op(lfns, CatalogOp::AddFile.as_str(), &args, catalog)
            .await?;
        Ok(typed(batch, OpValue::into_flag))
    }

    /// Register replica records.
    pub async fn add_catalog_replica(
        &self,
        entries: Vec<ReplicaEntry>,
        catalog: Option<&str>,
    ) -> DmsResult<BatchResult<bool>> {
        let (lfns, replicas) = by_lfn(entries, replica_lfn);
        let args = OpArgs {
            replicas,
            ..OpArgs::default()
        };
        let batch = self
            .execute_catalog_op(lfns, CatalogOp::AddReplica.as_str(), &args, catalog)
            .await?;
        Ok(typed(batch, OpValue::into_flag))
    }

    /// Remove replica records only; physical copies are left alone.
    pub async fn remove_catalog_replica_records(
        &self,
        entries: Vec<ReplicaEntry>,
        catalog: Option<&str>,
    ) -> DmsResult<BatchResult<bool>> {
        let (lfns, replicas) = by_lfn(entries, replica_lfn);
        let args = OpArgs {
            replicas,
            ..OpArgs::default()
        };
        let batch = self
            .execute_catalog_op(lfns, CatalogOp::RemoveReplica.as_str(), &args, catalog)
            .await?;
        Ok(typed(batch, OpValue::into_flag))
    }

    /// Change replica statuses.
    pub async fn set_catalog_replica_status(
        &self,
        entries: Vec<ReplicaStatusEntry>,
        catalog: Option<&str>,
    ) -> DmsResult<BatchResult<bool>> {
        let (lfns, statuses) = by_lfn(entries, status_lfn);
        let args = OpArgs {
            statuses,
            ..OpArgs::default()
        };
        let batch = self
            .execute_catalog_op(lfns, CatalogOp::SetReplicaStatus.as_str(), &args, catalog)
            .await?;
        Ok(typed(batch, OpValue::into_flag))
    }

    /// Change the SE a replica is registered at.
    pub async fn set_catalog_replica_host(
        &self,
        entries: Vec<ReplicaHostEntry>,
        catalog: Option<&str>,
    ) -> DmsResult<BatchResult<bool>> {
        let (lfns, hosts) = by_lfn(entries, host_lfn);
        let args = OpArgs {
            hosts,
            ..OpArgs::default()
        };
        let batch = self
            .execute_catalog_op(lfns, CatalogOp::SetReplicaHost.as_str(), &args, catalog)
            .await?;
        Ok(typed(batch, OpValue::into_flag))
    }

    /// Replicas of every file directly below each directory.
    pub async fn get_catalog_directory_replicas(
        &self,
        paths: impl Into<Items>,
        all_status: bool,
        catalog: Option<&str>,
    ) -> DmsResult<BatchResult<BTreeMap<String, BTreeMap<String, String>>>> {
        let args = OpArgs {
            all_status,
            ..OpArgs::default()
        };
        let batch = self
            .execute_catalog_op(paths, CatalogOp::GetDirectoryReplicas.as_str(), &args, catalog)
            .await?;
        Ok(typed(batch, OpValue::into_directory_replicas))
    }

    /// Upload local files to `se` under the given PFNs; keys are PFNs.
    pub async fn put_physical_file(
        &self,
        se: &str,
        files: BTreeMap<String, PathBuf>,
    ) -> DmsResult<BatchResult<u64>> {
        let mut items = BTreeMap::new();
        for (pfn, path) in files {
            let path = path.to_str().map(String::from).ok_or_else(|| {
                DmsError::invalid_input(format!("{} is not valid UTF-8", path.display()))
            })?;
            items.insert(pfn, path);
        }
        let batch = self
            .execute_storage_op(se, items, StorageOp::PutFile.as_str(), &OpArgs::default())
            .await?;
        Ok(typed(batch, OpValue::into_size))
    }

    /// Third-party copy into `se`; keys are destination PFNs, values source PFNs.
    pub async fn replicate_physical_file(
        &self,
        se: &str,
        transfers: BTreeMap<String, String>,
        expected_size: u64,
    ) -> DmsResult<BatchResult<u64>> {
        let args = OpArgs {
            expected_size,
            ..OpArgs::default()
        };
        let batch = self
            .execute_storage_op(se, transfers, StorageOp::ReplicateFile.as_str(), &args)
            .await?;
        Ok(typed(batch, OpValue::into_size))
    }

    /// Download the replicas of `lfns` held at `se` into `local_path`.
    pub async fn get_replica(
        &self,
        se: &str,
        lfns: impl Into<Items>,
        local_path: &Path,
        catalog: Option<&str>,
    ) -> DmsResult<BatchResult<PathBuf>> {
        let args = OpArgs::with_local_path(local_path);
        let batch = self
            .execute_replica_storage_op(se, lfns, StorageOp::GetFile.as_str(), &args, catalog)
            .await?;
        Ok(typed(batch, OpValue::into_path))
    }

    /// Download PFNs from `se` into `local_path`.
    pub async fn get_physical_file(
        &self,
        se: &str,
        pfns: impl Into<Items>,
        local_path: &Path,
    ) -> DmsResult<BatchResult<PathBuf>> {
        let args = OpArgs::with_local_path(local_path);
        let batch = self
            .execute_storage_op(se, pfns, StorageOp::GetFile.as_str(), &args)
            .await?;
        Ok(typed(batch, OpValue::into_path))
    }

    /// Request staging of the replicas of `lfns` at `se`.
    pub async fn prestage_replica(
        &self,
        se: &str,
        lfns: impl Into<Items>,
        lifetime: Option<Duration>,
        catalog: Option<&str>,
    ) -> DmsResult<BatchResult<String>> {
        let args = OpArgs {
            lifetime,
            ..OpArgs::default()
        };
        let batch = self
            .execute_replica_storage_op(se, lfns, StorageOp::PrestageFile.as_str(), &args, catalog)
            .await?;
        Ok(typed(batch, OpValue::into_text))
    }

    /// Pin the replicas of `lfns` at `se`.
    pub async fn pin_replica(
        &self,
        se: &str,
        lfns: impl Into<Items>,
        lifetime: Option<Duration>,
        catalog: Option<&str>,
    ) -> DmsResult<BatchResult<String>> {
        let args = OpArgs {
            lifetime,
            ..OpArgs::default()
        };
        let batch = self
            .execute_replica_storage_op(se, lfns, StorageOp::PinFile.as_str(), &args, catalog)
            .await?;
        Ok(typed(batch, OpValue::into_text))
    }

    /// Staging status by replica is not offered; query the PFN instead.
    pub async fn get_prestage_replica_status(
        &self,
        _se: &str,
        _lfns: impl Into<Items>,
        _catalog: Option<&str>,
    ) -> DmsResult<BatchResult<bool>> {
        Err(DmsError::UnsupportedOperation {
            op: "getPrestageReplicaStatus".to_string(),
            target: "replica manager".to_string(),
        })
    }

    /// Request staging of PFNs at `se`.
    pub async fn prestage_physical_file(
        &self,
        se: &str,
        pfns: impl Into<Items>,
        lifetime: Option<Duration>,
    ) -> DmsResult<BatchResult<String>> {
        let args = OpArgs {
            lifetime,
            ..OpArgs::default()
        };
        let batch = self
            .execute_storage_op(se, pfns, StorageOp::PrestageFile.as_str(), &args)
            .await?;
        Ok(typed(batch, OpValue::into_text))
    }

    /// Pin PFNs at `se`.
    pub async fn pin_physical_file(
        &self,
        se: &str,
        pfns: impl Into<Items>,
        lifetime: Option<Duration>,
    ) -> DmsResult<BatchResult<String>> {
        let args = OpArgs {
            lifetime,
            ..OpArgs::default()
        };
        let batch = self
            .execute_storage_op(se, pfns, StorageOp::PinFile.as_str(), &args)
            .await?;
        Ok(typed(batch, OpValue::into_text))
    }
}

macro_rules! catalog_wrappers {
    ($($(#[$doc:meta])* $name:ident => $op:ident, $extract:ident -> $ty:ty;)*) => {
        impl ReplicaManager {
            $(
                $(#[$doc])*
                pub async fn $name(
                    &self,
                    items: impl Into<Items>,
                    catalog: Option<&str>,
                ) -> DmsResult<BatchResult<$ty>> {
                    let batch = self
                        .execute_catalog_op(items, CatalogOp::$op.as_str(), &OpArgs::default(), catalog)
                        .await?;
                    Ok(typed(batch, OpValue::$extract))
                }
            )*
        }
    };
}

macro_rules! replica_wrappers {
    ($($(#[$doc:meta])* $name:ident => $op:ident, $extract:ident -> $ty:ty;)*) => {
        impl ReplicaManager {
            $(
                $(#[$doc])*
                pub async fn $name(
                    &self,
                    se: &str,
                    lfns: impl Into<Items>,
                    catalog: Option<&str>,
                ) -> DmsResult<BatchResult<$ty>> {
                    let batch = self
                        .execute_replica_storage_op(
                            se,
                            lfns,
                            StorageOp::$op.as_str(),
                            &OpArgs::default(),
                            catalog,
                        )
                        .await?;
                    Ok(typed(batch, OpValue::$extract))
                }
            )*
        }
    };
}

macro_rules! physical_wrappers {
    ($($(#[$doc:meta])* $name:ident => $op:ident, $extract:ident -> $ty:ty;)*) => {
        impl ReplicaManager {
            $(
                $(#[$doc])*
                pub async fn $name(
                    &self,
                    se: &str,
                    pfns: impl Into<Items>,
                ) -> DmsResult<BatchResult<$ty>> {
                    let batch = self
                        .execute_storage_op(se, pfns, StorageOp::$op.as_str(), &OpArgs::default())
                        .await?;
                    Ok(typed(batch, OpValue::$extract))
                }
            )*
        }
    };
}

catalog_wrappers! {
    /// Whether each path exists in the catalog.
    get_catalog_exists => Exists, into_flag -> bool;
    /// Whether each path is a catalog file.
    get_catalog_is_file => IsFile, into_flag -> bool;
    /// Remove catalog file records together with any replica records left.
    remove_catalog_file => RemoveFile, into_flag -> bool;
    /// Catalog file records.
    get_catalog_file_metadata => GetFileMetadata, into_file -> FileRecord;
    /// Registered file sizes.
    get_catalog_file_size => GetFileSize, into_size -> u64;
    /// Whether each path is a catalog directory.
    get_catalog_is_directory => IsDirectory, into_flag -> bool;
    /// Directory permission records.
    get_catalog_directory_metadata => GetDirectoryMetadata, into_permissions -> PathPermissions;
    /// Directory contents.
    get_catalog_list_directory => ListDirectory, into_listing -> DirectoryListing;
    /// Number and total size of the files in each directory.
    get_catalog_directory_size => GetDirectorySize, into_dir_size -> DirectorySize;
    /// Whether each path is a link.
    get_catalog_is_link => IsLink, into_flag -> bool;
    /// Link targets.
    get_catalog_read_link => ReadLink, into_text -> String;
    /// Create directories, including missing parents.
    create_catalog_directory => CreateDirectory, into_flag -> bool;
    /// Remove empty directories.
    remove_catalog_directory => RemoveDirectory, into_flag -> bool;
    /// Remove links.
    remove_catalog_link => RemoveLink, into_flag -> bool;
}

replica_wrappers! {
    /// Whether the replica at `se` is a file.
    get_replica_is_file => IsFile, into_flag -> bool;
    /// Physical size of the replica at `se`.
    get_replica_size => GetFileSize, into_size -> u64;
    /// Access URL of the replica at `se`.
    get_replica_access_url => GetAccessUrl, into_text -> String;
    /// Physical metadata of the replica at `se`.
    get_replica_metadata => GetFileMetadata, into_physical -> PhysicalMetadata;
    /// Release pins on the replica at `se`.
    release_replica => ReleaseFile, into_flag -> bool;
}

physical_wrappers! {
    /// Whether each PFN exists.
    get_physical_exists => Exists, into_flag -> bool;
    /// Whether each PFN is a file.
    get_physical_is_file => IsFile, into_flag -> bool;
    /// Physical size of each PFN.
    get_physical_size => GetFileSize, into_size -> u64;
    /// Access URL of each PFN.
    get_physical_access_url => GetAccessUrl, into_text -> String;
    /// Physical metadata of each PFN.
    get_physical_metadata => GetFileMetadata, into_physical -> PhysicalMetadata;
    /// Remove PFNs without touching the catalog.
    remove_physical_file => RemoveFile, into_flag -> bool;
    /// Whether staging of each PFN has completed.
    get_prestage_physical_file_status => PrestageFileStatus, into_flag -> bool;
    /// Release pins on PFNs.
    release_physical_file => ReleaseFile, into_flag -> bool;
    /// Ask the endpoint to transfer a fresh copy of online PFNs.
    online_retransfer => RetransferOnlineFile, into_flag -> bool;
}
