//! In-memory storage endpoints and file catalog.
//!
//! All endpoints created from one [`MemoryGrid`] share a blob space keyed by
//! host and path, so a destination endpoint can pull a source PFN directly
//! (third-party transfer). Endpoints count their calls and accept injected
//! faults. [`MemoryCatalog`] enforces GUID stability and (LFN, SE)
//! uniqueness; its state serializes to JSON.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::batch::{BatchResult, ItemError};
use crate::catalog::{Catalog, CatalogOp};
use crate::error::{DmsError, DmsResult, ErrorKind};
use crate::identity::PathPermissions;
use crate::storage::{translate_pfn, Pfn, StorageBackend, StorageOp, StorageRegistry};
use crate::types::{
    adler32_hex, base_name, parent_path, DirectoryListing, DirectorySize, FileEntry, FileRecord,
    PhysicalMetadata, ReplicaEntry, ReplicaHostEntry, ReplicaRecord, ReplicaStatus,
    ReplicaStatusEntry,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type BlobSpace = Arc<Mutex<BTreeMap<String, Vec<u8>>>>;

/// A set of in-memory endpoints sharing one blob space.
#[derive(Default)]
pub struct MemoryGrid {
    blobs: BlobSpace,
    endpoints: Mutex<BTreeMap<String, Arc<MemoryStorage>>>,
}

impl MemoryGrid {
    /// Create an empty grid.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or return the existing) endpoint called `name`.
    pub fn add_endpoint(&self, name: &str, local: bool) -> Arc<MemoryStorage> {
        let mut endpoints = lock(&self.endpoints);
        let endpoint = endpoints
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryStorage::new(name, self.blobs.clone())));
        endpoint.set_local(local);
        endpoint.clone()
    }

    /// Endpoint by name.
    pub fn endpoint(&self, name: &str) -> Option<Arc<MemoryStorage>> {
        lock(&self.endpoints).get(name).cloned()
    }

    /// Registry holding every endpoint of the grid.
    pub fn registry(&self) -> StorageRegistry {
        lock(&self.endpoints)
            .values()
            .fold(StorageRegistry::new(), |registry, endpoint| {
                registry.with(endpoint.clone() as Arc<dyn StorageBackend>)
            })
    }

    /// Number of blobs stored across all endpoints.
    pub fn blob_count(&self) -> usize {
        lock(&self.blobs).len()
    }
}

/// Call counters of one in-memory endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStorageStats {
    /// `exists` calls.
    pub exists_calls: u64,
    /// `is_file` calls.
    pub is_file_calls: u64,
    /// `file_size` calls.
    pub size_calls: u64,
    /// `file_metadata` calls.
    pub metadata_calls: u64,
    /// `access_url` calls.
    pub access_url_calls: u64,
    /// `get_file` calls.
    pub get_calls: u64,
    /// `put_file` and `put_directory` calls.
    pub put_calls: u64,
    /// `replicate_file` calls made on this endpoint as destination.
    pub replicate_calls: u64,
    /// `remove_file` calls.
    pub remove_calls: u64,
    /// `prestage` and `prestage_status` calls.
    pub prestage_calls: u64,
    /// `pin` and `release` calls.
    pub pin_calls: u64,
    /// `retransfer_online` calls.
    pub retransfer_calls: u64,
    /// Bytes written into the endpoint.
    pub bytes_written: u64,
}

impl MemoryStorageStats {
    /// Sum of all call counters.
    pub fn total_calls(&self) -> u64 {
        self.exists_calls
            + self.is_file_calls
            + self.size_calls
            + self.metadata_calls
            + self.access_url_calls
            + self.get_calls
            + self.put_calls
            + self.replicate_calls
            + self.remove_calls
            + self.prestage_calls
            + self.pin_calls
            + self.retransfer_calls
    }
}

#[derive(Debug, Default)]
struct Faults {
    removal: Option<String>,
    transfer: Option<String>,
    get: Option<String>,
    reported_size: Option<u64>,
    disabled: BTreeSet<StorageOp>,
}

/// In-memory storage endpoint.
pub struct MemoryStorage {
    name: String,
    host: String,
    port: u16,
    root: String,
    protocols: Mutex<Vec<String>>,
    blobs: BlobSpace,
    local: AtomicBool,
    valid: AtomicBool,
    offline: AtomicBool,
    faults: Mutex<Faults>,
    stats: Mutex<MemoryStorageStats>,
    staged: Mutex<BTreeSet<String>>,
    pinned: Mutex<BTreeSet<String>>,
}

impl MemoryStorage {
    fn new(name: &str, blobs: BlobSpace) -> Self {
        Self {
            name: name.to_string(),
            host: format!("{}.grid", name.to_lowercase()),
            port: 8443,
            root: String::from("/storage"),
            protocols: Mutex::new(vec![String::from("srm")]),
            blobs,
            local: AtomicBool::new(false),
            valid: AtomicBool::new(true),
            offline: AtomicBool::new(false),
            faults: Mutex::new(Faults::default()),
            stats: Mutex::new(MemoryStorageStats::default()),
            staged: Mutex::new(BTreeSet::new()),
            pinned: Mutex::new(BTreeSet::new()),
        }
    }

    /// Host part of this endpoint's PFNs.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Mark the endpoint as local to the caller's site.
    pub fn set_local(&self, local: bool) {
        self.local.store(local, Ordering::SeqCst);
    }

    /// Make the endpoint fail instantiation.
    pub fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::SeqCst);
    }

    /// Make every bulk call fail as a whole.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Protocols served; the first one is used for new PFNs.
    pub fn set_protocols(&self, protocols: Vec<String>) {
        *lock(&self.protocols) = protocols;
    }

    /// Fail every physical removal with `reason`.
    pub fn fail_removals(&self, reason: Option<&str>) {
        lock(&self.faults).removal = reason.map(String::from);
    }

    /// Fail every transfer into this endpoint with `reason`.
    pub fn fail_transfers(&self, reason: Option<&str>) {
        lock(&self.faults).transfer = reason.map(String::from);
    }

    /// Fail every download from this endpoint with `reason`.
    pub fn fail_gets(&self, reason: Option<&str>) {
        lock(&self.faults).get = reason.map(String::from);
    }

    /// Report `size` for every file regardless of its contents.
    pub fn report_size(&self, size: Option<u64>) {
        lock(&self.faults).reported_size = size;
    }

    /// Stop advertising an operation.
    pub fn disable(&self, op: StorageOp) {
        lock(&self.faults).disabled.insert(op);
    }

    /// Snapshot of the call counters.
    pub fn stats(&self) -> MemoryStorageStats {
        lock(&self.stats).clone()
    }

    /// Store `data` at the PFN for `lfn` and return that PFN.
    pub fn seed(&self, lfn: &str, data: &[u8]) -> DmsResult<String> {
        let pfn = self.pfn_for_lfn(lfn)?;
        let key = self.own_key(&pfn).map_err(|e| DmsError::invalid_input(e.detail))?;
        lock(&self.blobs).insert(key, data.to_vec());
        Ok(pfn)
    }

    /// Contents stored at `pfn`.
    pub fn read(&self, pfn: &str) -> Option<Vec<u8>> {
        let key = self.own_key(pfn).ok()?;
        lock(&self.blobs).get(&key).cloned()
    }

    /// Whether `pfn` holds data.
    pub fn contains(&self, pfn: &str) -> bool {
        self.read(pfn).is_some()
    }

    fn own_key(&self, pfn: &str) -> Result<String, ItemError> {
        let parsed = Pfn::parse(pfn).map_err(ItemError::from)?;
        if parsed.host != self.host {
            return Err(ItemError::new(
                ErrorKind::InvalidInput,
                format!("{} does not belong to {}", pfn, self.name),
            ));
        }
        Ok(blob_key(&parsed))
    }

    fn online(&self) -> DmsResult<()> {
        if !self.is_valid() {
            return Err(DmsError::storage(&self.name, "endpoint not instantiated"));
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(DmsError::storage(&self.name, "endpoint not responding"));
        }
        Ok(())
    }

    fn enabled(&self, op: StorageOp) -> DmsResult<()> {
        if lock(&self.faults).disabled.contains(&op) {
            return Err(self.unsupported(op));
        }
        self.online()
    }

    fn count(&self, f: impl FnOnce(&mut MemoryStorageStats)) {
        f(&mut *lock(&self.stats));
    }

    fn lookup(&self, pfn: &str) -> Result<Vec<u8>, ItemError> {
        let key = self.own_key(pfn)?;
        lock(&self.blobs)
            .get(&key)
            .cloned()
            .ok_or_else(|| ItemError::new(ErrorKind::NotFound, format!("{} does not exist", pfn)))
    }

    fn per_pfn<T>(
        &self,
        pfns: &[String],
        mut f: impl FnMut(&str) -> Result<T, ItemError>,
    ) -> BatchResult<T> {
        let mut batch = BatchResult::new();
        for pfn in pfns {
            match f(pfn) {
                Ok(value) => {
                    batch.succeed(pfn.clone(), value);
                }
                Err(error) => batch.fail(pfn.clone(), error),
            }
        }
        batch
    }
}

fn blob_key(pfn: &Pfn) -> String {
    format!("{}{}", pfn.host, pfn.path)
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    fn is_local(&self) -> bool {
        self.local.load(Ordering::SeqCst)
    }

    fn remote_protocols(&self) -> Vec<String> {
        lock(&self.protocols).clone()
    }

    fn pfn_for_lfn(&self, lfn: &str) -> DmsResult<String> {
        let protocols = lock(&self.protocols);
        let protocol = protocols
            .first()
            .ok_or_else(|| DmsError::storage(&self.name, "no protocol configured"))?;
        Ok(format!(
            "{}://{}:{}{}{}",
            protocol, self.host, self.port, self.root, lfn
        ))
    }

    fn pfn_for_protocol(
        &self,
        pfn: &str,
        protocols: &[String],
        with_port: bool,
    ) -> DmsResult<String> {
        let supported = self.remote_protocols();
        translate_pfn(&self.name, pfn, protocols, &supported, with_port)
    }

    fn supported_operations(&self) -> Vec<StorageOp> {
        let faults = lock(&self.faults);
        StorageOp::ALL
            .iter()
            .copied()
            .filter(|op| !faults.disabled.contains(op))
            .collect()
    }

    async fn exists(&self, pfns: &[String]) -> DmsResult<BatchResult<bool>> {
        self.count(|s| s.exists_calls += 1);
        self.enabled(StorageOp::Exists)?;
        Ok(self.per_pfn(pfns, |pfn| {
            let key = self.own_key(pfn)?;
            Ok(lock(&self.blobs).contains_key(&key))
        }))
    }

    async fn is_file(&self, pfns: &[String]) -> DmsResult<BatchResult<bool>> {
        self.count(|s| s.is_file_calls += 1);
        self.enabled(StorageOp::IsFile)?;
        Ok(self.per_pfn(pfns, |pfn| self.lookup(pfn).map(|_| true)))
    }

    async fn file_size(&self, pfns: &[String]) -> DmsResult<BatchResult<u64>> {
        self.count(|s| s.size_calls += 1);
        self.enabled(StorageOp::GetFileSize)?;
        let reported = lock(&self.faults).reported_size;
        Ok(self.per_pfn(pfns, |pfn| {
            let data = self.lookup(pfn)?;
            Ok(reported.unwrap_or(data.len() as u64))
        }))
    }

    async fn file_metadata(&self, pfns: &[String]) -> DmsResult<BatchResult<PhysicalMetadata>> {
        self.count(|s| s.metadata_calls += 1);
        self.enabled(StorageOp::GetFileMetadata)?;
        let reported = lock(&self.faults).reported_size;
        Ok(self.per_pfn(pfns, |pfn| {
            let data = self.lookup(pfn)?;
            Ok(PhysicalMetadata {
                size: reported.unwrap_or(data.len() as u64),
                checksum: Some(adler32_hex(&data)),
                cached: true,
                migrated: false,
                pinned: lock(&self.pinned).contains(pfn),
            })
        }))
    }

    async fn access_url(
        &self,
        pfns: &[String],
        protocols: &[String],
    ) -> DmsResult<BatchResult<String>> {
        self.count(|s| s.access_url_calls += 1);
        self.enabled(StorageOp::GetAccessUrl)?;
        Ok(self.per_pfn(pfns, |pfn| {
            self.lookup(pfn)?;
            self.pfn_for_protocol(pfn, protocols, true)
                .map_err(ItemError::from)
        }))
    }

    async fn get_file(
        &self,
        pfns: &[String],
        local_dir: &Path,
    ) -> DmsResult<BatchResult<PathBuf>> {
        self.count(|s| s.get_calls += 1);
        self.enabled(StorageOp::GetFile)?;
        let get_failure = lock(&self.faults).get.clone();
        let mut batch = BatchResult::new();
        for pfn in pfns {
            if let Some(reason) = &get_failure {
                batch.fail(
                    pfn.clone(),
                    ItemError::new(ErrorKind::StorageUnavailable, reason.clone()),
                );
                continue;
            }
            let data = match self.lookup(pfn) {
                Ok(data) => data,
                Err(error) => {
                    batch.fail(pfn.clone(), error);
                    continue;
                }
            };
            let target = local_dir.join(base_name(pfn));
            match tokio::fs::write(&target, &data).await {
                Ok(()) => {
                    batch.succeed(pfn.clone(), target);
                }
                Err(e) => batch.fail_with(pfn.clone(), &DmsError::Io(e)),
            }
        }
        Ok(batch)
    }

    async fn put_file(&self, files: &BTreeMap<String, PathBuf>) -> DmsResult<BatchResult<u64>> {
        self.count(|s| s.put_calls += 1);
        self.enabled(StorageOp::PutFile)?;
        let mut batch = BatchResult::new();
        for (pfn, local) in files {
            let key = match self.own_key(pfn) {
                Ok(key) => key,
                Err(error) => {
                    batch.fail(pfn.clone(), error);
                    continue;
                }
            };
            match tokio::fs::read(local).await {
                Ok(data) => {
                    let size = data.len() as u64;
                    lock(&self.blobs).insert(key, data);
                    self.count(|s| s.bytes_written += size);
                    batch.succeed(pfn.clone(), size);
                }
                Err(e) => batch.fail_with(pfn.clone(), &DmsError::Io(e)),
            }
        }
        Ok(batch)
    }

    async fn put_directory(
        &self,
        dirs: &BTreeMap<String, PathBuf>,
    ) -> DmsResult<BatchResult<u64>> {
        self.count(|s| s.put_calls += 1);
        self.enabled(StorageOp::PutDirectory)?;
        let mut batch = BatchResult::new();
        for (pfn, local_dir) in dirs {
            let key = match self.own_key(pfn) {
                Ok(key) => key,
                Err(error) => {
                    batch.fail(pfn.clone(), error);
                    continue;
                }
            };
            match collect_tree(local_dir).await {
                Ok(files) => {
                    let mut total = 0u64;
                    let mut blobs = lock(&self.blobs);
                    for (relative, data) in files {
                        total += data.len() as u64;
                        blobs.insert(format!("{}/{}", key.trim_end_matches('/'), relative), data);
                    }
                    drop(blobs);
                    self.count(|s| s.bytes_written += total);
                    batch.succeed(pfn.clone(), total);
                }
                Err(e) => batch.fail_with(pfn.clone(), &e),
            }
        }
        Ok(batch)
    }

    async fn replicate_file(
        &self,
        transfers: &BTreeMap<String, String>,
        expected_size: u64,
    ) -> DmsResult<BatchResult<u64>> {
        self.count(|s| s.replicate_calls += 1);
        self.enabled(StorageOp::ReplicateFile)?;
        let transfer_failure = lock(&self.faults).transfer.clone();
        let mut batch = BatchResult::new();
        for (dest, source) in transfers {
            if let Some(reason) = &transfer_failure {
                batch.fail(
                    dest.clone(),
                    ItemError::new(ErrorKind::ReplicationFailed, reason.clone()),
                );
                continue;
            }
            let copied = self.own_key(dest).and_then(|dest_key| {
                let source_key = blob_key(&Pfn::parse(source).map_err(ItemError::from)?);
                let mut blobs = lock(&self.blobs);
                let data = blobs.get(&source_key).cloned().ok_or_else(|| {
                    ItemError::new(ErrorKind::NotFound, format!("{} does not exist", source))
                })?;
                let size = data.len() as u64;
                if expected_size > 0 && size != expected_size {
                    return Err(ItemError::new(
                        ErrorKind::SizeMismatch,
                        format!("{} has {} bytes, expected {}", source, size, expected_size),
                    ));
                }
                blobs.insert(dest_key, data);
                Ok(size)
            });
            match copied {
                Ok(size) => {
                    self.count(|s| s.bytes_written += size);
                    debug!(se = %self.name, dest = %dest, source = %source, "third-party copy done");
                    batch.succeed(dest.clone(), size);
                }
                Err(error) => batch.fail(dest.clone(), error),
            }
        }
        Ok(batch)
    }

    async fn remove_file(&self, pfns: &[String]) -> DmsResult<BatchResult<bool>> {
        self.count(|s| s.remove_calls += 1);
        self.enabled(StorageOp::RemoveFile)?;
        let removal_failure = lock(&self.faults).removal.clone();
        Ok(self.per_pfn(pfns, |pfn| {
            if let Some(reason) = &removal_failure {
                return Err(ItemError::new(ErrorKind::StorageUnavailable, reason.clone()));
            }
            let key = self.own_key(pfn)?;
            lock(&self.blobs).remove(&key);
            lock(&self.pinned).remove(pfn);
            Ok(true)
        }))
    }

    async fn prestage(
        &self,
        pfns: &[String],
        _lifetime: Duration,
    ) -> DmsResult<BatchResult<String>> {
        self.count(|s| s.prestage_calls += 1);
        self.enabled(StorageOp::PrestageFile)?;
        Ok(self.per_pfn(pfns, |pfn| {
            self.lookup(pfn)?;
            lock(&self.staged).insert(pfn.to_string());
            Ok(uuid::Uuid::new_v4().to_string())
        }))
    }

    async fn prestage_status(&self, pfns: &[String]) -> DmsResult<BatchResult<bool>> {
        self.count(|s| s.prestage_calls += 1);
        self.enabled(StorageOp::PrestageFileStatus)?;
        Ok(self.per_pfn(pfns, |pfn| {
            self.lookup(pfn)?;
            Ok(lock(&self.staged).contains(pfn))
        }))
    }

    async fn pin(&self, pfns: &[String], _lifetime: Duration) -> DmsResult<BatchResult<String>> {
        self.count(|s| s.pin_calls += 1);
        self.enabled(StorageOp::PinFile)?;
        Ok(self.per_pfn(pfns, |pfn| {
            self.lookup(pfn)?;
            lock(&self.pinned).insert(pfn.to_string());
            Ok(uuid::Uuid::new_v4().to_string())
        }))
    }

    async fn release(&self, pfns: &[String]) -> DmsResult<BatchResult<bool>> {
        self.count(|s| s.pin_calls += 1);
        self.enabled(StorageOp::ReleaseFile)?;
        Ok(self.per_pfn(pfns, |pfn| Ok(lock(&self.pinned).remove(pfn))))
    }

    async fn retransfer_online(&self, pfns: &[String]) -> DmsResult<BatchResult<bool>> {
        self.count(|s| s.retransfer_calls += 1);
        self.enabled(StorageOp::RetransferOnlineFile)?;
        let transfer_failure = lock(&self.faults).transfer.clone();
        Ok(self.per_pfn(pfns, |pfn| {
            if let Some(reason) = &transfer_failure {
                return Err(ItemError::new(ErrorKind::ReplicationFailed, reason.clone()));
            }
            self.lookup(pfn)?;
            lock(&self.staged).insert(pfn.to_string());
            Ok(true)
        }))
    }
}

/// Every regular file below `root` as (relative path, contents).
pub(crate) async fn collect_tree(root: &Path) -> DmsResult<Vec<(String, Vec<u8>)>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                pending.push(path);
                continue;
            }
            let relative = path
                .strip_prefix(root)
                .map_err(|e| DmsError::invalid_input(e.to_string()))?
                .to_string_lossy()
                .into_owned();
            files.push((relative, tokio::fs::read(&path).await?));
        }
    }
    files.sort();
    Ok(files)
}

/// Persistent state of a [`MemoryCatalog`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogState {
    /// File records by LFN.
    pub files: BTreeMap<String, FileRecord>,
    /// Replica records by LFN, then SE.
    pub replicas: BTreeMap<String, BTreeMap<String, ReplicaRecord>>,
    /// Directories and their permission records.
    pub directories: BTreeMap<String, PathPermissions>,
    /// Links and their targets.
    pub links: BTreeMap<String, String>,
}

impl CatalogState {
    fn with_root() -> Self {
        let mut state = Self::default();
        state
            .directories
            .insert("/".to_string(), PathPermissions::from_mode("", "", 0o777));
        state
    }

    fn permissions(&self, path: &str) -> PathPermissions {
        let mut current = path.trim_end_matches('/');
        loop {
            if current.is_empty() {
                current = "/";
            }
            if let Some(perms) = self.directories.get(current) {
                return perms.clone();
            }
            if current == "/" {
                return PathPermissions::from_mode("", "", 0o777);
            }
            current = parent_path(current);
        }
    }

    fn ensure_directory(&mut self, path: &str) {
        let mut missing = Vec::new();
        let mut current = path;
        while !self.directories.contains_key(current) && current != "/" {
            missing.push(current.to_string());
            current = parent_path(current);
        }
        for dir in missing.into_iter().rev() {
            let perms = self.permissions(parent_path(&dir));
            self.directories.insert(dir, perms);
        }
    }

    fn path_exists(&self, path: &str) -> bool {
        self.files.contains_key(path)
            || self.directories.contains_key(path)
            || self.links.contains_key(path)
    }
}

/// Call counters of a [`MemoryCatalog`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryCatalogStats {
    /// `get_replicas` calls.
    pub get_replicas_calls: u64,
    /// `exists` calls.
    pub exists_calls: u64,
    /// `add_file` calls.
    pub add_file_calls: u64,
    /// `add_replica` calls.
    pub add_replica_calls: u64,
    /// `remove_file` calls.
    pub remove_file_calls: u64,
    /// `remove_replica` calls.
    pub remove_replica_calls: u64,
    /// `set_replica_status` calls.
    pub set_status_calls: u64,
    /// `path_permissions` calls.
    pub permission_calls: u64,
}

impl MemoryCatalogStats {
    /// Calls that register files or replicas.
    pub fn registration_calls(&self) -> u64 {
        self.add_file_calls + self.add_replica_calls
    }
}

/// In-memory file catalog.
pub struct MemoryCatalog {
    name: String,
    state: Mutex<CatalogState>,
    stats: Mutex<MemoryCatalogStats>,
    offline: AtomicBool,
    replicas_hidden: AtomicBool,
    replica_rejection: Mutex<Option<String>>,
}

impl MemoryCatalog {
    /// Empty catalog with a world-writable root directory.
    pub fn new(name: &str) -> Self {
        Self::from_state(name, CatalogState::with_root())
    }

    /// Catalog over existing state.
    pub fn from_state(name: &str, state: CatalogState) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(state),
            stats: Mutex::new(MemoryCatalogStats::default()),
            offline: AtomicBool::new(false),
            replicas_hidden: AtomicBool::new(false),
            replica_rejection: Mutex::new(None),
        }
    }

    /// Load state from a JSON file; a missing file yields an empty catalog.
    pub fn load(name: &str, path: &Path) -> DmsResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let state: CatalogState = serde_json::from_str(&contents).map_err(|e| {
                    DmsError::catalog(format!("{}: {}", path.display(), e))
                })?;
                Ok(Self::from_state(name, state))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new(name)),
            Err(e) => Err(e.into()),
        }
    }

    /// Write state to a JSON file.
    pub fn save(&self, path: &Path) -> DmsResult<()> {
        let json = serde_json::to_string_pretty(&self.snapshot())
            .map_err(|e| DmsError::catalog(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> CatalogState {
        lock(&self.state).clone()
    }

    /// Snapshot of the call counters.
    pub fn stats(&self) -> MemoryCatalogStats {
        lock(&self.stats).clone()
    }

    /// Make every call fail as a whole.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Answer replica lookups with an empty batch that omits every LFN.
    pub fn hide_replicas(&self, hidden: bool) {
        self.replicas_hidden.store(hidden, Ordering::SeqCst);
    }

    /// Reject every replica registration with `reason`.
    pub fn reject_replicas(&self, reason: Option<&str>) {
        *lock(&self.replica_rejection) = reason.map(String::from);
    }

    /// Set the permission record of a directory, creating it if needed.
    pub fn set_permissions(&self, path: &str, perms: PathPermissions) {
        let mut state = lock(&self.state);
        state.ensure_directory(path);
        state.directories.insert(path.to_string(), perms);
    }

    /// Replica record of `lfn` at `se`.
    pub fn replica(&self, lfn: &str, se: &str) -> Option<ReplicaRecord> {
        lock(&self.state)
            .replicas
            .get(lfn)
            .and_then(|r| r.get(se))
            .cloned()
    }

    /// File record of `lfn`.
    pub fn file(&self, lfn: &str) -> Option<FileRecord> {
        lock(&self.state).files.get(lfn).cloned()
    }

    fn online(&self) -> DmsResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(DmsError::catalog(format!("{} not responding", self.name)));
        }
        Ok(())
    }

    fn count(&self, f: impl FnOnce(&mut MemoryCatalogStats)) {
        f(&mut *lock(&self.stats));
    }

    fn per_item<K: AsRef<str>, T>(
        &self,
        items: impl IntoIterator<Item = K>,
        mut f: impl FnMut(&mut CatalogState, &str) -> Result<T, ItemError>,
    ) -> DmsResult<BatchResult<T>> {
        self.online()?;
        let mut state = lock(&self.state);
        let mut batch = BatchResult::new();
        for item in items {
            let item = item.as_ref();
            match f(&mut state, item) {
                Ok(value) => {
                    batch.succeed(item, value);
                }
                Err(error) => batch.fail(item, error),
            }
        }
        Ok(batch)
    }
}

fn not_found(path: &str) -> ItemError {
    ItemError::new(
        ErrorKind::NotFound,
        format!("{}: no such file or directory", path),
    )
}

fn conflict(path: &str, reason: impl Into<String>) -> ItemError {
    ItemError::new(ErrorKind::Conflict, format!("{}: {}", path, reason.into()))
}

fn insert_replica(state: &mut CatalogState, entry: &ReplicaEntry) -> Result<bool, ItemError> {
    let replicas = state.replicas.entry(entry.lfn.clone()).or_default();
    if let Some(existing) = replicas.get(&entry.se) {
        if existing.pfn == entry.pfn {
            return Ok(true);
        }
        return Err(conflict(
            &entry.lfn,
            format!("replica at {} already registered as {}", entry.se, existing.pfn),
        ));
    }
    replicas.insert(
        entry.se.clone(),
        ReplicaRecord {
            lfn: entry.lfn.clone(),
            se: entry.se.clone(),
            pfn: entry.pfn.clone(),
            status: ReplicaStatus::Active,
        },
    );
    Ok(true)
}

#[async_trait]
impl Catalog for MemoryCatalog {
    fn name(&self) -> &str {
        &self.name
    }

    fn supported_operations(&self) -> Vec<CatalogOp> {
        CatalogOp::ALL.to_vec()
    }

    async fn get_replicas(
        &self,
        lfns: &[String],
        all_status: bool,
    ) -> DmsResult<BatchResult<BTreeMap<String, String>>> {
        self.count(|s| s.get_replicas_calls += 1);
        if self.replicas_hidden.load(Ordering::SeqCst) {
            self.online()?;
            return Ok(BatchResult::new());
        }
        self.per_item(lfns, |state, lfn| {
            if !state.files.contains_key(lfn) {
                return Err(not_found(lfn));
            }
            Ok(state
                .replicas
                .get(lfn)
                .map(|replicas| {
                    replicas
                        .values()
                        .filter(|r| all_status || r.status == ReplicaStatus::Active)
                        .map(|r| (r.se.clone(), r.pfn.clone()))
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    async fn get_replica_status(
        &self,
        replicas: &BTreeMap<String, String>,
    ) -> DmsResult<BatchResult<ReplicaStatus>> {
        self.per_item(replicas.keys(), |state, lfn| {
            let se = replicas.get(lfn).map(String::as_str).unwrap_or_default();
            state
                .replicas
                .get(lfn)
                .and_then(|r| r.get(se))
                .map(|r| r.status)
                .ok_or_else(|| not_found(&format!("{} at {}", lfn, se)))
        })
    }

    async fn get_file_size(&self, lfns: &[String]) -> DmsResult<BatchResult<u64>> {
        self.per_item(lfns, |state, lfn| {
            state.files.get(lfn).map(|f| f.size).ok_or_else(|| not_found(lfn))
        })
    }

    async fn get_file_metadata(&self, lfns: &[String]) -> DmsResult<BatchResult<FileRecord>> {
        self.per_item(lfns, |state, lfn| {
            state.files.get(lfn).cloned().ok_or_else(|| not_found(lfn))
        })
    }

    async fn exists(&self, lfns: &[String]) -> DmsResult<BatchResult<bool>> {
        self.count(|s| s.exists_calls += 1);
        self.per_item(lfns, |state, lfn| Ok(state.path_exists(lfn)))
    }

    async fn is_file(&self, lfns: &[String]) -> DmsResult<BatchResult<bool>> {
        self.per_item(lfns, |state, lfn| {
            if state.files.contains_key(lfn) {
                Ok(true)
            } else if state.path_exists(lfn) {
                Ok(false)
            } else {
                Err(not_found(lfn))
            }
        })
    }

    async fn add_file(&self, entries: &[FileEntry]) -> DmsResult<BatchResult<bool>> {
        self.count(|s| s.add_file_calls += 1);
        let by_lfn: BTreeMap<&str, &FileEntry> =
            entries.iter().map(|e| (e.lfn.as_str(), e)).collect();
        self.per_item(by_lfn.keys(), |state, lfn| {
            let entry = by_lfn[lfn];
            if state.directories.contains_key(lfn) || state.links.contains_key(lfn) {
                return Err(conflict(lfn, "path exists and is not a file"));
            }
            if let Some(existing) = state.files.get(lfn) {
                if existing.guid != entry.guid {
                    return Err(conflict(
                        lfn,
                        format!("already registered with GUID {}", existing.guid),
                    ));
                }
                if existing.size != entry.size {
                    return Err(conflict(
                        lfn,
                        format!("already registered with size {}", existing.size),
                    ));
                }
            } else {
                if let Some(other) = state.files.values().find(|f| f.guid == entry.guid) {
                    return Err(conflict(
                        lfn,
                        format!("GUID {} already used by {}", entry.guid, other.lfn),
                    ));
                }
                state.ensure_directory(parent_path(lfn));
                state.files.insert(
                    lfn.to_string(),
                    FileRecord {
                        lfn: lfn.to_string(),
                        size: entry.size,
                        guid: entry.guid.clone(),
                        checksum: entry.checksum.clone(),
                        origin_se: entry.se.clone(),
                    },
                );
            }
            insert_replica(
                state,
                &ReplicaEntry::new(entry.lfn.clone(), entry.pfn.clone(), entry.se.clone()),
            )
        })
    }

    async fn add_replica(&self, entries: &[ReplicaEntry]) -> DmsResult<BatchResult<bool>> {
        self.count(|s| s.add_replica_calls += 1);
        let rejection = lock(&self.replica_rejection).clone();
        self.online()?;
        let mut state = lock(&self.state);
        let mut batch = BatchResult::new();
        for entry in entries {
            if let Some(reason) = &rejection {
                batch.fail(entry.lfn.clone(), ItemError::new(ErrorKind::Conflict, reason.clone()));
                continue;
            }
            if !state.files.contains_key(&entry.lfn) {
                batch.fail(entry.lfn.clone(), not_found(&entry.lfn));
                continue;
            }
            match insert_replica(&mut state, entry) {
                Ok(value) => {
                    batch.succeed(entry.lfn.clone(), value);
                }
                Err(error) => batch.fail(entry.lfn.clone(), error),
            }
        }
        Ok(batch)
    }

    async fn remove_file(&self, lfns: &[String]) -> DmsResult<BatchResult<bool>> {
        self.count(|s| s.remove_file_calls += 1);
        self.per_item(lfns, |state, lfn| {
            state.files.remove(lfn);
            state.replicas.remove(lfn);
            Ok(true)
        })
    }

    async fn remove_replica(&self, entries: &[ReplicaEntry]) -> DmsResult<BatchResult<bool>> {
        self.count(|s| s.remove_replica_calls += 1);
        self.online()?;
        let mut state = lock(&self.state);
        let mut batch = BatchResult::new();
        for entry in entries {
            if let Some(replicas) = state.replicas.get_mut(&entry.lfn) {
                if let Some(existing) = replicas.get(&entry.se) {
                    if !entry.pfn.is_empty() && existing.pfn != entry.pfn {
                        let error = conflict(
                            &entry.lfn,
                            format!("replica at {} registered as {}", entry.se, existing.pfn),
                        );
                        batch.fail(entry.lfn.clone(), error);
                        continue;
                    }
                }
                replicas.remove(&entry.se);
                if replicas.is_empty() {
                    state.replicas.remove(&entry.lfn);
                }
            }
            batch.succeed(entry.lfn.clone(), true);
        }
        Ok(batch)
    }

    async fn set_replica_status(
        &self,
        entries: &[ReplicaStatusEntry],
    ) -> DmsResult<BatchResult<bool>> {
        self.count(|s| s.set_status_calls += 1);
        self.online()?;
        let mut state = lock(&self.state);
        let mut batch = BatchResult::new();
        for entry in entries {
            match state
                .replicas
                .get_mut(&entry.lfn)
                .and_then(|r| r.get_mut(&entry.se))
            {
                Some(record) => {
                    record.status = entry.status;
                    batch.succeed(entry.lfn.clone(), true);
                }
                None => batch.fail(
                    entry.lfn.clone(),
                    not_found(&format!("{} at {}", entry.lfn, entry.se)),
                ),
            }
        }
        Ok(batch)
    }

    async fn path_permissions(&self, path: &str) -> DmsResult<PathPermissions> {
        self.count(|s| s.permission_calls += 1);
        self.online()?;
        Ok(lock(&self.state).permissions(path))
    }

    async fn set_replica_host(
        &self,
        entries: &[ReplicaHostEntry],
    ) -> DmsResult<BatchResult<bool>> {
        self.online()?;
        let mut state = lock(&self.state);
        let mut batch = BatchResult::new();
        for entry in entries {
            let Some(replicas) = state.replicas.get_mut(&entry.lfn) else {
                batch.fail(entry.lfn.clone(), not_found(&entry.lfn));
                continue;
            };
            let moved = match replicas.get(&entry.se) {
                None => Err(not_found(&format!("{} at {}", entry.lfn, entry.se))),
                Some(existing) if !entry.pfn.is_empty() && existing.pfn != entry.pfn => {
                    Err(conflict(
                        &entry.lfn,
                        format!("replica at {} registered as {}", entry.se, existing.pfn),
                    ))
                }
                Some(_) if entry.se != entry.new_se && replicas.contains_key(&entry.new_se) => {
                    Err(conflict(
                        &entry.lfn,
                        format!("replica at {} already registered", entry.new_se),
                    ))
                }
                Some(_) => Ok(()),
            };
            if let Err(error) = moved {
                batch.fail(entry.lfn.clone(), error);
                continue;
            }
            if let Some(mut record) = replicas.remove(&entry.se) {
                record.se = entry.new_se.clone();
                replicas.insert(entry.new_se.clone(), record);
            }
            batch.succeed(entry.lfn.clone(), true);
        }
        Ok(batch)
    }

    async fn directory_replicas(
        &self,
        paths: &[String],
        all_status: bool,
    ) -> DmsResult<BatchResult<BTreeMap<String, BTreeMap<String, String>>>> {
        self.count(|s| s.get_replicas_calls += 1);
        self.per_item(paths, |state, path| {
            if !state.directories.contains_key(path) {
                return Err(not_found(path));
            }
            Ok(state
                .files
                .keys()
                .filter(|lfn| parent_path(lfn) == path)
                .map(|lfn| {
                    let at = state
                        .replicas
                        .get(lfn)
                        .map(|replicas| {
                            replicas
                                .values()
                                .filter(|r| all_status || r.status == ReplicaStatus::Active)
                                .map(|r| (r.se.clone(), r.pfn.clone()))
                                .collect()
                        })
                        .unwrap_or_default();
                    (lfn.clone(), at)
                })
                .collect())
        })
    }

    async fn is_directory(&self, paths: &[String]) -> DmsResult<BatchResult<bool>> {
        self.per_item(paths, |state, path| {
            if state.directories.contains_key(path) {
                Ok(true)
            } else if state.path_exists(path) {
                Ok(false)
            } else {
                Err(not_found(path))
            }
        })
    }

    async fn list_directory(
        &self,
        paths: &[String],
    ) -> DmsResult<BatchResult<DirectoryListing>> {
        self.per_item(paths, |state, path| {
            if !state.directories.contains_key(path) {
                return Err(not_found(path));
            }
            let below = |p: &String| p.as_str() != path && parent_path(p) == path;
            Ok(DirectoryListing {
                files: state.files.keys().filter(|p| below(*p)).cloned().collect(),
                subdirectories: state.directories.keys().filter(|p| below(*p)).cloned().collect(),
                links: state.links.keys().filter(|p| below(*p)).cloned().collect(),
            })
        })
    }

    async fn directory_metadata(
        &self,
        paths: &[String],
    ) -> DmsResult<BatchResult<PathPermissions>> {
        self.per_item(paths, |state, path| {
            state.directories.get(path).cloned().ok_or_else(|| not_found(path))
        })
    }

    async fn directory_size(&self, paths: &[String]) -> DmsResult<BatchResult<DirectorySize>> {
        self.per_item(paths, |state, path| {
            if !state.directories.contains_key(path) {
                return Err(not_found(path));
            }
            Ok(state
                .files
                .values()
                .filter(|f| parent_path(&f.lfn) == path)
                .fold(DirectorySize::default(), |acc, f| DirectorySize {
                    files: acc.files + 1,
                    total_size: acc.total_size + f.size,
                }))
        })
    }

    async fn create_directory(&self, paths: &[String]) -> DmsResult<BatchResult<bool>> {
        self.per_item(paths, |state, path| {
            if state.files.contains_key(path) || state.links.contains_key(path) {
                return Err(conflict(path, "path exists and is not a directory"));
            }
            state.ensure_directory(path);
            Ok(true)
        })
    }

    async fn remove_directory(&self, paths: &[String]) -> DmsResult<BatchResult<bool>> {
        self.per_item(paths, |state, path| {
            if path == "/" {
                return Err(conflict(path, "cannot remove the root directory"));
            }
            let occupied = state
                .files
                .keys()
                .chain(state.directories.keys())
                .chain(state.links.keys())
                .any(|p| p != path && parent_path(p) == path);
            if occupied {
                return Err(conflict(path, "directory not empty"));
            }
            state.directories.remove(path);
            Ok(true)
        })
    }

    async fn is_link(&self, paths: &[String]) -> DmsResult<BatchResult<bool>> {
        self.per_item(paths, |state, path| {
            if state.links.contains_key(path) {
                Ok(true)
            } else if state.path_exists(path) {
                Ok(false)
            } else {
                Err(not_found(path))
            }
        })
    }

    async fn read_link(&self, paths: &[String]) -> DmsResult<BatchResult<String>> {
        self.per_item(paths, |state, path| {
            state.links.get(path).cloned().ok_or_else(|| not_found(path))
        })
    }

    async fn create_link(&self, links: &BTreeMap<String, String>) -> DmsResult<BatchResult<bool>> {
        self.per_item(links.keys(), |state, path| {
            let target = links.get(path).cloned().unwrap_or_default();
            if let Some(existing) = state.links.get(path) {
                if *existing == target {
                    return Ok(true);
                }
                return Err(conflict(path, format!("link already points to {}", existing)));
            }
            if state.path_exists(path) {
                return Err(conflict(path, "path exists and is not a link"));
            }
            state.ensure_directory(parent_path(path));
            state.links.insert(path.to_string(), target);
            Ok(true)
        })
    }

    async fn remove_link(&self, paths: &[String]) -> DmsResult<BatchResult<bool>> {
        self.per_item(paths, |state, path| {
            state.links.remove(path);
            Ok(true)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(lfn: &str, guid: &str, se: &str) -> FileEntry {
        FileEntry {
            lfn: lfn.to_string(),
            pfn: format!("srm://{}.grid/storage{}", se.to_lowercase(), lfn),
            size: 100,
            se: se.to_string(),
            guid: guid.to_string(),
            checksum: "0000abcd".to_string(),
        }
    }

    #[tokio::test]
    async fn test_add_file_guid_stability() {
        let catalog = MemoryCatalog::new("FileCatalog");
        let first = catalog.add_file(&[entry("/vo/a", "G1", "CERN-DST")]).await.unwrap();
        assert!(first.is_successful("/vo/a"));

        let same = catalog.add_file(&[entry("/vo/a", "G1", "CERN-DST")]).await.unwrap();
        assert!(same.is_successful("/vo/a"));

        let other = catalog.add_file(&[entry("/vo/a", "G2", "CERN-DST")]).await.unwrap();
        assert_eq!(other.failed["/vo/a"].kind, ErrorKind::Conflict);
        assert_eq!(catalog.file("/vo/a").unwrap().guid, "G1");

        let reused = catalog.add_file(&[entry("/vo/b", "G1", "CERN-DST")]).await.unwrap();
        assert_eq!(reused.failed["/vo/b"].kind, ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_add_replica_uniqueness() {
        let catalog = MemoryCatalog::new("FileCatalog");
        catalog.add_file(&[entry("/vo/a", "G1", "CERN-DST")]).await.unwrap();

        let rep = ReplicaEntry::new("/vo/a", "srm://pic-dst.grid/storage/vo/a", "PIC-DST");
        assert!(catalog.add_replica(&[rep.clone()]).await.unwrap().all_succeeded());
        assert!(catalog.add_replica(&[rep]).await.unwrap().all_succeeded());

        let moved = ReplicaEntry::new("/vo/a", "srm://pic-dst.grid/other/vo/a", "PIC-DST");
        let batch = catalog.add_replica(&[moved]).await.unwrap();
        assert_eq!(batch.failed["/vo/a"].kind, ErrorKind::Conflict);

        let orphan = ReplicaEntry::new("/vo/none", "srm://x/y", "PIC-DST");
        let batch = catalog.add_replica(&[orphan]).await.unwrap();
        assert_eq!(batch.failed["/vo/none"].kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_remove_replica_checks_pfn() {
        let catalog = MemoryCatalog::new("FileCatalog");
        catalog.add_file(&[entry("/vo/a", "G1", "CERN-DST")]).await.unwrap();
        let registered = catalog.replica("/vo/a", "CERN-DST").unwrap().pfn;

        let stale = ReplicaEntry::new("/vo/a", "srm://cern-dst.grid/old/vo/a", "CERN-DST");
        let batch = catalog.remove_replica(&[stale]).await.unwrap();
        assert_eq!(batch.failed["/vo/a"].kind, ErrorKind::Conflict);
        assert!(catalog.replica("/vo/a", "CERN-DST").is_some());

        let exact = ReplicaEntry::new("/vo/a", registered, "CERN-DST");
        let batch = catalog.remove_replica(&[exact]).await.unwrap();
        assert!(batch.is_successful("/vo/a"));
        assert!(catalog.replica("/vo/a", "CERN-DST").is_none());
    }

    #[tokio::test]
    async fn test_set_replica_host_moves_record() {
        let catalog = MemoryCatalog::new("FileCatalog");
        catalog.add_file(&[entry("/vo/a", "G1", "CERN-DST")]).await.unwrap();
        let pfn = catalog.replica("/vo/a", "CERN-DST").unwrap().pfn;

        let moved = catalog
            .set_replica_host(&[ReplicaHostEntry {
                lfn: "/vo/a".to_string(),
                pfn: pfn.clone(),
                se: "CERN-DST".to_string(),
                new_se: "CERN-DISK".to_string(),
            }])
            .await
            .unwrap();
        assert!(moved.is_successful("/vo/a"));
        assert!(catalog.replica("/vo/a", "CERN-DST").is_none());
        let record = catalog.replica("/vo/a", "CERN-DISK").unwrap();
        assert_eq!(record.se, "CERN-DISK");
        assert_eq!(record.pfn, pfn);

        let again = catalog
            .set_replica_host(&[ReplicaHostEntry {
                lfn: "/vo/a".to_string(),
                pfn: String::new(),
                se: "CERN-DST".to_string(),
                new_se: "CERN-DISK".to_string(),
            }])
            .await
            .unwrap();
        assert_eq!(again.failed["/vo/a"].kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_directory_replicas() {
        let catalog = MemoryCatalog::new("FileCatalog");
        catalog.add_file(&[entry("/vo/data/a", "G1", "CERN-DST")]).await.unwrap();
        catalog.add_file(&[entry("/vo/data/b", "G2", "PIC-DST")]).await.unwrap();
        catalog.add_file(&[entry("/vo/data/sub/c", "G3", "PIC-DST")]).await.unwrap();
        catalog
            .set_replica_status(&[ReplicaStatusEntry {
                lfn: "/vo/data/b".to_string(),
                pfn: String::new(),
                se: "PIC-DST".to_string(),
                status: ReplicaStatus::Problematic,
            }])
            .await
            .unwrap();

        let paths = vec!["/vo/data".to_string(), "/vo/nowhere".to_string()];
        let active = catalog.directory_replicas(&paths, false).await.unwrap();
        let files = &active.successful["/vo/data"];
        assert_eq!(files.len(), 2);
        assert!(files["/vo/data/a"].contains_key("CERN-DST"));
        assert!(files["/vo/data/b"].is_empty());
        assert_eq!(active.failed["/vo/nowhere"].kind, ErrorKind::NotFound);

        let all = catalog.directory_replicas(&paths[..1], true).await.unwrap();
        assert!(all.successful["/vo/data"]["/vo/data/b"].contains_key("PIC-DST"));
    }

    #[tokio::test]
    async fn test_replica_status_filtering() {
        let catalog = MemoryCatalog::new("FileCatalog");
        catalog.add_file(&[entry("/vo/a", "G1", "CERN-DST")]).await.unwrap();
        catalog
            .set_replica_status(&[ReplicaStatusEntry {
                lfn: "/vo/a".to_string(),
                pfn: String::new(),
                se: "CERN-DST".to_string(),
                status: ReplicaStatus::Problematic,
            }])
            .await
            .unwrap();

        let lfns = vec!["/vo/a".to_string()];
        let active = catalog.get_replicas(&lfns, false).await.unwrap();
        assert!(active.successful["/vo/a"].is_empty());
        let all = catalog.get_replicas(&lfns, true).await.unwrap();
        assert_eq!(all.successful["/vo/a"].len(), 1);
    }

    #[tokio::test]
    async fn test_directories_and_links() {
        let catalog = MemoryCatalog::new("FileCatalog");
        catalog.add_file(&[entry("/vo/data/a", "G1", "CERN-DST")]).await.unwrap();
        let mut links = BTreeMap::new();
        links.insert("/vo/latest".to_string(), "/vo/data/a".to_string());
        assert!(catalog.create_link(&links).await.unwrap().all_succeeded());

        let listing = catalog
            .list_directory(&["/vo".to_string()])
            .await
            .unwrap()
            .into_single("/vo")
            .unwrap();
        assert_eq!(listing.subdirectories, vec!["/vo/data"]);
        assert_eq!(listing.links, vec!["/vo/latest"]);

        let size = catalog
            .directory_size(&["/vo/data".to_string()])
            .await
            .unwrap()
            .into_single("/vo/data")
            .unwrap();
        assert_eq!(size, DirectorySize { files: 1, total_size: 100 });

        let busy = catalog.remove_directory(&["/vo/data".to_string()]).await.unwrap();
        assert_eq!(busy.failed["/vo/data"].kind, ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_permissions_inherit_from_nearest_directory() {
        let catalog = MemoryCatalog::new("FileCatalog");
        catalog.set_permissions("/vo", PathPermissions::from_mode("/CN=alice", "vo_user", 0o750));
        let perms = catalog.path_permissions("/vo/new/deeper").await.unwrap();
        assert_eq!(perms.owner_dn, "/CN=alice");
        assert_eq!(perms.world, 0);
    }

    #[tokio::test]
    async fn test_offline_catalog_fails_whole_call() {
        let catalog = MemoryCatalog::new("FileCatalog");
        catalog.set_offline(true);
        let err = catalog.exists(&["/vo/a".to_string()]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CatalogUnavailable);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        let missing = MemoryCatalog::load("FileCatalog", &path).unwrap();
        assert!(missing.snapshot().files.is_empty());

        let catalog = MemoryCatalog::new("FileCatalog");
        catalog.set_permissions("/vo", PathPermissions::from_mode("/CN=alice", "vo", 0o755));
        catalog.save(&path).unwrap();
        let loaded = MemoryCatalog::load("FileCatalog", &path).unwrap();
        assert_eq!(loaded.snapshot(), catalog.snapshot());
    }

    #[tokio::test]
    async fn test_memory_storage_replicate_and_faults() {
        let grid = MemoryGrid::new();
        let cern = grid.add_endpoint("CERN-DST", true);
        let pic = grid.add_endpoint("PIC-DST", false);
        let src = cern.seed("/vo/a", b"0123456789").unwrap();
        let dest = pic.pfn_for_lfn("/vo/a").unwrap();

        let mut transfers = BTreeMap::new();
        transfers.insert(dest.clone(), src.clone());
        let bad = pic.replicate_file(&transfers, 11).await.unwrap();
        assert_eq!(bad.failed[&dest].kind, ErrorKind::SizeMismatch);
        let good = pic.replicate_file(&transfers, 10).await.unwrap();
        assert_eq!(good.successful[&dest], 10);
        assert!(pic.contains(&dest));

        cern.report_size(Some(3));
        let sizes = cern.file_size(&[src.clone()]).await.unwrap();
        assert_eq!(sizes.successful[&src], 3);

        cern.fail_removals(Some("permission denied on pool"));
        let removed = cern.remove_file(&[src.clone()]).await.unwrap();
        assert!(removed.failed[&src].detail.contains("pool"));
        assert!(cern.contains(&src));

        assert_eq!(grid.registry().len(), 2);
        assert_eq!(cern.stats().remove_calls, 1);
    }

    #[tokio::test]
    async fn test_memory_storage_rejects_foreign_pfn() {
        let grid = MemoryGrid::new();
        let cern = grid.add_endpoint("CERN-DST", false);
        let pic = grid.add_endpoint("PIC-DST", false);
        let pfn = pic.seed("/vo/a", b"x").unwrap();
        let batch = cern.exists(&[pfn.clone()]).await.unwrap();
        assert_eq!(batch.failed[&pfn].kind, ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_disabled_operation_is_not_advertised() {
        let grid = MemoryGrid::new();
        let cern = grid.add_endpoint("CERN-DST", false);
        cern.disable(StorageOp::PinFile);
        assert!(!cern.supported_operations().contains(&StorageOp::PinFile));
        let err = cern
            .pin(&["srm://cern-dst.grid:8443/storage/a".to_string()], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
    }
}
