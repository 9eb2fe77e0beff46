//! Core data model: logical files, replicas and the entries used to register them.

use serde::{Deserialize, Serialize};

/// Status of one replica in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ReplicaStatus {
    /// The replica is believed good.
    #[default]
    Active,
    /// The replica was reported as damaged or missing.
    Problematic,
}

impl std::fmt::Display for ReplicaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicaStatus::Active => write!(f, "Active"),
            ReplicaStatus::Problematic => write!(f, "Problematic"),
        }
    }
}

/// One physical copy of a logical file as recorded in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaRecord {
    /// Logical file name.
    pub lfn: String,
    /// Storage endpoint holding the copy.
    pub se: String,
    /// Physical file name at that endpoint.
    pub pfn: String,
    /// Replica status.
    pub status: ReplicaStatus,
}

/// Catalog record of a logical file. Size and GUID never change once registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Logical file name.
    pub lfn: String,
    /// Size in bytes.
    pub size: u64,
    /// Unique identifier.
    pub guid: String,
    /// Checksum string (adler32, hex).
    pub checksum: String,
    /// Endpoint the file was first registered at.
    pub origin_se: String,
}

/// Input to file registration: the file record plus its first replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Logical file name.
    pub lfn: String,
    /// Physical file name of the first replica.
    pub pfn: String,
    /// Size in bytes.
    pub size: u64,
    /// Storage endpoint of the first replica.
    pub se: String,
    /// Unique identifier.
    pub guid: String,
    /// Checksum string.
    pub checksum: String,
}

/// Input to replica registration and catalog replica removal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaEntry {
    /// Logical file name.
    pub lfn: String,
    /// Physical file name.
    pub pfn: String,
    /// Storage endpoint.
    pub se: String,
}

impl ReplicaEntry {
    /// Create a replica entry.
    pub fn new(lfn: impl Into<String>, pfn: impl Into<String>, se: impl Into<String>) -> Self {
        Self {
            lfn: lfn.into(),
            pfn: pfn.into(),
            se: se.into(),
        }
    }
}

/// Input to a replica status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaStatusEntry {
    /// Logical file name.
    pub lfn: String,
    /// Physical file name, empty if unknown.
    pub pfn: String,
    /// Storage endpoint.
    pub se: String,
    /// New status.
    pub status: ReplicaStatus,
}

/// Input to moving a replica record to another storage endpoint name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaHostEntry {
    /// Logical file name.
    pub lfn: String,
    /// Physical file name, empty if unknown.
    pub pfn: String,
    /// Endpoint the replica is registered at now.
    pub se: String,
    /// Endpoint to register it at instead.
    pub new_se: String,
}

/// A replica reported to the integrity side channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblematicReplica {
    /// Logical file name.
    pub lfn: String,
    /// Physical file name, empty if unknown.
    pub pfn: String,
    /// Storage endpoint, empty if unknown.
    pub se: String,
    /// Observed problem.
    pub prognosis: String,
}

/// Metadata reported by a storage endpoint for one physical file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PhysicalMetadata {
    /// Size in bytes.
    pub size: u64,
    /// Checksum if the endpoint computes one.
    pub checksum: Option<String>,
    /// Whether the file is on disk (online).
    pub cached: bool,
    /// Whether the file has a tape copy.
    pub migrated: bool,
    /// Whether a pin is currently held.
    pub pinned: bool,
}

/// Entries directly below a catalog directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DirectoryListing {
    /// Files in the directory (full LFNs).
    pub files: Vec<String>,
    /// Sub-directories (full paths).
    pub subdirectories: Vec<String>,
    /// Links (full paths).
    pub links: Vec<String>,
}

/// Aggregate size of the files directly below a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DirectorySize {
    /// Number of files.
    pub files: u64,
    /// Sum of the registered sizes.
    pub total_size: u64,
}

/// Outcome of a single replication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationOutcome {
    /// The destination already held a replica; nothing was transferred.
    AlreadyPresent,
    /// A new copy was written and must still be registered by the caller.
    Replicated {
        /// Canonical name of the destination endpoint.
        dest_se: String,
        /// Physical name of the new copy.
        dest_pfn: String,
    },
}

/// Timings reported for one LFN by replicate-and-register, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ReplicateReport {
    /// Transfer time.
    pub replicate: f64,
    /// Registration time.
    pub register: f64,
}

/// Timings reported for one LFN by put-and-register, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct PutReport {
    /// Upload time.
    pub put: f64,
    /// Registration time.
    pub register: f64,
}

/// Parent directory of a logical path (`/` for top-level entries).
pub fn parent_path(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &trimmed[..idx],
    }
}

/// Adler-32 checksum of `data` as eight lowercase hex digits.
pub fn adler32_hex(data: &[u8]) -> String {
    format!("{:08x}", adler::adler32_slice(data))
}

/// Final component of a logical path.
pub fn base_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}
