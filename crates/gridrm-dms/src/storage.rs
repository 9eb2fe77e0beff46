//! Storage endpoint capability and the name-to-endpoint resolver.
//!
//! A storage endpoint (SE) exposes bulk operations over physical file names.
//! Each bulk call either fails as a whole (the endpoint could not be reached)
//! or returns a [`BatchResult`] keyed by PFN. Optional operations default to
//! [`DmsError::UnsupportedOperation`]; the operations an endpoint actually
//! implements are advertised by [`StorageBackend::supported_operations`] and
//! checked by the dispatcher before a call is made.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::batch::BatchResult;
use crate::error::{DmsError, DmsResult};
use crate::types::PhysicalMetadata;

/// Named operations a storage endpoint may implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StorageOp {
    /// `exists`
    Exists,
    /// `isFile`
    IsFile,
    /// `getFileSize`
    GetFileSize,
    /// `getFileMetadata`
    GetFileMetadata,
    /// `getAccessUrl`
    GetAccessUrl,
    /// `getFile`
    GetFile,
    /// `putFile`
    PutFile,
    /// `putDirectory`
    PutDirectory,
    /// `replicateFile`
    ReplicateFile,
    /// `removeFile`
    RemoveFile,
    /// `prestageFile`
    PrestageFile,
    /// `prestageFileStatus`
    PrestageFileStatus,
    /// `pinFile`
    PinFile,
    /// `releaseFile`
    ReleaseFile,
    /// `retransferOnlineFile`
    RetransferOnlineFile,
}

impl StorageOp {
    /// Every known operation.
    pub const ALL: [StorageOp; 15] = [
        StorageOp::Exists,
        StorageOp::IsFile,
        StorageOp::GetFileSize,
        StorageOp::GetFileMetadata,
        StorageOp::GetAccessUrl,
        StorageOp::GetFile,
        StorageOp::PutFile,
        StorageOp::PutDirectory,
        StorageOp::ReplicateFile,
        StorageOp::RemoveFile,
        StorageOp::PrestageFile,
        StorageOp::PrestageFileStatus,
        StorageOp::PinFile,
        StorageOp::ReleaseFile,
        StorageOp::RetransferOnlineFile,
    ];

    /// Operations every backend must implement.
    pub const REQUIRED: [StorageOp; 8] = [
        StorageOp::Exists,
        StorageOp::IsFile,
        StorageOp::GetFileSize,
        StorageOp::GetFileMetadata,
        StorageOp::GetFile,
        StorageOp::PutFile,
        StorageOp::ReplicateFile,
        StorageOp::RemoveFile,
    ];

    /// Wire name of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageOp::Exists => "exists",
            StorageOp::IsFile => "isFile",
            StorageOp::GetFileSize => "getFileSize",
            StorageOp::GetFileMetadata => "getFileMetadata",
            StorageOp::GetAccessUrl => "getAccessUrl",
            StorageOp::GetFile => "getFile",
            StorageOp::PutFile => "putFile",
            StorageOp::PutDirectory => "putDirectory",
            StorageOp::ReplicateFile => "replicateFile",
            StorageOp::RemoveFile => "removeFile",
            StorageOp::PrestageFile => "prestageFile",
            StorageOp::PrestageFileStatus => "prestageFileStatus",
            StorageOp::PinFile => "pinFile",
            StorageOp::ReleaseFile => "releaseFile",
            StorageOp::RetransferOnlineFile => "retransferOnlineFile",
        }
    }
}

impl fmt::Display for StorageOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageOp {
    type Err = DmsError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        StorageOp::ALL
            .iter()
            .copied()
            .find(|op| op.as_str() == name)
            .ok_or_else(|| DmsError::UnsupportedOperation {
                op: name.to_string(),
                target: "storage endpoint".to_string(),
            })
    }
}

/// Parsed physical file name: `protocol://host[:port]/path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pfn {
    /// Access protocol.
    pub protocol: String,
    /// Host, empty for `file:///...`.
    pub host: String,
    /// Port, if present.
    pub port: Option<u16>,
    /// Absolute path on the endpoint.
    pub path: String,
}

impl Pfn {
    /// Parse a PFN string.
    pub fn parse(pfn: &str) -> DmsResult<Self> {
        let (protocol, rest) = pfn
            .split_once("://")
            .ok_or_else(|| DmsError::invalid_input(format!("malformed PFN {}", pfn)))?;
        if protocol.is_empty() {
            return Err(DmsError::invalid_input(format!("PFN without protocol {}", pfn)));
        }
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| DmsError::invalid_input(format!("bad port in PFN {}", pfn)))?;
                (host, Some(port))
            }
            None => (authority, None),
        };
        Ok(Self {
            protocol: protocol.to_string(),
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }

    /// Render with or without the port.
    pub fn render(&self, with_port: bool) -> String {
        match (with_port, self.port) {
            (true, Some(port)) => format!("{}://{}:{}{}", self.protocol, self.host, port, self.path),
            _ => format!("{}://{}{}", self.protocol, self.host, self.path),
        }
    }

    /// Same location under another protocol.
    pub fn with_protocol(&self, protocol: &str) -> Self {
        Self {
            protocol: protocol.to_string(),
            ..self.clone()
        }
    }
}

impl fmt::Display for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(true))
    }
}

/// Rewrite `pfn` under the first of `wanted` that `supported` contains.
///
/// A PFN already in an acceptable protocol is returned unchanged apart from
/// the port, which is dropped when `with_port` is false.
pub fn translate_pfn(
    se: &str,
    pfn: &str,
    wanted: &[String],
    supported: &[String],
    with_port: bool,
) -> DmsResult<String> {
    let parsed = Pfn::parse(pfn)?;
    if wanted.iter().any(|p| *p == parsed.protocol) && supported.contains(&parsed.protocol) {
        return Ok(parsed.render(with_port));
    }
    wanted
        .iter()
        .find(|p| supported.contains(p))
        .map(|p| parsed.with_protocol(p).render(with_port))
        .ok_or_else(|| {
            DmsError::storage(
                se,
                format!("none of the protocols {:?} is available for {}", wanted, pfn),
            )
        })
}

/// Capability interface of one storage endpoint.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Configured name of the endpoint.
    fn name(&self) -> &str;

    /// Whether the endpoint could be instantiated and is usable.
    fn is_valid(&self) -> bool;

    /// Name under which replicas at this endpoint are registered.
    fn canonical_name(&self) -> String {
        self.name().to_string()
    }

    /// Whether the endpoint is at the caller's site.
    fn is_local(&self) -> bool;

    /// Protocols this endpoint can serve to a peer endpoint.
    fn remote_protocols(&self) -> Vec<String>;

    /// PFN a logical path maps to under the endpoint's naming convention.
    fn pfn_for_lfn(&self, lfn: &str) -> DmsResult<String>;

    /// Rewrite a PFN for one of the given protocols.
    fn pfn_for_protocol(&self, pfn: &str, protocols: &[String], with_port: bool)
        -> DmsResult<String>;

    /// Operations the endpoint implements.
    fn supported_operations(&self) -> Vec<StorageOp> {
        StorageOp::REQUIRED.to_vec()
    }

    /// Existence check.
    async fn exists(&self, pfns: &[String]) -> DmsResult<BatchResult<bool>>;

    /// Whether each PFN is a regular file.
    async fn is_file(&self, pfns: &[String]) -> DmsResult<BatchResult<bool>>;

    /// Physical size in bytes.
    async fn file_size(&self, pfns: &[String]) -> DmsResult<BatchResult<u64>>;

    /// Physical metadata.
    async fn file_metadata(&self, pfns: &[String]) -> DmsResult<BatchResult<PhysicalMetadata>>;

    /// Download into `local_dir`; the value is the local file path.
    async fn get_file(&self, pfns: &[String], local_dir: &Path)
        -> DmsResult<BatchResult<PathBuf>>;

    /// Upload local files; keys are destination PFNs, the value is bytes written.
    async fn put_file(&self, files: &BTreeMap<String, PathBuf>) -> DmsResult<BatchResult<u64>>;

    /// Third-party copy into this endpoint; keys are destination PFNs, values source PFNs.
    async fn replicate_file(
        &self,
        transfers: &BTreeMap<String, String>,
        expected_size: u64,
    ) -> DmsResult<BatchResult<u64>>;

    /// Physical removal. Removing a PFN that is already gone succeeds.
    async fn remove_file(&self, pfns: &[String]) -> DmsResult<BatchResult<bool>>;

    /// Access URL under one of `protocols`.
    async fn access_url(
        &self,
        _pfns: &[String],
        _protocols: &[String],
    ) -> DmsResult<BatchResult<String>> {
        Err(self.unsupported(StorageOp::GetAccessUrl))
    }

    /// Upload local directories; keys are destination PFNs, the value is bytes written.
    async fn put_directory(
        &self,
        _dirs: &BTreeMap<String, PathBuf>,
    ) -> DmsResult<BatchResult<u64>> {
        Err(self.unsupported(StorageOp::PutDirectory))
    }

    /// Request staging to disk; the value is a request identifier.
    async fn prestage(
        &self,
        _pfns: &[String],
        _lifetime: Duration,
    ) -> DmsResult<BatchResult<String>> {
        Err(self.unsupported(StorageOp::PrestageFile))
    }

    /// Whether a staging request has completed.
    async fn prestage_status(&self, _pfns: &[String]) -> DmsResult<BatchResult<bool>> {
        Err(self.unsupported(StorageOp::PrestageFileStatus))
    }

    /// Pin on disk for `lifetime`; the value is a pin identifier.
    async fn pin(&self, _pfns: &[String], _lifetime: Duration) -> DmsResult<BatchResult<String>> {
        Err(self.unsupported(StorageOp::PinFile))
    }

    /// Release a pin.
    async fn release(&self, _pfns: &[String]) -> DmsResult<BatchResult<bool>> {
        Err(self.unsupported(StorageOp::ReleaseFile))
    }

    /// Ask the endpoint to transfer a fresh copy of files it already holds online.
    async fn retransfer_online(&self, _pfns: &[String]) -> DmsResult<BatchResult<bool>> {
        Err(self.unsupported(StorageOp::RetransferOnlineFile))
    }

    /// Error returned for an operation the endpoint does not implement.
    fn unsupported(&self, op: StorageOp) -> DmsError {
        DmsError::UnsupportedOperation {
            op: op.to_string(),
            target: self.name().to_string(),
        }
    }
}

/// Resolves storage endpoint names to backends.
pub trait StorageResolver: Send + Sync {
    /// Backend for `se`; unknown names are [`DmsError::StorageUnavailable`].
    fn resolve(&self, se: &str) -> DmsResult<Arc<dyn StorageBackend>>;

    /// Every known endpoint name.
    fn names(&self) -> Vec<String>;
}

/// Fixed set of named backends.
#[derive(Default, Clone)]
pub struct StorageRegistry {
    backends: BTreeMap<String, Arc<dyn StorageBackend>>,
}

impl StorageRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend under its own name, replacing any earlier one.
    pub fn register(&mut self, backend: Arc<dyn StorageBackend>) {
        self.backends.insert(backend.name().to_string(), backend);
    }

    /// Builder form of [`StorageRegistry::register`].
    pub fn with(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.register(backend);
        self
    }

    /// Number of registered backends.
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Returns true if no backend is registered.
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

impl fmt::Debug for StorageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageRegistry")
            .field("backends", &self.backends.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl StorageResolver for StorageRegistry {
    fn resolve(&self, se: &str) -> DmsResult<Arc<dyn StorageBackend>> {
        self.backends
            .get(se)
            .cloned()
            .ok_or_else(|| DmsError::storage(se, "unknown storage endpoint"))
    }

    fn names(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_names_round_trip() {
        for op in StorageOp::ALL {
            assert_eq!(op.as_str().parse::<StorageOp>().unwrap(), op);
        }
        let err = "formatDisk".parse::<StorageOp>().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::UnsupportedOperation);
    }

    #[test]
    fn test_pfn_parse() {
        let pfn = Pfn::parse("srm://srm.cern.ch:8443/castor/grid/a.dst").unwrap();
        assert_eq!(pfn.protocol, "srm");
        assert_eq!(pfn.host, "srm.cern.ch");
        assert_eq!(pfn.port, Some(8443));
        assert_eq!(pfn.path, "/castor/grid/a.dst");
        assert_eq!(pfn.render(false), "srm://srm.cern.ch/castor/grid/a.dst");

        let local = Pfn::parse("file:///data/se/grid/a").unwrap();
        assert_eq!(local.host, "");
        assert_eq!(local.path, "/data/se/grid/a");

        assert!(Pfn::parse("/no/scheme").is_err());
        assert!(Pfn::parse("srm://host:notaport/x").is_err());
    }

    #[test]
    fn test_translate_pfn() {
        let supported = vec!["srm".to_string(), "gsiftp".to_string()];
        let pfn = "srm://se.example.org:8443/grid/a";

        let same = translate_pfn("SE", pfn, &["srm".to_string()], &supported, false).unwrap();
        assert_eq!(same, "srm://se.example.org/grid/a");

        let other = translate_pfn("SE", pfn, &["gsiftp".to_string()], &supported, true).unwrap();
        assert_eq!(other, "gsiftp://se.example.org:8443/grid/a");

        let err = translate_pfn("SE", pfn, &["root".to_string()], &supported, true).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::StorageUnavailable);
    }

    #[test]
    fn test_registry_unknown_endpoint() {
        let registry = StorageRegistry::new();
        assert!(registry.is_empty());
        let err = registry.resolve("NOWHERE").err().unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::StorageUnavailable);
    }
}
