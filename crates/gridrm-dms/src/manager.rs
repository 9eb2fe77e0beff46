//! The replica manager: shared handles and the helpers every workflow uses.
//!
//! The workflows themselves live in sibling modules, each adding an
//! `impl ReplicaManager` block: selection, replication, registration,
//! removal, transfers and generic dispatch.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::accounting::{AccountingRecord, AccountingSink, NullAccountingSink};
use crate::catalog::{Catalog, CatalogSet};
use crate::config::ConfigSource;
use crate::error::{DmsError, DmsResult};
use crate::identity::{write_allowed, AnonymousCredentials, CredentialProvider};
use crate::integrity::{IntegrityReporter, NullIntegrityReporter};
use crate::storage::{StorageBackend, StorageResolver};
use crate::types::parent_path;

/// Orchestrates catalog and storage endpoints into consistent bulk workflows.
///
/// Cloning is cheap; every collaborator is shared. The manager keeps no
/// catalog state between calls.
#[derive(Clone)]
pub struct ReplicaManager {
    catalogs: Arc<CatalogSet>,
    storage: Arc<dyn StorageResolver>,
    config: Arc<dyn ConfigSource>,
    credentials: Arc<dyn CredentialProvider>,
    accounting: Arc<dyn AccountingSink>,
    integrity: Arc<dyn IntegrityReporter>,
}

impl ReplicaManager {
    /// Anonymous manager with accounting and integrity reporting disabled.
    pub fn new(
        catalogs: CatalogSet,
        storage: Arc<dyn StorageResolver>,
        config: Arc<dyn ConfigSource>,
    ) -> Self {
        Self {
            catalogs: Arc::new(catalogs),
            storage,
            config,
            credentials: Arc::new(AnonymousCredentials),
            accounting: Arc::new(NullAccountingSink),
            integrity: Arc::new(NullIntegrityReporter),
        }
    }

    /// Use `credentials` to identify the caller.
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Send accounting records to `accounting`.
    pub fn with_accounting(mut self, accounting: Arc<dyn AccountingSink>) -> Self {
        self.accounting = accounting;
        self
    }

    /// Send problematic replica reports to `integrity`.
    pub fn with_integrity(mut self, integrity: Arc<dyn IntegrityReporter>) -> Self {
        self.integrity = integrity;
        self
    }

    /// The configuration source.
    pub fn config(&self) -> &dyn ConfigSource {
        self.config.as_ref()
    }

    /// The catalog set.
    pub fn catalogs(&self) -> &CatalogSet {
        &self.catalogs
    }

    pub(crate) fn integrity(&self) -> &dyn IntegrityReporter {
        self.integrity.as_ref()
    }

    pub(crate) fn catalog(&self, selector: Option<&str>) -> DmsResult<Arc<dyn Catalog>> {
        self.catalogs.select(selector)
    }

    pub(crate) fn backend(&self, se: &str) -> DmsResult<Arc<dyn StorageBackend>> {
        self.storage.resolve(se)
    }

    /// Resolve `se` and require it to be instantiable.
    pub(crate) fn valid_backend(&self, se: &str) -> DmsResult<Arc<dyn StorageBackend>> {
        let backend = self.backend(se)?;
        if !backend.is_valid() {
            return Err(DmsError::storage(se, "failed to instantiate storage endpoint"));
        }
        Ok(backend)
    }

    /// Whether the caller may write to `path`.
    ///
    /// Without a credential the answer is yes. Catalog failures are errors,
    /// never a silent denial.
    pub async fn check_write_permission(
        &self,
        path: &str,
        catalog: Option<&str>,
    ) -> DmsResult<bool> {
        let identity = match self.credentials.current()? {
            Some(identity) => identity,
            None => {
                debug!(path, "no credential present, write permitted");
                return Ok(true);
            }
        };
        let perms = self.catalog(catalog)?.path_permissions(path).await?;
        let allowed = write_allowed(&identity, &perms);
        debug!(path, dn = %identity.dn, allowed, "write permission evaluated");
        Ok(allowed)
    }

    /// Require write access to the directory holding `lfn`.
    pub(crate) async fn require_write_permission(
        &self,
        lfn: &str,
        catalog: Option<&str>,
    ) -> DmsResult<()> {
        let dir = parent_path(lfn);
        if self.check_write_permission(dir, catalog).await? {
            Ok(())
        } else {
            warn!(lfn, dir, "write access not permitted for this credential");
            Err(DmsError::PermissionDenied {
                path: dir.to_string(),
            })
        }
    }

    /// Start an accounting record stamped with the caller and site.
    pub(crate) fn accounting_record(
        &self,
        operation: &str,
        destination: &str,
        items: u64,
    ) -> AccountingRecord {
        let config = self.config.snapshot();
        let mut record = AccountingRecord::new(operation, destination);
        record.protocol = config.accounting_protocol;
        record.source_site = config.local_site;
        record.transfer_total = items;
        if let Ok(Some(identity)) = self.credentials.current() {
            record.user = identity.user;
        }
        record
    }

    /// Hand a finished record to the sink. Sink errors are logged and dropped.
    pub(crate) fn account(&self, record: AccountingRecord) {
        let operation = record.operation_type.clone();
        let result = self
            .accounting
            .add_record(record.finish())
            .and_then(|_| self.accounting.commit());
        if let Err(e) = result {
            warn!(operation = %operation, error = %e, "failed to send accounting record");
        }
    }
}

impl std::fmt::Debug for ReplicaManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaManager")
            .field("catalogs", &self.catalogs)
            .field("storage", &self.storage.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounting::MemoryAccountingSink;
    use crate::config::LiveConfig;
    use crate::error::ErrorKind;
    use crate::identity::{CallerIdentity, PathPermissions, StaticCredentials};
    use crate::memory::{MemoryCatalog, MemoryGrid};

    fn manager(catalog: Arc<MemoryCatalog>) -> ReplicaManager {
        let grid = MemoryGrid::new();
        ReplicaManager::new(
            CatalogSet::single(catalog),
            Arc::new(grid.registry()),
            Arc::new(LiveConfig::default()),
        )
    }

    #[tokio::test]
    async fn test_anonymous_caller_may_write() {
        let catalog = Arc::new(MemoryCatalog::new("FileCatalog"));
        catalog.set_permissions("/vo", PathPermissions::from_mode("/CN=alice", "vo", 0o500));
        let rm = manager(catalog.clone());
        assert!(rm.check_write_permission("/vo", None).await.unwrap());
        assert_eq!(catalog.stats().permission_calls, 0);
    }

    #[tokio::test]
    async fn test_permission_checks_parent_directory() {
        let catalog = Arc::new(MemoryCatalog::new("FileCatalog"));
        catalog.set_permissions("/vo/ro", PathPermissions::from_mode("/CN=alice", "vo", 0o555));
        catalog.set_permissions("/vo/rw", PathPermissions::from_mode("/CN=alice", "vo", 0o775));
        let rm = manager(catalog).with_credentials(Arc::new(StaticCredentials::new(
            CallerIdentity::new("bob", "/CN=bob", "/vo/Role=vo"),
        )));

        let err = rm
            .require_write_permission("/vo/ro/file", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        rm.require_write_permission("/vo/rw/file", None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_catalog_failure_is_not_denial() {
        let catalog = Arc::new(MemoryCatalog::new("FileCatalog"));
        catalog.set_offline(true);
        let rm = manager(catalog).with_credentials(Arc::new(StaticCredentials::new(
            CallerIdentity::new("bob", "/CN=bob", "vo"),
        )));
        let err = rm.check_write_permission("/vo", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CatalogUnavailable);
    }

    #[test]
    fn test_accounting_errors_are_swallowed() {
        let sink = Arc::new(MemoryAccountingSink::new());
        sink.set_failing(true);
        let rm = manager(Arc::new(MemoryCatalog::new("FileCatalog")))
            .with_accounting(sink.clone());
        rm.account(rm.accounting_record("removePhysicalReplica", "CERN-DST", 1));
        assert!(sink.records().is_empty());

        sink.set_failing(false);
        let mut record = rm.accounting_record("removePhysicalReplica", "CERN-DST", 1);
        record.transfer_ok = 1;
        rm.account(record);
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].source_site, "Unknown");
        assert_eq!(records[0].protocol, "ReplicaManager");
    }
}
