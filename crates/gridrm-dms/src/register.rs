//! Catalog registration of files and replicas, and problematic replica reporting.
//!
//! Entries are grouped by storage endpoint. Each group's endpoint is
//! instantiated once; its canonical name replaces the caller's SE name and
//! the PFN is rewritten under the registration protocol without a port.
//! Entries rejected before submission are merged with the catalog's own
//! per-item outcome.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::batch::BatchResult;
use crate::error::{DmsError, DmsResult};
use crate::integrity::report_with_deadline;
use crate::manager::ReplicaManager;
use crate::types::{FileEntry, ProblematicReplica, ReplicaEntry, ReplicaStatus, ReplicaStatusEntry};

fn group_by_se<T, F>(entries: Vec<T>, se_of: F) -> BTreeMap<String, Vec<T>>
where
    F: Fn(&T) -> &str,
{
    let mut groups: BTreeMap<String, Vec<T>> = BTreeMap::new();
    for entry in entries {
        groups.entry(se_of(&entry).to_string()).or_default().push(entry);
    }
    groups
}

impl ReplicaManager {
    /// Register new files, each with its first replica.
    pub async fn register_file(
        &self,
        entries: impl IntoIterator<Item = FileEntry>,
        catalog: Option<&str>,
    ) -> DmsResult<BatchResult<bool>> {
        let entries: Vec<FileEntry> = entries.into_iter().collect();
        if entries.is_empty() {
            return Err(DmsError::invalid_input("no files to register"));
        }
        if let Some(blank) = entries.iter().find(|e| e.lfn.trim().is_empty()) {
            return Err(DmsError::invalid_input(format!(
                "file entry with blank LFN (pfn {})",
                blank.pfn
            )));
        }
        let catalog = self.catalog(catalog)?;
        let protocol = vec![self.config().snapshot().registration_protocol];

        let mut result = BatchResult::new();
        let mut submit = Vec::with_capacity(entries.len());
        for (se, group) in group_by_se(entries, |e| e.se.as_str()) {
            let backend = match self.valid_backend(&se) {
                Ok(backend) => backend,
                Err(e) => {
                    warn!(se = %se, error = %e, "cannot register files at unusable endpoint");
                    for entry in group {
                        result.fail_with(entry.lfn, &e);
                    }
                    continue;
                }
            };
            let canonical = backend.canonical_name();
            for mut entry in group {
                match backend.pfn_for_protocol(&entry.pfn, &protocol, false) {
                    Ok(pfn) => entry.pfn = pfn,
                    Err(e) => {
                        debug!(lfn = %entry.lfn, error = %e, "keeping PFN as given");
                    }
                }
                entry.se = canonical.clone();
                submit.push(entry);
            }
        }

        if !submit.is_empty() {
            let registered = catalog.add_file(&submit).await?;
            info!(
                catalog = catalog.name(),
                registered = registered.successful.len(),
                failed = registered.failed.len(),
                "files registered"
            );
            result.merge(registered);
        }
        Ok(result)
    }

    /// Register additional replicas of existing files.
    ///
    /// Registering an identical (LFN, SE, PFN) again succeeds without change.
    pub async fn register_replica(
        &self,
        entries: impl IntoIterator<Item = ReplicaEntry>,
        catalog: Option<&str>,
    ) -> DmsResult<BatchResult<bool>> {
        let entries: Vec<ReplicaEntry> = entries.into_iter().collect();
        if entries.is_empty() {
            return Err(DmsError::invalid_input("no replicas to register"));
        }
        let catalog = self.catalog(catalog)?;
        let protocol = vec![self.config().snapshot().registration_protocol];

        let mut result = BatchResult::new();
        let mut submit = Vec::with_capacity(entries.len());
        for (se, group) in group_by_se(entries, |e| e.se.as_str()) {
            let backend = match self.valid_backend(&se) {
                Ok(backend) => backend,
                Err(e) => {
                    warn!(se = %se, error = %e, "cannot register replicas at unusable endpoint");
                    for entry in group {
                        result.fail_with(entry.lfn, &e);
                    }
                    continue;
                }
            };
            let canonical = backend.canonical_name();
            for entry in group {
                match backend.pfn_for_protocol(&entry.pfn, &protocol, false) {
                    Ok(pfn) => submit.push(ReplicaEntry::new(entry.lfn, pfn, canonical.clone())),
                    Err(e) => result.fail_with(entry.lfn, &e),
                }
            }
        }

        if !submit.is_empty() {
            let registered = catalog.add_replica(&submit).await?;
            debug!(
                catalog = catalog.name(),
                registered = registered.successful.len(),
                failed = registered.failed.len(),
                "replicas registered"
            );
            result.merge(registered);
        }
        Ok(result)
    }

    /// Report replicas to the integrity channel and mark them problematic.
    ///
    /// Each report runs under the configured RPC timeout. A replica whose
    /// report fails is not marked. Entries without an SE are only reported.
    pub async fn set_replica_problematic(
        &self,
        entries: Vec<ProblematicReplica>,
        source_component: &str,
        catalog: Option<&str>,
    ) -> DmsResult<BatchResult<bool>> {
        if entries.is_empty() {
            return Err(DmsError::invalid_input("no replicas to report"));
        }
        let catalog = self.catalog(catalog)?;
        let deadline = self.config().snapshot().rpc_timeout();

        let mut result = BatchResult::new();
        let mut mark = Vec::new();
        for replica in &entries {
            match report_with_deadline(self.integrity(), source_component, replica, deadline).await
            {
                Ok(()) if replica.se.is_empty() => {
                    result.succeed(replica.lfn.clone(), true);
                }
                Ok(()) => mark.push(ReplicaStatusEntry {
                    lfn: replica.lfn.clone(),
                    pfn: replica.pfn.clone(),
                    se: replica.se.clone(),
                    status: ReplicaStatus::Problematic,
                }),
                Err(e) => {
                    warn!(lfn = %replica.lfn, error = %e, "failed to report problematic replica");
                    result.fail_with(replica.lfn.clone(), &e);
                }
            }
        }

        if !mark.is_empty() {
            let marked = catalog.set_replica_status(&mark).await?;
            info!(marked = marked.successful.len(), "replicas marked problematic");
            result.merge(marked);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::catalog::{Catalog, CatalogSet};
    use crate::config::{DmsConfig, LiveConfig};
    use crate::error::ErrorKind;
    use crate::integrity::MemoryIntegrityReporter;
    use crate::memory::{MemoryCatalog, MemoryGrid};

    struct Fixture {
        grid: MemoryGrid,
        catalog: Arc<MemoryCatalog>,
        integrity: Arc<MemoryIntegrityReporter>,
        rm: ReplicaManager,
    }

    fn fixture() -> Fixture {
        let grid = MemoryGrid::new();
        grid.add_endpoint("CERN-DST", false);
        grid.add_endpoint("PIC-DST", false);
        let catalog = Arc::new(MemoryCatalog::new("FileCatalog"));
        let integrity = Arc::new(MemoryIntegrityReporter::new());
        let config = DmsConfig {
            rpc_timeout_secs: 5,
            ..DmsConfig::default()
        };
        let rm = ReplicaManager::new(
            CatalogSet::single(catalog.clone()),
            Arc::new(grid.registry()),
            Arc::new(LiveConfig::new(config)),
        )
        .with_integrity(integrity.clone());
        Fixture {
            grid,
            catalog,
            integrity,
            rm,
        }
    }

    fn file_entry(lfn: &str, se: &str, guid: &str) -> FileEntry {
        FileEntry {
            lfn: lfn.to_string(),
            pfn: format!("srm://{}.grid:8443/storage{}", se.to_lowercase(), lfn),
            size: 42,
            se: se.to_string(),
            guid: guid.to_string(),
            checksum: "0000002a".to_string(),
        }
    }

    #[tokio::test]
    async fn test_register_file_strips_port() {
        let fx = fixture();
        let batch = fx
            .rm
            .register_file(vec![file_entry("/vo/a", "CERN-DST", "G-A")], None)
            .await
            .unwrap();
        assert!(batch.is_successful("/vo/a"));
        let replica = fx.catalog.replica("/vo/a", "CERN-DST").unwrap();
        assert_eq!(replica.pfn, "srm://cern-dst.grid/storage/vo/a");
    }

    #[tokio::test]
    async fn test_unknown_endpoint_fails_its_entries_only() {
        let fx = fixture();
        let batch = fx
            .rm
            .register_file(
                vec![
                    file_entry("/vo/a", "CERN-DST", "G-A"),
                    file_entry("/vo/b", "NOWHERE-DST", "G-B"),
                ],
                None,
            )
            .await
            .unwrap();
        assert!(batch.is_successful("/vo/a"));
        assert_eq!(batch.failed["/vo/b"].kind, ErrorKind::StorageUnavailable);
        assert!(fx.catalog.file("/vo/b").is_none());
    }

    #[tokio::test]
    async fn test_guid_conflict() {
        let fx = fixture();
        fx.rm
            .register_file(vec![file_entry("/vo/a", "CERN-DST", "G-A")], None)
            .await
            .unwrap();
        let batch = fx
            .rm
            .register_file(vec![file_entry("/vo/a", "CERN-DST", "G-OTHER")], None)
            .await
            .unwrap();
        assert_eq!(batch.failed["/vo/a"].kind, ErrorKind::Conflict);
        assert_eq!(fx.catalog.file("/vo/a").unwrap().guid, "G-A");
    }

    #[tokio::test]
    async fn test_register_replica_twice() {
        let fx = fixture();
        fx.rm
            .register_file(vec![file_entry("/vo/a", "CERN-DST", "G-A")], None)
            .await
            .unwrap();
        let pfn = fx.grid.endpoint("PIC-DST").unwrap().seed("/vo/a", &[0; 42]).unwrap();
        for _ in 0..2 {
            let batch = fx
                .rm
                .register_replica(Some(ReplicaEntry::new("/vo/a", pfn.clone(), "PIC-DST")), None)
                .await
                .unwrap();
            assert!(batch.all_succeeded());
        }
        let replicas = fx.catalog.get_replicas(&["/vo/a".to_string()], true).await.unwrap();
        assert_eq!(replicas.successful["/vo/a"].len(), 2);
    }

    #[tokio::test]
    async fn test_register_requires_input() {
        let fx = fixture();
        let err = fx
            .rm
            .register_replica(Vec::<ReplicaEntry>::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_problematic_replica_is_reported_and_marked() {
        let fx = fixture();
        fx.rm
            .register_file(vec![file_entry("/vo/a", "CERN-DST", "G-A")], None)
            .await
            .unwrap();
        let report = ProblematicReplica {
            lfn: "/vo/a".to_string(),
            pfn: String::new(),
            se: "CERN-DST".to_string(),
            prognosis: "PFNMissing".to_string(),
        };
        let batch = fx
            .rm
            .set_replica_problematic(vec![report], "DataIntegrity", None)
            .await
            .unwrap();
        assert!(batch.is_successful("/vo/a"));
        assert_eq!(fx.integrity.reports().len(), 1);
        assert_eq!(
            fx.catalog.replica("/vo/a", "CERN-DST").unwrap().status,
            ReplicaStatus::Problematic
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_timeout_leaves_replica_active() {
        let fx = fixture();
        fx.rm
            .register_file(vec![file_entry("/vo/a", "CERN-DST", "G-A")], None)
            .await
            .unwrap();
        fx.integrity.set_delay(Some(Duration::from_secs(60)));
        let report = ProblematicReplica {
            lfn: "/vo/a".to_string(),
            pfn: String::new(),
            se: "CERN-DST".to_string(),
            prognosis: "PFNMissing".to_string(),
        };
        let batch = fx
            .rm
            .set_replica_problematic(vec![report], "DataIntegrity", None)
            .await
            .unwrap();
        assert_eq!(batch.failed["/vo/a"].kind, ErrorKind::Timeout);
        assert_eq!(
            fx.catalog.replica("/vo/a", "CERN-DST").unwrap().status,
            ReplicaStatus::Active
        );
    }
}
