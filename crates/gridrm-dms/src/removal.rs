//! The removal cascade: physical copy, then catalog replica, then catalog file.
//!
//! A catalog file record is only deleted once every one of its replicas has
//! been removed both physically and from the catalog within the same call.
//! Any failure keeps the file record so the removal can be retried.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::batch::{BatchResult, ItemError, ItemSet, Items};
use crate::error::{DmsError, DmsResult, ErrorKind};
use crate::manager::ReplicaManager;
use crate::types::ReplicaEntry;

/// One failure of a multi-endpoint removal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteFailure {
    /// Endpoint where the failure happened, `None` for catalog-level failures.
    pub se: Option<String>,
    /// The failure.
    pub error: ItemError,
}

/// Every failure recorded for one LFN during a file removal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalFailure {
    /// Failures in the order they were observed.
    pub failures: Vec<SiteFailure>,
}

impl RemovalFailure {
    fn single(se: Option<String>, error: ItemError) -> Self {
        Self {
            failures: vec![SiteFailure { se, error }],
        }
    }

    /// Endpoints at which removal failed.
    pub fn endpoints(&self) -> Vec<&str> {
        self.failures
            .iter()
            .filter_map(|f| f.se.as_deref())
            .collect()
    }
}

impl fmt::Display for RemovalFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            match &failure.se {
                Some(se) => write!(f, "{}: {}", se, failure.error)?,
                None => write!(f, "{}", failure.error)?,
            }
        }
        Ok(())
    }
}

impl ReplicaManager {
    /// Remove files from every endpoint and then from the catalog.
    ///
    /// LFNs unknown to the catalog succeed without further work. SE groups
    /// are removed concurrently; the catalog file deletion waits for all of
    /// them and only covers LFNs with no recorded failure.
    pub async fn remove_file(
        &self,
        lfns: impl Into<Items>,
        catalog: Option<&str>,
    ) -> DmsResult<BatchResult<bool, RemovalFailure>> {
        let items = ItemSet::normalize(lfns)?;
        let file_catalog = self.catalog(catalog)?;
        let ids = items.ids();
        debug!(count = ids.len(), "removing files from storage and catalog");

        let existence = file_catalog.exists(&ids).await?;
        let mut result = BatchResult::new();
        let mut present = Vec::new();
        for lfn in &ids {
            match existence.successful.get(lfn).copied() {
                Some(true) => present.push(lfn.clone()),
                Some(false) => {
                    result.succeed(lfn.clone(), true);
                }
                None => {
                    let error = existence.failed.get(lfn).cloned().unwrap_or_else(|| {
                        ItemError::new(ErrorKind::CatalogUnavailable, "existence not reported")
                    });
                    result.fail(lfn.clone(), RemovalFailure::single(None, error));
                }
            }
        }
        if present.is_empty() {
            return Ok(result);
        }

        let replicas = file_catalog.get_replicas(&present, true).await?;
        let mut failures: BTreeMap<String, Vec<SiteFailure>> = BTreeMap::new();
        for (lfn, error) in replicas.failed {
            failures
                .entry(lfn)
                .or_default()
                .push(SiteFailure { se: None, error });
        }
        for lfn in &present {
            if !replicas.successful.contains_key(lfn) && !failures.contains_key(lfn) {
                failures.entry(lfn.clone()).or_default().push(SiteFailure {
                    se: None,
                    error: ItemError::new(ErrorKind::CatalogUnavailable, "replicas not reported"),
                });
            }
        }

        let mut groups: BTreeMap<String, Vec<ReplicaEntry>> = BTreeMap::new();
        for (lfn, at) in &replicas.successful {
            for (se, pfn) in at {
                groups
                    .entry(se.clone())
                    .or_default()
                    .push(ReplicaEntry::new(lfn.clone(), pfn.clone(), se.clone()));
            }
        }

        let mut handles = Vec::with_capacity(groups.len());
        for (se, entries) in groups {
            let lfns: Vec<String> = entries.iter().map(|e| e.lfn.clone()).collect();
            let manager = self.clone();
            let selector = catalog.map(String::from);
            let task_se = se.clone();
            let handle = tokio::spawn(async move {
                manager
                    .remove_replica_entries(&task_se, entries, selector.as_deref())
                    .await
            });
            handles.push((se, lfns, handle));
        }

        for (se, lfns, handle) in handles {
            let group_failure = match handle.await {
                Ok(Ok(batch)) => {
                    for (lfn, error) in batch.failed {
                        failures.entry(lfn).or_default().push(SiteFailure {
                            se: Some(se.clone()),
                            error,
                        });
                    }
                    continue;
                }
                Ok(Err(e)) => ItemError::from(&e),
                Err(e) => ItemError::new(
                    ErrorKind::StorageUnavailable,
                    format!("removal task aborted: {}", e),
                ),
            };
            error!(se = %se, error = %group_failure, "removal failed for the whole endpoint group");
            for lfn in lfns {
                failures.entry(lfn).or_default().push(SiteFailure {
                    se: Some(se.clone()),
                    error: group_failure.clone(),
                });
            }
        }

        let removable: Vec<String> = present
            .into_iter()
            .filter(|lfn| !failures.contains_key(lfn))
            .collect();
        for (lfn, site_failures) in failures {
            warn!(lfn = %lfn, failures = site_failures.len(), "file kept in catalog");
            result.fail(
                lfn,
                RemovalFailure {
                    failures: site_failures,
                },
            );
        }

        if !removable.is_empty() {
            let removed = file_catalog.remove_file(&removable).await?;
            for (lfn, error) in removed.failed {
                result.fail(lfn, RemovalFailure::single(None, error));
            }
            for (lfn, value) in removed.successful {
                result.succeed(lfn, value);
            }
            info!(count = removable.len(), "files removed from catalog");
        }
        Ok(result)
    }

    /// Remove the replicas of `lfns` at `se`, physically and then from the catalog.
    pub async fn remove_replica(
        &self,
        se: &str,
        lfns: impl Into<Items>,
        catalog: Option<&str>,
    ) -> DmsResult<BatchResult<bool>> {
        let (mut result, entries) = self.replicas_at(se, lfns, catalog).await?;
        if !entries.is_empty() {
            result.merge(self.remove_replica_entries(se, entries, catalog).await?);
        }
        Ok(result)
    }

    /// Remove the catalog replica entries of `lfns` at `se`, leaving storage untouched.
    pub async fn remove_catalog_replica(
        &self,
        se: &str,
        lfns: impl Into<Items>,
        catalog: Option<&str>,
    ) -> DmsResult<BatchResult<bool>> {
        let (mut result, entries) = self.replicas_at(se, lfns, catalog).await?;
        if !entries.is_empty() {
            debug!(se, count = entries.len(), "resolved replicas for catalog removal");
            result.merge(self.remove_catalog_entries(se, &entries, catalog).await?);
        }
        Ok(result)
    }

    /// Remove the physical copies of `lfns` at `se`, leaving the catalog untouched.
    pub async fn remove_physical_replica(
        &self,
        se: &str,
        lfns: impl Into<Items>,
        catalog: Option<&str>,
    ) -> DmsResult<BatchResult<bool>> {
        let (mut result, entries) = self.replicas_at(se, lfns, catalog).await?;
        if !entries.is_empty() {
            debug!(se, count = entries.len(), "resolved replicas for physical removal");
            result.merge(self.remove_physical_entries(se, &entries).await);
        }
        Ok(result)
    }

    /// Remove catalog replica entries given as explicit (LFN, PFN, SE) tuples.
    pub async fn remove_catalog_physical_file_names(
        &self,
        entries: Vec<ReplicaEntry>,
        catalog: Option<&str>,
    ) -> DmsResult<BatchResult<bool>> {
        if entries.is_empty() {
            return Err(DmsError::invalid_input("no replicas to remove"));
        }
        let mut by_se: BTreeMap<String, Vec<ReplicaEntry>> = BTreeMap::new();
        for entry in entries {
            by_se.entry(entry.se.clone()).or_default().push(entry);
        }
        let mut result = BatchResult::new();
        for (se, group) in by_se {
            result.merge(self.remove_catalog_entries(&se, &group, catalog).await?);
        }
        Ok(result)
    }

    /// Resolve the replicas of `lfns` at `se`. LFNs without one there succeed.
    async fn replicas_at(
        &self,
        se: &str,
        lfns: impl Into<Items>,
        catalog: Option<&str>,
    ) -> DmsResult<(BatchResult<bool>, Vec<ReplicaEntry>)> {
        let items = ItemSet::normalize(lfns)?;
        let ids = items.ids();
        let replicas = self.catalog(catalog)?.get_replicas(&ids, true).await?;
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
        let mut entries = Vec::new();
        for (lfn, at) in replicas.successful {
            match at.get(se) {
                Some(pfn) => entries.push(ReplicaEntry::new(lfn, pfn.clone(), se)),
                None => {
                    debug!(lfn = %lfn, se, "no replica at endpoint, nothing to remove");
                    result.succeed(lfn, true);
                }
            }
        }
        Ok((result, entries))
    }

    /// Physical removal followed by catalog removal of the replicas that are gone.
    async fn remove_replica_entries(
        &self,
        se: &str,
        entries: Vec<ReplicaEntry>,
        catalog: Option<&str>,
    ) -> DmsResult<BatchResult<bool>> {
        let physical = self.remove_physical_entries(se, &entries).await;
        let mut result = BatchResult::new();
        let mut gone = Vec::new();
        for entry in entries {
            if physical.is_successful(&entry.lfn) {
                gone.push(entry);
            }
        }
        for (lfn, error) in physical.failed {
            result.fail(lfn, error);
        }
        if !gone.is_empty() {
            result.merge(self.remove_catalog_entries(se, &gone, catalog).await?);
        }
        Ok(result)
    }

    /// Remove PFNs at `se`; results are keyed by LFN.
    async fn remove_physical_entries(&self, se: &str, entries: &[ReplicaEntry]) -> BatchResult<bool> {
        let mut record = self.accounting_record("removePhysicalReplica", se, entries.len() as u64);
        let started = Instant::now();
        let pfn_to_lfn: BTreeMap<String, String> = entries
            .iter()
            .map(|e| (e.pfn.clone(), e.lfn.clone()))
            .collect();
        let pfns: Vec<String> = pfn_to_lfn.keys().cloned().collect();

        let outcome = match self.valid_backend(se) {
            Ok(backend) => backend.remove_file(&pfns).await,
            Err(e) => Err(e),
        };
        let mut result = match outcome {
            Ok(batch) => batch.remap_items(&pfn_to_lfn),
            Err(e) => {
                error!(se, error = %e, "failed to remove replicas");
                let mut failed = BatchResult::new();
                for entry in entries {
                    failed.fail_with(entry.lfn.clone(), &e);
                }
                failed
            }
        };
        for entry in entries {
            if !result.is_successful(&entry.lfn) && !result.is_failed(&entry.lfn) {
                result.fail(
                    entry.lfn.clone(),
                    ItemError::new(ErrorKind::StorageUnavailable, "no removal result reported"),
                );
            }
        }

        record.transfer_ok = result.successful.len() as u64;
        record.transfer_time = started.elapsed().as_secs_f64();
        self.account(record);
        info!(se, removed = result.successful.len(), failed = result.failed.len(), "physical removal done");
        result
    }

    /// Remove catalog replica entries at `se`.
    async fn remove_catalog_entries(
        &self,
        se: &str,
        entries: &[ReplicaEntry],
        catalog: Option<&str>,
    ) -> DmsResult<BatchResult<bool>> {
        let mut record = self.accounting_record("removeCatalogReplica", se, 0);
        record.registration_total = entries.len() as u64;
        let started = Instant::now();
        let outcome = match self.catalog(catalog) {
            Ok(file_catalog) => file_catalog.remove_replica(entries).await,
            Err(e) => Err(e),
        };
        record.registration_time = started.elapsed().as_secs_f64();
        match outcome {
            Ok(batch) => {
                for (lfn, error) in &batch.failed {
                    error!(lfn = %lfn, se, error = %error, "failed to remove catalog replica");
                }
                record.registration_ok = batch.successful.len() as u64;
                self.account(record);
                Ok(batch)
            }
            Err(e) => {
                error!(se, error = %e, "completely failed to remove catalog replicas");
                self.account(record);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::accounting::{FinalStatus, MemoryAccountingSink};
    use crate::catalog::CatalogSet;
    use crate::config::LiveConfig;
    use crate::memory::{MemoryCatalog, MemoryGrid};

    struct Fixture {
        grid: MemoryGrid,
        catalog: Arc<MemoryCatalog>,
        sink: Arc<MemoryAccountingSink>,
        rm: ReplicaManager,
    }

    async fn fixture() -> Fixture {
        let grid = MemoryGrid::new();
        grid.add_endpoint("SE-A", false);
        grid.add_endpoint("SE-B", false);
        let catalog = Arc::new(MemoryCatalog::new("FileCatalog"));
        let sink = Arc::new(MemoryAccountingSink::new());
        let rm = ReplicaManager::new(
            CatalogSet::single(catalog.clone()),
            Arc::new(grid.registry()),
            Arc::new(LiveConfig::default()),
        )
        .with_accounting(sink.clone());
        Fixture {
            grid,
            catalog,
            sink,
            rm,
        }
    }

    async fn seed(fx: &Fixture, lfn: &str, guid: &str, ses: &[&str]) {
        let data = vec![7u8; 100];
        let first = fx.grid.endpoint(ses[0]).unwrap().seed(lfn, &data).unwrap();
        fx.rm
            .register_file(
                Some(crate::types::FileEntry {
                    lfn: lfn.to_string(),
                    pfn: first,
                    size: 100,
                    se: ses[0].to_string(),
                    guid: guid.to_string(),
                    checksum: String::new(),
                }),
                None,
            )
            .await
            .unwrap();
        for se in &ses[1..] {
            let pfn = fx.grid.endpoint(se).unwrap().seed(lfn, &data).unwrap();
            fx.rm
                .register_replica(Some(ReplicaEntry::new(lfn, pfn, *se)), None)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_remove_file_everywhere() {
        let fx = fixture().await;
        seed(&fx, "/vo/x", "G-X", &["SE-A", "SE-B"]).await;
        let batch = fx.rm.remove_file("/vo/x", None).await.unwrap();
        assert!(batch.is_successful("/vo/x"));
        assert!(fx.catalog.file("/vo/x").is_none());
        assert_eq!(fx.grid.blob_count(), 0);
        assert_eq!(fx.sink.records_for("removePhysicalReplica").len(), 2);
        assert_eq!(fx.sink.records_for("removeCatalogReplica").len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_lfn_succeeds_without_work() {
        let fx = fixture().await;
        let batch = fx.rm.remove_file("/vo/ghost", None).await.unwrap();
        assert!(batch.is_successful("/vo/ghost"));
        assert_eq!(fx.catalog.stats().get_replicas_calls, 0);
    }

    #[tokio::test]
    async fn test_failures_at_two_sites_are_both_kept() {
        let fx = fixture().await;
        seed(&fx, "/vo/x", "G-X", &["SE-A", "SE-B"]).await;
        fx.grid.endpoint("SE-A").unwrap().fail_removals(Some("disk offline"));
        fx.grid.endpoint("SE-B").unwrap().fail_removals(Some("permission denied"));
        let batch = fx.rm.remove_file("/vo/x", None).await.unwrap();
        let failure = &batch.failed["/vo/x"];
        assert_eq!(failure.endpoints(), vec!["SE-A", "SE-B"]);
        let text = failure.to_string();
        assert!(text.contains("disk offline"));
        assert!(text.contains("permission denied"));
        assert!(fx.catalog.file("/vo/x").is_some());

        let failed: Vec<_> = fx
            .sink
            .records_for("removePhysicalReplica")
            .into_iter()
            .filter(|r| r.final_status == FinalStatus::Failed)
            .collect();
        assert_eq!(failed.len(), 2);
    }

    #[tokio::test]
    async fn test_remove_replica_without_replica_at_se() {
        let fx = fixture().await;
        seed(&fx, "/vo/x", "G-X", &["SE-A"]).await;
        let batch = fx.rm.remove_replica("SE-B", "/vo/x", None).await.unwrap();
        assert!(batch.is_successful("/vo/x"));
        assert_eq!(fx.grid.endpoint("SE-B").unwrap().stats().remove_calls, 0);
        assert!(fx.catalog.replica("/vo/x", "SE-A").is_some());
    }

    #[tokio::test]
    async fn test_remove_physical_keeps_catalog() {
        let fx = fixture().await;
        seed(&fx, "/vo/x", "G-X", &["SE-A", "SE-B"]).await;
        let batch = fx
            .rm
            .remove_physical_replica("SE-B", vec!["/vo/x"], None)
            .await
            .unwrap();
        assert!(batch.is_successful("/vo/x"));
        assert!(fx.catalog.replica("/vo/x", "SE-B").is_some());
        assert_eq!(fx.grid.blob_count(), 1);
    }

    #[tokio::test]
    async fn test_remove_catalog_replica_keeps_storage() {
        let fx = fixture().await;
        seed(&fx, "/vo/x", "G-X", &["SE-A", "SE-B"]).await;
        let batch = fx
            .rm
            .remove_catalog_replica("SE-B", "/vo/x", None)
            .await
            .unwrap();
        assert!(batch.is_successful("/vo/x"));
        assert!(fx.catalog.replica("/vo/x", "SE-B").is_none());
        assert_eq!(fx.grid.blob_count(), 2);
        let records = fx.sink.records_for("removeCatalogReplica");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].registration_ok, 1);
    }

    #[tokio::test]
    async fn test_remove_catalog_physical_file_names() {
        let fx = fixture().await;
        seed(&fx, "/vo/x", "G-X", &["SE-A", "SE-B"]).await;
        let pfn = fx.catalog.replica("/vo/x", "SE-A").unwrap().pfn;
        let batch = fx
            .rm
            .remove_catalog_physical_file_names(vec![ReplicaEntry::new("/vo/x", pfn, "SE-A")], None)
            .await
            .unwrap();
        assert!(batch.all_succeeded());
        assert!(fx.catalog.replica("/vo/x", "SE-A").is_none());
        assert!(fx.catalog.replica("/vo/x", "SE-B").is_some());
    }

    #[tokio::test]
    async fn test_unreported_replicas_keep_file_record() {
        let fx = fixture().await;
        seed(&fx, "/vo/x", "G-X", &["SE-A"]).await;
        fx.catalog.hide_replicas(true);
        let batch = fx.rm.remove_file("/vo/x", None).await.unwrap();
        assert!(batch.covers(&["/vo/x".to_string()]));
        let failure = &batch.failed["/vo/x"];
        assert_eq!(failure.failures[0].error.kind, ErrorKind::CatalogUnavailable);
        assert!(failure.to_string().contains("replicas not reported"));
        assert!(fx.catalog.file("/vo/x").is_some());
        assert_eq!(fx.grid.blob_count(), 1);
        assert_eq!(fx.grid.endpoint("SE-A").unwrap().stats().remove_calls, 0);
        assert_eq!(fx.catalog.stats().remove_file_calls, 0);

        let batch = fx.rm.remove_replica("SE-A", "/vo/x", None).await.unwrap();
        assert_eq!(batch.failed["/vo/x"].kind, ErrorKind::CatalogUnavailable);
        assert_eq!(fx.catalog.stats().remove_replica_calls, 0);
    }

    #[tokio::test]
    async fn test_empty_input_rejected() {
        let fx = fixture().await;
        let err = fx.rm.remove_file(Vec::<String>::new(), None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}
