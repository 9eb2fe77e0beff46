//! Source selection for replication and locality ranking for downloads.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::error::{DmsError, DmsResult};
use crate::manager::ReplicaManager;
use crate::storage::StorageBackend;

/// A replica that passed every source filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceCandidate {
    /// Endpoint holding the replica.
    pub se: String,
    /// PFN rewritten for a third-party transfer protocol.
    pub pfn: String,
}

/// A replica on an instantiable endpoint, in download preference order.
#[derive(Clone)]
pub struct RankedReplica {
    /// Endpoint name.
    pub se: String,
    /// Registered PFN.
    pub pfn: String,
    /// The endpoint.
    pub backend: Arc<dyn StorageBackend>,
}

impl std::fmt::Debug for RankedReplica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RankedReplica")
            .field("se", &self.se)
            .field("pfn", &self.pfn)
            .field("local", &self.backend.is_local())
            .finish()
    }
}

impl ReplicaManager {
    /// Filter `replicas` (SE to PFN) down to usable transfer sources.
    ///
    /// Candidates come out in SE name order, which is the iteration order of
    /// the replica map every catalog returns. A candidate survives when it is the requested source (if any), is not
    /// banned, instantiates, shares a third-party protocol, yields a PFN under
    /// that protocol and reports a physical size equal to `expected_size`.
    pub async fn select_sources(
        &self,
        lfn: &str,
        requested_source: Option<&str>,
        replicas: &BTreeMap<String, String>,
        expected_size: u64,
    ) -> DmsResult<Vec<SourceCandidate>> {
        let banned = self.config().banned_sources();
        let protocols = self.config().snapshot().third_party_protocols;
        let mut candidates = Vec::new();

        for (se, pfn) in replicas {
            if let Some(requested) = requested_source {
                if se != requested {
                    continue;
                }
            }
            if banned.contains(se) {
                debug!(lfn, se = %se, "source endpoint is banned");
                continue;
            }
            let backend = match self.valid_backend(se) {
                Ok(backend) => backend,
                Err(e) => {
                    warn!(lfn, se = %se, error = %e, "source endpoint not usable");
                    continue;
                }
            };
            let remote = backend.remote_protocols();
            if !protocols.iter().any(|p| remote.contains(p)) {
                debug!(lfn, se = %se, ?remote, "no third-party protocol in common");
                continue;
            }
            let transfer_pfn = match backend.pfn_for_protocol(pfn, &protocols, true) {
                Ok(transfer_pfn) => transfer_pfn,
                Err(e) => {
                    warn!(lfn, se = %se, error = %e, "failed to obtain transfer PFN");
                    continue;
                }
            };
            let physical = match backend.file_size(std::slice::from_ref(&transfer_pfn)).await {
                Ok(batch) => batch.into_single(&transfer_pfn),
                Err(e) => Err(e),
            };
            match physical {
                Ok(size) if size == expected_size => {
                    candidates.push(SourceCandidate {
                        se: se.clone(),
                        pfn: transfer_pfn,
                    });
                }
                Ok(size) => {
                    let mismatch = DmsError::SizeMismatch {
                        se: se.clone(),
                        pfn: transfer_pfn,
                        catalog_size: expected_size,
                        physical_size: size,
                    };
                    warn!(lfn, error = %mismatch, "source rejected");
                }
                Err(e) => {
                    warn!(lfn, se = %se, error = %e, "failed to get physical size of source");
                }
            }
        }

        if candidates.is_empty() {
            return Err(DmsError::NoValidSource {
                lfn: lfn.to_string(),
            });
        }
        debug!(lfn, count = candidates.len(), "source candidates resolved");
        Ok(candidates)
    }

    /// Order replicas for download: local endpoints first, each group in SE name order.
    ///
    /// Endpoints that cannot be instantiated are logged and skipped.
    pub fn rank_by_locality(
        &self,
        lfn: &str,
        replicas: &BTreeMap<String, String>,
    ) -> Vec<RankedReplica> {
        let mut local = Vec::new();
        let mut remote = Vec::new();
        for (se, pfn) in replicas {
            match self.valid_backend(se) {
                Ok(backend) => {
                    let ranked = RankedReplica {
                        se: se.clone(),
                        pfn: pfn.clone(),
                        backend,
                    };
                    if ranked.backend.is_local() {
                        local.push(ranked);
                    } else {
                        remote.push(ranked);
                    }
                }
                Err(e) => {
                    error!(lfn, se = %se, error = %e, "catalog lists a replica at an unusable endpoint");
                }
            }
        }
        local.extend(remote);
        local
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogSet;
    use crate::config::{DmsConfig, LiveConfig};
    use crate::error::ErrorKind;
    use crate::memory::{MemoryCatalog, MemoryGrid};

    struct Fixture {
        grid: MemoryGrid,
        config: Arc<LiveConfig>,
        rm: ReplicaManager,
    }

    fn fixture() -> Fixture {
        let grid = MemoryGrid::new();
        for (name, local) in [("A-DST", false), ("B-DST", true), ("C-DST", false)] {
            grid.add_endpoint(name, local);
        }
        let config = Arc::new(LiveConfig::new(DmsConfig::default()));
        let rm = ReplicaManager::new(
            CatalogSet::single(Arc::new(MemoryCatalog::new("FileCatalog"))),
            Arc::new(grid.registry()),
            config.clone(),
        );
        Fixture { grid, config, rm }
    }

    fn seed_all(fx: &Fixture, data: &[u8]) -> BTreeMap<String, String> {
        ["A-DST", "B-DST", "C-DST"]
            .iter()
            .map(|se| {
                let endpoint = fx.grid.endpoint(se).unwrap();
                (se.to_string(), endpoint.seed("/vo/f", data).unwrap())
            })
            .collect()
    }

    #[tokio::test]
    async fn test_candidates_in_endpoint_name_order() {
        let fx = fixture();
        let seeded = seed_all(&fx, b"12345");
        let mut replicas = BTreeMap::new();
        for se in ["C-DST", "A-DST", "B-DST"] {
            replicas.insert(se.to_string(), seeded[se].clone());
        }
        let chosen = fx.rm.select_sources("/vo/f", None, &replicas, 5).await.unwrap();
        let ses: Vec<_> = chosen.iter().map(|c| c.se.as_str()).collect();
        assert_eq!(ses, vec!["A-DST", "B-DST", "C-DST"]);
    }

    #[tokio::test]
    async fn test_filters_banned_and_size_mismatch() {
        let fx = fixture();
        let replicas = seed_all(&fx, b"12345");
        fx.config.ban_source("A-DST");
        fx.grid.endpoint("C-DST").unwrap().report_size(Some(4));
        let chosen = fx.rm.select_sources("/vo/f", None, &replicas, 5).await.unwrap();
        assert_eq!(chosen.len(), 1);
        assert_eq!(chosen[0].se, "B-DST");
    }

    #[tokio::test]
    async fn test_requested_source_only() {
        let fx = fixture();
        let replicas = seed_all(&fx, b"12345");
        let chosen = fx
            .rm
            .select_sources("/vo/f", Some("C-DST"), &replicas, 5)
            .await
            .unwrap();
        assert_eq!(chosen.len(), 1);
        assert_eq!(chosen[0].se, "C-DST");
    }

    #[tokio::test]
    async fn test_no_protocol_in_common() {
        let fx = fixture();
        let replicas = seed_all(&fx, b"12345");
        for se in ["A-DST", "B-DST", "C-DST"] {
            fx.grid
                .endpoint(se)
                .unwrap()
                .set_protocols(vec!["dcap".to_string()]);
        }
        let err = fx
            .rm
            .select_sources("/vo/f", None, &replicas, 5)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoValidSource);
    }

    #[test]
    fn test_locality_ranking() {
        let fx = fixture();
        fx.grid.endpoint("A-DST").unwrap().set_valid(false);
        let mut replicas = BTreeMap::new();
        for se in ["A-DST", "B-DST", "C-DST", "UNKNOWN-SE"] {
            replicas.insert(se.to_string(), format!("srm://{}/f", se));
        }
        let ranked = fx.rm.rank_by_locality("/vo/f", &replicas);
        let ses: Vec<_> = ranked.iter().map(|r| r.se.as_str()).collect();
        assert_eq!(ses, vec!["B-DST", "C-DST"]);

        fx.grid.endpoint("A-DST").unwrap().set_valid(true);
        let ranked = fx.rm.rank_by_locality("/vo/f", &replicas);
        let ses: Vec<_> = ranked.iter().map(|r| r.se.as_str()).collect();
        assert_eq!(ses, vec!["B-DST", "A-DST", "C-DST"]);
    }
}
