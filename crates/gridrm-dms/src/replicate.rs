//! Replication to a destination endpoint and replicate-and-register.
//!
//! Every gate before the transfer loop aborts without touching storage or
//! the catalog. Transfer attempts run sequentially over the selected sources
//! and stop at the first success.

use std::collections::BTreeMap;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::batch::{BatchResult, ItemError, ItemSet, Items};
use crate::error::{BanRole, DmsError, DmsResult, ErrorKind};
use crate::manager::ReplicaManager;
use crate::types::{base_name, ReplicaEntry, ReplicateReport, ReplicationOutcome};

/// Options for one replication.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplicateOptions<'a> {
    /// Only use this endpoint as the source.
    pub source_se: Option<&'a str>,
    /// Place the copy under this logical directory instead of the LFN's own path.
    pub dest_path: Option<&'a str>,
    /// Catalog to consult instead of the default one.
    pub catalog: Option<&'a str>,
}

impl ReplicaManager {
    /// Copy `lfn` to `dest_se` without registering the new replica.
    pub async fn replicate(
        &self,
        lfn: &str,
        dest_se: &str,
        options: ReplicateOptions<'_>,
    ) -> DmsResult<ReplicationOutcome> {
        if lfn.trim().is_empty() {
            return Err(DmsError::invalid_input("blank LFN"));
        }
        self.require_write_permission(lfn, options.catalog).await?;

        let dest = self.valid_backend(dest_se)?;
        let dest_name = dest.canonical_name();
        let banned_targets = self.config().banned_targets();
        if banned_targets.iter().any(|s| s == dest_se || *s == dest_name) {
            warn!(lfn, se = dest_se, "destination endpoint is banned");
            return Err(DmsError::BannedEndpoint {
                se: dest_se.to_string(),
                role: BanRole::Target,
            });
        }

        let catalog = self.catalog(options.catalog)?;
        let lfns = [lfn.to_string()];
        let replicas = catalog.get_replicas(&lfns, false).await?.into_single(lfn)?;
        let size = catalog.get_file_size(&lfns).await?.into_single(lfn)?;
        if size == 0 {
            return Err(DmsError::invalid_input(format!(
                "{} is registered with zero size",
                lfn
            )));
        }

        if let Some(source) = options.source_se {
            if !replicas.contains_key(source) {
                return Err(DmsError::invalid_input(format!(
                    "{} has no replica at requested source {}",
                    lfn, source
                )));
            }
            if self.config().banned_sources().iter().any(|s| s == source) {
                return Err(DmsError::BannedEndpoint {
                    se: source.to_string(),
                    role: BanRole::Source,
                });
            }
        }

        if replicas.contains_key(dest_se) || replicas.contains_key(&dest_name) {
            info!(lfn, se = %dest_name, "replica already present at destination");
            return Ok(ReplicationOutcome::AlreadyPresent);
        }

        let sources = self
            .select_sources(lfn, options.source_se, &replicas, size)
            .await?;

        let dest_lfn = match options.dest_path {
            Some(dir) if !dir.is_empty() => {
                format!("{}/{}", dir.trim_end_matches('/'), base_name(lfn))
            }
            _ => lfn.to_string(),
        };
        let dest_pfn = dest.pfn_for_lfn(&dest_lfn)?;

        let mut last_error = String::from("no transfer attempted");
        for source in &sources {
            debug!(lfn, source = %source.se, dest = %dest_name, "attempting third-party transfer");
            let mut transfer = BTreeMap::new();
            transfer.insert(dest_pfn.clone(), source.pfn.clone());
            let attempt = match dest.replicate_file(&transfer, size).await {
                Ok(batch) => batch.into_single(&dest_pfn).map(|_| ()),
                Err(e) => Err(e),
            };
            match attempt {
                Ok(()) => {
                    info!(lfn, source = %source.se, dest = %dest_name, "replication succeeded");
                    return Ok(ReplicationOutcome::Replicated {
                        dest_se: dest_name,
                        dest_pfn,
                    });
                }
                Err(e) => {
                    warn!(lfn, source = %source.se, error = %e, "transfer failed, trying next source");
                    last_error = format!("{}: {}", source.se, e);
                }
            }
        }

        Err(DmsError::ReplicationFailed {
            lfn: lfn.to_string(),
            dest_se: dest_se.to_string(),
            reason: last_error,
        })
    }

    /// Replicate each LFN to `dest_se` and register the new replicas.
    ///
    /// A transfer failure and a registration failure land in `Failed` with
    /// different kinds; a replica already at the destination is a success
    /// with zero timings.
    pub async fn replicate_and_register(
        &self,
        lfns: impl Into<Items>,
        dest_se: &str,
        options: ReplicateOptions<'_>,
    ) -> DmsResult<BatchResult<ReplicateReport>> {
        let items = ItemSet::normalize(lfns)?;
        let mut result = BatchResult::new();

        for lfn in items.iter() {
            let mut record = self.accounting_record("replicateAndRegister", dest_se, 1);
            let started = Instant::now();
            let outcome = self.replicate(lfn, dest_se, options).await;
            record.transfer_time = started.elapsed().as_secs_f64();

            let (dest_name, dest_pfn) = match outcome {
                Ok(ReplicationOutcome::AlreadyPresent) => {
                    result.succeed(lfn.clone(), ReplicateReport::default());
                    continue;
                }
                Ok(ReplicationOutcome::Replicated { dest_se, dest_pfn }) => (dest_se, dest_pfn),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    self.account(record);
                    result.fail_with(lfn.clone(), &e);
                    continue;
                }
            };
            record.transfer_ok = 1;

            let started = Instant::now();
            let entry = ReplicaEntry::new(lfn.clone(), dest_pfn, dest_name);
            let registered = self.register_replica(Some(entry), options.catalog).await;
            let register_time = started.elapsed().as_secs_f64();
            record.registration_total = 1;
            record.registration_time = register_time;

            let failure = match registered {
                Ok(batch) => batch.failed.get(lfn).cloned(),
                Err(e) => Some(ItemError::from(&e)),
            };
            match failure {
                None => {
                    record.registration_ok = 1;
                    result.succeed(
                        lfn.clone(),
                        ReplicateReport {
                            replicate: record.transfer_time,
                            register: register_time,
                        },
                    );
                }
                Some(error) => {
                    warn!(lfn = %lfn, error = %error, "replica transferred but not registered");
                    result.fail(
                        lfn.clone(),
                        ItemError::new(
                            ErrorKind::RegistrationFailed,
                            format!("transfer succeeded, registration failed: {}", error.detail),
                        ),
                    );
                }
            }
            self.account(record);
        }
        Ok(result)
    }
}
