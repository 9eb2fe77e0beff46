//! Uploads and downloads between the local filesystem and storage endpoints.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::batch::{BatchResult, ItemError, ItemSet, Items};
use crate::error::{DmsError, DmsResult, ErrorKind};
use crate::manager::ReplicaManager;
use crate::types::{adler32_hex, base_name, FileEntry, PutReport};

/// Size of a local file; missing and empty files are rejected.
async fn local_file_size(local_file: &Path) -> DmsResult<u64> {
    let meta = tokio::fs::metadata(local_file).await.map_err(|_| {
        DmsError::invalid_input(format!("{} does not exist", local_file.display()))
    })?;
    if !meta.is_file() {
        return Err(DmsError::invalid_input(format!(
            "{} is not a regular file",
            local_file.display()
        )));
    }
    if meta.len() == 0 {
        return Err(DmsError::invalid_input(format!(
            "{} has zero size",
            local_file.display()
        )));
    }
    Ok(meta.len())
}

fn storage_lfn(lfn: &str, path: Option<&str>) -> String {
    match path {
        Some(dir) if !dir.is_empty() => format!("{}/{}", dir.trim_end_matches('/'), base_name(lfn)),
        _ => lfn.to_string(),
    }
}

impl ReplicaManager {
    /// Upload a local file to `se` without registering it.
    ///
    /// The file lands at the endpoint's PFN for `lfn`, or for `path/<basename>`
    /// when `path` is given. The value is the destination PFN.
    pub async fn put(
        &self,
        lfn: &str,
        local_file: &Path,
        se: &str,
        path: Option<&str>,
    ) -> DmsResult<BatchResult<String>> {
        if lfn.trim().is_empty() {
            return Err(DmsError::invalid_input("blank LFN"));
        }
        local_file_size(local_file).await?;
        let backend = self.valid_backend(se)?;
        let dest_pfn = backend.pfn_for_lfn(&storage_lfn(lfn, path))?;

        let mut files = BTreeMap::new();
        files.insert(dest_pfn.clone(), local_file.to_path_buf());
        let uploaded = backend.put_file(&files).await?;

        let mut result = BatchResult::new();
        match uploaded.into_single(&dest_pfn) {
            Ok(size) => {
                info!(lfn, se, size, "file uploaded");
                result.succeed(lfn, dest_pfn);
            }
            Err(e) => {
                warn!(lfn, se, error = %e, "failed to upload file");
                result.fail_with(lfn, &e);
            }
        }
        Ok(result)
    }

    /// Upload a local file and register it as a new catalog file.
    ///
    /// A missing GUID is generated and a missing checksum is computed
    /// (Adler-32). An LFN already in the catalog and a failed upload are
    /// overall errors; a failed registration lands in `Failed`.
    pub async fn put_and_register(
        &self,
        lfn: &str,
        local_file: &Path,
        se: &str,
        guid: Option<&str>,
        checksum: Option<&str>,
        catalog: Option<&str>,
    ) -> DmsResult<BatchResult<PutReport>> {
        if lfn.trim().is_empty() {
            return Err(DmsError::invalid_input("blank LFN"));
        }
        self.require_write_permission(lfn, catalog).await?;
        let size = local_file_size(local_file).await?;

        let guid = match guid {
            Some(guid) if !guid.is_empty() => guid.to_string(),
            _ => Uuid::new_v4().to_string(),
        };
        let checksum = match checksum {
            Some(checksum) if !checksum.is_empty() => checksum.to_string(),
            _ => adler32_hex(&tokio::fs::read(local_file).await?),
        };

        let file_catalog = self.catalog(catalog)?;
        let lfns = [lfn.to_string()];
        if file_catalog.exists(&lfns).await?.into_single(lfn)? {
            return Err(DmsError::Conflict {
                item: lfn.to_string(),
                reason: "file already registered in the catalog".to_string(),
            });
        }

        let backend = self.valid_backend(se)?;
        let dest_pfn = backend.pfn_for_lfn(lfn)?;
        let mut record = self.accounting_record("putAndRegister", se, 1);
        record.transfer_size = size;

        let started = Instant::now();
        let mut files = BTreeMap::new();
        files.insert(dest_pfn.clone(), local_file.to_path_buf());
        let uploaded = match backend.put_file(&files).await {
            Ok(batch) => batch.into_single(&dest_pfn),
            Err(e) => Err(e),
        };
        record.transfer_time = started.elapsed().as_secs_f64();
        if let Err(e) = uploaded {
            warn!(lfn, se, error = %e, "failed to put file to storage");
            self.account(record);
            return Err(e);
        }
        record.transfer_ok = 1;
        debug!(lfn, se, guid = %guid, "file uploaded, registering");

        let entry = FileEntry {
            lfn: lfn.to_string(),
            pfn: dest_pfn,
            size,
            se: se.to_string(),
            guid,
            checksum,
        };
        let started = Instant::now();
        let registered = self.register_file(Some(entry), catalog).await;
        record.registration_total = 1;
        record.registration_time = started.elapsed().as_secs_f64();

        let failure = match registered {
            Ok(batch) => batch.failed.get(lfn).cloned(),
            Err(e) => Some(ItemError::from(&e)),
        };
        let mut result = BatchResult::new();
        match failure {
            None => {
                record.registration_ok = 1;
                result.succeed(
                    lfn,
                    PutReport {
                        put: record.transfer_time,
                        register: record.registration_time,
                    },
                );
            }
            Some(error) => {
                warn!(lfn, error = %error, "file uploaded but not registered");
                result.fail(
                    lfn,
                    ItemError::new(
                        ErrorKind::RegistrationFailed,
                        format!("put succeeded, registration failed: {}", error.detail),
                    ),
                );
            }
        }
        self.account(record);
        Ok(result)
    }

    /// Upload a local directory tree to `se` under `storage_path`.
    pub async fn put_directory(
        &self,
        storage_path: &str,
        local_dir: &Path,
        se: &str,
    ) -> DmsResult<BatchResult<u64>> {
        let is_dir = tokio::fs::metadata(local_dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(DmsError::invalid_input(format!(
                "{} is not a directory",
                local_dir.display()
            )));
        }
        let backend = self.valid_backend(se)?;
        let dest_pfn = backend.pfn_for_lfn(storage_path)?;
        let mut dirs = BTreeMap::new();
        dirs.insert(dest_pfn.clone(), local_dir.to_path_buf());
        let uploaded = backend.put_directory(&dirs).await?;
        let mut mapping = BTreeMap::new();
        mapping.insert(dest_pfn, storage_path.to_string());
        Ok(uploaded.remap_items(&mapping))
    }

    /// Download each LFN into `dest_dir` from the best available replica.
    ///
    /// Replicas at local endpoints are tried first, then the rest in
    /// catalog order; the first successful download wins.
    pub async fn get_file(
        &self,
        lfns: impl Into<Items>,
        dest_dir: &Path,
        catalog: Option<&str>,
    ) -> DmsResult<BatchResult<PathBuf>> {
        let items = ItemSet::normalize(lfns)?;
        tokio::fs::create_dir_all(dest_dir).await?;
        let replicas = self
            .catalog(catalog)?
            .get_replicas(&items.ids(), false)
            .await?;

        let mut result = BatchResult::new();
        for (lfn, error) in replicas.failed {
            result.fail(lfn, error);
        }
        for (lfn, at) in &replicas.successful {
            let ranked = self.rank_by_locality(lfn, at);
            if ranked.is_empty() {
                result.fail_with(lfn.clone(), &DmsError::NoValidSource { lfn: lfn.clone() });
                continue;
            }
            let mut last_error = None;
            for replica in &ranked {
                debug!(lfn = %lfn, se = %replica.se, "attempting download");
                let fetched = match replica
                    .backend
                    .get_file(std::slice::from_ref(&replica.pfn), dest_dir)
                    .await
                {
                    Ok(batch) => batch.into_single(&replica.pfn),
                    Err(e) => Err(e),
                };
                match fetched {
                    Ok(path) => {
                        info!(lfn = %lfn, se = %replica.se, path = %path.display(), "file downloaded");
                        result.succeed(lfn.clone(), path);
                        last_error = None;
                        break;
                    }
                    Err(e) => {
                        warn!(lfn = %lfn, se = %replica.se, error = %e, "download failed, trying next replica");
                        last_error = Some(format!("{}: {}", replica.se, e));
                    }
                }
            }
            if let Some(reason) = last_error {
                result.fail(
                    lfn.clone(),
                    ItemError::new(
                        ErrorKind::NoValidSource,
                        format!("failed to get file from any replica, last {}", reason),
                    ),
                );
            }
        }
        Ok(result)
    }
}
