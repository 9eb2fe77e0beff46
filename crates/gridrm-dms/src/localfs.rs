//! A POSIX directory tree served as a storage endpoint with `file://` PFNs.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::batch::{BatchResult, ItemError};
use crate::config::StorageElementConfig;
use crate::error::{DmsError, DmsResult, ErrorKind};
use crate::memory::collect_tree;
use crate::storage::{translate_pfn, Pfn, StorageBackend, StorageOp};
use crate::types::{adler32_hex, base_name, PhysicalMetadata};

/// Storage endpoint backed by a local directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    name: String,
    root: PathBuf,
    local: bool,
    protocols: Vec<String>,
}

impl LocalStorage {
    /// Endpoint `name` rooted at `root`.
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>, local: bool) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            local,
            protocols: vec![String::from("file")],
        }
    }

    /// Build from a configuration entry.
    pub fn from_config(config: &StorageElementConfig) -> Self {
        Self {
            name: config.name.clone(),
            root: config.root.clone(),
            local: config.local,
            protocols: config.protocols.clone(),
        }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, pfn: &str) -> Result<PathBuf, ItemError> {
        let parsed = Pfn::parse(pfn).map_err(ItemError::from)?;
        if parsed.protocol != "file" {
            return Err(ItemError::new(
                ErrorKind::InvalidInput,
                format!("{} is not a file:// PFN", pfn),
            ));
        }
        let path = lexical(Path::new(&parsed.path)).ok_or_else(|| {
            ItemError::new(
                ErrorKind::InvalidInput,
                format!("{} climbs above the filesystem root", pfn),
            )
        })?;
        if !path.starts_with(&self.root) {
            return Err(ItemError::new(
                ErrorKind::InvalidInput,
                format!("{} is outside {}", pfn, self.root.display()),
            ));
        }
        Ok(path)
    }

    async fn stat(&self, pfn: &str) -> Result<std::fs::Metadata, ItemError> {
        let path = self.path_of(pfn)?;
        tokio::fs::metadata(&path).await.map_err(io_item)
    }
}

/// Resolve `.` and `..` without touching the filesystem.
fn lexical(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !matches!(out.components().next_back(), Some(Component::Normal(_))) {
                    return None;
                }
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    Some(out)
}

fn io_item(e: std::io::Error) -> ItemError {
    if e.kind() == std::io::ErrorKind::NotFound {
        ItemError::new(ErrorKind::NotFound, e.to_string())
    } else {
        ItemError::from(DmsError::Io(e))
    }
}

async fn copy_into(source: &Path, dest: &Path) -> Result<u64, ItemError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_item)?;
    }
    tokio::fs::copy(source, dest).await.map_err(io_item)
}

#[async_trait]
impl StorageBackend for LocalStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_valid(&self) -> bool {
        self.root.is_dir()
    }

    fn is_local(&self) -> bool {
        self.local
    }

    fn remote_protocols(&self) -> Vec<String> {
        self.protocols.clone()
    }

    fn pfn_for_lfn(&self, lfn: &str) -> DmsResult<String> {
        let relative = lfn.trim_start_matches('/');
        if Path::new(relative)
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(DmsError::invalid_input(format!(
                "{} contains a parent directory component",
                lfn
            )));
        }
        Ok(format!("file://{}", self.root.join(relative).display()))
    }

    fn pfn_for_protocol(
        &self,
        pfn: &str,
        protocols: &[String],
        with_port: bool,
    ) -> DmsResult<String> {
        translate_pfn(&self.name, pfn, protocols, &self.protocols, with_port)
    }

    fn supported_operations(&self) -> Vec<StorageOp> {
        let mut ops = StorageOp::REQUIRED.to_vec();
        ops.push(StorageOp::GetAccessUrl);
        ops.push(StorageOp::PutDirectory);
        ops
    }

    async fn exists(&self, pfns: &[String]) -> DmsResult<BatchResult<bool>> {
        let mut batch = BatchResult::new();
        for pfn in pfns {
            match self.stat(pfn).await {
                Ok(_) => {
                    batch.succeed(pfn.clone(), true);
                }
                Err(e) if e.kind == ErrorKind::NotFound => {
                    batch.succeed(pfn.clone(), false);
                }
                Err(e) => batch.fail(pfn.clone(), e),
            }
        }
        Ok(batch)
    }

    async fn is_file(&self, pfns: &[String]) -> DmsResult<BatchResult<bool>> {
        let mut batch = BatchResult::new();
        for pfn in pfns {
            match self.stat(pfn).await {
                Ok(meta) => {
                    batch.succeed(pfn.clone(), meta.is_file());
                }
                Err(e) => batch.fail(pfn.clone(), e),
            }
        }
        Ok(batch)
    }

    async fn file_size(&self, pfns: &[String]) -> DmsResult<BatchResult<u64>> {
        let mut batch = BatchResult::new();
        for pfn in pfns {
            match self.stat(pfn).await {
                Ok(meta) => {
                    batch.succeed(pfn.clone(), meta.len());
                }
                Err(e) => batch.fail(pfn.clone(), e),
            }
        }
        Ok(batch)
    }

    async fn file_metadata(&self, pfns: &[String]) -> DmsResult<BatchResult<PhysicalMetadata>> {
        let mut batch = BatchResult::new();
        for pfn in pfns {
            let read = match self.path_of(pfn) {
                Ok(path) => tokio::fs::read(&path).await.map_err(io_item),
                Err(e) => Err(e),
            };
            match read {
                Ok(data) => {
                    batch.succeed(
                        pfn.clone(),
                        PhysicalMetadata {
                            size: data.len() as u64,
                            checksum: Some(adler32_hex(&data)),
                            cached: true,
                            migrated: false,
                            pinned: false,
                        },
                    );
                }
                Err(e) => batch.fail(pfn.clone(), e),
            }
        }
        Ok(batch)
    }

    async fn access_url(
        &self,
        pfns: &[String],
        protocols: &[String],
    ) -> DmsResult<BatchResult<String>> {
        let mut batch = BatchResult::new();
        for pfn in pfns {
            match self.pfn_for_protocol(pfn, protocols, true) {
                Ok(url) => {
                    batch.succeed(pfn.clone(), url);
                }
                Err(e) => batch.fail_with(pfn.clone(), &e),
            }
        }
        Ok(batch)
    }

    async fn get_file(
        &self,
        pfns: &[String],
        local_dir: &Path,
    ) -> DmsResult<BatchResult<PathBuf>> {
        let mut batch = BatchResult::new();
        for pfn in pfns {
            let target = local_dir.join(base_name(pfn));
            let copied = match self.path_of(pfn) {
                Ok(source) => copy_into(&source, &target).await,
                Err(e) => Err(e),
            };
            match copied {
                Ok(_) => {
                    batch.succeed(pfn.clone(), target);
                }
                Err(e) => batch.fail(pfn.clone(), e),
            }
        }
        Ok(batch)
    }

    async fn put_file(&self, files: &BTreeMap<String, PathBuf>) -> DmsResult<BatchResult<u64>> {
        let mut batch = BatchResult::new();
        for (pfn, local) in files {
            let copied = match self.path_of(pfn) {
                Ok(dest) => copy_into(local, &dest).await,
                Err(e) => Err(e),
            };
            match copied {
                Ok(size) => {
                    batch.succeed(pfn.clone(), size);
                }
                Err(e) => batch.fail(pfn.clone(), e),
            }
        }
        Ok(batch)
    }

    async fn put_directory(
        &self,
        dirs: &BTreeMap<String, PathBuf>,
    ) -> DmsResult<BatchResult<u64>> {
        let mut batch = BatchResult::new();
        for (pfn, local_dir) in dirs {
            let dest = match self.path_of(pfn) {
                Ok(dest) => dest,
                Err(e) => {
                    batch.fail(pfn.clone(), e);
                    continue;
                }
            };
            let files = match collect_tree(local_dir).await {
                Ok(files) => files,
                Err(e) => {
                    batch.fail_with(pfn.clone(), &e);
                    continue;
                }
            };
            let mut total = 0u64;
            let mut failure = None;
            for (relative, data) in files {
                let target = dest.join(&relative);
                let written = async {
                    if let Some(parent) = target.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    tokio::fs::write(&target, &data).await
                }
                .await;
                match written {
                    Ok(()) => total += data.len() as u64,
                    Err(e) => {
                        failure = Some(io_item(e));
                        break;
                    }
                }
            }
            match failure {
                Some(e) => batch.fail(pfn.clone(), e),
                None => {
                    batch.succeed(pfn.clone(), total);
                }
            }
        }
        Ok(batch)
    }

    async fn replicate_file(
        &self,
        transfers: &BTreeMap<String, String>,
        expected_size: u64,
    ) -> DmsResult<BatchResult<u64>> {
        let mut batch = BatchResult::new();
        for (dest, source) in transfers {
            let paths = self.path_of(dest).and_then(|dest_path| {
                let parsed = Pfn::parse(source).map_err(ItemError::from)?;
                if parsed.protocol != "file" {
                    return Err(ItemError::new(
                        ErrorKind::ReplicationFailed,
                        format!("cannot read {} from a local endpoint", source),
                    ));
                }
                Ok((PathBuf::from(parsed.path), dest_path))
            });
            let copied = match paths {
                Ok((source_path, dest_path)) => copy_into(&source_path, &dest_path).await,
                Err(e) => Err(e),
            };
            match copied {
                Ok(size) if expected_size > 0 && size != expected_size => {
                    batch.fail(
                        dest.clone(),
                        ItemError::new(
                            ErrorKind::SizeMismatch,
                            format!("copied {} bytes, expected {}", size, expected_size),
                        ),
                    );
                }
                Ok(size) => {
                    debug!(se = %self.name, dest = %dest, source = %source, "local copy done");
                    batch.succeed(dest.clone(), size);
                }
                Err(e) => batch.fail(dest.clone(), e),
            }
        }
        Ok(batch)
    }

    async fn remove_file(&self, pfns: &[String]) -> DmsResult<BatchResult<bool>> {
        let mut batch = BatchResult::new();
        for pfn in pfns {
            let removed = match self.path_of(pfn) {
                Ok(path) => match tokio::fs::remove_file(&path).await {
                    Ok(()) => Ok(true),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
                    Err(e) => Err(io_item(e)),
                },
                Err(e) => Err(e),
            };
            match removed {
                Ok(value) => {
                    batch.succeed(pfn.clone(), value);
                }
                Err(e) => batch.fail(pfn.clone(), e),
            }
        }
        Ok(batch)
    }
}
