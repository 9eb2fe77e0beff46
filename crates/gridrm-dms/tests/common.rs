//! Shared in-memory grid for the integration suites.

#![allow(dead_code)]

use std::sync::Arc;

use gridrm_dms::accounting::MemoryAccountingSink;
use gridrm_dms::{
    Catalog, CatalogSet, FileEntry, LiveConfig, MemoryCatalog, MemoryGrid, MemoryStorage,
    ReplicaEntry, ReplicaManager,
};

pub struct TestGrid {
    pub grid: MemoryGrid,
    pub catalog: Arc<MemoryCatalog>,
    pub config: Arc<LiveConfig>,
    pub sink: Arc<MemoryAccountingSink>,
    pub rm: ReplicaManager,
}

impl TestGrid {
    /// Grid with the named endpoints; the flag marks endpoints at the local site.
    pub fn new(endpoints: &[(&str, bool)]) -> Self {
        let grid = MemoryGrid::new();
        for (name, local) in endpoints {
            grid.add_endpoint(name, *local);
        }
        let catalog = Arc::new(MemoryCatalog::new("FileCatalog"));
        let config = Arc::new(LiveConfig::default());
        let sink = Arc::new(MemoryAccountingSink::new());
        let rm = ReplicaManager::new(
            CatalogSet::single(catalog.clone()),
            Arc::new(grid.registry()),
            config.clone(),
        )
        .with_accounting(sink.clone());
        Self {
            grid,
            catalog,
            config,
            sink,
            rm,
        }
    }

    pub fn se(&self, name: &str) -> Arc<MemoryStorage> {
        self.grid.endpoint(name).unwrap()
    }

    /// Store `data` at `se` and register it as the first replica of `lfn`.
    pub async fn register(&self, lfn: &str, se: &str, data: &[u8]) -> String {
        self.register_sized(lfn, se, data, data.len() as u64).await
    }

    /// Like [`TestGrid::register`] but with an explicit catalog size.
    pub async fn register_sized(&self, lfn: &str, se: &str, data: &[u8], size: u64) -> String {
        let pfn = self.se(se).seed(lfn, data).unwrap();
        let batch = self
            .catalog
            .add_file(&[FileEntry {
                lfn: lfn.to_string(),
                pfn: pfn.clone(),
                size,
                se: se.to_string(),
                guid: format!("GUID-{}", lfn),
                checksum: String::new(),
            }])
            .await
            .unwrap();
        assert!(batch.all_succeeded());
        pfn
    }

    /// Store `data` at `se` and add it as a further replica of `lfn`.
    pub async fn add_replica(&self, lfn: &str, se: &str, data: &[u8]) -> String {
        let pfn = self.se(se).seed(lfn, data).unwrap();
        let batch = self
            .catalog
            .add_replica(&[ReplicaEntry::new(lfn, pfn.clone(), se)])
            .await
            .unwrap();
        assert!(batch.all_succeeded());
        pfn
    }
}
