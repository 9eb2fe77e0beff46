//! `grid-dms` command line: drives the replica manager over locally configured
//! storage endpoints and a JSON-backed catalog, printing result envelopes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use crate::accounting::TracingAccountingSink;
use crate::batch::envelope;
use crate::catalog::CatalogSet;
use crate::config::{ConfigSource, DmsConfig, LiveConfig};
use crate::error::DmsResult;
use crate::localfs::LocalStorage;
use crate::manager::ReplicaManager;
use crate::memory::MemoryCatalog;
use crate::replicate::ReplicateOptions;
use crate::storage::{StorageBackend, StorageRegistry};
use crate::types::ReplicaEntry;

/// Name the JSON-backed catalog is registered under.
pub const CATALOG_NAME: &str = "FileCatalog";

/// Top-level arguments.
#[derive(Parser)]
#[command(name = "grid-dms")]
#[command(about = "GridRM replica management CLI", long_about = None)]
pub struct Cli {
    /// Configuration file.
    #[arg(short, long, default_value = "/etc/gridrm/dms.toml", env = "GRID_DMS_CONFIG")]
    pub config: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long)]
    pub verbose: bool,

    /// Operation to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Operations exposed on the command line.
#[derive(Subcommand)]
pub enum Command {
    /// Upload a local file and register it.
    Put {
        /// Logical file name.
        lfn: String,
        /// Local file to upload.
        file: PathBuf,
        /// Destination storage endpoint.
        se: String,
        /// GUID to register (generated when absent).
        #[arg(long)]
        guid: Option<String>,
        /// Adler-32 checksum (computed when absent).
        #[arg(long)]
        checksum: Option<String>,
        /// Upload only, without catalog registration.
        #[arg(long)]
        no_register: bool,
    },
    /// Download files from their best replica.
    Get {
        /// Logical file names.
        #[arg(required = true)]
        lfns: Vec<String>,
        /// Destination directory.
        #[arg(short, long, default_value = ".")]
        dest: PathBuf,
        /// Download from this endpoint only.
        #[arg(long)]
        se: Option<String>,
    },
    /// Copy files to another endpoint and register the new replicas.
    Replicate {
        /// Logical file names.
        #[arg(required = true)]
        lfns: Vec<String>,
        /// Destination storage endpoint.
        #[arg(long)]
        dest: String,
        /// Preferred source endpoint.
        #[arg(long)]
        source: Option<String>,
        /// Destination directory at the endpoint.
        #[arg(long)]
        path: Option<String>,
    },
    /// Register an existing physical copy as a replica.
    RegisterReplica {
        /// Logical file name.
        lfn: String,
        /// Physical file name.
        pfn: String,
        /// Storage endpoint holding the copy.
        se: String,
    },
    /// Remove files from every endpoint and from the catalog.
    Remove {
        /// Logical file names.
        #[arg(required = true)]
        lfns: Vec<String>,
    },
    /// Remove the replicas held at one endpoint.
    RemoveReplica {
        /// Storage endpoint.
        se: String,
        /// Logical file names.
        #[arg(required = true)]
        lfns: Vec<String>,
        /// Only drop the catalog entries.
        #[arg(long, conflicts_with = "physical_only")]
        catalog_only: bool,
        /// Only delete the physical copies.
        #[arg(long)]
        physical_only: bool,
    },
    /// Show replica locations.
    Replicas {
        /// Logical file names.
        #[arg(required = true)]
        lfns: Vec<String>,
        /// Include problematic replicas.
        #[arg(long)]
        all: bool,
    },
    /// List a catalog directory.
    Ls {
        /// Catalog directory.
        path: String,
    },
}

/// Manager wired to the configured endpoints and the persisted catalog.
pub struct Session {
    manager: ReplicaManager,
    catalog: Arc<MemoryCatalog>,
    catalog_path: PathBuf,
}

impl Session {
    /// Load the configuration at `path` (defaults when missing) and open the catalog.
    pub fn open(path: &Path) -> Result<Self> {
        let live = if path.exists() {
            LiveConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?
        } else {
            tracing::warn!("Config file not found, using defaults: {}", path.display());
            LiveConfig::new(DmsConfig::default())
        };
        Self::with_config(live)
    }

    /// Build a session from an already loaded configuration.
    pub fn with_config(live: LiveConfig) -> Result<Self> {
        let config = live.snapshot();
        let catalog = Arc::new(
            MemoryCatalog::load(CATALOG_NAME, &config.catalog_path)
                .with_context(|| format!("opening catalog {}", config.catalog_path.display()))?,
        );

        let mut registry = StorageRegistry::new();
        for se in &config.storage_elements {
            let backend = LocalStorage::from_config(se);
            if !backend.is_valid() {
                tracing::warn!(se = %se.name, root = %se.root.display(), "storage root missing");
            }
            registry.register(Arc::new(backend));
        }
        tracing::debug!(endpoints = registry.len(), "storage registry built");

        let manager = ReplicaManager::new(
            CatalogSet::single(catalog.clone()),
            Arc::new(registry),
            Arc::new(live),
        )
        .with_accounting(Arc::new(TracingAccountingSink));

        Ok(Self {
            manager,
            catalog,
            catalog_path: config.catalog_path,
        })
    }

    /// The wired manager.
    pub fn manager(&self) -> &ReplicaManager {
        &self.manager
    }

    fn persist(&self) -> Result<()> {
        self.catalog
            .save(&self.catalog_path)
            .with_context(|| format!("saving catalog {}", self.catalog_path.display()))
    }
}

fn render<V: Serialize>(result: DmsResult<V>) -> serde_json::Value {
    envelope(&result)
}

impl Cli {
    /// Run the command and print its envelope.
    pub async fn run(self) -> Result<()> {
        let session = Session::open(&self.config)?;
        let output = self.command.execute(&session).await?;
        println!("{}", serde_json::to_string_pretty(&output)?);
        if output["OK"] != serde_json::Value::Bool(true) {
            anyhow::bail!("operation failed");
        }
        Ok(())
    }
}

impl Command {
    fn mutates_catalog(&self) -> bool {
        !matches!(
            self,
            Command::Get { .. } | Command::Replicas { .. } | Command::Ls { .. }
        ) && !matches!(self, Command::Put { no_register: true, .. })
    }

    /// Execute against `session` and return the result envelope.
    ///
    /// The catalog file is rewritten after commands that can change it.
    pub async fn execute(&self, session: &Session) -> Result<serde_json::Value> {
        let manager = session.manager();
        let output = match self {
            Command::Put {
                lfn,
                file,
                se,
                guid,
                checksum,
                no_register,
            } => {
                if *no_register {
                    render(manager.put(lfn, file, se, None).await)
                } else {
                    render(
                        manager
                            .put_and_register(
                                lfn,
                                file,
                                se,
                                guid.as_deref(),
                                checksum.as_deref(),
                                None,
                            )
                            .await,
                    )
                }
            }
            Command::Get { lfns, dest, se } => match se {
                Some(se) => render(manager.get_replica(se, lfns.clone(), dest, None).await),
                None => render(manager.get_file(lfns.clone(), dest, None).await),
            },
            Command::Replicate {
                lfns,
                dest,
                source,
                path,
            } => {
                let options = ReplicateOptions {
                    source_se: source.as_deref(),
                    dest_path: path.as_deref(),
                    catalog: None,
                };
                render(
                    manager
                        .replicate_and_register(lfns.clone(), dest, options)
                        .await,
                )
            }
            Command::RegisterReplica { lfn, pfn, se } => render(
                manager
                    .register_replica(Some(ReplicaEntry::new(lfn, pfn, se)), None)
                    .await,
            ),
            Command::Remove { lfns } => render(manager.remove_file(lfns.clone(), None).await),
            Command::RemoveReplica {
                se,
                lfns,
                catalog_only,
                physical_only,
            } => {
                if *catalog_only {
                    render(manager.remove_catalog_replica(se, lfns.clone(), None).await)
                } else if *physical_only {
                    render(manager.remove_physical_replica(se, lfns.clone(), None).await)
                } else {
                    render(manager.remove_replica(se, lfns.clone(), None).await)
                }
            }
            Command::Replicas { lfns, all } => {
                render(manager.get_catalog_replicas(lfns.clone(), *all, None).await)
            }
            Command::Ls { path } => {
                render(manager.get_catalog_list_directory(path.as_str(), None).await)
            }
        };
        if self.mutates_catalog() {
            session.persist()?;
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir) -> PathBuf {
        let root = dir.path();
        std::fs::create_dir_all(root.join("se-a")).unwrap();
        std::fs::create_dir_all(root.join("se-b")).unwrap();
        let config = format!(
            r#"
local_site = "TEST-SITE"
registration_protocol = "file"
third_party_protocols = ["file"]
catalog_path = "{catalog}"

[[storage_elements]]
name = "SE-A"
root = "{a}"
local = true

[[storage_elements]]
name = "SE-B"
root = "{b}"
"#,
            catalog = root.join("catalog.json").display(),
            a = root.join("se-a").display(),
            b = root.join("se-b").display(),
        );
        let path = root.join("dms.toml");
        std::fs::write(&path, config).unwrap();
        path
    }

    async fn exec(config: &Path, args: &[&str]) -> serde_json::Value {
        let mut argv = vec!["grid-dms", "--config", config.to_str().unwrap()];
        argv.extend_from_slice(args);
        let cli = Cli::try_parse_from(argv).unwrap();
        let session = Session::open(&cli.config).unwrap();
        cli.command.execute(&session).await.unwrap()
    }

    #[test]
    fn test_parse_remove_replica_flags() {
        let cli = Cli::try_parse_from([
            "grid-dms",
            "remove-replica",
            "SE-A",
            "/grid/vo/a",
            "--catalog-only",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("/etc/gridrm/dms.toml"));
        match cli.command {
            Command::RemoveReplica {
                se,
                lfns,
                catalog_only,
                physical_only,
            } => {
                assert_eq!(se, "SE-A");
                assert_eq!(lfns, vec!["/grid/vo/a".to_string()]);
                assert!(catalog_only);
                assert!(!physical_only);
            }
            _ => panic!("wrong subcommand"),
        }
    }

    #[test]
    fn test_parse_rejects_conflicting_flags() {
        let parsed = Cli::try_parse_from([
            "grid-dms",
            "remove-replica",
            "SE-A",
            "/grid/vo/a",
            "--catalog-only",
            "--physical-only",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_get_requires_lfn() {
        assert!(Cli::try_parse_from(["grid-dms", "get"]).is_err());
    }

    #[tokio::test]
    async fn test_put_replicate_remove_session() {
        let dir = TempDir::new().unwrap();
        let config = write_config(&dir);
        let local = dir.path().join("payload.dat");
        std::fs::write(&local, b"event data").unwrap();

        let put = exec(&config, &["put", "/grid/vo/run1.dat", local.to_str().unwrap(), "SE-A"]).await;
        assert_eq!(put["OK"], true);
        assert!(put["Value"]["Successful"]["/grid/vo/run1.dat"].is_object());
        assert!(dir.path().join("se-a/grid/vo/run1.dat").is_file());
        assert!(dir.path().join("catalog.json").is_file());

        let replicated = exec(&config, &["replicate", "/grid/vo/run1.dat", "--dest", "SE-B"]).await;
        assert_eq!(replicated["OK"], true);
        assert!(replicated["Value"]["Failed"].as_object().unwrap().is_empty());
        assert_eq!(
            std::fs::read(dir.path().join("se-b/grid/vo/run1.dat")).unwrap(),
            b"event data"
        );

        let replicas = exec(&config, &["replicas", "/grid/vo/run1.dat"]).await;
        let at = replicas["Value"]["Successful"]["/grid/vo/run1.dat"]
            .as_object()
            .unwrap();
        assert!(at.contains_key("SE-A"));
        assert!(at.contains_key("SE-B"));

        let listing = exec(&config, &["ls", "/grid/vo"]).await;
        assert_eq!(listing["OK"], true);

        let removed = exec(&config, &["remove", "/grid/vo/run1.dat"]).await;
        assert_eq!(removed["Value"]["Successful"]["/grid/vo/run1.dat"], true);
        assert!(!dir.path().join("se-a/grid/vo/run1.dat").exists());
        assert!(!dir.path().join("se-b/grid/vo/run1.dat").exists());

        let after = exec(&config, &["replicas", "/grid/vo/run1.dat"]).await;
        assert!(after["Value"]["Failed"]
            .as_object()
            .unwrap()
            .contains_key("/grid/vo/run1.dat"));
    }

    #[tokio::test]
    async fn test_get_downloads_into_dest() {
        let dir = TempDir::new().unwrap();
        let config = write_config(&dir);
        let local = dir.path().join("payload.dat");
        std::fs::write(&local, b"calibration").unwrap();
        exec(&config, &["put", "/grid/vo/calib.dat", local.to_str().unwrap(), "SE-B"]).await;

        let out = dir.path().join("out");
        let got = exec(
            &config,
            &["get", "/grid/vo/calib.dat", "--dest", out.to_str().unwrap()],
        )
        .await;
        assert_eq!(got["OK"], true);
        assert_eq!(std::fs::read(out.join("calib.dat")).unwrap(), b"calibration");
    }

    #[tokio::test]
    async fn test_missing_config_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let live = LiveConfig::new(DmsConfig {
            catalog_path: dir.path().join("catalog.json"),
            ..DmsConfig::default()
        });
        let session = Session::with_config(live).unwrap();
        let out = Command::Replicas {
            lfns: vec!["/grid/vo/none".to_string()],
            all: false,
        }
        .execute(&session)
        .await
        .unwrap();
        assert_eq!(out["OK"], true);
        assert!(!dir.path().join("catalog.json").exists());
    }
}
