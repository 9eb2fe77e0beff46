//! Data management configuration and the live view the engine reads from.
//!
//! Banned source and target lists are operational switches toggled by staff to
//! drain faulty endpoints. The engine reads them through [`ConfigSource`] at the
//! start of every operation and never keeps a copy between calls.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{DmsError, DmsResult};

/// One storage endpoint served from a local directory tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageElementConfig {
    /// Endpoint name.
    pub name: String,
    /// Root directory holding the endpoint's files.
    pub root: PathBuf,
    /// Whether the endpoint is at the caller's site.
    #[serde(default)]
    pub local: bool,
    /// Protocols the endpoint can serve.
    #[serde(default = "default_local_protocols")]
    pub protocols: Vec<String>,
}

fn default_local_protocols() -> Vec<String> {
    vec!["file".to_string()]
}

/// Data management configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DmsConfig {
    /// Site name recorded as the source of accounting records.
    pub local_site: String,
    /// Protocol PFNs are canonicalized to before registration.
    pub registration_protocol: String,
    /// Protocols usable for third-party transfer.
    pub third_party_protocols: Vec<String>,
    /// Endpoints that may not be used as replication sources.
    pub banned_sources: Vec<String>,
    /// Endpoints that may not be used as replication targets.
    pub banned_targets: Vec<String>,
    /// Deadline for side-channel calls, in seconds.
    pub rpc_timeout_secs: u64,
    /// Pin lifetime used when none is given, in seconds.
    pub default_pin_lifetime_secs: u64,
    /// Protocol label written into accounting records.
    pub accounting_protocol: String,
    /// JSON file holding the catalog state (binary only).
    pub catalog_path: PathBuf,
    /// Local storage endpoints (binary only).
    pub storage_elements: Vec<StorageElementConfig>,
}

impl Default for DmsConfig {
    fn default() -> Self {
        Self {
            local_site: String::from("Unknown"),
            registration_protocol: String::from("srm"),
            third_party_protocols: vec![String::from("srm")],
            banned_sources: Vec::new(),
            banned_targets: Vec::new(),
            rpc_timeout_secs: 120,
            default_pin_lifetime_secs: 60 * 60 * 24,
            accounting_protocol: String::from("ReplicaManager"),
            catalog_path: PathBuf::from("/var/lib/gridrm/catalog.json"),
            storage_elements: Vec::new(),
        }
    }
}

impl DmsConfig {
    /// Load a configuration file; the format is chosen by extension (`toml` or `json`).
    pub fn from_file(path: &Path) -> DmsResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| DmsError::Config {
                reason: format!("{}: {}", path.display(), e),
            }),
            "json" => serde_json::from_str(&contents).map_err(|e| DmsError::Config {
                reason: format!("{}: {}", path.display(), e),
            }),
            _ => Err(DmsError::Config {
                reason: format!("unsupported config file extension: {}", ext),
            }),
        }
    }

    /// Side-channel deadline.
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    /// Default pin lifetime.
    pub fn default_pin_lifetime(&self) -> Duration {
        Duration::from_secs(self.default_pin_lifetime_secs)
    }
}

/// Source of configuration values that may change between operations.
pub trait ConfigSource: Send + Sync {
    /// Current copy of the whole configuration.
    fn snapshot(&self) -> DmsConfig;

    /// Endpoints currently banned as replication sources.
    fn banned_sources(&self) -> Vec<String> {
        self.snapshot().banned_sources
    }

    /// Endpoints currently banned as replication targets.
    fn banned_targets(&self) -> Vec<String> {
        self.snapshot().banned_targets
    }
}

/// Hot-reloadable configuration shared between the engine and operators.
#[derive(Debug)]
pub struct LiveConfig {
    current: RwLock<DmsConfig>,
    version: AtomicU64,
    path: Option<PathBuf>,
}

impl LiveConfig {
    /// Wrap an in-memory configuration.
    pub fn new(config: DmsConfig) -> Self {
        Self {
            current: RwLock::new(config),
            version: AtomicU64::new(1),
            path: None,
        }
    }

    /// Load from a file and remember the path for [`LiveConfig::reload`].
    pub fn from_file(path: &Path) -> DmsResult<Self> {
        let config = DmsConfig::from_file(path)?;
        Ok(Self {
            current: RwLock::new(config),
            version: AtomicU64::new(1),
            path: Some(path.to_path_buf()),
        })
    }

    /// Monotonic version, bumped on every change.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Re-read the backing file. Returns true if the contents changed.
    pub fn reload(&self) -> DmsResult<bool> {
        let path = self.path.as_ref().ok_or_else(|| DmsError::Config {
            reason: "no backing file to reload from".to_string(),
        })?;
        let fresh = DmsConfig::from_file(path)?;
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if *current == fresh {
            debug!(path = %path.display(), "configuration unchanged");
            return Ok(false);
        }
        *current = fresh;
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        info!(path = %path.display(), version, "configuration reloaded");
        Ok(true)
    }

    /// Apply an in-place change.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut DmsConfig),
    {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut current);
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    /// Add an endpoint to the banned-source list.
    pub fn ban_source(&self, se: &str) {
        self.update(|c| {
            if !c.banned_sources.iter().any(|s| s == se) {
                c.banned_sources.push(se.to_string());
            }
        });
        info!(se, "storage endpoint banned as source");
    }

    /// Add an endpoint to the banned-target list.
    pub fn ban_target(&self, se: &str) {
        self.update(|c| {
            if !c.banned_targets.iter().any(|s| s == se) {
                c.banned_targets.push(se.to_string());
            }
        });
        info!(se, "storage endpoint banned as target");
    }

    /// Lift both bans for an endpoint.
    pub fn unban(&self, se: &str) {
        self.update(|c| {
            c.banned_sources.retain(|s| s != se);
            c.banned_targets.retain(|s| s != se);
        });
        info!(se, "storage endpoint bans lifted");
    }
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self::new(DmsConfig::default())
    }
}

impl ConfigSource for LiveConfig {
    fn snapshot(&self) -> DmsConfig {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn banned_sources(&self) -> Vec<String> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .banned_sources
            .clone()
    }

    fn banned_targets(&self) -> Vec<String> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .banned_targets
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = DmsConfig::default();
        assert_eq!(config.local_site, "Unknown");
        assert_eq!(config.registration_protocol, "srm");
        assert_eq!(config.third_party_protocols, vec!["srm"]);
        assert_eq!(config.rpc_timeout(), Duration::from_secs(120));
        assert_eq!(config.default_pin_lifetime(), Duration::from_secs(86400));
        assert!(config.banned_sources.is_empty());
        assert!(config.banned_targets.is_empty());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
local_site = "LCG.CERN.ch"
banned_targets = ["RAL-DST"]
third_party_protocols = ["srm", "gsiftp"]

[[storage_elements]]
name = "CERN-USER"
root = "/data/cern"
local = true
            "#
        )
        .unwrap();

        let config = DmsConfig::from_file(file.path()).unwrap();
        assert_eq!(config.local_site, "LCG.CERN.ch");
        assert_eq!(config.banned_targets, vec!["RAL-DST"]);
        assert_eq!(config.third_party_protocols, vec!["srm", "gsiftp"]);
        assert_eq!(config.registration_protocol, "srm");
        assert_eq!(config.storage_elements.len(), 1);
        assert!(config.storage_elements[0].local);
        assert_eq!(config.storage_elements[0].protocols, vec!["file"]);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{"local_site": "LCG.PIC.es", "banned_sources": ["PIC-USER"], "rpc_timeout_secs": 5}}"#
        )
        .unwrap();

        let config = DmsConfig::from_file(file.path()).unwrap();
        assert_eq!(config.local_site, "LCG.PIC.es");
        assert_eq!(config.banned_sources, vec!["PIC-USER"]);
        assert_eq!(config.rpc_timeout_secs, 5);
    }

    #[test]
    fn test_from_file_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        let err = DmsConfig::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("unsupported config file extension"));
    }

    #[test]
    fn test_live_bans_are_visible_immediately() {
        let live = LiveConfig::default();
        assert!(live.banned_targets().is_empty());
        let v0 = live.version();

        live.ban_target("CNAF-DST");
        live.ban_target("CNAF-DST");
        live.ban_source("IN2P3-DST");
        assert_eq!(live.banned_targets(), vec!["CNAF-DST"]);
        assert_eq!(live.banned_sources(), vec!["IN2P3-DST"]);
        assert!(live.version() > v0);

        live.unban("CNAF-DST");
        assert!(live.banned_targets().is_empty());
    }

    #[test]
    fn test_reload_detects_changes() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        write!(file, r#"{{"banned_sources": []}}"#).unwrap();
        let live = LiveConfig::from_file(file.path()).unwrap();
        assert!(!live.reload().unwrap());

        std::fs::write(file.path(), r#"{"banned_sources": ["GRIDKA-DST"]}"#).unwrap();
        assert!(live.reload().unwrap());
        assert_eq!(live.banned_sources(), vec!["GRIDKA-DST"]);
    }

    #[test]
    fn test_reload_without_file() {
        let live = LiveConfig::default();
        assert!(live.reload().is_err());
    }
}
