use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::path::PathAlgebra;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub sandbox: SandboxConfig,
    pub governance: GovernanceConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub sqlite_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            sqlite_path: PathBuf::from("/var/lib/workspace-sandbox/sandboxes.db"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SandboxConfig {
    /// Driver used for new sandboxes.
    pub default_driver: String,
    /// Exact driver version to require at startup, if pinned.
    pub driver_version: Option<String>,
    /// Root under which drivers keep per-sandbox upper/work/merged directories.
    pub overlay_base_dir: PathBuf,
    /// Fixed for the lifetime of the process.
    pub case_sensitive_paths: bool,
    pub allow_resume: bool,
    pub orphan_grace_secs: u64,
    pub reconcile_interval_secs: u64,
    pub telemetry_interval_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            default_driver: "overlayfs".into(),
            driver_version: None,
            overlay_base_dir: PathBuf::from("/var/lib/workspace-sandbox/overlays"),
            case_sensitive_paths: true,
            allow_resume: true,
            orphan_grace_secs: 300,
            reconcile_interval_secs: 60,
            telemetry_interval_secs: 30,
        }
    }
}

impl SandboxConfig {
    pub fn path_algebra(&self) -> PathAlgebra {
        PathAlgebra::new(self.case_sensitive_paths)
    }

    pub fn orphan_grace(&self) -> Duration {
        Duration::from_secs(self.orphan_grace_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry_interval_secs.max(1))
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct GovernanceConfig {
    pub json_logs: bool,
    /// Serve Prometheus metrics on this address when set.
    pub metrics_listen: Option<SocketAddr>,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("SANDBOX_ENV").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            .add_source(File::with_name("config/local").required(false))
            // Map APP__SANDBOX__ALLOW_RESUME=false to sandbox.allow_resume
            .add_source(Environment::with_prefix("APP").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.store.backend, StoreBackend::Sqlite);
        assert_eq!(cfg.sandbox.default_driver, "overlayfs");
        assert!(cfg.sandbox.case_sensitive_paths);
        assert!(cfg.sandbox.allow_resume);
        assert_eq!(cfg.sandbox.orphan_grace(), Duration::from_secs(300));
        assert!(cfg.governance.metrics_listen.is_none());
    }

    #[test]
    fn test_partial_source_keeps_defaults() {
        let cfg: AppConfig = Config::builder()
            .add_source(File::from_str(
                "[sandbox]\ndefault_driver = \"mock\"\ncase_sensitive_paths = false\n\n[store]\nbackend = \"memory\"\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(cfg.store.backend, StoreBackend::Memory);
        assert_eq!(cfg.sandbox.default_driver, "mock");
        assert!(!cfg.sandbox.path_algebra().is_case_sensitive());
        assert_eq!(cfg.sandbox.reconcile_interval_secs, 60);
    }
}
