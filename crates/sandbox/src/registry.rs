//! Driver registry.
//!
//! Drivers are registered at startup under their own name. Sandboxes record
//! the driver name and version that produced them, and later operations look
//! the driver up by that recorded name.

use dashmap::DashMap;
use std::sync::Arc;

use workspace_sandbox_core::{Error, Result};

use crate::driver::OverlayDriver;

/// Name-keyed set of available overlay drivers.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: DashMap<String, Arc<dyn OverlayDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver, replacing any previous driver with the same name.
    pub fn register(&self, driver: Arc<dyn OverlayDriver>) -> Option<Arc<dyn OverlayDriver>> {
        let name = driver.name().to_string();
        tracing::info!(
            driver = %name,
            version = %driver.version(),
            "Overlay driver registered"
        );
        self.drivers.insert(name, driver)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn OverlayDriver>> {
        self.drivers.get(name).map(|d| d.value().clone())
    }

    /// Find a driver by name, optionally pinned to an exact version.
    pub fn resolve(&self, name: &str, version: Option<&str>) -> Result<Arc<dyn OverlayDriver>> {
        let driver = self.get(name).ok_or_else(|| {
            Error::Config(format!(
                "overlay driver '{}' is not registered (available: {})",
                name,
                self.names().join(", ")
            ))
        })?;

        if let Some(wanted) = version {
            if driver.version() != wanted {
                return Err(Error::Config(format!(
                    "overlay driver '{}' has version {}, {} required",
                    name,
                    driver.version(),
                    wanted
                )));
            }
        }
        Ok(driver)
    }

    /// Registered driver names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.drivers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }
}
