//! Device Registry for the devices live on this host
//!
//! The registry maps unique device names to started [`Device`]s and is the
//! dispatch point for remote invocations. It holds only a short-lived map lock
//! for lookups; the per-device exclusivity lock inside each `Device` is the only
//! synchronisation that spans an operation, so calls to different devices run
//! in parallel.
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use pqn_stack::device::registry::{DeviceConfig, DeviceRegistry};
//! use pqn_stack::device::drivers::DriverType;
//!
//! let registry = DeviceRegistry::new();
//! let dummy = DeviceConfig::new("dummy", DriverType::Dummy(Default::default()));
//! registry.register(dummy, &ctx).await?;
//! let args = CallArgs::positional(vec![json!(21)]);
//! let doubled = registry.dispatch("dummy", "double_int", args).await?;
//! ```

use crate::device::drivers::{DriverContext, DriverType};
use crate::device::{BusyPolicy, CallArgs, Device, DeviceInfo, DeviceSpec, Driver};
use crate::error::{PqnError, PqnResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

// =============================================================================
// Device Configuration
// =============================================================================

/// Configuration for registering a device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique name (e.g., "polarimeter", "idler_hwp")
    pub name: String,
    /// Human-readable description
    #[serde(default)]
    pub desc: String,
    /// Hardware address (serial port, board id, host)
    #[serde(default)]
    pub address: String,
    /// Whether the device is created at startup
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Driver type and configuration
    pub driver: DriverType,
}

fn default_enabled() -> bool {
    true
}

impl DeviceConfig {
    /// Enabled device with empty description and address.
    pub fn new(name: impl Into<String>, driver: DriverType) -> Self {
        Self {
            name: name.into(),
            desc: String::new(),
            address: String::new(),
            enabled: true,
            driver,
        }
    }

    /// Identity part of the configuration.
    pub fn spec(&self) -> DeviceSpec {
        DeviceSpec::new(&self.name)
            .with_description(&self.desc)
            .with_address(&self.address)
    }
}

// =============================================================================
// Device Registry
// =============================================================================

/// Central registry of started devices, keyed by name
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, Arc<Device>>>,
    policy: BusyPolicy,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    /// Create an empty registry using the queueing busy policy
    pub fn new() -> Self {
        Self::with_policy(BusyPolicy::Queue)
    }

    /// Create an empty registry whose devices use `policy`
    pub fn with_policy(policy: BusyPolicy) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            policy,
        }
    }

    /// Build and start the driver described by `config`, then register it
    ///
    /// Returns an error if the name is taken or the driver fails to start; in
    /// both cases nothing is registered.
    pub async fn register(&self, config: DeviceConfig, ctx: &DriverContext) -> PqnResult<()> {
        let driver = config.driver.build(ctx)?;
        self.register_driver(config.spec(), driver).await
    }

    /// Start an already constructed driver and register it under `spec.name`
    pub async fn register_driver(
        &self,
        spec: DeviceSpec,
        driver: Box<dyn Driver>,
    ) -> PqnResult<()> {
        if self.contains(&spec.name) {
            return Err(PqnError::AlreadyRegistered(spec.name));
        }

        let device = Device::start(spec, driver, self.policy).await?;

        let name = device.name().to_string();
        let inserted = {
            let mut devices = self.devices.write();
            if devices.contains_key(&name) {
                false
            } else {
                devices.insert(name.clone(), Arc::clone(&device));
                true
            }
        };

        if !inserted {
            // Lost a race with a concurrent registration of the same name.
            if let Err(e) = device.close().await {
                warn!(device = %name, error = %e, "Failed to close duplicate device");
            }
            return Err(PqnError::AlreadyRegistered(name));
        }
        info!(device = %name, "Device registered");
        Ok(())
    }

    /// Register every enabled device in `configs`
    ///
    /// A device that fails to build or start is logged and skipped. Returns
    /// the names that were registered.
    pub async fn register_all(&self, configs: &[DeviceConfig], ctx: &DriverContext) -> Vec<String> {
        let mut registered = Vec::new();
        for config in configs.iter().filter(|c| c.enabled) {
            match self.register(config.clone(), ctx).await {
                Ok(()) => registered.push(config.name.clone()),
                Err(e) => warn!(
                    device = %config.name,
                    driver = config.driver.driver_name(),
                    error = %e,
                    "Device construction failed, not registering"
                ),
            }
        }
        registered
    }

    /// Look up a device by name
    pub fn get(&self, name: &str) -> PqnResult<Arc<Device>> {
        self.devices
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| PqnError::NotFound(format!("device '{}' not found", name)))
    }

    /// Check if a device is registered
    pub fn contains(&self, name: &str) -> bool {
        self.devices.read().contains_key(name)
    }

    /// Registered device names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.devices.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Snapshot of every registered device, sorted by name
    pub fn list_devices(&self) -> Vec<DeviceInfo> {
        let devices: Vec<Arc<Device>> = self.devices.read().values().cloned().collect();
        let mut infos: Vec<DeviceInfo> = devices.iter().map(|d| d.info()).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Number of registered devices
    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    /// Invoke `operation` on device `name`
    pub async fn dispatch(&self, name: &str, operation: &str, args: CallArgs) -> PqnResult<Value> {
        let device = self.get(name)?;
        device.invoke(operation, args).await
    }

    /// Remove a device and close it
    ///
    /// The device disappears from lookups first, so new requests fail with
    /// `NotFound`; the in-flight operation (if any) finishes before the
    /// hardware is released.
    pub async fn unregister(&self, name: &str) -> PqnResult<()> {
        let device = self
            .devices
            .write()
            .remove(name)
            .ok_or_else(|| PqnError::NotFound(format!("device '{}' not found", name)))?;
        info!(device = %name, "Device unregistered");
        device.close().await
    }

    /// Unregister and close every device
    pub async fn shutdown(&self) {
        let devices: Vec<Arc<Device>> = self.devices.write().drain().map(|(_, d)| d).collect();
        for device in devices {
            if let Err(e) = device.close().await {
                warn!(device = %device.name(), error = %e, "Device failed to close cleanly");
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
