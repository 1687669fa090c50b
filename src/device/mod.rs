//! Uniform device abstraction over heterogeneous instruments.
//!
//! A [`Driver`] knows how to talk to one kind of hardware and exposes its
//! functionality as an [`OperationRegistry`]. A [`Device`] wraps a started
//! driver with identity, status tracking and the per-device exclusivity lock:
//! at most one operation runs against a device at a time, callers queue in
//! arrival order, and unrelated devices never wait on each other.
//!
//! Status machine:
//!
//! ```text
//! OFF --start--> READY --invoke--> BUSY --ok/error--> READY
//!                  |                 \--hardware fault--> ERROR
//!                  \--close--> OFF           ERROR --close--> OFF
//! ```

pub mod drivers;
pub mod operation;
pub mod registry;
pub mod value;

pub use operation::{CallArgs, OperationRegistry};
pub use registry::DeviceRegistry;
pub use value::Arguments;

use crate::error::{PqnError, PqnResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info};

/// Hardware category of a device. Fixed for the life of the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceClass {
    /// Analog or digital sensor (polarimeter, power meter).
    Sensor,
    /// Light or signal source.
    Source,
    /// Single-photon or intensity detector.
    Detector,
    /// Rotation or translation stage.
    Motor,
    /// Temperature controller.
    TempCtrl,
    /// Time-correlated counting electronics.
    TimeTagger,
    /// Device that coordinates other, possibly remote, devices.
    Proxy,
    /// Test instrument without hardware.
    Testing,
}

/// Lifecycle status of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceStatus {
    /// Not started, or closed.
    Off,
    /// Started and idle.
    Ready,
    /// An operation holds the exclusivity lock.
    Busy,
    /// A hardware fault occurred; only close and reconstruction recover.
    Error,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceStatus::Off => "OFF",
            DeviceStatus::Ready => "READY",
            DeviceStatus::Busy => "BUSY",
            DeviceStatus::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// What happens to a call that arrives while another one holds the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Wait for the lock; calls run strictly in arrival order.
    #[default]
    Queue,
    /// Fail at once with `NotReady`.
    Reject,
}

/// Identity of a device, fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSpec {
    /// Unique name on its server.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Hardware address (serial port, IP, board id).
    #[serde(default)]
    pub address: String,
}

impl DeviceSpec {
    /// Spec with an empty description and address.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            address: String::new(),
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the hardware address.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Check that the name can be addressed remotely.
    pub fn validate(&self) -> PqnResult<()> {
        if self.name.trim().is_empty() {
            return Err(PqnError::InvalidArgument(
                "device name must not be empty".to_string(),
            ));
        }
        if self.name.contains(':') {
            return Err(PqnError::InvalidArgument(format!(
                "device name '{}' must not contain ':'",
                self.name
            )));
        }
        Ok(())
    }
}

/// Read-only snapshot of a device, regenerated on every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Unique name on its server.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Hardware category.
    pub class: DeviceClass,
    /// Status at the time of the snapshot.
    pub status: DeviceStatus,
    /// Hardware address.
    pub address: String,
    /// Registered operation names, sorted.
    #[serde(default)]
    pub operations: Vec<String>,
    /// Driver-specific state (sample counts, positions, flags).
    #[serde(default)]
    pub hardware_status: BTreeMap<String, Value>,
}

/// Hardware-specific half of a device.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Hardware category.
    fn class(&self) -> DeviceClass;

    /// Operations exposed by this driver. Built once at construction.
    fn operations(&self) -> &OperationRegistry;

    /// Connect to the hardware. An error here means the device never exists.
    async fn start(&self) -> PqnResult<()>;

    /// Release the hardware.
    async fn close(&self) -> PqnResult<()>;

    /// Driver-specific status for [`DeviceInfo::hardware_status`].
    fn hardware_status(&self) -> BTreeMap<String, Value> {
        BTreeMap::new()
    }
}

/// A started driver with identity, status and exclusivity lock.
pub struct Device {
    spec: DeviceSpec,
    driver: Box<dyn Driver>,
    status: RwLock<DeviceStatus>,
    exclusive: Mutex<()>,
    policy: BusyPolicy,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.spec.name)
            .field("class", &self.driver.class())
            .field("status", &self.status())
            .field("policy", &self.policy)
            .finish()
    }
}

/// Restores `READY` when an operation ends, however it ends.
struct BusyGuard<'a> {
    status: &'a RwLock<DeviceStatus>,
    _lock: MutexGuard<'a, ()>,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let mut status = self.status.write();
        if *status == DeviceStatus::Busy {
            *status = DeviceStatus::Ready;
        }
    }
}

impl Device {
    /// Start `driver` and wrap it.
    ///
    /// Nothing is returned unless the driver started, so a device that failed
    /// to reach its hardware can never be registered.
    pub async fn start(
        spec: DeviceSpec,
        driver: Box<dyn Driver>,
        policy: BusyPolicy,
    ) -> PqnResult<Arc<Self>> {
        spec.validate()?;
        driver.start().await?;
        info!(device = %spec.name, class = ?driver.class(), "Device started");

        Ok(Arc::new(Self {
            spec,
            driver,
            status: RwLock::new(DeviceStatus::Ready),
            exclusive: Mutex::new(()),
            policy,
        }))
    }

    /// Unique device name.
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Identity of this device.
    pub fn spec(&self) -> &DeviceSpec {
        &self.spec
    }

    /// Hardware category.
    pub fn class(&self) -> DeviceClass {
        self.driver.class()
    }

    /// Current status.
    pub fn status(&self) -> DeviceStatus {
        *self.status.read()
    }

    /// Registered operation names, sorted.
    pub fn operation_names(&self) -> Vec<String> {
        self.driver.operations().names()
    }

    /// Whether `operation` is registered.
    pub fn has_operation(&self, operation: &str) -> bool {
        self.driver.operations().contains(operation)
    }

    /// Fresh snapshot of identity and status.
    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            name: self.spec.name.clone(),
            description: self.spec.description.clone(),
            class: self.driver.class(),
            status: self.status(),
            address: self.spec.address.clone(),
            operations: self.operation_names(),
            hardware_status: self.driver.hardware_status(),
        }
    }

    fn ensure_ready(&self) -> PqnResult<()> {
        match self.status() {
            DeviceStatus::Off | DeviceStatus::Error => Err(PqnError::NotReady(format!(
                "device '{}' is {}",
                self.spec.name,
                self.status()
            ))),
            DeviceStatus::Ready | DeviceStatus::Busy => Ok(()),
        }
    }

    async fn acquire(&self) -> PqnResult<MutexGuard<'_, ()>> {
        match self.policy {
            BusyPolicy::Queue => Ok(self.exclusive.lock().await),
            BusyPolicy::Reject => self.exclusive.try_lock().map_err(|_| {
                PqnError::NotReady(format!("device '{}' is BUSY", self.spec.name))
            }),
        }
    }

    /// Run `operation` under the exclusivity lock.
    ///
    /// Unknown operations and devices that are `OFF` or `ERROR` fail before
    /// the lock is taken and leave the status untouched. A `HardwareIo`
    /// failure moves the device to `ERROR`; every other outcome returns it to
    /// `READY`.
    pub async fn invoke(&self, operation: &str, args: CallArgs) -> PqnResult<Value> {
        self.ensure_ready()?;
        if !self.has_operation(operation) {
            return Err(PqnError::NotFound(format!(
                "operation '{}' not found in '{}'",
                operation, self.spec.name
            )));
        }

        let lock = self.acquire().await?;
        // The device may have been closed or faulted while this call queued.
        self.ensure_ready()?;

        *self.status.write() = DeviceStatus::Busy;
        let guard = BusyGuard {
            status: &self.status,
            _lock: lock,
        };

        let result = self
            .driver
            .operations()
            .invoke(&self.spec.name, operation, args)
            .await;

        if let Err(e) = &result {
            if e.is_hardware_fault() {
                *self.status.write() = DeviceStatus::Error;
                error!(
                    device = %self.spec.name,
                    operation,
                    error = %e,
                    "Device entered ERROR state"
                );
            }
        }
        drop(guard);

        result
    }

    /// Wait for the in-flight operation, then release the hardware.
    ///
    /// The device is `OFF` afterwards even if the driver fails to close
    /// cleanly; that failure is returned to the caller.
    pub async fn close(&self) -> PqnResult<()> {
        let _lock = self.exclusive.lock().await;
        if self.status() == DeviceStatus::Off {
            debug!(device = %self.spec.name, "Device already closed");
            return Ok(());
        }

        let result = self.driver.close().await;
        *self.status.write() = DeviceStatus::Off;
        info!(device = %self.spec.name, "Device closed");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::drivers::dummy::{DummyConfig, DummyDriver};
    use serde_json::json;
    use std::time::Duration;

    async fn dummy(name: &str, policy: BusyPolicy) -> Arc<Device> {
        let driver = DummyDriver::new(DummyConfig::default());
        Device::start(DeviceSpec::new(name), Box::new(driver), policy)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_sets_ready() {
        let device = dummy("dummy", BusyPolicy::Queue).await;
        assert_eq!(device.status(), DeviceStatus::Ready);
        let info = device.info();
        assert_eq!(info.class, DeviceClass::Testing);
        assert!(info.operations.contains(&"double_int".to_string()));
    }

    #[tokio::test]
    async fn test_failed_start_yields_nothing() {
        let driver = DummyDriver::new(DummyConfig {
            fail_on_start: true,
            ..Default::default()
        });
        let result =
            Device::start(DeviceSpec::new("broken"), Box::new(driver), BusyPolicy::Queue).await;
        assert!(matches!(result, Err(PqnError::HardwareIo(_))));
    }

    #[tokio::test]
    async fn test_invalid_names_rejected() {
        for name in ["", "a:b"] {
            let driver = DummyDriver::new(DummyConfig::default());
            let result =
                Device::start(DeviceSpec::new(name), Box::new(driver), BusyPolicy::Queue).await;
            assert!(matches!(result, Err(PqnError::InvalidArgument(_))));
        }
    }

    #[tokio::test]
    async fn test_unknown_operation_has_no_side_effects() {
        let device = dummy("dummy", BusyPolicy::Queue).await;
        let err = device.invoke("does_not_exist", CallArgs::empty()).await.unwrap_err();
        assert!(matches!(err, PqnError::NotFound(_)));
        assert_eq!(device.status(), DeviceStatus::Ready);
    }

    #[tokio::test]
    async fn test_hardware_fault_moves_to_error() {
        let device = dummy("dummy", BusyPolicy::Queue).await;
        let err = device
            .invoke("fail", CallArgs::positional(vec![json!("hardware")]))
            .await
            .unwrap_err();
        assert!(matches!(err, PqnError::HardwareIo(_)));
        assert_eq!(device.status(), DeviceStatus::Error);

        let err = device
            .invoke("double_int", CallArgs::positional(vec![json!(2)]))
            .await
            .unwrap_err();
        assert!(matches!(err, PqnError::NotReady(_)));

        device.close().await.unwrap();
        assert_eq!(device.status(), DeviceStatus::Off);
    }

    #[tokio::test]
    async fn test_validation_failure_keeps_ready() {
        let device = dummy("dummy", BusyPolicy::Queue).await;
        let err = device
            .invoke("fail", CallArgs::positional(vec![json!("argument")]))
            .await
            .unwrap_err();
        assert!(matches!(err, PqnError::InvalidArgument(_)));
        assert_eq!(device.status(), DeviceStatus::Ready);
    }

    #[tokio::test]
    async fn test_busy_reported_while_running() {
        let device = dummy("dummy", BusyPolicy::Queue).await;
        let running = {
            let device = Arc::clone(&device);
            tokio::spawn(async move {
                device
                    .invoke("sleep_ms", CallArgs::positional(vec![json!(100)]))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(device.info().status, DeviceStatus::Busy);

        running.await.unwrap().unwrap();
        assert_eq!(device.status(), DeviceStatus::Ready);
    }

    #[tokio::test]
    async fn test_reject_policy() {
        let device = dummy("dummy", BusyPolicy::Reject).await;
        let running = {
            let device = Arc::clone(&device);
            tokio::spawn(async move {
                device
                    .invoke("sleep_ms", CallArgs::positional(vec![json!(100)]))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        let err = device
            .invoke("double_int", CallArgs::positional(vec![json!(1)]))
            .await
            .unwrap_err();
        assert!(matches!(err, PqnError::NotReady(_)));
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_dropped_call_restores_ready() {
        let device = dummy("dummy", BusyPolicy::Queue).await;
        let result = tokio::time::timeout(
            Duration::from_millis(20),
            device.invoke("sleep_ms", CallArgs::positional(vec![json!(200)])),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(device.status(), DeviceStatus::Ready);
    }

    #[tokio::test]
    async fn test_close_waits_for_in_flight_operation() {
        let device = dummy("dummy", BusyPolicy::Queue).await;
        let running = {
            let device = Arc::clone(&device);
            tokio::spawn(async move {
                device
                    .invoke("sleep_ms", CallArgs::positional(vec![json!(80)]))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        device.close().await.unwrap();
        // The in-flight call completed before the device went OFF.
        assert!(running.await.unwrap().is_ok());
        assert_eq!(device.status(), DeviceStatus::Off);

        let err = device
            .invoke("double_int", CallArgs::positional(vec![json!(1)]))
            .await
            .unwrap_err();
        assert!(matches!(err, PqnError::NotReady(_)));
    }
}
