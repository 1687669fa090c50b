//! Proxies for devices hosted on other servers.

use crate::device::{Arguments, DeviceInfo};
use crate::error::{PqnError, PqnResult};
use crate::network::client::Client;
use crate::network::protocol::{DeviceDescription, InvokeRequest};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;

/// Handle to a device hosted on another server.
///
/// Calls look like local operations: arguments are validated before any I/O,
/// and remote failures come back as the same [`PqnError`] variant the server
/// raised.
#[derive(Debug, Clone)]
pub struct RemoteDevice {
    client: Client,
    server: String,
    description: DeviceDescription,
    timeout: Duration,
}

impl RemoteDevice {
    pub(crate) fn new(client: Client, server: &str, description: DeviceDescription) -> Self {
        let timeout = client.timeout();
        Self {
            client,
            server: server.to_string(),
            description,
            timeout,
        }
    }

    /// Device name on its server.
    pub fn name(&self) -> &str {
        &self.description.name
    }

    /// Server name the proxy was resolved through.
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Description fetched when the proxy was created.
    pub fn description(&self) -> &DeviceDescription {
        &self.description
    }

    /// Operation names advertised when the proxy was created.
    pub fn operations(&self) -> &[String] {
        &self.description.operations
    }

    /// Whether `operation` was advertised.
    pub fn has_operation(&self, operation: &str) -> bool {
        self.description.operations.iter().any(|op| op == operation)
    }

    /// Per-call deadline.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Same proxy with a different per-call deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Invoke `operation` remotely and return its result value.
    pub async fn call(&self, operation: &str, args: Arguments) -> PqnResult<Value> {
        let (args, kwargs) = args.into_parts()?;
        let call = InvokeRequest {
            device: self.description.name.clone(),
            operation: operation.to_string(),
            args,
            kwargs,
            timeout_ms: None,
        };
        self.client.invoke(&self.server, call, self.timeout).await
    }

    /// [`call`](Self::call), decoding the result into `T`.
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        operation: &str,
        args: Arguments,
    ) -> PqnResult<T> {
        let value = self.call(operation, args).await?;
        serde_json::from_value(value).map_err(|e| {
            PqnError::Serialization(format!(
                "result of '{}' on '{}': {}",
                operation, self.description.name, e
            ))
        })
    }

    /// Fresh status snapshot from the server.
    pub async fn info(&self) -> PqnResult<DeviceInfo> {
        self.client.device_info(&self.server, &self.description.name).await
    }
}
