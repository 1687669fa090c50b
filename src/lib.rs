//! # PQN Stack
//!
//! Distributed control of quantum-optics lab instruments. Each lab node runs a
//! device server that owns local hardware (polarimeters, time taggers, rotation
//! mounts) and exposes every instrument's operations over the network. Clients,
//! including devices that coordinate other devices, call those operations
//! through proxies that behave like local objects.
//!
//! ## Crate Structure
//!
//! - **`config`**: node configuration loaded with Figment from TOML and `PQN_`
//!   environment variables.
//! - **`device`**: the `Driver` trait, the `Device` wrapper that tracks status and
//!   serializes calls, the per-server `DeviceRegistry`, and the concrete drivers.
//! - **`error`**: `PqnError`, shared by local and remote calls.
//! - **`logging`**: `tracing` subscriber setup.
//! - **`network`**: the binary wire protocol, the `DeviceServer`, and the client
//!   side (`Client`, `RemoteDevice`).
//! - **`signal`**: the moving-average `SignalBuffer` and background sampling of
//!   analog inputs.

pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod network;
pub mod signal;

pub use error::{PqnError, PqnResult};
