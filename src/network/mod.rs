//! Networking: wire format, device server and remote client.

pub mod client;
pub mod directory;
pub mod frame;
pub mod protocol;
pub mod proxy;
pub mod server;
pub mod session;

pub use client::Client;
pub use directory::{Directory, StaticDirectory};
pub use protocol::{ControlRequest, ControlResponse, DeviceDescription, ErrorBody, PingReply};
pub use proxy::RemoteDevice;
pub use server::DeviceServer;
pub use session::SessionManager;
