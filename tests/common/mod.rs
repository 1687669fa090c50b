//! Shared harness: in-process device servers on ephemeral ports.

#![allow(dead_code)]

use pqn_stack::config::ClientConfig;
use pqn_stack::device::drivers::dummy::DummyConfig;
use pqn_stack::device::drivers::{DriverContext, DriverType};
use pqn_stack::device::registry::{DeviceConfig, DeviceRegistry};
use pqn_stack::device::BusyPolicy;
use pqn_stack::network::{Client, DeviceServer, StaticDirectory};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct TestServer {
    pub name: String,
    pub address: String,
    pub registry: Arc<DeviceRegistry>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(name: &str, devices: Vec<DeviceConfig>) -> Self {
        Self::start_with(
            name,
            devices,
            BusyPolicy::Queue,
            Duration::from_secs(300),
            DriverContext::default(),
        )
        .await
    }

    pub async fn start_with(
        name: &str,
        devices: Vec<DeviceConfig>,
        policy: BusyPolicy,
        idle_timeout: Duration,
        ctx: DriverContext,
    ) -> Self {
        let registry = Arc::new(DeviceRegistry::with_policy(policy));
        registry.register_all(&devices, &ctx).await;

        let server = DeviceServer::bind("127.0.0.1:0", name, registry.clone())
            .await
            .unwrap()
            .with_idle_timeout(idle_timeout);
        let address = server.local_addr().unwrap().to_string();
        let shutdown = server.shutdown_token();
        let task = tokio::spawn(async move {
            server.run().await.unwrap();
        });

        Self {
            name: name.to_string(),
            address,
            registry,
            shutdown,
            task,
        }
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.task.await;
        self.registry.shutdown().await;
    }
}

pub fn client_for(servers: &[&TestServer], timeout: Duration) -> Client {
    let mut directory = StaticDirectory::new();
    for server in servers {
        directory.insert(server.name.clone(), server.address.clone());
    }
    Client::new(
        Arc::new(directory),
        ClientConfig {
            timeout,
            connect_timeout: Duration::from_secs(1),
        },
    )
}

pub fn dummy(name: &str) -> DeviceConfig {
    DeviceConfig::new(name, DriverType::Dummy(DummyConfig::default()))
}
