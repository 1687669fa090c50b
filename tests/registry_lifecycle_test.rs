//! Device construction, registration and shutdown on a server.

mod common;

use common::{client_for, dummy, TestServer};
use pqn_stack::device::drivers::dummy::DummyConfig;
use pqn_stack::device::drivers::rotator::RotatorConfig;
use pqn_stack::device::drivers::{DriverContext, DriverType};
use pqn_stack::device::registry::{DeviceConfig, DeviceRegistry};
use pqn_stack::device::{CallArgs, DeviceStatus};
use pqn_stack::PqnError;
use serde_json::json;
use std::time::Duration;
use tracing_test::traced_test;

fn broken(name: &str) -> DeviceConfig {
    DeviceConfig::new(
        name,
        DriverType::Dummy(DummyConfig {
            fail_on_start: true,
            ..Default::default()
        }),
    )
}

#[tokio::test]
#[traced_test]
async fn test_failed_construction_is_never_registered() {
    let registry = DeviceRegistry::new();
    let mut disabled = dummy("spare");
    disabled.enabled = false;

    let registered = registry
        .register_all(
            &[dummy("good"), broken("bad"), disabled],
            &DriverContext::default(),
        )
        .await;

    assert_eq!(registered, vec!["good".to_string()]);
    assert!(registry.contains("good"));
    assert!(!registry.contains("bad"));
    assert!(!registry.contains("spare"));
    assert!(matches!(registry.get("bad"), Err(PqnError::NotFound(_))));
    assert!(logs_contain("Device construction failed"));

    registry.shutdown().await;
}

#[tokio::test]
async fn test_failed_device_invisible_to_clients() {
    let server = TestServer::start("lab-a", vec![dummy("good"), broken("bad")]).await;
    let client = client_for(&[&server], Duration::from_secs(2));

    let names: Vec<String> = client
        .list_devices("lab-a")
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.name)
        .collect();
    assert_eq!(names, vec!["good".to_string()]);
    assert!(matches!(
        client.get_device("lab-a", "bad").await,
        Err(PqnError::NotFound(_))
    ));

    client.shutdown().await;
    server.stop().await;
}

#[tokio::test]
async fn test_duplicate_name_rejected() {
    let registry = DeviceRegistry::new();
    let ctx = DriverContext::default();

    registry.register(dummy("d1"), &ctx).await.unwrap();
    let err = registry.register(dummy("d1"), &ctx).await.unwrap_err();
    assert!(matches!(err, PqnError::AlreadyRegistered(_)));
    assert_eq!(registry.len(), 1);

    registry.shutdown().await;
}

#[tokio::test]
async fn test_unregister_and_shutdown_close_devices() {
    let registry = DeviceRegistry::new();
    let ctx = DriverContext::default();
    registry.register(dummy("d1"), &ctx).await.unwrap();
    registry
        .register(
            DeviceConfig::new("rot", DriverType::Rotator(RotatorConfig::default())),
            &ctx,
        )
        .await
        .unwrap();

    let d1 = registry.get("d1").unwrap();
    registry.unregister("d1").await.unwrap();
    assert_eq!(d1.status(), DeviceStatus::Off);
    assert!(!registry.contains("d1"));

    let rot = registry.get("rot").unwrap();
    let moved = registry
        .dispatch("rot", "move_to", CallArgs::positional(vec![json!(9.0)]))
        .await
        .unwrap();
    assert_eq!(moved, json!(9.0));

    registry.shutdown().await;
    assert!(registry.is_empty());
    assert_eq!(rot.status(), DeviceStatus::Off);
}
