//! Remote calls behave like local ones: same values, same error kinds.

mod common;

use common::{client_for, dummy, TestServer};
use pqn_stack::config::ClientConfig;
use pqn_stack::device::drivers::rotator::RotatorConfig;
use pqn_stack::device::drivers::DriverType;
use pqn_stack::device::registry::DeviceConfig;
use pqn_stack::device::{Arguments, CallArgs, DeviceClass, DeviceStatus};
use pqn_stack::network::{Client, StaticDirectory};
use pqn_stack::PqnError;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn test_ping_and_discovery() {
    let server = TestServer::start("lab-a", vec![dummy("d1"), dummy("d2")]).await;
    let client = client_for(&[&server], Duration::from_secs(2));

    let reply = assert_ok!(client.ping("lab-a").await);
    assert_eq!(reply.server, "lab-a");
    assert_eq!(reply.devices, 2);
    assert_eq!(reply.sessions, 1);

    let devices = client.list_devices("lab-a").await.unwrap();
    let names: Vec<_> = devices.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, vec!["d1", "d2"]);

    let remote = client.get_device("lab-a", "d1").await.unwrap();
    assert_eq!(remote.name(), "d1");
    assert_eq!(remote.server(), "lab-a");
    assert_eq!(remote.description().class, DeviceClass::Testing);
    assert!(remote.has_operation("double_int"));
    assert!(!remote.has_operation("launch"));

    client.shutdown().await;
    server.stop().await;
}

#[tokio::test]
async fn test_values_round_trip_unchanged() {
    let server = TestServer::start("lab-a", vec![dummy("d1")]).await;
    let client = client_for(&[&server], Duration::from_secs(2));
    let remote = client.get_device("lab-a", "d1").await.unwrap();

    let values = vec![
        json!(7),
        json!(-2.5),
        json!("text"),
        json!(true),
        Value::Null,
        json!([1, 2, 3]),
        json!({"a": [1.5, 2.5], "b": "x"}),
    ];
    for value in values {
        let echoed = remote
            .call("echo", Arguments::new().arg(&value))
            .await
            .unwrap();
        assert_eq!(echoed, value);
    }

    let counted = remote
        .call(
            "count_args",
            Arguments::new().arg(1).arg("two").kwarg("three", 3.0),
        )
        .await
        .unwrap();
    assert_eq!(counted, json!({"args": 2, "kwargs": ["three"]}));

    let local = server
        .registry
        .dispatch("d1", "double_int", CallArgs::positional(vec![json!(21)]))
        .await
        .unwrap();
    let doubled = remote
        .call("double_int", Arguments::new().arg(21))
        .await
        .unwrap();
    assert_eq!(doubled, local);
    assert_eq!(doubled, json!(42));

    remote
        .call("set_param_str", Arguments::new().kwarg("value", "MiXeD"))
        .await
        .unwrap();
    let lowered: String = remote
        .call_as("lowercase_str", Arguments::new())
        .await
        .unwrap();
    assert_eq!(lowered, "mixed");

    client.shutdown().await;
    server.stop().await;
}

#[tokio::test]
async fn test_unknown_operation_leaves_device_untouched() {
    let server = TestServer::start("lab-a", vec![dummy("d1")]).await;
    let client = client_for(&[&server], Duration::from_secs(2));
    let remote = client.get_device("lab-a", "d1").await.unwrap();

    let err = remote.call("launch", Arguments::new()).await.unwrap_err();
    assert!(matches!(err, PqnError::NotFound(ref msg) if msg.contains("launch")));

    let info = remote.info().await.unwrap();
    assert_eq!(info.status, DeviceStatus::Ready);
    assert_eq!(server.registry.get("d1").unwrap().status(), DeviceStatus::Ready);

    client.shutdown().await;
    server.stop().await;
}

#[tokio::test]
async fn test_unknown_device_and_server() {
    let server = TestServer::start("lab-a", vec![dummy("d1")]).await;
    let client = client_for(&[&server], Duration::from_secs(2));

    assert!(matches!(
        client.get_device("lab-a", "ghost").await,
        Err(PqnError::NotFound(_))
    ));
    assert!(matches!(
        client.get_device("lab-z", "d1").await,
        Err(PqnError::UnknownServer(_))
    ));

    client.shutdown().await;
    server.stop().await;
}

#[tokio::test]
async fn test_hardware_fault_moves_device_to_error() {
    let server = TestServer::start("lab-a", vec![dummy("d1")]).await;
    let client = client_for(&[&server], Duration::from_secs(2));
    let remote = client.get_device("lab-a", "d1").await.unwrap();

    let err = remote
        .call("fail", Arguments::new().arg("argument"))
        .await
        .unwrap_err();
    assert!(matches!(err, PqnError::InvalidArgument(_)));
    assert_eq!(remote.info().await.unwrap().status, DeviceStatus::Ready);

    let err = remote
        .call("fail", Arguments::new().arg("hardware"))
        .await
        .unwrap_err();
    assert!(err.is_hardware_fault());
    assert_eq!(remote.info().await.unwrap().status, DeviceStatus::Error);

    let err = remote.call("param_int", Arguments::new()).await.unwrap_err();
    assert!(matches!(err, PqnError::NotReady(_)));

    client.shutdown().await;
    server.stop().await;
}

#[tokio::test]
async fn test_deadline_produces_timeout() {
    let server = TestServer::start("lab-a", vec![dummy("d1")]).await;
    let client = client_for(&[&server], Duration::from_secs(2));
    let remote = client
        .get_device("lab-a", "d1")
        .await
        .unwrap()
        .with_timeout(Duration::from_millis(50));

    let err = remote
        .call("sleep_ms", Arguments::new().arg(200))
        .await
        .unwrap_err();
    assert!(matches!(err, PqnError::Timeout(d) if d == Duration::from_millis(50)));

    // The server finishes the call; the device is usable afterwards.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let remote = remote.with_timeout(Duration::from_secs(2));
    assert_ok!(remote.call("param_int", Arguments::new()).await);

    client.shutdown().await;
    server.stop().await;
}

#[tokio::test]
async fn test_unserializable_argument_rejected_before_sending() {
    let server = TestServer::start("lab-a", vec![dummy("d1")]).await;
    let client = client_for(&[&server], Duration::from_secs(2));
    let remote = client.get_device("lab-a", "d1").await.unwrap();

    let too_deep = json!([[[1]]]);
    let err = assert_err!(remote.call("echo", Arguments::new().arg(too_deep)).await);
    assert!(matches!(err, PqnError::Serialization(_)));

    client.shutdown().await;
    server.stop().await;
}

#[tokio::test]
async fn test_shut_down_client_fails_with_connection_error() {
    let server = TestServer::start("lab-a", vec![dummy("d1")]).await;
    let client = client_for(&[&server], Duration::from_secs(2));
    let remote = client.get_device("lab-a", "d1").await.unwrap();

    client.shutdown().await;
    assert!(matches!(
        remote.call("param_int", Arguments::new()).await,
        Err(PqnError::Connection(_))
    ));

    server.stop().await;
}

#[tokio::test]
async fn test_client_reconnects_after_idle_close() {
    let server = TestServer::start_with(
        "lab-a",
        vec![dummy("d1")],
        Default::default(),
        Duration::from_millis(100),
        Default::default(),
    )
    .await;
    let client = client_for(&[&server], Duration::from_secs(2));

    assert_ok!(client.ping("lab-a").await);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(server.registry.len(), 1);

    let reply = assert_ok!(client.ping("lab-a").await);
    assert_eq!(reply.devices, 1);

    client.shutdown().await;
    server.stop().await;
}

#[tokio::test]
async fn test_unreachable_angle_is_a_structured_error() {
    let rotator = DeviceConfig::new("hwp", DriverType::Rotator(RotatorConfig::default()));
    let server = TestServer::start("lab-a", vec![rotator]).await;
    let client = client_for(&[&server], Duration::from_secs(1));
    let remote = client.get_device("lab-a", "hwp").await.unwrap();

    let err = remote
        .call("move_to", Arguments::new().arg(1e300))
        .await
        .unwrap_err();
    assert!(matches!(err, PqnError::InvalidArgument(_)), "got {:?}", err);

    let degrees: f64 = remote.call_as("degrees", Arguments::new()).await.unwrap();
    assert_eq!(degrees, 0.0);

    client.shutdown().await;
    server.stop().await;
}

#[tokio::test]
async fn test_panicking_handler_still_answers() {
    let server = TestServer::start_with(
        "lab-a",
        vec![dummy("d1")],
        Default::default(),
        Duration::from_millis(150),
        Default::default(),
    )
    .await;
    let caller = client_for(&[&server], Duration::from_secs(1));
    let remote = caller.get_device("lab-a", "d1").await.unwrap();

    let err = remote
        .call("fail", Arguments::new().arg("panic"))
        .await
        .unwrap_err();
    assert!(matches!(err, PqnError::Internal(_)), "got {:?}", err);
    assert_eq!(remote.info().await.unwrap().status, DeviceStatus::Ready);
    assert_ok!(remote.call("param_int", Arguments::new()).await);

    // The caller's session still reaches its idle timeout.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let observer = client_for(&[&server], Duration::from_secs(1));
    let reply = assert_ok!(observer.ping("lab-a").await);
    assert_eq!(reply.sessions, 1);

    observer.shutdown().await;
    caller.shutdown().await;
    server.stop().await;
}

#[tokio::test]
async fn test_unreachable_server_does_not_stall_other_calls() {
    let server = TestServer::start("lab-a", vec![dummy("d1")]).await;
    let directory = StaticDirectory::new()
        .with_entry("lab-a", server.address.clone())
        .with_entry("blackhole", "10.255.255.1:9");
    let client = Client::new(
        Arc::new(directory),
        ClientConfig {
            timeout: Duration::from_millis(200),
            connect_timeout: Duration::from_secs(10),
        },
    );

    let started = Instant::now();
    let stalled = {
        let client = client.clone();
        tokio::spawn(async move { client.ping("blackhole").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_ok!(client.ping("lab-a").await);
    assert!(started.elapsed() < Duration::from_millis(500));

    // The call deadline covers connecting, not just the exchange.
    let err = stalled.await.unwrap().unwrap_err();
    assert!(
        matches!(err, PqnError::Timeout(_) | PqnError::Connection(_)),
        "got {:?}",
        err
    );
    assert!(started.elapsed() < Duration::from_secs(1));

    client.shutdown().await;
    server.stop().await;
}
