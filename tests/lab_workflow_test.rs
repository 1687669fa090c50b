//! Multi-server workflows on simulated hardware.

mod common;

use common::{client_for, TestServer};
use pqn_stack::device::drivers::chsh::{ChshConfig, ChshResult, RemoteRef};
use pqn_stack::device::drivers::polarimeter::{PolarimeterConfig, PolarizationMeasurement};
use pqn_stack::device::drivers::rotator::RotatorConfig;
use pqn_stack::device::drivers::timetagger::TimeTaggerConfig;
use pqn_stack::device::drivers::{DriverContext, DriverType};
use pqn_stack::device::registry::DeviceConfig;
use pqn_stack::device::{Arguments, BusyPolicy, DeviceStatus};
use pqn_stack::PqnError;
use serde_json::json;
use std::time::Duration;

fn fast_rotator(name: &str) -> DeviceConfig {
    DeviceConfig::new(
        name,
        DriverType::Rotator(RotatorConfig {
            speed_deg_per_s: 36_000.0,
            ..Default::default()
        }),
    )
}

fn remote(server: &str, device: &str) -> RemoteRef {
    RemoteRef {
        server: server.to_string(),
        device: device.to_string(),
    }
}

async fn optics_server() -> TestServer {
    TestServer::start(
        "optics",
        vec![
            fast_rotator("idler_hwp"),
            fast_rotator("signal_hwp"),
            DeviceConfig::new("tagger", DriverType::TimeTagger(TimeTaggerConfig::default())),
        ],
    )
    .await
}

async fn coordinator_server(optics: &TestServer) -> TestServer {
    let chsh = DeviceConfig::new(
        "chsh",
        DriverType::Chsh(ChshConfig {
            idler_hwp: remote("optics", "idler_hwp"),
            signal_hwp: remote("optics", "signal_hwp"),
            idler_qwp: None,
            signal_qwp: None,
            timetagger: remote("optics", "tagger"),
            settle: Duration::ZERO,
        }),
    );
    let ctx = DriverContext::with_client(client_for(&[optics], Duration::from_secs(5)));
    TestServer::start_with(
        "coordinator",
        vec![chsh],
        BusyPolicy::Queue,
        Duration::from_secs(300),
        ctx,
    )
    .await
}

#[tokio::test]
async fn test_chsh_through_two_servers() {
    let optics = optics_server().await;
    let coordinator = coordinator_server(&optics).await;
    let client = client_for(&[&optics, &coordinator], Duration::from_secs(20));

    let chsh = client.get_device("coordinator", "chsh").await.unwrap();
    let result: ChshResult = chsh
        .call_as(
            "measure_chsh",
            Arguments::new()
                .arg(vec![0.0, 45.0])
                .arg(vec![22.5, 67.5])
                .arg(json!({"duration_ns": 20_000_000, "window_ps": 1000})),
        )
        .await
        .unwrap();

    assert_eq!(result.basis1, vec![0.0, 45.0]);
    assert_eq!(result.basis2, vec![22.5, 67.5]);
    assert_eq!(result.counts.len(), 16);
    assert_eq!(result.expectation_values.len(), 4);
    assert_eq!(result.expectation_errors.len(), 4);
    assert!(result.chsh_value.is_finite());
    assert!(result.chsh_value.abs() <= 4.0);
    assert!(result.chsh_error >= 0.0);
    for e in &result.expectation_values {
        assert!((-1.0..=1.0).contains(e), "E out of range: {}", e);
    }

    // The last setting leaves the signal plate at b' / 2 + 45.
    let signal = client.get_device("optics", "signal_hwp").await.unwrap();
    let degrees: f64 = signal.call_as("degrees", Arguments::new()).await.unwrap();
    assert!((degrees - (67.5 / 2.0 + 45.0)).abs() < 1e-9);

    let info = chsh.info().await.unwrap();
    assert_eq!(info.status, DeviceStatus::Ready);
    assert_eq!(info.hardware_status["measurements_completed"], json!(1));

    client.shutdown().await;
    coordinator.stop().await;
    optics.stop().await;
}

#[tokio::test]
async fn test_chsh_rejects_malformed_basis() {
    let optics = optics_server().await;
    let coordinator = coordinator_server(&optics).await;
    let client = client_for(&[&coordinator], Duration::from_secs(5));

    let chsh = client.get_device("coordinator", "chsh").await.unwrap();
    let err = chsh
        .call(
            "measure_chsh",
            Arguments::new()
                .arg(vec![0.0])
                .arg(vec![22.5, 67.5])
                .arg(json!({"duration_ns": 1_000_000})),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PqnError::InvalidArgument(_)));
    assert_eq!(chsh.info().await.unwrap().status, DeviceStatus::Ready);

    client.shutdown().await;
    coordinator.stop().await;
    optics.stop().await;
}

#[tokio::test]
async fn test_chsh_reports_missing_remote_device() {
    let optics = TestServer::start("optics", vec![fast_rotator("idler_hwp")]).await;
    let coordinator = coordinator_server(&optics).await;
    let client = client_for(&[&coordinator], Duration::from_secs(5));

    let chsh = client.get_device("coordinator", "chsh").await.unwrap();
    let err = chsh
        .call(
            "measure_chsh",
            Arguments::new()
                .arg(vec![0.0, 45.0])
                .arg(vec![22.5, 67.5])
                .arg(json!({"duration_ns": 1_000_000})),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PqnError::NotFound(_)));

    client.shutdown().await;
    coordinator.stop().await;
    optics.stop().await;
}

#[tokio::test]
async fn test_remote_polarimeter_reading() {
    let polarimeter = DeviceConfig::new(
        "pol",
        DriverType::Polarimeter(PolarimeterConfig {
            sample_rate_hz: 200.0,
            average_width: 5,
            simulated_angle_deg: 30.0,
            simulated_noise: 0.0,
            ..Default::default()
        }),
    );
    let server = TestServer::start("lab-a", vec![polarimeter]).await;
    let client = client_for(&[&server], Duration::from_secs(5));
    let pol = client.get_device("lab-a", "pol").await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;

    let values: Vec<f64> = pol.call_as("read", Arguments::new()).await.unwrap();
    assert_eq!(values.len(), 4);
    assert!((values[0] - 0.75).abs() < 1e-9);
    assert!((values[1] - 0.25).abs() < 1e-9);

    let measurement: PolarizationMeasurement = pol
        .call_as("read_polarization", Arguments::new())
        .await
        .unwrap();
    assert!((measurement.theta - 30.0).abs() < 1e-6);

    pol.call("start_normalizing", Arguments::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let normalized: Vec<f64> = pol.call_as("read", Arguments::new()).await.unwrap();
    for value in normalized {
        assert!((0.0..=1.0).contains(&value));
    }
    pol.call("stop_normalizing", Arguments::new()).await.unwrap();

    let info = pol.info().await.unwrap();
    assert_eq!(info.hardware_status["normalizing"], json!(false));

    client.shutdown().await;
    server.stop().await;
}
