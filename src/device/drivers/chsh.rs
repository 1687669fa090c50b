//! CHSH measurement coordinator.
//!
//! A proxy device with no hardware of its own: `measure_chsh` drives two (or
//! four) remote waveplate rotators and a remote time tagger through the
//! process-wide [`Client`], collects sixteen coincidence counts and reduces
//! them to the CHSH value `S = -E(a,b) + E(a,b') + E(a',b) + E(a',b')`.
//!
//! Remote devices are resolved on first use, so the coordinator can be
//! configured before the servers hosting its devices are up.

use crate::device::{Arguments, CallArgs, DeviceClass, Driver, OperationRegistry};
use crate::error::{PqnError, PqnResult};
use crate::network::{Client, RemoteDevice};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Location of a device on some server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRef {
    /// Server name, resolved through the directory.
    pub server: String,
    /// Device name on that server.
    pub device: String,
}

/// Coordinator settings: where the optics and the counter live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChshConfig {
    /// Half-wave plate in the idler arm.
    pub idler_hwp: RemoteRef,
    /// Half-wave plate in the signal arm.
    pub signal_hwp: RemoteRef,
    /// Optional quarter-wave plate in the idler arm, parked at 0.
    #[serde(default)]
    pub idler_qwp: Option<RemoteRef>,
    /// Optional quarter-wave plate in the signal arm, parked at 0.
    #[serde(default)]
    pub signal_qwp: Option<RemoteRef>,
    /// Coincidence counter.
    pub timetagger: RemoteRef,
    /// Pause after moving the plates, before counting.
    #[serde(default = "default_settle", with = "humantime_serde")]
    pub settle: Duration,
}

fn default_settle() -> Duration {
    Duration::from_secs(2)
}

/// Per-call measurement parameters, passed as the third argument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementConfig {
    /// Integration time per setting, in nanoseconds.
    pub duration_ns: u64,
    /// Coincidence window in picoseconds.
    #[serde(default = "default_window_ps")]
    pub window_ps: u64,
    /// Time tagger channel of the idler detector.
    #[serde(default = "default_channel1")]
    pub channel1: u8,
    /// Time tagger channel of the signal detector.
    #[serde(default = "default_channel2")]
    pub channel2: u8,
    /// Dark counts per setting subtracted from the totals.
    #[serde(default)]
    pub dark_count: u64,
}

fn default_window_ps() -> u64 {
    500
}

fn default_channel1() -> u8 {
    1
}

fn default_channel2() -> u8 {
    2
}

/// Outcome of one CHSH run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChshResult {
    /// Completion time, RFC 3339.
    pub timestamp: String,
    /// Idler analysis angles, degrees.
    pub basis1: Vec<f64>,
    /// Signal analysis angles, degrees.
    pub basis2: Vec<f64>,
    /// The CHSH value S.
    pub chsh_value: f64,
    /// Propagated counting error of S.
    pub chsh_error: f64,
    /// E for (a,b), (a,b'), (a',b), (a',b').
    pub expectation_values: Vec<f64>,
    /// Counting error of each expectation value.
    pub expectation_errors: Vec<f64>,
    /// Raw coincidence counts, four per expectation value.
    pub counts: Vec<u64>,
}

// =============================================================================
// Statistics
// =============================================================================

/// Correlation `(c0 - c1 - c2 + c3) / (sum - 4 * dark)` of one basis pair.
///
/// `counts` are ordered (0,0), (0,45), (45,0), (45,45) in half-wave plate offsets.
pub fn expectation_value(counts: &[u64; 4], dark_count: u64) -> PqnResult<f64> {
    let denominator = corrected_total(counts, dark_count)?;
    let numerator = counts[0] as f64 - counts[1] as f64 - counts[2] as f64 + counts[3] as f64;
    Ok(numerator / denominator)
}

/// Poisson counting error of [`expectation_value`].
pub fn expectation_error(counts: &[u64; 4], dark_count: u64) -> PqnResult<f64> {
    let corrected = corrected_total(counts, dark_count)?;
    let total: f64 = counts.iter().map(|&c| c as f64).sum();
    let spread = (counts[0] as f64 + counts[3] as f64 - counts[1] as f64 - counts[2] as f64).abs();

    let first = total.sqrt() / corrected;
    let second = spread / corrected.powi(2) * (total + 4.0 * dark_count as f64).sqrt();
    Ok(first + second)
}

fn corrected_total(counts: &[u64; 4], dark_count: u64) -> PqnResult<f64> {
    let total: f64 = counts.iter().map(|&c| c as f64).sum();
    let corrected = total - 4.0 * dark_count as f64;
    if corrected <= 0.0 {
        return Err(PqnError::InvalidArgument(format!(
            "{} coincidences with dark count {} leave no signal",
            total, dark_count
        )));
    }
    Ok(corrected)
}

/// `S = -E0 + E1 + E2 + E3`.
pub fn chsh_value(expectations: &[f64; 4]) -> f64 {
    -expectations[0] + expectations[1] + expectations[2] + expectations[3]
}

/// Errors of independent terms added in quadrature.
pub fn combined_error(errors: &[f64]) -> f64 {
    errors.iter().map(|e| e * e).sum::<f64>().sqrt()
}

/// Half-wave plate angle analysing a linear basis at `basis` degrees.
fn basis_to_hwp(basis: f64) -> f64 {
    basis / 2.0
}

// =============================================================================
// Driver
// =============================================================================

struct Optics {
    idler_hwp: RemoteDevice,
    signal_hwp: RemoteDevice,
    idler_qwp: Option<RemoteDevice>,
    signal_qwp: Option<RemoteDevice>,
    timetagger: RemoteDevice,
}

struct ChshState {
    config: ChshConfig,
    client: Client,
    optics: OnceCell<Optics>,
    completed: AtomicU64,
}

impl ChshState {
    async fn resolve(&self, target: &RemoteRef) -> PqnResult<RemoteDevice> {
        self.client.get_device(&target.server, &target.device).await
    }

    async fn resolve_optional(
        &self,
        target: &Option<RemoteRef>,
    ) -> PqnResult<Option<RemoteDevice>> {
        match target {
            Some(target) => Ok(Some(self.resolve(target).await?)),
            None => Ok(None),
        }
    }

    async fn optics(&self) -> PqnResult<&Optics> {
        self.optics
            .get_or_try_init(|| async {
                let c = &self.config;
                let optics = Optics {
                    idler_hwp: self.resolve(&c.idler_hwp).await?,
                    signal_hwp: self.resolve(&c.signal_hwp).await?,
                    idler_qwp: self.resolve_optional(&c.idler_qwp).await?,
                    signal_qwp: self.resolve_optional(&c.signal_qwp).await?,
                    timetagger: self.resolve(&c.timetagger).await?,
                };
                info!("CHSH devices resolved");
                Ok::<Optics, PqnError>(optics)
            })
            .await
    }

    async fn settle(&self, args: &CallArgs) -> PqnResult<()> {
        tokio::select! {
            _ = tokio::time::sleep(self.config.settle) => Ok(()),
            _ = args.cancel_token().cancelled() => {
                Err(PqnError::Cancelled("CHSH measurement cancelled".to_string()))
            }
        }
    }

    /// Four coincidence counts for one pair of half-wave plate angles.
    async fn count_settings(
        &self,
        optics: &Optics,
        idler: f64,
        signal: f64,
        measurement: &MeasurementConfig,
        args: &CallArgs,
    ) -> PqnResult<[u64; 4]> {
        let integration = Duration::from_nanos(measurement.duration_ns);
        let tagger = optics
            .timetagger
            .clone()
            .with_timeout(optics.timetagger.timeout() + integration);

        let mut counts = [0u64; 4];
        let settings = [(0.0, 0.0), (0.0, 45.0), (45.0, 0.0), (45.0, 45.0)];
        for (slot, (idler_offset, signal_offset)) in settings.iter().enumerate() {
            args.ensure_not_cancelled()?;

            optics
                .idler_hwp
                .call("move_to", Arguments::new().arg(idler + idler_offset))
                .await?;
            optics
                .signal_hwp
                .call("move_to", Arguments::new().arg(signal + signal_offset))
                .await?;
            for qwp in [&optics.idler_qwp, &optics.signal_qwp].into_iter().flatten() {
                qwp.call("move_to", Arguments::new().arg(0.0)).await?;
            }
            self.settle(args).await?;

            counts[slot] = tagger
                .call_as(
                    "measure_coincidence",
                    Arguments::new()
                        .arg(measurement.channel1)
                        .arg(measurement.channel2)
                        .arg(measurement.window_ps)
                        .arg(measurement.duration_ns),
                )
                .await?;
            debug!(
                idler = idler + idler_offset,
                signal = signal + signal_offset,
                count = counts[slot],
                "Coincidences"
            );
        }
        Ok(counts)
    }

    async fn measure_chsh(
        &self,
        basis1: Vec<f64>,
        basis2: Vec<f64>,
        measurement: MeasurementConfig,
        args: &CallArgs,
    ) -> PqnResult<ChshResult> {
        if basis1.len() != 2 || basis2.len() != 2 {
            return Err(PqnError::InvalidArgument(format!(
                "each basis needs exactly 2 angles, got {} and {}",
                basis1.len(),
                basis2.len()
            )));
        }
        if measurement.duration_ns == 0 {
            return Err(PqnError::InvalidArgument(
                "duration_ns must be positive".to_string(),
            ));
        }

        let optics = self.optics().await?;

        let mut expectation_values = [0.0; 4];
        let mut expectation_errors = Vec::with_capacity(4);
        let mut all_counts = Vec::with_capacity(16);
        let mut term = 0;
        for &a in &basis1 {
            for &b in &basis2 {
                let counts = self
                    .count_settings(optics, basis_to_hwp(a), basis_to_hwp(b), &measurement, args)
                    .await?;
                expectation_values[term] = expectation_value(&counts, measurement.dark_count)?;
                expectation_errors.push(expectation_error(&counts, measurement.dark_count)?);
                all_counts.extend_from_slice(&counts);
                term += 1;
            }
        }

        self.completed.fetch_add(1, Ordering::Relaxed);
        Ok(ChshResult {
            timestamp: Utc::now().to_rfc3339(),
            basis1,
            basis2,
            chsh_value: chsh_value(&expectation_values),
            chsh_error: combined_error(&expectation_errors),
            expectation_values: expectation_values.to_vec(),
            expectation_errors,
            counts: all_counts,
        })
    }
}

/// CHSH coordinator driver.
pub struct ChshDriver {
    state: Arc<ChshState>,
    operations: OperationRegistry,
}

impl ChshDriver {
    /// Coordinator reaching its devices through `client`.
    pub fn new(config: ChshConfig, client: Client) -> Self {
        let state = Arc::new(ChshState {
            config,
            client,
            optics: OnceCell::new(),
            completed: AtomicU64::new(0),
        });

        let mut ops = OperationRegistry::new();
        ops.register("measure_chsh", &state, |s, args| async move {
            let basis1: Vec<f64> = args.get(0, "basis1")?;
            let basis2: Vec<f64> = args.get(1, "basis2")?;
            let measurement: MeasurementConfig = args.get(2, "config")?;
            s.measure_chsh(basis1, basis2, measurement, &args).await
        });

        Self {
            state,
            operations: ops,
        }
    }
}

#[async_trait]
impl Driver for ChshDriver {
    fn class(&self) -> DeviceClass {
        DeviceClass::Proxy
    }

    fn operations(&self) -> &OperationRegistry {
        &self.operations
    }

    async fn start(&self) -> PqnResult<()> {
        info!("CHSH coordinator started");
        Ok(())
    }

    async fn close(&self) -> PqnResult<()> {
        info!("CHSH coordinator closed");
        Ok(())
    }

    fn hardware_status(&self) -> BTreeMap<String, Value> {
        BTreeMap::from([
            (
                "devices_resolved".to_string(),
                json!(self.state.optics.initialized()),
            ),
            (
                "measurements_completed".to_string(),
                json!(self.state.completed.load(Ordering::Relaxed)),
            ),
        ])
    }
}
