//! Time tagger: single-channel count rates and two-channel coincidences.
//!
//! Counts are simulated from per-channel Poisson-like rates, but the timing
//! contract is the real one: a measurement occupies the device for its full
//! duration and stops early when the caller cancels.

use crate::device::{CallArgs, DeviceClass, Driver, OperationRegistry};
use crate::error::{PqnError, PqnResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Time tagger settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeTaggerConfig {
    /// Number of input channels, numbered from 1.
    pub channels: u8,
    /// Mean singles rate per channel, counts per second.
    pub singles_rate_hz: f64,
    /// Fraction of singles on one channel that pair with the other within the window.
    pub pair_fraction: f64,
    /// Longest accepted measurement, in nanoseconds.
    pub max_duration_ns: u64,
}

impl Default for TimeTaggerConfig {
    fn default() -> Self {
        Self {
            channels: 8,
            singles_rate_hz: 100_000.0,
            pair_fraction: 0.05,
            max_duration_ns: 60_000_000_000,
        }
    }
}

impl TimeTaggerConfig {
    /// Check the settings are physically meaningful.
    pub fn validate(&self) -> Result<(), String> {
        if self.channels == 0 {
            return Err("time tagger needs at least one channel".to_string());
        }
        if !(self.singles_rate_hz.is_finite() && self.singles_rate_hz >= 0.0) {
            return Err(format!("invalid singles rate {}", self.singles_rate_hz));
        }
        if !(0.0..=1.0).contains(&self.pair_fraction) {
            return Err(format!(
                "pair fraction must be within [0, 1], got {}",
                self.pair_fraction
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct TaggerState {
    config: TimeTaggerConfig,
    input_delays_ps: Mutex<BTreeMap<u8, i64>>,
    last_countrates: Mutex<Vec<u64>>,
    last_window_ps: Mutex<u64>,
}

/// Draw a count with the given mean, spread like shot noise.
fn noisy_count(mean: f64) -> u64 {
    if mean <= 0.0 {
        return 0;
    }
    let spread = mean.sqrt();
    let jitter = rand::thread_rng().gen_range(-spread..=spread);
    (mean + jitter).round().max(0.0) as u64
}

impl TaggerState {
    fn check_channel(&self, channel: u8) -> PqnResult<()> {
        if channel == 0 || channel > self.config.channels {
            return Err(PqnError::InvalidArgument(format!(
                "channel {} out of range 1..={}",
                channel, self.config.channels
            )));
        }
        Ok(())
    }

    fn check_duration(&self, duration_ns: u64) -> PqnResult<Duration> {
        if duration_ns == 0 {
            return Err(PqnError::InvalidArgument(
                "duration must be positive".to_string(),
            ));
        }
        if duration_ns > self.config.max_duration_ns {
            return Err(PqnError::InvalidArgument(format!(
                "duration {} ns exceeds the maximum of {} ns",
                duration_ns, self.config.max_duration_ns
            )));
        }
        Ok(Duration::from_nanos(duration_ns))
    }

    /// Hold the device for `duration`, or until the caller cancels.
    async fn integrate(&self, duration: Duration, args: &CallArgs) -> PqnResult<()> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = args.cancel_token().cancelled() => Err(PqnError::Cancelled(
                "measurement cancelled".to_string(),
            )),
        }
    }

    async fn measure_countrate(
        &self,
        channels: Vec<u8>,
        duration_ns: u64,
        args: &CallArgs,
    ) -> PqnResult<Vec<u64>> {
        if channels.is_empty() {
            return Err(PqnError::InvalidArgument(
                "at least one channel is required".to_string(),
            ));
        }
        for &channel in &channels {
            self.check_channel(channel)?;
        }
        let duration = self.check_duration(duration_ns)?;

        self.integrate(duration, args).await?;

        let mean = self.config.singles_rate_hz * duration.as_secs_f64();
        let counts: Vec<u64> = channels.iter().map(|_| noisy_count(mean)).collect();
        *self.last_countrates.lock() = counts.clone();
        Ok(counts)
    }

    async fn measure_coincidence(
        &self,
        channel_a: u8,
        channel_b: u8,
        window_ps: u64,
        duration_ns: u64,
        args: &CallArgs,
    ) -> PqnResult<u64> {
        self.check_channel(channel_a)?;
        self.check_channel(channel_b)?;
        if channel_a == channel_b {
            return Err(PqnError::InvalidArgument(format!(
                "coincidence channels must differ, got {} twice",
                channel_a
            )));
        }
        if window_ps == 0 {
            return Err(PqnError::InvalidArgument(
                "coincidence window must be positive".to_string(),
            ));
        }
        let duration = self.check_duration(duration_ns)?;

        self.integrate(duration, args).await?;

        let secs = duration.as_secs_f64();
        let singles = self.config.singles_rate_hz;
        let pairs = singles * self.config.pair_fraction * secs;
        // Accidentals: R_a * R_b * window * T.
        let accidentals = singles * singles * (window_ps as f64 * 1e-12) * secs;
        *self.last_window_ps.lock() = window_ps;
        Ok(noisy_count(pairs + accidentals))
    }
}

/// Time tagger driver.
pub struct TimeTaggerDriver {
    state: Arc<TaggerState>,
    operations: OperationRegistry,
}

impl TimeTaggerDriver {
    /// Build the driver and its operation table.
    pub fn new(config: TimeTaggerConfig) -> PqnResult<Self> {
        config.validate().map_err(PqnError::Configuration)?;

        let state = Arc::new(TaggerState {
            config,
            input_delays_ps: Mutex::new(BTreeMap::new()),
            last_countrates: Mutex::new(Vec::new()),
            last_window_ps: Mutex::new(0),
        });

        let mut ops = OperationRegistry::new();
        ops.register("measure_countrate", &state, |s, args| async move {
            let channels: Vec<u8> = args.get(0, "channels")?;
            let duration_ns: u64 = args.get(1, "duration_ns")?;
            s.measure_countrate(channels, duration_ns, &args).await
        })
        .register("measure_coincidence", &state, |s, args| async move {
            let channel_a: u8 = args.get(0, "ch_a")?;
            let channel_b: u8 = args.get(1, "ch_b")?;
            let window_ps: u64 = args.get(2, "window_ps")?;
            let duration_ns: u64 = args.get(3, "duration_ns")?;
            s.measure_coincidence(channel_a, channel_b, window_ps, duration_ns, &args)
                .await
        })
        .register("set_input_delay", &state, |s, args| async move {
            let channel: u8 = args.get(0, "channel")?;
            let delay_ps: i64 = args.get(1, "delay_ps")?;
            s.check_channel(channel)?;
            s.input_delays_ps.lock().insert(channel, delay_ps);
            debug!(channel, delay_ps, "Input delay set");
            Ok(())
        });

        Ok(Self {
            state,
            operations: ops,
        })
    }
}

#[async_trait]
impl Driver for TimeTaggerDriver {
    fn class(&self) -> DeviceClass {
        DeviceClass::TimeTagger
    }

    fn operations(&self) -> &OperationRegistry {
        &self.operations
    }

    async fn start(&self) -> PqnResult<()> {
        let mut delays = self.state.input_delays_ps.lock();
        for channel in 1..=self.state.config.channels {
            delays.insert(channel, 0);
        }
        info!(channels = self.state.config.channels, "Time tagger ready");
        Ok(())
    }

    async fn close(&self) -> PqnResult<()> {
        Ok(())
    }

    fn hardware_status(&self) -> BTreeMap<String, Value> {
        let channels: Vec<u8> = (1..=self.state.config.channels).collect();
        let delays: BTreeMap<String, i64> = self
            .state
            .input_delays_ps
            .lock()
            .iter()
            .map(|(ch, d)| (ch.to_string(), *d))
            .collect();
        BTreeMap::from([
            ("channels_in_use".to_string(), json!(channels)),
            ("input_delays_ps".to_string(), json!(delays)),
            (
                "last_countrates".to_string(),
                json!(*self.state.last_countrates.lock()),
            ),
            (
                "last_coincidence_window_ps".to_string(),
                json!(*self.state.last_window_ps.lock()),
            ),
        ])
    }
}
