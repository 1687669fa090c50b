//! Analog polarimeter: one signal buffer per photodiode channel.
//!
//! A [`Sampler`] task feeds the buffers from an [`AnalogInput`] at the
//! configured rate; operations only read or reset the buffers. `read` returns
//! the calibrated per-channel values in channel order, which consumers map back
//! to physical pins.

use crate::device::{DeviceClass, Driver, OperationRegistry};
use crate::error::{PqnError, PqnResult};
use crate::signal::{AnalogInput, Sampler, SignalBuffer, SimulatedAnalogInput};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Polarimeter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolarimeterConfig {
    /// Analog pins, in channel order.
    pub pins: Vec<u8>,
    /// Channel labels, parallel to `pins`.
    pub labels: Vec<String>,
    /// Samples per second per channel.
    pub sample_rate_hz: f64,
    /// Samples averaged per reading (buffer capacity).
    pub average_width: usize,
    /// Polarization angle seen by the simulated input, in degrees.
    pub simulated_angle_deg: f64,
    /// Noise amplitude of the simulated input.
    pub simulated_noise: f64,
}

impl Default for PolarimeterConfig {
    fn default() -> Self {
        Self {
            pins: vec![0, 1, 2, 3],
            labels: ["h", "v", "d", "a"].iter().map(|s| s.to_string()).collect(),
            sample_rate_hz: 10.0,
            average_width: 10,
            simulated_angle_deg: 0.0,
            simulated_noise: 0.01,
        }
    }
}

impl PolarimeterConfig {
    /// Check channel layout and sampling parameters.
    pub fn validate(&self) -> Result<(), String> {
        if self.pins.is_empty() {
            return Err("polarimeter needs at least one pin".to_string());
        }
        if self.labels.len() != self.pins.len() {
            return Err(format!(
                "{} labels given for {} pins",
                self.labels.len(),
                self.pins.len()
            ));
        }
        if self.average_width == 0 {
            return Err("average_width must be at least 1".to_string());
        }
        if !(self.sample_rate_hz.is_finite() && self.sample_rate_hz > 0.0) {
            return Err(format!("invalid sample rate {}", self.sample_rate_hz));
        }
        Ok(())
    }
}

/// One H/V/D/A reading with the derived polarization angle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PolarizationMeasurement {
    /// Horizontal channel.
    pub h: f64,
    /// Vertical channel.
    pub v: f64,
    /// Diagonal channel.
    pub d: f64,
    /// Anti-diagonal channel.
    pub a: f64,
    /// Polarization angle in degrees, `[0, 360)`.
    pub theta: f64,
}

/// Polarization angle from H/V/D/A intensities.
///
/// Linear polarization only determines the angle modulo 180 degrees; of the
/// two candidates the one closest to `last_theta` is reported, which keeps a
/// slowly rotating input continuous over the full circle.
pub fn polarization_angle(h: f64, v: f64, d: f64, a: f64, last_theta: f64) -> f64 {
    let s1 = if h + v > 0.0 { (h - v) / (h + v) } else { 0.0 };
    let s2 = if d + a > 0.0 { (d - a) / (d + a) } else { 0.0 };
    let base = (0.5 * s2.atan2(s1).to_degrees()).rem_euclid(180.0);

    let circular_distance = |x: f64| {
        let diff = (x - last_theta).rem_euclid(360.0);
        diff.min(360.0 - diff)
    };
    let flipped = base + 180.0;
    if circular_distance(flipped) < circular_distance(base) {
        flipped
    } else {
        base
    }
}

struct PolarimeterState {
    pins: Vec<u8>,
    labels: Vec<String>,
    buffers: Vec<Arc<SignalBuffer>>,
    input: Arc<dyn AnalogInput>,
    sample_rate_hz: f64,
    sampler: Mutex<Option<Sampler>>,
    last_theta: Mutex<f64>,
}

impl PolarimeterState {
    fn check_sampler(&self) -> PqnResult<()> {
        match self.sampler.lock().as_ref().and_then(Sampler::fault) {
            Some(fault) => Err(PqnError::HardwareIo(fault)),
            None => Ok(()),
        }
    }

    fn read(&self) -> PqnResult<Vec<f64>> {
        self.check_sampler()?;
        Ok(self.buffers.iter().map(|b| b.read()).collect())
    }

    fn read_polarization(&self) -> PqnResult<PolarizationMeasurement> {
        if self.buffers.len() != 4 {
            return Err(PqnError::InvalidArgument(format!(
                "polarization needs 4 channels, this polarimeter has {}",
                self.buffers.len()
            )));
        }
        let values = self.read()?;
        let (h, v, d, a) = (values[0], values[1], values[2], values[3]);

        let mut last = self.last_theta.lock();
        let theta = polarization_angle(h, v, d, a, *last);
        *last = theta;
        Ok(PolarizationMeasurement { h, v, d, a, theta })
    }

    fn reset(&self) {
        *self.last_theta.lock() = 0.0;
        for buffer in &self.buffers {
            buffer.clear();
        }
    }

    fn set_normalizing(&self, enabled: bool) {
        if enabled {
            self.reset();
        }
        for buffer in &self.buffers {
            buffer.set_normalizing(enabled);
        }
    }
}

/// Polarimeter driver.
pub struct PolarimeterDriver {
    state: Arc<PolarimeterState>,
    operations: OperationRegistry,
}

impl PolarimeterDriver {
    /// Polarimeter reading from the simulated analog input.
    pub fn new(config: PolarimeterConfig) -> PqnResult<Self> {
        let input = Arc::new(SimulatedAnalogInput::new(
            config.simulated_angle_deg,
            config.simulated_noise,
        ));
        Self::with_input(config, input)
    }

    /// Polarimeter reading from `input`.
    pub fn with_input(config: PolarimeterConfig, input: Arc<dyn AnalogInput>) -> PqnResult<Self> {
        config.validate().map_err(PqnError::Configuration)?;

        let buffers = config
            .pins
            .iter()
            .map(|_| SignalBuffer::new(config.average_width).map(Arc::new))
            .collect::<PqnResult<Vec<_>>>()?;

        let state = Arc::new(PolarimeterState {
            pins: config.pins,
            labels: config.labels,
            buffers,
            input,
            sample_rate_hz: config.sample_rate_hz,
            sampler: Mutex::new(None),
            last_theta: Mutex::new(0.0),
        });

        let mut ops = OperationRegistry::new();
        ops.register("read", &state, |s, _| async move { s.read() })
            .register("read_polarization", &state, |s, _| async move {
                s.read_polarization()
            })
            .register("reset", &state, |s, _| async move {
                s.reset();
                Ok(())
            })
            .register("start_normalizing", &state, |s, _| async move {
                s.set_normalizing(true);
                Ok(())
            })
            .register("stop_normalizing", &state, |s, _| async move {
                s.set_normalizing(false);
                Ok(())
            });

        Ok(Self {
            state,
            operations: ops,
        })
    }

    /// Buffer behind channel `index`, in channel order.
    pub fn buffer(&self, index: usize) -> Option<Arc<SignalBuffer>> {
        self.state.buffers.get(index).cloned()
    }
}

#[async_trait]
impl Driver for PolarimeterDriver {
    fn class(&self) -> DeviceClass {
        DeviceClass::Sensor
    }

    fn operations(&self) -> &OperationRegistry {
        &self.operations
    }

    async fn start(&self) -> PqnResult<()> {
        self.state.input.open().await?;

        let channels = self
            .state
            .pins
            .iter()
            .copied()
            .zip(self.state.buffers.iter().cloned())
            .collect();
        let sampler = Sampler::spawn(
            Arc::clone(&self.state.input),
            channels,
            self.state.sample_rate_hz,
        )?;
        *self.state.sampler.lock() = Some(sampler);
        info!(
            pins = ?self.state.pins,
            rate_hz = self.state.sample_rate_hz,
            "Polarimeter sampling started"
        );
        Ok(())
    }

    async fn close(&self) -> PqnResult<()> {
        let sampler = self.state.sampler.lock().take();
        if let Some(sampler) = sampler {
            sampler.stop().await;
        }
        self.state.input.close().await?;
        info!("Polarimeter stopped");
        Ok(())
    }

    fn hardware_status(&self) -> BTreeMap<String, Value> {
        let samples: BTreeMap<&str, usize> = self
            .state
            .labels
            .iter()
            .map(String::as_str)
            .zip(self.state.buffers.iter().map(|b| b.len()))
            .collect();
        let normalizing = self.state.buffers.iter().any(|b| b.is_normalizing());
        let fault = self.state.sampler.lock().as_ref().and_then(Sampler::fault);

        BTreeMap::from([
            ("channels".to_string(), json!(self.state.labels)),
            ("samples".to_string(), json!(samples)),
            ("normalizing".to_string(), json!(normalizing)),
            ("sampler_fault".to_string(), json!(fault)),
        ])
    }
}
