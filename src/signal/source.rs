//! Hardware sampling: the producer side of the signal buffers.
//!
//! An [`AnalogInput`] is polled by a [`Sampler`] task at a fixed rate and every
//! reading is pushed into the buffer registered for its pin. The sampler is the
//! only writer; device operations only ever read buffer snapshots.

use crate::error::{PqnError, PqnResult};
use crate::signal::SignalBuffer;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::f64::consts::PI;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Analog-to-digital input with numbered pins.
#[async_trait]
pub trait AnalogInput: Send + Sync {
    /// Connect to the hardware. Failure means the device cannot be constructed.
    async fn open(&self) -> PqnResult<()>;

    /// Read one sample from `pin`.
    async fn sample(&self, pin: u8) -> PqnResult<f64>;

    /// Release the hardware.
    async fn close(&self) -> PqnResult<()>;
}

/// Simulated polarization analyser feeding four photodiodes.
///
/// Pins `0..4` report the intensities behind H, V, D and A polarizers for
/// light linearly polarized at `angle_deg`, plus uniform noise. Other pins
/// report pure noise.
#[derive(Debug)]
pub struct SimulatedAnalogInput {
    angle_deg: Mutex<f64>,
    noise: f64,
    fail_after: Option<u64>,
    samples_taken: Mutex<u64>,
}

impl SimulatedAnalogInput {
    /// Input observing light polarized at `angle_deg` with `noise` amplitude.
    pub fn new(angle_deg: f64, noise: f64) -> Self {
        Self {
            angle_deg: Mutex::new(angle_deg),
            noise: noise.abs(),
            fail_after: None,
            samples_taken: Mutex::new(0),
        }
    }

    /// Make every sample after the first `samples` fail with a hardware error.
    pub fn failing_after(mut self, samples: u64) -> Self {
        self.fail_after = Some(samples);
        self
    }

    /// Rotate the simulated input polarization.
    pub fn set_angle(&self, angle_deg: f64) {
        *self.angle_deg.lock() = angle_deg;
    }

    fn intensity(&self, pin: u8) -> f64 {
        let theta = *self.angle_deg.lock() * PI / 180.0;
        let ideal = match pin {
            0 => theta.cos().powi(2),
            1 => theta.sin().powi(2),
            2 => (theta - PI / 4.0).cos().powi(2),
            3 => (theta - PI / 4.0).sin().powi(2),
            _ => 0.0,
        };
        let jitter = if self.noise > 0.0 {
            rand::thread_rng().gen_range(-self.noise..=self.noise)
        } else {
            0.0
        };
        (ideal + jitter).max(0.0)
    }
}

#[async_trait]
impl AnalogInput for SimulatedAnalogInput {
    async fn open(&self) -> PqnResult<()> {
        Ok(())
    }

    async fn sample(&self, pin: u8) -> PqnResult<f64> {
        let mut taken = self.samples_taken.lock();
        if let Some(limit) = self.fail_after {
            if *taken >= limit {
                return Err(PqnError::HardwareIo(format!(
                    "analog pin {} stopped responding",
                    pin
                )));
            }
        }
        *taken += 1;
        drop(taken);
        Ok(self.intensity(pin))
    }

    async fn close(&self) -> PqnResult<()> {
        Ok(())
    }
}

/// Background task polling an input into per-pin buffers.
pub struct Sampler {
    token: CancellationToken,
    handle: JoinHandle<()>,
    fault: Arc<Mutex<Option<String>>>,
}

impl Sampler {
    /// Start polling every channel at `rate_hz`.
    ///
    /// The first failing sample is recorded as the sampler fault and stops the
    /// task; readers observe it through [`Sampler::fault`].
    pub fn spawn(
        input: Arc<dyn AnalogInput>,
        channels: Vec<(u8, Arc<SignalBuffer>)>,
        rate_hz: f64,
    ) -> PqnResult<Self> {
        if !(rate_hz.is_finite() && rate_hz > 0.0) {
            return Err(PqnError::InvalidArgument(format!(
                "sample rate must be positive, got {}",
                rate_hz
            )));
        }

        let period = Duration::from_secs_f64(1.0 / rate_hz);
        let token = CancellationToken::new();
        let fault = Arc::new(Mutex::new(None));

        let task_token = token.clone();
        let task_fault = Arc::clone(&fault);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        for (pin, buffer) in &channels {
                            match input.sample(*pin).await {
                                Ok(value) => buffer.append(value),
                                Err(e) => {
                                    warn!(pin, error = %e, "Sampling failed, stopping sampler");
                                    *task_fault.lock() = Some(e.message());
                                    return;
                                }
                            }
                        }
                    }
                }
            }
            debug!("Sampler stopped");
        });

        Ok(Self {
            token,
            handle,
            fault,
        })
    }

    /// First sampling failure, if the task has died.
    pub fn fault(&self) -> Option<String> {
        self.fault.lock().clone()
    }

    /// Stop polling and wait for the task to exit.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Sampler task ended abnormally");
        }
    }
}
