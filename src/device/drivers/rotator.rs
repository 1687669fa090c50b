//! Motorized rotation mount (waveplate holder).
//!
//! The mount is simulated: a move takes `|delta| / speed` of wall time and
//! the position is updated continuously, so a cancelled move stops where it
//! was interrupted. Angles passed to and returned from operations are in the
//! reported frame, `mechanical - offset_degrees`.

use crate::device::{CallArgs, DeviceClass, Driver, OperationRegistry};
use crate::error::{PqnError, PqnResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Rotation mount settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotatorConfig {
    /// Angular speed in degrees per second.
    pub speed_deg_per_s: f64,
    /// Mechanical position at start-up, in degrees.
    pub initial_degrees: f64,
    /// Mechanical angle of the reported zero, in degrees.
    pub offset_degrees: f64,
}

impl Default for RotatorConfig {
    fn default() -> Self {
        Self {
            speed_deg_per_s: 90.0,
            initial_degrees: 0.0,
            offset_degrees: 0.0,
        }
    }
}

impl RotatorConfig {
    /// Check the speed and offset are usable.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.speed_deg_per_s.is_finite() && self.speed_deg_per_s > 0.0) {
            return Err(format!(
                "rotator speed must be positive, got {}",
                self.speed_deg_per_s
            ));
        }
        if !(self.initial_degrees.is_finite() && self.offset_degrees.is_finite()) {
            return Err("rotator initial and offset angles must be finite".to_string());
        }
        Ok(())
    }
}

#[derive(Debug)]
struct RotatorState {
    mechanical: Mutex<f64>,
    speed: f64,
    offset: f64,
}

impl RotatorState {
    fn degrees(&self) -> f64 {
        *self.mechanical.lock() - self.offset
    }

    fn travel_time(&self, delta: f64, target: f64) -> PqnResult<Duration> {
        Duration::try_from_secs_f64(delta.abs() / self.speed).map_err(|_| {
            PqnError::InvalidArgument(format!("target angle {} is out of reach", target))
        })
    }

    async fn move_to(&self, target: f64, args: &CallArgs) -> PqnResult<f64> {
        let goal = target + self.offset;
        if !goal.is_finite() {
            return Err(PqnError::InvalidArgument(format!(
                "target angle must be finite, got {}",
                target
            )));
        }

        let start = *self.mechanical.lock();
        let delta = goal - start;
        let travel = self.travel_time(delta, target)?;
        let began = Instant::now();
        debug!(from = start, to = goal, ?travel, "Rotator moving");

        tokio::select! {
            _ = tokio::time::sleep(travel) => {
                *self.mechanical.lock() = goal;
                Ok(target)
            }
            _ = args.cancel_token().cancelled() => {
                let fraction = if travel.is_zero() {
                    1.0
                } else {
                    (began.elapsed().as_secs_f64() / travel.as_secs_f64()).min(1.0)
                };
                let reached = start + delta * fraction;
                *self.mechanical.lock() = reached;
                Err(PqnError::Cancelled(format!(
                    "move to {} stopped at {:.3} degrees",
                    target,
                    reached - self.offset
                )))
            }
        }
    }
}

/// Rotation mount driver.
pub struct RotatorDriver {
    state: Arc<RotatorState>,
    operations: OperationRegistry,
}

impl RotatorDriver {
    /// Build the driver and its operation table.
    pub fn new(config: RotatorConfig) -> PqnResult<Self> {
        config.validate().map_err(PqnError::Configuration)?;

        let state = Arc::new(RotatorState {
            mechanical: Mutex::new(config.initial_degrees),
            speed: config.speed_deg_per_s,
            offset: config.offset_degrees,
        });

        let mut ops = OperationRegistry::new();
        ops.register("move_to", &state, |s, args| async move {
            let angle: f64 = args.get(0, "angle")?;
            s.move_to(angle, &args).await
        })
        .register("move_by", &state, |s, args| async move {
            let delta: f64 = args.get(0, "angle")?;
            let target = s.degrees() + delta;
            s.move_to(target, &args).await
        })
        .register("home", &state, |s, args| async move { s.move_to(0.0, &args).await })
        .register("degrees", &state, |s, _| async move { Ok(s.degrees()) });

        Ok(Self {
            state,
            operations: ops,
        })
    }
}

#[async_trait]
impl Driver for RotatorDriver {
    fn class(&self) -> DeviceClass {
        DeviceClass::Motor
    }

    fn operations(&self) -> &OperationRegistry {
        &self.operations
    }

    async fn start(&self) -> PqnResult<()> {
        Ok(())
    }

    async fn close(&self) -> PqnResult<()> {
        Ok(())
    }

    fn hardware_status(&self) -> BTreeMap<String, Value> {
        BTreeMap::from([
            ("degrees".to_string(), json!(self.state.degrees())),
            (
                "mechanical_degrees".to_string(),
                json!(*self.state.mechanical.lock()),
            ),
            ("offset_degrees".to_string(), json!(self.state.offset)),
            ("speed_deg_per_s".to_string(), json!(self.state.speed)),
        ])
    }
}
