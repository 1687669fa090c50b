//! Concrete device drivers and the configuration that selects them.

pub mod chsh;
pub mod dummy;
pub mod polarimeter;
pub mod rotator;
pub mod timetagger;

use crate::device::Driver;
use crate::error::PqnResult;
use crate::network::Client;
use serde::{Deserialize, Serialize};

// =============================================================================
// Driver Types (Configuration)
// =============================================================================

/// Driver configuration for instantiating hardware
///
/// Selected in TOML by the `kind` key of a `[devices.driver]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DriverType {
    /// Four-channel analog polarimeter
    Polarimeter(polarimeter::PolarimeterConfig),
    /// Coincidence counting time tagger
    TimeTagger(timetagger::TimeTaggerConfig),
    /// Motorized waveplate rotation mount
    Rotator(rotator::RotatorConfig),
    /// CHSH measurement coordinator driving remote devices
    Chsh(chsh::ChshConfig),
    /// Hardware-free test instrument
    Dummy(dummy::DummyConfig),
}

impl DriverType {
    /// Get human-readable driver type name
    pub fn driver_name(&self) -> &'static str {
        match self {
            DriverType::Polarimeter(_) => "polarimeter",
            DriverType::TimeTagger(_) => "time_tagger",
            DriverType::Rotator(_) => "rotator",
            DriverType::Chsh(_) => "chsh",
            DriverType::Dummy(_) => "dummy",
        }
    }

    /// Check driver settings that the type system cannot express
    pub fn validate(&self) -> Result<(), String> {
        match self {
            DriverType::Polarimeter(config) => config.validate(),
            DriverType::TimeTagger(config) => config.validate(),
            DriverType::Rotator(config) => config.validate(),
            DriverType::Chsh(_) | DriverType::Dummy(_) => Ok(()),
        }
    }

    /// Construct the driver. Hardware is not touched until it is started.
    pub fn build(&self, ctx: &DriverContext) -> PqnResult<Box<dyn Driver>> {
        Ok(match self {
            DriverType::Polarimeter(config) => {
                Box::new(polarimeter::PolarimeterDriver::new(config.clone())?)
            }
            DriverType::TimeTagger(config) => {
                Box::new(timetagger::TimeTaggerDriver::new(config.clone())?)
            }
            DriverType::Rotator(config) => Box::new(rotator::RotatorDriver::new(config.clone())?),
            DriverType::Chsh(config) => {
                Box::new(chsh::ChshDriver::new(config.clone(), ctx.client()?))
            }
            DriverType::Dummy(config) => Box::new(dummy::DummyDriver::new(config.clone())),
        })
    }
}

/// Process-wide resources handed to drivers at construction.
#[derive(Debug, Clone, Default)]
pub struct DriverContext {
    client: Option<Client>,
}

impl DriverContext {
    /// Context whose coordinator drivers reach remote devices through `client`.
    pub fn with_client(client: Client) -> Self {
        Self {
            client: Some(client),
        }
    }

    fn client(&self) -> PqnResult<Client> {
        match &self.client {
            Some(client) => Ok(client.clone()),
            None => Client::global(),
        }
    }
}
