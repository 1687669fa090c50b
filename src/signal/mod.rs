//! Analog signal conditioning for sensor drivers.

pub mod buffer;
pub mod source;

pub use buffer::{BufferSnapshot, SignalBuffer};
pub use source::{AnalogInput, Sampler, SimulatedAnalogInput};
