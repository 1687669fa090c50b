//! Rolling sample window with optional min/max calibration.
//!
//! A `SignalBuffer` is written by a sampling task and read by device
//! operations. Both sides go through one short critical section: `append`
//! pushes a sample and evicts at most one old sample, `read` aggregates a
//! running sum. Neither path allocates or iterates the window.

use crate::error::{PqnError, PqnResult};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;

/// Fixed-capacity FIFO of samples.
#[derive(Debug)]
pub struct SignalBuffer {
    capacity: usize,
    state: Mutex<BufferState>,
}

#[derive(Debug)]
struct BufferState {
    window: VecDeque<f64>,
    sum: f64,
    // Evictions since the running sum was last recomputed from the window.
    evictions: usize,
    normalizing: bool,
    min: f64,
    max: f64,
}

/// Point-in-time copy of a buffer, used for status reporting and tests.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BufferSnapshot {
    /// Samples in arrival order, oldest first.
    pub samples: Vec<f64>,
    /// Whether min/max tracking is active.
    pub normalizing: bool,
    /// Lowest sample observed while normalizing, if any.
    pub min: Option<f64>,
    /// Highest sample observed while normalizing, if any.
    pub max: Option<f64>,
}

impl BufferState {
    fn reset_bounds(&mut self) {
        self.min = f64::INFINITY;
        self.max = f64::NEG_INFINITY;
    }

    fn has_range(&self) -> bool {
        self.max > self.min
    }

    fn mean(&self) -> Option<f64> {
        if self.window.is_empty() {
            None
        } else {
            Some(self.sum / self.window.len() as f64)
        }
    }
}

impl SignalBuffer {
    /// Create an empty buffer holding at most `capacity` samples.
    pub fn new(capacity: usize) -> PqnResult<Self> {
        if capacity == 0 {
            return Err(PqnError::InvalidArgument(
                "signal buffer capacity must be at least 1".to_string(),
            ));
        }

        let mut state = BufferState {
            window: VecDeque::with_capacity(capacity),
            sum: 0.0,
            evictions: 0,
            normalizing: false,
            min: 0.0,
            max: 0.0,
        };
        state.reset_bounds();

        Ok(Self {
            capacity,
            state: Mutex::new(state),
        })
    }

    /// Maximum number of samples kept.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of samples currently in the window.
    pub fn len(&self) -> usize {
        self.state.lock().window.len()
    }

    /// True when no sample has been appended since the last clear.
    pub fn is_empty(&self) -> bool {
        self.state.lock().window.is_empty()
    }

    /// Push one sample, evicting the oldest one when full.
    ///
    /// Non-finite samples are dropped: they would poison the running sum and
    /// the calibration range.
    pub fn append(&self, value: f64) {
        if !value.is_finite() {
            return;
        }

        let mut state = self.state.lock();
        if state.window.len() == self.capacity {
            if let Some(old) = state.window.pop_front() {
                state.sum -= old;
                state.evictions += 1;
            }
        }
        state.window.push_back(value);
        state.sum += value;

        // Floating point drift from repeated subtraction is bounded by
        // resynchronising once per full turnover of the window.
        if state.evictions >= self.capacity {
            state.sum = state.window.iter().sum();
            state.evictions = 0;
        }

        if state.normalizing {
            state.min = state.min.min(value);
            state.max = state.max.max(value);
        }
    }

    /// Current calibrated reading.
    ///
    /// Returns `0.0` for an empty window. With a calibration range available
    /// (live while normalizing, frozen after `set_normalizing(false)`), the mean
    /// is rescaled to `[0, 1]`; while normalizing without a range yet
    /// (`max <= min`) the reading is `0.0`. Without any calibration the raw mean
    /// is returned.
    pub fn read(&self) -> f64 {
        let state = self.state.lock();
        let Some(mean) = state.mean() else {
            return 0.0;
        };

        if state.has_range() {
            ((mean - state.min) / (state.max - state.min)).clamp(0.0, 1.0)
        } else if state.normalizing {
            0.0
        } else {
            mean
        }
    }

    /// Uncalibrated mean of the window, `0.0` when empty.
    pub fn mean(&self) -> f64 {
        self.state.lock().mean().unwrap_or(0.0)
    }

    /// Drop every sample and forget the calibration range.
    ///
    /// The normalizing flag is left as it is.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.window.clear();
        state.sum = 0.0;
        state.evictions = 0;
        state.reset_bounds();
    }

    /// Switch min/max tracking on or off.
    ///
    /// Turning tracking off keeps the bounds observed so far.
    pub fn set_normalizing(&self, enabled: bool) {
        self.state.lock().normalizing = enabled;
    }

    /// Whether min/max tracking is active.
    pub fn is_normalizing(&self) -> bool {
        self.state.lock().normalizing
    }

    /// Raw `(min, max)` bounds, sentinels included.
    pub fn bounds(&self) -> (f64, f64) {
        let state = self.state.lock();
        (state.min, state.max)
    }

    /// Copy of the window and calibration state.
    pub fn snapshot(&self) -> BufferSnapshot {
        let state = self.state.lock();
        BufferSnapshot {
            samples: state.window.iter().copied().collect(),
            normalizing: state.normalizing,
            min: state.min.is_finite().then_some(state.min),
            max: state.max.is_finite().then_some(state.max),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn normalizing_buffer(capacity: usize) -> SignalBuffer {
        let buffer = SignalBuffer::new(capacity).unwrap();
        buffer.set_normalizing(true);
        buffer
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(
            SignalBuffer::new(0),
            Err(PqnError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_empty_read_is_zero() {
        let buffer = SignalBuffer::new(4).unwrap();
        assert_eq!(buffer.read(), 0.0);
        buffer.set_normalizing(true);
        assert_eq!(buffer.read(), 0.0);
    }

    #[test]
    fn test_single_sample_normalizing_reads_zero() {
        let buffer = normalizing_buffer(4);
        buffer.append(0.7);
        assert_eq!(buffer.bounds(), (0.7, 0.7));
        assert_eq!(buffer.read(), 0.0);
    }

    #[test]
    fn test_five_sample_scenario() {
        let buffer = normalizing_buffer(5);
        for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
            buffer.append(v);
        }
        assert!((buffer.read() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_fifo_eviction_keeps_last_n() {
        let buffer = SignalBuffer::new(3).unwrap();
        for v in 1..=7 {
            buffer.append(v as f64);
        }
        assert_eq!(buffer.snapshot().samples, vec![5.0, 6.0, 7.0]);
        assert_eq!(buffer.len(), 3);
        assert!((buffer.mean() - 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_bounds_enclose_every_sample_since_clear() {
        let buffer = normalizing_buffer(4);
        let samples = [0.3, -2.5, 9.0, 4.4, 4.5, -0.1, 7.7, 3.3, 12.0, -8.0];
        for (i, &v) in samples.iter().enumerate() {
            buffer.append(v);
            let (min, max) = buffer.bounds();
            for &seen in &samples[..=i] {
                assert!(min <= seen && seen <= max);
            }
            let reading = buffer.read();
            assert!((0.0..=1.0).contains(&reading));
        }
    }

    #[test]
    fn test_bounds_untouched_when_not_normalizing() {
        let buffer = SignalBuffer::new(4).unwrap();
        buffer.append(1.0);
        buffer.append(3.0);
        assert_eq!(buffer.bounds(), (f64::INFINITY, f64::NEG_INFINITY));
        // Raw mean without calibration.
        assert!((buffer.read() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_stop_normalizing_freezes_range() {
        let buffer = normalizing_buffer(2);
        buffer.append(0.0);
        buffer.append(10.0);
        buffer.set_normalizing(false);

        buffer.append(20.0);
        buffer.append(20.0);
        assert_eq!(buffer.bounds(), (0.0, 10.0));
        // Mean above the frozen range is clamped.
        assert_eq!(buffer.read(), 1.0);

        buffer.set_normalizing(true);
        assert_eq!(buffer.bounds(), (0.0, 10.0));
    }

    #[test]
    fn test_clear_resets_bounds_but_not_mode() {
        let buffer = normalizing_buffer(4);
        buffer.append(1.0);
        buffer.append(2.0);
        buffer.clear();

        assert!(buffer.is_empty());
        assert!(buffer.is_normalizing());
        assert_eq!(buffer.bounds(), (f64::INFINITY, f64::NEG_INFINITY));
        assert_eq!(buffer.read(), 0.0);
    }

    #[test]
    fn test_non_finite_samples_ignored() {
        let buffer = normalizing_buffer(4);
        buffer.append(f64::NAN);
        buffer.append(f64::INFINITY);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_running_sum_stays_accurate() {
        let buffer = SignalBuffer::new(10).unwrap();
        for i in 0..10_000 {
            buffer.append(0.1 * (i % 7) as f64 + 1e6);
        }
        let snapshot = buffer.snapshot();
        let exact = snapshot.samples.iter().sum::<f64>() / snapshot.samples.len() as f64;
        assert!((buffer.mean() - exact).abs() < 1e-6);
    }

    #[test]
    fn test_concurrent_append_and_read() {
        let buffer = Arc::new(normalizing_buffer(16));
        let writer = {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || {
                for i in 0..5_000 {
                    buffer.append((i % 100) as f64);
                }
            })
        };

        for _ in 0..1_000 {
            let reading = buffer.read();
            assert!((0.0..=1.0).contains(&reading));
            if buffer.len() > 8 {
                buffer.clear();
            }
        }
        writer.join().unwrap();
        assert!(buffer.len() <= 16);
    }
}
