//! Running reductions of 0D channel samples.
//!
//! An [`Accumulation`] records `(value, timestamp)` samples of one acquisition
//! window in a pre-allocated buffer and keeps a live reduction of every sample
//! seen so far. When the buffer is full the oldest half is dropped; the
//! reduction is not affected.

use sardana_core::PoolError;
use std::fmt;
use std::str::FromStr;

/// How samples are reduced to one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccumulationType {
    /// Last sample
    Last,
    /// Sum of the samples
    Sum,
    /// Arithmetic mean of the samples
    #[default]
    Average,
    /// Trapezoidal time integral divided by the elapsed time
    Integral,
}

impl AccumulationType {
    pub fn as_str(self) -> &'static str {
        match self {
            AccumulationType::Last => "Last",
            AccumulationType::Sum => "Sum",
            AccumulationType::Average => "Average",
            AccumulationType::Integral => "Integral",
        }
    }
}

impl fmt::Display for AccumulationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccumulationType {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "last" => Ok(AccumulationType::Last),
            "sum" => Ok(AccumulationType::Sum),
            "average" => Ok(AccumulationType::Average),
            "integral" => Ok(AccumulationType::Integral),
            other => Err(PoolError::InvalidParameter(format!(
                "unknown accumulation type '{}' (expected Last, Sum, Average or Integral)",
                other
            ))),
        }
    }
}

/// Sample buffer plus running reduction.
#[derive(Debug, Clone)]
pub struct Accumulation {
    kind: AccumulationType,
    values: Vec<f64>,
    times: Vec<f64>,
    len: usize,
    count: u64,
    sum: f64,
    previous: Option<(f64, f64)>,
    start_time: Option<f64>,
    value: Option<f64>,
}

impl Accumulation {
    /// Creates an accumulation holding at most `capacity` samples (at least 2).
    pub fn new(kind: AccumulationType, capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            kind,
            values: vec![0.0; capacity],
            times: vec![0.0; capacity],
            len: 0,
            count: 0,
            sum: 0.0,
            previous: None,
            start_time: None,
            value: None,
        }
    }

    pub fn kind(&self) -> AccumulationType {
        self.kind
    }

    /// Changes the reduction. The current window is cleared.
    pub fn set_kind(&mut self, kind: AccumulationType) {
        self.kind = kind;
        self.clear();
    }

    pub fn capacity(&self) -> usize {
        self.values.len()
    }

    /// Starts a new window. The buffer is reused, not reallocated.
    pub fn clear(&mut self) {
        self.len = 0;
        self.count = 0;
        self.sum = 0.0;
        self.previous = None;
        self.start_time = None;
        self.value = None;
    }

    /// Current reduction; `None` before the first sample of a window.
    pub fn value(&self) -> Option<f64> {
        self.value
    }

    /// Raw time integral (Integral) or sum (Sum, Average) so far.
    pub fn integral(&self) -> f64 {
        self.sum
    }

    /// Samples seen in the current window, including dropped ones.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn value_buffer(&self) -> &[f64] {
        &self.values[..self.len]
    }

    pub fn time_buffer(&self) -> &[f64] {
        &self.times[..self.len]
    }

    /// Records one sample taken at `timestamp` (seconds).
    pub fn append(&mut self, value: f64, timestamp: f64) {
        let capacity = self.capacity();
        if self.len == capacity {
            let half = capacity / 2;
            self.values.copy_within(capacity - half.., 0);
            self.times.copy_within(capacity - half.., 0);
            self.len = half;
        }
        self.values[self.len] = value;
        self.times[self.len] = timestamp;
        self.len += 1;
        self.count += 1;
        self.update(value, timestamp);
    }

    fn update(&mut self, value: f64, timestamp: f64) {
        match self.kind {
            AccumulationType::Last => self.value = Some(value),
            AccumulationType::Sum => {
                self.sum += value;
                self.value = Some(self.sum);
            }
            AccumulationType::Average => {
                self.sum += value;
                self.value = Some(self.sum / self.count as f64);
            }
            AccumulationType::Integral => match (self.previous, self.start_time) {
                (Some((last_value, last_time)), Some(start)) => {
                    self.sum += (timestamp - last_time) * (last_value + value) / 2.0;
                    let elapsed = timestamp - start;
                    if elapsed > 0.0 {
                        self.value = Some(self.sum / elapsed);
                    }
                    self.previous = Some((value, timestamp));
                }
                _ => {
                    self.previous = Some((value, timestamp));
                    self.start_time = Some(timestamp);
                    self.value = Some(value);
                }
            },
        }
    }
}

impl Default for Accumulation {
    fn default() -> Self {
        Self::new(AccumulationType::default(), 16384)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(kind: AccumulationType, samples: &[(f64, f64)]) -> Accumulation {
        let mut acc = Accumulation::new(kind, 16);
        for &(t, v) in samples {
            acc.append(v, t);
        }
        acc
    }

    #[test]
    fn test_average() {
        let acc = feed(AccumulationType::Average, &[(0.0, 1.0), (1.0, 2.0), (2.0, 3.0)]);
        assert_eq!(acc.value(), Some(2.0));
    }

    #[test]
    fn test_integral_of_constant() {
        let acc = feed(AccumulationType::Integral, &[(0.0, 1.0), (1.0, 1.0), (2.0, 1.0)]);
        assert_eq!(acc.integral(), 2.0);
        assert_eq!(acc.value(), Some(1.0));
    }

    #[test]
    fn test_integral_of_ramp() {
        let acc = feed(AccumulationType::Integral, &[(0.0, 0.0), (2.0, 4.0)]);
        assert_eq!(acc.integral(), 4.0);
        assert_eq!(acc.value(), Some(2.0));
    }

    #[test]
    fn test_sum_and_last() {
        let samples = [(0.0, 1.5), (1.0, 2.5)];
        assert_eq!(feed(AccumulationType::Sum, &samples).value(), Some(4.0));
        assert_eq!(feed(AccumulationType::Last, &samples).value(), Some(2.5));
    }

    #[test]
    fn test_clear_keeps_buffer() {
        let mut acc = feed(AccumulationType::Average, &[(0.0, 1.0), (1.0, 3.0)]);
        acc.clear();
        assert_eq!(acc.value(), None);
        assert!(acc.value_buffer().is_empty());
        assert_eq!(acc.capacity(), 16);
        acc.append(5.0, 2.0);
        assert_eq!(acc.value(), Some(5.0));
    }

    #[test]
    fn test_full_buffer_drops_oldest_half() {
        let mut acc = Accumulation::new(AccumulationType::Average, 4);
        for i in 0..5 {
            acc.append(f64::from(i), f64::from(i));
        }
        assert_eq!(acc.value_buffer(), &[2.0, 3.0, 4.0]);
        assert_eq!(acc.count(), 5);
        assert_eq!(acc.value(), Some(2.0));
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!(
            "integral".parse::<AccumulationType>().unwrap(),
            AccumulationType::Integral
        );
        assert_eq!(
            "AVERAGE".parse::<AccumulationType>().unwrap(),
            AccumulationType::Average
        );
        assert!("median".parse::<AccumulationType>().is_err());
    }
}
