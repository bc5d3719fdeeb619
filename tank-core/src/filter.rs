//! Median stabilization
//!
//! Ultrasonic echoes come in bursts: multipath reflections and missed echoes produce single
//! samples far off the true distance. A burst of N samples is taken, out-of-range samples are
//! dropped, and the middle element of what remains is returned.
//!
//! # Parameters
//! - N = `median_samples` clamped to [1, 15]
//! - a pause of `median_delay_ms` after every sample
//! - accepted window `[filter_min_cm, filter_max_cm]`, inclusive

use embedded_hal_async::delay::DelayNs;
use heapless::Vec;

use crate::config::ConfigProvider;
use crate::sensor::{EchoSensor, RawSample};

/// Upper bound on samples per burst
pub const MAX_SAMPLES: usize = 15;

/// Result of one burst
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Stabilized {
    /// Median of the accepted samples, `None` when nothing was accepted
    pub median_cm: Option<f32>,
    /// Number of accepted samples
    pub accepted: u8,
    /// Echo duration of the last sample taken
    pub last_duration_us: u32,
}

/// Burst median filter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StabilityFilter {
    samples: u8,
    delay_ms: u16,
    min_cm: f32,
    max_cm: f32,
}

impl StabilityFilter {
    pub fn new(samples: u8, delay_ms: u16, min_cm: f32, max_cm: f32) -> Self {
        Self {
            samples: samples.clamp(1, MAX_SAMPLES as u8),
            delay_ms,
            min_cm,
            max_cm,
        }
    }

    pub fn from_config(config: &impl ConfigProvider) -> Self {
        Self::new(
            config.median_samples(),
            config.median_sample_delay_ms(),
            config.filter_min_cm(),
            config.filter_max_cm(),
        )
    }

    /// Samples per burst after clamping
    pub fn samples(&self) -> u8 {
        self.samples
    }

    /// True when a sample lies in the accepted window
    pub fn accepts(&self, sample: &RawSample) -> bool {
        sample.is_valid() && sample.distance_cm >= self.min_cm && sample.distance_cm <= self.max_cm
    }

    /// Median of the accepted subset of `samples`
    ///
    /// Only the first [`MAX_SAMPLES`] accepted samples take part.
    pub fn median_of<I>(&self, samples: I) -> Option<f32>
    where
        I: IntoIterator<Item = RawSample>,
    {
        let mut accepted: Vec<f32, MAX_SAMPLES> = Vec::new();
        for sample in samples.into_iter().filter(|s| self.accepts(s)) {
            if accepted.push(sample.distance_cm).is_err() {
                break;
            }
        }
        median(&mut accepted)
    }

    /// Takes a burst from `sensor` and returns its median
    pub async fn stable_sample<S, D>(&self, sensor: &mut S, delay: &mut D) -> Stabilized
    where
        S: EchoSensor,
        D: DelayNs,
    {
        let mut accepted: Vec<f32, MAX_SAMPLES> = Vec::new();
        let mut last_duration_us = 0;

        for _ in 0..self.samples {
            let sample = sensor.sample_once().await;
            last_duration_us = sample.duration_us;

            if self.accepts(&sample) {
                // cannot overflow, samples <= MAX_SAMPLES
                let _ = accepted.push(sample.distance_cm);
            } else {
                trace!("rejected sample {} cm", sample.distance_cm);
            }

            delay.delay_ms(u32::from(self.delay_ms)).await;
        }

        let count = accepted.len() as u8;
        let median_cm = median(&mut accepted);
        if median_cm.is_none() {
            debug!("no sample accepted out of {}", self.samples);
        }

        Stabilized {
            median_cm,
            accepted: count,
            last_duration_us,
        }
    }
}

/// Middle element after sorting, the upper one for even counts
fn median(values: &mut [f32]) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable_by(f32::total_cmp);
    Some(values[values.len() / 2])
}
