//! State shared between the sampling task and its readers
//!
//! The sampling task is the only writer of the measurement. It gets the single
//! [`MeasurementWriter`]; everybody else copies a [`MeasurementSnapshot`] out. Both sides go
//! through one short critical section covering the whole triple, so a reader never sees fields
//! from two different rounds, and nothing is held across an await.

use core::cell::Cell;

use embassy_sync::blocking_mutex::raw::{CriticalSectionRawMutex, RawMutex};
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::channel::Channel;
use portable_atomic::{AtomicBool, Ordering};

use crate::calibration::Calibration;
use crate::config::RuntimeConfig;

/// Result of one sampling round
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MeasurementSnapshot {
    /// Smoothed distance including the mounting offset
    pub measured_cm: Option<f32>,
    /// Liquid height, only with a valid calibration
    pub estimated_height_cm: Option<f32>,
    /// Echo duration of the last raw sample
    pub last_duration_us: u32,
}

impl MeasurementSnapshot {
    pub const EMPTY: Self = Self {
        measured_cm: None,
        estimated_height_cm: None,
        last_duration_us: 0,
    };
}

/// Latest measurement, one writer, many readers
pub struct SharedMeasurement {
    inner: Mutex<CriticalSectionRawMutex, Cell<MeasurementSnapshot>>,
    writer_taken: AtomicBool,
}

impl SharedMeasurement {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Cell::new(MeasurementSnapshot::EMPTY)),
            writer_taken: AtomicBool::new(false),
        }
    }

    /// Copy of the latest snapshot
    pub fn snapshot(&self) -> MeasurementSnapshot {
        self.inner.lock(|cell| cell.get())
    }

    /// Hands out the write side, once
    pub fn writer(&self) -> Option<MeasurementWriter<'_>> {
        if self.writer_taken.swap(true, Ordering::AcqRel) {
            warn!("measurement writer already taken");
            return None;
        }
        Some(MeasurementWriter { state: self })
    }
}

impl Default for SharedMeasurement {
    fn default() -> Self {
        Self::new()
    }
}

/// Write side of [`SharedMeasurement`]
pub struct MeasurementWriter<'a> {
    state: &'a SharedMeasurement,
}

impl MeasurementWriter<'_> {
    /// Replaces the snapshot as a whole
    pub fn publish(&mut self, snapshot: MeasurementSnapshot) {
        self.state.inner.lock(|cell| cell.set(snapshot));
    }

    /// Reads back through the writer
    pub fn current(&self) -> MeasurementSnapshot {
        self.state.snapshot()
    }
}

/// Calibration shared between the sampler and the request service
///
/// Callers copy it out, work on the copy, and store it back; persisting never happens under the
/// lock.
pub struct SharedCalibration {
    inner: Mutex<CriticalSectionRawMutex, Cell<Calibration>>,
}

impl SharedCalibration {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Cell::new(Calibration::new())),
        }
    }

    pub fn get(&self) -> Calibration {
        self.inner.lock(|cell| cell.get())
    }

    pub fn set(&self, calibration: Calibration) {
        self.inner.lock(|cell| cell.set(calibration));
    }

    /// Height for `measured_cm`, `None` while uncalibrated
    pub fn estimate_height(&self, measured_cm: f32) -> Option<f32> {
        self.inner.lock(|cell| cell.get().estimate_height(measured_cm))
    }
}

impl Default for SharedCalibration {
    fn default() -> Self {
        Self::new()
    }
}

/// Runtime configuration shared between the request service and the tasks that consume it
pub struct SharedConfig {
    inner: Mutex<CriticalSectionRawMutex, Cell<RuntimeConfig>>,
}

impl SharedConfig {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Cell::new(RuntimeConfig::DEFAULT)),
        }
    }

    pub fn get(&self) -> RuntimeConfig {
        self.inner.lock(|cell| cell.get())
    }

    pub fn set(&self, config: RuntimeConfig) {
        self.inner.lock(|cell| cell.set(config));
    }
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Up/down flag of a link whose changes are reported on an event queue
///
/// Reporting never waits: with the queue full the change is recorded but not reported, so a
/// caller on the queue's consumer side cannot block itself.
pub struct LinkStatus {
    up: AtomicBool,
}

impl LinkStatus {
    pub const fn new() -> Self {
        Self {
            up: AtomicBool::new(false),
        }
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    /// Records `up`, queues `event(up)` on a change. Returns whether it changed.
    pub fn set<M: RawMutex, T, const N: usize>(
        &self,
        up: bool,
        events: &Channel<M, T, N>,
        event: impl FnOnce(bool) -> T,
    ) -> bool {
        if self.up.swap(up, Ordering::AcqRel) == up {
            return false;
        }
        if events.try_send(event(up)).is_err() {
            warn!("event queue full, link change to {} not reported", up);
        }
        true
    }
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationPoint;

    #[test]
    fn starts_empty() {
        let state = SharedMeasurement::new();
        assert_eq!(state.snapshot(), MeasurementSnapshot::EMPTY);
    }

    #[test]
    fn only_one_writer() {
        let state = SharedMeasurement::new();
        let mut writer = state.writer().unwrap();
        assert!(state.writer().is_none());

        let snapshot = MeasurementSnapshot {
            measured_cm: Some(42.0),
            estimated_height_cm: None,
            last_duration_us: 2_449,
        };
        writer.publish(snapshot);
        assert_eq!(state.snapshot(), snapshot);
        assert_eq!(writer.current(), snapshot);
    }

    #[test]
    fn readers_never_see_a_torn_triple() {
        let state = SharedMeasurement::new();

        std::thread::scope(|s| {
            let mut writer = state.writer().unwrap();
            s.spawn(move || {
                for round in 1..=20_000u32 {
                    let x = round as f32;
                    writer.publish(MeasurementSnapshot {
                        measured_cm: Some(x),
                        estimated_height_cm: Some(x * 2.0),
                        last_duration_us: round,
                    });
                }
            });

            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..20_000 {
                        let snap = state.snapshot();
                        match snap.measured_cm {
                            None => assert_eq!(snap, MeasurementSnapshot::EMPTY),
                            Some(x) => {
                                assert_eq!(snap.estimated_height_cm, Some(x * 2.0));
                                assert_eq!(snap.last_duration_us, x as u32);
                            }
                        }
                    }
                });
            }
        });

        assert_eq!(state.snapshot().last_duration_us, 20_000);
    }

    #[test]
    fn calibration_copy_out_and_back() {
        let shared = SharedCalibration::new();
        assert!(shared.estimate_height(20.0).is_none());

        shared.set(Calibration::with_points([
            CalibrationPoint { measured_cm: 10.0, height_cm: 50.0 },
            CalibrationPoint { measured_cm: 20.0, height_cm: 100.0 },
            CalibrationPoint { measured_cm: 30.0, height_cm: 150.0 },
        ]));
        assert_eq!(shared.estimate_height(20.0), Some(100.0));
        assert!(shared.get().model().is_valid());
    }

    #[test]
    fn shared_config_replaces_as_a_whole() {
        let shared = SharedConfig::new();
        assert_eq!(shared.get(), RuntimeConfig::default());

        let config = RuntimeConfig {
            publish_enabled: true,
            median_samples: 7,
            ..RuntimeConfig::default()
        };
        shared.set(config);
        assert_eq!(shared.get(), config);
    }

    #[test]
    fn link_change_with_full_queue_does_not_wait() {
        let events: Channel<CriticalSectionRawMutex, bool, 1> = Channel::new();
        let link = LinkStatus::new();

        assert!(link.set(true, &events, |up| up));
        // nobody drains the queue, it is full from here on
        assert!(link.set(false, &events, |up| up));
        assert!(!link.is_up());
        assert!(!link.set(false, &events, |up| up));

        assert_eq!(events.try_receive(), Ok(true));
        assert!(events.try_receive().is_err());
    }
}
