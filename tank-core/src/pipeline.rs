//! One sampling round, transducer to snapshot
//!
//! burst median -> EMA -> mounting offset -> calibration -> shared snapshot
//!
//! The EMA works on raw transducer distances so a changed offset never disturbs the retained
//! average. The calibration lock is only taken for the estimate.

use embedded_hal_async::delay::DelayNs;

use crate::config::ConfigProvider;
use crate::filter::StabilityFilter;
use crate::sensor::EchoSensor;
use crate::smoothing::{RetainedSlot, Smoother};
use crate::state::{MeasurementSnapshot, MeasurementWriter, SharedCalibration};

pub struct MeasurementPipeline<'a, S, D, R> {
    sensor: S,
    delay: D,
    filter: StabilityFilter,
    smoother: Smoother<R>,
    offset_cm: f32,
    writer: MeasurementWriter<'a>,
}

impl<'a, S, D, R> MeasurementPipeline<'a, S, D, R>
where
    S: EchoSensor,
    D: DelayNs,
    R: RetainedSlot,
{
    pub fn new(sensor: S, delay: D, config: &impl ConfigProvider, slot: R, writer: MeasurementWriter<'a>) -> Self {
        Self {
            sensor,
            delay,
            filter: StabilityFilter::from_config(config),
            smoother: Smoother::new(config.ema_alpha(), slot),
            offset_cm: config.measure_offset_cm(),
            writer,
        }
    }

    /// Picks up changed tunables without losing the average
    pub fn reconfigure(&mut self, config: &impl ConfigProvider) {
        self.filter = StabilityFilter::from_config(config);
        self.offset_cm = config.measure_offset_cm();
    }

    /// Runs one round and publishes its snapshot
    pub async fn run_round(&mut self, calibration: &SharedCalibration) -> MeasurementSnapshot {
        let stable = self.filter.stable_sample(&mut self.sensor, &mut self.delay).await;
        let smoothed = self.smoother.update(stable.median_cm);

        let measured_cm = smoothed.map(|avg| avg + self.offset_cm).filter(|m| *m > 0.0);
        let estimated_height_cm = measured_cm.and_then(|m| calibration.estimate_height(m));

        let snapshot = MeasurementSnapshot {
            measured_cm,
            estimated_height_cm,
            last_duration_us: stable.last_duration_us,
        };
        self.writer.publish(snapshot);

        debug!(
            "round: accepted {}, measured {:?}, height {:?}",
            stable.accepted, measured_cm, estimated_height_cm
        );
        snapshot
    }

    /// Borrow of the smoother, for inspection
    pub fn smoother(&self) -> &Smoother<R> {
        &self.smoother
    }

    /// Gives the sensor and delay back
    pub fn release(self) -> (S, D) {
        (self.sensor, self.delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{Calibration, CalibrationPoint};
    use crate::config::RuntimeConfig;
    use crate::sensor::{RawSample, CM_PER_US};
    use crate::smoothing::VolatileSlot;
    use crate::state::SharedMeasurement;
    use embassy_futures::block_on;

    struct Scripted(std::vec::IntoIter<RawSample>);

    impl EchoSensor for Scripted {
        async fn sample_once(&mut self) -> RawSample {
            self.0.next().unwrap_or(RawSample::NO_ECHO)
        }
    }

    struct NoDelay;

    impl DelayNs for NoDelay {
        async fn delay_ns(&mut self, _ns: u32) {}
    }

    fn cm(distance_cm: f32) -> RawSample {
        RawSample {
            duration_us: (distance_cm / CM_PER_US) as u32,
            distance_cm,
        }
    }

    fn config() -> RuntimeConfig {
        RuntimeConfig {
            median_samples: 5,
            filter_min_cm: 2.0,
            filter_max_cm: 300.0,
            ema_alpha: 0.25,
            ..RuntimeConfig::default()
        }
    }

    fn linear() -> Calibration {
        Calibration::with_points([
            CalibrationPoint { measured_cm: 10.0, height_cm: 50.0 },
            CalibrationPoint { measured_cm: 20.0, height_cm: 100.0 },
            CalibrationPoint { measured_cm: 30.0, height_cm: 150.0 },
        ])
    }

    #[test]
    fn spike_and_timeout_round() {
        let state = SharedMeasurement::new();
        let calibration = SharedCalibration::new();
        calibration.set(linear());

        let sensor = Scripted(vec![cm(12.0), cm(12.1), cm(400.0), RawSample::NO_ECHO, cm(11.9)].into_iter());
        let mut pipeline =
            MeasurementPipeline::new(sensor, NoDelay, &config(), VolatileSlot::new(), state.writer().unwrap());

        let snapshot = block_on(pipeline.run_round(&calibration));

        assert_eq!(snapshot.measured_cm, Some(12.0));
        assert_eq!(snapshot.estimated_height_cm, Some(60.0));
        assert_eq!(snapshot.last_duration_us, cm(11.9).duration_us);
        assert_eq!(state.snapshot(), snapshot);
    }

    #[test]
    fn empty_round_keeps_previous_average() {
        let state = SharedMeasurement::new();
        let calibration = SharedCalibration::new();
        let slot = VolatileSlot::new();

        let samples = vec![cm(100.0); 5].into_iter().chain(vec![RawSample::NO_ECHO; 5]);
        let sensor = Scripted(samples.collect::<std::vec::Vec<_>>().into_iter());
        let mut pipeline = MeasurementPipeline::new(sensor, NoDelay, &config(), &slot, state.writer().unwrap());

        block_on(pipeline.run_round(&calibration));
        let snapshot = block_on(pipeline.run_round(&calibration));

        assert_eq!(snapshot.measured_cm, Some(100.0));
        assert_eq!(snapshot.estimated_height_cm, None);
        assert_eq!(snapshot.last_duration_us, 0);
        assert_eq!(slot.load(), Some(100.0));
    }

    #[test]
    fn offset_is_applied_after_smoothing() {
        let state = SharedMeasurement::new();
        let calibration = SharedCalibration::new();
        let slot = VolatileSlot::new();
        let config = RuntimeConfig {
            measure_offset_cm: -2.5,
            ..config()
        };

        let sensor = Scripted(vec![cm(50.0); 5].into_iter());
        let mut pipeline = MeasurementPipeline::new(sensor, NoDelay, &config, &slot, state.writer().unwrap());
        let snapshot = block_on(pipeline.run_round(&calibration));

        assert_eq!(snapshot.measured_cm, Some(47.5));
        assert_eq!(pipeline.smoother().current(), Some(50.0));
    }
}
