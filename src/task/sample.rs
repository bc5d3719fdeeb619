//! Level sampling
//!
//! Binds the ultrasonic transducer to the measurement pipeline. The sensor uses a trigger pin to
//! send a 10µs pulse and an echo pin whose high phase is the sound's round trip.
//!
//! While interactive, the task runs one round per measurement interval and reloads the
//! configuration before each round. A periodic wake builds the same pipeline in `main` instead.

use defmt::{debug, info};
use embassy_rp::gpio::{Input, Level, Output, Pull};
use embassy_time::{Delay, Timer};
use tank_core::{MeasurementPipeline, PulseTimer, RuntimeConfig};

use crate::system::event::{self, Events};
use crate::system::resources::DistanceSensorResources;
use crate::system::state::{CALIBRATION, CONFIG, MEASUREMENT};
use crate::task::power::ScratchSlot;

/// Pipeline as wired on the board
pub type LevelPipeline = MeasurementPipeline<'static, PulseTimer<Output<'static>, Input<'static>, Delay>, Delay, ScratchSlot>;

/// Builds the pipeline and claims the measurement writer
///
/// `None` when the writer is already taken.
pub fn pipeline(r: DistanceSensorResources, config: &RuntimeConfig) -> Option<LevelPipeline> {
    let writer = MEASUREMENT.writer()?;
    let trigger = Output::new(r.trigger_pin, Level::Low);
    let echo = Input::new(r.echo_pin, Pull::None);
    let sensor = PulseTimer::new(trigger, echo, Delay);
    Some(MeasurementPipeline::new(sensor, Delay, config, ScratchSlot, writer))
}

/// Interactive sampling task
#[embassy_executor::task]
pub async fn sample(mut pipeline: LevelPipeline) {
    info!("Sampling started");
    loop {
        let config = CONFIG.get();
        pipeline.reconfigure(&config);

        let snapshot = pipeline.run_round(&CALIBRATION).await;
        debug!(
            "round: measured {:?} height {:?} echo {} us",
            snapshot.measured_cm, snapshot.estimated_height_cm, snapshot.last_duration_us
        );
        event::send(Events::MeasurementUpdated).await;

        Timer::after_millis(u64::from(config.measure_interval_ms)).await;
    }
}
