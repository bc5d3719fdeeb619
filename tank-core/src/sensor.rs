//! Ultrasonic echo timing
//!
//! Drives an HC-SR04 style transducer: a trigger pulse of at least 10µs starts a burst, the
//! echo line then stays high for the round-trip time of the sound.
//!
//! # Conversion
//! ```text
//! distance_cm = duration_us * 0.01715
//! ```
//! 0.0343 cm/µs speed of sound at ~20°C, halved for the round trip.
//!
//! # Timeout
//! The whole echo (rising and falling edge) must complete within 30ms, which covers about 5m.
//! A missing echo is not an error for the caller, it is an invalid [`RawSample`] with a zero
//! duration. Retrying is left to the caller.

use embassy_time::{with_deadline, Duration, Instant};
use embedded_hal::digital::OutputPin;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::digital::Wait;

/// Centimeters per microsecond of echo round trip
pub const CM_PER_US: f32 = 0.01715;

/// Longest echo we wait for (≈ 5m range)
pub const ECHO_TIMEOUT: Duration = Duration::from_millis(30);

/// Settle time with the trigger held low before a new burst
const TRIGGER_SETTLE_US: u32 = 5;

/// Width of the trigger pulse, the transducer needs at least 10µs
const TRIGGER_PULSE_US: u32 = 20;

/// One trigger/echo cycle
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RawSample {
    /// Echo high time in µs, 0 when no echo was seen
    pub duration_us: u32,
    /// Distance in cm, -1.0 when no echo was seen
    pub distance_cm: f32,
}

impl RawSample {
    /// Sentinel for a missing echo
    pub const NO_ECHO: Self = Self {
        duration_us: 0,
        distance_cm: -1.0,
    };

    /// Converts an echo duration to a sample
    pub fn from_duration_us(duration_us: u32) -> Self {
        if duration_us == 0 {
            return Self::NO_ECHO;
        }
        Self {
            duration_us,
            distance_cm: duration_us as f32 * CM_PER_US,
        }
    }

    /// True when an echo was received
    pub fn is_valid(&self) -> bool {
        self.duration_us != 0
    }
}

/// Reasons a single echo measurement did not produce a duration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EchoError {
    /// No complete echo within [`ECHO_TIMEOUT`]
    Timeout,
    /// A pin reported an error
    Pin,
}

/// Anything that can produce one raw sample per call
#[allow(async_fn_in_trait)]
pub trait EchoSensor {
    /// Triggers the transducer once and reports the echo
    async fn sample_once(&mut self) -> RawSample;
}

/// Trigger/echo timer over generic `embedded-hal` pins
pub struct PulseTimer<T, E, D> {
    trigger: T,
    echo: E,
    delay: D,
}

impl<T, E, D> PulseTimer<T, E, D>
where
    T: OutputPin,
    E: Wait,
    D: DelayNs,
{
    pub fn new(trigger: T, echo: E, delay: D) -> Self {
        Self { trigger, echo, delay }
    }

    /// Fires the trigger and times the echo high phase
    pub async fn echo_duration(&mut self) -> Result<Duration, EchoError> {
        self.trigger.set_low().map_err(|_| EchoError::Pin)?;
        self.delay.delay_us(TRIGGER_SETTLE_US).await;
        self.trigger.set_high().map_err(|_| EchoError::Pin)?;
        self.delay.delay_us(TRIGGER_PULSE_US).await;
        self.trigger.set_low().map_err(|_| EchoError::Pin)?;

        let deadline = Instant::now() + ECHO_TIMEOUT;

        with_deadline(deadline, self.echo.wait_for_high())
            .await
            .map_err(|_| EchoError::Timeout)?
            .map_err(|_| EchoError::Pin)?;
        let start = Instant::now();

        with_deadline(deadline, self.echo.wait_for_low())
            .await
            .map_err(|_| EchoError::Timeout)?
            .map_err(|_| EchoError::Pin)?;

        Ok(Instant::now() - start)
    }

    /// Releases the pins
    pub fn release(self) -> (T, E, D) {
        (self.trigger, self.echo, self.delay)
    }
}

impl<T, E, D> EchoSensor for PulseTimer<T, E, D>
where
    T: OutputPin,
    E: Wait,
    D: DelayNs,
{
    async fn sample_once(&mut self) -> RawSample {
        match self.echo_duration().await {
            Ok(duration) => {
                let micros = u32::try_from(duration.as_micros()).unwrap_or(u32::MAX);
                RawSample::from_duration_us(micros)
            }
            Err(e) => {
                trace!("echo failed: {:?}", e);
                RawSample::NO_ECHO
            }
        }
    }
}
