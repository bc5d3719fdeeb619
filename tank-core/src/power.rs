//! Power lifecycle
//!
//! ```text
//!   wake: other ──► ColdBoot ──boot_complete──► Interactive ──inactive, no AP──┐
//!   wake: timer ──► PeriodicMeasure ──periodic_complete────────────────────────┤
//!                                                                              ▼
//!                                                                     DeepSleepPending ──► (reset)
//! ```
//!
//! `DeepSleepPending` is terminal for the running execution. The platform stops the core and
//! the next wake starts over from the entry point with a fresh [`WakeCause`].
//!
//! While the node acts as its own access point it never sleeps: an inactivity timeout restarts
//! the timer instead, someone may be configuring it without generating requests.

use core::convert::Infallible;

use embassy_time::{with_timeout, Duration, Instant};
use embedded_hal_async::delay::DelayNs;

use crate::config::ConfigProvider;
use crate::pipeline::MeasurementPipeline;
use crate::publish::{PublishError, PublishGate, Publisher};
use crate::sensor::EchoSensor;
use crate::smoothing::RetainedSlot;
use crate::state::{MeasurementSnapshot, SharedCalibration, SharedMeasurement};

/// Rounds taken on a periodic wake
pub const PERIODIC_ROUNDS: u8 = 3;

/// Pause after each periodic round
pub const PERIODIC_SETTLE: Duration = Duration::from_millis(200);

/// Why execution (re)started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WakeCause {
    /// The sleep timer expired
    Timer,
    /// Power-on, reset, external interrupt
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerState {
    ColdBoot,
    PeriodicMeasure,
    Interactive,
    DeepSleepPending,
}

/// What the platform needs to enter deep sleep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SleepPlan {
    pub wake_after: Duration,
}

impl SleepPlan {
    pub fn from_config(config: &impl ConfigProvider) -> Self {
        Self {
            wake_after: Duration::from_secs(u64::from(config.deep_sleep_interval_s().max(1))),
        }
    }
}

/// Network failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NetworkError {
    /// No link within the allowed time
    Timeout,
    /// The link layer refused
    Unavailable,
}

/// Link to the outside world
#[allow(async_fn_in_trait)]
pub trait Network {
    /// Brings the station link up, giving up after `timeout`
    async fn connect(&self, timeout: Duration) -> Result<(), NetworkError>;
    async fn disconnect(&self);
    fn is_connected(&self) -> bool;
    /// The node serves its own access point
    fn access_point_active(&self) -> bool;
}

impl<N: Network + ?Sized> Network for &N {
    async fn connect(&self, timeout: Duration) -> Result<(), NetworkError> {
        (**self).connect(timeout).await
    }
    async fn disconnect(&self) {
        (**self).disconnect().await
    }
    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }
    fn access_point_active(&self) -> bool {
        (**self).access_point_active()
    }
}

/// Platform deep sleep
pub trait PowerControl {
    /// Arms the wake timer and stops; never returns
    fn deep_sleep(&mut self, plan: SleepPlan) -> !;
}

/// Lifecycle state machine
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerLifecycle {
    state: PowerState,
    last_interaction: Instant,
    interactive_timeout: Duration,
    plan: SleepPlan,
}

impl PowerLifecycle {
    /// Initial state for a wake
    pub fn on_wake(cause: WakeCause, config: &impl ConfigProvider, now: Instant) -> Self {
        let state = match cause {
            WakeCause::Timer => PowerState::PeriodicMeasure,
            WakeCause::Other => PowerState::ColdBoot,
        };
        info!("wake {:?} -> {:?}", cause, state);
        Self {
            state,
            last_interaction: now,
            interactive_timeout: Duration::from_millis(u64::from(config.interactive_timeout_ms().max(1))),
            plan: SleepPlan::from_config(config),
        }
    }

    pub fn state(&self) -> PowerState {
        self.state
    }

    /// Persisted state is loaded, start the interactive session
    pub fn boot_complete(&mut self, now: Instant) {
        if self.state == PowerState::ColdBoot {
            self.transition(PowerState::Interactive);
            self.last_interaction = now;
        }
    }

    /// Picks up a changed configuration, the current session keeps its last interaction
    pub fn reconfigure(&mut self, config: &impl ConfigProvider) {
        self.interactive_timeout = Duration::from_millis(u64::from(config.interactive_timeout_ms().max(1)));
        self.plan = SleepPlan::from_config(config);
    }

    /// A user interaction
    pub fn touch(&mut self, now: Instant) {
        if self.state == PowerState::Interactive {
            self.last_interaction = now;
        }
    }

    /// When the interactive session times out without another touch
    pub fn deadline(&self) -> Instant {
        self.last_interaction + self.interactive_timeout
    }

    /// Checks the inactivity timeout
    ///
    /// Returns the sleep plan once the session is over. With the access point up the timer is
    /// restarted instead.
    pub fn poll(&mut self, now: Instant, access_point_active: bool) -> Option<SleepPlan> {
        if self.state != PowerState::Interactive {
            return None;
        }
        if now.saturating_duration_since(self.last_interaction) <= self.interactive_timeout {
            return None;
        }
        if access_point_active {
            info!("inactive, but access point is up: staying awake");
            self.last_interaction = now;
            return None;
        }
        self.transition(PowerState::DeepSleepPending);
        Some(self.plan)
    }

    /// The periodic wake is done, sleep again
    pub fn periodic_complete(&mut self) -> Option<SleepPlan> {
        if self.state != PowerState::PeriodicMeasure {
            return None;
        }
        self.transition(PowerState::DeepSleepPending);
        Some(self.plan)
    }

    fn transition(&mut self, next: PowerState) {
        info!("power {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

/// Work of a periodic wake
///
/// Takes [`PERIODIC_ROUNDS`] rounds, then publishes once if enabled. A failing network only
/// costs this cycle's publish, the returned plan is always the next sleep.
#[allow(clippy::too_many_arguments)]
pub async fn run_periodic_cycle<S, D, R, W, N, P>(
    lifecycle: &mut PowerLifecycle,
    pipeline: &mut MeasurementPipeline<'_, S, D, R>,
    calibration: &SharedCalibration,
    settle: &mut W,
    network: &N,
    publisher: &P,
    gate: &PublishGate,
    state: &SharedMeasurement,
    config: &impl ConfigProvider,
) -> SleepPlan
where
    S: EchoSensor,
    D: DelayNs,
    R: RetainedSlot,
    W: DelayNs,
    N: Network,
    P: Publisher,
{
    let mut last = MeasurementSnapshot::EMPTY;
    for _ in 0..PERIODIC_ROUNDS {
        last = pipeline.run_round(calibration).await;
        settle.delay_ms(PERIODIC_SETTLE.as_millis() as u32).await;
    }
    info!("periodic measurement {:?}", last.measured_cm);

    if config.publish_enabled() {
        match publish_once(network, publisher, gate, state, config).await {
            Ok(()) => {}
            Err(e) => warn!("periodic publish skipped: {:?}", e),
        }
    }

    lifecycle.periodic_complete().unwrap_or_else(|| SleepPlan::from_config(config))
}

/// Brings the link up within the configured timeout, then publishes through the gate
///
/// A disabled or busy gate answers before any network traffic.
pub async fn publish_once<N, P>(
    network: &N,
    publisher: &P,
    gate: &PublishGate,
    state: &SharedMeasurement,
    config: &impl ConfigProvider,
) -> Result<(), PublishError>
where
    N: Network,
    P: Publisher,
{
    if !gate.is_enabled() {
        return Err(PublishError::Disabled);
    }
    if gate.is_busy() {
        return Err(PublishError::Busy);
    }
    let timeout = Duration::from_millis(u64::from(config.network_timeout_ms()));
    let connected = match with_timeout(timeout, network.connect(timeout)).await {
        Ok(result) => result,
        Err(_) => Err(NetworkError::Timeout),
    };
    if let Err(e) = connected {
        warn!("network: {:?}", e);
        return Err(PublishError::Connect);
    }
    gate.try_publish(publisher, state).await
}

/// Closes the network session and hands over to the platform
pub async fn enter_sleep<N: Network, C: PowerControl>(network: &N, control: &mut C, plan: SleepPlan) -> Infallible {
    if network.is_connected() {
        network.disconnect().await;
    }
    info!("deep sleep for {} s", plan.wake_after.as_secs());
    control.deep_sleep(plan)
}
