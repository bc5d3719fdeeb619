//! Outbound publishing of the measurement
//!
//! A periodic publisher and the on-demand "send now" request share one [`PublishGate`]. The gate
//! is a compare-and-swap on a busy flag: whoever loses the race gets [`PublishError::Busy`] at
//! once instead of queuing behind a slow broker.

use core::fmt::Write;

use heapless::String;
use portable_atomic::{AtomicBool, Ordering};

use crate::state::{MeasurementSnapshot, SharedMeasurement};

/// Longest payload [`MeasurementPayload::to_json`] produces
pub const PAYLOAD_CAPACITY: usize = 160;

/// Publish failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PublishError {
    /// Another publish is in flight
    Busy,
    /// Publishing is switched off
    Disabled,
    /// The broker could not be reached
    Connect,
    /// The broker did not take the message
    Send,
}

/// What goes on the wire
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MeasurementPayload {
    pub measured_cm: Option<f32>,
    pub estimated_cm: Option<f32>,
    pub duration_us: u32,
}

impl From<MeasurementSnapshot> for MeasurementPayload {
    fn from(snapshot: MeasurementSnapshot) -> Self {
        Self {
            measured_cm: snapshot.measured_cm,
            estimated_cm: snapshot.estimated_height_cm,
            duration_us: snapshot.last_duration_us,
        }
    }
}

impl MeasurementPayload {
    /// `{"measured_cm":12.00,"estimated_cm":60.00,"duration_us":699}`, `null` where unavailable
    pub fn to_json(&self) -> String<PAYLOAD_CAPACITY> {
        let mut out = String::new();
        // capacity covers the longest f32 with two decimals twice
        let _ = out.push_str("{\"measured_cm\":");
        let _ = write_decimal(&mut out, self.measured_cm, 2);
        let _ = out.push_str(",\"estimated_cm\":");
        let _ = write_decimal(&mut out, self.estimated_cm, 2);
        let _ = write!(out, ",\"duration_us\":{}}}", self.duration_us);
        out
    }
}

/// Writes `value` with `decimals` places, `null` for `None` or non-finite values
pub(crate) fn write_decimal<W: Write>(out: &mut W, value: Option<f32>, decimals: usize) -> core::fmt::Result {
    match value.filter(|v| v.is_finite()) {
        Some(v) => write!(out, "{:.*}", decimals, v),
        None => out.write_str("null"),
    }
}

/// Sends a payload to the broker
///
/// Implementations connect, send and disconnect within one call.
#[allow(async_fn_in_trait)]
pub trait Publisher {
    async fn publish(&self, payload: &MeasurementPayload) -> Result<(), PublishError>;
}

impl<P: Publisher + ?Sized> Publisher for &P {
    async fn publish(&self, payload: &MeasurementPayload) -> Result<(), PublishError> {
        (**self).publish(payload).await
    }
}

/// At most one publish in flight
pub struct PublishGate {
    busy: AtomicBool,
    enabled: AtomicBool,
}

/// Holds the gate, releases it on drop
pub struct GateGuard<'a> {
    gate: &'a PublishGate,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.busy.store(false, Ordering::Release);
    }
}

impl PublishGate {
    pub const fn new(enabled: bool) -> Self {
        Self {
            busy: AtomicBool::new(false),
            enabled: AtomicBool::new(enabled),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Takes the gate without waiting
    pub fn try_acquire(&self) -> Option<GateGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| GateGuard { gate: self })
    }

    /// Publishes the latest snapshot unless another publish is running
    ///
    /// The gate is released on every return path.
    pub async fn try_publish<P: Publisher>(
        &self,
        publisher: &P,
        state: &SharedMeasurement,
    ) -> Result<(), PublishError> {
        let Some(_guard) = self.try_acquire() else {
            debug!("publish skipped, busy");
            return Err(PublishError::Busy);
        };
        if !self.is_enabled() {
            debug!("publish skipped, disabled");
            return Err(PublishError::Disabled);
        }

        let payload = MeasurementPayload::from(state.snapshot());
        match publisher.publish(&payload).await {
            Ok(()) => {
                info!("published {:?}", payload);
                Ok(())
            }
            Err(e) => {
                warn!("publish failed: {:?}", e);
                Err(e)
            }
        }
    }
}

impl Default for PublishGate {
    fn default() -> Self {
        Self::new(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::{Cell, RefCell};
    use embassy_futures::{block_on, join::join};
    use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
    use embassy_sync::signal::Signal;

    /// Records payloads, optionally waits for a release signal first
    struct Broker<'a> {
        sent: RefCell<std::vec::Vec<MeasurementPayload>>,
        hold: Option<&'a Signal<CriticalSectionRawMutex, ()>>,
        fail: Cell<Option<PublishError>>,
    }

    impl<'a> Broker<'a> {
        fn new(hold: Option<&'a Signal<CriticalSectionRawMutex, ()>>) -> Self {
            Self {
                sent: RefCell::new(std::vec::Vec::new()),
                hold,
                fail: Cell::new(None),
            }
        }
    }

    impl Publisher for Broker<'_> {
        async fn publish(&self, payload: &MeasurementPayload) -> Result<(), PublishError> {
            if let Some(hold) = self.hold {
                hold.wait().await;
            }
            if let Some(e) = self.fail.get() {
                return Err(e);
            }
            self.sent.borrow_mut().push(*payload);
            Ok(())
        }
    }

    fn state_with(measured: Option<f32>, height: Option<f32>, duration: u32) -> SharedMeasurement {
        let state = SharedMeasurement::new();
        if let Some(mut writer) = state.writer() {
            writer.publish(MeasurementSnapshot {
                measured_cm: measured,
                estimated_height_cm: height,
                last_duration_us: duration,
            });
        }
        state
    }

    #[test]
    fn json_with_and_without_values() {
        let full = MeasurementPayload {
            measured_cm: Some(12.0),
            estimated_cm: Some(60.5),
            duration_us: 699,
        };
        assert_eq!(
            full.to_json().as_str(),
            r#"{"measured_cm":12.00,"estimated_cm":60.50,"duration_us":699}"#
        );

        let empty = MeasurementPayload {
            measured_cm: None,
            estimated_cm: Some(f32::NAN),
            duration_us: 0,
        };
        assert_eq!(
            empty.to_json().as_str(),
            r#"{"measured_cm":null,"estimated_cm":null,"duration_us":0}"#
        );
    }

    #[test]
    fn json_fits_extreme_values() {
        let payload = MeasurementPayload {
            measured_cm: Some(-f32::MAX),
            estimated_cm: Some(f32::MAX),
            duration_us: u32::MAX,
        };
        assert!(payload.to_json().ends_with("4294967295}"));
    }

    #[test]
    fn publishes_latest_snapshot() {
        let gate = PublishGate::new(true);
        let broker = Broker::new(None);
        let state = state_with(Some(42.0), None, 2_449);

        assert_eq!(block_on(gate.try_publish(&broker, &state)), Ok(()));
        assert_eq!(
            broker.sent.borrow().as_slice(),
            &[MeasurementPayload {
                measured_cm: Some(42.0),
                estimated_cm: None,
                duration_us: 2_449,
            }]
        );
        assert!(!gate.is_busy());
    }

    #[test]
    fn concurrent_publish_reports_busy() {
        let release = Signal::<CriticalSectionRawMutex, ()>::new();
        let gate = PublishGate::new(true);
        let slow = Broker::new(Some(&release));
        let fast = Broker::new(None);
        let state = state_with(Some(10.0), Some(50.0), 583);

        let (first, second) = block_on(join(gate.try_publish(&slow, &state), async {
            let result = gate.try_publish(&fast, &state).await;
            release.signal(());
            result
        }));

        assert_eq!(first, Ok(()));
        assert_eq!(second, Err(PublishError::Busy));
        assert_eq!(slow.sent.borrow().len(), 1);
        assert!(fast.sent.borrow().is_empty());
        assert!(!gate.is_busy());
    }

    #[test]
    fn failures_release_the_gate() {
        let gate = PublishGate::new(true);
        let broker = Broker::new(None);
        let state = state_with(None, None, 0);

        broker.fail.set(Some(PublishError::Connect));
        assert_eq!(block_on(gate.try_publish(&broker, &state)), Err(PublishError::Connect));
        assert!(!gate.is_busy());

        broker.fail.set(Some(PublishError::Send));
        assert_eq!(block_on(gate.try_publish(&broker, &state)), Err(PublishError::Send));

        broker.fail.set(None);
        assert_eq!(block_on(gate.try_publish(&broker, &state)), Ok(()));
    }

    #[test]
    fn disabled_gate_does_not_publish() {
        let gate = PublishGate::new(false);
        let broker = Broker::new(None);
        let state = state_with(Some(1.0), None, 58);

        assert_eq!(block_on(gate.try_publish(&broker, &state)), Err(PublishError::Disabled));
        assert!(broker.sent.borrow().is_empty());
        assert!(!gate.is_busy());

        gate.set_enabled(true);
        assert_eq!(block_on(gate.try_publish(&broker, &state)), Ok(()));
    }

    #[test]
    fn guard_is_exclusive() {
        let gate = PublishGate::new(true);
        let guard = gate.try_acquire();
        assert!(guard.is_some());
        assert!(gate.try_acquire().is_none());
        drop(guard);
        assert!(gate.try_acquire().is_some());
    }
}
