//! Tank level node core
//!
//! Everything in the node that carries an invariant lives here, free of any HAL:
//!
//! - [`sensor`]: echo timing of the ultrasonic transducer
//! - [`filter`]: median over a burst of raw samples
//! - [`smoothing`]: EMA whose state survives deep sleep
//! - [`calibration`]: quadratic mapping from distance to liquid height
//! - [`state`]: the measurement snapshot shared between the sampler and its readers
//! - [`pipeline`]: one sampling round from transducer to snapshot
//! - [`publish`]: non-blocking guard around outbound publishes
//! - [`power`]: periodic-wake / interactive lifecycle
//! - [`config`]: runtime settings, editable over the request bridge
//! - [`service`]: request handling for the web front end
//!
//! The firmware crate binds these to the RP2350 peripherals.

#![cfg_attr(not(test), no_std)]

mod fmt; // must be first, the log macros are textually scoped

pub mod calibration;
pub mod config;
pub mod filter;
pub mod pipeline;
pub mod power;
pub mod publish;
pub mod sensor;
pub mod service;
pub mod smoothing;
pub mod state;
pub mod storage;

pub use calibration::{Calibration, CalibrationPoint, PolynomialModel, TankLevels};
pub use config::{ConfigProvider, ConfigUpdate, RuntimeConfig, Setting, SettingValue};
pub use filter::StabilityFilter;
pub use pipeline::MeasurementPipeline;
pub use power::{Network, NetworkError, PowerControl, PowerLifecycle, PowerState, SleepPlan, WakeCause};
pub use publish::{MeasurementPayload, PublishError, PublishGate, Publisher};
pub use sensor::{EchoSensor, PulseTimer, RawSample};
pub use smoothing::{RetainedSlot, Smoother, VolatileSlot};
pub use service::{LineReader, Request, RequestError, RequestService};
pub use state::{LinkStatus, MeasurementSnapshot, MeasurementWriter, SharedCalibration, SharedConfig, SharedMeasurement};
pub use storage::{MemoryStore, SettingsStore, StoreError};
