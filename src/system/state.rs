//! System State Management
//!
//! Shared state of the node:
//! - the latest measurement snapshot, written by the sampling task only
//! - the calibration, replaced as a whole by the request task
//! - the publish gate shared by the periodic and on-demand publishers
//! - the runtime configuration, replaced as a whole by `main` and the request task
//! - power lifecycle and link status, behind one async mutex
//!
//! # State Access Pattern
//! ```rust
//! let config = CONFIG.get();
//! let snapshot = MEASUREMENT.snapshot();
//! let access_point_active = SYSTEM_STATE.lock().await.access_point_active;
//! ```

use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, mutex::Mutex};
use tank_core::{PowerLifecycle, PublishGate, SharedCalibration, SharedConfig, SharedMeasurement};

/// Latest measurement round
pub static MEASUREMENT: SharedMeasurement = SharedMeasurement::new();

/// Calibration points and tank references
pub static CALIBRATION: SharedCalibration = SharedCalibration::new();

/// Runtime configuration, defaults until `main` has loaded it
pub static CONFIG: SharedConfig = SharedConfig::new();

/// Guard around outbound publishes, enabled from the loaded configuration
pub static PUBLISH_GATE: PublishGate = PublishGate::new(false);

/// Global system state protected by a mutex
pub static SYSTEM_STATE: Mutex<CriticalSectionRawMutex, SystemState> = Mutex::new(SystemState {
    power: None,
    access_point_active: false,
    link_up: false,
});

/// Node state that is neither measurement nor calibration
pub struct SystemState {
    /// Interactive session lifecycle, `None` on a periodic wake
    pub power: Option<PowerLifecycle>,
    /// Last reported access point status
    pub access_point_active: bool,
    /// Last reported station link status
    pub link_up: bool,
}
