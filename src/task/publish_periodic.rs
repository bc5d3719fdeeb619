//! Periodic publishing while interactive
//!
//! Every publish interval the latest snapshot goes to the broker, through the same gate the
//! on-demand `send` request uses. A publish still in flight makes this tick a no-op.

use defmt::{debug, info, warn};
use embassy_time::Timer;
use tank_core::power::publish_once;
use tank_core::PublishError;

use crate::system::state::{CONFIG, MEASUREMENT, PUBLISH_GATE};
use crate::task::modem::Modem;

#[embassy_executor::task]
pub async fn publish_periodic() {
    info!("Periodic publishing started");
    loop {
        Timer::after_secs(u64::from(CONFIG.get().publish_interval_s)).await;

        match publish_once(&Modem, &Modem, &PUBLISH_GATE, &MEASUREMENT, &CONFIG.get()).await {
            Ok(()) => debug!("published"),
            Err(PublishError::Disabled) => {}
            Err(PublishError::Busy) => debug!("publish already in flight"),
            Err(e) => warn!("publish failed: {:?}", e),
        }
    }
}
