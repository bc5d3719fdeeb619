//! Inactivity tracking
//!
//! Monitors user interaction and requests deep sleep once the interactive session has been idle
//! for the configured timeout. While the co-processor serves its access point the deadline keeps
//! moving. A changed interactive timeout applies to the running session.

use crate::system::event::{self, Events};
use crate::system::activity;
use crate::system::state::{CONFIG, SYSTEM_STATE};
use crate::task::modem::Modem;
use defmt::info;
use embassy_futures::select::{select, Either};
use embassy_time::{Duration, Instant, Timer};
use tank_core::Network;

/// Inactivity monitoring task
#[embassy_executor::task]
pub async fn track_inactivity() {
    loop {
        let deadline = match SYSTEM_STATE.lock().await.power.as_mut() {
            Some(power) => {
                power.reconfigure(&CONFIG.get());
                power.deadline()
            }
            None => return,
        };

        // the timeout has to be exceeded, not just reached
        match select(Timer::at(deadline + Duration::from_millis(1)), activity::wait()).await {
            Either::First(_) => {
                let plan = {
                    let mut state = SYSTEM_STATE.lock().await;
                    let Some(power) = state.power.as_mut() else {
                        return;
                    };
                    power.reconfigure(&CONFIG.get());
                    power.poll(Instant::now(), Modem.access_point_active())
                };
                if let Some(plan) = plan {
                    info!("inactive, requesting sleep");
                    event::send(Events::SleepRequested(plan)).await;
                    return;
                }
            }
            Either::Second(_) => {
                if let Some(power) = SYSTEM_STATE.lock().await.power.as_mut() {
                    power.touch(Instant::now());
                }
            }
        }
    }
}
