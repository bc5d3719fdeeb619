//! Orchestrator Module
//!
//! This module contains the main orchestrator task that manages the node's interactive session
//! by handling system events and coordinating state changes.

use crate::system::event;
use crate::system::indicator;
use crate::system::state::SYSTEM_STATE;
use crate::task::modem::Modem;
use crate::task::power::Platform;
use defmt::info;
use embassy_time::Instant;
use tank_core::power::enter_sleep;

/// Main orchestrator task
///
/// Listens for system events, records them in the system state and reacts to the ones that
/// change something. Ends the session by putting the node to sleep.
#[embassy_executor::task]
pub async fn orchestrate() {
    info!("Orchestrator started");
    loop {
        // wait for an event
        let event = event::wait().await;
        // process the event and if necessary, react to it
        if let Some(state_change) = process_event(event).await {
            handle_state_changes(state_change).await;
        }
    }
}

/// Processes incoming system events and determines if they result in a state change
///
/// Returns the event if it changed the system state, `None` otherwise.
async fn process_event(event: event::Events) -> Option<event::Events> {
    let mut state = SYSTEM_STATE.lock().await;

    match event {
        event::Events::AccessPointChanged(active) => {
            if state.access_point_active != active {
                state.access_point_active = active;
                if !active {
                    // the inactivity timeout counts from the access point going down
                    if let Some(power) = state.power.as_mut() {
                        power.touch(Instant::now());
                    }
                }
                Some(event)
            } else {
                None
            }
        }
        event::Events::LinkChanged(up) => {
            if state.link_up != up {
                state.link_up = up;
                Some(event)
            } else {
                None
            }
        }
        event::Events::MeasurementUpdated => Some(event),
        event::Events::SleepRequested(_plan) => Some(event),
    }
}

/// Handles state changes resulting from events
async fn handle_state_changes(event: event::Events) {
    match event {
        event::Events::AccessPointChanged(active) => {
            info!("Access point active: {}", active);
            indicator::update(true);
        }
        event::Events::LinkChanged(up) => {
            info!("Station link up: {}", up);
        }
        event::Events::MeasurementUpdated => {
            indicator::update(false);
        }
        event::Events::SleepRequested(plan) => {
            info!("Ending interactive session");
            match enter_sleep(&Modem, &mut Platform, plan).await {}
        }
    }
}
