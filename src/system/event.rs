//! System Events
//!
//! Defines events and channels for inter-task communication.

use defmt::Format;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use tank_core::SleepPlan;

/// Multi-producer, single-consumer event channel with capacity of 10
pub static EVENT_CHANNEL: Channel<CriticalSectionRawMutex, Events, 10> = Channel::new();

/// Sends an event to the system channel
pub async fn send(event: Events) {
    EVENT_CHANNEL.sender().send(event).await;
}

/// Receives the next event from the system channel
pub async fn wait() -> Events {
    EVENT_CHANNEL.receiver().receive().await
}

/// System-wide events
#[derive(Debug, Clone, Copy, Format)]
pub enum Events {
    /// The co-processor started or stopped serving its access point
    AccessPointChanged(bool),
    /// The station link went up or down
    LinkChanged(bool),
    /// A new measurement round finished
    MeasurementUpdated,
    /// The interactive session is over
    SleepRequested(SleepPlan),
}
