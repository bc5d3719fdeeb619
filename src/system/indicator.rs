//! System Indicator Module
//!
//! Wakes the LED task when there is something new to show.
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;

/// Signal for indicator refreshes, `true` asks for a short affirm blink first
pub static SYSTEM_INDICATOR_CHANGED: Signal<CriticalSectionRawMutex, bool> = Signal::new();

/// Requests an indicator refresh
pub fn update(affirm: bool) {
    SYSTEM_INDICATOR_CHANGED.signal(affirm);
}

/// Waits for the next refresh request
pub async fn wait() -> bool {
    SYSTEM_INDICATOR_CHANGED.wait().await
}
