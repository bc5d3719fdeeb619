//! Timed deep sleep on the RP2350
//!
//! The chip has no RTC domain that keeps RAM through a low-power reset, but the watchdog scratch
//! registers survive a watchdog reset and are cleared by power-on. Deep sleep therefore is:
//!
//! 1. write a sleep marker and the remaining seconds to scratch
//! 2. arm the watchdog for the next chunk (at most [`MAX_CHUNK_S`])
//! 3. wait in `wfi` until the watchdog resets the chip
//!
//! On boot, a watchdog reset carrying the marker either continues sleeping (time left) or is a
//! timer wake. Anything else is a cold boot and clears scratch, which also unsets the retained
//! EMA.

use core::cell::RefCell;

use defmt::{info, warn};
use embassy_rp::watchdog::{ResetReason, Watchdog};
use embassy_sync::blocking_mutex::{raw::CriticalSectionRawMutex, Mutex};
use embassy_time::Duration;
use tank_core::{PowerControl, RetainedSlot, SleepPlan, WakeCause};

use crate::system::resources::PowerResources;

/// Longest single watchdog period used while sleeping
const MAX_CHUNK_S: u32 = 8;

/// Marks a reset as part of a deep sleep
const SLEEP_MARKER: u32 = 0x5EE9_7A4C;

/// Scratch register layout
const SCRATCH_MARKER: usize = 0;
const SCRATCH_REMAINING_S: usize = 1;
const SCRATCH_EMA: usize = 2;
const SCRATCH_EMA_CHECK: usize = 3;

/// The watchdog, shared by the wake logic and the retained slot
static WATCHDOG: Mutex<CriticalSectionRawMutex, RefCell<Option<Watchdog>>> = Mutex::new(RefCell::new(None));

fn with_watchdog<R>(f: impl FnOnce(&mut Watchdog) -> R) -> Option<R> {
    WATCHDOG.lock(|cell| cell.borrow_mut().as_mut().map(f))
}

/// Takes over the watchdog and determines why we are running
///
/// Does not return while a deep sleep still has time left.
pub fn init(r: PowerResources) -> WakeCause {
    let watchdog = Watchdog::new(r.watchdog);
    WATCHDOG.lock(|cell| cell.replace(Some(watchdog)));

    let (reason, marker, remaining) = with_watchdog(|wd| {
        (
            wd.reset_reason(),
            wd.get_scratch(SCRATCH_MARKER),
            wd.get_scratch(SCRATCH_REMAINING_S),
        )
    })
    .unwrap_or((None, 0, 0));

    match reason {
        Some(ResetReason::TimedOut) if marker == SLEEP_MARKER => {
            if remaining > 0 {
                sleep_chunk()
            }
            with_watchdog(|wd| wd.set_scratch(SCRATCH_MARKER, 0));
            WakeCause::Timer
        }
        _ => {
            with_watchdog(|wd| {
                for i in SCRATCH_MARKER..=SCRATCH_EMA_CHECK {
                    wd.set_scratch(i, 0);
                }
            });
            WakeCause::Other
        }
    }
}

/// Sleeps for the next chunk of the remaining time
fn sleep_chunk() -> ! {
    let armed = with_watchdog(|wd| {
        let remaining = wd.get_scratch(SCRATCH_REMAINING_S);
        let chunk = remaining.clamp(1, MAX_CHUNK_S);
        wd.set_scratch(SCRATCH_REMAINING_S, remaining.saturating_sub(chunk));
        wd.set_scratch(SCRATCH_MARKER, SLEEP_MARKER);
        wd.start(Duration::from_secs(u64::from(chunk)));
    });
    if armed.is_none() {
        cortex_m::peripheral::SCB::sys_reset();
    }

    loop {
        cortex_m::asm::wfi();
    }
}

/// Platform deep sleep
pub struct Platform;

impl PowerControl for Platform {
    fn deep_sleep(&mut self, plan: SleepPlan) -> ! {
        let seconds = u32::try_from(plan.wake_after.as_secs()).unwrap_or(u32::MAX);
        info!("sleeping for {} s", seconds);
        if with_watchdog(|wd| wd.set_scratch(SCRATCH_REMAINING_S, seconds)).is_none() {
            warn!("watchdog not initialized, resetting now");
        }
        sleep_chunk()
    }
}

/// EMA slot in watchdog scratch, survives deep sleep but not power loss
///
/// A second register holds the complement of the value; a mismatch means unset.
pub struct ScratchSlot;

impl RetainedSlot for ScratchSlot {
    fn load(&self) -> Option<f32> {
        with_watchdog(|wd| {
            let bits = wd.get_scratch(SCRATCH_EMA);
            (wd.get_scratch(SCRATCH_EMA_CHECK) == !bits).then(|| f32::from_bits(bits))
        })
        .flatten()
    }

    fn store(&self, value: f32) {
        let bits = value.to_bits();
        with_watchdog(|wd| {
            wd.set_scratch(SCRATCH_EMA, bits);
            wd.set_scratch(SCRATCH_EMA_CHECK, !bits);
        });
    }

    fn clear(&self) {
        with_watchdog(|wd| {
            wd.set_scratch(SCRATCH_EMA, 0);
            wd.set_scratch(SCRATCH_EMA_CHECK, 0);
        });
    }
}
