//! Exponential moving average
//!
//! ```text
//! avg = avg * (1 - alpha) + new * alpha
//! ```
//!
//! The average lives in a [`RetainedSlot`]. On the target that slot survives deep sleep, so a
//! periodic wake continues from the last estimate instead of converging again. The slot is
//! unset after a cold boot; the first valid sample then initializes the average directly.
//! Invalid samples leave the average untouched.

use portable_atomic::{AtomicU32, Ordering};

/// Weight used when the configured alpha is outside (0, 1]
pub const DEFAULT_ALPHA: f32 = 0.25;

/// A single `f32` that may be unset
///
/// Implementations decide how long the value lives. Callers only see load/store.
pub trait RetainedSlot {
    fn load(&self) -> Option<f32>;
    fn store(&self, value: f32);
    fn clear(&self);
}

impl<T: RetainedSlot + ?Sized> RetainedSlot for &T {
    fn load(&self) -> Option<f32> {
        (**self).load()
    }
    fn store(&self, value: f32) {
        (**self).store(value)
    }
    fn clear(&self) {
        (**self).clear()
    }
}

const UNSET: u32 = u32::MAX;

/// Plain RAM slot, lost on every reset
pub struct VolatileSlot(AtomicU32);

impl VolatileSlot {
    pub const fn new() -> Self {
        Self(AtomicU32::new(UNSET))
    }
}

impl Default for VolatileSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl RetainedSlot for VolatileSlot {
    fn load(&self) -> Option<f32> {
        match self.0.load(Ordering::Acquire) {
            UNSET => None,
            bits => Some(f32::from_bits(bits)),
        }
    }

    fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Release);
    }

    fn clear(&self) {
        self.0.store(UNSET, Ordering::Release);
    }
}

/// Clamps a configured weight into (0, 1]
pub fn sanitize_alpha(alpha: f32) -> f32 {
    if alpha > 0.0 && alpha <= 1.0 {
        alpha
    } else {
        DEFAULT_ALPHA
    }
}

/// EMA over stabilized samples
pub struct Smoother<S> {
    alpha: f32,
    slot: S,
}

impl<S: RetainedSlot> Smoother<S> {
    pub fn new(alpha: f32, slot: S) -> Self {
        Self {
            alpha: sanitize_alpha(alpha),
            slot,
        }
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    /// Current average, `None` until the first valid sample
    pub fn current(&self) -> Option<f32> {
        self.slot.load().filter(|v| v.is_finite())
    }

    /// Folds `sample` into the average and returns the result
    ///
    /// `None` or a non-finite sample returns the unchanged average.
    pub fn update(&mut self, sample: Option<f32>) -> Option<f32> {
        let Some(new) = sample.filter(|v| v.is_finite()) else {
            return self.current();
        };

        let avg = match self.current() {
            Some(prev) => prev * (1.0 - self.alpha) + new * self.alpha,
            None => {
                debug!("ema initialized at {}", new);
                new
            }
        };
        self.slot.store(avg);
        Some(avg)
    }

    /// Forgets the average
    pub fn reset(&mut self) {
        self.slot.clear();
    }
}
