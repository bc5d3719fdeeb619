//! Runtime configuration
//!
//! The node's tunables, loaded from the settings store at boot. Components never reach for a
//! global, they receive a [`ConfigProvider`] when they are built.
//!
//! # Sanitization
//! Stored values may be missing, stale or simply wrong. [`RuntimeConfig::sanitized`] replaces
//! every out-of-range value with its default; components additionally clamp what they consume.

use crate::storage::{SettingsStore, StoreError};

/// Number of [`Setting`]s
pub const SETTING_COUNT: usize = 12;

/// Store keys
pub mod keys {
    pub const MEASURE_INTERVAL_MS: &str = "meas_int_ms";
    pub const MEASURE_OFFSET_CM: &str = "meas_off_cm";
    pub const EMA_ALPHA: &str = "avg_alpha";
    pub const MEDIAN_SAMPLES: &str = "median_n";
    pub const MEDIAN_DELAY_MS: &str = "median_delay_ms";
    pub const FILTER_MIN_CM: &str = "f_min_cm";
    pub const FILTER_MAX_CM: &str = "f_max_cm";
    pub const INTERACTIVE_TIMEOUT_MS: &str = "int_to_ms";
    pub const DEEP_SLEEP_INTERVAL_S: &str = "deep_int_s";
    pub const PUBLISH_ENABLED: &str = "pub_en";
    pub const PUBLISH_INTERVAL_S: &str = "pub_int_s";
    pub const NETWORK_TIMEOUT_MS: &str = "net_to_ms";
}

/// One field of [`RuntimeConfig`], addressed by its store key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Setting {
    MeasureInterval,
    MeasureOffset,
    EmaAlpha,
    MedianSamples,
    MedianDelay,
    FilterMin,
    FilterMax,
    InteractiveTimeout,
    DeepSleepInterval,
    PublishEnabled,
    PublishInterval,
    NetworkTimeout,
}

impl Setting {
    pub const ALL: [Setting; SETTING_COUNT] = [
        Self::MeasureInterval,
        Self::MeasureOffset,
        Self::EmaAlpha,
        Self::MedianSamples,
        Self::MedianDelay,
        Self::FilterMin,
        Self::FilterMax,
        Self::InteractiveTimeout,
        Self::DeepSleepInterval,
        Self::PublishEnabled,
        Self::PublishInterval,
        Self::NetworkTimeout,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Self::MeasureInterval => keys::MEASURE_INTERVAL_MS,
            Self::MeasureOffset => keys::MEASURE_OFFSET_CM,
            Self::EmaAlpha => keys::EMA_ALPHA,
            Self::MedianSamples => keys::MEDIAN_SAMPLES,
            Self::MedianDelay => keys::MEDIAN_DELAY_MS,
            Self::FilterMin => keys::FILTER_MIN_CM,
            Self::FilterMax => keys::FILTER_MAX_CM,
            Self::InteractiveTimeout => keys::INTERACTIVE_TIMEOUT_MS,
            Self::DeepSleepInterval => keys::DEEP_SLEEP_INTERVAL_S,
            Self::PublishEnabled => keys::PUBLISH_ENABLED,
            Self::PublishInterval => keys::PUBLISH_INTERVAL_S,
            Self::NetworkTimeout => keys::NETWORK_TIMEOUT_MS,
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|setting| setting.key() == key)
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Current value of a [`Setting`]
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SettingValue {
    Integer(u32),
    Decimal(f32),
    Flag(bool),
}

/// A value that does not fit its setting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InvalidSetting(pub Setting);

/// Pending changes to a [`RuntimeConfig`], raw numbers per setting
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConfigUpdate {
    values: [Option<f32>; SETTING_COUNT],
}

impl ConfigUpdate {
    pub fn set(&mut self, setting: Setting, value: f32) {
        self.values[setting.index()] = Some(value);
    }

    pub fn is_empty(&self) -> bool {
        self.values.iter().all(Option::is_none)
    }

    /// `config` with every change applied, not yet sanitized
    pub fn apply_to(&self, mut config: RuntimeConfig) -> Result<RuntimeConfig, InvalidSetting> {
        for setting in Setting::ALL {
            if let Some(value) = self.values[setting.index()] {
                config.apply(setting, value)?;
            }
        }
        Ok(config)
    }
}

/// Read-only view of the configuration
pub trait ConfigProvider {
    fn measure_interval_ms(&self) -> u32;
    fn measure_offset_cm(&self) -> f32;
    fn ema_alpha(&self) -> f32;
    fn median_samples(&self) -> u8;
    fn median_sample_delay_ms(&self) -> u16;
    fn filter_min_cm(&self) -> f32;
    fn filter_max_cm(&self) -> f32;
    fn deep_sleep_interval_s(&self) -> u32;
    fn interactive_timeout_ms(&self) -> u32;
    fn publish_enabled(&self) -> bool;
    fn publish_interval_s(&self) -> u32;
    fn network_timeout_ms(&self) -> u32;
}

/// Node configuration
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RuntimeConfig {
    /// Period of the sampling task in interactive mode
    pub measure_interval_ms: u32,
    /// Added to the smoothed distance (sensor mounting offset)
    pub measure_offset_cm: f32,
    /// EMA weight of a new sample, (0, 1]
    pub ema_alpha: f32,
    /// Raw samples per median, [1, 15]
    pub median_samples: u8,
    /// Pause after every raw sample
    pub median_delay_ms: u16,
    /// Smallest accepted raw distance
    pub filter_min_cm: f32,
    /// Largest accepted raw distance
    pub filter_max_cm: f32,
    /// Sleep time between periodic wakes
    pub deep_sleep_interval_s: u32,
    /// Inactivity before leaving interactive mode
    pub interactive_timeout_ms: u32,
    /// Publish measurements to the broker
    pub publish_enabled: bool,
    /// Period of the publish task in interactive mode
    pub publish_interval_s: u32,
    /// Bound on a network connect attempt
    pub network_timeout_ms: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl RuntimeConfig {
    pub const DEFAULT: Self = Self {
        measure_interval_ms: 1_000,
        measure_offset_cm: 0.0,
        ema_alpha: 0.25,
        median_samples: 5,
        median_delay_ms: 50,
        filter_min_cm: 2.0,
        filter_max_cm: 400.0,
        deep_sleep_interval_s: 30,
        interactive_timeout_ms: 600_000,
        publish_enabled: false,
        publish_interval_s: 30,
        network_timeout_ms: 8_000,
    };

    /// Value of one setting
    pub fn value(&self, setting: Setting) -> SettingValue {
        match setting {
            Setting::MeasureInterval => SettingValue::Integer(self.measure_interval_ms),
            Setting::MeasureOffset => SettingValue::Decimal(self.measure_offset_cm),
            Setting::EmaAlpha => SettingValue::Decimal(self.ema_alpha),
            Setting::MedianSamples => SettingValue::Integer(u32::from(self.median_samples)),
            Setting::MedianDelay => SettingValue::Integer(u32::from(self.median_delay_ms)),
            Setting::FilterMin => SettingValue::Decimal(self.filter_min_cm),
            Setting::FilterMax => SettingValue::Decimal(self.filter_max_cm),
            Setting::InteractiveTimeout => SettingValue::Integer(self.interactive_timeout_ms),
            Setting::DeepSleepInterval => SettingValue::Integer(self.deep_sleep_interval_s),
            Setting::PublishEnabled => SettingValue::Flag(self.publish_enabled),
            Setting::PublishInterval => SettingValue::Integer(self.publish_interval_s),
            Setting::NetworkTimeout => SettingValue::Integer(self.network_timeout_ms),
        }
    }

    /// Sets one field from a raw number
    ///
    /// Integer fields take whole, non-negative numbers that fit the field, the flag takes 0 or 1.
    /// Range checks beyond that are left to [`Self::sanitized`].
    pub fn apply(&mut self, setting: Setting, value: f32) -> Result<(), InvalidSetting> {
        match self.value(setting) {
            SettingValue::Decimal(_) => self.set_decimal(setting, value),
            SettingValue::Integer(_) | SettingValue::Flag(_) => {
                let whole = value.is_finite() && libm::truncf(value) == value;
                if !whole || !(0.0..4_294_967_296.0).contains(&value) {
                    return Err(InvalidSetting(setting));
                }
                self.set_integer(setting, value as u32)
            }
        }
    }

    fn set_integer(&mut self, setting: Setting, value: u32) -> Result<(), InvalidSetting> {
        let invalid = InvalidSetting(setting);
        match setting {
            Setting::MeasureInterval => self.measure_interval_ms = value,
            Setting::MedianSamples => self.median_samples = u8::try_from(value).map_err(|_| invalid)?,
            Setting::MedianDelay => self.median_delay_ms = u16::try_from(value).map_err(|_| invalid)?,
            Setting::InteractiveTimeout => self.interactive_timeout_ms = value,
            Setting::DeepSleepInterval => self.deep_sleep_interval_s = value,
            Setting::PublishInterval => self.publish_interval_s = value,
            Setting::NetworkTimeout => self.network_timeout_ms = value,
            Setting::PublishEnabled => {
                self.publish_enabled = match value {
                    0 => false,
                    1 => true,
                    _ => return Err(invalid),
                }
            }
            Setting::MeasureOffset | Setting::EmaAlpha | Setting::FilterMin | Setting::FilterMax => {
                return Err(invalid)
            }
        }
        Ok(())
    }

    fn set_decimal(&mut self, setting: Setting, value: f32) -> Result<(), InvalidSetting> {
        if !value.is_finite() {
            return Err(InvalidSetting(setting));
        }
        match setting {
            Setting::MeasureOffset => self.measure_offset_cm = value,
            Setting::EmaAlpha => self.ema_alpha = value,
            Setting::FilterMin => self.filter_min_cm = value,
            Setting::FilterMax => self.filter_max_cm = value,
            _ => return Err(InvalidSetting(setting)),
        }
        Ok(())
    }

    /// Replaces out-of-range values with defaults
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();

        if self.interactive_timeout_ms == 0 {
            info!("interactive_timeout_ms set to {}", defaults.interactive_timeout_ms);
            self.interactive_timeout_ms = defaults.interactive_timeout_ms;
        }
        if self.deep_sleep_interval_s == 0 {
            info!("deep_sleep_interval_s set to {}", defaults.deep_sleep_interval_s);
            self.deep_sleep_interval_s = defaults.deep_sleep_interval_s;
        }
        if self.measure_interval_ms < 50 {
            info!("measure_interval_ms set to {}", defaults.measure_interval_ms);
            self.measure_interval_ms = defaults.measure_interval_ms;
        }
        if !(self.ema_alpha > 0.0 && self.ema_alpha <= 1.0) {
            info!("ema_alpha set to {}", defaults.ema_alpha);
            self.ema_alpha = defaults.ema_alpha;
        }
        if self.median_samples == 0 || self.median_samples > 15 {
            info!("median_samples set to {}", defaults.median_samples);
            self.median_samples = defaults.median_samples;
        }
        if self.median_delay_ms > 1_000 {
            info!("median_delay_ms set to {}", defaults.median_delay_ms);
            self.median_delay_ms = defaults.median_delay_ms;
        }
        if !(self.filter_min_cm > 0.0) {
            info!("filter_min_cm set to {}", defaults.filter_min_cm);
            self.filter_min_cm = defaults.filter_min_cm;
        }
        if !(self.filter_max_cm >= self.filter_min_cm) {
            info!("filter_max_cm set to {}", defaults.filter_max_cm);
            self.filter_max_cm = defaults.filter_max_cm;
        }
        if !self.measure_offset_cm.is_finite() {
            info!("measure_offset_cm set to {}", defaults.measure_offset_cm);
            self.measure_offset_cm = defaults.measure_offset_cm;
        }
        if self.publish_interval_s == 0 {
            info!("publish_interval_s set to {}", defaults.publish_interval_s);
            self.publish_interval_s = defaults.publish_interval_s;
        }
        if self.network_timeout_ms == 0 {
            info!("network_timeout_ms set to {}", defaults.network_timeout_ms);
            self.network_timeout_ms = defaults.network_timeout_ms;
        }
        self
    }

    /// Reads the configuration, missing keys keep their default
    ///
    /// A key that cannot be read keeps its default too, the others still load.
    pub async fn load<S: SettingsStore>(store: &mut S) -> Self {
        let mut config = Self::default();

        for setting in Setting::ALL {
            let applied = match config.value(setting) {
                SettingValue::Decimal(_) => match store.get_f32(setting.key()).await {
                    Ok(Some(value)) => config.set_decimal(setting, value),
                    Ok(None) => Ok(()),
                    Err(e) => {
                        warn!("reading {} failed ({:?}), keeping default", setting.key(), e);
                        Ok(())
                    }
                },
                SettingValue::Integer(_) | SettingValue::Flag(_) => match store.get_u32(setting.key()).await {
                    Ok(Some(value)) => config.set_integer(setting, value),
                    Ok(None) => Ok(()),
                    Err(e) => {
                        warn!("reading {} failed ({:?}), keeping default", setting.key(), e);
                        Ok(())
                    }
                },
            };
            if applied.is_err() {
                warn!("stored {} does not fit, keeping default", setting.key());
            }
        }

        config.sanitized()
    }

    /// Writes every field
    pub async fn save<S: SettingsStore>(&self, store: &mut S) -> Result<(), StoreError> {
        store.put_u32(keys::MEASURE_INTERVAL_MS, self.measure_interval_ms).await?;
        store.put_f32(keys::MEASURE_OFFSET_CM, self.measure_offset_cm).await?;
        store.put_f32(keys::EMA_ALPHA, self.ema_alpha).await?;
        store.put_u32(keys::MEDIAN_SAMPLES, u32::from(self.median_samples)).await?;
        store.put_u32(keys::MEDIAN_DELAY_MS, u32::from(self.median_delay_ms)).await?;
        store.put_f32(keys::FILTER_MIN_CM, self.filter_min_cm).await?;
        store.put_f32(keys::FILTER_MAX_CM, self.filter_max_cm).await?;
        store.put_u32(keys::INTERACTIVE_TIMEOUT_MS, self.interactive_timeout_ms).await?;
        store.put_u32(keys::DEEP_SLEEP_INTERVAL_S, self.deep_sleep_interval_s).await?;
        store.put_u32(keys::PUBLISH_ENABLED, u32::from(self.publish_enabled)).await?;
        store.put_u32(keys::PUBLISH_INTERVAL_S, self.publish_interval_s).await?;
        store.put_u32(keys::NETWORK_TIMEOUT_MS, self.network_timeout_ms).await?;
        Ok(())
    }
}

impl ConfigProvider for RuntimeConfig {
    fn measure_interval_ms(&self) -> u32 {
        self.measure_interval_ms
    }
    fn measure_offset_cm(&self) -> f32 {
        self.measure_offset_cm
    }
    fn ema_alpha(&self) -> f32 {
        self.ema_alpha
    }
    fn median_samples(&self) -> u8 {
        self.median_samples
    }
    fn median_sample_delay_ms(&self) -> u16 {
        self.median_delay_ms
    }
    fn filter_min_cm(&self) -> f32 {
        self.filter_min_cm
    }
    fn filter_max_cm(&self) -> f32 {
        self.filter_max_cm
    }
    fn deep_sleep_interval_s(&self) -> u32 {
        self.deep_sleep_interval_s
    }
    fn interactive_timeout_ms(&self) -> u32 {
        self.interactive_timeout_ms
    }
    fn publish_enabled(&self) -> bool {
        self.publish_enabled
    }
    fn publish_interval_s(&self) -> u32 {
        self.publish_interval_s
    }
    fn network_timeout_ms(&self) -> u32 {
        self.network_timeout_ms
    }
}

impl<T: ConfigProvider + ?Sized> ConfigProvider for &T {
    fn measure_interval_ms(&self) -> u32 {
        (**self).measure_interval_ms()
    }
    fn measure_offset_cm(&self) -> f32 {
        (**self).measure_offset_cm()
    }
    fn ema_alpha(&self) -> f32 {
        (**self).ema_alpha()
    }
    fn median_samples(&self) -> u8 {
        (**self).median_samples()
    }
    fn median_sample_delay_ms(&self) -> u16 {
        (**self).median_sample_delay_ms()
    }
    fn filter_min_cm(&self) -> f32 {
        (**self).filter_min_cm()
    }
    fn filter_max_cm(&self) -> f32 {
        (**self).filter_max_cm()
    }
    fn deep_sleep_interval_s(&self) -> u32 {
        (**self).deep_sleep_interval_s()
    }
    fn interactive_timeout_ms(&self) -> u32 {
        (**self).interactive_timeout_ms()
    }
    fn publish_enabled(&self) -> bool {
        (**self).publish_enabled()
    }
    fn publish_interval_s(&self) -> u32 {
        (**self).publish_interval_s()
    }
    fn network_timeout_ms(&self) -> u32 {
        (**self).network_timeout_ms()
    }
}
