//! Settings storage task
//!
//! Keeps the node's settings (runtime configuration, calibration points, tank references) in a
//! reserved section of flash using the `sequential-storage` crate. The section is defined in
//! memory.x.
//!
//! The task owns the flash. Everything else goes through [`FlashSettings`], which implements
//! the core's string-keyed settings store on top of a fixed key table.

use defmt::*;
use embassy_rp::flash::{Async, ERASE_SIZE, Flash};
use embassy_rp::peripherals::FLASH;
use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, channel::Channel, mutex::Mutex, signal::Signal};
use sequential_storage::{
    cache::NoCache,
    map::{Key, SerializationError, Value, fetch_item, store_item},
};
use tank_core::calibration::keys as calibration_keys;
use tank_core::config::keys as config_keys;
use tank_core::{SettingsStore, StoreError};

use crate::system::resources::SettingsResources;

/// Total on-chip flash
const FLASH_SIZE: usize = 2048 * 1024;

/// Number of sectors used for storage, two for wear leveling
const STORAGE_SECTOR_COUNT: usize = 2;

/// Total storage size
const STORAGE_SIZE: usize = ERASE_SIZE * STORAGE_SECTOR_COUNT;

/// Storage offset, the last two sectors, must match memory.x
const STORAGE_OFFSET: u32 = (FLASH_SIZE - STORAGE_SIZE) as u32;

/// Stored value: one tag byte and four payload bytes
const VALUE_SIZE: usize = 5;

static COMMANDS: Channel<CriticalSectionRawMutex, SettingsCommand, 1> = Channel::new();
static REPLY: Signal<CriticalSectionRawMutex, Result<Option<StoredValue>, StoreError>> = Signal::new();

/// One command/reply exchange at a time
static EXCLUSIVE: Mutex<CriticalSectionRawMutex, ()> = Mutex::new(());

/// Storage keys for sequential-storage
///
/// The numbering is persisted, never reorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Format)]
#[repr(u8)]
enum SettingKey {
    MeasureInterval = 0,
    MeasureOffset = 1,
    EmaAlpha = 2,
    MedianSamples = 3,
    MedianDelay = 4,
    FilterMin = 5,
    FilterMax = 6,
    InteractiveTimeout = 7,
    DeepSleepInterval = 8,
    PublishEnabled = 9,
    PublishInterval = 10,
    NetworkTimeout = 11,
    Measured0 = 12,
    Measured1 = 13,
    Measured2 = 14,
    Height0 = 15,
    Height1 = 16,
    Height2 = 17,
    TankEmpty = 18,
    TankFull = 19,
}

impl SettingKey {
    const ALL: [(&'static str, SettingKey); 20] = [
        (config_keys::MEASURE_INTERVAL_MS, Self::MeasureInterval),
        (config_keys::MEASURE_OFFSET_CM, Self::MeasureOffset),
        (config_keys::EMA_ALPHA, Self::EmaAlpha),
        (config_keys::MEDIAN_SAMPLES, Self::MedianSamples),
        (config_keys::MEDIAN_DELAY_MS, Self::MedianDelay),
        (config_keys::FILTER_MIN_CM, Self::FilterMin),
        (config_keys::FILTER_MAX_CM, Self::FilterMax),
        (config_keys::INTERACTIVE_TIMEOUT_MS, Self::InteractiveTimeout),
        (config_keys::DEEP_SLEEP_INTERVAL_S, Self::DeepSleepInterval),
        (config_keys::PUBLISH_ENABLED, Self::PublishEnabled),
        (config_keys::PUBLISH_INTERVAL_S, Self::PublishInterval),
        (config_keys::NETWORK_TIMEOUT_MS, Self::NetworkTimeout),
        (calibration_keys::MEASURED[0], Self::Measured0),
        (calibration_keys::MEASURED[1], Self::Measured1),
        (calibration_keys::MEASURED[2], Self::Measured2),
        (calibration_keys::HEIGHT[0], Self::Height0),
        (calibration_keys::HEIGHT[1], Self::Height1),
        (calibration_keys::HEIGHT[2], Self::Height2),
        (calibration_keys::TANK_EMPTY, Self::TankEmpty),
        (calibration_keys::TANK_FULL, Self::TankFull),
    ];

    fn from_name(name: &str) -> Result<Self, StoreError> {
        Self::ALL
            .iter()
            .find(|(known, _)| *known == name)
            .map(|(_, key)| *key)
            .ok_or(StoreError::BadKey)
    }

    fn from_id(id: u8) -> Option<Self> {
        Self::ALL.iter().map(|(_, key)| *key).find(|key| *key as u8 == id)
    }
}

impl Key for SettingKey {
    fn serialize_into(&self, buffer: &mut [u8]) -> Result<usize, SerializationError> {
        if buffer.is_empty() {
            return Err(SerializationError::BufferTooSmall);
        }
        buffer[0] = *self as u8;
        Ok(1)
    }

    fn deserialize_from(buffer: &[u8]) -> Result<(Self, usize), SerializationError>
    where
        Self: Sized,
    {
        let id = *buffer.first().ok_or(SerializationError::BufferTooSmall)?;
        Self::from_id(id).map(|key| (key, 1)).ok_or(SerializationError::InvalidFormat)
    }
}

/// Typed value as kept in flash
///
/// `Removed` is written instead of erasing, a later fetch reads it as absent.
#[derive(Debug, Clone, Copy, PartialEq, Format)]
enum StoredValue {
    F32(f32),
    U32(u32),
    Removed,
}

impl StoredValue {
    const TAG_F32: u8 = 1;
    const TAG_U32: u8 = 2;
    const TAG_REMOVED: u8 = 0xFF;
}

impl Value<'_> for StoredValue {
    fn serialize_into(&self, buffer: &mut [u8]) -> Result<usize, SerializationError> {
        if buffer.len() < VALUE_SIZE {
            return Err(SerializationError::BufferTooSmall);
        }
        let (tag, bytes) = match self {
            Self::F32(value) => (Self::TAG_F32, value.to_le_bytes()),
            Self::U32(value) => (Self::TAG_U32, value.to_le_bytes()),
            Self::Removed => (Self::TAG_REMOVED, [0; 4]),
        };
        buffer[0] = tag;
        buffer[1..VALUE_SIZE].copy_from_slice(&bytes);
        Ok(VALUE_SIZE)
    }

    fn deserialize_from(buffer: &[u8]) -> Result<Self, SerializationError>
    where
        Self: Sized,
    {
        if buffer.len() < VALUE_SIZE {
            return Err(SerializationError::BufferTooSmall);
        }
        let bytes = [buffer[1], buffer[2], buffer[3], buffer[4]];
        match buffer[0] {
            Self::TAG_F32 => Ok(Self::F32(f32::from_le_bytes(bytes))),
            Self::TAG_U32 => Ok(Self::U32(u32::from_le_bytes(bytes))),
            Self::TAG_REMOVED => Ok(Self::Removed),
            _ => Err(SerializationError::InvalidFormat),
        }
    }
}

/// Commands handled by the settings storage task
#[derive(Debug, Clone, Copy, Format)]
enum SettingsCommand {
    /// Read one value (responds via signal)
    Get(SettingKey),
    /// Write one value, `Removed` deletes
    Put(SettingKey, StoredValue),
}

/// Handle to the settings storage task
#[derive(Clone, Copy)]
pub struct FlashSettings;

impl FlashSettings {
    async fn exchange(&self, command: SettingsCommand) -> Result<Option<StoredValue>, StoreError> {
        let _exclusive = EXCLUSIVE.lock().await;
        REPLY.reset();
        COMMANDS.send(command).await;
        REPLY.wait().await
    }

    async fn get(&self, key: &str) -> Result<Option<StoredValue>, StoreError> {
        let key = SettingKey::from_name(key)?;
        match self.exchange(SettingsCommand::Get(key)).await? {
            Some(StoredValue::Removed) | None => Ok(None),
            Some(value) => Ok(Some(value)),
        }
    }

    async fn put(&self, key: &str, value: StoredValue) -> Result<(), StoreError> {
        let key = SettingKey::from_name(key)?;
        self.exchange(SettingsCommand::Put(key, value)).await.map(|_| ())
    }
}

impl SettingsStore for FlashSettings {
    async fn get_f32(&mut self, key: &str) -> Result<Option<f32>, StoreError> {
        match self.get(key).await? {
            Some(StoredValue::F32(value)) => Ok(Some(value)),
            Some(_) => Err(StoreError::TypeMismatch),
            None => Ok(None),
        }
    }

    async fn put_f32(&mut self, key: &str, value: f32) -> Result<(), StoreError> {
        self.put(key, StoredValue::F32(value)).await
    }

    async fn get_u32(&mut self, key: &str) -> Result<Option<u32>, StoreError> {
        match self.get(key).await? {
            Some(StoredValue::U32(value)) => Ok(Some(value)),
            Some(_) => Err(StoreError::TypeMismatch),
            None => Ok(None),
        }
    }

    async fn put_u32(&mut self, key: &str, value: u32) -> Result<(), StoreError> {
        self.put(key, StoredValue::U32(value)).await
    }

    async fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.put(key, StoredValue::Removed).await
    }
}

/// Settings storage task
///
/// Handles all flash reads and writes for the settings store. `sequential-storage` takes care
/// of wear leveling and data integrity.
#[embassy_executor::task]
pub async fn settings_storage(r: SettingsResources) {
    let mut flash = Flash::<FLASH, Async, FLASH_SIZE>::new(r.flash, r.dma);
    info!("Settings storage task started");

    let flash_range = STORAGE_OFFSET..(STORAGE_OFFSET + STORAGE_SIZE as u32);
    let mut cache = NoCache::new();
    let mut data_buffer: [u8; 128] = [0; 128];

    loop {
        let command = COMMANDS.receive().await;
        debug!("Settings command received: {:?}", command);

        let reply = match command {
            SettingsCommand::Get(key) => fetch_item::<SettingKey, StoredValue, _>(
                &mut flash,
                flash_range.clone(),
                &mut cache,
                &mut data_buffer,
                &key,
            )
            .await
            .map_err(|e| {
                error!("Failed to load {}: {}", key, Debug2Format(&e));
                StoreError::Backend
            }),
            SettingsCommand::Put(key, value) => store_item(
                &mut flash,
                flash_range.clone(),
                &mut cache,
                &mut data_buffer,
                &key,
                &value,
            )
            .await
            .map(|()| None)
            .map_err(|e| {
                error!("Failed to save {}: {}", key, Debug2Format(&e));
                match e {
                    sequential_storage::Error::FullStorage => StoreError::Full,
                    _ => StoreError::Backend,
                }
            }),
        };
        REPLY.signal(reply);
    }
}
