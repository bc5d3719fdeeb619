//! Settings persistence contract
//!
//! A string-keyed store of `f32`/`u32` values. Each `put` is all-or-nothing for its key; a
//! reader sees either the previous or the new value, never a torn one.
//!
//! The firmware backs this with wear-levelled flash, [`MemoryStore`] keeps everything in RAM.

use heapless::{FnvIndexMap, String};

/// Longest key the store accepts
pub const MAX_KEY_LEN: usize = 16;

/// Settings store failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StoreError {
    /// The backend failed to read or write
    Backend,
    /// The key holds a value of another type
    TypeMismatch,
    /// No room left for a new key
    Full,
    /// Key longer than [`MAX_KEY_LEN`] or not known to the backend
    BadKey,
}

/// String-keyed typed store
#[allow(async_fn_in_trait)]
pub trait SettingsStore {
    async fn get_f32(&mut self, key: &str) -> Result<Option<f32>, StoreError>;
    async fn put_f32(&mut self, key: &str, value: f32) -> Result<(), StoreError>;
    async fn get_u32(&mut self, key: &str) -> Result<Option<u32>, StoreError>;
    async fn put_u32(&mut self, key: &str, value: u32) -> Result<(), StoreError>;
    /// Removing a missing key is not an error
    async fn remove(&mut self, key: &str) -> Result<(), StoreError>;
}

impl<S: SettingsStore + ?Sized> SettingsStore for &mut S {
    async fn get_f32(&mut self, key: &str) -> Result<Option<f32>, StoreError> {
        (**self).get_f32(key).await
    }
    async fn put_f32(&mut self, key: &str, value: f32) -> Result<(), StoreError> {
        (**self).put_f32(key, value).await
    }
    async fn get_u32(&mut self, key: &str) -> Result<Option<u32>, StoreError> {
        (**self).get_u32(key).await
    }
    async fn put_u32(&mut self, key: &str, value: u32) -> Result<(), StoreError> {
        (**self).put_u32(key, value).await
    }
    async fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        (**self).remove(key).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Stored {
    F32(f32),
    U32(u32),
}

/// In-RAM store
#[derive(Default)]
pub struct MemoryStore {
    entries: FnvIndexMap<String<MAX_KEY_LEN>, Stored, 32>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        Self::key(key).is_ok_and(|k| self.entries.contains_key(&k))
    }

    fn key(key: &str) -> Result<String<MAX_KEY_LEN>, StoreError> {
        String::try_from(key).map_err(|_| StoreError::BadKey)
    }

    fn get(&self, key: &str) -> Result<Option<Stored>, StoreError> {
        Ok(self.entries.get(&Self::key(key)?).copied())
    }

    fn put(&mut self, key: &str, value: Stored) -> Result<(), StoreError> {
        self.entries
            .insert(Self::key(key)?, value)
            .map(|_| ())
            .map_err(|_| StoreError::Full)
    }
}

impl SettingsStore for MemoryStore {
    async fn get_f32(&mut self, key: &str) -> Result<Option<f32>, StoreError> {
        match self.get(key)? {
            Some(Stored::F32(v)) => Ok(Some(v)),
            Some(Stored::U32(_)) => Err(StoreError::TypeMismatch),
            None => Ok(None),
        }
    }

    async fn put_f32(&mut self, key: &str, value: f32) -> Result<(), StoreError> {
        self.put(key, Stored::F32(value))
    }

    async fn get_u32(&mut self, key: &str) -> Result<Option<u32>, StoreError> {
        match self.get(key)? {
            Some(Stored::U32(v)) => Ok(Some(v)),
            Some(Stored::F32(_)) => Err(StoreError::TypeMismatch),
            None => Ok(None),
        }
    }

    async fn put_u32(&mut self, key: &str, value: u32) -> Result<(), StoreError> {
        self.put(key, Stored::U32(value))
    }

    async fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(&Self::key(key)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::block_on;

    #[test]
    fn typed_values_round_trip() {
        let mut store = MemoryStore::new();
        block_on(async {
            store.put_f32("m0", 12.5).await.unwrap();
            store.put_u32("median_n", 7).await.unwrap();
            assert_eq!(store.get_f32("m0").await, Ok(Some(12.5)));
            assert_eq!(store.get_u32("median_n").await, Ok(Some(7)));
            assert_eq!(store.get_f32("h0").await, Ok(None));
        });
    }

    #[test]
    fn reading_with_wrong_type_is_reported() {
        let mut store = MemoryStore::new();
        block_on(async {
            store.put_u32("deep_int_s", 30).await.unwrap();
            assert_eq!(store.get_f32("deep_int_s").await, Err(StoreError::TypeMismatch));
        });
    }

    #[test]
    fn overwrite_and_remove() {
        let mut store = MemoryStore::new();
        block_on(async {
            store.put_f32("cuveVide", 123.0).await.unwrap();
            store.put_f32("cuveVide", 130.0).await.unwrap();
            assert_eq!(store.len(), 1);
            assert_eq!(store.get_f32("cuveVide").await, Ok(Some(130.0)));

            store.remove("cuveVide").await.unwrap();
            store.remove("cuveVide").await.unwrap();
            assert!(store.is_empty());
        });
    }

    #[test]
    fn oversized_key_is_rejected() {
        let mut store = MemoryStore::new();
        let result = block_on(store.put_u32("a_key_that_is_far_too_long", 1));
        assert_eq!(result, Err(StoreError::BadKey));
    }
}
