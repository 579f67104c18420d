//! Firmware descriptor: per-image symbol addresses, instrumented code
//! ranges, and scalar configuration knobs.
//!
//! Firmware images ship without symbols, so a sidecar descriptor tells the
//! emulator where the interesting entry points live. The schema is three
//! keyed maps; consumers pull typed values out of `configs` on demand (the
//! audio crate reads its structure layouts from there, the machine reads
//! worker counts and endpoint numbers).

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::CoreError;

/// Descriptor for one firmware image.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FirmwareDescriptor {
    /// Resolved guest addresses by symbol name.
    #[serde(default)]
    pub symbols: BTreeMap<String, u32>,
    /// Named `[entry, exit)` guest code ranges.
    #[serde(default)]
    pub ranges: BTreeMap<String, (u32, u32)>,
    /// Free-form scalar knobs, decoded on access.
    #[serde(default)]
    pub configs: BTreeMap<String, serde_json::Value>,
}

impl FirmwareDescriptor {
    /// Address of `name`, or a boot error naming the missing symbol.
    pub fn symbol(&self, name: &str) -> Result<u32, CoreError> {
        self.symbols
            .get(name)
            .copied()
            .ok_or_else(|| CoreError::MissingSymbol(name.to_owned()))
    }

    /// Code range `name`, or a boot error naming the missing range.
    pub fn range(&self, name: &str) -> Result<(u32, u32), CoreError> {
        self.ranges
            .get(name)
            .copied()
            .ok_or_else(|| CoreError::MissingRange(name.to_owned()))
    }

    /// Decode config `key` as `T`. Absent keys are `Ok(None)`; present but
    /// malformed values are an error.
    pub fn config<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, CoreError> {
        match self.configs.get(key) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|err| CoreError::BadConfig {
                    key: key.to_owned(),
                    message: err.to_string(),
                }),
        }
    }

    pub fn config_u32(&self, key: &str) -> Result<Option<u32>, CoreError> {
        self.config::<u32>(key)
    }

    pub fn config_bool(&self, key: &str) -> Result<Option<bool>, CoreError> {
        self.config::<bool>(key)
    }
}
