// storage.rs

use std::collections::HashMap;

use crc::{Crc, CRC_32_ISCSI};
use serde::de::DeserializeOwned;

use crate::*;

pub const NVS_BUF_SIZE: usize = 1024;

const RECORD_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Key/value blob storage for persistent records.
pub trait ConfigStore: Send {
    fn load(&mut self, key: &str) -> AppResult<Option<Vec<u8>>>;
    fn save(&mut self, key: &str, data: &[u8]) -> AppResult<()>;
}

pub fn encode_record<T: Serialize>(value: &T) -> AppResult<Vec<u8>> {
    let mut buf = [0u8; NVS_BUF_SIZE];
    let data = postcard::to_slice_crc32(value, &mut buf, RECORD_CRC.digest())?;
    Ok(data.to_vec())
}

pub fn decode_record<T: DeserializeOwned>(data: &[u8]) -> AppResult<T> {
    Ok(postcard::from_bytes_crc32(data, RECORD_CRC.digest())?)
}

pub fn load_record<T: DeserializeOwned>(store: &mut dyn ConfigStore, key: &str) -> Option<T> {
    let data = match store.load(key) {
        Ok(Some(d)) => d,
        Ok(None) => {
            error!("Storage key {key:?} not found");
            return None;
        }
        Err(e) => {
            error!("Storage read error for {key:?}: {e}");
            return None;
        }
    };
    info!("Got {sz} bytes for {key:?}. Parsing...", sz = data.len());

    match decode_record(&data) {
        Ok(c) => {
            info!("Successfully parsed {key:?} from storage.");
            Some(c)
        }
        Err(e) => {
            error!("Cannot parse {key:?} from storage: {e}");
            None
        }
    }
}

pub fn save_record<T: Serialize>(store: &mut dyn ConfigStore, key: &str, value: &T) -> AppResult<()> {
    let data = encode_record(value)?;
    info!("Encoded {key:?} to {sz} bytes. Saving...", sz = data.len());
    store.save(key, &data)?;
    info!("Saved {key:?}.");
    Ok(())
}

/// Read a record, falling back to (and persisting) the default when missing or corrupted.
pub fn load_or_default<T>(store: &mut dyn ConfigStore, key: &str) -> AppResult<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    match load_record(store, key) {
        Some(v) => Ok(v),
        None => {
            error!("Could not read {key:?}, using defaults");
            let v = T::default();
            save_record(store, key, &v)?;
            Ok(v)
        }
    }
}

#[derive(Debug, Default)]
pub struct MemStore {
    blobs: HashMap<String, Vec<u8>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigStore for MemStore {
    fn load(&mut self, key: &str) -> AppResult<Option<Vec<u8>>> {
        Ok(self.blobs.get(key).cloned())
    }

    fn save(&mut self, key: &str, data: &[u8]) -> AppResult<()> {
        self.blobs.insert(key.into(), data.to_vec());
        Ok(())
    }
}

#[cfg(target_os = "espidf")]
pub struct NvsStore {
    nvs: nvs::EspNvs<nvs::NvsDefault>,
}

#[cfg(target_os = "espidf")]
impl NvsStore {
    pub fn new(nvs: nvs::EspNvs<nvs::NvsDefault>) -> Self {
        Self { nvs }
    }
}

#[cfg(target_os = "espidf")]
impl ConfigStore for NvsStore {
    fn load(&mut self, key: &str) -> AppResult<Option<Vec<u8>>> {
        let mut nvsbuf = [0u8; NVS_BUF_SIZE];
        info!("Reading up to {sz} bytes from nvs...", sz = NVS_BUF_SIZE);
        Ok(self.nvs.get_raw(key, &mut nvsbuf)?.map(|b| b.to_vec()))
    }

    fn save(&mut self, key: &str, data: &[u8]) -> AppResult<()> {
        self.nvs.set_raw(key, data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_survives_storage() {
        let mut store = MemStore::new();
        let cfg = MyConfig {
            location: "greenhouse".into(),
            relay_mode: RelayMode::Gpio,
            ..Default::default()
        };
        save_record(&mut store, CONFIG_NAME, &cfg).unwrap();

        let back: MyConfig = load_record(&mut store, CONFIG_NAME).unwrap();
        assert_eq!(back.location, "greenhouse");
        assert_eq!(back.relay_mode, RelayMode::Gpio);
    }

    #[test]
    fn corrupted_record_is_rejected() {
        let mut data = encode_record(&Calibration::default()).unwrap();
        let mid = data.len() / 2;
        data[mid] ^= 0x55;
        assert!(decode_record::<Calibration>(&data).is_err());

        let data = encode_record(&Calibration::default()).unwrap();
        assert!(decode_record::<Calibration>(&data[..data.len() - 1]).is_err());
    }

    #[test]
    fn missing_record_falls_back_to_default_and_persists_it() {
        let mut store = MemStore::new();
        let cal: Calibration = load_or_default(&mut store, CALIBRATION_NAME).unwrap();
        assert_eq!(cal, Calibration::default());
        assert!(store.load(CALIBRATION_NAME).unwrap().is_some());
    }

    #[test]
    fn garbage_record_falls_back_to_default() {
        let mut store = MemStore::new();
        store.save(CONFIG_NAME, &[1, 2, 3, 4, 5]).unwrap();
        let cfg: MyConfig = load_or_default(&mut store, CONFIG_NAME).unwrap();
        assert_eq!(cfg.influx_port, 8086);
        let stored: MyConfig = load_record(&mut store, CONFIG_NAME).unwrap();
        assert_eq!(stored.influx_port, 8086);
    }
}

// EOF
