//! In-memory storage backend

use snapwire::bridge::PluginConfig;
use snapwire::{Mac, Mode, PluginError, Storage};
use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::debug;

type Objects = RwLock<BTreeMap<Mac, Vec<u8>>>;

/// Config keys:
/// - `location`: reported by `Location` (default `mem://testplugin`)
/// - `stall_size_ms`: `Size` sleeps this long before answering
pub struct MemStorage {
    location: String,
    stall_size: Duration,
    config: RwLock<Option<Vec<u8>>>,
    states: Objects,
    packfiles: Objects,
    locks: Objects,
}

fn read(objects: &Objects) -> RwLockReadGuard<'_, BTreeMap<Mac, Vec<u8>>> {
    objects.read().unwrap_or_else(|e| e.into_inner())
}

fn write(objects: &Objects) -> RwLockWriteGuard<'_, BTreeMap<Mac, Vec<u8>>> {
    objects.write().unwrap_or_else(|e| e.into_inner())
}

impl MemStorage {
    pub fn new(config: &PluginConfig) -> Self {
        let stall_ms = config
            .get("stall_size_ms")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Self {
            location: config
                .get("location")
                .cloned()
                .unwrap_or_else(|| "mem://testplugin".to_string()),
            stall_size: Duration::from_millis(stall_ms),
            config: RwLock::new(None),
            states: RwLock::default(),
            packfiles: RwLock::default(),
            locks: RwLock::default(),
        }
    }

    fn put(objects: &Objects, mac: Mac, reader: &mut dyn Read) -> Result<u64, PluginError> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        let len = data.len() as u64;
        // Content addressed: a second put of the same mac keeps the first copy.
        write(objects).entry(mac).or_insert(data);
        debug!(%mac, len, "stored object");
        Ok(len)
    }

    fn get(objects: &Objects, what: &str, mac: Mac) -> Result<Box<dyn Read + Send>, PluginError> {
        match read(objects).get(&mac) {
            Some(data) => Ok(Box::new(Cursor::new(data.clone()))),
            None => Err(PluginError::not_found(format!("{} {} not found", what, mac))),
        }
    }

    fn list(objects: &Objects) -> Vec<Mac> {
        read(objects).keys().copied().collect()
    }

    fn delete(objects: &Objects, mac: Mac) -> Result<(), PluginError> {
        write(objects).remove(&mac);
        Ok(())
    }
}

impl Storage for MemStorage {
    fn create(&self, config: &[u8]) -> Result<(), PluginError> {
        let mut slot = self.config.write().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return Err(PluginError::capability("ALREADY_EXISTS", "repository already created"));
        }
        *slot = Some(config.to_vec());
        Ok(())
    }

    fn open(&self) -> Result<Vec<u8>, PluginError> {
        self.config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| PluginError::not_found("repository not created"))
    }

    fn location(&self) -> Result<String, PluginError> {
        Ok(self.location.clone())
    }

    fn mode(&self) -> Result<Mode, PluginError> {
        Ok(Mode::READ_WRITE)
    }

    fn size(&self) -> Result<i64, PluginError> {
        if !self.stall_size.is_zero() {
            std::thread::sleep(self.stall_size);
        }
        let total: usize = [&self.states, &self.packfiles, &self.locks]
            .iter()
            .map(|objects| read(objects).values().map(Vec::len).sum::<usize>())
            .sum();
        Ok(total as i64)
    }

    fn get_states(&self) -> Result<Vec<Mac>, PluginError> {
        Ok(Self::list(&self.states))
    }

    fn put_state(&self, mac: Mac, reader: &mut dyn Read) -> Result<u64, PluginError> {
        Self::put(&self.states, mac, reader)
    }

    fn get_state(&self, mac: Mac) -> Result<Box<dyn Read + Send>, PluginError> {
        Self::get(&self.states, "state", mac)
    }

    fn delete_state(&self, mac: Mac) -> Result<(), PluginError> {
        Self::delete(&self.states, mac)
    }

    fn get_packfiles(&self) -> Result<Vec<Mac>, PluginError> {
        Ok(Self::list(&self.packfiles))
    }

    fn put_packfile(&self, mac: Mac, reader: &mut dyn Read) -> Result<u64, PluginError> {
        Self::put(&self.packfiles, mac, reader)
    }

    fn get_packfile(&self, mac: Mac) -> Result<Box<dyn Read + Send>, PluginError> {
        Self::get(&self.packfiles, "packfile", mac)
    }

    fn get_packfile_blob(&self, mac: Mac, offset: u64, _length: u64) -> Result<Box<dyn Read + Send>, PluginError> {
        let objects = read(&self.packfiles);
        let data = objects
            .get(&mac)
            .ok_or_else(|| PluginError::not_found(format!("packfile {} not found", mac)))?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        Ok(Box::new(Cursor::new(data[start..].to_vec())))
    }

    fn delete_packfile(&self, mac: Mac) -> Result<(), PluginError> {
        Self::delete(&self.packfiles, mac)
    }

    fn get_locks(&self) -> Result<Vec<Mac>, PluginError> {
        Ok(Self::list(&self.locks))
    }

    fn put_lock(&self, mac: Mac, reader: &mut dyn Read) -> Result<u64, PluginError> {
        Self::put(&self.locks, mac, reader)
    }

    fn get_lock(&self, mac: Mac) -> Result<Box<dyn Read + Send>, PluginError> {
        Self::get(&self.locks, "lock", mac)
    }

    fn delete_lock(&self, mac: Mac) -> Result<(), PluginError> {
        Self::delete(&self.locks, mac)
    }

    fn close(&self) -> Result<(), PluginError> {
        Ok(())
    }
}
