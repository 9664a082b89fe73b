use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{Mutex, RwLock},
};

use anyhow::{anyhow, Context, Result};
use log::warn;

use super::Storage;

/// Session-scoped storage: gone when the value is dropped.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.data
            .lock()
            .map_err(|_| anyhow!("session storage lock poisoned"))
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.lock()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn get_or_insert_with(&self, key: &str, make: &mut dyn FnMut() -> String) -> Result<String> {
        let mut guard = self.lock()?;
        Ok(guard.entry(key.to_string()).or_insert_with(make).clone())
    }
}

/// Durable storage backed by a JSON object on disk. Every mutation rewrites
/// the file.
pub struct FileStorage {
    path: PathBuf,
    data: RwLock<HashMap<String, String>>,
}

impl FileStorage {
    pub fn open(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read storage from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                warn!("Discarding unreadable storage file {}: {err}", path.display());
                HashMap::new()
            })
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, data: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create storage directory {}", parent.display())
                })?;
            }
        }
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write storage to {}", self.path.display()))
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let guard = self
            .data
            .read()
            .map_err(|_| anyhow!("durable storage lock poisoned"))?;
        Ok(guard.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut guard = self
            .data
            .write()
            .map_err(|_| anyhow!("durable storage lock poisoned"))?;
        let previous = guard.insert(key.to_string(), value.to_string());
        if let Err(err) = self.persist(&guard) {
            match previous {
                Some(previous) => guard.insert(key.to_string(), previous),
                None => guard.remove(key),
            };
            return Err(err);
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut guard = self
            .data
            .write()
            .map_err(|_| anyhow!("durable storage lock poisoned"))?;
        if guard.remove(key).is_some() {
            self.persist(&guard)?;
        }
        Ok(())
    }

    fn get_or_insert_with(&self, key: &str, make: &mut dyn FnMut() -> String) -> Result<String> {
        let mut guard = self
            .data
            .write()
            .map_err(|_| anyhow!("durable storage lock poisoned"))?;
        if let Some(existing) = guard.get(key) {
            return Ok(existing.clone());
        }
        let value = make();
        guard.insert(key.to_string(), value.clone());
        if let Err(err) = self.persist(&guard) {
            guard.remove(key);
            return Err(err);
        }
        Ok(value)
    }
}
