use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Context};

use crate::source::SourceInfo;

/// Remembers length and mime per url so reopening a resource can skip the
/// metadata round trip.
pub trait SourceInfoStorage: Send + Sync {
    fn get(&self, url: &str) -> Option<SourceInfo>;
    fn put(&self, url: &str, info: &SourceInfo);
    fn release(&self);
}

#[derive(Debug, Default)]
pub struct MemorySourceInfoStorage {
    entries: Mutex<HashMap<String, SourceInfo>>,
}

impl MemorySourceInfoStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SourceInfoStorage for MemorySourceInfoStorage {
    fn get(&self, url: &str) -> Option<SourceInfo> {
        self.entries.lock().expect("source info").get(url).cloned()
    }

    fn put(&self, url: &str, info: &SourceInfo) {
        self.entries
            .lock()
            .expect("source info")
            .insert(url.to_string(), info.clone());
    }

    fn release(&self) {}
}

/// Source infos persisted as JSON records in a sled database.
pub struct SledSourceInfoStorage {
    db: sled::Db,
}

impl SledSourceInfoStorage {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let db = sled::open(path).with_context(|| format!("open source info db {}", path.display()))?;
        Ok(Self { db })
    }

    pub fn temporary() -> anyhow::Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    fn load(&self, url: &str) -> anyhow::Result<Option<SourceInfo>> {
        match self.db.get(url.as_bytes())? {
            Some(raw) => {
                let info = serde_json::from_slice(&raw).map_err(|err| anyhow!("decode source info: {err}"))?;
                Ok(Some(info))
            }
            None => Ok(None),
        }
    }

    fn store(&self, url: &str, info: &SourceInfo) -> anyhow::Result<()> {
        let raw = serde_json::to_vec(info).map_err(|err| anyhow!("encode source info: {err}"))?;
        self.db.insert(url.as_bytes(), raw)?;
        Ok(())
    }
}

impl SourceInfoStorage for SledSourceInfoStorage {
    fn get(&self, url: &str) -> Option<SourceInfo> {
        match self.load(url) {
            Ok(info) => info,
            Err(err) => {
                log::warn!("read source info for {url} failed: {err}");
                None
            }
        }
    }

    fn put(&self, url: &str, info: &SourceInfo) {
        if let Err(err) = self.store(url, info) {
            log::warn!("save source info for {url} failed: {err}");
        }
    }

    fn release(&self) {
        if let Err(err) = self.db.flush() {
            log::warn!("flush source info db failed: {err}");
        }
    }
}
