use std::path::PathBuf;
use std::sync::Arc;

use crate::error::Result;
use crate::storage::Cache;

/// Length preserving transformation applied to bytes at rest.
///
/// `offset` is the position of `data[0]` inside the resource.
pub trait Cipher: Send + Sync {
    fn encrypt(&self, data: &mut [u8], offset: u64);
    fn decrypt(&self, data: &mut [u8], offset: u64);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoCipher;

impl Cipher for NoCipher {
    fn encrypt(&self, _data: &mut [u8], _offset: u64) {}

    fn decrypt(&self, _data: &mut [u8], _offset: u64) {}
}

/// [`Cache`] that encrypts on append and decrypts on read.
pub struct CipherCache {
    cache: Arc<dyn Cache>,
    cipher: Arc<dyn Cipher>,
}

impl CipherCache {
    pub fn new(cache: Arc<dyn Cache>, cipher: Arc<dyn Cipher>) -> Self {
        Self { cache, cipher }
    }
}

impl Cache for CipherCache {
    fn available(&self) -> Result<u64> {
        self.cache.available()
    }

    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let read = self.cache.read(buf, offset)?;
        self.cipher.decrypt(&mut buf[..read], offset);
        Ok(read)
    }

    fn append(&self, data: &[u8]) -> Result<()> {
        let offset = self.cache.available()?;
        let mut encrypted = data.to_vec();
        self.cipher.encrypt(&mut encrypted, offset);
        self.cache.append(&encrypted)
    }

    fn close(&self) -> Result<()> {
        self.cache.close()
    }

    fn complete(&self) -> Result<()> {
        self.cache.complete()
    }

    fn is_completed(&self) -> bool {
        self.cache.is_completed()
    }

    fn file(&self) -> Option<PathBuf> {
        self.cache.file()
    }
}
