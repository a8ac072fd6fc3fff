use std::path::PathBuf;

use crate::error::Result;

pub mod cipher;
pub mod file;
pub mod lru;
pub mod names;

pub use cipher::{Cipher, CipherCache, NoCipher};
pub use file::FileCache;
pub use lru::{DiskUsage, LruDiskUsage, LruPolicy};
pub use names::{FileNameGenerator, Md5FileNameGenerator};

/// Byte storage for a single resource.
///
/// Writes only ever happen at the end (`append`), reads may target any offset
/// below `available()`. `complete()` freezes the content; appending afterwards
/// is an error.
pub trait Cache: Send + Sync {
    fn available(&self) -> Result<u64>;
    /// Reads up to `buf.len()` bytes at `offset`. Returns 0 at or past the end
    /// of the cached data.
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize>;
    fn append(&self, data: &[u8]) -> Result<()>;
    fn close(&self) -> Result<()>;
    fn complete(&self) -> Result<()>;
    fn is_completed(&self) -> bool;
    /// Path currently backing the cache, if it is file based.
    fn file(&self) -> Option<PathBuf> {
        None
    }
}
