use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::Result;
use crate::source::{HeaderInjector, HttpUrlSource, OriginClient, Source, SourceInfoStorage};
use crate::storage::{Cache, Cipher, CipherCache, DiskUsage, FileCache, FileNameGenerator};

/// Everything needed to build the source and cache of a resource.
#[derive(Clone)]
pub struct Config {
    pub cache_root: PathBuf,
    pub file_name_generator: Arc<dyn FileNameGenerator>,
    pub disk_usage: Arc<dyn DiskUsage>,
    pub source_info_storage: Arc<dyn SourceInfoStorage>,
    pub header_injector: Arc<dyn HeaderInjector>,
    pub cipher: Option<Arc<dyn Cipher>>,
    pub client: OriginClient,
    pub no_cache_barrier: f64,
}

impl Config {
    /// Final cache file of `url`.
    pub fn cache_file(&self, url: &str) -> PathBuf {
        self.cache_root.join(self.file_name_generator.generate(url))
    }

    pub fn new_source(&self, url: &str) -> Arc<dyn Source> {
        Arc::new(HttpUrlSource::new(
            url,
            self.client.clone(),
            Arc::clone(&self.source_info_storage),
            Arc::clone(&self.header_injector),
        ))
    }

    pub fn new_cache(&self, url: &str) -> Result<Arc<dyn Cache>> {
        self.open_cache(&self.cache_file(url))
    }

    fn open_cache(&self, path: &Path) -> Result<Arc<dyn Cache>> {
        let file = Arc::new(FileCache::new(path, Arc::clone(&self.disk_usage))?);
        Ok(match &self.cipher {
            Some(cipher) => Arc::new(CipherCache::new(file, Arc::clone(cipher))),
            None => file,
        })
    }
}
