use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::constants::{DEFAULT_BUFFER_SIZE, MAX_READ_SOURCE_ATTEMPTS};
use crate::error::{ProxyCacheError, Result};
use crate::metrics;
use crate::source::Source;
use crate::storage::Cache;

pub mod clients;
pub mod config;
pub mod http_cache;

pub use clients::{CacheListener, Clients};
pub use config::Config;
pub use http_cache::{HttpProxyCache, Served};

const WAIT_FOR_DATA: Duration = Duration::from_secs(1);

/// Progress and failures of the background source reader.
pub trait ProxyCacheListener: Send + Sync {
    fn on_cache_percentage(&self, percents: u8);

    fn on_error(&self, err: &ProxyCacheError) {
        log::error!("proxy cache error: {err}");
    }
}

/// Read-through cache for one resource.
///
/// Bytes are pulled from the source by a single background task that always
/// resumes at the cache frontier. Any number of readers may wait on the same
/// instance; each one is woken on every append and re-checks its own range.
pub struct ProxyCache {
    inner: Arc<Inner>,
}

struct Inner {
    source: Arc<dyn Source>,
    cache: Arc<dyn Cache>,
    listener: Option<Arc<dyn ProxyCacheListener>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
    read_errors: AtomicUsize,
    fatal: Mutex<Option<ProxyCacheError>>,
    percents: AtomicI32,
    progress: watch::Sender<u64>,
}

impl ProxyCache {
    pub fn new(
        source: Arc<dyn Source>,
        cache: Arc<dyn Cache>,
        listener: Option<Arc<dyn ProxyCacheListener>>,
    ) -> Self {
        let (progress, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                source,
                cache,
                listener,
                reader: Mutex::new(None),
                stopped: AtomicBool::new(false),
                read_errors: AtomicUsize::new(0),
                fatal: Mutex::new(None),
                percents: AtomicI32::new(-1),
                progress,
            }),
        }
    }

    pub fn source(&self) -> &Arc<dyn Source> {
        &self.inner.source
    }

    pub fn cache(&self) -> &Arc<dyn Cache> {
        &self.inner.cache
    }

    /// Fills `buf` with resource bytes starting at `offset`, waiting for the
    /// background reader when they are not cached yet. A short count means
    /// the end of the resource was reached.
    pub async fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let inner = &self.inner;
        let wanted = offset + buf.len() as u64;
        let mut progress = inner.progress.subscribe();

        while !inner.cache.is_completed() && inner.cache.available()? < wanted && !inner.is_stopped() {
            if let Some(err) = inner.fatal_error() {
                return Err(err);
            }
            inner.read_source_async();
            inner.wait_for_source_data(&mut progress).await;
            inner.check_reading_source_errors()?;
        }
        if inner.is_stopped() {
            return Err(ProxyCacheError::Interrupted);
        }

        let read = inner.cache.read(buf, offset)?;
        if inner.cache.is_completed() && inner.percents.load(Ordering::SeqCst) != 100 {
            inner.percents.store(100, Ordering::SeqCst);
            inner.on_percents_changed(100);
        }
        Ok(read)
    }

    /// True while a background reader task is running.
    pub fn is_reading(&self) -> bool {
        self.inner.reader_alive()
    }

    pub fn shutdown(&self) {
        let inner = &self.inner;
        log::debug!("shutdown proxy for {}", inner.source.url());
        inner.stopped.store(true, Ordering::SeqCst);
        if let Some(reader) = inner.reader.lock().expect("source reader").take() {
            reader.abort();
        }
        if let Err(err) = inner.cache.close() {
            inner.on_error(err);
        }
        inner.progress.send_modify(|gen| *gen += 1);
    }
}

impl Drop for ProxyCache {
    fn drop(&mut self) {
        if let Some(reader) = self.inner.reader.lock().expect("source reader").take() {
            reader.abort();
        }
    }
}

impl Inner {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn reader_alive(&self) -> bool {
        self.reader
            .lock()
            .expect("source reader")
            .as_ref()
            .map(|reader| !reader.is_finished())
            .unwrap_or(false)
    }

    fn read_source_async(self: &Arc<Self>) {
        let mut reader = self.reader.lock().expect("source reader");
        let alive = reader.as_ref().map(|r| !r.is_finished()).unwrap_or(false);
        if alive || self.is_stopped() || self.cache.is_completed() {
            return;
        }
        let inner = Arc::clone(self);
        *reader = Some(tokio::spawn(async move { inner.read_source().await }));
    }

    async fn wait_for_source_data(&self, progress: &mut watch::Receiver<u64>) {
        // bounded so a lost wake up only costs one period
        let _ = tokio::time::timeout(WAIT_FOR_DATA, progress.changed()).await;
    }

    fn fatal_error(&self) -> Option<ProxyCacheError> {
        self.fatal.lock().expect("fatal error").as_ref().and_then(|e| e.fatal_copy())
    }

    fn check_reading_source_errors(&self) -> Result<()> {
        if let Some(err) = self.fatal_error() {
            return Err(err);
        }
        self.check_cache_validity()?;
        let errors = self.read_errors.load(Ordering::SeqCst);
        if errors >= MAX_READ_SOURCE_ATTEMPTS {
            self.read_errors.store(0, Ordering::SeqCst);
            return Err(ProxyCacheError::ReadAttemptsExceeded(errors));
        }
        Ok(())
    }

    fn check_cache_validity(&self) -> Result<()> {
        let cached = self.cache.available()?;
        match self.source.known_length() {
            Some(source_len) if cached > source_len => Err(ProxyCacheError::Inconsistent { cached, source_len }),
            _ => Ok(()),
        }
    }

    async fn read_source(self: Arc<Self>) {
        match self.fetch().await {
            Ok(()) => {
                self.notify_new_data();
                // reported even if 100 was already seen through notify
                self.percents.store(100, Ordering::SeqCst);
                self.on_percents_changed(100);
            }
            Err(err) if err.is_interrupted() => {
                log::debug!("reading source {} is interrupted", self.source.url());
                self.notify_new_data();
            }
            Err(err) => {
                metrics::record_source_error();
                if let Some(fatal) = err.fatal_copy() {
                    *self.fatal.lock().expect("fatal error") = Some(fatal);
                }
                self.read_errors.fetch_add(1, Ordering::SeqCst);
                self.on_error(err);
                self.notify_new_data();
            }
        }
    }

    async fn fetch(&self) -> Result<()> {
        let mut offset = self.cache.available()?;
        let mut stream = self.source.open(offset).await?;
        let mut buf = vec![0u8; DEFAULT_BUFFER_SIZE];
        loop {
            if self.is_stopped() {
                return Err(ProxyCacheError::Interrupted);
            }
            let read = stream.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            if self.is_stopped() {
                return Err(ProxyCacheError::Interrupted);
            }
            self.cache.append(&buf[..read])?;
            offset += read as u64;
            self.notify_new_data();
        }
        drop(stream);
        self.try_complete(offset)
    }

    fn try_complete(&self, offset: u64) -> Result<()> {
        if self.is_stopped() {
            return Err(ProxyCacheError::Interrupted);
        }
        match self.source.known_length() {
            Some(source_len) if offset > source_len => Err(ProxyCacheError::Inconsistent {
                cached: offset,
                source_len,
            }),
            Some(source_len) if offset < source_len => Err(ProxyCacheError::upstream(
                self.source.url(),
                format!("source ended at {offset} of {source_len} bytes"),
            )),
            _ => self.cache.complete(),
        }
    }

    fn notify_new_data(&self) {
        if let Ok(available) = self.cache.available() {
            if let Some(length) = self.source.known_length() {
                let percents = if length == 0 {
                    100
                } else {
                    (available.saturating_mul(100) / length).min(100) as i32
                };
                if self.percents.swap(percents, Ordering::SeqCst) != percents {
                    self.on_percents_changed(percents as u8);
                }
            }
        }
        self.progress.send_modify(|gen| *gen += 1);
    }

    fn on_percents_changed(&self, percents: u8) {
        if let Some(listener) = &self.listener {
            listener.on_cache_percentage(percents);
        }
    }

    fn on_error(&self, err: ProxyCacheError) {
        match &self.listener {
            Some(listener) => listener.on_error(&err),
            None => log::error!("proxy cache error for {}: {err}", self.source.url()),
        }
    }
}
