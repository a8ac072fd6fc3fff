use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{ProxyCacheError, Result};
use crate::metrics;
use crate::proxy::{Config, HttpProxyCache, ProxyCacheListener};

/// Observer of caching progress for urls served by the proxy.
pub trait CacheListener: Send + Sync {
    fn on_cache_available(&self, cache_file: &Path, url: &str, percents: u8);
}

type Listeners = Arc<Mutex<HashMap<String, Vec<Arc<dyn CacheListener>>>>>;

struct Entry {
    adapter: Arc<HttpProxyCache>,
    clients: usize,
}

/// Per url registry of [`HttpProxyCache`]s and the sockets using them.
///
/// An entry exists while at least one socket is being served for its url.
/// Attaching, detaching and the shutdown of the last adapter all happen
/// under the registry lock. Once [`shutdown_all`](Self::shutdown_all) ran no
/// new client is attached.
#[derive(Clone)]
pub struct Clients {
    config: Config,
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    closed: Arc<AtomicBool>,
    listeners: Listeners,
}

impl Clients {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            entries: Arc::new(Mutex::new(HashMap::new())),
            closed: Arc::new(AtomicBool::new(false)),
            listeners: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Registers one more client for `url`, creating its adapter on first use.
    pub fn attach(&self, url: &str) -> Result<ClientGuard> {
        let mut entries = self.entries.lock().expect("clients");
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProxyCacheError::Interrupted);
        }
        let adapter = match entries.get_mut(url) {
            Some(entry) => {
                entry.clients += 1;
                Arc::clone(&entry.adapter)
            }
            None => {
                let adapter = Arc::new(self.new_adapter(url)?);
                entries.insert(
                    url.to_string(),
                    Entry {
                        adapter: Arc::clone(&adapter),
                        clients: 1,
                    },
                );
                adapter
            }
        };
        metrics::client_attached();
        Ok(ClientGuard {
            clients: self.clone(),
            url: url.to_string(),
            adapter,
        })
    }

    fn detach(&self, url: &str) {
        let mut entries = self.entries.lock().expect("clients");
        metrics::client_detached();
        let Some(entry) = entries.get_mut(url) else { return };
        entry.clients = entry.clients.saturating_sub(1);
        if entry.clients == 0 {
            if let Some(entry) = entries.remove(url) {
                entry.adapter.shutdown();
            }
        }
    }

    fn new_adapter(&self, url: &str) -> Result<HttpProxyCache> {
        let source = self.config.new_source(url);
        let cache = self.config.new_cache(url)?;
        let listener: Arc<dyn ProxyCacheListener> = Arc::new(UrlListener {
            url: url.to_string(),
            cache: Arc::clone(&cache),
            listeners: Arc::clone(&self.listeners),
        });
        Ok(HttpProxyCache::new(source, cache, Some(listener), self.config.no_cache_barrier))
    }

    pub fn total_clients_count(&self) -> usize {
        self.entries
            .lock()
            .expect("clients")
            .values()
            .map(|entry| entry.clients)
            .sum()
    }

    pub fn register_listener(&self, listener: Arc<dyn CacheListener>, url: &str) {
        self.listeners
            .lock()
            .expect("cache listeners")
            .entry(url.to_string())
            .or_default()
            .push(listener);
    }

    pub fn unregister_listener(&self, listener: &Arc<dyn CacheListener>, url: &str) {
        let mut listeners = self.listeners.lock().expect("cache listeners");
        if let Some(list) = listeners.get_mut(url) {
            list.retain(|l| !same_listener(l, listener));
            if list.is_empty() {
                listeners.remove(url);
            }
        }
    }

    pub fn unregister_listener_all(&self, listener: &Arc<dyn CacheListener>) {
        let mut listeners = self.listeners.lock().expect("cache listeners");
        for list in listeners.values_mut() {
            list.retain(|l| !same_listener(l, listener));
        }
        listeners.retain(|_, list| !list.is_empty());
    }

    /// Stops every adapter, forgets all entries and refuses later attaches.
    pub fn shutdown_all(&self) {
        let mut entries = self.entries.lock().expect("clients");
        self.closed.store(true, Ordering::SeqCst);
        for (url, entry) in entries.drain() {
            log::debug!("shutdown clients of {url}");
            entry.adapter.shutdown();
        }
    }
}

fn same_listener(a: &Arc<dyn CacheListener>, b: &Arc<dyn CacheListener>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// A socket being served for a url. Dropping it detaches the client.
pub struct ClientGuard {
    clients: Clients,
    url: String,
    adapter: Arc<HttpProxyCache>,
}

impl ClientGuard {
    pub fn adapter(&self) -> &HttpProxyCache {
        &self.adapter
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.clients.detach(&self.url);
    }
}

/// Forwards cache percentages to the listeners registered for one url.
struct UrlListener {
    url: String,
    cache: Arc<dyn crate::storage::Cache>,
    listeners: Listeners,
}

impl ProxyCacheListener for UrlListener {
    fn on_cache_percentage(&self, percents: u8) {
        let listeners = match self.listeners.lock().expect("cache listeners").get(&self.url) {
            Some(list) => list.clone(),
            None => return,
        };
        let Some(file) = self.cache.file() else { return };
        for listener in listeners {
            listener.on_cache_available(&file, &self.url, percents);
        }
    }

    fn on_error(&self, err: &ProxyCacheError) {
        if err.is_interrupted() {
            log::debug!("caching {} is interrupted", self.url);
        } else {
            log::error!("error caching {}: {err}", self.url);
        }
    }
}
