//! Local HTTP proxy that caches progressively downloaded media on disk.
//!
//! A player is handed `http://127.0.0.1:<port>/<encoded url>` instead of the
//! remote url; bytes are streamed to it while being persisted, so replays and
//! seeks into already fetched regions are served from disk.

pub mod access_log;
pub mod config;
pub mod constants;
pub mod error;
pub mod http_range;
pub mod logging;
pub mod metrics;
pub mod proxy;
pub mod runtime;
pub mod server;
pub mod source;
pub mod storage;

pub use error::{ProxyCacheError, Result};
pub use proxy::{CacheListener, HttpProxyCache, ProxyCache, ProxyCacheListener};
pub use server::{Builder, HttpProxyCacheServer, State};
