use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod client;
pub mod headers;
pub mod http_url;
pub mod info;
pub mod tunnel;

pub use client::OriginClient;
pub use headers::{EmptyHeadersInjector, HeaderInjector, StaticHeadersInjector};
pub use http_url::HttpUrlSource;
pub use info::{MemorySourceInfoStorage, SledSourceInfoStorage, SourceInfoStorage};
pub use tunnel::{TunnelConnector, UpstreamProxy};

/// What is known about a remote resource without downloading it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub url: String,
    pub length: Option<u64>,
    pub mime: Option<String>,
}

impl SourceInfo {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            length: None,
            mime: None,
        }
    }
}

/// A remote resource that can be streamed from any offset.
#[async_trait]
pub trait Source: Send + Sync {
    fn url(&self) -> &str;

    /// Total length, probing the origin when it is not known yet. A failed
    /// probe leaves the length unknown.
    async fn length(&self) -> Option<u64>;

    /// Total length if already learned, never touches the network.
    fn known_length(&self) -> Option<u64>;

    fn mime(&self) -> Option<String>;

    /// Opens a byte stream positioned at `offset`. Dropping the stream
    /// closes the underlying connection.
    async fn open(&self, offset: u64) -> Result<Box<dyn SourceStream>>;

    /// A new, independent handle over the same resource.
    fn fresh(&self) -> Arc<dyn Source>;
}

#[async_trait]
pub trait SourceStream: Send {
    /// Reads the next bytes into `buf`. Returns 0 at the end of the resource.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
}
