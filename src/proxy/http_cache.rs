use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::constants::DEFAULT_BUFFER_SIZE;
use crate::error::Result;
use crate::http_range::{GetRequest, ResponseHead};
use crate::metrics::Delivery;
use crate::proxy::{ProxyCache, ProxyCacheListener};
use crate::source::Source;
use crate::storage::Cache;

/// Outcome of one served request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Served {
    pub status: u16,
    pub bytes: u64,
    pub delivery: Delivery,
}

/// HTTP face of a [`ProxyCache`].
///
/// Requests that seek far ahead of what is cached are answered straight from
/// a fresh source so they do not restart the shared download.
pub struct HttpProxyCache {
    proxy: ProxyCache,
    no_cache_barrier: f64,
}

impl HttpProxyCache {
    pub fn new(
        source: Arc<dyn Source>,
        cache: Arc<dyn Cache>,
        listener: Option<Arc<dyn ProxyCacheListener>>,
        no_cache_barrier: f64,
    ) -> Self {
        Self {
            proxy: ProxyCache::new(source, cache, listener),
            no_cache_barrier,
        }
    }

    pub async fn process_request<W>(&self, request: &GetRequest, out: &mut W) -> Result<Served>
    where
        W: AsyncWrite + Unpin + Send,
    {
        if self.is_use_cache(request).await? {
            self.response_with_cache(request, out).await
        } else {
            self.response_without_cache(request, out).await
        }
    }

    pub fn shutdown(&self) {
        self.proxy.shutdown();
    }

    async fn is_use_cache(&self, request: &GetRequest) -> Result<bool> {
        let cache = self.proxy.cache();
        if !request.partial || cache.is_completed() {
            return Ok(true);
        }
        let Some(length) = self.proxy.source().length().await.filter(|l| *l > 0) else {
            return Ok(true);
        };
        let barrier = cache.available()? as f64 + length as f64 * self.no_cache_barrier;
        Ok(request.range_offset as f64 <= barrier)
    }

    async fn response_with_cache<W>(&self, request: &GetRequest, out: &mut W) -> Result<Served>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut buf = vec![0u8; DEFAULT_BUFFER_SIZE];
        let mut offset = request.range_offset;
        let mut sent = 0u64;
        let mut head_sent = false;
        loop {
            let read = self.proxy.read(&mut buf, offset).await?;
            if !head_sent {
                // the first read has opened the source, so its length is known now
                let head = self.cached_response_head(request);
                out.write_all(head.encode().as_bytes()).await?;
                head_sent = true;
            }
            if read == 0 {
                break;
            }
            out.write_all(&buf[..read]).await?;
            offset += read as u64;
            sent += read as u64;
        }
        out.flush().await?;
        Ok(Served {
            status: status_of(request),
            bytes: sent,
            delivery: Delivery::Cache,
        })
    }

    async fn response_without_cache<W>(&self, request: &GetRequest, out: &mut W) -> Result<Served>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let source = self.proxy.source().fresh();
        let mut stream = source.open(request.range_offset).await?;
        let head = ResponseHead {
            partial: request.partial,
            offset: request.range_offset,
            length: source.known_length().or_else(|| self.proxy.source().known_length()),
            mime: source.mime(),
        };
        out.write_all(head.encode().as_bytes()).await?;

        let mut buf = vec![0u8; DEFAULT_BUFFER_SIZE];
        let mut sent = 0u64;
        loop {
            let read = stream.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            out.write_all(&buf[..read]).await?;
            sent += read as u64;
        }
        out.flush().await?;
        Ok(Served {
            status: status_of(request),
            bytes: sent,
            delivery: Delivery::Direct,
        })
    }

    fn cached_response_head(&self, request: &GetRequest) -> ResponseHead {
        let cache = self.proxy.cache();
        let source = self.proxy.source();
        let length = if cache.is_completed() {
            cache.available().ok()
        } else {
            source.known_length()
        };
        ResponseHead {
            partial: request.partial,
            offset: request.range_offset,
            length,
            mime: source.mime(),
        }
    }
}

fn status_of(request: &GetRequest) -> u16 {
    if request.partial {
        206
    } else {
        200
    }
}
