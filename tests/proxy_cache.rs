mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use support::*;
use videocache::source::{
    HttpUrlSource, MemorySourceInfoStorage, SledSourceInfoStorage, Source, SourceInfo, SourceInfoStorage,
    SourceStream, StaticHeadersInjector,
};
use videocache::storage::Cache;
use videocache::{ProxyCache, ProxyCacheError, ProxyCacheListener};

fn proxy_cache(source: HttpUrlSource, cache_path: &std::path::Path) -> (ProxyCache, Arc<dyn Cache>) {
    let cache: Arc<dyn Cache> = Arc::new(file_cache(cache_path));
    (ProxyCache::new(Arc::new(source), cache.clone(), None), cache)
}

async fn read_all(proxy: &ProxyCache, chunk: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; chunk];
    loop {
        let read = proxy.read(&mut buf, out.len() as u64).await.unwrap();
        if read == 0 {
            return out;
        }
        out.extend_from_slice(&buf[..read]);
    }
}

#[tokio::test]
async fn test_read_through_whole_resource() {
    let data = gen_bytes(300_000);
    let origin = MockServer::serve(data.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("whole.bin");
    let (proxy, cache) = proxy_cache(http_source(&origin.url("/whole.bin")), &path);

    let body = read_all(&proxy, 8 * 1024).await;
    assert_eq!(hash_bytes(&body), hash_bytes(&data));
    assert!(cache.is_completed());
    assert_eq!(std::fs::read(&path).unwrap().len(), data.len());
    assert_eq!(origin.hits(), 1);
}

#[tokio::test]
async fn test_random_offsets() {
    let data = gen_bytes(200_000);
    let origin = MockServer::serve(data.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let (proxy, _) = proxy_cache(http_source(&origin.url("/random.bin")), &dir.path().join("random.bin"));

    for (offset, len) in [(150_000usize, 4_000usize), (0, 10), (99_999, 1), (199_000, 1_000)] {
        let mut buf = vec![0u8; len];
        let read = proxy.read(&mut buf, offset as u64).await.unwrap();
        assert_eq!(read, len);
        assert_eq!(&buf[..], &data[offset..offset + len]);
    }

    // past the end
    let mut buf = vec![0u8; 100];
    assert_eq!(proxy.read(&mut buf, 200_000).await.unwrap(), 0);
    let read = proxy.read(&mut buf, 199_950).await.unwrap();
    assert_eq!(read, 50);
}

#[tokio::test]
async fn test_completed_cache_skips_network() {
    let data = gen_bytes(50_000);
    let origin = MockServer::serve(data.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("done.bin");
    std::fs::write(&path, &data).unwrap();

    let (proxy, cache) = proxy_cache(http_source(&origin.url("/done.bin")), &path);
    assert!(cache.is_completed());
    let body = read_all(&proxy, 4_096).await;
    assert_eq!(hash_bytes(&body), hash_bytes(&data));
    cache.complete().unwrap();
    assert_eq!(origin.hits(), 0);
}

#[tokio::test]
async fn test_concurrent_readers_share_one_fetch() {
    let data = gen_bytes(500_000);
    let origin = MockServer::serve(data.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let (proxy, _) = proxy_cache(http_source(&origin.url("/shared.bin")), &dir.path().join("shared.bin"));
    let proxy = Arc::new(proxy);

    let mut tasks = Vec::new();
    for offset in [0u64, 123_456, 400_000, 499_000] {
        let proxy = Arc::clone(&proxy);
        tasks.push(tokio::spawn(async move {
            let mut buf = vec![0u8; 1_000];
            let read = proxy.read(&mut buf, offset).await.unwrap();
            (offset as usize, buf[..read].to_vec())
        }));
    }
    for task in tasks {
        let (offset, bytes) = task.await.unwrap();
        assert_eq!(bytes.len(), 1_000);
        assert_eq!(&bytes[..], &data[offset..offset + 1_000]);
    }
    assert_eq!(origin.hits(), 1);
}

#[tokio::test]
async fn test_source_error_is_retryable() {
    let origin = MockServer::serve(gen_bytes(10)).await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing.bin");
    let (proxy, cache) = proxy_cache(http_source(&origin.url("/missing/file.bin")), &path);

    let mut buf = vec![0u8; 100];
    let err = proxy.read(&mut buf, 0).await.unwrap_err();
    assert!(err.is_retryable(), "unexpected error {err}");
    assert!(!cache.is_completed());
    assert!(!path.exists());
}

#[tokio::test]
async fn test_redirects_are_followed() {
    let data = gen_bytes(70_000);
    let origin = MockServer::serve(data.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let (proxy, _) = proxy_cache(http_source(&origin.url("/redirect/3/r.bin")), &dir.path().join("r.bin"));

    let body = read_all(&proxy, 8_192).await;
    assert_eq!(hash_bytes(&body), hash_bytes(&data));
}

#[tokio::test]
async fn test_too_many_redirects() {
    let origin = MockServer::serve(gen_bytes(1_000)).await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("loop.bin");
    let (proxy, cache) = proxy_cache(http_source(&origin.url("/redirect/6/loop.bin")), &path);

    let mut buf = vec![0u8; 100];
    let err = proxy.read(&mut buf, 0).await.unwrap_err();
    assert!(matches!(err, ProxyCacheError::TooManyRedirects { count: 6, .. }), "unexpected error {err}");
    assert!(!err.is_retryable());
    assert!(!cache.is_completed());
    assert!(!path.exists());

    // stays failed
    let err = proxy.read(&mut buf, 0).await.unwrap_err();
    assert!(matches!(err, ProxyCacheError::TooManyRedirects { .. }));
}

/// Source without a known length, served in uneven chunks.
struct UnsizedSource(bytes::Bytes);

struct UnsizedStream {
    data: bytes::Bytes,
    pos: usize,
}

#[async_trait]
impl SourceStream for UnsizedStream {
    async fn read(&mut self, buf: &mut [u8]) -> videocache::Result<usize> {
        let n = (self.data.len() - self.pos).min(buf.len()).min(3_333);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[async_trait]
impl Source for UnsizedSource {
    fn url(&self) -> &str {
        "http://unsized.invalid/x"
    }

    async fn length(&self) -> Option<u64> {
        None
    }

    fn known_length(&self) -> Option<u64> {
        None
    }

    fn mime(&self) -> Option<String> {
        None
    }

    async fn open(&self, offset: u64) -> videocache::Result<Box<dyn SourceStream>> {
        Ok(Box::new(UnsizedStream {
            data: self.0.clone(),
            pos: offset as usize,
        }))
    }

    fn fresh(&self) -> Arc<dyn Source> {
        Arc::new(UnsizedSource(self.0.clone()))
    }
}

#[tokio::test]
async fn test_unknown_length_completes_at_eof() {
    let data = gen_bytes(40_000);
    let dir = tempfile::tempdir().unwrap();
    let cache: Arc<dyn Cache> = Arc::new(file_cache(&dir.path().join("unsized.bin")));
    let proxy = ProxyCache::new(Arc::new(UnsizedSource(data.clone())), cache.clone(), None);

    let body = read_all(&proxy, 16_384).await;
    assert_eq!(hash_bytes(&body), hash_bytes(&data));
    assert!(cache.is_completed());
}

#[tokio::test]
async fn test_origin_ignoring_range() {
    let data = gen_bytes(30_000);
    let opts = OriginOptions {
        ignore_range: true,
        ..Default::default()
    };
    let origin = MockServer::start(resp_payload(data.clone(), opts)).await;
    let source = http_source(&origin.url("/norange.bin"));

    let mut stream = source.open(12_345).await.unwrap();
    let mut body = Vec::new();
    let mut buf = vec![0u8; 4_000];
    loop {
        let read = stream.read(&mut buf).await.unwrap();
        if read == 0 {
            break;
        }
        body.extend_from_slice(&buf[..read]);
    }
    assert_eq!(&body[..], &data[12_345..]);
    assert_eq!(source.known_length(), Some(30_000));
}

#[tokio::test]
async fn test_length_probe_and_info_storage() {
    let data = gen_bytes(12_000);
    let origin = MockServer::serve(data).await;
    let url = origin.url("/probe.mp4");
    let storage = Arc::new(MemorySourceInfoStorage::new());
    let source = HttpUrlSource::new(
        &url,
        origin_client(),
        storage.clone(),
        Arc::new(videocache::source::EmptyHeadersInjector),
    );

    assert_eq!(source.known_length(), None);
    assert_eq!(source.length().await, Some(12_000));
    assert_eq!(source.mime().as_deref(), Some(MIME));
    assert_eq!(origin.hits(), 1);

    let stored = storage.get(&url).unwrap();
    assert_eq!(stored.length, Some(12_000));

    // a second source for the same url starts from the stored info
    let again = HttpUrlSource::new(
        &url,
        origin_client(),
        storage,
        Arc::new(videocache::source::EmptyHeadersInjector),
    );
    assert_eq!(again.length().await, Some(12_000));
    assert_eq!(origin.hits(), 1);
}

#[tokio::test]
async fn test_failed_probe_leaves_length_unknown() {
    let origin = MockServer::serve(gen_bytes(10)).await;
    let source = http_source(&origin.url("/missing/x.bin"));
    assert_eq!(source.length().await, None);
    assert_eq!(source.known_length(), None);
}

#[tokio::test]
async fn test_headers_are_injected() {
    let data = gen_bytes(9_000);
    let opts = OriginOptions {
        required_headers: vec![("x-token".to_string(), "secret".to_string())],
        ..Default::default()
    };
    let origin = MockServer::start(resp_payload(data.clone(), opts)).await;
    let url = origin.url("/private.bin");

    let plain = http_source(&url);
    assert!(plain.open(0).await.is_err());

    let mut headers = std::collections::HashMap::new();
    headers.insert("x-token".to_string(), "secret".to_string());
    let source = HttpUrlSource::new(
        &url,
        origin_client(),
        Arc::new(MemorySourceInfoStorage::new()),
        Arc::new(StaticHeadersInjector::new(&headers)),
    );
    assert_eq!(source.length().await, Some(9_000));
    let dir = tempfile::tempdir().unwrap();
    let (proxy, _) = proxy_cache(source, &dir.path().join("private.bin"));
    let body = read_all(&proxy, 8_192).await;
    assert_eq!(hash_bytes(&body), hash_bytes(&data));
}

#[test]
fn test_sled_info_storage() {
    let storage = SledSourceInfoStorage::temporary().unwrap();
    assert!(storage.get("http://a/b.mp4").is_none());

    let info = SourceInfo {
        url: "http://a/b.mp4".to_string(),
        length: Some(42),
        mime: Some(MIME.to_string()),
    };
    storage.put("http://a/b.mp4", &info);
    assert_eq!(storage.get("http://a/b.mp4"), Some(info));
    storage.release();
}

#[derive(Default)]
struct Percents {
    seen: Mutex<Vec<u8>>,
    errors: Mutex<Vec<String>>,
}

impl ProxyCacheListener for Percents {
    fn on_cache_percentage(&self, percents: u8) {
        self.seen.lock().unwrap().push(percents);
    }

    fn on_error(&self, err: &ProxyCacheError) {
        self.errors.lock().unwrap().push(err.to_string());
    }
}

#[tokio::test]
async fn test_listener_receives_percentages() {
    let data = gen_bytes(100_000);
    let origin = MockServer::serve(data).await;
    let dir = tempfile::tempdir().unwrap();
    let listener = Arc::new(Percents::default());
    let cache: Arc<dyn Cache> = Arc::new(file_cache(&dir.path().join("p.bin")));
    let proxy = ProxyCache::new(
        Arc::new(http_source(&origin.url("/p.bin"))),
        cache,
        Some(listener.clone()),
    );

    read_all(&proxy, 8_192).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let seen = listener.seen.lock().unwrap().clone();
    assert!(seen.contains(&100));
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "percentages went backwards: {seen:?}");
    assert!(listener.errors.lock().unwrap().is_empty());
}

/// Source that never produces a byte.
struct StallingSource;

struct StallingStream;

#[async_trait]
impl SourceStream for StallingStream {
    async fn read(&mut self, _buf: &mut [u8]) -> videocache::Result<usize> {
        std::future::pending::<()>().await;
        Ok(0)
    }
}

#[async_trait]
impl Source for StallingSource {
    fn url(&self) -> &str {
        "http://stalling.invalid/x"
    }

    async fn length(&self) -> Option<u64> {
        Some(1_000)
    }

    fn known_length(&self) -> Option<u64> {
        Some(1_000)
    }

    fn mime(&self) -> Option<String> {
        None
    }

    async fn open(&self, _offset: u64) -> videocache::Result<Box<dyn SourceStream>> {
        Ok(Box::new(StallingStream))
    }

    fn fresh(&self) -> Arc<dyn Source> {
        Arc::new(StallingSource)
    }
}

#[tokio::test]
async fn test_shutdown_interrupts_blocked_read() {
    let dir = tempfile::tempdir().unwrap();
    let cache: Arc<dyn Cache> = Arc::new(file_cache(&dir.path().join("stall.bin")));
    let proxy = Arc::new(ProxyCache::new(Arc::new(StallingSource), cache, None));

    let reader = {
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 100];
            proxy.read(&mut buf, 0).await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(proxy.is_reading());
    proxy.shutdown();

    let result = tokio::time::timeout(Duration::from_millis(500), reader)
        .await
        .expect("read returns promptly after shutdown")
        .unwrap();
    assert!(matches!(result, Err(ProxyCacheError::Interrupted)));
    assert!(!proxy.is_reading());
}

/// Source that claims 10 bytes but delivers 20.
struct LyingSource;

struct Bytes20(bool);

#[async_trait]
impl SourceStream for Bytes20 {
    async fn read(&mut self, buf: &mut [u8]) -> videocache::Result<usize> {
        if self.0 {
            return Ok(0);
        }
        self.0 = true;
        buf[..20].fill(1);
        Ok(20)
    }
}

#[async_trait]
impl Source for LyingSource {
    fn url(&self) -> &str {
        "http://lying.invalid/x"
    }

    async fn length(&self) -> Option<u64> {
        Some(10)
    }

    fn known_length(&self) -> Option<u64> {
        Some(10)
    }

    fn mime(&self) -> Option<String> {
        None
    }

    async fn open(&self, _offset: u64) -> videocache::Result<Box<dyn SourceStream>> {
        Ok(Box::new(Bytes20(false)))
    }

    fn fresh(&self) -> Arc<dyn Source> {
        Arc::new(LyingSource)
    }
}

#[tokio::test]
async fn test_cache_larger_than_source_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let cache: Arc<dyn Cache> = Arc::new(file_cache(&dir.path().join("lying.bin")));
    let proxy = ProxyCache::new(Arc::new(LyingSource), cache.clone(), None);

    let mut buf = vec![0u8; 64];
    let err = proxy.read(&mut buf, 0).await.unwrap_err();
    assert!(
        matches!(err, ProxyCacheError::Inconsistent { cached: 20, source_len: 10 }),
        "unexpected error {err}"
    );
    assert!(!cache.is_completed());
}

#[tokio::test]
async fn test_default_user_agent() {
    let data = gen_bytes(2_000);
    let opts = OriginOptions {
        required_headers: vec![("user-agent".to_string(), videocache::runtime::user_agent().to_string())],
        ..Default::default()
    };
    let origin = MockServer::start(resp_payload(data.clone(), opts)).await;
    let dir = tempfile::tempdir().unwrap();
    let (proxy, _) = proxy_cache(http_source(&origin.url("/ua.bin")), &dir.path().join("ua.bin"));
    let body = read_all(&proxy, 8_192).await;
    assert_eq!(hash_bytes(&body), hash_bytes(&data));
}
