#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, LOCATION, RANGE};
use http::{HeaderMap, Method, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use rand::RngCore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use videocache::source::{EmptyHeadersInjector, HttpUrlSource, MemorySourceInfoStorage, OriginClient};
use videocache::storage::{DiskUsage, FileCache, LruDiskUsage};
use videocache::{Builder, CacheListener, HttpProxyCacheServer};

pub const MIME: &str = "video/mp4";

pub struct MockServer {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MockServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(http::Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown, mut rx) = tokio::sync::oneshot::channel();
        let handler = Arc::new(handler);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    res = listener.accept() => {
                        let (stream, _) = match res { Ok(v) => v, Err(_) => break };
                        let io = TokioIo::new(stream);
                        let handler = Arc::clone(&handler);
                        let counter = Arc::clone(&counter);
                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                counter.fetch_add(1, Ordering::SeqCst);
                                let resp = handler(req);
                                async move { Ok::<_, hyper::Error>(resp) }
                            });
                            let builder = ConnBuilder::new(TokioExecutor::new());
                            let _ = builder.serve_connection(io, service).await;
                        });
                    }
                }
            }
        });

        Self {
            addr,
            hits,
            shutdown: Some(shutdown),
        }
    }

    /// Serves `data` at every path, honouring `Range: bytes=N-`.
    pub async fn serve(data: Bytes) -> Self {
        Self::start(resp_payload(data, OriginOptions::default())).await
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}/{}", self.addr, path.trim_start_matches('/'))
    }

    /// Number of requests received so far.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// Minimal `CONNECT` proxy recording the targets it tunnels to.
pub struct ConnectProxy {
    addr: SocketAddr,
    targets: Arc<Mutex<Vec<String>>>,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
}

impl ConnectProxy {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind proxy");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown, mut rx) = tokio::sync::oneshot::channel();
        let targets = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&targets);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    res = listener.accept() => {
                        let (stream, _) = match res { Ok(v) => v, Err(_) => break };
                        let seen = Arc::clone(&seen);
                        tokio::spawn(async move {
                            let _ = tunnel(stream, seen).await;
                        });
                    }
                }
            }
        });

        Self {
            addr,
            targets,
            shutdown: Some(shutdown),
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// `host:port` of every `CONNECT` received so far.
    pub fn targets(&self) -> Vec<String> {
        self.targets.lock().unwrap().clone()
    }
}

impl Drop for ConnectProxy {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

async fn tunnel(mut client: TcpStream, seen: Arc<Mutex<Vec<String>>>) -> std::io::Result<()> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if client.read(&mut byte).await? == 0 {
            return Ok(());
        }
        head.push(byte[0]);
    }
    let head = String::from_utf8_lossy(&head).into_owned();
    let mut parts = head.split_whitespace();
    if parts.next() != Some("CONNECT") {
        client.write_all(b"HTTP/1.1 405 Method Not Allowed\r\n\r\n").await?;
        return Ok(());
    }
    let target = parts.next().unwrap_or_default().to_string();
    seen.lock().unwrap().push(target.clone());

    let mut upstream = TcpStream::connect(&target).await?;
    client.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n").await?;
    tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
}

#[derive(Clone, Default)]
pub struct OriginOptions {
    /// Answer 200 with the whole body even for range requests.
    pub ignore_range: bool,
    /// Headers every request must carry, otherwise 403.
    pub required_headers: Vec<(String, String)>,
}

/// Origin handler. `/redirect/N/...` answers with a chain of N redirects
/// before serving the payload, `/missing` is a 404.
pub fn resp_payload(
    data: Bytes,
    opts: OriginOptions,
) -> impl Fn(http::Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync {
    move |req: http::Request<Incoming>| {
        let path = req.uri().path().to_string();
        if path.starts_with("/missing") {
            return build_response(StatusCode::NOT_FOUND, HeaderMap::new(), Bytes::new());
        }
        for (name, value) in &opts.required_headers {
            let sent = req.headers().get(name.as_str()).and_then(|v| v.to_str().ok());
            if sent != Some(value.as_str()) {
                return build_response(StatusCode::FORBIDDEN, HeaderMap::new(), Bytes::new());
            }
        }
        if let Some(rest) = path.strip_prefix("/redirect/") {
            let (count, tail) = rest.split_once('/').unwrap_or((rest, ""));
            let count: usize = count.parse().unwrap_or(0);
            if count > 0 {
                let mut headers = HeaderMap::new();
                let next = format!("/redirect/{}/{}", count - 1, tail);
                headers.insert(LOCATION, next.parse().unwrap());
                return build_response(StatusCode::FOUND, headers, Bytes::new());
            }
        }

        let total = data.len() as u64;
        let offset = req
            .headers()
            .get(RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("bytes="))
            .and_then(|v| v.split('-').next())
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|_| !opts.ignore_range)
            .unwrap_or(0)
            .min(total);

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, MIME.parse().unwrap());
        headers.insert(ACCEPT_RANGES, "bytes".parse().unwrap());
        let body = data.slice(offset as usize..);
        headers.insert(CONTENT_LENGTH, body.len().to_string().parse().unwrap());
        let status = if req.headers().contains_key(RANGE) && !opts.ignore_range {
            headers.insert(
                CONTENT_RANGE,
                format!("bytes {}-{}/{}", offset, total.saturating_sub(1), total).parse().unwrap(),
            );
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        };
        let body = if req.method() == Method::HEAD { Bytes::new() } else { body };
        build_response(status, headers, body)
    }
}

fn build_response(status: StatusCode, headers: HeaderMap, body: Bytes) -> Response<Full<Bytes>> {
    let mut builder = Response::builder().status(status);
    for (k, v) in headers.iter() {
        builder = builder.header(k, v);
    }
    builder.body(Full::new(body)).unwrap()
}

pub fn gen_bytes(size: usize) -> Bytes {
    let mut buf = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut buf);
    Bytes::from(buf)
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

/// Raw response read off the proxy socket.
#[derive(Debug, Default)]
pub struct RawResponse {
    pub status_line: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|v| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.status_line.is_empty()
    }
}

/// Sends a GET for `proxy_url` over a plain socket and reads until close.
pub async fn fetch(proxy_url: &str, range_offset: Option<u64>) -> RawResponse {
    let rest = proxy_url.strip_prefix("http://").expect("proxy url");
    let (authority, path) = rest.split_once('/').expect("proxy path");
    let mut stream = TcpStream::connect(authority).await.expect("connect proxy");
    let mut request = format!("GET /{path} HTTP/1.1\r\nHost: {authority}\r\n");
    if let Some(offset) = range_offset {
        request.push_str(&format!("Range: bytes={offset}-\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await.expect("write request");

    let mut raw = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(30), stream.read_to_end(&mut raw))
        .await
        .expect("response in time");
    parse_raw(&raw)
}

pub fn parse_raw(raw: &[u8]) -> RawResponse {
    let Some(split) = raw.windows(4).position(|w| w == b"\r\n\r\n") else {
        return RawResponse::default();
    };
    let head = String::from_utf8_lossy(&raw[..split]).into_owned();
    let mut lines = head.lines();
    let status_line = lines.next().unwrap_or_default().to_string();
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();
    RawResponse {
        status_line,
        headers,
        body: raw[split + 4..].to_vec(),
    }
}

pub async fn new_server(dir: &Path) -> HttpProxyCacheServer {
    Builder::new(dir).build().await.expect("start proxy server")
}

pub fn origin_client() -> OriginClient {
    OriginClient::new(false, Duration::from_secs(5)).expect("origin client")
}

pub fn http_source(url: &str) -> HttpUrlSource {
    HttpUrlSource::new(
        url,
        origin_client(),
        Arc::new(MemorySourceInfoStorage::new()),
        Arc::new(EmptyHeadersInjector),
    )
}

pub fn file_cache(path: &Path) -> FileCache {
    FileCache::new(path, unlimited_disk_usage()).expect("file cache")
}

pub fn unlimited_disk_usage() -> Arc<dyn DiskUsage> {
    Arc::new(LruDiskUsage::total_size(u64::MAX))
}

pub fn list_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .expect("read dir")
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    files.sort();
    files
}

#[derive(Default)]
pub struct RecordingListener {
    pub events: Mutex<Vec<(PathBuf, String, u8)>>,
}

impl RecordingListener {
    pub fn percents(&self) -> Vec<u8> {
        self.events.lock().unwrap().iter().map(|(_, _, p)| *p).collect()
    }
}

impl CacheListener for RecordingListener {
    fn on_cache_available(&self, cache_file: &Path, url: &str, percents: u8) {
        self.events
            .lock()
            .unwrap()
            .push((cache_file.to_path_buf(), url.to_string(), percents));
    }
}
