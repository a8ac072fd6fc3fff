use std::fs;
use std::net::{Shutdown, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use http::Method;
use http_body_util::BodyExt;
use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch, Semaphore};
use tokio::task::JoinHandle;

use crate::access_log::{AccessLogger, AccessRecord};
use crate::config::Bootstrap;
use crate::constants::{
    DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_MAX_CACHE_SIZE, DEFAULT_NO_CACHE_BARRIER, DEFAULT_PING_ATTEMPTS,
    DEFAULT_PING_TIMEOUT_MS, DEFAULT_WORKERS, MAX_REQUEST_HEADER_BYTES, PING_REQUEST, PING_RESPONSE, PROXY_HOST,
};
use crate::error::{is_disconnect, ProxyCacheError, Result};
use crate::http_range::GetRequest;
use crate::logging;
use crate::metrics::{self, Delivery};
use crate::proxy::{CacheListener, Clients, Config};
use crate::source::{
    EmptyHeadersInjector, HeaderInjector, MemorySourceInfoStorage, OriginClient, SledSourceInfoStorage,
    SourceInfoStorage, StaticHeadersInjector, UpstreamProxy,
};
use crate::storage::{Cipher, DiskUsage, FileNameGenerator, LruDiskUsage, Md5FileNameGenerator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Starting,
    Listening,
    ShuttingDown,
    Stopped,
}

/// Local HTTP server that proxies remote resources through the disk cache.
///
/// ```no_run
/// # async fn demo() -> anyhow::Result<()> {
/// let server = videocache::Builder::new("/tmp/video-cache").build().await?;
/// let local = server.proxy_url("https://example.com/movie.mp4");
/// // hand `local` to the player ...
/// server.shutdown();
/// # Ok(())
/// # }
/// ```
pub struct HttpProxyCacheServer {
    inner: Arc<ServerInner>,
    accept: Mutex<Option<JoinHandle<()>>>,
}

struct ServerInner {
    port: u16,
    clients: Clients,
    pool: Arc<Semaphore>,
    state: Mutex<State>,
    pinged: AtomicBool,
    shutdown: watch::Sender<bool>,
    access_log: Option<Arc<AccessLogger>>,
}

struct Settings {
    workers: usize,
    ping_attempts: u32,
    ping_timeout: Duration,
    ping_client: OriginClient,
    access_log: Option<Arc<AccessLogger>>,
}

impl HttpProxyCacheServer {
    async fn start(config: Config, settings: Settings) -> anyhow::Result<Self> {
        let listener = std::net::TcpListener::bind((PROXY_HOST, 0)).context("bind proxy socket")?;
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        let port = listener.local_addr()?.port();

        let (shutdown, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(ServerInner {
            port,
            clients: Clients::new(config),
            pool: Arc::new(Semaphore::new(settings.workers.max(1))),
            state: Mutex::new(State::Starting),
            pinged: AtomicBool::new(false),
            shutdown,
            access_log: settings.access_log,
        });

        let (ready, wait_ready) = oneshot::channel();
        let accept = tokio::spawn(accept_loop(listener, Arc::clone(&inner), shutdown_rx, ready));
        wait_ready.await.map_err(|_| anyhow!("accept loop exited before becoming ready"))?;
        inner.set_state(State::Listening);
        log::info!("proxy cache server listening on {PROXY_HOST}:{port}");

        let server = Self {
            inner,
            accept: Mutex::new(Some(accept)),
        };
        let pinged = server
            .ping(&settings.ping_client, settings.ping_attempts, settings.ping_timeout)
            .await;
        server.inner.pinged.store(pinged, Ordering::SeqCst);
        if !pinged {
            log::error!(
                "error pinging proxy server (attempts: {}, initial timeout: {:?}), shutting down",
                settings.ping_attempts,
                settings.ping_timeout
            );
            server.shutdown();
        }
        Ok(server)
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    pub fn state(&self) -> State {
        *self.inner.state.lock().expect("server state")
    }

    pub fn is_pinged(&self) -> bool {
        self.inner.pinged.load(Ordering::SeqCst)
    }

    /// Url to hand to the player instead of `url`.
    pub fn proxy_url(&self, url: &str) -> String {
        self.proxy_url_with(url, true)
    }

    /// Like [`proxy_url`](Self::proxy_url). With `allow_cached_file` a fully
    /// cached resource is returned as a `file://` url. Falls back to `url`
    /// itself when the server could not be pinged.
    pub fn proxy_url_with(&self, url: &str, allow_cached_file: bool) -> String {
        let config = self.inner.clients.config();
        if allow_cached_file && config.cipher.is_none() && self.is_cached(url) {
            let file = config.cache_file(url);
            config.disk_usage.touch(&file);
            if let Ok(file_url) = url::Url::from_file_path(&file) {
                return file_url.into();
            }
        }
        if self.is_pinged() {
            self.append_to_proxy_url(url)
        } else {
            url.to_string()
        }
    }

    fn append_to_proxy_url(&self, url: &str) -> String {
        format!(
            "http://{}:{}/{}",
            PROXY_HOST,
            self.inner.port,
            utf8_percent_encode(url, NON_ALPHANUMERIC)
        )
    }

    /// Whether `url` is completely cached. Never touches the network.
    pub fn is_cached(&self, url: &str) -> bool {
        self.inner.clients.config().cache_file(url).is_file()
    }

    pub fn cache_file(&self, url: &str) -> PathBuf {
        self.inner.clients.config().cache_file(url)
    }

    pub fn register_cache_listener(&self, listener: Arc<dyn CacheListener>, url: &str) {
        self.inner.clients.register_listener(listener, url);
    }

    pub fn unregister_cache_listener(&self, listener: &Arc<dyn CacheListener>, url: &str) {
        self.inner.clients.unregister_listener(listener, url);
    }

    pub fn unregister_cache_listener_all(&self, listener: &Arc<dyn CacheListener>) {
        self.inner.clients.unregister_listener_all(listener);
    }

    pub fn clients_count(&self) -> usize {
        self.inner.clients.total_clients_count()
    }

    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock().expect("server state");
            if matches!(*state, State::ShuttingDown | State::Stopped) {
                return;
            }
            *state = State::ShuttingDown;
        }
        log::info!("shutdown proxy cache server on port {}", self.inner.port);
        self.inner.clients.shutdown_all();
        self.inner.clients.config().source_info_storage.release();
        let _ = self.inner.shutdown.send(true);
        if let Some(accept) = self.accept.lock().expect("accept loop").take() {
            accept.abort();
        }
        self.inner.set_state(State::Stopped);
    }

    /// `client` dials loopback directly, whatever upstream proxy origins use.
    async fn ping(&self, client: &OriginClient, attempts: u32, initial_timeout: Duration) -> bool {
        let ping_url = format!("http://{}:{}/{}", PROXY_HOST, self.inner.port, PING_REQUEST);
        let mut timeout = initial_timeout;
        for attempt in 1..=attempts {
            match tokio::time::timeout(timeout, ping_once(client, &ping_url)).await {
                Ok(Ok(true)) => return true,
                Ok(Ok(false)) => log::warn!("unexpected ping response, attempt {attempt}"),
                Ok(Err(err)) => log::warn!("error pinging server, attempt {attempt}: {err}"),
                Err(_) => log::warn!("ping timed out after {timeout:?}, attempt {attempt}"),
            }
            timeout *= 2;
        }
        false
    }
}

async fn ping_once(client: &OriginClient, url: &str) -> Result<bool> {
    let response = client.send(Method::GET, url, &[]).await?;
    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|err| ProxyCacheError::upstream(url, err.to_string()))?
        .to_bytes();
    Ok(body.as_ref() == PING_RESPONSE.as_bytes())
}

impl ServerInner {
    fn set_state(&self, state: State) {
        *self.state.lock().expect("server state") = state;
    }

    async fn process_socket(self: Arc<Self>, socket: TcpStream, peer: SocketAddr) {
        let mut socket = socket;
        match self.serve(&mut socket, peer).await {
            Ok(()) => {}
            Err(err) if err.is_client_disconnect() || err.is_interrupted() => {
                log::debug!("client communication problem: {err}");
            }
            Err(err) => log::error!("error processing request: {err}"),
        }
        release_socket(socket).await;
        log::debug!("opened connections: {}", self.clients.total_clients_count());
    }

    async fn serve(&self, socket: &mut TcpStream, peer: SocketAddr) -> Result<()> {
        let started = Instant::now();
        let head = read_request_head(socket).await?;
        let request = GetRequest::parse(&head)?;
        log::debug!("request to cache proxy: {request:?}");

        if request.uri == PING_REQUEST {
            socket.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await?;
            socket.write_all(PING_RESPONSE.as_bytes()).await?;
            socket.flush().await?;
            metrics::record_request(Delivery::Ping, 200);
            return Ok(());
        }

        let url = percent_decode_str(&request.uri)
            .decode_utf8()
            .map_err(|err| ProxyCacheError::InvalidRequest(format!("url is not utf-8: {err}")))?
            .into_owned();
        let client = self.clients.attach(&url)?;
        let served = client.adapter().process_request(&request, socket).await?;
        drop(client);

        metrics::record_request(served.delivery, served.status);
        if let Some(access_log) = &self.access_log {
            access_log.log(&AccessRecord {
                peer: Some(peer),
                url,
                offset: request.range_offset,
                status: served.status,
                bytes: served.bytes,
                elapsed: started.elapsed(),
                delivery: served.delivery,
            });
        }
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    inner: Arc<ServerInner>,
    mut shutdown: watch::Receiver<bool>,
    ready: oneshot::Sender<()>,
) {
    let _ = ready.send(());
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            res = listener.accept() => match res {
                Ok((socket, peer)) => {
                    let inner = Arc::clone(&inner);
                    let mut stopped = shutdown.clone();
                    tokio::spawn(async move {
                        let serve = async {
                            let Ok(_permit) = Arc::clone(&inner.pool).acquire_owned().await else { return };
                            let trace_id = metrics::generate_request_id();
                            logging::with_trace_id(trace_id, Arc::clone(&inner).process_socket(socket, peer)).await;
                        };
                        // the socket is dropped with `serve` when the server stops first
                        let stop = async move {
                            let _ = stopped.wait_for(|stopped| *stopped).await;
                        };
                        tokio::select! {
                            biased;
                            _ = stop => {
                                log::debug!("dropping connection from {peer}, server is shut down");
                            }
                            _ = serve => {}
                        }
                    });
                }
                Err(err) if is_disconnect(&err) => log::debug!("client dropped before accept: {err}"),
                Err(err) => log::error!("error accepting connection: {err}"),
            }
        }
    }
    log::debug!("accept loop on port {} stopped", inner.port);
}

/// Reads up to the blank line ending the request head.
async fn read_request_head(socket: &mut TcpStream) -> Result<String> {
    let mut head = Vec::with_capacity(1024);
    let mut buf = [0u8; 1024];
    loop {
        let read = socket.read(&mut buf).await?;
        if read == 0 {
            if head.is_empty() {
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
            break;
        }
        head.extend_from_slice(&buf[..read]);
        if head_complete(&head) {
            break;
        }
        if head.len() > MAX_REQUEST_HEADER_BYTES {
            return Err(ProxyCacheError::InvalidRequest("request head too large".to_string()));
        }
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

fn head_complete(head: &[u8]) -> bool {
    head.windows(4).any(|w| w == b"\r\n\r\n") || head.windows(2).any(|w| w == b"\n\n")
}

/// Closes output, input and the socket itself; a failure in one step does
/// not skip the others.
async fn release_socket(mut socket: TcpStream) {
    if let Err(err) = socket.shutdown().await {
        log::debug!("error closing socket output: {err}");
    }
    match socket.into_std() {
        Ok(socket) => {
            if let Err(err) = socket.shutdown(Shutdown::Read) {
                log::debug!("error closing socket input: {err}");
            }
        }
        Err(err) => log::debug!("error closing socket: {err}"),
    }
}

/// Configures and starts an [`HttpProxyCacheServer`].
pub struct Builder {
    cache_root: PathBuf,
    file_name_generator: Arc<dyn FileNameGenerator>,
    disk_usage: Option<Arc<dyn DiskUsage>>,
    max_cache_size: u64,
    max_cache_files: Option<usize>,
    source_info_storage: Option<Arc<dyn SourceInfoStorage>>,
    header_injector: Arc<dyn HeaderInjector>,
    cipher: Option<Arc<dyn Cipher>>,
    no_cache_barrier: f64,
    workers: usize,
    ping_attempts: u32,
    ping_timeout: Duration,
    insecure_skip_verify: bool,
    connect_timeout: Duration,
    upstream_proxy: Option<UpstreamProxy>,
    access_log: Option<Arc<AccessLogger>>,
}

impl Builder {
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            file_name_generator: Arc::new(Md5FileNameGenerator),
            disk_usage: None,
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            max_cache_files: None,
            source_info_storage: None,
            header_injector: Arc::new(EmptyHeadersInjector),
            cipher: None,
            no_cache_barrier: DEFAULT_NO_CACHE_BARRIER,
            workers: DEFAULT_WORKERS,
            ping_attempts: DEFAULT_PING_ATTEMPTS,
            ping_timeout: Duration::from_millis(DEFAULT_PING_TIMEOUT_MS),
            insecure_skip_verify: false,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            upstream_proxy: None,
            access_log: None,
        }
    }

    pub fn from_bootstrap(cfg: &Bootstrap) -> anyhow::Result<Self> {
        cfg.validate()?;
        let mut builder = Self::new(&cfg.cache.dir)
            .max_cache_size(cfg.cache.max_size)
            .no_cache_barrier(cfg.cache.no_cache_barrier)
            .workers(cfg.server.workers)
            .ping(cfg.server.ping_attempts, cfg.server.ping_timeout)
            .insecure_skip_verify(cfg.upstream.insecure_skip_verify)
            .connect_timeout(cfg.upstream.connect_timeout);
        if cfg.cache.max_files > 0 {
            builder = builder.max_cache_files_count(cfg.cache.max_files);
        }
        if !cfg.upstream.headers.is_empty() {
            builder = builder.header_injector(Arc::new(StaticHeadersInjector::new(&cfg.upstream.headers)));
        }
        if let Some(proxy) = cfg.upstream.proxy.as_ref().filter(|p| !p.is_empty()) {
            builder = builder.upstream_proxy(UpstreamProxy::new(proxy).no_proxy(&cfg.upstream.no_proxy));
        }
        if let Some(path) = &cfg.cache.index_path {
            builder = builder.source_info_storage(Arc::new(SledSourceInfoStorage::open(path)?));
        }
        if let Some(access) = cfg.server.access_log.as_ref().filter(|a| a.enabled) {
            builder = builder.access_logger(Arc::new(AccessLogger::new(Some(&access.path))?));
        }
        Ok(builder)
    }

    pub fn cache_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_root = dir.into();
        self
    }

    pub fn file_name_generator(mut self, generator: Arc<dyn FileNameGenerator>) -> Self {
        self.file_name_generator = generator;
        self
    }

    /// Keeps the cache folder under `bytes`, evicting least recently used files.
    pub fn max_cache_size(mut self, bytes: u64) -> Self {
        self.max_cache_size = bytes;
        self.max_cache_files = None;
        self.disk_usage = None;
        self
    }

    pub fn max_cache_files_count(mut self, count: usize) -> Self {
        self.max_cache_files = Some(count);
        self.disk_usage = None;
        self
    }

    pub fn disk_usage(mut self, disk_usage: Arc<dyn DiskUsage>) -> Self {
        self.disk_usage = Some(disk_usage);
        self
    }

    pub fn source_info_storage(mut self, storage: Arc<dyn SourceInfoStorage>) -> Self {
        self.source_info_storage = Some(storage);
        self
    }

    pub fn header_injector(mut self, injector: Arc<dyn HeaderInjector>) -> Self {
        self.header_injector = injector;
        self
    }

    pub fn cipher(mut self, cipher: Arc<dyn Cipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// Fraction of the resource length a partial request may lead the cache
    /// by and still be served through it.
    pub fn no_cache_barrier(mut self, fraction: f64) -> Self {
        self.no_cache_barrier = fraction;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn ping(mut self, attempts: u32, initial_timeout: Duration) -> Self {
        self.ping_attempts = attempts;
        self.ping_timeout = initial_timeout;
        self
    }

    pub fn insecure_skip_verify(mut self, skip: bool) -> Self {
        self.insecure_skip_verify = skip;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sends origin requests through an http proxy with `CONNECT`.
    pub fn upstream_proxy(mut self, proxy: UpstreamProxy) -> Self {
        self.upstream_proxy = Some(proxy);
        self
    }

    pub fn access_logger(mut self, logger: Arc<AccessLogger>) -> Self {
        self.access_log = Some(logger);
        self
    }

    pub async fn build(self) -> anyhow::Result<HttpProxyCacheServer> {
        fs::create_dir_all(&self.cache_root)
            .with_context(|| format!("create cache dir {}", self.cache_root.display()))?;
        let disk_usage = match (self.disk_usage, self.max_cache_files) {
            (Some(disk_usage), _) => disk_usage,
            (None, Some(count)) => Arc::new(LruDiskUsage::total_count(count)) as Arc<dyn DiskUsage>,
            (None, None) => Arc::new(LruDiskUsage::total_size(self.max_cache_size)) as Arc<dyn DiskUsage>,
        };
        let config = Config {
            cache_root: self.cache_root,
            file_name_generator: self.file_name_generator,
            disk_usage,
            source_info_storage: self
                .source_info_storage
                .unwrap_or_else(|| Arc::new(MemorySourceInfoStorage::new())),
            header_injector: self.header_injector,
            cipher: self.cipher,
            client: OriginClient::with_proxy(
                self.insecure_skip_verify,
                self.connect_timeout,
                self.upstream_proxy.as_ref(),
            )?,
            no_cache_barrier: self.no_cache_barrier,
        };
        let settings = Settings {
            workers: self.workers,
            ping_attempts: self.ping_attempts,
            ping_timeout: self.ping_timeout,
            ping_client: OriginClient::new(false, self.connect_timeout)?,
            access_log: self.access_log,
        };
        HttpProxyCacheServer::start(config, settings).await
    }
}
