pub const PROXY_HOST: &str = "127.0.0.1";
pub const PING_REQUEST: &str = "ping";
pub const PING_RESPONSE: &str = "ping ok";

pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;
pub const MAX_REDIRECTS: usize = 5;
pub const MAX_READ_SOURCE_ATTEMPTS: usize = 1;
pub const MAX_REQUEST_HEADER_BYTES: usize = 16 * 1024;

pub const TEMP_POSTFIX: &str = ".download";
pub const DEFAULT_MAX_CACHE_SIZE: u64 = 512 * 1024 * 1024;
pub const DEFAULT_NO_CACHE_BARRIER: f64 = 0.2;
pub const DEFAULT_WORKERS: usize = 8;
pub const DEFAULT_PING_ATTEMPTS: u32 = 3;
pub const DEFAULT_PING_TIMEOUT_MS: u64 = 300;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
