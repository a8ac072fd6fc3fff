use crate::error::{ProxyCacheError, Result};

/// Request received on the local socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetRequest {
    /// Path without the leading slash, still percent-encoded.
    pub uri: String,
    pub range_offset: u64,
    pub partial: bool,
}

impl GetRequest {
    /// Parses a request head: `GET /<path> HTTP/1.x` followed by header lines.
    /// Only `Range: bytes=N-` is looked at, N > 0 makes the request partial.
    pub fn parse(head: &str) -> Result<Self> {
        let mut lines = head.lines();
        let request_line = lines.next().unwrap_or_default().trim();
        let uri = parse_request_line(request_line)
            .ok_or_else(|| ProxyCacheError::InvalidRequest(format!("bad request line {request_line:?}")))?;

        let range_offset = lines
            .take_while(|line| !line.trim().is_empty())
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("range"))
            .and_then(|(_, value)| parse_range_offset(value))
            .unwrap_or(0);

        Ok(Self {
            uri: uri.to_string(),
            range_offset,
            partial: range_offset > 0,
        })
    }
}

fn parse_request_line(line: &str) -> Option<&str> {
    let mut parts = line.split_whitespace();
    let method = parts.next()?;
    let path = parts.next()?;
    let version = parts.next()?;
    if method != "GET" || !matches!(version, "HTTP/1.1" | "HTTP/1.0") || parts.next().is_some() {
        return None;
    }
    path.strip_prefix('/')
}

/// `bytes=N-` or `bytes=N-M`; the end is ignored.
fn parse_range_offset(value: &str) -> Option<u64> {
    let spec = value.trim().strip_prefix("bytes=")?;
    let (start, _) = spec.split_once('-')?;
    start.trim().parse().ok()
}

pub fn build_content_range(start: u64, end: u64, size: u64) -> String {
    format!("bytes {}-{}/{}", start, end, size)
}

/// Status line and headers of a proxied response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub partial: bool,
    pub offset: u64,
    pub length: Option<u64>,
    pub mime: Option<String>,
}

impl ResponseHead {
    pub fn status(&self) -> u16 {
        if self.partial {
            206
        } else {
            200
        }
    }

    pub fn encode(&self) -> String {
        let mut head = String::with_capacity(192);
        head.push_str(if self.partial {
            "HTTP/1.1 206 PARTIAL CONTENT\r\n"
        } else {
            "HTTP/1.1 200 OK\r\n"
        });
        head.push_str("Accept-Ranges: bytes\r\n");
        if let Some(length) = self.length {
            let content_length = if self.partial {
                length.saturating_sub(self.offset)
            } else {
                length
            };
            head.push_str(&format!("Content-Length: {content_length}\r\n"));
            if self.partial {
                let range = build_content_range(self.offset, length.saturating_sub(1), length);
                head.push_str(&format!("Content-Range: {range}\r\n"));
            }
        }
        if let Some(mime) = self.mime.as_deref().filter(|m| !m.is_empty()) {
            head.push_str(&format!("Content-Type: {mime}\r\n"));
        }
        head.push_str("\r\n");
        head
    }
}
