use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use http::header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, LOCATION, RANGE};
use http::{HeaderMap, Method, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use url::Url;

use crate::constants::MAX_REDIRECTS;
use crate::error::{ProxyCacheError, Result};
use crate::metrics;
use crate::source::{HeaderInjector, OriginClient, Source, SourceInfo, SourceInfoStorage, SourceStream};

/// [`Source`] over an http(s) url.
///
/// Redirects are followed by hand so the limit is enforced and the `Range`
/// header survives every hop. Whatever is learned about length and mime is
/// written back to the info storage.
pub struct HttpUrlSource {
    url: String,
    client: OriginClient,
    info_storage: Arc<dyn SourceInfoStorage>,
    headers: Arc<dyn HeaderInjector>,
    info: Mutex<SourceInfo>,
}

impl HttpUrlSource {
    pub fn new(
        url: &str,
        client: OriginClient,
        info_storage: Arc<dyn SourceInfoStorage>,
        headers: Arc<dyn HeaderInjector>,
    ) -> Self {
        let info = info_storage.get(url).unwrap_or_else(|| SourceInfo::new(url));
        Self {
            url: url.to_string(),
            client,
            info_storage,
            headers,
            info: Mutex::new(info),
        }
    }

    pub fn info(&self) -> SourceInfo {
        self.info.lock().expect("source info").clone()
    }

    fn learn(&self, length: Option<u64>, mime: Option<String>) {
        let snapshot = {
            let mut info = self.info.lock().expect("source info");
            if length.is_some() {
                info.length = length;
            }
            if mime.is_some() {
                info.mime = mime;
            }
            info.clone()
        };
        self.info_storage.put(&self.url, &snapshot);
    }

    async fn request(&self, method: Method, offset: u64) -> Result<Response<Incoming>> {
        let mut url = self.url.clone();
        let mut redirects = 0;
        loop {
            let mut headers = self.headers.add_headers(&url);
            if offset > 0 {
                headers.push((RANGE.to_string(), format!("bytes={offset}-")));
            }
            let response = self.client.send(method.clone(), &url, &headers).await?;
            if !is_redirect(response.status()) {
                return Ok(response);
            }
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| ProxyCacheError::upstream(&url, "redirect without location"))?;
            url = resolve(&url, location)?;
            redirects += 1;
            if redirects > MAX_REDIRECTS {
                return Err(ProxyCacheError::TooManyRedirects {
                    url: self.url.clone(),
                    count: redirects,
                });
            }
        }
    }
}

#[async_trait]
impl Source for HttpUrlSource {
    fn url(&self) -> &str {
        &self.url
    }

    async fn length(&self) -> Option<u64> {
        if let Some(length) = self.known_length() {
            return Some(length);
        }
        let url = &self.url;
        let response = match self.request(Method::HEAD, 0).await {
            Ok(response) => response,
            Err(err) => {
                log::warn!("error fetching info from {url}: {err}");
                return None;
            }
        };
        if !response.status().is_success() {
            log::warn!("error fetching info from {url}: status {}", response.status());
            return None;
        }
        let length = header_u64(response.headers(), CONTENT_LENGTH);
        self.learn(length, content_type(response.headers()));
        log::debug!("source info of {url}: length={length:?}");
        length
    }

    fn known_length(&self) -> Option<u64> {
        self.info.lock().expect("source info").length
    }

    fn mime(&self) -> Option<String> {
        self.info.lock().expect("source info").mime.clone()
    }

    async fn open(&self, offset: u64) -> Result<Box<dyn SourceStream>> {
        let response = self.request(Method::GET, offset).await?;
        let url = self.url.clone();
        let status = response.status();
        if !status.is_success() {
            return Err(ProxyCacheError::upstream(&url, format!("unexpected status {status}")));
        }

        let headers = response.headers();
        let content_length = header_u64(headers, CONTENT_LENGTH);
        let length = match status {
            StatusCode::PARTIAL_CONTENT => total_from_content_range(headers).or(content_length.map(|l| l + offset)),
            StatusCode::OK => content_length,
            _ => None,
        };
        self.learn(length, content_type(headers));

        // origin ignored the Range header, drop what precedes the offset
        let skip = if offset > 0 && status == StatusCode::OK { offset } else { 0 };
        Ok(Box::new(HttpStream {
            url,
            body: response.into_body(),
            pending: Bytes::new(),
            skip,
        }))
    }

    fn fresh(&self) -> Arc<dyn Source> {
        Arc::new(Self {
            url: self.url.clone(),
            client: self.client.clone(),
            info_storage: self.info_storage.clone(),
            headers: self.headers.clone(),
            info: Mutex::new(self.info()),
        })
    }
}

struct HttpStream {
    url: String,
    body: Incoming,
    pending: Bytes,
    skip: u64,
}

#[async_trait]
impl SourceStream for HttpStream {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            if !self.pending.is_empty() {
                let n = self.pending.len().min(buf.len());
                buf[..n].copy_from_slice(&self.pending[..n]);
                self.pending.advance(n);
                return Ok(n);
            }
            let frame = match self.body.frame().await {
                None => return Ok(0),
                Some(Ok(frame)) => frame,
                Some(Err(err)) => return Err(ProxyCacheError::upstream(&self.url, err.to_string())),
            };
            let Ok(mut data) = frame.into_data() else { continue };
            metrics::record_origin_bytes(data.len());
            if self.skip > 0 {
                let dropped = self.skip.min(data.len() as u64);
                data.advance(dropped as usize);
                self.skip -= dropped;
            }
            self.pending = data;
        }
    }
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

fn resolve(base: &str, location: &str) -> Result<String> {
    let base = Url::parse(base).map_err(|err| ProxyCacheError::upstream(base, format!("invalid url: {err}")))?;
    let next = base
        .join(location)
        .map_err(|err| ProxyCacheError::upstream(base.as_str(), format!("invalid redirect {location}: {err}")))?;
    Ok(next.into())
}

fn header_u64(headers: &HeaderMap, name: http::header::HeaderName) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

fn content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

/// Total size from `Content-Range: bytes a-b/total`.
fn total_from_content_range(headers: &HeaderMap) -> Option<u64> {
    let raw = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    raw.rsplit('/').next()?.trim().parse().ok()
}
