use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http::uri::{Authority, Uri};
use hyper_util::client::legacy::connect::proxy::Tunnel;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::proxy::matcher::Matcher;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tower_service::Service;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Outbound proxy for origin traffic.
#[derive(Debug, Clone, Default)]
pub struct UpstreamProxy {
    /// `http://[user:pass@]host:port` of a proxy accepting `CONNECT`.
    pub url: String,
    /// Comma separated hosts, domains or CIDRs reached directly.
    pub no_proxy: String,
}

impl UpstreamProxy {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            no_proxy: String::new(),
        }
    }

    pub fn no_proxy(mut self, hosts: impl Into<String>) -> Self {
        self.no_proxy = hosts.into();
        self
    }

    /// Validated matcher for this proxy.
    pub fn matcher(&self) -> anyhow::Result<Matcher> {
        let uri: Uri = self
            .url
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid upstream proxy {}: {err}", self.url))?;
        if uri.scheme_str().is_some_and(|scheme| scheme != "http") || uri.host().is_none() {
            return Err(anyhow::anyhow!("upstream proxy must be an http://host:port url, got {}", self.url));
        }
        Ok(Matcher::builder()
            .all(self.url.as_str())
            .no(self.no_proxy.as_str())
            .build())
    }
}

/// Connector that tunnels through an [`UpstreamProxy`] with `CONNECT` when
/// the matcher intercepts the destination, and dials directly otherwise.
#[derive(Clone)]
pub struct TunnelConnector {
    http: HttpConnector,
    matcher: Option<Arc<Matcher>>,
}

impl TunnelConnector {
    pub fn new(http: HttpConnector, matcher: Option<Matcher>) -> Self {
        Self {
            http,
            matcher: matcher.map(Arc::new),
        }
    }
}

impl Service<Uri> for TunnelConnector {
    type Response = TokioIo<TcpStream>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, BoxError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), BoxError>> {
        self.http.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let mut http = self.http.clone();
        let Some(intercept) = self.matcher.as_ref().and_then(|m| m.intercept(&dst)) else {
            return Box::pin(async move { http.call(dst).await.map_err(Into::into) });
        };

        log::debug!("connecting to {dst} through proxy {}", intercept.uri());
        let mut tunnel = Tunnel::new(intercept.uri().clone(), http);
        if let Some(auth) = intercept.basic_auth() {
            tunnel = tunnel.with_auth(auth.clone());
        }
        let dst = with_default_port(dst);
        Box::pin(async move {
            std::future::poll_fn(|cx| tunnel.poll_ready(cx)).await?;
            let conn = tunnel.call(dst).await?;
            Ok(conn)
        })
    }
}

/// `CONNECT` needs an explicit port, plain http urls usually omit it.
fn with_default_port(dst: Uri) -> Uri {
    if dst.port().is_some() {
        return dst;
    }
    let port = if dst.scheme_str() == Some("http") { 80 } else { 443 };
    let Some(host) = dst.host() else { return dst };
    let Ok(authority) = format!("{host}:{port}").parse::<Authority>() else {
        return dst;
    };
    let mut parts = dst.clone().into_parts();
    parts.authority = Some(authority);
    Uri::from_parts(parts).unwrap_or(dst)
}
