use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use http::header::USER_AGENT;
use http::{Method, Request, Response, Uri};
use http_body_util::Empty;
use hyper::body::Incoming;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use crate::error::{ProxyCacheError, Result};
use crate::runtime;
use crate::source::{TunnelConnector, UpstreamProxy};

/// Shared HTTP(S) client for talking to origin servers.
#[derive(Clone)]
pub struct OriginClient {
    client: Client<HttpsConnector<TunnelConnector>, Empty<Bytes>>,
    timeout: Duration,
}

impl OriginClient {
    /// Client dialing origins directly.
    pub fn new(insecure_skip_verify: bool, timeout: Duration) -> anyhow::Result<Self> {
        Self::with_proxy(insecure_skip_verify, timeout, None)
    }

    /// Client sending origin traffic through `proxy` unless its no-proxy
    /// list says otherwise.
    pub fn with_proxy(
        insecure_skip_verify: bool,
        timeout: Duration,
        proxy: Option<&UpstreamProxy>,
    ) -> anyhow::Result<Self> {
        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.set_connect_timeout(Some(timeout));
        // https urls are handed to the inner connector by the tls layer
        http.enforce_http(false);
        let matcher = proxy.map(|p| p.matcher()).transpose()?;
        let connector = TunnelConnector::new(http, matcher);

        let https = if insecure_skip_verify {
            HttpsConnectorBuilder::new()
                .with_tls_config(insecure_tls_config()?)
                .https_or_http()
                .enable_http1()
                .wrap_connector(connector)
        } else {
            HttpsConnectorBuilder::new()
                .with_native_roots()
                .context("load native tls roots")?
                .https_or_http()
                .enable_http1()
                .wrap_connector(connector)
        };
        let client = Client::builder(TokioExecutor::new()).build(https);
        Ok(Self { client, timeout })
    }

    /// Sends a body-less request and waits for the response head, giving up
    /// after the configured timeout.
    pub async fn send(&self, method: Method, url: &str, headers: &[(String, String)]) -> Result<Response<Incoming>> {
        let uri: Uri = url
            .parse()
            .map_err(|err| ProxyCacheError::upstream(url, format!("invalid url: {err}")))?;
        let mut req = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if !headers.iter().any(|(name, _)| name.eq_ignore_ascii_case("user-agent")) {
            req = req.header(USER_AGENT, runtime::user_agent());
        }
        let req = req
            .body(Empty::new())
            .map_err(|err| ProxyCacheError::upstream(url, format!("build request: {err}")))?;

        match tokio::time::timeout(self.timeout, self.client.request(req)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => Err(ProxyCacheError::upstream(url, err.to_string())),
            Err(_) => Err(ProxyCacheError::upstream(url, format!("no response within {:?}", self.timeout))),
        }
    }
}

fn insecure_tls_config() -> anyhow::Result<rustls::ClientConfig> {
    let provider = rustls::crypto::ring::default_provider();
    let config = rustls::ClientConfig::builder_with_provider(provider.into())
        .with_safe_default_protocol_versions()
        .context("tls versions")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
        .with_no_client_auth();
    Ok(config)
}

#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
