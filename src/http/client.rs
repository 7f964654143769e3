//! The shared, pooled upstream HTTP client (spec.md §5 "Upstream HTTP
//! client").
//!
//! TLS verification is intentionally disabled — this proxy's job is to
//! decrypt and observe traffic, not to assert the origin's identity; the
//! open question in spec.md §9 asks that this be documented prominently,
//! so: **this client trusts any certificate presented by any origin.**

use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};

use crate::error::ProxyError;

const POOL_MAX_IDLE_PER_HOST: usize = 100;
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(30);
const OVERALL_REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

type Connector = hyper_rustls::HttpsConnector<HttpConnector>;

/// Accepts any certificate. Signature verification still runs (so a
/// genuinely garbled handshake still fails), only the chain-of-trust check
/// is skipped.
#[derive(Debug)]
struct NoVerify(Arc<rustls::crypto::CryptoProvider>);

impl ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// One process-wide instance, shared behind an `Arc` (spec.md §5 "one
/// process-wide instance with a connection pool").
///
/// Caps actually enforceable through `hyper-util`'s legacy client: per-host
/// idle-connection cap and idle timeout. The spec's total-idle and
/// total-per-host caps aren't exposed knobs in this client — there is no
/// equivalent setting upstream, so they're not applied; response-header and
/// overall-request timeouts are applied by wrapping each call with
/// `tokio::time::timeout` instead of a connector-level setting.
pub struct UpstreamClient {
    inner: Client<Connector, Full<Bytes>>,
}

impl UpstreamClient {
    pub fn new() -> Result<Self, ProxyError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let tls_config = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| ProxyError::ConfigInvalid(format!("building TLS client config: {e}")))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerify(provider)))
            .with_no_client_auth();

        let connector = HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .build();

        let inner = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .build(connector);

        Ok(Self { inner })
    }

    /// Sends `request` and returns the response with its body still lazy
    /// (spec.md §4.4.3 step 3 "Read the response body lazily").
    pub async fn send(&self, request: Request<Full<Bytes>>) -> Result<Response<Incoming>, ProxyError> {
        let header_deadline = tokio::time::timeout(RESPONSE_HEADER_TIMEOUT, self.inner.request(request));
        match tokio::time::timeout(OVERALL_REQUEST_TIMEOUT, header_deadline).await {
            Ok(Ok(Ok(response))) => Ok(response),
            Ok(Ok(Err(e))) => Err(ProxyError::UpstreamFailed(e.to_string())),
            Ok(Err(_)) => Err(ProxyError::UpstreamFailed("timed out waiting for response headers".to_string())),
            Err(_) => Err(ProxyError::UpstreamFailed("overall request deadline exceeded".to_string())),
        }
    }
}

/// Drains a response body to bytes; used when a hook needs the whole body
/// in memory to inspect or rewrite it (spec.md §4.6 "response-interceptor
/// pipeline").
pub async fn collect_body(body: Incoming) -> Result<Bytes, ProxyError> {
    body.collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| ProxyError::UpstreamFailed(e.to_string()))
}

pub fn empty_body() -> Full<Bytes> {
    Full::new(Bytes::new())
}
