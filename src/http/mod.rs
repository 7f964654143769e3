//! The HTTP/HTTPS MITM processor (spec.md §4.4): request loop, CONNECT/TLS
//! forging, and forwarding through the shared upstream client.

pub mod client;
pub mod message;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::uri::{Authority, Scheme};
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use tracing::warn;

use crate::ca;
use crate::connection::Connection;
use crate::error::ProxyError;
use crate::plugin::context::InterceptContext;
use crate::plugin::executor;
use crate::protocol::{self, Processor};
use crate::service::Services;

const TLS_HANDSHAKE_DEADLINE: Duration = Duration::from_secs(30);
const TLS_OVERALL_DEADLINE: Duration = Duration::from_secs(300);
const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const BAD_GATEWAY_WIRE: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 15\r\n\r\n502 Bad Gateway";

pub struct HttpProcessor;

#[async_trait]
impl Processor for HttpProcessor {
    fn name(&self) -> &'static str {
        protocol::HTTP
    }

    async fn process(&self, conn: Connection, services: Arc<Services>) -> Result<(), ProxyError> {
        let connection_id = conn.connection_id.clone();
        request_loop(conn, &services, &connection_id).await
    }
}

enum TlsForgeOutcome {
    Upgraded,
    Plaintext(Request<Full<Bytes>>),
}

/// Parses and dispatches requests until the peer closes the connection
/// (spec.md §4.4.1). A `CONNECT` that successfully forges TLS re-enters this
/// same loop over the now-decrypted stream rather than recursing, since the
/// underlying `Connection` is swapped in place.
async fn request_loop(mut conn: Connection, services: &Services, connection_id: &str) -> Result<(), ProxyError> {
    let mut is_https = false;
    loop {
        if conn.fill_buf().await?.is_empty() {
            return Ok(());
        }

        let request = message::read_request(&mut conn).await?;

        if request.method() == Method::CONNECT {
            is_https = true;
            match forge_tls(&mut conn, &request, services).await? {
                TlsForgeOutcome::Upgraded => continue,
                TlsForgeOutcome::Plaintext(plain_request) => {
                    is_https = false;
                    if is_websocket_upgrade(plain_request.headers()) {
                        return crate::ws::proxy(conn, plain_request, is_https, services, connection_id).await;
                    }
                    forward(&mut conn, plain_request, is_https, services, connection_id).await?;
                    continue;
                }
            }
        }

        if is_websocket_upgrade(request.headers()) {
            return crate::ws::proxy(conn, request, is_https, services, connection_id).await;
        }

        forward(&mut conn, request, is_https, services, connection_id).await?;
    }
}

fn is_websocket_upgrade(headers: &http::HeaderMap) -> bool {
    let upgraded = headers
        .get(http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let connection_upgrade = headers
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    upgraded && connection_upgrade
}

/// Runs spec.md §4.4.2: answer the tunnel, peek the client's next byte, and
/// either forge a TLS leaf and perform the handshake, or discover the
/// client is speaking plaintext over the tunnel and hand the already-parsed
/// request back to the caller.
async fn forge_tls(
    conn: &mut Connection,
    connect_request: &Request<Full<Bytes>>,
    services: &Services,
) -> Result<TlsForgeOutcome, ProxyError> {
    conn.write_all(CONNECT_ESTABLISHED).await?;
    conn.flush().await?;

    let first_byte = conn.fill_buf().await?.first().copied();
    match first_byte {
        Some(b'G') | Some(b'P') => {
            let request = message::read_request(conn).await?;
            return Ok(TlsForgeOutcome::Plaintext(request));
        }
        Some(0x16) => {}
        other => {
            warn!(?other, "unrecognized byte after CONNECT, attempting TLS handshake anyway");
        }
    }

    let host = connect_request
        .uri()
        .host()
        .ok_or_else(|| ProxyError::MalformedRequest("CONNECT target missing host".to_string()))?;

    let leaf = services.ca.issue(host).await?;
    let server_config = ca::server_config_for_leaf(&leaf)?;
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));

    tokio::time::timeout(TLS_HANDSHAKE_DEADLINE, conn.upgrade_server_tls(&acceptor))
        .await
        .map_err(|_| ProxyError::TlsHandshakeFailed("handshake deadline exceeded".to_string()))??;

    conn.set_deadline(tokio::time::Instant::now() + TLS_OVERALL_DEADLINE);

    Ok(TlsForgeOutcome::Upgraded)
}

/// Runs spec.md §4.4.3: patch the request URL, run the request-interceptor
/// pipeline, send it through the shared upstream client, run the
/// response-interceptor pipeline, and write the result back.
async fn forward(
    conn: &mut Connection,
    mut request: Request<Full<Bytes>>,
    is_https: bool,
    services: &Services,
    connection_id: &str,
) -> Result<(), ProxyError> {
    patch_request_url(&mut request, is_https)?;

    let (parts, body) = request.into_parts();
    let body_bytes = body.collect().await.expect("Full<Bytes> never errors").to_bytes();
    let bytes_request = Request::from_parts(parts, body_bytes);

    let mut ctx = InterceptContext::for_request(connection_id.to_string(), bytes_request);
    let verdict = executor::run_request_hooks(&services.plugins, &mut ctx).await;

    if !verdict.r#continue {
        let message = verdict.message.unwrap_or_else(|| "blocked by plugin".to_string());
        return write_blocked(conn, &message).await;
    }

    let request = ctx
        .request
        .take()
        .expect("request hooks always carry a request")
        .map(Full::new);
    let request_uri = request.uri().to_string();

    let response = match services.upstream.send(request).await {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "upstream request failed");
            return write_bad_gateway(conn).await;
        }
    };

    let (parts, incoming) = response.into_parts();
    let body_bytes = client::collect_body(incoming).await?;
    let response = Response::from_parts(parts, body_bytes);

    let mut ctx = InterceptContext::for_response(connection_id.to_string(), response, request_uri);
    let verdict = executor::run_response_hooks(&services.plugins, &mut ctx).await;

    if !verdict.r#continue {
        return Ok(());
    }

    let response = ctx.response.take().expect("response hooks always carry a response");
    message::write_response(conn, &response).await
}

/// Fills in scheme/authority the server-side request form leaves empty
/// (spec.md §4.4.3 step 1). The path and query are left untouched — unlike
/// Go's `net/http`, `http::Request` has no separate "RequestURI" field to
/// clear alongside the URL.
fn patch_request_url(request: &mut Request<Full<Bytes>>, is_https: bool) -> Result<(), ProxyError> {
    let mut parts = request.uri().clone().into_parts();

    if parts.scheme.is_none() {
        parts.scheme = Some(if is_https { Scheme::HTTPS } else { Scheme::HTTP });
    }

    if parts.authority.is_none() {
        let host = request
            .headers()
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ProxyError::MalformedRequest("request has no Host header and no absolute URI".to_string()))?;
        parts.authority = Some(Authority::from_str(host).map_err(|e| ProxyError::MalformedRequest(e.to_string()))?);
    }

    *request.uri_mut() = http::Uri::from_parts(parts).map_err(|e| ProxyError::MalformedRequest(e.to_string()))?;
    Ok(())
}

async fn write_bad_gateway(conn: &mut Connection) -> Result<(), ProxyError> {
    conn.write_all(BAD_GATEWAY_WIRE).await?;
    conn.flush().await
}

async fn write_blocked(conn: &mut Connection, message: &str) -> Result<(), ProxyError> {
    let body = Bytes::copy_from_slice(message.as_bytes());
    let response = Response::builder()
        .status(StatusCode::FORBIDDEN)
        .header(http::header::CONTENT_LENGTH, body.len())
        .body(body)
        .expect("well-formed response");
    message::write_response(conn, &response).await
}
