//! WebSocket relay (spec.md §4.5): dials upstream, performs the server-side
//! handshake over the already-buffered client connection, then relays
//! frames in both directions through the plugin hook pipeline.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use http::{HeaderMap, Request};
use http_body_util::Full;
use tokio_tungstenite::tungstenite::handshake::server::create_response;
use tokio_tungstenite::tungstenite::protocol::{Message, Role};
use tokio_tungstenite::tungstenite::{ClientRequestBuilder, Error as WsError};
use tokio_tungstenite::WebSocketStream;
use tracing::warn;

use crate::connection::Connection;
use crate::error::ProxyError;
use crate::plugin::context::{Direction, InterceptContext};
use crate::plugin::executor;
use crate::service::Services;

const FRAME_DEADLINE: Duration = Duration::from_secs(30);

const SKIPPED_REQUEST_HEADERS: &[&str] = &[
    "sec-websocket-extensions",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-protocol",
    "host",
    "connection",
    "upgrade",
];

const WS_DIAL_FAILED_WIRE: &[u8] =
    b"HTTP/1.1 502 Bad Gateway\r\nContent-Type: text/plain\r\nContent-Length: 28\r\n\r\nWebSocket connection failed";

/// Proxies one upgraded connection end to end. Consumes `conn`: a websocket
/// session is terminal, there is no request loop to return to afterward.
pub async fn proxy(
    mut conn: Connection,
    request: Request<Full<Bytes>>,
    is_https: bool,
    services: &Services,
    connection_id: &str,
) -> Result<(), ProxyError> {
    let upstream_request = match build_upstream_request(&request, is_https) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "could not build upstream websocket request");
            return write_dial_failed(&mut conn).await;
        }
    };

    let (upstream_ws, _upstream_response) = match tokio_tungstenite::connect_async(upstream_request).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!(error = %e, "upstream websocket dial failed");
            return write_dial_failed(&mut conn).await;
        }
    };

    let handshake_response = create_response(&request)
        .map_err(|e| ProxyError::MalformedRequest(format!("building websocket handshake response: {e}")))?;
    write_handshake_response(&mut conn, &handshake_response).await?;

    let transport = conn.into_prefixed_io();
    let client_ws = WebSocketStream::from_raw_socket(transport, Role::Server, None).await;

    let (client_write, client_read) = client_ws.split();
    let (upstream_write, upstream_read) = upstream_ws.split();

    tokio::join!(
        relay_direction(client_read, upstream_write, Direction::ClientToServer, services, connection_id),
        relay_direction(upstream_read, client_write, Direction::ServerToClient, services, connection_id),
    );

    Ok(())
}

/// One direction of the relay (spec.md §4.5 step 5): read a frame under a
/// deadline, run it through the matching interceptor phase if it carries
/// data, then write it to the opposite side under its own deadline.
async fn relay_direction<S, D>(
    mut source: S,
    mut sink: D,
    direction: Direction,
    services: &Services,
    connection_id: &str,
) where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
    D: Sink<Message, Error = WsError> + Unpin,
{
    loop {
        let message = match tokio::time::timeout(FRAME_DEADLINE, source.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => {
                warn!(error = %e, "websocket frame read failed");
                return;
            }
            Ok(None) => return,
            Err(_) => {
                warn!("websocket frame read timed out");
                return;
            }
        };

        let is_close = matches!(message, Message::Close(_));

        let outgoing = match data_payload(&message) {
            Some(data) => {
                let mut ctx = InterceptContext::for_ws_message(connection_id.to_string(), direction, data);
                let verdict = executor::run_ws_hooks(services.plugins.as_ref(), &mut ctx).await;
                if !verdict.r#continue {
                    continue;
                }
                if verdict.modified {
                    rebuild_message(&message, ctx.body)
                } else {
                    message
                }
            }
            None => message,
        };

        match tokio::time::timeout(FRAME_DEADLINE, sink.send(outgoing)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(error = %e, "websocket frame write failed");
                return;
            }
            Err(_) => {
                warn!("websocket frame write timed out");
                return;
            }
        }

        if is_close {
            return;
        }
    }
}

fn data_payload(message: &Message) -> Option<Bytes> {
    match message {
        Message::Binary(data) => Some(Bytes::from(data.clone())),
        Message::Text(text) => Some(Bytes::copy_from_slice(text.as_bytes())),
        _ => None,
    }
}

fn rebuild_message(original: &Message, data: Bytes) -> Message {
    match original {
        Message::Text(_) => Message::Text(String::from_utf8_lossy(&data).into_owned()),
        _ => Message::Binary(data.to_vec()),
    }
}

/// Builds the upstream dial target (spec.md §4.5 steps 1-2): `wss`/`ws`
/// scheme mirroring the client connection, the sub-protocol forwarded
/// explicitly, and every other header copied except the ones the
/// tungstenite handshake generates itself.
fn build_upstream_request(request: &Request<Full<Bytes>>, is_https: bool) -> Result<ClientRequestBuilder, ProxyError> {
    let scheme = if is_https { "wss" } else { "ws" };
    let host = request
        .headers()
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ProxyError::MalformedRequest("websocket upgrade missing Host header".to_string()))?;
    let path = request.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let base = format!("{scheme}://{host}");
    let url = url::Url::options()
        .base_url(Some(&base.parse().map_err(|e| ProxyError::MalformedRequest(format!("websocket upgrade host: {e}")))?))
        .parse(path)
        .map_err(|e| ProxyError::MalformedRequest(format!("building upstream websocket url: {e}")))?;
    let uri: http::Uri = url
        .as_str()
        .parse()
        .map_err(|e| ProxyError::MalformedRequest(format!("building upstream websocket url: {e}")))?;

    let mut builder = ClientRequestBuilder::new(uri);

    if let Some(protocol) = request.headers().get(http::header::SEC_WEBSOCKET_PROTOCOL).and_then(|v| v.to_str().ok()) {
        builder = builder.with_sub_protocol(protocol);
    }

    for (name, value) in skip_managed_headers(request.headers()) {
        builder = builder.with_header(name, value);
    }

    Ok(builder)
}

fn skip_managed_headers(headers: &HeaderMap) -> impl Iterator<Item = (String, String)> + '_ {
    headers.iter().filter_map(|(name, value)| {
        let lower = name.as_str().to_ascii_lowercase();
        if SKIPPED_REQUEST_HEADERS.contains(&lower.as_str()) {
            return None;
        }
        value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string()))
    })
}

async fn write_handshake_response(conn: &mut Connection, response: &http::Response<()>) -> Result<(), ProxyError> {
    let mut out = String::new();
    out.push_str(&format!(
        "{:?} {} {}\r\n",
        response.version(),
        response.status().as_u16(),
        response.status().canonical_reason().unwrap_or("")
    ));
    for (name, value) in response.headers() {
        out.push_str(name.as_str());
        out.push_str(": ");
        out.push_str(value.to_str().unwrap_or(""));
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    conn.write_all(out.as_bytes()).await?;
    conn.flush().await
}

async fn write_dial_failed(conn: &mut Connection) -> Result<(), ProxyError> {
    conn.write_all(WS_DIAL_FAILED_WIRE).await?;
    conn.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::service::Services;

    #[test]
    fn data_payload_only_extracts_text_and_binary_frames() {
        assert_eq!(data_payload(&Message::Text("hi".to_string())), Some(Bytes::from_static(b"hi")));
        assert_eq!(data_payload(&Message::Binary(vec![1, 2, 3])), Some(Bytes::from_static(&[1, 2, 3])));
        assert_eq!(data_payload(&Message::Ping(Vec::new())), None);
        assert_eq!(data_payload(&Message::Close(None)), None);
    }

    #[test]
    fn rebuild_message_keeps_the_original_frame_kind() {
        let text = rebuild_message(&Message::Text("old".to_string()), Bytes::from_static(b"new"));
        assert_eq!(text, Message::Text("new".to_string()));

        let binary = rebuild_message(&Message::Binary(Vec::new()), Bytes::from_static(b"new"));
        assert_eq!(binary, Message::Binary(b"new".to_vec()));
    }

    fn tempdir() -> std::path::PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("sniffy-ws-test-{}", uuid::Uuid::new_v4()));
        dir
    }

    /// spec.md property P8: two messages sent in opposite directions are
    /// both delivered to the opposite endpoint, driven over two in-memory
    /// duplex pairs standing in for the client and upstream connections.
    #[tokio::test]
    async fn relay_is_bidirectional_and_preserves_per_direction_order() {
        let (client_near, client_far) = tokio::io::duplex(4096);
        let (upstream_near, upstream_far) = tokio::io::duplex(4096);

        let mut client_driver = WebSocketStream::from_raw_socket(client_near, Role::Client, None).await;
        let proxy_client_side = WebSocketStream::from_raw_socket(client_far, Role::Server, None).await;
        let proxy_upstream_side = WebSocketStream::from_raw_socket(upstream_far, Role::Client, None).await;
        let mut upstream_driver = WebSocketStream::from_raw_socket(upstream_near, Role::Server, None).await;

        let (client_write, client_read) = proxy_client_side.split();
        let (upstream_write, upstream_read) = proxy_upstream_side.split();

        let mut config = Config::default();
        config.ca_store_dir = tempdir().to_str().unwrap().to_string();
        let services = Services::bootstrap(config).await.unwrap();

        let relay = async {
            tokio::join!(
                relay_direction(client_read, upstream_write, Direction::ClientToServer, &services, "conn-p8"),
                relay_direction(upstream_read, client_write, Direction::ServerToClient, &services, "conn-p8"),
            );
        };

        let drive = async {
            client_driver.send(Message::Text("A".to_string())).await.unwrap();
            upstream_driver.send(Message::Text("B".to_string())).await.unwrap();

            let seen_at_upstream = upstream_driver.next().await.unwrap().unwrap();
            let seen_at_client = client_driver.next().await.unwrap().unwrap();

            client_driver.close(None).await.ok();
            upstream_driver.close(None).await.ok();

            (seen_at_upstream, seen_at_client)
        };

        let (_, (seen_at_upstream, seen_at_client)) = tokio::join!(relay, drive);

        assert_eq!(seen_at_upstream, Message::Text("A".to_string()));
        assert_eq!(seen_at_client, Message::Text("B".to_string()));

        std::fs::remove_dir_all(&services.config.ca_store_dir).ok();
    }
}
