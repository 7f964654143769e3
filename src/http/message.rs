//! HTTP/1.1 request/response parsing over a `Connection` (spec.md §4.4.1
//! step 1, §4.4.3). Supports `Content-Length` and chunked transfer-encoding
//! bodies — chunked decoding is a supplemental feature beyond the
//! distilled spec, needed for any non-trivial origin response.

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode, Version};
use http_body_util::Full;

use crate::connection::Connection;
use crate::error::ProxyError;

const MAX_HEADER_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 128;

/// Reads one full HTTP/1.1 request (headers + body) from `conn`. Leftover
/// bytes read past the body boundary (from a pipelined next request
/// arriving in the same read) are handed back via `conn.unread`.
pub async fn read_request(conn: &mut Connection) -> Result<Request<Full<Bytes>>, ProxyError> {
    let (method, uri, version, headers, body_start, header_bytes) = read_head(conn).await?;

    let body = read_body(conn, &headers, &header_bytes[body_start..]).await?;

    let mut builder = Request::builder().method(method).uri(uri).version(version);
    for (name, value) in headers.iter() {
        builder = builder.header(name, value);
    }
    builder
        .body(Full::new(body))
        .map_err(|e| ProxyError::MalformedRequest(e.to_string()))
}

/// Reads one HTTP/1.1 response (status line + headers + body).
pub async fn read_response(conn: &mut Connection) -> Result<Response<Bytes>, ProxyError> {
    let (status, version, headers, body_start, header_bytes) = read_status_line(conn).await?;
    let body = read_body(conn, &headers, &header_bytes[body_start..]).await?;

    let mut builder = Response::builder().status(status).version(version);
    for (name, value) in headers.iter() {
        builder = builder.header(name, value);
    }
    builder.body(body).map_err(|e| ProxyError::MalformedRequest(e.to_string()))
}

/// Writes a response back to the client, either with an explicit
/// `Content-Length` (the common case — the body is already fully buffered)
/// or, if the caller already set `Transfer-Encoding: chunked`, as a single
/// chunk followed by the terminating zero-length chunk.
pub async fn write_response(conn: &mut Connection, response: &Response<Bytes>) -> Result<(), ProxyError> {
    let mut out = BytesMut::new();
    let status = response.status();
    out.extend_from_slice(format!("{:?} {} {}\r\n", response.version(), status.as_u16(), status.canonical_reason().unwrap_or("")).as_bytes());

    let chunked = is_chunked(response.headers());
    for (name, value) in response.headers().iter() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    if !response.headers().contains_key(http::header::DATE) {
        out.extend_from_slice(b"date: ");
        out.extend_from_slice(httpdate::fmt_http_date(std::time::SystemTime::now()).as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");

    conn.write_all(&out).await?;
    if chunked {
        let size_line = format!("{:x}\r\n", response.body().len());
        conn.write_all(size_line.as_bytes()).await?;
        conn.write_all(response.body()).await?;
        conn.write_all(b"\r\n0\r\n\r\n").await?;
    } else {
        conn.write_all(response.body()).await?;
    }
    conn.flush().await
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get(http::header::TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
}

async fn read_head(conn: &mut Connection) -> Result<(Method, http::Uri, Version, HeaderMap, usize, Vec<u8>), ProxyError> {
    let mut accumulated = Vec::new();
    loop {
        let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut raw_headers);
        match parsed.parse(&accumulated).map_err(|e| ProxyError::MalformedRequest(e.to_string()))? {
            httparse::Status::Complete(consumed) => {
                let method = parsed
                    .method
                    .ok_or_else(|| ProxyError::MalformedRequest("missing method".to_string()))?
                    .parse::<Method>()
                    .map_err(|e| ProxyError::MalformedRequest(e.to_string()))?;
                let uri = parsed
                    .path
                    .ok_or_else(|| ProxyError::MalformedRequest("missing request target".to_string()))?
                    .parse::<http::Uri>()
                    .map_err(|e| ProxyError::MalformedRequest(e.to_string()))?;
                let version = if parsed.version == Some(1) { Version::HTTP_11 } else { Version::HTTP_10 };
                let headers = to_header_map(parsed.headers)?;
                return Ok((method, uri, version, headers, consumed, accumulated));
            }
            httparse::Status::Partial => {
                grow_or_fail(conn, &mut accumulated).await?;
            }
        }
    }
}

async fn read_status_line(conn: &mut Connection) -> Result<(StatusCode, Version, HeaderMap, usize, Vec<u8>), ProxyError> {
    let mut accumulated = Vec::new();
    loop {
        let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Response::new(&mut raw_headers);
        match parsed.parse(&accumulated).map_err(|e| ProxyError::MalformedRequest(e.to_string()))? {
            httparse::Status::Complete(consumed) => {
                let code = parsed.code.ok_or_else(|| ProxyError::MalformedRequest("missing status code".to_string()))?;
                let status = StatusCode::from_u16(code).map_err(|e| ProxyError::MalformedRequest(e.to_string()))?;
                let version = if parsed.version == Some(1) { Version::HTTP_11 } else { Version::HTTP_10 };
                let headers = to_header_map(parsed.headers)?;
                return Ok((status, version, headers, consumed, accumulated));
            }
            httparse::Status::Partial => {
                grow_or_fail(conn, &mut accumulated).await?;
            }
        }
    }
}

async fn grow_or_fail(conn: &mut Connection, accumulated: &mut Vec<u8>) -> Result<(), ProxyError> {
    if accumulated.len() > MAX_HEADER_BYTES {
        return Err(ProxyError::MalformedRequest("header block too large".to_string()));
    }
    let chunk = conn.fill_buf().await?;
    if chunk.is_empty() {
        return Err(ProxyError::MalformedRequest("connection closed before headers completed".to_string()));
    }
    let n = chunk.len();
    accumulated.extend_from_slice(chunk);
    conn.consume(n);
    Ok(())
}

fn to_header_map(raw: &[httparse::Header]) -> Result<HeaderMap, ProxyError> {
    let mut headers = HeaderMap::new();
    for h in raw {
        let name = HeaderName::from_bytes(h.name.as_bytes()).map_err(|e| ProxyError::MalformedRequest(e.to_string()))?;
        let value = HeaderValue::from_bytes(h.value).map_err(|e| ProxyError::MalformedRequest(e.to_string()))?;
        headers.append(name, value);
    }
    Ok(headers)
}

/// Reads the message body following the header block. `leftover` is
/// whatever body bytes the header parser already pulled into its
/// accumulator in the same read.
async fn read_body(conn: &mut Connection, headers: &HeaderMap, leftover: &[u8]) -> Result<Bytes, ProxyError> {
    if is_chunked(headers) {
        return read_chunked_body(conn, leftover).await;
    }

    let content_length = headers
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());

    let Some(content_length) = content_length else {
        // No declared body: whatever's in `leftover` belongs to the next
        // message on this connection, not this one.
        conn.unread(leftover);
        return Ok(Bytes::new());
    };

    let mut body = BytesMut::with_capacity(content_length);
    if leftover.len() >= content_length {
        body.extend_from_slice(&leftover[..content_length]);
        conn.unread(&leftover[content_length..]);
    } else {
        body.extend_from_slice(leftover);
        let mut remaining = content_length - leftover.len();
        while remaining > 0 {
            let chunk = conn.fill_buf().await?;
            if chunk.is_empty() {
                return Err(ProxyError::MalformedRequest("connection closed mid-body".to_string()));
            }
            let n = chunk.len().min(remaining);
            body.extend_from_slice(&chunk[..n]);
            conn.consume(n);
            remaining -= n;
        }
    }
    Ok(body.freeze())
}

async fn read_chunked_body(conn: &mut Connection, leftover: &[u8]) -> Result<Bytes, ProxyError> {
    conn.unread(leftover);

    let mut out = BytesMut::new();
    loop {
        let size_line = read_line(conn).await?;
        let size_str = size_line.split(|&b| b == b';').next().unwrap_or(&size_line);
        let size_str = std::str::from_utf8(size_str).map_err(|e| ProxyError::MalformedRequest(e.to_string()))?.trim();
        let size = usize::from_str_radix(size_str, 16).map_err(|e| ProxyError::MalformedRequest(e.to_string()))?;

        if size == 0 {
            // Trailer section, if any, followed by the terminating CRLF.
            loop {
                let trailer = read_line(conn).await?;
                if trailer.is_empty() {
                    break;
                }
            }
            break;
        }

        let mut chunk = vec![0u8; size];
        conn.read_exact(&mut chunk).await?;
        out.extend_from_slice(&chunk);

        let mut crlf = [0u8; 2];
        conn.read_exact(&mut crlf).await?;
        if &crlf != b"\r\n" {
            return Err(ProxyError::MalformedRequest("malformed chunk terminator".to_string()));
        }
    }
    Ok(out.freeze())
}

async fn read_line(conn: &mut Connection) -> Result<Vec<u8>, ProxyError> {
    let mut line = Vec::new();
    loop {
        let chunk = conn.fill_buf().await?;
        if chunk.is_empty() {
            return Err(ProxyError::MalformedRequest("connection closed reading chunk size".to_string()));
        }
        if let Some(pos) = chunk.iter().position(|&b| b == b'\n') {
            line.extend_from_slice(&chunk[..pos]);
            conn.consume(pos + 1);
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return Ok(line);
        }
        let n = chunk.len();
        line.extend_from_slice(chunk);
        conn.consume(n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn conn_with(bytes: &[u8]) -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        client.write_all(bytes).await.unwrap();
        (
            Connection::from_tcp_stream(server, Duration::from_secs(5), Duration::from_secs(5)).unwrap(),
            client,
        )
    }

    #[tokio::test]
    async fn parses_simple_get() {
        let (mut conn, _client) = conn_with(b"GET /ok HTTP/1.1\r\nHost: example.test\r\n\r\n").await;
        let req = read_request(&mut conn).await.unwrap();
        assert_eq!(req.method(), Method::GET);
        assert_eq!(req.uri().path(), "/ok");
        assert_eq!(req.headers().get("host").unwrap(), "example.test");
        assert!(req.body().is_empty());
    }

    #[tokio::test]
    async fn parses_content_length_body() {
        let (mut conn, _client) = conn_with(b"POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello").await;
        let req = read_request(&mut conn).await.unwrap();
        assert_eq!(req.body().as_ref(), b"hello");
    }

    #[tokio::test]
    async fn parses_chunked_body() {
        let (mut conn, _client) =
            conn_with(b"POST /x HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n").await;
        let req = read_request(&mut conn).await.unwrap();
        assert_eq!(req.body().as_ref(), b"hello world");
    }

    #[tokio::test]
    async fn pipelined_next_request_is_preserved() {
        let (mut conn, _client) =
            conn_with(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n").await;
        let first = read_request(&mut conn).await.unwrap();
        assert_eq!(first.uri().path(), "/a");
        let second = read_request(&mut conn).await.unwrap();
        assert_eq!(second.uri().path(), "/b");
    }
}
