//! Protocol processor registry and first-byte sniffer (spec.md §4.3).

pub mod socks5;
pub mod tcp;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::connection::Connection;
use crate::error::ProxyError;
use crate::service::Services;

pub const HTTP: &str = "HTTP";
pub const SOCKS5: &str = "SOCKS5";
pub const TCP: &str = "TCP";

/// A handler identified by protocol name, obtained from the registry and run
/// to completion over one connection (spec.md §3 "Protocol processor").
#[async_trait]
pub trait Processor: Send + Sync {
    fn name(&self) -> &'static str;
    async fn process(&self, conn: Connection, services: Arc<Services>) -> Result<(), ProxyError>;
}

type Factory = Arc<dyn Fn() -> Arc<dyn Processor> + Send + Sync>;

/// Name -> factory map with a `TCP` fallback. Registration is expected to
/// happen before `Acceptor::start` (spec.md §4.3 "no locking is required if
/// performed before Start"); the lock exists to make later runtime
/// registration sound too, without changing the contract.
pub struct Registry {
    factories: RwLock<HashMap<&'static str, Factory>>,
    fallback: Factory,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
            fallback: Arc::new(|| Arc::new(tcp::TcpProcessor) as Arc<dyn Processor>),
        }
    }

    /// Builds the default registry: `HTTP` handled by the MITM processor,
    /// `SOCKS5` by the stub, `TCP` as the explicit and fallback entry.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(HTTP, || Arc::new(crate::http::HttpProcessor) as Arc<dyn Processor>);
        registry.register(SOCKS5, || Arc::new(socks5::Socks5Processor) as Arc<dyn Processor>);
        registry.register(TCP, || Arc::new(tcp::TcpProcessor) as Arc<dyn Processor>);
        registry
    }

    pub fn register<F>(&self, name: &'static str, factory: F)
    where
        F: Fn() -> Arc<dyn Processor> + Send + Sync + 'static,
    {
        self.factories.write().insert(name, Arc::new(factory));
    }

    pub fn unregister(&self, name: &'static str) {
        self.factories.write().remove(name);
    }

    /// Returns the registered factory's processor, falling back to `TCP`
    /// (spec.md §4.3 "`GetProcessor(name, conn)`").
    pub fn get_processor(&self, name: &str) -> Arc<dyn Processor> {
        match self.factories.read().get(name) {
            Some(factory) => factory(),
            None => (self.fallback)(),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Peeks the head of the stream and names a protocol per the table in
/// spec.md §4.3, without consuming any bytes.
pub async fn detect(conn: &mut Connection) -> Result<&'static str, ProxyError> {
    let buf = conn.fill_buf().await?;
    if buf.is_empty() {
        return Ok(TCP);
    }

    match buf[0] {
        b'G' | b'P' | b'D' | b'O' | b'H' | b'C' => return Ok(HTTP),
        0x05 => return Ok(SOCKS5),
        _ => {}
    }

    if buf.len() >= 8 && (buf.starts_with(b"SSH-2.0") || buf.starts_with(b"SSH-1.99")) {
        return Ok(TCP);
    }
    if buf.len() >= 3 && (buf.starts_with(b"220") || buf.starts_with(b"230")) {
        return Ok(TCP);
    }
    // 0x16/0x15/0x17 (TLS record types) and 0x10 (MQTT), 0x03 (RDP) and any
    // other printable byte all fall through to the TCP pass-through; true
    // TLS is only ever meaningful after a CONNECT, where detection doesn't
    // apply.
    Ok(TCP)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn conn_with_bytes(bytes: &[u8]) -> Connection {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        if !bytes.is_empty() {
            client.write_all(bytes).await.unwrap();
        }
        // keep `client` alive so the write isn't torn down before the peer reads it
        std::mem::forget(client);
        Connection::from_tcp_stream(server, Duration::from_secs(5), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn detects_http_methods() {
        for method in [b'G', b'P', b'D', b'O', b'H', b'C'] {
            let mut conn = conn_with_bytes(&[method, b'E', b'T']).await;
            assert_eq!(detect(&mut conn).await.unwrap(), HTTP);
        }
    }

    #[tokio::test]
    async fn detects_socks5() {
        let mut conn = conn_with_bytes(&[0x05, 0x01, 0x00]).await;
        assert_eq!(detect(&mut conn).await.unwrap(), SOCKS5);
    }

    #[tokio::test]
    async fn detects_ssh_and_smtp_as_tcp() {
        let mut conn = conn_with_bytes(b"SSH-2.0-OpenSSH").await;
        assert_eq!(detect(&mut conn).await.unwrap(), TCP);

        let mut conn = conn_with_bytes(b"220 smtp.example.test ESMTP").await;
        assert_eq!(detect(&mut conn).await.unwrap(), TCP);
    }

    #[tokio::test]
    async fn registry_falls_back_to_tcp() {
        let registry = Registry::with_defaults();
        let processor = registry.get_processor("NONSENSE");
        assert_eq!(processor.name(), TCP);
    }
}
