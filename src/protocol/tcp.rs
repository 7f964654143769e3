//! Pass-through TCP processor: the terminal state for any protocol the
//! sniffer doesn't recognize (spec.md §4.3 "it exists so unknown protocols
//! have a definable terminal state").

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::connection::Connection;
use crate::error::ProxyError;
use crate::protocol::{Processor, TCP};
use crate::service::Services;

pub struct TcpProcessor;

#[async_trait]
impl Processor for TcpProcessor {
    fn name(&self) -> &'static str {
        TCP
    }

    async fn process(&self, conn: Connection, _services: Arc<Services>) -> Result<(), ProxyError> {
        debug!(peer = %conn.peer_addr, "tcp passthrough: draining and closing");
        // No relay target is known for an unrecognized protocol; read
        // whatever arrived so the peer doesn't hang on a full send buffer,
        // then drop the connection.
        let (_buffered, mut io) = conn.into_io();
        let mut sink = [0u8; 4096];
        loop {
            match tokio::io::AsyncReadExt::read(&mut io, &mut sink).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
        Ok(())
    }
}
