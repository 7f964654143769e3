//! SOCKS5 stub: reads the version byte, refuses every method, closes
//! (spec.md §4.3 "a stub, not a relay").

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::connection::Connection;
use crate::error::ProxyError;
use crate::protocol::{Processor, SOCKS5};
use crate::service::Services;

const REFUSAL: [u8; 2] = [0x05, 0xFF];

pub struct Socks5Processor;

#[async_trait]
impl Processor for Socks5Processor {
    fn name(&self) -> &'static str {
        SOCKS5
    }

    async fn process(&self, mut conn: Connection, _services: Arc<Services>) -> Result<(), ProxyError> {
        let mut version = [0u8; 1];
        conn.read_exact(&mut version).await?;
        debug!(peer = %conn.peer_addr, version = version[0], "socks5 handshake refused");
        conn.write_all(&REFUSAL).await?;
        conn.flush().await?;
        Ok(())
    }
}
