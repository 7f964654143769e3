//! Connection acceptor and dispatcher (spec.md §4.2): binds one listener,
//! spawns `threads` accept-worker tasks, and runs every accepted connection
//! through first-byte sniffing and the resolved protocol processor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{error, info, warn, Instrument};

use crate::connection::Connection;
use crate::error::ProxyError;
use crate::plugin::context::InterceptContext;
use crate::plugin::executor;
use crate::protocol::Registry;
use crate::service::Services;

const ACCEPT_DEADLINE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    New,
    Started,
    Stopped,
}

/// `New -> Started -> Stopped` (spec.md §4.2). `start` fails if already
/// started; `stop` is a no-op if never started.
pub struct Acceptor {
    services: Arc<Services>,
    registry: Arc<Registry>,
    state: parking_lot::Mutex<State>,
    cancelled: Arc<AtomicBool>,
    cancel_notify: Arc<Notify>,
    workers: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl Acceptor {
    pub fn new(services: Arc<Services>, registry: Arc<Registry>) -> Self {
        Self {
            services,
            registry,
            state: parking_lot::Mutex::new(State::New),
            cancelled: Arc::new(AtomicBool::new(false)),
            cancel_notify: Arc::new(Notify::new()),
            workers: parking_lot::Mutex::new(None),
        }
    }

    pub async fn start(&self) -> Result<(), ProxyError> {
        {
            let mut state = self.state.lock();
            if *state != State::New {
                return Err(ProxyError::ConfigInvalid("acceptor already started".to_string()));
            }
            *state = State::Started;
        }

        let addr = format!("{}:{}", self.services.config.address, self.services.config.port);
        let listener = TcpListener::bind(&addr).await.map_err(ProxyError::IoFault)?;
        info!(%addr, "listening");

        let listener = Arc::new(listener);
        let mut workers = JoinSet::new();
        for worker_id in 0..self.services.config.threads.max(1) {
            let listener = listener.clone();
            let services = self.services.clone();
            let registry = self.registry.clone();
            let cancelled = self.cancelled.clone();
            let cancel_notify = self.cancel_notify.clone();
            workers.spawn(async move {
                accept_loop(worker_id, listener, services, registry, cancelled, cancel_notify).await;
            });
        }

        *self.workers.lock() = Some(workers);
        Ok(())
    }

    /// Signals cancellation and waits on the worker barrier (spec.md §4.2
    /// "Stop ... waits on the barrier").
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state != State::Started {
                return;
            }
            *state = State::Stopped;
        }

        self.cancelled.store(true, Ordering::SeqCst);
        self.cancel_notify.notify_waiters();

        let workers = self.workers.lock().take();
        if let Some(mut workers) = workers {
            while workers.join_next().await.is_some() {}
        }
        self.services.plugins.stop_plugins().await;
    }
}

async fn accept_loop(
    worker_id: usize,
    listener: Arc<TcpListener>,
    services: Arc<Services>,
    registry: Arc<Registry>,
    cancelled: Arc<AtomicBool>,
    cancel_notify: Arc<Notify>,
) {
    let mut connections = JoinSet::new();
    loop {
        if cancelled.load(Ordering::SeqCst) {
            break;
        }

        let accepted = tokio::select! {
            result = tokio::time::timeout(ACCEPT_DEADLINE, listener.accept()) => result,
            _ = cancel_notify.notified() => break,
        };

        let (stream, peer) = match accepted {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                if cancelled.load(Ordering::SeqCst) {
                    break;
                }
                warn!(worker_id, error = %e, "accept error");
                continue;
            }
            Err(_) => continue,
        };

        let services = services.clone();
        let registry = registry.clone();
        connections.spawn(async move {
            if let Err(e) = handle_connection(stream, services, registry).await {
                warn!(%peer, error = %e, "connection handler failed");
            }
        });
    }

    while connections.join_next().await.is_some() {}
}

/// One accepted connection, start to finish (spec.md §4.2 "Connection
/// handler"). Protocol sniffing happens before registry lookup and is
/// itself wrapped in the same panic-isolating task boundary every
/// connection handler runs under via `JoinSet`. Lifecycle hooks bracket the
/// processor call regardless of which protocol is resolved (spec.md §2
/// "Lifecycle hooks bracket every connection", §4.2 steps 3/5) — the
/// generic TCP and SOCKS5 processors get the same `OnConnectionStart`/
/// `OnConnectionEnd` treatment as the HTTP one.
async fn handle_connection(stream: TcpStream, services: Arc<Services>, registry: Arc<Registry>) -> Result<(), ProxyError> {
    let conn = Connection::from_tcp_stream(stream, services.config.read_timeout(), services.config.write_timeout())?;
    let peer = conn.peer_addr;
    let span = tracing::info_span!("connection", %peer);

    async move {
        let mut conn = conn;
        let connection_id = conn.connection_id.clone();
        let started_at = conn.started_at;

        let protocol = crate::protocol::detect(&mut conn).await.unwrap_or(crate::protocol::TCP);
        let processor = registry.get_processor(protocol);

        let mut start_ctx = InterceptContext::for_connection(connection_id.clone());
        executor::run_connection_start_hooks(&services.plugins, &mut start_ctx).await;

        let result = processor.process(conn, services.clone()).await;

        let mut end_ctx = InterceptContext::for_connection(connection_id);
        executor::run_connection_end_hooks(&services.plugins, &mut end_ctx, started_at.elapsed()).await;

        if let Err(e) = &result {
            error!(protocol, error = %e, "processor returned an error");
        }
        result
    }
    .instrument(span)
    .await
}
