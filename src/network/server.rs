//! TCP server for gateway clients.

use crate::error::{NetworkError, Result};
use crate::network::rpc::{read_message, write_message, GatewayRequest, GatewayResponse, Message};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Backoff after a transient accept error.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Handles decoded requests.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: GatewayRequest) -> GatewayResponse;
}

/// Accepts client connections and serves requests until cancelled.
///
/// Each connection is served by its own task, one request at a time. On
/// cancellation the accept loop stops, each connection finishes the request
/// it is serving, and `run` returns once every connection task has ended.
pub struct NetworkServer {
    listener: TcpListener,
    handler: Arc<dyn RequestHandler>,
    shutdown: CancellationToken,
}

impl NetworkServer {
    pub fn new(
        listener: TcpListener,
        handler: Arc<dyn RequestHandler>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            listener,
            handler,
            shutdown,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr().map_err(NetworkError::Io)?)
    }

    /// Serve until the shutdown token fires. Returns an error only when the
    /// listener itself fails.
    pub async fn run(self) -> Result<()> {
        let addr = self.local_addr()?;
        info!(addr = %addr, "Gateway listening");

        let mut connections = JoinSet::new();

        let outcome = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Gateway listener shutting down");
                    break Ok(());
                }
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            debug!(peer = %peer, "Accepted connection");
                            let handler = Arc::clone(&self.handler);
                            let shutdown = self.shutdown.clone();
                            connections.spawn(async move {
                                if let Err(e) = handle_connection(stream, handler, shutdown).await {
                                    debug!(peer = %peer, error = %e, "Connection closed with error");
                                }
                            });
                        }
                        Err(e) if is_transient(&e) => {
                            warn!(error = %e, "Transient accept error");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                        }
                        Err(e) => {
                            error!(error = %e, "Listener failed");
                            break Err(NetworkError::Io(e).into());
                        }
                    }
                }
                // Reap finished connections so the set does not grow.
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        };

        drop(self.listener);
        let open = connections.len();
        if open > 0 {
            debug!(open, "Waiting for open connections");
        }
        while connections.join_next().await.is_some() {}

        outcome
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    handler: Arc<dyn RequestHandler>,
    shutdown: CancellationToken,
) -> Result<()> {
    stream.set_nodelay(true).map_err(NetworkError::Io)?;

    loop {
        let msg = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(()),
            msg = read_message(&mut stream) => msg?,
        };

        let Some(msg) = msg else {
            return Ok(());
        };

        let (request_id, body) = match msg {
            Message::Request { request_id, body } => (request_id, body),
            Message::Response { request_id, .. } => {
                return Err(NetworkError::UnexpectedResponse(format!(
                    "client sent a response (request {})",
                    request_id
                ))
                .into());
            }
        };

        // Not raced against shutdown: an admitted request runs to completion.
        let response = handler.handle(body).await;
        write_message(&mut stream, &Message::Response { request_id, body: response }).await?;
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    ) || e.raw_os_error() == Some(24) // EMFILE
}
