//! Client for a running gateway.

use crate::error::{NetworkError, Result};
use crate::network::rpc::{
    read_message, write_message, ExecResponse, GatewayRequest, GatewayResponse, Message,
    SimpleResult,
};
use crate::types::{RoutingKey, RowSet, ShardName};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// One connection to a gateway. Requests are sent one at a time.
#[derive(Debug)]
pub struct GatewayClient {
    addr: SocketAddr,
    stream: TcpStream,
    next_request_id: u64,
    request_timeout: Option<Duration>,
}

impl GatewayClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = tokio::time::timeout(DEFAULT_CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| NetworkError::ConnectionFailed {
                addr: addr.to_string(),
                reason: "connect timed out".to_string(),
            })?
            .map_err(|e| NetworkError::ConnectionFailed {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true).map_err(NetworkError::Io)?;

        Ok(Self {
            addr,
            stream,
            next_request_id: 1,
            request_timeout: None,
        })
    }

    /// Bound every call by `timeout`. Migrations can take long; leave unset
    /// for admin connections.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Send `request` and wait for its response. Error responses are
    /// returned as `Ok`; the typed helpers turn them into errors.
    pub async fn call(&mut self, request: GatewayRequest) -> Result<GatewayResponse> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        debug!(addr = %self.addr, request_id, kind = request.kind(), "Sending request");

        let timeout = self.request_timeout;
        let stream = &mut self.stream;
        let exchange = async move {
            write_message(stream, &Message::Request { request_id, body: request }).await?;
            read_message(stream).await
        };

        let reply = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, exchange)
                .await
                .map_err(|_| crate::error::Error::Timeout)??,
            None => exchange.await?,
        };

        match reply {
            Some(Message::Response {
                request_id: id,
                body,
            }) if id == request_id => Ok(body),
            Some(other) => Err(NetworkError::UnexpectedResponse(format!("{:?}", other)).into()),
            None => Err(NetworkError::ConnectionClosed.into()),
        }
    }

    pub async fn query(&mut self, key: impl Into<RoutingKey>, sql: impl Into<String>) -> Result<RowSet> {
        let request = GatewayRequest::Query {
            key: key.into(),
            sql: sql.into(),
        };
        match self.call(request).await? {
            GatewayResponse::Rows(rows) => Ok(rows),
            other => Err(unexpected(other)),
        }
    }

    /// Exec result with sentinels in place of values the shard cannot report.
    pub async fn exec(
        &mut self,
        key: impl Into<RoutingKey>,
        sql: impl Into<String>,
    ) -> Result<ExecResponse> {
        let request = GatewayRequest::Exec {
            key: key.into(),
            sql: sql.into(),
        };
        match self.call(request).await? {
            GatewayResponse::Exec(result) => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    pub async fn register_key(
        &mut self,
        key: impl Into<RoutingKey>,
        shard: impl Into<ShardName>,
    ) -> Result<SimpleResult> {
        let request = GatewayRequest::RegisterKey {
            key: key.into(),
            shard: shard.into(),
        };
        self.simple(request).await
    }

    pub async fn remove_key(&mut self, key: impl Into<RoutingKey>) -> Result<SimpleResult> {
        self.simple(GatewayRequest::RemoveKey { key: key.into() })
            .await
    }

    pub async fn migrate_shard(
        &mut self,
        key: impl Into<RoutingKey>,
        to_shard: impl Into<ShardName>,
    ) -> Result<SimpleResult> {
        let request = GatewayRequest::MigrateShard {
            key: key.into(),
            to_shard: to_shard.into(),
        };
        self.simple(request).await
    }

    pub async fn ping(&mut self) -> Result<()> {
        match self.call(GatewayRequest::Ping).await? {
            GatewayResponse::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Fetch the gateway's metrics in Prometheus text format.
    pub async fn metrics(&mut self) -> Result<String> {
        match self.call(GatewayRequest::Metrics).await? {
            GatewayResponse::Metrics(text) => Ok(text),
            other => Err(unexpected(other)),
        }
    }

    async fn simple(&mut self, request: GatewayRequest) -> Result<SimpleResult> {
        match self.call(request).await? {
            GatewayResponse::Simple(result) => Ok(result),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: GatewayResponse) -> crate::error::Error {
    match response {
        GatewayResponse::Error(e) => e.into_error(),
        other => NetworkError::UnexpectedResponse(format!("{:?}", other)).into(),
    }
}
