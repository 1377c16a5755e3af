//! gRPC transport: endpoint configuration, the tonic-backed [`Dialer`] and
//! the pooled [`Connection`] it produces.
//!
//! This module is responsible only for transport-level settings. Per-call
//! deadlines come from the call envelope and are sent as `grpc-timeout`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tonic::transport::{Channel, Endpoint};
use tracing::Instrument;

use crate::config::humantime_serde;
use crate::pool::{Connection, Dialer};

fn duration_to_i64_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Transport settings applied to every dialed channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GrpcClientConfig {
    /// Timeout for establishing the connection.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Upper bound for any single request on the channel.
    #[serde(with = "humantime_serde")]
    pub rpc_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub tcp_keepalive: Duration,

    #[serde(with = "humantime_serde")]
    pub http2_keep_alive_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub keep_alive_timeout: Duration,

    pub keep_alive_while_idle: bool,
}

impl Default for GrpcClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            rpc_timeout: Duration::from_secs(30),
            tcp_keepalive: Duration::from_secs(30),
            http2_keep_alive_interval: Duration::from_secs(30),
            keep_alive_timeout: Duration::from_secs(10),
            keep_alive_while_idle: true,
        }
    }
}

impl GrpcClientConfig {
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }
}

/// Turn a registry address (`host:port`) into a dialable URI.
///
/// Addresses that already carry a scheme are used as is.
#[must_use]
pub fn endpoint_uri(address: &str) -> String {
    if address.contains("://") {
        address.to_owned()
    } else {
        format!("http://{address}")
    }
}

/// Build a tonic `Endpoint` with timeouts and keepalive settings.
pub(crate) fn build_endpoint(
    uri: String,
    cfg: &GrpcClientConfig,
) -> Result<Endpoint, tonic::transport::Error> {
    let endpoint = Endpoint::from_shared(uri)?
        .connect_timeout(cfg.connect_timeout)
        .timeout(cfg.rpc_timeout)
        .tcp_keepalive(Some(cfg.tcp_keepalive))
        .http2_keep_alive_interval(cfg.http2_keep_alive_interval)
        .keep_alive_timeout(cfg.keep_alive_timeout)
        .keep_alive_while_idle(cfg.keep_alive_while_idle);

    Ok(endpoint)
}

/// Dials tonic channels for pooled addresses.
#[derive(Debug, Clone, Default)]
pub struct GrpcDialer {
    cfg: GrpcClientConfig,
}

impl GrpcDialer {
    #[must_use]
    pub fn new(cfg: GrpcClientConfig) -> Self {
        Self { cfg }
    }

    #[must_use]
    pub fn config(&self) -> &GrpcClientConfig {
        &self.cfg
    }
}

#[async_trait]
impl Dialer for GrpcDialer {
    type Conn = GrpcConnection;

    async fn dial(&self, address: &str) -> anyhow::Result<GrpcConnection> {
        let uri = endpoint_uri(address);
        let span = tracing::debug_span!("grpc_connect", uri = %uri);
        let cfg = &self.cfg;

        async move {
            let endpoint = build_endpoint(uri, cfg)?;
            let channel = endpoint.connect().await?;

            tracing::info!(
                connect_timeout_ms = duration_to_i64_ms(cfg.connect_timeout),
                rpc_timeout_ms = duration_to_i64_ms(cfg.rpc_timeout),
                "gRPC client connected"
            );

            Ok(GrpcConnection::new(channel))
        }
        .instrument(span)
        .await
    }
}

/// A pooled tonic channel.
///
/// Closing marks the connection unusable; the channel itself is dropped with
/// the last handle.
#[derive(Debug)]
pub struct GrpcConnection {
    channel: Channel,
    closed: AtomicBool,
}

impl GrpcConnection {
    #[must_use]
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Connection for GrpcConnection {
    async fn unary<Req, Resp>(
        &self,
        request: tonic::Request<Req>,
        path: &str,
    ) -> Result<tonic::Response<Resp>, tonic::Status>
    where
        Req: prost::Message + 'static,
        Resp: prost::Message + Default + 'static,
    {
        if self.is_closed() {
            return Err(tonic::Status::unavailable("connection closed"));
        }
        let path = http::uri::PathAndQuery::try_from(path)
            .map_err(|e| tonic::Status::invalid_argument(format!("invalid method path: {e}")))?;

        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| tonic::Status::unavailable(format!("service was not ready: {e}")))?;

        let codec = tonic_prost::ProstCodec::<Req, Resp>::default();
        grpc.unary(request, path, codec).await
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = GrpcClientConfig::default();
        assert_eq!(cfg.connect_timeout, Duration::from_secs(10));
        assert_eq!(cfg.rpc_timeout, Duration::from_secs(30));
        assert!(cfg.keep_alive_while_idle);
    }

    #[test]
    fn test_build_endpoint_succeeds() {
        let cfg = GrpcClientConfig::default();
        let result = build_endpoint(endpoint_uri("localhost:50051"), &cfg);
        assert!(
            result.is_ok(),
            "build_endpoint should succeed with valid URI"
        );
    }

    #[test]
    fn test_build_endpoint_empty_uri() {
        let cfg = GrpcClientConfig::default();
        let result = build_endpoint(String::new(), &cfg);
        assert!(result.is_err(), "build_endpoint should fail with empty URI");
    }

    #[test]
    fn bare_addresses_get_http_scheme() {
        assert_eq!(endpoint_uri("10.0.0.1:7001"), "http://10.0.0.1:7001");
        assert_eq!(endpoint_uri("https://svc:443"), "https://svc:443");
    }
}
