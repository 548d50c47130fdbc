//! gRPC plumbing between the supervisor and plugin processes.
//!
//! A plugin is spawned with a single argument: the endpoint it must
//! serve `PortunixPlugin` on. On POSIX that is a Unix domain socket
//! inside the plugin's data directory; on Windows a loopback TCP port.
//! The supervisor connects as a client, drives `Initialize`,
//! `HealthCheck` and `Shutdown`, and serves `PluginHost` for
//! host-mediated operations.

use std::path::Path;
use std::time::Duration;

use tonic::transport::{Channel, Endpoint};
use tracing::{debug, trace};

use crate::error::{ErrorCode, PortunixError, Result};

/// Generated protobuf types for `portunix.plugin.v1`.
pub mod proto {
    tonic::include_proto!("portunix.plugin.v1");
}

use proto::portunix_plugin_client::PortunixPluginClient;
use proto::{
    health_check_response, HealthCheckRequest, InitializeRequest, InitializeResponse,
    ShutdownRequest,
};

/// Interval between connect attempts while the handshake deadline runs.
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

// ═══════════════════════════════════════════════════════════════════════════════
// Endpoint
// ═══════════════════════════════════════════════════════════════════════════════

/// A listening endpoint leased to a plugin instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginEndpoint {
    /// Unix domain socket path (POSIX).
    #[cfg(unix)]
    Uds(std::path::PathBuf),
    /// Loopback TCP port (Windows, and tests everywhere).
    Tcp(u16),
}

impl PluginEndpoint {
    /// Allocate a fresh endpoint for a plugin under its data directory.
    pub fn allocate(plugin_dir: &Path) -> Result<Self> {
        #[cfg(unix)]
        {
            let socket = plugin_dir.join("plugin.sock");
            // A socket left behind by a dead instance would fail bind.
            let _ = std::fs::remove_file(&socket);
            std::fs::create_dir_all(plugin_dir)?;
            Ok(Self::Uds(socket))
        }
        #[cfg(not(unix))]
        {
            let _ = plugin_dir;
            let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
            let port = listener.local_addr()?.port();
            drop(listener);
            Ok(Self::Tcp(port))
        }
    }

    /// The argument handed to the plugin process.
    pub fn as_arg(&self) -> String {
        match self {
            #[cfg(unix)]
            Self::Uds(path) => path.display().to_string(),
            Self::Tcp(port) => format!("tcp://127.0.0.1:{}", port),
        }
    }

    /// Release any filesystem residue after the instance stops.
    pub fn release(&self) {
        #[cfg(unix)]
        if let Self::Uds(path) = self {
            let _ = std::fs::remove_file(path);
        }
    }

    /// Open a channel to the endpoint. A single attempt; callers retry
    /// under their own deadline.
    async fn connect_once(&self) -> Result<Channel> {
        match self {
            #[cfg(unix)]
            Self::Uds(path) => {
                let path = path.clone();
                // The URI is ignored by the connector; tonic requires a
                // syntactically valid one regardless.
                let channel = Endpoint::try_from("http://localhost")
                    .map_err(|e| PortunixError::internal(e.to_string()))?
                    .connect_with_connector(tower::service_fn(
                        move |_: tonic::transport::Uri| {
                            tokio::net::UnixStream::connect(path.clone())
                        },
                    ))
                    .await
                    .map_err(transport_error)?;
                Ok(channel)
            }
            Self::Tcp(port) => {
                let channel = Endpoint::try_from(format!("http://127.0.0.1:{}", port))
                    .map_err(|e| PortunixError::internal(e.to_string()))?
                    .connect()
                    .await
                    .map_err(transport_error)?;
                Ok(channel)
            }
        }
    }

    /// Connect, retrying until `deadline` elapses. Used for the
    /// post-spawn handshake window.
    pub async fn connect_within(&self, deadline: Duration) -> Result<Channel> {
        let started = tokio::time::Instant::now();
        loop {
            match self.connect_once().await {
                Ok(channel) => return Ok(channel),
                Err(err) => {
                    if started.elapsed() >= deadline {
                        return Err(PortunixError::with_internal(
                            ErrorCode::HandshakeTimeout,
                            format!(
                                "plugin did not open its endpoint within {:?}",
                                deadline
                            ),
                            err.to_string(),
                        ));
                    }
                    trace!(endpoint = %self.as_arg(), "endpoint not ready, retrying");
                    tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
                }
            }
        }
    }
}

fn transport_error(err: tonic::transport::Error) -> PortunixError {
    PortunixError::with_internal(
        ErrorCode::EndpointUnavailable,
        "cannot reach plugin endpoint",
        err.to_string(),
    )
}

// ═══════════════════════════════════════════════════════════════════════════════
// Plugin Client
// ═══════════════════════════════════════════════════════════════════════════════

/// Reported health of a plugin instance, decoded from the wire enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportedHealth {
    Serving,
    Degraded,
    NotServing,
    Unknown,
}

/// Supervisor-side client for one plugin instance.
#[derive(Debug, Clone)]
pub struct PluginClient {
    inner: PortunixPluginClient<Channel>,
}

impl PluginClient {
    /// Wrap an established channel.
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: PortunixPluginClient::new(channel),
        }
    }

    /// Drive the mandatory `Initialize` call.
    pub async fn initialize(
        &mut self,
        api_version: &str,
        config_json: &str,
        host_endpoint: &str,
        granted_permissions: Vec<String>,
        deadline: Duration,
    ) -> Result<InitializeResponse> {
        let mut request = tonic::Request::new(InitializeRequest {
            api_version: api_version.to_string(),
            config_json: config_json.to_string(),
            host_endpoint: host_endpoint.to_string(),
            granted_permissions,
        });
        request.set_timeout(deadline);
        let response = self.inner.initialize(request).await?;
        debug!(capabilities = ?response.get_ref().capabilities, "plugin initialized");
        Ok(response.into_inner())
    }

    /// One health poll.
    pub async fn health_check(&mut self, deadline: Duration) -> Result<ReportedHealth> {
        let mut request = tonic::Request::new(HealthCheckRequest {});
        request.set_timeout(deadline);
        let response = self.inner.health_check(request).await?;
        let status = health_check_response::Status::try_from(response.get_ref().status)
            .unwrap_or(health_check_response::Status::Unknown);
        Ok(match status {
            health_check_response::Status::Serving => ReportedHealth::Serving,
            health_check_response::Status::Degraded => ReportedHealth::Degraded,
            health_check_response::Status::NotServing => ReportedHealth::NotServing,
            health_check_response::Status::Unknown => ReportedHealth::Unknown,
        })
    }

    /// Ask the plugin to shut down gracefully.
    pub async fn shutdown(&mut self, grace: Duration) -> Result<bool> {
        let mut request = tonic::Request::new(ShutdownRequest {
            grace_seconds: grace.as_secs() as u32,
        });
        request.set_timeout(grace);
        let response = self.inner.shutdown(request).await?;
        Ok(response.into_inner().ack)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_uds_allocation_inside_plugin_dir() {
        let tmp = tempfile::TempDir::new().unwrap();
        let endpoint = PluginEndpoint::allocate(tmp.path()).unwrap();
        match &endpoint {
            PluginEndpoint::Uds(path) => {
                assert!(path.starts_with(tmp.path()));
                assert_eq!(path.file_name().unwrap(), "plugin.sock");
            }
            other => panic!("expected UDS endpoint, got {:?}", other),
        }
        assert_eq!(
            endpoint.as_arg(),
            tmp.path().join("plugin.sock").display().to_string()
        );
    }

    #[tokio::test]
    async fn test_connect_within_times_out_without_listener() {
        let tmp = tempfile::TempDir::new().unwrap();
        let endpoint = PluginEndpoint::allocate(tmp.path()).unwrap();
        let err = endpoint
            .connect_within(Duration::from_millis(300))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::HandshakeTimeout);
    }

    #[test]
    fn test_tcp_arg_format() {
        let endpoint = PluginEndpoint::Tcp(50123);
        assert_eq!(endpoint.as_arg(), "tcp://127.0.0.1:50123");
    }
}
