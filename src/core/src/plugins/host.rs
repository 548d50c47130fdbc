//! Host-mediated operations for plugins.
//!
//! Plugins never touch the filesystem, network, or registry directly
//! for host-scoped work; they call `PluginHost::HostOperation` and the
//! supervisor performs the operation on their behalf after checking the
//! requested permission against the plugin's immutable granted set.
//! Requests outside the granted set are denied at the RPC level.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::plugins::registry::RegistryStore;
use crate::plugins::rpc::proto::plugin_host_server::{PluginHost, PluginHostServer};
use crate::plugins::rpc::proto::{HostOperationRequest, HostOperationResponse};
use crate::plugins::rpc::PluginEndpoint;
use crate::plugins::sandbox::{Permission, PermissionGate};
use crate::process::{run_captured, CommandSpec};

/// Budget for a single host-mediated subprocess.
const HOST_EXEC_DEADLINE: Duration = Duration::from_secs(60);

// ═══════════════════════════════════════════════════════════════════════════════
// Service
// ═══════════════════════════════════════════════════════════════════════════════

/// `PluginHost` implementation backed by the registry's permission
/// records.
#[derive(Debug, Clone)]
pub struct HostService {
    registry: RegistryStore,
}

impl HostService {
    pub fn new(registry: RegistryStore) -> Self {
        Self { registry }
    }

    async fn gate_for(&self, plugin_id: &str) -> std::result::Result<PermissionGate, Status> {
        let record = self
            .registry
            .get(plugin_id)
            .await
            .map_err(|_| Status::unauthenticated(format!("unknown plugin id: {}", plugin_id)))?;
        Ok(PermissionGate::new(record.permissions))
    }
}

#[derive(Deserialize)]
struct PathPayload {
    path: String,
}

#[derive(Deserialize)]
struct WritePayload {
    path: String,
    contents: String,
}

#[derive(Deserialize)]
struct ExecPayload {
    program: String,
    #[serde(default)]
    args: Vec<String>,
}

#[derive(Deserialize)]
struct FetchPayload {
    url: String,
}

#[tonic::async_trait]
impl PluginHost for HostService {
    async fn host_operation(
        &self,
        request: Request<HostOperationRequest>,
    ) -> std::result::Result<Response<HostOperationResponse>, Status> {
        let req = request.into_inner();
        let gate = self.gate_for(&req.plugin_id).await?;

        // The filesystem pair checks the path operand against the
        // granted prefixes; everything else is a plain membership check.
        let path_operand: Option<std::path::PathBuf> = match req.permission.as_str() {
            "fs:read" | "fs:write" => serde_json::from_str::<PathPayload>(&req.payload_json)
                .ok()
                .map(|p| p.path.into()),
            _ => None,
        };

        if let Err(violation) = gate.check_request(&req.permission, path_operand.as_deref()) {
            warn!(
                plugin = %req.plugin_id,
                permission = %req.permission,
                operation = %req.operation,
                %violation,
                "host operation denied"
            );
            return Err(violation.into());
        }

        debug!(
            plugin = %req.plugin_id,
            permission = %req.permission,
            operation = %req.operation,
            "host operation allowed"
        );

        let result_json = self.execute(&req).await?;
        Ok(Response::new(HostOperationResponse {
            allowed: true,
            result_json,
        }))
    }
}

impl HostService {
    async fn execute(&self, req: &HostOperationRequest) -> std::result::Result<String, Status> {
        let permission = Permission::parse(&req.permission)
            .ok_or_else(|| Status::invalid_argument("unknown permission"))?;

        match (permission, req.operation.as_str()) {
            (Permission::FsRead, "read_file") => {
                let payload: PathPayload = parse_payload(&req.payload_json)?;
                let contents = tokio::fs::read_to_string(&payload.path)
                    .await
                    .map_err(|e| Status::internal(e.to_string()))?;
                Ok(json!({ "contents": contents }).to_string())
            }
            (Permission::FsWrite, "write_file") => {
                let payload: WritePayload = parse_payload(&req.payload_json)?;
                crate::fsutil::atomic_write(Path::new(&payload.path), payload.contents.as_bytes())
                    .map_err(|e| Status::internal(e.to_string()))?;
                Ok(json!({ "written": payload.contents.len() }).to_string())
            }
            (Permission::ProcExec, "run") => {
                let payload: ExecPayload = parse_payload(&req.payload_json)?;
                let spec = CommandSpec::new(payload.program, payload.args);
                let output =
                    run_captured(&spec, Some(HOST_EXEC_DEADLINE), &CancellationToken::new())
                        .await
                        .map_err(|e| Status::internal(e.to_string()))?;
                Ok(json!({
                    "stdout": output.stdout,
                    "stderr": output.stderr,
                    "exit_code": output.exit_code,
                })
                .to_string())
            }
            (Permission::NetOutbound, "fetch") => {
                let payload: FetchPayload = parse_payload(&req.payload_json)?;
                let body = reqwest::get(&payload.url)
                    .await
                    .and_then(reqwest::Response::error_for_status)
                    .map_err(|e| Status::unavailable(e.to_string()))?
                    .text()
                    .await
                    .map_err(|e| Status::unavailable(e.to_string()))?;
                Ok(json!({ "body": body }).to_string())
            }
            (Permission::RegistryRead, "self") => {
                let record = self
                    .registry
                    .get(&req.plugin_id)
                    .await
                    .map_err(|e| Status::internal(e.to_string()))?;
                serde_json::to_string(&record).map_err(|e| Status::internal(e.to_string()))
            }
            (Permission::RegistryRead, "list") => {
                let ids: Vec<String> = self
                    .registry
                    .list()
                    .await
                    .into_iter()
                    .map(|r| r.id)
                    .collect();
                Ok(json!({ "plugins": ids }).to_string())
            }
            // The write vocabulary is reserved; no host mutation is
            // currently exposed through it.
            (Permission::RegistryWrite, op) => Err(Status::unimplemented(format!(
                "registry:write operation not available: {}",
                op
            ))),
            (_, op) => Err(Status::unimplemented(format!("unknown operation: {}", op))),
        }
    }
}

fn parse_payload<'a, T: Deserialize<'a>>(payload: &'a str) -> std::result::Result<T, Status> {
    serde_json::from_str(payload)
        .map_err(|e| Status::invalid_argument(format!("bad payload: {}", e)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::registry::PluginRecord;
    use crate::plugins::sandbox::PermissionSet;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    async fn service_with_plugin(tmp: &TempDir, permissions: PermissionSet) -> HostService {
        let registry = RegistryStore::open(tmp.path().join("plugins.json")).unwrap();
        registry
            .insert(PluginRecord {
                id: "p1".to_string(),
                version: semver::Version::new(1, 0, 0),
                api_version: "1.0".to_string(),
                binary_path: tmp.path().join("p1"),
                binary_sha256: "00".repeat(32),
                capabilities: vec![],
                environment: BTreeMap::new(),
                permissions,
                enabled: true,
                installed_at: chrono::Utc::now(),
            })
            .await
            .unwrap();
        HostService::new(registry)
    }

    fn request(permission: &str, operation: &str, payload: serde_json::Value) -> Request<HostOperationRequest> {
        Request::new(HostOperationRequest {
            plugin_id: "p1".to_string(),
            permission: permission.to_string(),
            operation: operation.to_string(),
            payload_json: payload.to_string(),
        })
    }

    #[tokio::test]
    async fn test_undeclared_permission_denied_at_rpc_level() {
        let tmp = TempDir::new().unwrap();
        let service = service_with_plugin(&tmp, PermissionSet::default()).await;

        let status = service
            .host_operation(request("proc:exec", "run", json!({"program": "ls"})))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::PermissionDenied);
    }

    #[tokio::test]
    async fn test_fs_read_respects_prefixes() {
        let tmp = TempDir::new().unwrap();
        let allowed = tmp.path().join("allowed");
        std::fs::create_dir_all(&allowed).unwrap();
        std::fs::write(allowed.join("data.txt"), "payload").unwrap();

        let service = service_with_plugin(
            &tmp,
            PermissionSet {
                fs_read: vec![allowed.display().to_string()],
                ..Default::default()
            },
        )
        .await;

        let response = service
            .host_operation(request(
                "fs:read",
                "read_file",
                json!({"path": allowed.join("data.txt").display().to_string()}),
            ))
            .await
            .unwrap();
        let body: serde_json::Value =
            serde_json::from_str(&response.get_ref().result_json).unwrap();
        assert_eq!(body["contents"], "payload");

        let status = service
            .host_operation(request(
                "fs:read",
                "read_file",
                json!({"path": "/etc/hostname"}),
            ))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::PermissionDenied);
    }

    #[tokio::test]
    async fn test_unknown_plugin_id_rejected() {
        let tmp = TempDir::new().unwrap();
        let service = service_with_plugin(&tmp, PermissionSet::default()).await;

        let status = service
            .host_operation(Request::new(HostOperationRequest {
                plugin_id: "ghost".to_string(),
                permission: "registry:read".to_string(),
                operation: "self".to_string(),
                payload_json: "{}".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unauthenticated);
    }

    #[tokio::test]
    async fn test_registry_read_self() {
        let tmp = TempDir::new().unwrap();
        let service = service_with_plugin(
            &tmp,
            PermissionSet {
                registry_read: true,
                ..Default::default()
            },
        )
        .await;

        let response = service
            .host_operation(request("registry:read", "self", json!({})))
            .await
            .unwrap();
        assert!(response.get_ref().allowed);
        let record: serde_json::Value =
            serde_json::from_str(&response.get_ref().result_json).unwrap();
        assert_eq!(record["id"], "p1");
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Serving
// ═══════════════════════════════════════════════════════════════════════════════

/// Serve `PluginHost` on `endpoint` until `cancel` fires.
pub fn spawn_host_server(
    endpoint: &PluginEndpoint,
    service: HostService,
    cancel: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let server = tonic::transport::Server::builder().add_service(PluginHostServer::new(service));
    let shutdown = cancel.clone();

    match endpoint {
        #[cfg(unix)]
        PluginEndpoint::Uds(path) => {
            let listener = std::os::unix::net::UnixListener::bind(path)?;
            listener.set_nonblocking(true)?;
            let listener = tokio::net::UnixListener::from_std(listener)?;
            let incoming = tokio_stream::wrappers::UnixListenerStream::new(listener);
            let arg = endpoint.as_arg();
            Ok(tokio::spawn(async move {
                if let Err(err) = server
                    .serve_with_incoming_shutdown(incoming, shutdown.cancelled())
                    .await
                {
                    warn!(error = %err, "host server terminated abnormally");
                }
                info!(endpoint = %arg, "host server stopped");
            }))
        }
        PluginEndpoint::Tcp(port) => {
            let listener = std::net::TcpListener::bind(("127.0.0.1", *port))?;
            listener.set_nonblocking(true)?;
            let listener = tokio::net::TcpListener::from_std(listener)?;
            let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);
            let arg = endpoint.as_arg();
            Ok(tokio::spawn(async move {
                if let Err(err) = server
                    .serve_with_incoming_shutdown(incoming, shutdown.cancelled())
                    .await
                {
                    warn!(error = %err, "host server terminated abnormally");
                }
                info!(endpoint = %arg, "host server stopped");
            }))
        }
    }
}
