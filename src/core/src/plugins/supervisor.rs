//! Plugin lifecycle supervision.
//!
//! The supervisor owns every plugin process: it spawns them with a
//! freshly leased endpoint, drives the Initialize handshake, polls
//! health on a fixed cadence, restarts crashed instances with
//! exponential backoff, and quarantines plugins that keep failing.
//! Operations on a single plugin id are strictly serialised by a
//! per-id lock; at most one live instance exists per id at any time.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{PathsConfig, SupervisorConfig};
use crate::error::{ErrorCode, PortunixError, Result};
use crate::fsutil;
use crate::plugins::host::{spawn_host_server, HostService};
use crate::plugins::manifest::PluginManifest;
use crate::plugins::registry::{PluginRecord, RegistryStore};
use crate::plugins::rpc::{PluginClient, PluginEndpoint, ReportedHealth};
use crate::{archive, process};

// ═══════════════════════════════════════════════════════════════════════════════
// Health State
// ═══════════════════════════════════════════════════════════════════════════════

/// Observable health of a plugin instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// Spawned, handshake in progress.
    Starting,
    /// Initialize completed, health polls passing.
    Ready,
    /// Health polls failing or the process is gone.
    Unhealthy,
    /// No live process.
    Stopped,
}

/// Snapshot of an instance for `health`, `list` and `info`.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub id: String,
    pub state: HealthState,
    pub last_health: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub quarantined: bool,
    pub endpoint: Option<String>,
    pub pid: Option<u32>,
}

impl InstanceStatus {
    fn stopped(id: &str) -> Self {
        Self {
            id: id.to_string(),
            state: HealthState::Stopped,
            last_health: None,
            restart_count: 0,
            quarantined: false,
            endpoint: None,
            pid: None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Restart Tracking
// ═══════════════════════════════════════════════════════════════════════════════

/// Backoff and quarantine accounting for one instance.
///
/// Consecutive failures drive an exponential backoff (base doubled per
/// attempt, capped); failures inside the sliding quarantine window
/// drive quarantine.
#[derive(Debug)]
pub(crate) struct RestartTracker {
    base: Duration,
    cap: Duration,
    window: Duration,
    threshold: u32,
    consecutive: u32,
    failures: Vec<Instant>,
}

impl RestartTracker {
    pub(crate) fn new(config: &SupervisorConfig) -> Self {
        Self {
            base: config.restart_backoff_base,
            cap: config.restart_backoff_cap,
            window: config.quarantine_window,
            threshold: config.quarantine_threshold,
            consecutive: 0,
            failures: Vec::new(),
        }
    }

    /// Backoff to sleep before the next restart attempt.
    pub(crate) fn next_backoff(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.consecutive.min(16));
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Record a failed restart; returns true when the instance must be
    /// quarantined.
    pub(crate) fn record_failure(&mut self, now: Instant) -> bool {
        self.consecutive = self.consecutive.saturating_add(1);
        self.failures.push(now);
        let window = self.window;
        self.failures
            .retain(|t| now.duration_since(*t) <= window);
        self.failures.len() as u32 >= self.threshold
    }

    /// A successful handshake resets the backoff sequence (the sliding
    /// window keeps its entries so a crash loop with brief recoveries
    /// still trips quarantine).
    pub(crate) fn note_ready(&mut self) {
        self.consecutive = 0;
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Instance plumbing
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
struct InstanceShared {
    state: parking_lot::RwLock<InstanceState>,
}

#[derive(Debug)]
struct InstanceState {
    health: HealthState,
    last_health: Option<DateTime<Utc>>,
    restart_count: u32,
    quarantined: bool,
    pid: Option<u32>,
}

impl InstanceShared {
    fn new() -> Self {
        Self {
            state: parking_lot::RwLock::new(InstanceState {
                health: HealthState::Starting,
                last_health: None,
                restart_count: 0,
                quarantined: false,
                pid: None,
            }),
        }
    }

    fn set_health(&self, health: HealthState) {
        self.state.write().health = health;
    }

    fn snapshot(&self, id: &str, endpoint: &PluginEndpoint) -> InstanceStatus {
        let state = self.state.read();
        InstanceStatus {
            id: id.to_string(),
            state: state.health,
            last_health: state.last_health,
            restart_count: state.restart_count,
            quarantined: state.quarantined,
            endpoint: Some(endpoint.as_arg()),
            pid: state.pid,
        }
    }
}

struct InstanceHandle {
    shared: Arc<InstanceShared>,
    endpoint: PluginEndpoint,
    cancel: CancellationToken,
    task: Option<tokio::task::JoinHandle<()>>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Supervisor
// ═══════════════════════════════════════════════════════════════════════════════

/// Owner of all plugin instances and the operational surface over them.
pub struct PluginSupervisor {
    config: SupervisorConfig,
    paths: PathsConfig,
    registry: RegistryStore,
    instances: DashMap<String, InstanceHandle>,
    id_locks: DashMap<String, Arc<Mutex<()>>>,
    host: Mutex<Option<HostHandle>>,
}

struct HostHandle {
    endpoint: PluginEndpoint,
    cancel: CancellationToken,
}

impl PluginSupervisor {
    /// Build a supervisor over an opened registry.
    pub fn new(config: SupervisorConfig, paths: PathsConfig, registry: RegistryStore) -> Self {
        Self {
            config,
            paths,
            registry,
            instances: DashMap::new(),
            id_locks: DashMap::new(),
            host: Mutex::new(None),
        }
    }

    /// The registry backing this supervisor.
    pub fn registry(&self) -> &RegistryStore {
        &self.registry
    }

    fn id_lock(&self, id: &str) -> Arc<Mutex<()>> {
        self.id_locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Install / Uninstall / Validate / Create
    // ─────────────────────────────────────────────────────────────────────────

    /// Install a plugin from a package directory or archive.
    pub async fn install(&self, source: &Path) -> Result<PluginRecord> {
        let (package_dir, _scratch) = materialize_package(source)?;
        let manifest = PluginManifest::load_from_dir(&package_dir)?;
        manifest.validate().map_err(PortunixError::from)?;

        if !manifest.api_compatible_with(&self.config.api_version) {
            return Err(PortunixError::new(
                ErrorCode::ApiVersionIncompatible,
                format!(
                    "plugin targets API {} but this host speaks {}",
                    manifest.api_version, self.config.api_version
                ),
            ));
        }

        let source_binary = package_dir.join(&manifest.binary);
        if !source_binary.is_file() {
            return Err(PortunixError::new(
                ErrorCode::ManifestInvalid,
                format!("declared binary missing from package: {}", manifest.binary),
            ));
        }

        let lock = self.id_lock(&manifest.id);
        let _guard = lock.lock().await;

        if self.registry.contains(&manifest.id).await {
            return Err(PortunixError::new(
                ErrorCode::PluginAlreadyInstalled,
                format!("plugin already installed: {}", manifest.id),
            ));
        }

        // Stable install root: <data>/plugins/<id>/bin plus a private
        // data directory.
        let plugin_dir = self.paths.plugin_dir(&manifest.id);
        let bin_dir = plugin_dir.join("bin");
        fsutil::copy_dir_all(&package_dir, &bin_dir)?;
        std::fs::create_dir_all(plugin_dir.join("data"))?;

        let installed_binary = bin_dir.join(&manifest.binary);
        fsutil::set_executable(&installed_binary)?;
        let checksum = fsutil::sha256_file(&installed_binary)?;

        let record = PluginRecord {
            id: manifest.id.clone(),
            version: manifest.semver(),
            api_version: manifest.api_version.clone(),
            binary_path: installed_binary,
            binary_sha256: checksum,
            capabilities: manifest.capabilities.clone(),
            environment: manifest.environment.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            permissions: manifest.permissions.clone(),
            enabled: false,
            installed_at: Utc::now(),
        };

        if let Err(err) = self.registry.insert(record.clone()).await {
            let _ = std::fs::remove_dir_all(&plugin_dir);
            return Err(err);
        }

        info!(plugin = %record.id, version = %record.version, "plugin installed");
        Ok(record)
    }

    /// Remove a plugin's record, binary, and data directory. Fails while
    /// an instance is live.
    pub async fn uninstall(&self, id: &str) -> Result<()> {
        let lock = self.id_lock(id);
        let _guard = lock.lock().await;

        if self.is_live(id) {
            return Err(PortunixError::new(
                ErrorCode::PluginInstanceRunning,
                format!("plugin {} has a running instance", id),
            )
            .with_hint(format!("run `portunix plugin stop {}` first", id)));
        }

        self.registry.remove(id).await?;
        let plugin_dir = self.paths.plugin_dir(id);
        if plugin_dir.exists() {
            std::fs::remove_dir_all(&plugin_dir)?;
        }
        self.instances.remove(id);
        info!(plugin = id, "plugin uninstalled");
        Ok(())
    }

    /// Enable a plugin (it may then be started).
    pub async fn enable(&self, id: &str) -> Result<PluginRecord> {
        self.registry.set_enabled(id, true).await
    }

    /// Disable a plugin; a disabled plugin cannot be started.
    pub async fn disable(&self, id: &str) -> Result<PluginRecord> {
        self.registry.set_enabled(id, false).await
    }

    /// Structural and semantic checks of a package without installing.
    pub fn validate(&self, source: &Path) -> Result<ValidationReport> {
        let (package_dir, _scratch) = materialize_package(source)?;
        let manifest = PluginManifest::load_from_dir(&package_dir)?;
        let mut issues = Vec::new();

        if let Err(err) = manifest.validate() {
            issues.push(err.to_string());
        }
        if !manifest.api_compatible_with(&self.config.api_version) {
            issues.push(format!(
                "api_version {} is incompatible with host API {}",
                manifest.api_version, self.config.api_version
            ));
        }
        let binary = package_dir.join(&manifest.binary);
        if !binary.is_file() {
            issues.push(format!("declared binary missing: {}", manifest.binary));
        }

        Ok(ValidationReport {
            id: manifest.id.clone(),
            version: manifest.version.clone(),
            ok: issues.is_empty(),
            issues,
        })
    }

    /// Scaffold a new plugin package skeleton at `dir`.
    pub fn create_template(&self, id: &str, dir: &Path) -> Result<PathBuf> {
        let package_dir = dir.join(id);
        if package_dir.exists() {
            return Err(PortunixError::new(
                ErrorCode::InvalidInput,
                format!("directory already exists: {}", package_dir.display()),
            ));
        }
        std::fs::create_dir_all(&package_dir)?;

        let manifest = format!(
            r#"id = "{id}"
version = "0.1.0"
api_version = "{api}"
binary = "{id}"
description = ""

# Capabilities this plugin serves. Closed vocabulary:
# packages, environments, diagnostics, mcp, scaffolding, secrets
capabilities = []

[permissions]
# "fs:read" = ["/path/prefix"]
# "net:outbound" = true

[environment]
"#,
            id = id,
            api = self.config.api_version,
        );
        std::fs::write(package_dir.join("plugin.toml"), manifest)?;
        info!(plugin = id, dir = %package_dir.display(), "plugin template created");
        Ok(package_dir)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Start / Stop / Health
    // ─────────────────────────────────────────────────────────────────────────

    /// Start a plugin instance and wait for it to reach Ready.
    pub async fn start(&self, id: &str) -> Result<InstanceStatus> {
        let lock = self.id_lock(id);
        let _guard = lock.lock().await;

        let record = self.registry.get(id).await?;
        if !record.enabled {
            return Err(PortunixError::new(
                ErrorCode::PluginDisabled,
                format!("plugin {} is disabled", id),
            )
            .with_hint(format!("run `portunix plugin enable {}` first", id)));
        }

        if self.is_live(id) {
            return Err(PortunixError::new(
                ErrorCode::PluginInstanceRunning,
                format!("plugin {} already has a live instance", id),
            ));
        }
        self.instances.remove(id);

        let shared = Arc::new(InstanceShared::new());

        if !record.binary_path.is_file() {
            // The record survives, but the instance is observably
            // unhealthy without a spawn attempt.
            shared.set_health(HealthState::Unhealthy);
            let endpoint = PluginEndpoint::allocate(&self.paths.plugin_dir(id))?;
            self.instances.insert(
                id.to_string(),
                InstanceHandle {
                    shared,
                    endpoint,
                    cancel: CancellationToken::new(),
                    task: None,
                },
            );
            return Err(PortunixError::new(
                ErrorCode::PluginBinaryMissing,
                format!(
                    "plugin binary missing: {}",
                    record.binary_path.display()
                ),
            )
            .with_hint("reinstall the plugin"));
        }

        let endpoint = PluginEndpoint::allocate(&self.paths.plugin_dir(id))?;
        let host_endpoint = self.ensure_host().await?;

        let cancel = CancellationToken::new();
        let (first_result_tx, first_result_rx) = oneshot::channel();
        let monitor = Monitor {
            id: id.to_string(),
            record,
            endpoint: endpoint.clone(),
            shared: shared.clone(),
            cancel: cancel.clone(),
            config: self.config.clone(),
            data_dir: self.paths.plugin_dir(id).join("data"),
            host_endpoint,
        };
        let task = tokio::spawn(monitor.run(first_result_tx));

        self.instances.insert(
            id.to_string(),
            InstanceHandle {
                shared: shared.clone(),
                endpoint: endpoint.clone(),
                cancel,
                task: Some(task),
            },
        );

        // The first handshake decides whether this start succeeded;
        // later crashes are the monitor's business.
        match first_result_rx.await {
            Ok(Ok(())) => Ok(shared.snapshot(id, &endpoint)),
            Ok(Err(err)) => {
                self.instances.remove(id);
                endpoint.release();
                Err(err)
            }
            Err(_) => {
                self.instances.remove(id);
                endpoint.release();
                Err(PortunixError::internal("monitor task vanished during start"))
            }
        }
    }

    /// Stop a plugin instance. Succeeds when no instance is live.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let lock = self.id_lock(id);
        let _guard = lock.lock().await;

        let Some((_, mut handle)) = self.instances.remove(id) else {
            debug!(plugin = id, "stop requested with no live instance");
            return Ok(());
        };

        handle.cancel.cancel();
        if let Some(task) = handle.task.take() {
            if tokio::time::timeout(
                self.config.shutdown_grace + process_grace_margin(),
                task,
            )
            .await
            .is_err()
            {
                warn!(plugin = id, "monitor did not wind down in time");
            }
        }
        handle.shared.set_health(HealthState::Stopped);
        handle.endpoint.release();
        info!(plugin = id, "plugin stopped");
        Ok(())
    }

    /// Current health of a plugin.
    pub async fn health(&self, id: &str) -> Result<InstanceStatus> {
        // Unknown ids are surfaced; known-but-not-running ids report
        // Stopped.
        let _ = self.registry.get(id).await?;
        Ok(self
            .instances
            .get(id)
            .map(|h| h.shared.snapshot(id, &h.endpoint))
            .unwrap_or_else(|| InstanceStatus::stopped(id)))
    }

    /// Snapshot of all records with their instance states.
    pub async fn list(&self) -> Vec<(PluginRecord, InstanceStatus)> {
        let records = self.registry.list().await;
        records
            .into_iter()
            .map(|record| {
                let status = self
                    .instances
                    .get(&record.id)
                    .map(|h| h.shared.snapshot(&record.id, &h.endpoint))
                    .unwrap_or_else(|| InstanceStatus::stopped(&record.id));
                (record, status)
            })
            .collect()
    }

    /// Stop every live instance; used on shutdown.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.instances.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Err(err) = self.stop(&id).await {
                warn!(plugin = %id, error = %err, "stop failed during shutdown");
            }
        }
        if let Some(host) = self.host.lock().await.take() {
            host.cancel.cancel();
            host.endpoint.release();
        }
    }

    fn is_live(&self, id: &str) -> bool {
        self.instances.get(id).is_some_and(|handle| {
            let state = handle.shared.state.read();
            matches!(state.health, HealthState::Starting | HealthState::Ready)
                || (state.health == HealthState::Unhealthy
                    && handle.task.as_ref().is_some_and(|t| !t.is_finished()))
        })
    }

    async fn ensure_host(&self) -> Result<String> {
        let mut host = self.host.lock().await;
        if let Some(handle) = host.as_ref() {
            return Ok(handle.endpoint.as_arg());
        }

        let dir = self.paths.data_home.join("registry");
        let endpoint = allocate_host_endpoint(&dir)?;
        let cancel = CancellationToken::new();
        spawn_host_server(
            &endpoint,
            HostService::new(self.registry.clone()),
            cancel.clone(),
        )?;
        let arg = endpoint.as_arg();
        *host = Some(HostHandle { endpoint, cancel });
        info!(endpoint = %arg, "plugin host service started");
        Ok(arg)
    }
}

/// Structural validation result for `plugin validate`.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub id: String,
    pub version: String,
    pub ok: bool,
    pub issues: Vec<String>,
}

fn process_grace_margin() -> Duration {
    Duration::from_secs(7)
}

fn allocate_host_endpoint(dir: &Path) -> Result<PluginEndpoint> {
    #[cfg(unix)]
    {
        std::fs::create_dir_all(dir)?;
        let socket = dir.join("host.sock");
        let _ = std::fs::remove_file(&socket);
        Ok(PluginEndpoint::Uds(socket))
    }
    #[cfg(not(unix))]
    {
        PluginEndpoint::allocate(dir)
    }
}

/// Resolve a package source to a directory, extracting archives into a
/// scratch directory that lives as long as the returned guard.
fn materialize_package(source: &Path) -> Result<(PathBuf, Option<ScratchDir>)> {
    if source.is_dir() {
        return Ok((source.to_path_buf(), None));
    }
    if archive::is_archive(source) {
        let scratch = ScratchDir::new()?;
        archive::extract(source, &scratch.path)?;
        // Tolerate archives with a single top-level directory.
        let mut entries: Vec<PathBuf> = std::fs::read_dir(&scratch.path)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .collect();
        let root = if entries.len() == 1 && entries[0].is_dir() {
            entries.remove(0)
        } else {
            scratch.path.clone()
        };
        return Ok((root, Some(scratch)));
    }
    Err(PortunixError::new(
        ErrorCode::InvalidInput,
        format!("not a plugin package: {}", source.display()),
    ))
}

/// Temp directory removed on drop.
struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    fn new() -> Result<Self> {
        let path = std::env::temp_dir().join(format!("portunix-pkg-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&path)?;
        Ok(Self { path })
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Monitor task
// ═══════════════════════════════════════════════════════════════════════════════

struct Monitor {
    id: String,
    record: PluginRecord,
    endpoint: PluginEndpoint,
    shared: Arc<InstanceShared>,
    cancel: CancellationToken,
    config: SupervisorConfig,
    data_dir: PathBuf,
    host_endpoint: String,
}

enum Outcome {
    /// Graceful stop requested; the task ends.
    Stopped,
    /// The very first handshake failed; the start operation itself has
    /// already received the error and the task ends.
    FirstStartFailed,
    /// A previously Ready instance failed; restart accounting decides
    /// what happens next.
    Crashed,
}

impl Monitor {
    async fn run(self, first_result: oneshot::Sender<Result<()>>) {
        let mut tracker = RestartTracker::new(&self.config);
        let mut first_result = Some(first_result);

        loop {
            self.shared.set_health(HealthState::Starting);
            match self.run_once(&mut first_result, &mut tracker).await {
                Outcome::Stopped => {
                    self.shared.set_health(HealthState::Stopped);
                    return;
                }
                Outcome::FirstStartFailed => {
                    self.shared.set_health(HealthState::Stopped);
                    return;
                }
                Outcome::Crashed => {
                    self.shared.set_health(HealthState::Unhealthy);
                    if tracker.record_failure(Instant::now()) {
                        self.shared.state.write().quarantined = true;
                        warn!(
                            plugin = %self.id,
                            "plugin quarantined after repeated restart failures"
                        );
                        return;
                    }

                    let backoff = tracker.next_backoff();
                    debug!(plugin = %self.id, ?backoff, "restarting after backoff");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.cancel.cancelled() => {
                            self.shared.set_health(HealthState::Stopped);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// One spawn-handshake-poll cycle.
    async fn run_once(
        &self,
        first_result: &mut Option<oneshot::Sender<Result<()>>>,
        tracker: &mut RestartTracker,
    ) -> Outcome {
        let mut child = match self.spawn_child() {
            Ok(child) => child,
            Err(err) => {
                return self.attempt_failed(first_result, err);
            }
        };
        self.shared.state.write().pid = child.id();

        // Handshake: the plugin must open its server within the window,
        // then answer Initialize.
        let handshake = self.handshake(&mut child).await;
        let mut client = match handshake {
            Ok(client) => client,
            Err(err) => {
                process::terminate(&mut child, Some(Duration::from_secs(1))).await;
                return self.attempt_failed(first_result, err);
            }
        };

        let was_restart = first_result.is_none();
        {
            let mut state = self.shared.state.write();
            state.health = HealthState::Ready;
            state.last_health = Some(Utc::now());
            if was_restart {
                state.restart_count = state.restart_count.saturating_add(1);
            }
        }
        tracker.note_ready();
        if let Some(tx) = first_result.take() {
            let _ = tx.send(Ok(()));
        }
        info!(plugin = %self.id, restart = was_restart, "plugin ready");

        // Poll loop. Three consecutive failed polls mark the instance
        // Unhealthy and trigger a controlled restart.
        let mut consecutive_failures = 0u32;
        let mut interval = tokio::time::interval(self.config.health_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await; // immediate first tick

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.graceful_shutdown(&mut client, &mut child).await;
                    return Outcome::Stopped;
                }
                status = child.wait() => {
                    warn!(plugin = %self.id, code = ?status.ok().and_then(|s| s.code()),
                        "plugin process exited unexpectedly");
                    return Outcome::Crashed;
                }
                _ = interval.tick() => {
                    match client.health_check(self.config.health_interval).await {
                        Ok(ReportedHealth::Serving) | Ok(ReportedHealth::Degraded) => {
                            consecutive_failures = 0;
                            self.shared.state.write().last_health = Some(Utc::now());
                        }
                        Ok(_) | Err(_) => {
                            consecutive_failures += 1;
                            debug!(plugin = %self.id, consecutive_failures, "health poll failed");
                            if consecutive_failures >= self.config.health_failure_threshold {
                                self.shared.set_health(HealthState::Unhealthy);
                                warn!(plugin = %self.id, "instance unhealthy, restarting");
                                process::terminate(&mut child, Some(Duration::from_secs(1))).await;
                                return Outcome::Crashed;
                            }
                        }
                    }
                }
            }
        }
    }

    fn attempt_failed(
        &self,
        first_result: &mut Option<oneshot::Sender<Result<()>>>,
        err: PortunixError,
    ) -> Outcome {
        if let Some(tx) = first_result.take() {
            let _ = tx.send(Err(err));
            Outcome::FirstStartFailed
        } else {
            warn!(plugin = %self.id, error = %err, "restart attempt failed");
            Outcome::Crashed
        }
    }

    fn spawn_child(&self) -> Result<Child> {
        let mut command = Command::new(&self.record.binary_path);
        command
            .arg(self.endpoint.as_arg())
            .current_dir(&self.data_dir)
            .kill_on_drop(true)
            .stdin(std::process::Stdio::null());
        for (key, value) in &self.record.environment {
            command.env(key, value);
        }
        std::fs::create_dir_all(&self.data_dir)?;
        command.spawn().map_err(|e| {
            PortunixError::with_internal(
                ErrorCode::ExternalToolFailed,
                format!("failed to spawn plugin {}", self.id),
                e.to_string(),
            )
        })
    }

    async fn handshake(&self, child: &mut Child) -> Result<PluginClient> {
        let deadline = self.config.handshake_deadline;
        let connect = self.endpoint.connect_within(deadline);
        tokio::pin!(connect);

        let channel = tokio::select! {
            channel = &mut connect => channel?,
            status = child.wait() => {
                return Err(PortunixError::with_internal(
                    ErrorCode::HandshakeTimeout,
                    format!("plugin {} exited before opening its endpoint", self.id),
                    format!("exit status: {:?}", status.map(|s| s.code())),
                ));
            }
        };

        let mut client = PluginClient::new(channel);
        let config_json = json!({
            "id": self.id,
            "data_dir": self.data_dir,
        })
        .to_string();

        let response = client
            .initialize(
                &self.config.api_version,
                &config_json,
                &self.host_endpoint,
                self.record.permissions.granted_strings(),
                deadline,
            )
            .await?;

        // Capabilities outside the manifest's declared set are refused
        // at the door rather than trusted later.
        for capability in &response.capabilities {
            let known = crate::plugins::manifest::PluginCapability::parse(capability);
            if known.map_or(true, |c| !self.record.capabilities.contains(&c)) {
                return Err(PortunixError::new(
                    ErrorCode::PermissionDenied,
                    format!(
                        "plugin {} announced undeclared capability: {}",
                        self.id, capability
                    ),
                ));
            }
        }

        Ok(client)
    }

    async fn graceful_shutdown(&self, client: &mut PluginClient, child: &mut Child) {
        let grace = self.config.shutdown_grace;
        match client.shutdown(grace).await {
            Ok(true) => debug!(plugin = %self.id, "plugin acknowledged shutdown"),
            Ok(false) | Err(_) => {
                debug!(plugin = %self.id, "shutdown RPC unacknowledged, signalling")
            }
        }
        process::terminate(child, Some(grace)).await;
        self.endpoint.release();
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SupervisorConfig;

    fn config() -> SupervisorConfig {
        SupervisorConfig::default()
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_schedule_doubles_and_caps() {
        let mut tracker = RestartTracker::new(&config());
        assert_eq!(tracker.next_backoff(), Duration::from_secs(1));
        tracker.record_failure(Instant::now());
        assert_eq!(tracker.next_backoff(), Duration::from_secs(2));
        tracker.record_failure(Instant::now());
        assert_eq!(tracker.next_backoff(), Duration::from_secs(4));
        for _ in 0..10 {
            tracker.record_failure(Instant::now());
        }
        assert_eq!(tracker.next_backoff(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_resets_on_ready() {
        let mut tracker = RestartTracker::new(&config());
        tracker.record_failure(Instant::now());
        tracker.record_failure(Instant::now());
        tracker.note_ready();
        assert_eq!(tracker.next_backoff(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_quarantine_after_threshold_in_window() {
        let mut tracker = RestartTracker::new(&config());
        for _ in 0..4 {
            assert!(!tracker.record_failure(Instant::now()));
        }
        assert!(tracker.record_failure(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_failures_age_out_of_window() {
        let mut tracker = RestartTracker::new(&config());
        for _ in 0..4 {
            tracker.record_failure(Instant::now());
        }
        // Advance past the window; historical failures no longer count.
        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(!tracker.record_failure(Instant::now()));
    }

    #[test]
    fn test_stopped_snapshot() {
        let status = InstanceStatus::stopped("p1");
        assert_eq!(status.state, HealthState::Stopped);
        assert_eq!(status.restart_count, 0);
        assert!(status.endpoint.is_none());
    }
}
