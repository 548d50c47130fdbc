//! Bounded concurrency over providers.
//!
//! Each provider gets a fixed-size semaphore (default 4 permits);
//! per-environment operations additionally take an id-keyed lock so
//! that, for example, `stop` can never overlap `snapshotCreate` on the
//! same environment. Operations on distinct environments proceed in
//! parallel up to the pool size.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::config::ProvidersConfig;
use crate::error::{ErrorCode, PortunixError, Result};
use crate::providers::EnvironmentProvider;

/// How long an operation may wait for a pool permit before giving up
/// with a resource error.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(300);

/// A granted slot: provider handle plus the permit and environment lock
/// held for the duration of one operation.
pub struct OperationGuard {
    provider: Arc<dyn EnvironmentProvider>,
    _permit: OwnedSemaphorePermit,
    _env_lock: Option<OwnedMutexGuard<()>>,
}

impl std::fmt::Debug for OperationGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationGuard").finish_non_exhaustive()
    }
}

impl OperationGuard {
    /// The provider to run the operation against.
    pub fn provider(&self) -> &dyn EnvironmentProvider {
        self.provider.as_ref()
    }
}

/// Registry of providers with their worker pools and environment locks.
pub struct ProviderManager {
    config: ProvidersConfig,
    providers: HashMap<&'static str, Arc<dyn EnvironmentProvider>>,
    pools: HashMap<&'static str, Arc<Semaphore>>,
    env_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ProviderManager {
    pub fn new(config: ProvidersConfig) -> Self {
        Self {
            config,
            providers: HashMap::new(),
            pools: HashMap::new(),
            env_locks: DashMap::new(),
        }
    }

    /// Register a provider with its own fixed-size pool.
    pub fn register(&mut self, provider: Arc<dyn EnvironmentProvider>) {
        let name = provider.name();
        self.pools
            .insert(name, Arc::new(Semaphore::new(self.config.pool_size)));
        self.providers.insert(name, provider);
    }

    /// Manager with the full built-in provider set, rooted at the data
    /// home.
    pub fn with_default_providers(config: ProvidersConfig, data_home: &std::path::Path) -> Self {
        let mut manager = Self::new(config);
        manager.register(Arc::new(crate::providers::cli_engine::CliEngine::docker()));
        manager.register(Arc::new(crate::providers::cli_engine::CliEngine::podman()));
        manager.register(Arc::new(crate::providers::qemu::QemuProvider::new(
            data_home.join("vm"),
        )));
        manager.register(Arc::new(
            crate::providers::virtualbox::VirtualBoxProvider::new(data_home.join("vbox")),
        ));
        manager.register(Arc::new(crate::providers::sandboxed::SandboxProvider::new(
            data_home.join("sandbox"),
        )));
        manager
    }

    /// Provider names, registered order not guaranteed.
    pub fn provider_names(&self) -> Vec<&'static str> {
        self.providers.keys().copied().collect()
    }

    /// Look up a provider without acquiring a slot (availability
    /// checks, listings).
    pub fn provider(&self, name: &str) -> Result<Arc<dyn EnvironmentProvider>> {
        self.providers.get(name).cloned().ok_or_else(|| {
            PortunixError::new(
                ErrorCode::ProviderUnavailable,
                format!("unknown provider: {}", name),
            )
        })
    }

    /// Acquire a slot for an operation on `env_id` (or a provider-wide
    /// operation when `env_id` is None).
    ///
    /// Lock order is fixed: pool permit, then the per-environment lock;
    /// no caller waits on a permit while holding an environment lock.
    pub async fn acquire(&self, provider: &str, env_id: Option<&str>) -> Result<OperationGuard> {
        let handle = self.provider(provider)?;
        if !handle.is_available() {
            return Err(PortunixError::new(
                ErrorCode::ProviderUnavailable,
                format!("provider {} is not available on this host", provider),
            )
            .with_hint("install the engine or pick another provider"));
        }

        let pool = self
            .pools
            .get(provider)
            .cloned()
            .ok_or_else(|| PortunixError::internal("provider registered without a pool"))?;

        let permit = tokio::time::timeout(ACQUIRE_TIMEOUT, pool.clone().acquire_owned())
            .await
            .map_err(|_| {
                PortunixError::new(
                    ErrorCode::PoolExhausted,
                    format!("provider {} worker pool is saturated", provider),
                )
            })?
            .map_err(|_| PortunixError::internal("provider pool semaphore closed"))?;

        let env_lock = match env_id {
            Some(id) => {
                let key = format!("{}/{}", provider, id);
                let lock = self
                    .env_locks
                    .entry(key)
                    .or_insert_with(|| Arc::new(Mutex::new(())))
                    .clone();
                Some(lock.lock_owned().await)
            }
            None => None,
        };

        debug!(
            provider,
            env = env_id.unwrap_or("-"),
            available = pool.available_permits(),
            "provider slot acquired"
        );

        Ok(OperationGuard {
            provider: handle,
            _permit: permit,
            _env_lock: env_lock,
        })
    }

    /// Permits currently free for a provider (observability, tests).
    pub fn available_permits(&self, provider: &str) -> Option<usize> {
        self.pools.get(provider).map(|p| p.available_permits())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::sandboxed::SandboxProvider;
    use tempfile::TempDir;

    fn manager(pool_size: usize) -> (ProviderManager, TempDir) {
        let tmp = TempDir::new().unwrap();
        let mut manager = ProviderManager::new(ProvidersConfig {
            pool_size,
            ..Default::default()
        });
        manager.register(Arc::new(SandboxProvider::new(tmp.path().join("sandbox"))));
        (manager, tmp)
    }

    #[tokio::test]
    async fn test_pool_bounds_concurrency() {
        let (manager, _tmp) = manager(2);

        let first = manager.acquire("sandbox", Some("a")).await.unwrap();
        let second = manager.acquire("sandbox", Some("b")).await.unwrap();
        assert_eq!(manager.available_permits("sandbox"), Some(0));

        drop(first);
        drop(second);
        assert_eq!(manager.available_permits("sandbox"), Some(2));
    }

    #[tokio::test]
    async fn test_same_environment_is_serialised() {
        let (manager, _tmp) = manager(4);

        let guard = manager.acquire("sandbox", Some("env1")).await.unwrap();
        // A second operation on the same environment must wait.
        let pending = tokio::time::timeout(
            Duration::from_millis(100),
            manager.acquire("sandbox", Some("env1")),
        )
        .await;
        assert!(pending.is_err(), "same-id operation should be blocked");

        drop(guard);
        let granted = tokio::time::timeout(
            Duration::from_millis(100),
            manager.acquire("sandbox", Some("env1")),
        )
        .await;
        assert!(granted.is_ok());
    }

    #[tokio::test]
    async fn test_distinct_environments_run_in_parallel() {
        let (manager, _tmp) = manager(4);
        let _a = manager.acquire("sandbox", Some("a")).await.unwrap();
        let b = tokio::time::timeout(
            Duration::from_millis(100),
            manager.acquire("sandbox", Some("b")),
        )
        .await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let (manager, _tmp) = manager(1);
        let err = manager.acquire("warpdrive", None).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProviderUnavailable);
    }
}
