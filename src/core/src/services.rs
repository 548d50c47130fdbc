//! The service bundle threaded through every component.
//!
//! There are no global singletons: everything a command handler needs
//! is constructed once at process entry and passed explicitly. The only
//! process-wide state is the install-root lock, which is a named
//! filesystem resource, not an in-memory object.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::Config;
use crate::error::Result;
use crate::fsutil;
use crate::install::Installer;
use crate::plugins::{PluginSupervisor, RegistryStore};
use crate::providers::ProviderManager;
use crate::update::UpdateEngine;

/// Everything the command surface needs, built once in `main`.
pub struct Services {
    pub config: Config,
    pub install_root: PathBuf,
    pub registry: RegistryStore,
    pub supervisor: Arc<PluginSupervisor>,
    pub providers: Arc<ProviderManager>,
    /// Root cancellation token; cancelled on Ctrl-C.
    pub cancel: CancellationToken,
}

impl Services {
    /// Build the bundle from loaded configuration.
    pub fn init(config: Config) -> Result<Self> {
        let install_root = match &config.paths.install_root {
            Some(root) => root.clone(),
            None => fsutil::current_exe_dir()?,
        };

        std::fs::create_dir_all(&config.paths.data_home)?;
        let registry = RegistryStore::open(config.paths.registry_file())?;

        let supervisor = Arc::new(PluginSupervisor::new(
            config.supervisor.clone(),
            config.paths.clone(),
            registry.clone(),
        ));
        let providers = Arc::new(ProviderManager::with_default_providers(
            config.providers.clone(),
            &config.paths.data_home,
        ));

        let cancel = CancellationToken::new();

        Ok(Self {
            config,
            install_root,
            registry,
            supervisor,
            providers,
            cancel,
        })
    }

    /// Wire Ctrl-C to the root cancellation token.
    pub fn install_signal_handler(&self) {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling running operations");
                cancel.cancel();
            }
        });
    }

    /// An update engine bound to this install root.
    pub fn update_engine(&self) -> Result<UpdateEngine> {
        UpdateEngine::new(
            self.config.update.clone(),
            self.config.paths.clone(),
            self.install_root.clone(),
        )
    }

    /// An installer bound to this install root.
    pub fn installer(&self) -> Result<Installer> {
        Installer::new(
            self.config.installer.clone(),
            self.config.paths.clone(),
            self.install_root.clone(),
        )
    }
}
