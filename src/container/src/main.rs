//! ptx-container - the helper binary owning the container and VM
//! command families.
//!
//! The dispatcher forwards the full argument tail, so the owning token
//! (`container`, `docker`, `podman`, `vm`) arrives as this binary's
//! first argument and becomes its top-level subcommand. All real work
//! happens in portunix-core's provider abstraction; this binary is a
//! thin argument adapter over it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use portunix_core::config::Config;
use portunix_core::error::{PortunixError, Result};
use portunix_core::providers::{
    EnvironmentSpec, ExecRequest, IngressCredentials, Mount, PortMap, ProviderManager,
    ResourceLimits,
};
use portunix_core::services::Services;
use portunix_core::telemetry;

// ═══════════════════════════════════════════════════════════════════════════════
// CLI Structure
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Parser)]
#[command(
    name = "ptx-container",
    version,
    about = "Container and VM lifecycle for Portunix",
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    family: Family,
}

#[derive(Subcommand)]
enum Family {
    /// Engine-agnostic container commands (picks docker, then podman)
    #[command(subcommand)]
    Container(EnvCommands),

    /// Docker-backed environments
    #[command(subcommand)]
    Docker(EnvCommands),

    /// Podman-backed environments
    #[command(subcommand)]
    Podman(EnvCommands),

    /// Virtual machines (QEMU by default, VirtualBox via --provider)
    #[command(subcommand)]
    Vm(EnvCommands),
}

#[derive(Subcommand)]
enum EnvCommands {
    /// Create an environment
    Create(CreateArgs),
    /// Start an environment
    Start { id: String },
    /// Stop an environment gracefully, then force
    Stop {
        id: String,
        /// Grace period in seconds before force
        #[arg(long, default_value = "10")]
        grace: u64,
    },
    /// Remove an environment
    Destroy {
        id: String,
        /// Also remove data volumes
        #[arg(long)]
        purge: bool,
    },
    /// Show the environment state
    Status { id: String },
    /// Run a command inside the environment
    Exec {
        id: String,
        /// Working directory inside the environment
        #[arg(short = 'w', long)]
        workdir: Option<String>,
        /// Environment variables, K=V
        #[arg(short = 'e', long = "env")]
        env: Vec<String>,
        /// Command and arguments
        #[arg(required = true, last = true)]
        argv: Vec<String>,
    },
    /// Copy a local path into the environment
    CopyIn {
        id: String,
        local: PathBuf,
        remote: String,
    },
    /// Copy a path out of the environment
    CopyOut {
        id: String,
        remote: String,
        local: PathBuf,
    },
    /// Snapshot operations (VM providers)
    #[command(subcommand)]
    Snapshot(SnapshotCommands),
    /// Deploy the portunix binary set into the environment over SSH
    Deploy(DeployArgs),
}

#[derive(Subcommand)]
enum SnapshotCommands {
    /// Take a snapshot
    Create { id: String, label: String },
    /// List snapshots
    List { id: String },
    /// Revert to a snapshot (stops the environment first)
    Revert { id: String, label: String },
    /// Delete a snapshot
    Delete { id: String, label: String },
}

#[derive(Args)]
struct CreateArgs {
    /// Environment name (stable id)
    name: String,

    /// Base image or VM template
    #[arg(long)]
    image: String,

    /// Override the provider within the family
    #[arg(long)]
    provider: Option<String>,

    /// Mounts, HOST:GUEST[:ro]
    #[arg(long = "mount")]
    mounts: Vec<String>,

    /// Port mappings, HOST:GUEST
    #[arg(long = "port")]
    ports: Vec<String>,

    /// Environment variables, K=V
    #[arg(short = 'e', long = "env")]
    env: Vec<String>,

    /// CPU limit
    #[arg(long)]
    cpus: Option<f64>,

    /// Memory limit in megabytes
    #[arg(long)]
    memory: Option<u64>,

    /// Ingress user for SSH-style access
    #[arg(long)]
    user: Option<String>,

    /// Public key file installed for the ingress user
    #[arg(long)]
    key_file: Option<PathBuf>,
}

#[derive(Args)]
struct DeployArgs {
    id: String,

    /// Binaries to deploy; defaults to the current install root set
    binaries: Vec<PathBuf>,

    /// Remote directory
    #[arg(long, default_value = "/opt/portunix")]
    remote_dir: String,

    /// Ingress user created if missing
    #[arg(long, default_value = "portunix")]
    user: String,

    /// Public key file written to authorized_keys
    #[arg(long)]
    key_file: Option<PathBuf>,

    /// Override the provider within the family
    #[arg(long)]
    provider: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Entry
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::main]
async fn main() {
    let config = Config::load().unwrap_or_else(|err| {
        eprintln!("{} {}", "warning:".yellow().bold(), err);
        Config::default()
    });
    telemetry::init_logging(&config.logging);

    let cli = Cli::parse();
    let services = match Services::init(config) {
        Ok(services) => services,
        Err(err) => std::process::exit(fail(err)),
    };
    services.install_signal_handler();

    let code = match run(&services, cli).await {
        Ok(()) => 0,
        Err(err) => fail(err),
    };
    std::process::exit(code);
}

fn fail(err: PortunixError) -> i32 {
    eprintln!("{} {}", "error:".red().bold(), err);
    err.exit_code()
}

async fn run(services: &Services, cli: Cli) -> Result<()> {
    let (provider, command) = match cli.family {
        Family::Container(cmd) => (default_container_provider(&services.providers, &cmd), cmd),
        Family::Docker(cmd) => ("docker".to_string(), cmd),
        Family::Podman(cmd) => ("podman".to_string(), cmd),
        Family::Vm(cmd) => (vm_provider(&cmd), cmd),
    };
    execute(services, &provider, command).await
}

/// `container` prefers docker and falls back to podman, unless the
/// command carries an explicit --provider.
fn default_container_provider(manager: &ProviderManager, command: &EnvCommands) -> String {
    if let Some(explicit) = explicit_provider(command) {
        return explicit;
    }
    for candidate in ["docker", "podman"] {
        if manager
            .provider(candidate)
            .map(|p| p.is_available())
            .unwrap_or(false)
        {
            return candidate.to_string();
        }
    }
    "sandbox".to_string()
}

fn vm_provider(command: &EnvCommands) -> String {
    explicit_provider(command).unwrap_or_else(|| "qemu".to_string())
}

fn explicit_provider(command: &EnvCommands) -> Option<String> {
    match command {
        EnvCommands::Create(args) => args.provider.clone(),
        EnvCommands::Deploy(args) => args.provider.clone(),
        _ => None,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Execution
// ═══════════════════════════════════════════════════════════════════════════════

async fn execute(services: &Services, provider: &str, command: EnvCommands) -> Result<()> {
    let manager = &services.providers;
    let cancel = &services.cancel;

    match command {
        EnvCommands::Create(args) => {
            let spec = build_spec(&args)?;
            let guard = manager.acquire(provider, Some(&args.name)).await?;
            let id = guard.provider().create(&spec, cancel).await?;
            println!("{} created {} ({})", "ok:".green().bold(), id, provider);
        }
        EnvCommands::Start { id } => {
            let guard = manager.acquire(provider, Some(&id)).await?;
            guard.provider().start(&id, cancel).await?;
            println!("{} started {}", "ok:".green().bold(), id);
        }
        EnvCommands::Stop { id, grace } => {
            let guard = manager.acquire(provider, Some(&id)).await?;
            guard
                .provider()
                .stop(&id, Duration::from_secs(grace), cancel)
                .await?;
            println!("{} stopped {}", "ok:".green().bold(), id);
        }
        EnvCommands::Destroy { id, purge } => {
            let guard = manager.acquire(provider, Some(&id)).await?;
            guard.provider().destroy(&id, purge, cancel).await?;
            println!("{} destroyed {}", "ok:".green().bold(), id);
        }
        EnvCommands::Status { id } => {
            let guard = manager.acquire(provider, Some(&id)).await?;
            let state = guard.provider().state(&id, cancel).await?;
            println!("{}: {:?}", id, state);
        }
        EnvCommands::Exec {
            id,
            workdir,
            env,
            argv,
        } => {
            let request = ExecRequest {
                argv,
                stdin: None,
                work_dir: workdir,
                env: parse_env_pairs(&env)?,
            };
            let guard = manager.acquire(provider, Some(&id)).await?;
            let output = guard.provider().exec(&id, &request, cancel).await?;
            print!("{}", output.stdout);
            eprint!("{}", output.stderr);
            if let Some(code) = output.exit_code {
                if code != 0 {
                    std::process::exit(code);
                }
            }
        }
        EnvCommands::CopyIn { id, local, remote } => {
            let guard = manager.acquire(provider, Some(&id)).await?;
            guard.provider().copy_in(&id, &local, &remote, cancel).await?;
            println!("{} copied {} -> {}:{}", "ok:".green().bold(), local.display(), id, remote);
        }
        EnvCommands::CopyOut { id, remote, local } => {
            let guard = manager.acquire(provider, Some(&id)).await?;
            guard.provider().copy_out(&id, &remote, &local, cancel).await?;
            println!("{} copied {}:{} -> {}", "ok:".green().bold(), id, remote, local.display());
        }
        EnvCommands::Snapshot(snapshot) => match snapshot {
            SnapshotCommands::Create { id, label } => {
                let guard = manager.acquire(provider, Some(&id)).await?;
                let info = guard.provider().snapshot_create(&id, &label, cancel).await?;
                println!("{} snapshot {} of {}", "ok:".green().bold(), info.label, id);
            }
            SnapshotCommands::List { id } => {
                let guard = manager.acquire(provider, Some(&id)).await?;
                let snapshots = guard.provider().snapshot_list(&id, cancel).await?;

                #[derive(Tabled)]
                struct SnapshotRow {
                    #[tabled(rename = "LABEL")]
                    label: String,
                    #[tabled(rename = "CREATED")]
                    created: String,
                }
                let rows: Vec<SnapshotRow> = snapshots
                    .into_iter()
                    .map(|s| SnapshotRow {
                        label: s.label,
                        created: s
                            .created_at
                            .map_or_else(|| "-".to_string(), |t| t.to_rfc3339()),
                    })
                    .collect();
                let mut table = Table::new(rows);
                table.with(Style::rounded());
                println!("{}", table);
            }
            SnapshotCommands::Revert { id, label } => {
                let guard = manager.acquire(provider, Some(&id)).await?;
                guard.provider().snapshot_revert(&id, &label, cancel).await?;
                println!("{} reverted {} to {}", "ok:".green().bold(), id, label);
            }
            SnapshotCommands::Delete { id, label } => {
                let guard = manager.acquire(provider, Some(&id)).await?;
                guard.provider().snapshot_delete(&id, &label, cancel).await?;
                println!("{} deleted snapshot {} of {}", "ok:".green().bold(), label, id);
            }
        },
        EnvCommands::Deploy(args) => {
            let binaries = if args.binaries.is_empty() {
                default_binary_set(services)?
            } else {
                args.binaries.clone()
            };
            let credentials = IngressCredentials {
                user: args.user.clone(),
                public_key: read_key_file(args.key_file.as_deref())?,
                port: None,
            };
            let guard = manager.acquire(provider, Some(&args.id)).await?;
            guard
                .provider()
                .ssh_deploy(&args.id, &binaries, &args.remote_dir, &credentials, cancel)
                .await?;
            println!(
                "{} deployed {} binaries into {}",
                "ok:".green().bold(),
                binaries.len(),
                args.id
            );
        }
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Argument plumbing
// ═══════════════════════════════════════════════════════════════════════════════

fn build_spec(args: &CreateArgs) -> Result<EnvironmentSpec> {
    let mut mounts = Vec::new();
    for raw in &args.mounts {
        let mut parts = raw.splitn(3, ':');
        let (Some(host), Some(guest)) = (parts.next(), parts.next()) else {
            return Err(PortunixError::invalid_input(format!(
                "--mount takes HOST:GUEST[:ro], got '{}'",
                raw
            )));
        };
        mounts.push(Mount {
            host: PathBuf::from(host),
            guest: guest.to_string(),
            read_only: parts.next() == Some("ro"),
        });
    }

    let mut ports = Vec::new();
    for raw in &args.ports {
        let parsed = raw
            .split_once(':')
            .and_then(|(h, g)| Some(PortMap {
                host: h.parse().ok()?,
                guest: g.parse().ok()?,
            }));
        let Some(port) = parsed else {
            return Err(PortunixError::invalid_input(format!(
                "--port takes HOST:GUEST, got '{}'",
                raw
            )));
        };
        ports.push(port);
    }

    let credentials = match &args.user {
        Some(user) => Some(IngressCredentials {
            user: user.clone(),
            public_key: read_key_file(args.key_file.as_deref())?,
            port: None,
        }),
        None => None,
    };

    Ok(EnvironmentSpec {
        name: args.name.clone(),
        image: args.image.clone(),
        mounts,
        ports,
        env: parse_env_pairs(&args.env)?,
        resources: ResourceLimits {
            cpus: args.cpus,
            memory_mb: args.memory,
        },
        credentials,
    })
}

fn parse_env_pairs(pairs: &[String]) -> Result<HashMap<String, String>> {
    let mut env = HashMap::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(PortunixError::invalid_input(format!(
                "--env takes K=V, got '{}'",
                pair
            )));
        };
        env.insert(key.to_string(), value.to_string());
    }
    Ok(env)
}

fn read_key_file(path: Option<&std::path::Path>) -> Result<Option<String>> {
    match path {
        Some(path) => Ok(Some(std::fs::read_to_string(path)?.trim().to_string())),
        None => Ok(None),
    }
}

/// The main + helper binaries next to this executable.
fn default_binary_set(services: &Services) -> Result<Vec<PathBuf>> {
    let mut binaries = Vec::new();
    for name in ["portunix", "ptx-container", "ptx-mcp"] {
        let path = services
            .install_root
            .join(format!("{}{}", name, portunix_core::fsutil::EXE_SUFFIX));
        if path.is_file() {
            binaries.push(path);
        }
    }
    if binaries.is_empty() {
        return Err(PortunixError::invalid_input(
            "no portunix binaries found next to this executable; pass paths explicitly",
        ));
    }
    Ok(binaries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_pairs() {
        let env = parse_env_pairs(&["A=1".to_string(), "B=two=parts".to_string()]).unwrap();
        assert_eq!(env.get("A").unwrap(), "1");
        assert_eq!(env.get("B").unwrap(), "two=parts");
        assert!(parse_env_pairs(&["broken".to_string()]).is_err());
    }

    #[test]
    fn test_build_spec_mount_parsing() {
        let args = CreateArgs {
            name: "dev".into(),
            image: "ubuntu:24.04".into(),
            provider: None,
            mounts: vec!["/src:/work:ro".into(), "/data:/data".into()],
            ports: vec!["8080:80".into()],
            env: vec![],
            cpus: Some(2.0),
            memory: Some(4096),
            user: None,
            key_file: None,
        };
        let spec = build_spec(&args).unwrap();
        assert_eq!(spec.mounts.len(), 2);
        assert!(spec.mounts[0].read_only);
        assert!(!spec.mounts[1].read_only);
        assert_eq!(spec.ports[0].host, 8080);
        assert_eq!(spec.resources.memory_mb, Some(4096));
    }

    #[test]
    fn test_bad_port_rejected() {
        let args = CreateArgs {
            name: "dev".into(),
            image: "x".into(),
            provider: None,
            mounts: vec![],
            ports: vec!["eighty:80".into()],
            env: vec![],
            cpus: None,
            memory: None,
            user: None,
            key_file: None,
        };
        assert!(build_spec(&args).is_err());
    }
}
