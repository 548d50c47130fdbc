//! Portunix - command-line entry point.
//!
//! Invocation order matters: the dispatcher inspects raw argv first and
//! forwards helper-owned commands (container, docker, podman, vm, mcp)
//! to their co-located binaries before clap ever sees the arguments.
//! Only unowned commands reach the in-process router below.

use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;
use tabled::{settings::Style, Table, Tabled};

use portunix_core::config::Config;
use portunix_core::dispatch::{self, Dispatch};
use portunix_core::error::{PortunixError, Result};
use portunix_core::install::{InstallOptions, InstallReport, StepStatus};
use portunix_core::plugins::HealthState;
use portunix_core::services::Services;
use portunix_core::update::UpdateOutcome;
use portunix_core::{fsutil, telemetry};

// ═══════════════════════════════════════════════════════════════════════════════
// CLI Structure
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Parser)]
#[command(
    name = "portunix",
    version,
    about = "Cross-platform developer environment and fleet management",
    propagate_version = true
)]
struct Cli {
    /// Emit machine-readable JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install packages or profiles from the catalog
    Install {
        /// Package keys or profile names
        #[arg(required = true)]
        targets: Vec<String>,

        /// Variant hint per package, as PACKAGE=VARIANT
        #[arg(long = "variant", value_name = "K=V")]
        variants: Vec<String>,

        /// Print the exact actions without performing them
        #[arg(long)]
        dry_run: bool,

        /// Reinstall even when the probe reports the package present
        #[arg(long)]
        force: bool,

        /// Assume yes for confirmations
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Manage out-of-process plugins
    #[command(subcommand)]
    Plugin(PluginCommands),

    /// Update the main and helper binaries
    Update {
        /// Only report whether a newer release exists
        #[arg(long)]
        check: bool,

        /// Update even when the release is not newer
        #[arg(long)]
        force: bool,
    },

    /// Print the version
    Version,
}

#[derive(Subcommand)]
enum PluginCommands {
    /// List installed plugins and their instance states
    List,
    /// Show one plugin record in full
    Info { id: String },
    /// Install a plugin from a package directory or archive
    Install { source: PathBuf },
    /// Remove a plugin, its binary, and its data directory
    Uninstall { id: String },
    /// Allow a plugin to be started
    Enable { id: String },
    /// Prevent a plugin from being started
    Disable { id: String },
    /// Start a plugin instance
    Start { id: String },
    /// Stop a plugin instance
    Stop { id: String },
    /// Report instance health
    Health { id: String },
    /// Scaffold a new plugin package
    Create {
        id: String,
        /// Directory to create the package under
        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },
    /// Check a package without installing it
    Validate { source: PathBuf },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Entry
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let config = Config::load().unwrap_or_else(|err| {
        eprintln!("{} {}", "warning:".yellow().bold(), err);
        Config::default()
    });
    telemetry::init_logging(&config.logging);

    std::process::exit(run(config, args).await);
}

async fn run(config: Config, args: Vec<String>) -> i32 {
    // Resolve the install root early; both the dispatcher and the
    // update engine work against it.
    let install_root = match &config.paths.install_root {
        Some(root) => root.clone(),
        None => match fsutil::current_exe_dir() {
            Ok(dir) => dir,
            Err(err) => return fail(err),
        },
    };

    // Clean up `.old` siblings a previous Windows commit scheduled for
    // deletion; failures warn but never block.
    for leftover in fsutil::sweep_old_siblings(&install_root) {
        eprintln!(
            "{} could not remove {}",
            "warning:".yellow().bold(),
            leftover.display()
        );
    }

    // Dispatcher first, on raw argv.
    match dispatch::dispatch(&install_root, &args).await {
        Ok(Dispatch::Forwarded(code)) => return code,
        Ok(Dispatch::NotHandled) => {}
        Err(err) => return fail(err),
    }

    let cli = match Cli::try_parse_from(std::iter::once("portunix".to_string()).chain(args)) {
        Ok(cli) => cli,
        Err(err) => {
            // clap renders its own message; exit 2 on usage errors.
            let _ = err.print();
            return if err.use_stderr() { 2 } else { 0 };
        }
    };

    let services = match Services::init(config) {
        Ok(services) => services,
        Err(err) => return fail(err),
    };
    services.install_signal_handler();

    // Resolve a partial self-update left by a killed run before doing
    // anything else against the install root.
    if let Ok(engine) = services.update_engine() {
        match engine.recover().await {
            Ok(Some(recovery)) => {
                eprintln!(
                    "{} previous self-update resolved: {:?}",
                    "notice:".cyan().bold(),
                    recovery
                );
            }
            Ok(None) => {}
            Err(err) => return fail(err),
        }
    }

    let result = match cli.command {
        Commands::Install {
            targets,
            variants,
            dry_run,
            force,
            yes: _,
        } => cmd_install(&services, targets, variants, dry_run, force, cli.json).await,
        Commands::Plugin(command) => cmd_plugin(&services, command, cli.json).await,
        Commands::Update { check, force } => cmd_update(&services, check, force).await,
        Commands::Version => {
            println!("portunix {}", portunix_core::version::current_version());
            Ok(())
        }
    };

    match result {
        Ok(()) => 0,
        Err(err) => fail(err),
    }
}

fn fail(err: PortunixError) -> i32 {
    err.log();
    eprintln!("{} {}", "error:".red().bold(), err);
    err.exit_code()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Install
// ═══════════════════════════════════════════════════════════════════════════════

async fn cmd_install(
    services: &Services,
    targets: Vec<String>,
    variants: Vec<String>,
    dry_run: bool,
    force: bool,
    json: bool,
) -> Result<()> {
    let mut variant_hints = Vec::new();
    for pair in variants {
        let Some((package, variant)) = pair.split_once('=') else {
            return Err(PortunixError::invalid_input(format!(
                "--variant takes PACKAGE=VARIANT, got '{}'",
                pair
            )));
        };
        variant_hints.push((package.to_string(), variant.to_string()));
    }

    let options = InstallOptions {
        dry_run,
        force,
        variant_hints,
    };
    let installer = services.installer()?;
    let report = installer.run(&targets, &options, &services.cancel).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_install_report(&report);
    }

    if report.ok() {
        Ok(())
    } else {
        Err(PortunixError::new(
            portunix_core::ErrorCode::InstallStepFailed,
            "one or more install steps failed",
        ))
    }
}

#[derive(Tabled)]
struct InstallRow {
    #[tabled(rename = "PACKAGE")]
    package: String,
    #[tabled(rename = "VARIANT")]
    variant: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "DETAIL")]
    detail: String,
}

fn print_install_report(report: &InstallReport) {
    let rows: Vec<InstallRow> = report
        .steps
        .iter()
        .map(|step| {
            let variant = if step.fallback {
                format!("{} (fallback)", step.variant)
            } else {
                step.variant.clone()
            };
            let (status, detail) = match &step.status {
                StepStatus::Completed(actions) => {
                    ("completed".green().to_string(), actions.join("; "))
                }
                StepStatus::Skipped(reason) => ("skipped".cyan().to_string(), reason.clone()),
                StepStatus::WouldPerform(actions) => {
                    ("dry-run".yellow().to_string(), actions.join("; "))
                }
                StepStatus::Failed(detail) => ("failed".red().to_string(), detail.clone()),
                StepStatus::NotRun => ("not run".dimmed().to_string(), String::new()),
            };
            InstallRow {
                package: step.package.clone(),
                variant,
                status,
                detail,
            }
        })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{}", table);
}

// ═══════════════════════════════════════════════════════════════════════════════
// Plugin
// ═══════════════════════════════════════════════════════════════════════════════

async fn cmd_plugin(services: &Services, command: PluginCommands, json: bool) -> Result<()> {
    let supervisor = &services.supervisor;
    match command {
        PluginCommands::List => {
            let entries = supervisor.list().await;
            if json {
                let doc: Vec<serde_json::Value> = entries
                    .iter()
                    .map(|(record, status)| {
                        serde_json::json!({ "record": record, "status": status })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&doc)?);
                return Ok(());
            }

            #[derive(Tabled)]
            struct PluginRow {
                #[tabled(rename = "ID")]
                id: String,
                #[tabled(rename = "VERSION")]
                version: String,
                #[tabled(rename = "ENABLED")]
                enabled: String,
                #[tabled(rename = "STATE")]
                state: String,
                #[tabled(rename = "RESTARTS")]
                restarts: String,
            }

            let rows: Vec<PluginRow> = entries
                .iter()
                .map(|(record, status)| PluginRow {
                    id: record.id.clone(),
                    version: record.version.to_string(),
                    enabled: if record.enabled { "yes".into() } else { "no".into() },
                    state: render_health(status.state, status.quarantined),
                    restarts: status.restart_count.to_string(),
                })
                .collect();
            let mut table = Table::new(rows);
            table.with(Style::rounded());
            println!("{}", table);
            Ok(())
        }
        PluginCommands::Info { id } => {
            let record = services.registry.get(&id).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        PluginCommands::Install { source } => {
            let record = supervisor.install(&source).await?;
            println!(
                "{} installed {} {}",
                "ok:".green().bold(),
                record.id,
                record.version
            );
            Ok(())
        }
        PluginCommands::Uninstall { id } => {
            supervisor.uninstall(&id).await?;
            println!("{} uninstalled {}", "ok:".green().bold(), id);
            Ok(())
        }
        PluginCommands::Enable { id } => {
            supervisor.enable(&id).await?;
            println!("{} enabled {}", "ok:".green().bold(), id);
            Ok(())
        }
        PluginCommands::Disable { id } => {
            supervisor.disable(&id).await?;
            println!("{} disabled {}", "ok:".green().bold(), id);
            Ok(())
        }
        PluginCommands::Start { id } => {
            let status = supervisor.start(&id).await?;
            println!(
                "{} {} is {}",
                "ok:".green().bold(),
                id,
                render_health(status.state, status.quarantined)
            );
            // The supervisor lives in this process, so the instance is
            // hosted in the foreground until interrupted.
            println!("supervising {}; press Ctrl-C to stop", id);
            services.cancel.cancelled().await;
            supervisor.stop(&id).await?;
            Ok(())
        }
        PluginCommands::Stop { id } => {
            supervisor.stop(&id).await?;
            println!("{} stopped {}", "ok:".green().bold(), id);
            Ok(())
        }
        PluginCommands::Health { id } => {
            let status = supervisor.health(&id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!(
                    "{}: {} (last check: {}, restarts: {})",
                    id,
                    render_health(status.state, status.quarantined),
                    status
                        .last_health
                        .map_or_else(|| "never".to_string(), |t| t.to_rfc3339()),
                    status.restart_count
                );
            }
            Ok(())
        }
        PluginCommands::Create { id, dir } => {
            let path = supervisor.create_template(&id, &dir)?;
            println!("{} created {}", "ok:".green().bold(), path.display());
            Ok(())
        }
        PluginCommands::Validate { source } => {
            let report = supervisor.validate(&source)?;
            if report.ok {
                println!(
                    "{} {} {} is valid",
                    "ok:".green().bold(),
                    report.id,
                    report.version
                );
                Ok(())
            } else {
                for issue in &report.issues {
                    eprintln!("  {} {}", "-".red(), issue);
                }
                Err(PortunixError::new(
                    portunix_core::ErrorCode::ManifestInvalid,
                    format!("{} failed validation", report.id),
                ))
            }
        }
    }
}

fn render_health(state: HealthState, quarantined: bool) -> String {
    if quarantined {
        return "quarantined".red().to_string();
    }
    match state {
        HealthState::Starting => "starting".yellow().to_string(),
        HealthState::Ready => "ready".green().to_string(),
        HealthState::Unhealthy => "unhealthy".red().to_string(),
        HealthState::Stopped => "stopped".dimmed().to_string(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Update
// ═══════════════════════════════════════════════════════════════════════════════

async fn cmd_update(services: &Services, check: bool, force: bool) -> Result<()> {
    let engine = services.update_engine()?;

    if check {
        let report = engine.check().await?;
        if report.newer {
            println!(
                "update available: {} -> {}",
                report.current,
                report.latest.to_string().green().bold()
            );
        } else {
            println!("portunix {} is up to date", report.current);
        }
        return Ok(());
    }

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner.set_message("updating...");

    let outcome = engine.update(force, &services.cancel).await;
    spinner.finish_and_clear();

    match outcome? {
        UpdateOutcome::AlreadyCurrent { current } => {
            println!("portunix {} is up to date", current);
        }
        UpdateOutcome::Updated {
            from,
            to,
            backup_dir,
        } => {
            println!(
                "{} updated {} -> {} (backup: {})",
                "ok:".green().bold(),
                from,
                to.to_string().green().bold(),
                backup_dir.display()
            );
        }
    }
    Ok(())
}
