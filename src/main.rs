//! natkeeper - NAT port forwards for Proxmox LXC containers
//!
//! Command-line front end to the rule lifecycle manager and the resync engine.
//!
//! # Usage
//!
//! ```bash
//! natkeeper list                                    # All rules, newest first
//! natkeeper list --node pve1 --vmid 100             # Rules of one container
//! natkeeper create --node pve1 --vmid 100 --host-port 2222 --container-port 22
//! natkeeper update 7 --host-port 2022               # Move a forward
//! natkeeper update 7 --disable                      # Keep the rule, drop the entry
//! natkeeper delete 7
//! natkeeper resync                                  # Rebuild every entry
//! natkeeper resync --every 300                      # ... repeatedly, until Ctrl-C
//! ```
//!
//! Add `--json` to any command for machine-readable output.

use clap::{Parser, Subcommand};
use natkeeper::audit::{AuditLog, EventType};
use natkeeper::config::{self, AppConfig};
use natkeeper::core::error::IptablesErrorPattern;
use natkeeper::core::lifecycle::EntryEffect;
use natkeeper::elevation::ElevationMethod;
use natkeeper::utils::{ensure_dirs, get_state_dir, truncate_string};
use natkeeper::{
    IptablesCodec, JsonRuleStore, NatFirewall, NatRule, NatService, NewRule, Protocol,
    PveshLocator, ResyncReport, RulePatch, RuleScope, SystemExecutor, WatchExit,
};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, warn};

shadow_rs::shadow!(build);

const LONG_VERSION: &str = shadow_rs::formatcp!(
    "{} (commit {}{}, built {})",
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    if build::GIT_CLEAN { "" } else { "-dirty" },
    build::BUILD_TIME
);

type Service = NatService<JsonRuleStore, PveshLocator<SystemExecutor>, SystemExecutor>;

#[derive(Parser)]
#[command(name = "natkeeper")]
#[command(about = "Keeps iptables DNAT port forwards for LXC containers in sync", long_about = None)]
#[command(version, long_version = LONG_VERSION)]
struct Cli {
    /// Config file (default: <data_dir>/config.json)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Rules(RuleCommands),
    /// Print the effective configuration
    Config {
        /// Write the effective configuration to the config file
        #[arg(long)]
        write: bool,
    },
}

#[derive(Subcommand)]
enum RuleCommands {
    /// List rules, newest first
    List {
        #[arg(long, requires = "vmid")]
        node: Option<String>,
        #[arg(long, requires = "node")]
        vmid: Option<u32>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Show one rule
    Show { id: u64 },
    /// Create a forward and install its entry
    Create {
        #[arg(long)]
        node: String,
        #[arg(long)]
        vmid: u32,
        #[arg(long)]
        host_port: u16,
        #[arg(long)]
        container_port: u16,
        /// tcp or udp
        #[arg(long, default_value_t = Protocol::Tcp)]
        protocol: Protocol,
        #[arg(long)]
        description: Option<String>,
    },
    /// Change a rule; only the given fields are touched
    Update {
        id: u64,
        #[arg(long)]
        host_port: Option<u16>,
        #[arg(long)]
        container_port: Option<u16>,
        #[arg(long)]
        protocol: Option<Protocol>,
        /// An empty string clears the description
        #[arg(long)]
        description: Option<String>,
        #[arg(long, conflicts_with = "disable")]
        enable: bool,
        #[arg(long)]
        disable: bool,
    },
    /// Delete a rule and remove its entry
    Delete { id: u64 },
    /// Clear every owned entry and re-apply all enabled rules
    Resync {
        /// Repeat every SECS seconds until interrupted (0 = config interval)
        #[arg(long, value_name = "SECS")]
        every: Option<u64>,
    },
}

fn main() -> ExitCode {
    let _ = ensure_dirs();
    init_logging();
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(handle_cli(cli)) {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging() {
    if let Some(log_path) = get_state_dir().map(|dir| dir.join("natkeeper.log"))
        && let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
    {
        tracing_subscriber::fmt()
            .with_writer(file)
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .init();
    }
}

async fn handle_cli(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let config = config::load_config(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Config { write } => show_config(&config, cli.config, write, cli.json).await,
        Commands::Rules(command) => run_rule_command(&config, command, cli.json).await,
    }
}

async fn run_rule_command(
    config: &AppConfig,
    command: RuleCommands,
    json: bool,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let service = build_service(config).await?;
    let audit = open_audit_log(config);

    match command {
        RuleCommands::List {
            node,
            vmid,
            offset,
            limit,
        } => {
            let scope = match (node, vmid) {
                (Some(node), Some(vmid)) => RuleScope::Container { node, vmid },
                _ => RuleScope::All,
            };
            let page = service.list_rules(&scope, offset, limit).await?;
            if json {
                print_json(&page)?;
            } else {
                print_rule_table(&page.rules);
                println!("{} of {} rules", page.rules.len(), page.total);
            }
        }
        RuleCommands::Show { id } => {
            let rule = service.get_rule(id).await?;
            if json {
                print_json(&rule)?;
            } else {
                print_rule_table(std::slice::from_ref(&rule));
            }
        }
        RuleCommands::Create {
            node,
            vmid,
            host_port,
            container_port,
            protocol,
            description,
        } => {
            let result = service
                .create_rule(NewRule {
                    node,
                    vmid,
                    host_port,
                    container_port,
                    protocol,
                    description,
                })
                .await;
            if let Some(audit) = &audit {
                audit.log_mutation(EventType::CreateRule, None, &result).await;
            }
            let mutation = result?;
            if json {
                print_json(&mutation)?;
            } else {
                report_mutation(&mutation.message, &mutation.new_entry, mutation.status.is_degraded());
                print_rule_table(std::slice::from_ref(&mutation.rule));
            }
        }
        RuleCommands::Update {
            id,
            host_port,
            container_port,
            protocol,
            description,
            enable,
            disable,
        } => {
            let enabled = match (enable, disable) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            let patch = RulePatch {
                host_port,
                container_port,
                protocol,
                description,
                enabled,
            };
            let result = service.update_rule(id, patch).await;
            if let Some(audit) = &audit {
                audit
                    .log_mutation(EventType::UpdateRule, Some(id), &result)
                    .await;
            }
            let mutation = result?;
            if json {
                print_json(&mutation)?;
            } else {
                let failed_entry = if mutation.new_entry.is_failed() {
                    &mutation.new_entry
                } else {
                    &mutation.old_entry
                };
                report_mutation(&mutation.message, failed_entry, mutation.status.is_degraded());
                print_rule_table(std::slice::from_ref(&mutation.rule));
            }
        }
        RuleCommands::Delete { id } => {
            let result = service.delete_rule(id).await;
            if let Some(audit) = &audit {
                audit.log_deletion(id, &result).await;
            }
            let deletion = result?;
            if json {
                print_json(&deletion)?;
            } else {
                report_mutation(&deletion.message, &deletion.entry, deletion.entry.is_failed());
            }
        }
        RuleCommands::Resync { every } => {
            let Some(every) = every else {
                let report = service.resync_all().await;
                return Ok(finish_resync(&report, audit.as_ref(), json).await);
            };

            let interval = if every == 0 {
                config.resync_interval()
            } else {
                Duration::from_secs(every.max(config::MIN_RESYNC_INTERVAL_SECS))
            };
            info!("Watch mode: resync every {}s", interval.as_secs());
            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Cannot listen for Ctrl-C ({e}), watch mode runs until killed");
                    std::future::pending::<()>().await;
                }
            };
            let exit = service
                .watch(interval, shutdown, async |report: ResyncReport| {
                    finish_resync(&report, audit.as_ref(), json).await;
                })
                .await;
            if exit == WatchExit::Interrupted {
                eprintln!("Interrupted during a resync pass; run `natkeeper resync` to restore any missing entries.");
                return Ok(ExitCode::FAILURE);
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn build_service(config: &AppConfig) -> Result<Service, Box<dyn std::error::Error>> {
    let elevation = ElevationMethod::detect()?;
    info!("Using elevation method: {elevation}");
    let executor = SystemExecutor::new(elevation);

    let codec = IptablesCodec::new(config.iptables_argv(), config.comment_marker.clone());
    let firewall =
        NatFirewall::new(executor.clone(), codec).with_timeout(config.command_timeout());
    let locator =
        PveshLocator::new(executor, config.pvesh_argv()).with_timeout(config.command_timeout());

    let store_path = config
        .resolved_store_path()
        .ok_or("Cannot determine the data directory; set store_path in the config file")?;
    let store = JsonRuleStore::open(&store_path).await?;
    info!("Rule store: {}", store_path.display());

    Ok(NatService::new(store, locator, firewall))
}

fn open_audit_log(config: &AppConfig) -> Option<AuditLog> {
    if !config.audit_log {
        return None;
    }
    match AuditLog::new() {
        Ok(audit) => Some(audit),
        Err(e) => {
            warn!("Audit log disabled: {e}");
            None
        }
    }
}

async fn show_config(
    config: &AppConfig,
    path: Option<PathBuf>,
    write: bool,
    json: bool,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let path = path.or_else(config::default_config_path);

    if write {
        let path = path
            .as_deref()
            .ok_or("Cannot determine the config location; pass --config")?;
        config::save_config(config, path).await?;
        if !json {
            println!("Wrote {}", path.display());
        }
    }

    if json {
        print_json(config)?;
    } else {
        if let Some(path) = &path {
            println!("config file:          {}", path.display());
        }
        println!("iptables command:     {}", config.iptables_command);
        println!("pvesh command:        {}", config.pvesh_command);
        println!("command timeout:      {}s", config.command_timeout_secs);
        println!("comment marker:       {}", config.comment_marker);
        match config.resolved_store_path() {
            Some(store) => println!("rule store:           {}", store.display()),
            None => println!("rule store:           (unknown)"),
        }
        println!("resync interval:      {}s", config.resync_interval_secs);
        println!("audit log:            {}", config.audit_log);
    }
    Ok(ExitCode::SUCCESS)
}

async fn finish_resync(report: &ResyncReport, audit: Option<&AuditLog>, json: bool) -> ExitCode {
    if let Some(audit) = audit {
        audit.log_resync(report).await;
    }

    if json {
        if let Err(e) = print_json(report) {
            eprintln!("Error: {e}");
        }
    } else {
        let stats = &report.stats;
        if report.ok {
            println!("✓ {}", report.message);
        } else {
            eprintln!("✗ {}", report.message);
        }
        if stats.skipped_lines > 0 {
            eprintln!(
                "  {} marked lines could not be parsed and were left in place",
                stats.skipped_lines
            );
        }
        if !stats.rules_disabled_due_to_error_ids.is_empty() {
            let ids: Vec<String> = stats
                .rules_disabled_due_to_error_ids
                .iter()
                .map(u64::to_string)
                .collect();
            eprintln!("  disabled rules: {}", ids.join(", "));
        }
    }

    if report.ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Prints the outcome message; degraded results go to stderr with hints.
fn report_mutation(message: &str, entry: &EntryEffect, degraded: bool) {
    if !degraded {
        println!("✓ {message}");
        return;
    }

    eprintln!("⚠ {message}");
    if let EntryEffect::Failed(reason) = entry {
        let translation = IptablesErrorPattern::match_error(reason);
        eprintln!("  {}", translation.user_message);
        for suggestion in translation.suggestions {
            eprintln!("  • {suggestion}");
        }
    }
}

fn print_rule_table(rules: &[NatRule]) {
    println!(
        "{:>6}  {:<12} {:>9}  {:<5} {:>5} -> {:<24} {:<8} DESCRIPTION",
        "ID", "NODE", "VMID", "PROTO", "HOST", "DESTINATION", "STATE"
    );
    for rule in rules {
        println!(
            "{:>6}  {:<12} {:>9}  {:<5} {:>5} -> {:<24} {:<8} {}",
            rule.id,
            truncate_string(&rule.node, 12),
            rule.vmid,
            rule.protocol,
            rule.host_port,
            rule.destination(),
            if rule.enabled { "enabled" } else { "disabled" },
            rule.description
                .as_deref()
                .map(|d| truncate_string(d, 40))
                .unwrap_or_default()
        );
    }
}

fn print_json<T: Serialize>(value: &T) -> serde_json::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
