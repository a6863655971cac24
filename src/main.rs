use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{debug, info, warn};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use nft_policy::compiler::step::CompiledRule;
use nft_policy::emit::text::rule_command;
use nft_policy::emit::{Backend, BatchBackend, TextBackend};
use nft_policy::lists::{ListKind, ListScript};
use nft_policy::models::config::{default_list_script, AppConfig, BackendKind};
use nft_policy::models::policy::{Action, App, Directive, Policy, TimeWindow};
use nft_policy::models::ruleset::{ChainPolicy, ChainSpec, ChainType, Family, Hook, TableSpec};
use nft_policy::netfilter::MemoryNetfilter;
use nft_policy::ruleset::RulesetManager;
use nft_policy::utils::command::ProcessRunner;
use nft_policy::utils::logging;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Compiles network-access policies into nftables rules")]
struct Args {
    #[clap(subcommand)]
    command: Option<Command>,

    /// Source regions (input interfaces), comma separated
    #[clap(long, value_delimiter = ',')]
    sregion: Vec<String>,

    /// Destination regions (output interfaces), comma separated
    #[clap(long, value_delimiter = ',')]
    dregion: Vec<String>,

    /// Source addresses: literals, A-B ranges or A/n blocks, comma separated
    #[clap(long, value_delimiter = ',')]
    sip: Vec<String>,

    /// Destination addresses, comma separated
    #[clap(long, value_delimiter = ',')]
    dip: Vec<String>,

    /// Source MAC address
    #[clap(long, default_value = "")]
    smac: String,

    /// Destination MAC address
    #[clap(long, default_value = "")]
    dmac: String,

    /// Transport protocol (tcp, udp, icmp, ...)
    #[clap(long, default_value = "")]
    protocol: String,

    /// Source port
    #[clap(long, default_value = "0")]
    sport: u16,

    /// Destination port
    #[clap(long, default_value = "0")]
    dport: u16,

    /// Application name (informational)
    #[clap(long, default_value = "")]
    app: String,

    /// Time window, e.g. "month=1,10-15;hour=18:00:00-19:00:00" (repeatable)
    #[clap(long)]
    time: Vec<String>,

    /// Action for matching packets (allow, warn, drop)
    #[clap(long, default_value = "allow")]
    action: Action,

    /// Log prefix; no logging when empty
    #[clap(long, default_value = "")]
    logtag: String,

    /// Request detailed logging
    #[clap(long)]
    log_detail: bool,

    /// Lifecycle directive; "init" flushes the ruleset first
    #[clap(long, default_value = "")]
    policy: Directive,

    /// JSON file with one policy or an array of policies (replaces the policy flags)
    #[clap(long)]
    policy_file: Option<PathBuf>,

    /// How rules are applied
    #[clap(long, value_enum, default_value = "text")]
    backend: BackendKind,

    /// Address family of the table
    #[clap(long, default_value = "ip")]
    family: Family,

    /// Table name
    #[clap(long, default_value = "filter")]
    table: String,

    /// Base chain name
    #[clap(long, default_value = "forward")]
    chain: String,

    /// Base chain type
    #[clap(long, default_value = "filter")]
    chain_type: ChainType,

    /// Hook the chain attaches to
    #[clap(long, default_value = "forward")]
    hook: Hook,

    /// Chain priority
    #[clap(long, default_value = "0", allow_negative_numbers = true)]
    priority: i32,

    /// Verdict when no rule matches
    #[clap(long, default_value = "accept")]
    chain_policy: ChainPolicy,

    /// nft executable
    #[clap(long, default_value = "nft")]
    nft_path: String,

    /// List maintenance script (default: shell/suricata_vtysh.sh next to the executable)
    #[clap(long)]
    list_script: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error, off)
    #[clap(long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the version
    Version,
    /// Maintain the inspection engine's allow list
    Whitelist {
        #[clap(subcommand)]
        op: ListOp,
    },
    /// Maintain the inspection engine's deny list
    Blacklist {
        #[clap(subcommand)]
        op: ListOp,
    },
    /// Control the inspection engine
    Suricata {
        #[clap(subcommand)]
        op: SuricataOp,
    },
}

#[derive(Subcommand, Debug)]
enum ListOp {
    /// Append a rule
    Add { rule: String },
    /// Clear the list
    Del,
}

#[derive(Subcommand, Debug)]
enum SuricataOp {
    /// Re-read the lists
    Reload,
}

/// Contents of a policy file
#[derive(Deserialize)]
#[serde(untagged)]
enum PolicyFile {
    Many(Vec<Policy>),
    One(Policy),
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logger with specified level
    logging::init_logger(logging::get_log_level(&args.log_level));

    let config = AppConfig {
        backend: args.backend,
        table: TableSpec::new(args.family, args.table.as_str()),
        chain: ChainSpec {
            name: args.chain.clone(),
            chain_type: args.chain_type,
            hook: args.hook,
            priority: args.priority,
            policy: args.chain_policy,
        },
        nft_path: args.nft_path.clone(),
        list_script: args.list_script.clone().unwrap_or_else(default_list_script),
    };
    debug!("Configuration: {:?}", config);

    match &args.command {
        Some(Command::Version) => {
            println!("nft-policy {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Some(Command::Whitelist { op }) => return run_list(&config, ListKind::Whitelist, op),
        Some(Command::Blacklist { op }) => return run_list(&config, ListKind::Blacklist, op),
        Some(Command::Suricata {
            op: SuricataOp::Reload,
        }) => {
            return ListScript::new(ProcessRunner, &config.list_script)
                .reload()
                .context("Failed to reload the inspection engine");
        }
        None => {}
    }

    info!("Starting nft-policy v{}", env!("CARGO_PKG_VERSION"));

    let policies = match &args.policy_file {
        Some(path) => read_policies(path)?,
        None => vec![policy_from_args(&args)?],
    };
    for policy in &policies {
        info!("Policy:\n{}", serde_json::to_string_pretty(policy)?);
    }
    warn_unknown_interfaces(&policies);

    match config.backend {
        BackendKind::Text => {
            let backend = TextBackend::new(ProcessRunner, config.nft_path.as_str());
            apply(backend, &config, &policies)?;
        }
        BackendKind::Netlink => apply_netlink(&config, &policies)?,
        BackendKind::DryRun => {
            let engine = MemoryNetfilter::new();
            let rules = apply(BatchBackend::new(engine.clone()), &config, &policies)?;
            print_dry_run(&engine, &config, &rules)?;
        }
    }

    Ok(())
}

fn apply<B: Backend>(backend: B, config: &AppConfig, policies: &[Policy]) -> Result<Vec<CompiledRule>> {
    let mut manager = RulesetManager::new(backend, config.table.clone(), config.chain.clone());
    let rules = manager
        .install_all(policies)
        .context("Failed to install policies")?;
    info!("Installed {} rule(s)", rules.len());
    Ok(rules)
}

#[cfg(all(target_os = "linux", feature = "netlink"))]
fn apply_netlink(config: &AppConfig, policies: &[Policy]) -> Result<()> {
    let session = nft_policy::netfilter::NetlinkSession::open()
        .context("Failed to reach nf_tables (CAP_NET_ADMIN required)")?;
    apply(BatchBackend::new(session), config, policies)?;
    Ok(())
}

#[cfg(not(all(target_os = "linux", feature = "netlink")))]
fn apply_netlink(_config: &AppConfig, _policies: &[Policy]) -> Result<()> {
    bail!("The netlink backend needs Linux and a build with the `netlink` feature")
}

fn run_list(config: &AppConfig, kind: ListKind, op: &ListOp) -> Result<()> {
    let mut script = ListScript::new(ProcessRunner, &config.list_script);
    let result = match op {
        ListOp::Add { rule } => script.add(kind, rule),
        ListOp::Del => script.delete(kind),
    };
    result.with_context(|| format!("Failed to update {}", kind))
}

fn policy_from_args(args: &Args) -> Result<Policy> {
    let times = args
        .time
        .iter()
        .map(|t| t.parse::<TimeWindow>())
        .collect::<Result<Vec<_>, _>>()
        .context("Invalid --time")?;

    Ok(Policy {
        name: "cli".to_string(),
        source_interfaces: args.sregion.clone(),
        dest_interfaces: args.dregion.clone(),
        source_ips: args.sip.clone(),
        dest_ips: args.dip.clone(),
        source_mac: args.smac.clone(),
        dest_mac: args.dmac.clone(),
        protocol: args.protocol.clone(),
        source_port: args.sport,
        dest_port: args.dport,
        app: App {
            name: args.app.clone(),
            ..Default::default()
        },
        times,
        log_tag: args.logtag.clone(),
        log_detail: args.log_detail,
        action: args.action,
        directive: args.policy,
    })
}

fn read_policies(path: &Path) -> Result<Vec<Policy>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let policies = match serde_json::from_str::<PolicyFile>(&text)
        .with_context(|| format!("Invalid policy file {}", path.display()))?
    {
        PolicyFile::Many(policies) => policies,
        PolicyFile::One(policy) => vec![policy],
    };
    if policies.is_empty() {
        bail!("{} holds no policies", path.display());
    }
    Ok(policies)
}

/// Regions naming interfaces this host does not have are most likely typos
fn warn_unknown_interfaces(policies: &[Policy]) {
    let known: Vec<String> = pnet_datalink::interfaces()
        .into_iter()
        .map(|i| i.name)
        .collect();

    for policy in policies {
        for name in policy.source_interfaces.iter().chain(&policy.dest_interfaces) {
            if !known.contains(name) {
                warn!("Policy {}: interface {} not found on this host", policy.label(), name);
            }
        }
    }
}

fn print_dry_run(engine: &MemoryNetfilter, config: &AppConfig, rules: &[CompiledRule]) -> Result<()> {
    let installed = engine.rules(&config.table, &config.chain.name);

    for (rule, exprs) in rules.iter().zip(&installed) {
        let cmd = rule_command(&config.nft_path, &config.table, &config.chain.name, rule)?;
        println!("{}", cmd);
        for expr in exprs {
            println!("  {}", expr);
        }
    }
    Ok(())
}
