//! Entry point for `morpheus`. Shaped like `clawnode::main`: a `clap`
//! derive surface over one subcommand per lifecycle verb, a `tracing`
//! subscriber wired from `RUST_LOG`, and a single `std::process::exit`
//! carrying the error taxonomy's exit code out of `main`.

use clap::{Parser, Subcommand};
use morpheus_core::{Forest, MorpheusError, Node};
use morpheus_dns::{DnsProvider, HetznerDnsProvider, NullDnsProvider};
use morpheus_hetzner::{CloudProvider, HetznerProvider};
use morpheus_provision::Provisioner;
use morpheus_reachability::{check_host_capability, SshProbe, TcpSshProbe};
use morpheus_registry::Registry;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "morpheus", version, about = "Provisions Hetzner Cloud forests ready to host a NATS layer")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new forest.
    Plant {
        #[arg(long, default_value_t = 3)]
        nodes: u32,
    },
    /// Add nodes to an existing forest.
    Grow {
        forest_id: String,
        #[arg(long, default_value_t = 1)]
        nodes: u32,
    },
    /// Delete a forest and every resource it owns.
    Teardown { forest_id: String },
    /// Show one forest and its nodes.
    Status { forest_id: String },
    /// List every known forest.
    List,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();

    let exit_code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "morpheus failed");
            eprintln!("error: {}", remediation(&e));
            e.exit_code()
        }
    };

    std::process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("morpheus=info"));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();
}

async fn run(cli: Cli) -> Result<i32, MorpheusError> {
    let config = morpheus_config::resolve()?;
    info!(config = %config.display_redacted(), "resolved configuration");

    let registry_path = config.resolved_registry_path()?;
    let registry = Arc::new(Registry::open(&registry_path)?);

    let cloud: Arc<dyn CloudProvider> = Arc::new(HetznerProvider::new(
        config
            .hetzner_api_token
            .clone()
            .expect("validated non-empty by MorpheusConfig::validate"),
    ));

    let dns: Arc<dyn DnsProvider> = match (&config.dns_domain, config.dns_token()) {
        (Some(_), Some(token)) => Arc::new(HetznerDnsProvider::new(token.to_string())),
        _ => Arc::new(NullDnsProvider),
    };

    let ssh_probe: Arc<dyn SshProbe> = Arc::new(TcpSshProbe);

    let (host_ipv6_ok, host_ipv4_ok) = check_host_capability().await;
    info!(host_ipv6_ok, host_ipv4_ok, "host IP capability");

    let provisioner = Provisioner::new(registry, cloud, dns, ssh_probe, config, host_ipv6_ok);

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("SIGINT received, cancelling in-flight provisioning");
            signal_token.cancel();
        }
    });

    match cli.command {
        Command::Plant { nodes } => {
            let forest = provisioner.plant(nodes, cancel).await?;
            println!("planted {} with {} node(s)", forest.id, forest.node_count);
            Ok(0)
        }
        Command::Grow { forest_id, nodes } => {
            let forest = provisioner.grow(&forest_id, nodes, cancel).await?;
            println!("grew {} to {} node(s)", forest.id, forest.node_count);
            Ok(0)
        }
        Command::Teardown { forest_id } => match provisioner.teardown(&forest_id).await {
            Ok(()) => {
                println!("{forest_id} torn down");
                Ok(0)
            }
            Err(e) => {
                error!(error = %e, forest_id, "teardown left residual resources");
                eprintln!("error: {}", remediation(&e));
                Ok(1)
            }
        },
        Command::Status { forest_id } => {
            match provisioner.status(&forest_id) {
                Some((forest, nodes)) => print_status(&forest, &nodes),
                None => println!("forest {forest_id} not found"),
            }
            Ok(0)
        }
        Command::List => {
            print_list(&provisioner.list_forests());
            Ok(0)
        }
    }
}

fn print_status(forest: &Forest, nodes: &[Node]) {
    println!(
        "{}  status={:?}  location={}  provider={}  nodes={}",
        forest.id, forest.status, forest.location, forest.provider, forest.node_count
    );
    for node in nodes {
        let address = if !node.ipv6.is_empty() { &node.ipv6 } else { &node.ipv4 };
        println!("  {}  status={:?}  role={}  address={}", node.name, node.status, node.role, address);
        for (key, value) in &node.metadata {
            println!("    {key}: {value}");
        }
    }
}

fn print_list(forests: &[Forest]) {
    if forests.is_empty() {
        println!("no forests");
        return;
    }
    for forest in forests {
        println!(
            "{}  status={:?}  location={}  nodes={}",
            forest.id, forest.status, forest.location, forest.node_count
        );
    }
}

/// Maps an error kind to human remediation text per spec §7: never a raw
/// stack trace, always naming what to check or change next.
fn remediation(e: &MorpheusError) -> String {
    match e {
        MorpheusError::ConfigInvalid(msg) => {
            format!("configuration problem: {msg}. Check config.yaml or HETZNER_API_TOKEN/HETZNER_DNS_TOKEN.")
        }
        MorpheusError::ProviderAuth(msg) => {
            format!("Hetzner rejected the request: {msg}. Check that the API token is valid and has write access.")
        }
        MorpheusError::CapacityUnavailable { server_type, location } => format!(
            "no capacity for {server_type} in {location}. Add entries to server_type_fallback or choose a different location."
        ),
        MorpheusError::ServerTypeUnknown(t) => {
            format!("{t} is not a known Hetzner server type. Check spelling against the Hetzner catalog.")
        }
        MorpheusError::SSHKeyFingerprintMismatch { expected, actual } => format!(
            "ssh_key_name is already registered with a different key (local fingerprint {expected}, Hetzner has {actual}). \
             Use a different ssh_key_name or delete the conflicting key in the Hetzner console."
        ),
        MorpheusError::NoReachableAddress(node) => {
            format!("node {node} has no address this host can reach. Enable ipv4_enabled, or fix this host's IPv6 connectivity.")
        }
        MorpheusError::SSHTimeout { address, kind } => {
            format!("SSH port on {address} never became reachable ({kind}). The node and its DNS records were rolled back.")
        }
        MorpheusError::DNSFailure(msg) => format!("DNS operation failed: {msg}."),
        MorpheusError::RegistryIO(msg) => format!("local registry error: {msg}. Check permissions on the registry directory."),
        MorpheusError::InvalidRole(role) => format!("invalid node role: {role}."),
        MorpheusError::TransientNetwork(msg) => format!("network error talking to the cloud provider: {msg}. Retry the command."),
        MorpheusError::Cancelled => "operation cancelled; partially created resources were rolled back.".to_string(),
        MorpheusError::Other(msg) => msg.clone(),
    }
}
