//! Relaygate - virtual in-cluster endpoints relayed through external gateways

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use kube::{Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use relaygate::crd::{ExternalService, Forwarder, Gateway};
use relaygate::nat::Iptables;
use relaygate::ssh::{SshClientConfig, SshCredentials};
use relaygate::{compiler, forwarder, gateway};

/// Relaygate - relay pod traffic through external gateways with source-IP
/// preservation
#[derive(Parser, Debug)]
#[command(name = "relaygate", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the ExternalService compiler (default mode)
    Operator,

    /// Run the forwarder reconciler inside a forwarder pod
    Forwarder(ForwarderArgs),

    /// Run the gateway reconciler on a gateway host
    Gateway(GatewayArgs),
}

/// Forwarder mode arguments
#[derive(Parser, Debug)]
struct ForwarderArgs {
    /// Namespace of the Forwarder object this pod serves
    #[arg(long, env = "FORWARDER_NAMESPACE")]
    namespace: String,

    /// Name of the Forwarder object this pod serves
    #[arg(long, env = "FORWARDER_NAME")]
    name: String,

    /// SSH username presented to gateway servers
    #[arg(long, env = "RELAYGATE_SSH_USER", default_value = "relay")]
    ssh_user: String,

    /// SSH password presented to gateway servers
    #[arg(long, env = "RELAYGATE_SSH_PASSWORD", default_value = "relaygate")]
    ssh_password: String,

    /// SSH dial timeout in seconds
    #[arg(long, default_value = "5")]
    ssh_timeout_secs: u64,
}

/// Gateway mode arguments
#[derive(Parser, Debug)]
struct GatewayArgs {
    /// Namespace whose Gateway objects this host serves
    #[arg(long, default_value = "external-services")]
    namespace: String,

    /// SSH username accepted from forwarders
    #[arg(long, env = "RELAYGATE_SSH_USER", default_value = "relay")]
    ssh_user: String,

    /// SSH password accepted from forwarders
    #[arg(long, env = "RELAYGATE_SSH_PASSWORD", default_value = "relaygate")]
    ssh_password: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,relaygate=debug,kube=info")),
        )
        .init();

    let cli = Cli::parse();

    if cli.crd {
        // Emit all CRD manifests for cluster installation.
        let crds = [
            serde_yaml::to_string(&ExternalService::crd())?,
            serde_yaml::to_string(&Forwarder::crd())?,
            serde_yaml::to_string(&Gateway::crd())?,
        ];
        println!("{}", crds.join("---\n"));
        return Ok(());
    }

    match cli.command {
        None | Some(Commands::Operator) => run_operator().await,
        Some(Commands::Forwarder(args)) => run_forwarder(args).await,
        Some(Commands::Gateway(args)) => run_gateway(args).await,
    }
}

/// Run the ExternalService compiler.
async fn run_operator() -> anyhow::Result<()> {
    tracing::info!("relaygate operator starting");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {e}"))?;

    let ctx = Arc::new(compiler::Context::new(client));
    compiler::run(ctx).await
}

/// Run the forwarder reconciler.
async fn run_forwarder(args: ForwarderArgs) -> anyhow::Result<()> {
    tracing::info!(
        namespace = %args.namespace,
        name = %args.name,
        "relaygate forwarder starting"
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {e}"))?;

    let ssh_config = SshClientConfig {
        credentials: SshCredentials {
            user: args.ssh_user,
            password: args.ssh_password,
        },
        connect_timeout: Duration::from_secs(args.ssh_timeout_secs),
    };

    let ctx = Arc::new(forwarder::Context::new(
        client,
        args.namespace,
        args.name,
        ssh_config,
        Arc::new(Iptables),
    ));
    forwarder::run(ctx).await
}

/// Run the gateway reconciler.
async fn run_gateway(args: GatewayArgs) -> anyhow::Result<()> {
    tracing::info!(namespace = %args.namespace, "relaygate gateway starting");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {e}"))?;

    let credentials = SshCredentials {
        user: args.ssh_user,
        password: args.ssh_password,
    };

    let ctx = Arc::new(gateway::Context::new(
        client,
        args.namespace,
        credentials,
        Arc::new(Iptables),
    ));
    gateway::run(ctx).await
}
