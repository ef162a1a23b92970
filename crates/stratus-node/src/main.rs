//! Stratus Node -- cluster node binary.
//!
//! Usage:
//!   stratus-node                                   # Run with default config
//!   stratus-node --config path.toml                # Run with custom config
//!   stratus-node config                            # Print the effective config
//!   stratus-node deploy Lobby/default ./lobby.bin  # Push a template to the cluster

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use stratus_node::config::NodeConfig;
use stratus_node::{expand_tilde, Node};
use stratus_protocol::ServiceTemplate;

#[derive(Parser)]
#[command(name = "stratus-node", about = "Stratus cluster node")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.stratus/config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node (default)
    Run,
    /// Print the effective configuration as TOML
    Config,
    /// Stream a template file to every connected node, then exit
    Deploy {
        /// Template as prefix/name
        template: String,
        /// File holding the template payload
        file: PathBuf,
        /// Template storage
        #[arg(long, default_value = ServiceTemplate::LOCAL_STORAGE)]
        storage: String,
        /// Clear the destination on each node before installing
        #[arg(long)]
        pre_clear: bool,
        /// Seconds to wait for at least one node to connect
        #[arg(long, default_value_t = 10)]
        wait_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "stratus_node=info,stratus_cluster=info,stratus_transfer=info,stratus_driver=info"
                    .into()
            }),
        )
        .init();

    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let cfg = NodeConfig::load_or_default(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    match cli.command {
        Some(Commands::Run) | None => run_node(cfg).await?,
        Some(Commands::Config) => {
            println!("{}", toml::to_string_pretty(&cfg)?);
        }
        Some(Commands::Deploy {
            template,
            file,
            storage,
            pre_clear,
            wait_secs,
        }) => {
            let template = parse_template(&template, &storage)?;
            deploy(cfg, template, &file, pre_clear, Duration::from_secs(wait_secs)).await?;
        }
    }

    Ok(())
}

fn parse_template(raw: &str, storage: &str) -> anyhow::Result<ServiceTemplate> {
    let (prefix, name) = raw
        .split_once('/')
        .filter(|(prefix, name)| !prefix.is_empty() && !name.is_empty())
        .with_context(|| format!("template must be prefix/name, got {raw:?}"))?;
    Ok(ServiceTemplate {
        prefix: prefix.to_string(),
        name: name.to_string(),
        storage: storage.to_string(),
    })
}

async fn run_node(cfg: NodeConfig) -> anyhow::Result<()> {
    let node = Node::start(cfg).await?;
    tracing::info!(
        node = %node.unique_id(),
        listen = %node.local_addr(),
        templates = %expand_tilde(&node.config().node.template_dir).display(),
        "node: running"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    node.shutdown().await;
    Ok(())
}

async fn deploy(
    cfg: NodeConfig,
    template: ServiceTemplate,
    file: &std::path::Path,
    pre_clear: bool,
    wait: Duration,
) -> anyhow::Result<()> {
    let node = Node::start(cfg).await?;

    let deadline = tokio::time::Instant::now() + wait;
    while !node.registry().has_connected().await {
        if tokio::time::Instant::now() >= deadline {
            node.shutdown().await;
            anyhow::bail!("no node connected within {}s", wait.as_secs());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let nodes = node.registry().connected_count().await;
    let result = node.deploy_template_file(template.clone(), pre_clear, file).await;
    node.shutdown().await;

    match result? {
        Some(summary) => println!(
            "{template}: {} bytes in {} chunks to {} node(s), sha256 {}",
            summary.total_bytes,
            summary.chunks,
            nodes,
            summary.sha256
        ),
        None => println!("{template}: no node connected, nothing sent"),
    }
    Ok(())
}
