use anyhow::Context;
use clap::{Parser, Subcommand};
use fleeting_common::{ConnectorSettings, VersionInfo};
use fleeting_orchestrator::{FleetingGroup, PluginConfig};
use fleeting_providers::CallContext;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "fleeting-scaleway", about = "Scale a group of Scaleway servers")]
struct Cli {
    /// Plugin configuration (JSON).
    #[arg(long, short, default_value = "config.json")]
    config: PathBuf,

    /// Give up on the command after this many seconds.
    #[arg(long, default_value = "1800")]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the group's instances.
    List,
    /// Create instances.
    Increase { count: usize },
    /// Delete instances by identifier (`name:id`).
    Decrease {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Show how to connect to an instance.
    Get { id: String },
    /// Log resources left behind by failed operations.
    Sanity,
    /// Print version information.
    Version,
}

fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Command::Version = cli.command {
        let version = VersionInfo::current();
        return print_json(&json!({
            "name": version.name,
            "version": version.version,
            "build_info": version.build_info(),
        }));
    }

    let config = PluginConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let (ctx, cancel) = CallContext::background()
        .with_timeout(Duration::from_secs(cli.timeout))
        .with_cancel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling");
            cancel.cancel();
        }
    });

    let mut plugin = FleetingGroup::new(config);
    let provider = plugin
        .init(&ctx, ConnectorSettings::default())
        .await
        .context("initializing instance group")?;
    info!(id = %provider.id, version = %provider.version, "provider ready");

    match cli.command {
        Command::List => {
            let mut instances = Vec::new();
            plugin
                .update(&ctx, |id, state| {
                    instances.push(json!({ "id": id, "state": state.as_str() }))
                })
                .await?;
            print_json(&json!(instances))?;
        }
        Command::Increase { count } => {
            let (created, res) = plugin.increase(&ctx, count).await;
            print_json(&json!({ "requested": count, "created": created }))?;
            res.context("increase finished with errors")?;
        }
        Command::Decrease { ids } => {
            let (deleted, res) = plugin.decrease(&ctx, &ids).await;
            print_json(&json!({ "deleted": deleted }))?;
            res.context("decrease finished with errors")?;
        }
        Command::Get { id } => {
            let info = plugin.connect_info(&ctx, &id).await?;
            print_json(&serde_json::to_value(&info)?)?;
        }
        Command::Sanity => {
            plugin.sanity(&ctx).await?;
        }
        Command::Version => {}
    }
    Ok(())
}
