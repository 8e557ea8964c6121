//! Command-line interface for the hub bridge.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hubbridge_client::config::env_vars;
use hubbridge_client::{ClientEvent, HubClient, HubConfig, ResourceKind, ServiceCall};
use serde_json::Value;

/// Hub bridge - talk to a home-automation hub over its WebSocket API.
#[derive(Parser, Debug)]
#[command(name = "hubbridge")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// TOML file with the connection settings.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Hub URL (ws://, wss://, or the hub's http(s):// base URL).
    #[arg(long, global = true, env = env_vars::URL)]
    url: Option<String>,

    /// Long-lived access token.
    #[arg(long, global = true, env = env_vars::ACCESS_TOKEN, hide_env_values = true)]
    token: Option<String>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Stream hub events as JSON lines.
    Watch {
        /// Only subscribe to this event type.
        #[arg(long)]
        event_type: Option<String>,
    },

    /// Fetch one resource and print it.
    Fetch {
        /// config, services, devices, entities, areas, labels or states
        kind: ResourceKind,
    },

    /// Call a service.
    Call {
        domain: String,
        service: String,

        /// Service data as a JSON object.
        #[arg(short, long)]
        data: Option<String>,

        /// Target entity.
        #[arg(short, long)]
        entity: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = load_config(args.config.as_deref(), args.url, args.token)?;
    let client = HubClient::new(config);

    match args.command {
        Command::Watch { event_type } => run_watch(&client, event_type.as_deref()).await,
        Command::Fetch { kind } => run_fetch(&client, kind).await,
        Command::Call {
            domain,
            service,
            data,
            entity,
        } => run_call(&client, domain, service, data, entity).await,
    }
}

fn init_logging(verbose: bool) {
    // Check if JSON logging is requested (for production/container environments)
    let json_logging = std::env::var("HUBBRIDGE_LOG_JSON")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "hubbridge={lvl},hubbridge_client={lvl}",
            lvl = default_level
        ))
        .add_directive(tracing::Level::WARN.into())
    });

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Build the client config: file, then `HUB_*` variables, then flags.
fn load_config(
    path: Option<&Path>,
    url: Option<String>,
    token: Option<String>,
) -> Result<HubConfig> {
    let mut config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            toml::from_str::<HubConfig>(&text)
                .with_context(|| format!("Invalid config file {}", path.display()))?
        }
        None => {
            let url = url.clone().ok_or_else(|| {
                anyhow::anyhow!("No hub URL. Pass --url, set {} or use --config.", env_vars::URL)
            })?;
            let token = token.clone().ok_or_else(|| {
                anyhow::anyhow!(
                    "No access token. Pass --token, set {} or use --config.",
                    env_vars::ACCESS_TOKEN
                )
            })?;
            HubConfig::new(url, token)
        }
    };
    config.apply_env_overrides();

    if let Some(url) = url {
        config.url = url;
    }
    if let Some(token) = token {
        config.access_token = token;
    }
    if config.url.starts_with("http://") || config.url.starts_with("https://") {
        config.url = HubConfig::websocket_url_from_http(&config.url);
    }

    config.validate()?;
    Ok(config)
}

async fn run_watch(client: &HubClient, event_type: Option<&str>) -> Result<()> {
    let mut events = client.events();
    let version = client.connect().await?;
    tracing::info!(
        url = %client.config().url,
        version = %version,
        "Watching hub events (Ctrl-C to stop)"
    );

    client.subscribe_events(event_type).await?;
    client.sync_registry().await?;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                println!("{}", serde_json::to_string(&event)?);
                if let ClientEvent::Fatal { message } = event {
                    anyhow::bail!("Giving up: {}", message);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, closing connection");
                break;
            }
        }
    }

    client.close().await?;
    Ok(())
}

async fn run_fetch(client: &HubClient, kind: ResourceKind) -> Result<()> {
    client.connect().await?;
    let result = client.fetch(kind).await;
    client.close().await?;

    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}

async fn run_call(
    client: &HubClient,
    domain: String,
    service: String,
    data: Option<String>,
    entity: Option<String>,
) -> Result<()> {
    let mut call = ServiceCall::new(domain, service);
    if let Some(data) = data {
        let data: Value = serde_json::from_str(&data).context("--data must be valid JSON")?;
        anyhow::ensure!(data.is_object(), "--data must be a JSON object");
        call = call.with_data(data);
    }
    if let Some(entity) = entity {
        call = call.for_entity(entity);
    }

    client.connect().await?;
    let result = client.call_service(call).await;
    client.close().await?;

    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}
