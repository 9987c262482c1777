//! The `relay` binary: wires config into the services and runs the server
//! plus the timeout sweeper.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use relay_events::{FanoutHub, WebhookNotifier};
use relay_gateway::{run_server, AppState, GatewayConfig};
use relay_knowledge::{KnowledgeService, KnowledgeServiceConfig};
use relay_lifecycle::{RequestService, TimeoutSweeper, TimeoutSweeperConfig};
use relay_memory::{HttpMemoryGateway, HttpMemoryGatewayConfig, MemoryGateway};
use relay_store::SqliteStore;

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "relay",
    about = "Human-in-the-loop help request relay with a learning knowledge base",
    version
)]
struct RelayArgs {
    /// Durable store path.
    #[arg(long, env = "RELAY_STORE_PATH", default_value = "relay-data/relay.sqlite")]
    store_path: PathBuf,

    /// Listen address for the HTTP/websocket server.
    #[arg(long, env = "RELAY_BIND", default_value = "127.0.0.1:3000")]
    bind: String,

    /// Semantic memory service base URL.
    #[arg(long, env = "MEMORY_API_BASE", default_value = "https://api.mem0.ai")]
    memory_api_base: String,

    /// Semantic memory service API key.
    #[arg(long, env = "MEMORY_API_KEY", default_value = "")]
    memory_api_key: String,

    /// Namespace memories are stored under.
    #[arg(long, env = "MEMORY_AGENT_ID", default_value = "salon-receptionist")]
    memory_agent_id: String,

    /// Outbound webhook endpoint for notifications; unset disables dispatch.
    #[arg(long, env = "WEBHOOK_URL")]
    webhook_url: Option<String>,

    /// Origin required on event-channel websocket upgrades; unset allows any.
    #[arg(long, env = "RELAY_WS_ORIGIN")]
    ws_allowed_origin: Option<String>,

    /// Seconds between timeout sweeps.
    #[arg(long, env = "RELAY_SWEEP_INTERVAL_SECONDS", default_value_t = 300, value_parser = parse_positive_u64)]
    sweep_interval_seconds: u64,

    /// Capacity of the semantic-index write queue.
    #[arg(long, env = "RELAY_INDEX_QUEUE_CAPACITY", default_value_t = 64, value_parser = parse_positive_u64)]
    index_queue_capacity: u64,

    /// Skip seeding the initial knowledge base on startup.
    #[arg(long)]
    skip_seed: bool,
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = RelayArgs::parse();
    init_tracing();

    let store = Arc::new(
        SqliteStore::new(&args.store_path).with_context(|| {
            format!("failed to open store at {}", args.store_path.display())
        })?,
    );
    let hub = Arc::new(FanoutHub::new());
    let notifier = Arc::new(WebhookNotifier::new(args.webhook_url.clone()));

    let mut memory_config =
        HttpMemoryGatewayConfig::new(args.memory_api_base.clone(), args.memory_api_key.clone());
    memory_config.agent_id = args.memory_agent_id.clone();
    let gateway: Arc<dyn MemoryGateway> = Arc::new(
        HttpMemoryGateway::new(memory_config).context("failed to build memory gateway client")?,
    );

    let (knowledge, index_worker) = KnowledgeService::new(
        Arc::clone(&store),
        gateway,
        Arc::clone(&hub),
        KnowledgeServiceConfig {
            index_queue_capacity: args.index_queue_capacity as usize,
            ..KnowledgeServiceConfig::default()
        },
    );
    tokio::spawn(index_worker.run());

    let requests = RequestService::new(
        Arc::clone(&store),
        Arc::clone(&knowledge),
        Arc::clone(&hub),
        notifier,
    );

    if args.skip_seed {
        println!("knowledge seeding skipped");
    } else {
        match knowledge.seed_initial() {
            Ok(seeded) => println!("knowledge seeding complete: seeded={seeded}"),
            Err(error) => eprintln!("knowledge seeding failed: {error}"),
        }
    }

    let sweeper = TimeoutSweeper::new(
        Arc::clone(&requests),
        TimeoutSweeperConfig {
            period: Duration::from_secs(args.sweep_interval_seconds),
        },
    );
    tokio::spawn(sweeper.run());

    let state = AppState::new(
        requests,
        knowledge,
        store,
        hub,
        args.ws_allowed_origin.clone(),
    );
    run_server(GatewayConfig { bind: args.bind }, state).await
}
