use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use gridtrade_core::{AppConfig, ExchangeAdapter};
use gridtrade_engine::runtime;
use gridtrade_exchange_coinbase::{CoinbaseAdapter, CoinbaseCredentials};
use gridtrade_exchange_mock::MockAdapter;
use gridtrade_store::Store;
use gridtrade_web_api::{ApiServer, AppState, EnvInfo};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "gridtrade")]
#[command(about = "Grid trading bot for Coinbase spot markets", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the trading engine with the web API
    Run {
        /// Config file path
        #[arg(short, long, default_value = "config/Config.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| {
                    std::env::var("LOG_LEVEL")
                        .map(tracing_subscriber::EnvFilter::new)
                })
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config } => run(&config).await,
    }
}

fn load_config(path: &str) -> Result<AppConfig> {
    let mut config: AppConfig = Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed("GRIDTRADE_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    // Deployment-level env variables override the file.
    if let Ok(env) = std::env::var("ENV") {
        config.env = env;
    }
    if let Ok(exchange_type) = std::env::var("EXCHANGE_TYPE") {
        config.exchange.exchange_type = exchange_type;
    }
    Ok(config)
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|raw| matches!(raw.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

async fn run(config_path: &str) -> Result<()> {
    let config = load_config(config_path)?;
    tracing::info!(env = %config.env, exchange = %config.exchange.exchange_type, "starting");

    let store = Store::connect(&config.database.url, config.database.max_connections)
        .await
        .context("failed to open store")?;

    // LIVE_TRADING_ENABLED / PAPER_MODE come from the environment on every
    // boot: a restart can never silently resurrect live trading.
    let mut grid = store.config().load_or_init().await?;
    grid.live_trading_enabled = env_flag("LIVE_TRADING_ENABLED", false);
    grid.paper_mode = env_flag("PAPER_MODE", true);
    store.config().save(&grid).await?;

    let adapter: Arc<dyn ExchangeAdapter> = match config.exchange.exchange_type.as_str() {
        "mock" => Arc::new(MockAdapter::new()),
        "coinbase" => {
            let credentials =
                CoinbaseCredentials::from_env().context("coinbase credentials missing")?;
            Arc::new(CoinbaseAdapter::new(
                config.exchange.api_url.clone(),
                config.exchange.ws_url.clone(),
                credentials,
                Duration::from_secs(config.engine.request_timeout_secs),
            ))
        }
        other => bail!("unknown EXCHANGE_TYPE: {other}"),
    };

    let engine = runtime::start(store.clone(), adapter.clone(), config.engine.clone())
        .await
        .context("engine failed to start")?;

    let state = AppState {
        handle: engine.handle.clone(),
        store,
        adapter,
        bus: engine.bus.clone(),
        env: EnvInfo {
            env: config.env.clone(),
            exchange_type: config.exchange.exchange_type.clone(),
        },
    };
    let server = ApiServer::new(state);
    let addr = format!("{}:{}", config.server.host, config.server.port);

    tokio::select! {
        result = server.serve(&addr) => {
            result.context("web server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    // Let the current tick finish, then stop the actor.
    engine.handle.shutdown().await.ok();
    engine.task.await.ok();
    tracing::info!("goodbye");
    Ok(())
}
