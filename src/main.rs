use anyhow::{bail, Context};
use breakout_engine::config::EngineConfig;
use breakout_engine::execution::{build_status, ControlLoop, ShutdownHandle};
use breakout_engine::TradingContext;
use chrono::Utc;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "breakout-engine")]
#[command(about = "Intraday index-option breakout engine")]
struct Cli {
    /// Path to configuration file (TOML)
    #[arg(long, short, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control loop until Ctrl+C
    Start,
    /// Close every open trade immediately
    EmergencyExit {
        /// Required in live mode
        #[arg(long)]
        yes: bool,
    },
    /// Print levels and trades as JSON
    Status {
        /// Number of recent closed trades to include
        #[arg(long, default_value_t = 10)]
        recent: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Command::Start => run_start(config).await,
        Command::EmergencyExit { yes } => run_emergency_exit(config, yes).await,
        Command::Status { recent } => run_status(config, recent).await,
    }
}

// ============================================================================
// Initialization Functions
// ============================================================================

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("breakout_engine=info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn connect(config: EngineConfig) -> anyhow::Result<TradingContext> {
    TradingContext::connect(config)
        .await
        .context("connecting to storage and brokerage")
}

// ============================================================================
// Commands
// ============================================================================

async fn run_start(config: EngineConfig) -> anyhow::Result<()> {
    tracing::info!("🚀 Breakout engine starting");
    tracing::info!("\n📊 Configuration:");
    tracing::info!("  Mode: {}", if config.paper_mode { "PAPER" } else { "LIVE" });
    tracing::info!("  Underlying: {} (lot {})", config.underlying, config.lot_size);
    tracing::info!("  Timeframe: {}", config.monitoring_timeframe);
    tracing::info!("  Target: ₹{:.2}/unit", config.target_per_unit);
    tracing::info!(
        "  Stop-loss: {} consecutive closes beyond level",
        config.consecutive_violation_threshold
    );
    tracing::info!("  API budget: {}/min", config.max_api_calls_per_minute);

    let ctx = connect(config).await?;
    let mut control = ControlLoop::new(&ctx);
    control.restore().await.context("restoring open trades")?;

    let (handle, shutdown) = ShutdownHandle::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("\n⚠️  Received Ctrl+C, finishing current tick...");
            handle.shutdown();
        }
    });

    tracing::info!("\nPress Ctrl+C to stop...\n");
    control.run(shutdown).await?;

    tracing::info!("👋 Breakout engine stopped");
    Ok(())
}

async fn run_emergency_exit(config: EngineConfig, yes: bool) -> anyhow::Result<()> {
    if !config.paper_mode && !yes {
        bail!("refusing to close LIVE positions without --yes");
    }

    let ctx = connect(config).await?;
    let mut trades = ctx.trade_manager();
    let open = trades.restore().await.context("loading open trades")?;
    if open == 0 {
        tracing::info!("No open trades");
        return Ok(());
    }

    let closed = trades.emergency_exit_all(Utc::now()).await?;
    let total_pnl: f64 = closed.iter().filter_map(|t| t.pnl).sum();
    tracing::info!(
        "🚨 Emergency exit closed {}/{} trades, P&L ₹{:.2}",
        closed.len(),
        open,
        total_pnl
    );

    if closed.len() < open {
        bail!(
            "{} trades are still OPEN; check the broker and retry",
            open - closed.len()
        );
    }
    Ok(())
}

async fn run_status(config: EngineConfig, recent: usize) -> anyhow::Result<()> {
    let ctx = connect(config).await?;
    // a fresh process has evaluated no candles, so the processed count is left out
    let report = build_status(
        &ctx.level_aggregator(),
        ctx.ledger.as_ref(),
        &ctx.gateway,
        None,
        recent,
        Utc::now(),
    )
    .await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
