use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use common::{Config, ControlUpdate, EngineEvent, ExecutionGateway, TickBatch, TradingMode};
use engine::CycleController;
use gateway::{KiteGateway, PaperGateway};
use params::{default_store, ParamFileConfig};

#[tokio::main]
async fn main() {
    // ── Logging ──────────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    // ── Config ────────────────────────────────────────────────────────────────
    let cfg = Config::from_env();
    info!(mode = %cfg.trading_mode, "CycleBot starting");

    // ── Parameters: built-in declarations plus optional TOML overrides ───────
    let mut store = default_store();
    match ParamFileConfig::load(&cfg.params_config_path) {
        Ok(Some(overrides)) => overrides.apply(&mut store),
        Ok(None) => {}
        Err(e) => panic!("ERROR: {e}"),
    }

    // ── Execution gateway (injected based on TRADING_MODE) ────────────────────
    let exec_gateway: Arc<dyn ExecutionGateway> = match cfg.trading_mode {
        TradingMode::Live => {
            info!("Live trading mode — using KiteGateway");
            Arc::new(KiteGateway::new(&cfg.kite_api_key, &cfg.kite_access_token))
        }
        TradingMode::Paper => {
            info!("Paper trading mode — using PaperGateway");
            Arc::new(PaperGateway::new())
        }
    };

    // ── Channels ──────────────────────────────────────────────────────────────
    let (batch_tx, batch_rx) = mpsc::channel::<TickBatch>(64);
    let (control_tx, control_rx) = mpsc::channel::<ControlUpdate>(32);
    let (event_tx, mut event_rx) = broadcast::channel::<EngineEvent>(256);

    let controller = CycleController::new(store, exec_gateway, event_tx);

    // ── Telemetry logger (the dashboard subscribes to the same broadcast) ─────
    tokio::spawn(async move {
        loop {
            match event_rx.recv().await {
                Ok(EngineEvent::BlockChanged { from, to, cycle }) => {
                    info!(%from, %to, cycle, "Block changed");
                }
                Ok(EngineEvent::Trade(trade)) => {
                    info!(
                        action = %trade.action,
                        symbol = %trade.symbol,
                        price = trade.price,
                        quantity = trade.quantity,
                        cycle = trade.cycle,
                        "Trade"
                    );
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(dropped = n, "Telemetry logger lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });

    // ── Tick adapter ──────────────────────────────────────────────────────────
    // The live transport is an external collaborator; this binary accepts
    // JSON tick-batch lines on stdin and forwards them in arrival order.
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<TickBatch>(&line) {
                        Ok(batch) => {
                            if batch_tx.send(batch).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!(error = %e, "Malformed tick batch line"),
                    }
                }
                Ok(None) => {
                    info!("Tick input closed");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read tick input");
                    return;
                }
            }
        }
    });

    tokio::spawn(controller.run(batch_rx, control_rx));

    // The control sender would be handed to the operator channel in a full
    // deployment; it is held here so the controller keeps running.
    info!("All subsystems started. Waiting for shutdown signal.");
    tokio::signal::ctrl_c().await.unwrap();
    drop(control_tx);
    info!("Shutdown signal received. Exiting.");
}
