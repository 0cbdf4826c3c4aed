use orderflow_data::{
    EngineConfig, FlowEvent, OrderflowEngine,
    connection::ConnectionManager,
    error::DataError,
    types::{SubscriptionMode, SymbolKey},
};
use rustls::crypto::ring::default_provider;
use std::{error::Error, time::Duration};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const DEFAULT_SYMBOLS: &str = "NIFTY:NSE_INDEX";
const DEFAULT_REPORT_SECS: u64 = 30;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_logging();
    let _ = default_provider().install_default();

    let config = EngineConfig::from_env()?;
    let symbols = parse_symbols(
        &std::env::var("MONITOR_SYMBOLS").unwrap_or_else(|_| DEFAULT_SYMBOLS.to_string()),
    )?;
    let mode = std::env::var("MONITOR_MODE")
        .ok()
        .map(|mode| parse_mode(&mode))
        .transpose()?
        .unwrap_or_default();
    let report_every = std::env::var("MONITOR_REPORT_SECS")
        .ok()
        .and_then(|secs| secs.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_REPORT_SECS);

    let connection = ConnectionManager::new(config.connection()?);
    let engine = OrderflowEngine::new(connection, config);
    info!(url = ?engine.config().url.as_ref().map(|url| url.as_str()), "starting orderflow monitor");

    for key in &symbols {
        engine.watch(key.clone(), mode)?;
    }

    tokio::spawn(log_flow_events(engine.events()));

    let mut report = tokio::time::interval(Duration::from_secs(report_every));
    report.tick().await;

    loop {
        tokio::select! {
            _ = report.tick() => {
                debug!(state = %engine.connection().state(), "connection state");
                for key in &symbols {
                    log_summary(&engine, key);
                }
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(error) = result {
                    error!(%error, "failed to listen for shutdown signal");
                }
                break;
            }
        }
    }

    info!("shutting down");
    engine.shutdown().await?;
    Ok(())
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match std::env::var("LOG_FORMAT").as_deref() {
        Ok("json") => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        _ => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

/// Parse a comma separated list of `SYMBOL:EXCHANGE` keys.
fn parse_symbols(value: &str) -> Result<Vec<SymbolKey>, DataError> {
    let mut keys = value
        .split(',')
        .map(str::trim)
        .filter(|symbol| !symbol.is_empty())
        .map(str::parse::<SymbolKey>)
        .collect::<Result<Vec<_>, _>>()?;
    keys.sort();
    keys.dedup();

    if keys.is_empty() {
        return Err(DataError::Config {
            key: "MONITOR_SYMBOLS",
            value: value.to_string(),
        });
    }
    Ok(keys)
}

/// Accept a mode by name (`tick`) or by wire number (`4`).
fn parse_mode(value: &str) -> Result<SubscriptionMode, DataError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "ltp" => Ok(SubscriptionMode::Ltp),
        "quote" => Ok(SubscriptionMode::Quote),
        "depth" => Ok(SubscriptionMode::Depth),
        "tick" => Ok(SubscriptionMode::Tick),
        other => other
            .parse::<u8>()
            .map_err(|_| DataError::Config {
                key: "MONITOR_MODE",
                value: value.to_string(),
            })
            .and_then(SubscriptionMode::try_from),
    }
}

fn log_summary(engine: &OrderflowEngine, key: &SymbolKey) {
    let Some(summary) = engine.summary(key) else {
        debug!(%key, "no flow yet");
        return;
    };

    info!(
        %key,
        ticks = engine.store().len(key),
        bars = summary.bars,
        close = ?summary.close,
        poc = ?summary.poc,
        bar_volume = summary.bar_volume,
        bar_delta = summary.bar_delta,
        cvd = summary.cumulative_delta,
        divergence = ?summary.divergence,
        power_trades = summary.power_trades,
        "flow summary"
    );

    if let Ok(json) = serde_json::to_string(&summary) {
        debug!(%key, %json, "flow summary json");
    }
}

async fn log_flow_events(mut events: broadcast::Receiver<FlowEvent>) {
    loop {
        match events.recv().await {
            Ok(FlowEvent::PowerTrade {
                key,
                trade,
                high_alert,
            }) => {
                if high_alert {
                    warn!(%key, price = trade.price, volume = trade.volume, side = %trade.side, "HIGH ALERT power trade");
                } else {
                    info!(%key, price = trade.price, volume = trade.volume, side = %trade.side, "power trade");
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "flow event consumer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
