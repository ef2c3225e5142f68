pub mod models {
    pub mod tado;
}

pub mod breaker;
pub mod client;
pub mod collector;
pub mod config;
pub mod deadline;
pub mod extract;
pub mod metrics;
pub mod server;
pub mod upstream;
pub mod utils;

use crate::breaker::CircuitBreaker;
use crate::client::TadoClient;
use crate::collector::TadoCollector;
use crate::config::Config;
use crate::metrics::{ExporterMetrics, TadoMetrics};
use log::{error, info};
use prometheus::Registry;

pub fn run() -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (listen_address={}, scrape_timeout={}s, home_id={}, breaker_threshold={}, breaker_cooldown={}s)",
        cfg.listen_address,
        cfg.scrape_timeout.as_secs(),
        cfg.home_id
            .map(|h| h.0.to_string())
            .unwrap_or_else(|| "all".to_string()),
        cfg.breaker.failure_threshold,
        cfg.breaker.cooldown.as_secs()
    );

    // 2) Metric families
    let domain = TadoMetrics::new().map_err(|e| format!("creating domain metrics failed: {}", e))?;
    let exporter = ExporterMetrics::new().map_err(|e| format!("creating exporter metrics failed: {}", e))?;

    // 3) Upstream: client behind the circuit breaker. Authentication happens on the first scrape.
    let client = TadoClient::new(cfg.tado_refresh_token.clone(), &cfg.tado_firefox_version);
    let upstream = CircuitBreaker::new(client, cfg.breaker).with_state_gauge(exporter.circuit_breaker_state.clone());

    // 4) Register the collector; every /metrics request runs one scrape
    let collector = TadoCollector::new(upstream, cfg.collector_settings(), domain, exporter);
    let registry = Registry::new();
    registry
        .register(Box::new(collector))
        .map_err(|e| format!("registering collector failed: {}", e))?;

    // 5) Serve until Ctrl-C
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("starting async runtime failed: {}", e))?;
    runtime.block_on(server::serve(cfg.listen_address, registry))
}

fn main() {
    let loaded_env = match config::load_env_from_args(std::env::args().skip(1)) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(source) = loaded_env.as_ref() {
        let origin = if source.explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} .env file: {}", origin, source.path.display());
    }

    info!(
        "tado-exporter {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run() {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
