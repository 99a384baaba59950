// src/main.rs
use env_logger::Builder;
use log::{error, info, LevelFilter};
use portfolio_tracker::api;
use portfolio_tracker::config::Config;
use portfolio_tracker::db::{ScyllaStore, Store};
use portfolio_tracker::market::MarketDataGateway;
use std::sync::Arc;
use tokio::task;
use tokio::time::{self, Duration};

const CACHE_SWEEP_INTERVAL_SECS: u64 = 300;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    Builder::new()
        .filter_level(LevelFilter::Info)
        .format_timestamp_secs()
        .init();

    let config = Arc::new(Config::from_env());

    let store: Arc<dyn Store> = match ScyllaStore::init(&config.scylla_node).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to initialize database: {}", e);
            return;
        }
    };
    info!("Connected to database...");

    let market = match MarketDataGateway::new(&config) {
        Ok(gateway) => Arc::new(gateway),
        Err(e) => {
            error!("Failed to build market data client: {}", e);
            return;
        }
    };

    // Periodic sweep of expired market-data cache entries.
    let sweeper = market.clone();
    task::spawn(async move {
        let mut interval = time::interval(Duration::from_secs(CACHE_SWEEP_INTERVAL_SECS));
        loop {
            interval.tick().await;
            sweeper.sweep_cache().await;
        }
    });

    let routes = api::routes(store, market, config.clone());

    info!("Server running on http://{}", config.bind_addr);
    warp::serve(routes).run(config.bind_addr).await;
}
