// src/main.rs
mod api;
mod auth;
mod config;
mod db;
mod error;
mod gateway;
mod models;
mod predictor;

use crate::config::{Config, StoreBackend};
use crate::db::{MemoryStore, ScyllaStore, UserStore};
use crate::gateway::{QuoteGateway, YahooChart};
use crate::predictor::Predictor;
use env_logger::Builder;
use log::{error, info, warn, LevelFilter};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    Builder::new()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .format_timestamp_secs()
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {}", e);
            return;
        }
    };

    let store: Arc<dyn UserStore> = match config.store {
        StoreBackend::Scylla => {
            match ScyllaStore::connect(&config.scylla_node, &config.keyspace).await {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    error!("Failed to initialize database: {}", e);
                    return;
                }
            }
        }
        StoreBackend::Memory => {
            warn!("Using the in-memory store; registrations are lost on restart.");
            Arc::new(MemoryStore::new())
        }
    };
    info!("Connected to {:?} store...", config.store);

    let market = match YahooChart::new(
        &config.market_data_url,
        config.provider_timeout,
        config.provider_max_retries,
        config.provider_retry_backoff,
    ) {
        Ok(market) => Arc::new(market),
        Err(e) => {
            error!("Failed to build market data client: {}", e);
            return;
        }
    };
    let gateway = Arc::new(QuoteGateway::new(market, config.exchange_suffix.clone()));
    let predictor = Arc::new(Predictor::new(gateway.clone(), config.history_start));

    let api = api::routes(
        store,
        gateway,
        predictor,
        Arc::new(config.index_tickers.clone()),
        &config.cors_origins,
    );

    info!("Server running on http://{}", config.bind_addr);
    warp::serve(api).run(config.bind_addr).await;
}
