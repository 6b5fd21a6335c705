pub mod cli;
pub mod config;
pub mod connection;
pub mod driver;
pub mod driver_postgres;
pub mod errors;
pub mod export;
pub mod history;
mod materialize;
pub mod models;
pub mod query;
pub mod service;

use std::sync::Arc;

use clap::Parser;

pub use errors::{ConnectionError, ExportError, HistoryError, QueryError, ServiceError, ServiceResult};
pub use history::{HistoryRecorder, HistoryStore};
pub use models::{CellValue, ConnectionInfo, ExplainMode, ExportFormat, HistoryEntry, QueryResult};
pub use service::Service;

/// Binary entry: load `.env`, configure logging, open history, auto-connect
/// when a target is configured, then hand over to the prompt.
pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    let config = config::Config::parse();

    let level = if config.dev {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    let _ = env_logger::Builder::from_default_env()
        .filter_module("pglet", level)
        .is_test(false)
        .try_init();

    let store_dir = config.store_dir();
    log::info!(
        "pglet {} starting with data directory: {}",
        Service::version(),
        store_dir.display()
    );
    let history = HistoryStore::open(&config::history_db_path(&store_dir)).await?;
    let service = Service::postgres(config.pool_settings(), Arc::new(history));

    if let Some(url) = config.connection_url() {
        match service.connect(&url).await {
            Ok(info) => log::info!("auto-connected to {}@{}/{}", info.user, info.host, info.database),
            Err(e) => log::warn!("auto-connect failed: {}", e),
        }
    }

    let prompt = cli::run_prompt(&service).await;
    service.shutdown().await;
    prompt?;
    Ok(())
}
