use std::{sync::Arc, time::Duration};

use futures_util::future::join_all;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use ingest::{
    config::AppConfig, db, jobs::PgTaskQueue, state::AppState, storage::LocalContentStore, Worker,
};

const STRANDED_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "worker",
        database_url = %config.redacted_database_url(),
        pool_size = config.database_max_pool_size,
        concurrency = config.worker_concurrency,
        converter = %config.converter_program,
        converter_timeout_secs = config.converter_timeout_secs,
        max_attempts = config.job_max_attempts,
        "loaded worker configuration"
    );
    let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
    db::run_migrations(&pool)?;

    let storage = Arc::new(LocalContentStore::new(config.upload_dir.clone()));
    let queue = Arc::new(PgTaskQueue::new(
        pool.clone(),
        config.job_max_attempts,
        config.job_lease(),
    ));

    let poll_interval = config.poll_interval();
    let tags: Vec<String> = (0..config.worker_concurrency)
        .map(|index| config.processed_by(index))
        .collect();
    let state = Arc::new(AppState::new(pool, config, storage, queue));
    let workers: Vec<Worker> = tags
        .into_iter()
        .enumerate()
        .map(|(index, processed_by)| {
            let worker = Worker::new(state.clone(), processed_by, poll_interval);
            if index == 0 {
                worker.with_stranded_sweep(STRANDED_SWEEP_INTERVAL)
            } else {
                worker
            }
        })
        .collect();

    tokio::select! {
        _ = join_all(workers.iter().map(Worker::run)) => {}
        _ = signal::ctrl_c() => {
            tracing::info!("worker received shutdown signal");
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
