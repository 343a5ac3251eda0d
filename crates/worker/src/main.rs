use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use loyaltysync_infra::customers::PostgresCustomerStore;
use loyaltysync_infra::external::LoyaltyClient;
use loyaltysync_infra::handlers::SyncHandlers;
use loyaltysync_infra::jobs::{JobService, PostgresJobStore};
use loyaltysync_infra::workers::SyncWorker;
use loyaltysync_infra::{SharedBackend, SyncSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    loyaltysync_observability::init();

    let settings = SyncSettings::from_env().context("loading configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&settings.database_url)
        .await
        .context("connecting to Postgres")?;

    let job_store = PostgresJobStore::new(pool.clone());
    job_store
        .ensure_schema()
        .await
        .context("creating job schema")?;
    let customers = PostgresCustomerStore::new(pool);
    customers
        .ensure_schema()
        .await
        .context("creating customer schema")?;

    let backend = SharedBackend::connect(settings.redis_url.as_deref()).await;
    let client = LoyaltyClient::from_settings(&settings.client_settings(), backend.clone())
        .context("building loyalty client")?;

    let jobs = JobService::new(job_store).with_policy(settings.retry_policy());
    let handlers = SyncHandlers::new(Arc::new(client), Arc::new(customers));
    let mut worker = SyncWorker::new(jobs, handlers, backend, settings.worker_config());

    tracing::info!(worker_id = %worker.worker_id(), "starting sync worker");
    worker
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            tracing::info!("shutdown signal received");
        })
        .await;

    Ok(())
}
