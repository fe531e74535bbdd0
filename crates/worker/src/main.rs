//! Course-generation worker process.
//!
//! Runs the generation and SME worker families against Postgres until
//! interrupted. Workers are plain threads; the tokio runtime only drives the
//! database pool.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use coursegen_ai::{KeyCipher, OpenAiCompatibleFactory, TenantKeyGateway};
use coursegen_core::SystemClock;
use coursegen_infra::config::WorkerSettings;
use coursegen_infra::content::{PostgresContent, Repositories, SettingsCredentials};
use coursegen_infra::jobs::{FinalizeLabels, PostgresJobStore};
use coursegen_infra::notify::TracingNotifier;
use coursegen_infra::schema::ensure_schema;
use coursegen_infra::workers::{WorkerServices, Workers};

const PROVIDER_TIMEOUT: Duration = Duration::from_secs(120);

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    coursegen_observability::init();

    let settings = WorkerSettings::from_env()?;
    let database_url = settings.require_database_url()?;
    let cipher = KeyCipher::from_base64(settings.require_encryption_key()?)
        .context("AI_KEY_ENCRYPTION_KEY is not a valid key")?;
    let factory =
        OpenAiCompatibleFactory::new(&settings.ai_base_url, &settings.ai_model, PROVIDER_TIMEOUT)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    let pool = runtime
        .block_on(
            PgPoolOptions::new()
                .max_connections(settings.database_max_connections)
                .connect(database_url),
        )
        .context("failed to connect to database")?;
    runtime
        .block_on(ensure_schema(&pool))
        .context("failed to apply schema")?;

    let content = Arc::new(PostgresContent::new(pool.clone(), runtime.handle().clone()));
    let repos = Repositories::shared(content);
    let gateway = TenantKeyGateway::new(
        SettingsCredentials::new(repos.ai_settings.clone()),
        cipher,
        factory,
    );

    let services = WorkerServices {
        store: Arc::new(PostgresJobStore::new(pool.clone(), runtime.handle().clone())),
        notifier: Arc::new(TracingNotifier),
        repos,
        gateway: Arc::new(gateway),
        clock: Arc::new(SystemClock),
        labels: FinalizeLabels::default(),
    };

    let workers = Workers::spawn(&services, &settings);
    info!(
        generation_workers = settings.generation_concurrency,
        "coursegen worker running; press ctrl-c to stop"
    );

    runtime
        .block_on(tokio::signal::ctrl_c())
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");

    workers.shutdown();
    runtime.block_on(pool.close());
    Ok(())
}
