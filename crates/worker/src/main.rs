use std::sync::Arc;

use cadence_common::config::AppConfig;
use cadence_common::db;
use cadence_common::redis_pool::create_redis_pool;
use cadence_worker::continuation::{ContinuationConsumer, RedisContinuationQueue};
use cadence_worker::driver::QueueDriver;
use cadence_worker::reaper::StaleClaimReaper;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence_worker=info,cadence_mailer=info".into()),
        )
        .json()
        .init();

    tracing::info!("Cadence send worker starting...");

    let config = AppConfig::from_env()?;

    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::migrate(&pool).await?;

    let redis = create_redis_pool(&config.redis_url).await?;

    let driver = Arc::new(QueueDriver::from_config(pool, redis.clone(), &config)?);
    let settings = driver.settings().clone();

    let consumer = ContinuationConsumer::new(
        Arc::new(RedisContinuationQueue::new(redis)),
        driver.clone(),
        settings.continuation_poll_interval,
    );
    let reaper = StaleClaimReaper::new(driver.store().clone(), settings.stale_claim_timeout);

    tracing::info!(
        batch_size = settings.batch_size,
        send_delay_ms = settings.send_delay.as_millis() as u64,
        max_chain_length = settings.max_chain_length,
        "Send worker ready"
    );

    tokio::select! {
        result = consumer.run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Continuation consumer exited with error");
                return Err(e);
            }
        }
        result = reaper.run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Stale claim reaper exited with error");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, stopping gracefully...");
        }
    }

    tracing::info!("Cadence send worker stopped.");
    Ok(())
}
