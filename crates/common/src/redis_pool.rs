use redis::Client;
use redis::aio::ConnectionManager;

/// Open the Redis connection manager backing the continuation queue.
///
/// `ConnectionManager` reconnects transparently, so one instance is cloned
/// into every task that schedules or consumes continuations.
pub async fn create_redis_pool(redis_url: &str) -> anyhow::Result<ConnectionManager> {
    let manager = Client::open(redis_url)?.get_connection_manager().await?;

    tracing::info!("Connected to Redis");
    Ok(manager)
}
