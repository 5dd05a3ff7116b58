//! Connection pool construction.

use deadpool_redis::{Config, Pool, PoolConfig, Runtime, Timeouts};
use futures_util::future::try_join_all;
use webcache_core::CacheConfig;

use crate::error::RedisError;

/// Build a pool for `config.redis_url` bounded by `pool_max` connections.
///
/// Acquisition, creation and recycling all give up after `pool_timeout`. No
/// connection is opened until [`warm`] or the first command.
pub fn build(config: &CacheConfig) -> Result<Pool, RedisError> {
    let mut timeouts = Timeouts::default();
    timeouts.wait = Some(config.pool_timeout());
    timeouts.create = Some(config.pool_timeout());
    timeouts.recycle = Some(config.pool_timeout());

    let mut pool_config = PoolConfig::new(config.pool_max);
    pool_config.timeouts = timeouts;

    let mut cfg = Config::from_url(config.redis_url.clone());
    cfg.pool = Some(pool_config);
    Ok(cfg.create_pool(Some(Runtime::Tokio1))?)
}

/// Open `min` connections up front and return them to the pool.
pub async fn warm(pool: &Pool, min: usize) -> Result<(), RedisError> {
    if min == 0 {
        return Ok(());
    }
    let connections = try_join_all((0..min).map(|_| pool.get())).await?;
    tracing::debug!(opened = connections.len(), max = pool.status().max_size, "redis pool warmed");
    Ok(())
}
