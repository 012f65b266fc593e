//! Redis-backed DDQ for handler fleets spread across more than one process.
//!
//! Grounded on `rustpress_cache::backend::RedisBackend`'s pool-per-backend
//! shape; the set/list/TTL batch comes from spec.md §4.3's External-KV
//! implementation rather than from the teacher (a plain cache has no
//! eviction-reconciliation concept).

use async_trait::async_trait;
use redis::AsyncCommands;

use super::{Ddq, DdqStats};

/// DDQ backed by a Redis set (membership) + list (eviction order).
pub struct ExternalKvDdq {
    pool: Option<deadpool_redis::Pool>,
    capacity: usize,
    ttl_secs: u64,
    set_key: String,
    list_key: String,
}

impl ExternalKvDdq {
    /// Build a DDQ against `url`. If `url` is absent or the pool cannot be
    /// created, the instance stays disconnected and fails open on every
    /// `contains` call (spec.md §4.3: "deduplication failure must not stop
    /// message processing").
    pub fn new(capacity: usize, ttl_secs: u64, url: Option<&str>) -> Self {
        assert!(capacity > 0, "DDQ capacity must be positive");
        let pool = url.and_then(|url| {
            deadpool_redis::Config::from_url(url)
                .create_pool(Some(deadpool_redis::Runtime::Tokio1))
                .map_err(|e| tracing::warn!(error = %e, "failed to create DDQ redis pool"))
                .ok()
        });
        Self {
            pool,
            capacity,
            ttl_secs,
            set_key: "dispatchbus:ddq:set".to_string(),
            list_key: "dispatchbus:ddq:list".to_string(),
        }
    }

    /// Build against an already-constructed pool, for callers that manage
    /// their own Redis connection lifecycle. Keys are namespaced by `name`
    /// so multiple DDQ handles can share one Redis instance.
    pub fn with_pool(pool: deadpool_redis::Pool, capacity: usize, ttl_secs: u64, name: &str) -> Self {
        assert!(capacity > 0, "DDQ capacity must be positive");
        Self {
            pool: Some(pool),
            capacity,
            ttl_secs,
            set_key: format!("dispatchbus:ddq:{name}:set"),
            list_key: format!("dispatchbus:ddq:{name}:list"),
        }
    }

    async fn connection(&self) -> Option<deadpool_redis::Connection> {
        match &self.pool {
            Some(pool) => match pool.get().await {
                Ok(conn) => Some(conn),
                Err(e) => {
                    tracing::warn!(error = %e, "DDQ redis pool exhausted");
                    None
                }
            },
            None => None,
        }
    }
}

#[async_trait]
impl Ddq for ExternalKvDdq {
    async fn contains(&self, uuid: &str) -> bool {
        let Some(mut conn) = self.connection().await else {
            return false;
        };
        match conn.sismember::<_, _, bool>(&self.set_key, uuid).await {
            Ok(present) => present,
            Err(e) => {
                tracing::warn!(error = %e, "DDQ redis SISMEMBER failed, failing open");
                false
            }
        }
    }

    async fn add(&self, uuid: &str) {
        let Some(mut conn) = self.connection().await else {
            return;
        };

        if matches!(
            conn.sismember::<_, _, bool>(&self.set_key, uuid).await,
            Ok(true)
        ) {
            return;
        }

        let pipeline_result: redis::RedisResult<()> = redis::pipe()
            .atomic()
            .sadd(&self.set_key, uuid)
            .lpush(&self.list_key, uuid)
            .ltrim(&self.list_key, 0, self.capacity as isize - 1)
            .expire(&self.set_key, self.ttl_secs as i64)
            .expire(&self.list_key, self.ttl_secs as i64)
            .query_async(&mut conn)
            .await;

        if let Err(e) = pipeline_result {
            tracing::warn!(error = %e, "DDQ redis batch add failed");
            return;
        }

        // Reconcile: a concurrent writer may have pushed past capacity
        // between our SISMEMBER check and the LTRIM above, leaving the set
        // holding members the list already trimmed away. The list is
        // always exactly `capacity` long in steady state, so checking
        // SCARD (O(1)) against `capacity` rather than re-deriving the
        // trimmed list's length keeps the SMEMBERS/SREM reconciliation
        // path off the common case and only pays for it when the set has
        // actually drifted ahead of the list.
        let set_count: usize = match conn.scard(&self.set_key).await {
            Ok(n) => n,
            Err(_) => return,
        };
        if set_count > self.capacity {
            let survivors: Vec<String> = conn.lrange(&self.list_key, 0, -1).await.unwrap_or_default();
            let survivor_set: std::collections::HashSet<_> = survivors.into_iter().collect();
            let all_members: Vec<String> =
                conn.smembers(&self.set_key).await.unwrap_or_default();
            let stale: Vec<&String> = all_members
                .iter()
                .filter(|m| !survivor_set.contains(*m))
                .collect();
            if !stale.is_empty() {
                let _: redis::RedisResult<()> = conn.srem(&self.set_key, stale).await;
            }
        }
    }

    async fn stats(&self) -> DdqStats {
        let Some(mut conn) = self.connection().await else {
            return DdqStats {
                size: self.capacity,
                count: 0,
                utilization: 0.0,
            };
        };
        let count: usize = conn.scard(&self.set_key).await.unwrap_or(0);
        DdqStats {
            size: self.capacity,
            count,
            utilization: count as f64 / self.capacity as f64,
        }
    }

    async fn clear(&self) {
        if let Some(mut conn) = self.connection().await {
            let _: redis::RedisResult<()> = redis::pipe()
                .atomic()
                .del(&self.set_key)
                .del(&self.list_key)
                .query_async(&mut conn)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disconnected_instance_fails_open() {
        let ddq = ExternalKvDdq::new(10, 60, None);
        assert!(!ddq.contains("anything").await);
        ddq.add("anything").await;
        let stats = ddq.stats().await;
        assert_eq!(stats.count, 0);
    }
}
