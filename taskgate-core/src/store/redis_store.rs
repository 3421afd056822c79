//! [`RateLimitStore`] backed by Redis through the singleton connection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;

use super::connection::{ConnectionManager, RedisConnector};
use super::{RateLimitStore, StoreError};

/// Redis-backed store.
///
/// Every command borrows a clone of the multiplexed connection from the
/// [`ConnectionManager`]; commands from concurrent requests are pipelined on
/// the same socket.
#[derive(Clone)]
pub struct RedisStore {
    connections: Arc<ConnectionManager<RedisConnector>>,
}

impl RedisStore {
    pub fn new(connections: Arc<ConnectionManager<RedisConnector>>) -> Self {
        Self { connections }
    }

    pub fn connections(&self) -> &Arc<ConnectionManager<RedisConnector>> {
        &self.connections
    }

    /// Send one command. A dropped socket resets the shared connection.
    async fn query<T>(&self, command: &'static str, cmd: redis::Cmd) -> Result<T, StoreError>
    where
        T: redis::FromRedisValue + Send,
    {
        self.connections
            .run(|mut conn: MultiplexedConnection| async move {
                cmd.query_async(&mut conn)
                    .await
                    .map_err(|e| command_error(command, &e))
            })
            .await
    }
}

fn command_error(command: &'static str, e: &redis::RedisError) -> StoreError {
    let message = e.to_string();
    if e.is_connection_dropped() || e.is_io_error() {
        StoreError::ConnectionLost { command, message }
    } else {
        StoreError::Command { command, message }
    }
}

/// Redis expiries are whole seconds; never round a positive TTL down to 0.
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl RateLimitStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.query("GET", cmd).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl_secs(ttl));
        }
        self.query::<()>("SET", cmd).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut cmd = redis::cmd("EXPIRE");
        cmd.arg(key).arg(ttl_secs(ttl));
        let applied: i64 = self.query("EXPIRE", cmd).await?;
        Ok(applied == 1)
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        self.query::<i64>("DEL", cmd).await?;
        Ok(())
    }

    async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<(), StoreError> {
        let mut cmd = redis::cmd("ZADD");
        cmd.arg(key).arg(score).arg(member);
        self.query::<i64>("ZADD", cmd).await?;
        Ok(())
    }

    async fn zremrangebyscore(&self, key: &str, min: i64, max: i64) -> Result<u64, StoreError> {
        let mut cmd = redis::cmd("ZREMRANGEBYSCORE");
        cmd.arg(key).arg(min).arg(max);
        self.query("ZREMRANGEBYSCORE", cmd).await
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        let mut cmd = redis::cmd("ZCARD");
        cmd.arg(key);
        self.query("ZCARD", cmd).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        if self.connections.is_healthy().await {
            Ok(())
        } else {
            Err(StoreError::Connection {
                message: "PING failed".to_string(),
            })
        }
    }
}
