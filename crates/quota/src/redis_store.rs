use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::sync::OnceCell;
use tokio::time::timeout;

use crate::{KeyTtl, KvStore, QuotaError};

/// Shares one reconnecting connection across clones. The first command
/// connects; a failed connect is retried by the next command.
#[derive(Clone)]
pub struct RedisKv {
    client: redis::Client,
    conn: Arc<OnceCell<ConnectionManager>>,
    op_timeout: Duration,
}

impl RedisKv {
    pub fn new(url: &str, op_timeout: Duration) -> Result<Self, QuotaError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            conn: Arc::new(OnceCell::new()),
            op_timeout,
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, QuotaError> {
        let conn = timeout(
            self.op_timeout,
            self.conn
                .get_or_try_init(|| ConnectionManager::new(self.client.clone())),
        )
        .await
        .map_err(|_| QuotaError::Timeout)??;
        Ok(conn.clone())
    }

    async fn query<T: redis::FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T, QuotaError> {
        let mut conn = self.connection().await?;
        timeout(self.op_timeout, cmd.query_async(&mut conn))
            .await
            .map_err(|_| QuotaError::Timeout)?
            .map_err(QuotaError::from)
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis().min(u64::MAX as u128) as u64).max(1)
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get_f64(&self, key: &str) -> Result<Option<f64>, QuotaError> {
        let raw: Option<String> = self.query(redis::cmd("GET").arg(key)).await?;
        raw.map(|v| {
            v.parse::<f64>().map_err(|_| QuotaError::InvalidValue {
                key: key.to_string(),
            })
        })
        .transpose()
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, QuotaError> {
        let pttl: i64 = self.query(redis::cmd("PTTL").arg(key)).await?;
        Ok(match pttl {
            -2 => KeyTtl::Missing,
            ms if ms < 0 => KeyTtl::Persistent,
            ms => KeyTtl::Expires(Duration::from_millis(ms as u64)),
        })
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, QuotaError> {
        let reply: Option<String> = self
            .query(
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_millis(ttl)),
            )
            .await?;
        Ok(reply.is_some())
    }

    async fn set_f64_px(&self, key: &str, value: f64, ttl: Duration) -> Result<(), QuotaError> {
        let _: Option<String> = self
            .query(
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("PX")
                    .arg(ttl_millis(ttl)),
            )
            .await?;
        Ok(())
    }

    async fn incr_by_float(&self, key: &str, delta: f64) -> Result<f64, QuotaError> {
        self.query(redis::cmd("INCRBYFLOAT").arg(key).arg(delta))
            .await
    }

    async fn incr_by_float_with_ttl(
        &self,
        key: &str,
        delta: f64,
        ttl: Duration,
    ) -> Result<f64, QuotaError> {
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("INCRBYFLOAT")
            .arg(key)
            .arg(delta)
            .cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .arg("NX")
            .ignore();

        let (total,): (f64,) = timeout(self.op_timeout, pipe.query_async(&mut conn))
            .await
            .map_err(|_| QuotaError::Timeout)??;
        Ok(total)
    }

    async fn del(&self, key: &str) -> Result<(), QuotaError> {
        let _: i64 = self.query(redis::cmd("DEL").arg(key)).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), QuotaError> {
        let _: String = self.query(&redis::cmd("PING")).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_millis_never_rounds_to_zero() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_secs(3)), 3000);
    }

    #[test]
    fn invalid_url_is_rejected() {
        assert!(RedisKv::new("not a url", Duration::from_millis(50)).is_err());
    }
}
