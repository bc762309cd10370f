use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError, Script};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::error::GatekeeperError;

/// Server-side check-refill-consume. The store runs scripts single-threaded,
/// so one admission decision is atomic across both keys. Token counts are
/// fractional here, unlike the in-process bucket. The TTL is set when the
/// record is created and not refreshed on later writes, so a record is
/// reclaimed `expiration` seconds after its first appearance.
const ADMISSION_SCRIPT: &str = r#"
local bucket_key = KEYS[1]
local tokens_requested = tonumber(ARGV[1])
local total_tokens = tonumber(ARGV[2])
local refill_rate = tonumber(ARGV[3])
local expiration = tonumber(ARGV[4])

local current_tokens = redis.call('GET', bucket_key .. ':tokens')
local last_refill_time = redis.call('GET', bucket_key .. ':last_refill')
-- GET yields false for a missing key; remember it before defaulting, the
-- create-vs-update branch below depends on it.
local is_new = not current_tokens

if is_new then
    current_tokens = total_tokens
else
    current_tokens = tonumber(current_tokens)
end

local now = redis.call('TIME')
now = tonumber(now[1]) + (tonumber(now[2]) / 1000000)

if not last_refill_time then
    last_refill_time = now
else
    last_refill_time = tonumber(last_refill_time)
end

local elapsed = now - last_refill_time
current_tokens = math.min(total_tokens, current_tokens + elapsed * refill_rate)

local allowed = 0
if current_tokens >= tokens_requested then
    current_tokens = current_tokens - tokens_requested
    allowed = 1
end

if is_new then
    redis.call('SET', bucket_key .. ':tokens', current_tokens, 'EX', expiration)
    redis.call('SET', bucket_key .. ':last_refill', now, 'EX', expiration)
else
    redis.call('SET', bucket_key .. ':tokens', current_tokens)
    redis.call('SET', bucket_key .. ':last_refill', now)
end

return allowed
"#;

const READY_PINGS: u32 = 3;
const READY_PING_INTERVAL: Duration = Duration::from_secs(2);
const READY_DEADLINE: Duration = Duration::from_secs(5);
const CALL_DEADLINE: Duration = Duration::from_millis(500);

pub struct RedisClient {
    client: Client,
    script: Script,
    call_deadline: Duration,
}

impl RedisClient {
    /// Creates the client and probes the store. A failing probe is logged
    /// but does not fail construction; every call carries its own deadline.
    pub async fn connect(address: &str, password: &str, db: i64) -> Result<Self, GatekeeperError> {
        let url = redis_url(address, password, db);
        let client = Client::open(url.as_str())
            .map_err(|e| GatekeeperError::Redis(format!("failed to create client: {}", e)))?;
        info!(address = %address, db, "Redis client created");

        let client = Self {
            client,
            script: Script::new(ADMISSION_SCRIPT),
            call_deadline: CALL_DEADLINE,
        };
        if let Err(e) = client.check_ready().await {
            warn!("Redis not ready at construction: {}", e);
        }
        Ok(client)
    }

    /// Readiness probe: up to three pings at two-second intervals, bounded
    /// by a five-second overall deadline.
    pub async fn check_ready(&self) -> Result<(), GatekeeperError> {
        let probe = async {
            let mut last_err = GatekeeperError::Redis("no ping attempted".to_string());
            for attempt in 0..READY_PINGS {
                match self.ping().await {
                    Ok(()) => {
                        debug!(attempt, "Redis ping successful");
                        return Ok(());
                    }
                    Err(e) => last_err = e,
                }
                if attempt + 1 < READY_PINGS {
                    sleep(READY_PING_INTERVAL).await;
                }
            }
            Err(last_err)
        };

        match timeout(READY_DEADLINE, probe).await {
            Ok(result) => result,
            Err(_) => Err(GatekeeperError::Redis(
                "readiness probe timed out".to_string(),
            )),
        }
    }

    pub async fn ping(&self) -> Result<(), GatekeeperError> {
        let attempt = async {
            let mut conn = self.connection().await?;
            let response: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok::<String, RedisError>(response)
        };

        match timeout(self.call_deadline, attempt).await {
            Ok(Ok(response)) if response == "PONG" => Ok(()),
            Ok(Ok(response)) => Err(GatekeeperError::Redis(format!(
                "unexpected ping response: {}",
                response
            ))),
            Ok(Err(e)) => Err(GatekeeperError::Redis(format!("ping failed: {}", e))),
            Err(_) => Err(GatekeeperError::Redis("ping timed out".to_string())),
        }
    }

    /// Runs one atomic admission decision for `bucket_key` under the
    /// per-call deadline. Errors are logged here with their severity:
    /// unreachable store is a warning, a script evaluation failure an error.
    pub async fn run_admission_script(
        &self,
        bucket_key: &str,
        tokens_requested: u64,
        total_tokens: u64,
        refill_rate: u64,
        expiration: Duration,
    ) -> Result<bool, GatekeeperError> {
        let call = async {
            let mut conn = self.connection().await?;
            let allowed: i64 = self
                .script
                .key(bucket_key)
                .arg(tokens_requested)
                .arg(total_tokens)
                .arg(refill_rate)
                .arg(expiration.as_secs())
                .invoke_async(&mut conn)
                .await?;
            Ok::<i64, RedisError>(allowed)
        };

        match timeout(self.call_deadline, call).await {
            Ok(Ok(allowed)) => Ok(allowed == 1),
            Ok(Err(e)) => {
                match e.kind() {
                    redis::ErrorKind::IoError => {
                        warn!(key = %bucket_key, "store unreachable during admission: {}", e)
                    }
                    _ => error!(key = %bucket_key, "admission script failed: {}", e),
                }
                Err(GatekeeperError::Redis(e.to_string()))
            }
            Err(_) => {
                warn!(key = %bucket_key, "admission call exceeded its deadline");
                Err(GatekeeperError::Redis(
                    "admission call timed out".to_string(),
                ))
            }
        }
    }

    async fn connection(&self) -> Result<MultiplexedConnection, RedisError> {
        self.client.get_multiplexed_async_connection().await
    }
}

fn redis_url(address: &str, password: &str, db: i64) -> String {
    if password.is_empty() {
        format!("redis://{}/{}", address, db)
    } else {
        format!("redis://:{}@{}/{}", address, password, db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_url_without_password() {
        assert_eq!(redis_url("localhost:6379", "", 0), "redis://localhost:6379/0");
    }

    #[test]
    fn test_redis_url_with_password() {
        assert_eq!(
            redis_url("redis.internal:6380", "hunter2", 3),
            "redis://:hunter2@redis.internal:6380/3"
        );
    }

    #[test]
    fn test_script_sets_ttl_only_on_create() {
        // Both keys get an expiration in the create branch and a bare SET in
        // the update branch.
        let create_sets = ADMISSION_SCRIPT.matches("'EX', expiration").count();
        assert_eq!(create_sets, 2);
        let bare_sets = ADMISSION_SCRIPT
            .matches("redis.call('SET', bucket_key .. ':tokens', current_tokens)")
            .count();
        assert_eq!(bare_sets, 1);
    }
}
