use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use lru::LruCache;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{DistributedConfig, LocalConfig};
use crate::error::GatekeeperError;
use crate::redis::RedisClient;
use crate::token_bucket::TokenBucket;

/// A registry entry pairs the bucket with the moment its identity last made
/// a request. Entries older than the expiration are removed by the sweeper.
struct BucketEntry {
    bucket: Arc<TokenBucket>,
    last_used: Instant,
}

type BucketMap = RwLock<LruCache<String, BucketEntry>>;

/// In-process admission engine: a bounded, approximately-LRU registry of
/// per-identity token buckets with periodic TTL eviction.
pub struct LocalRateLimiter {
    buckets: Arc<BucketMap>,
    stop_tx: watch::Sender<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl LocalRateLimiter {
    /// Builds the registry and spawns the sweeper task, so this must run
    /// inside a Tokio runtime.
    pub fn new(config: &LocalConfig) -> Result<Self, GatekeeperError> {
        config.validate()?;
        let max_entries = NonZeroUsize::new(config.max_entries).ok_or_else(|| {
            GatekeeperError::Config("max entries must be greater than 0".to_string())
        })?;
        let buckets: Arc<BucketMap> = Arc::new(RwLock::new(LruCache::new(max_entries)));

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let sweep_buckets = buckets.clone();
        let cleanup_interval = config.cleanup_interval;
        let expiration = config.expiration;
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_interval);
            // The first tick completes immediately; consume it so sweeps
            // land on interval boundaries.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => sweep_expired(&sweep_buckets, expiration),
                    _ = stop_rx.changed() => break,
                }
            }
        });

        Ok(Self {
            buckets,
            stop_tx,
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    /// Checks whether `id` may spend `cost` tokens. Capacity and refill rate
    /// apply when the identity's bucket is first created.
    pub fn allow(&self, id: &str, cost: u64, capacity: u64, refill_rate: u64) -> bool {
        let bucket = self.get_bucket(id, capacity, refill_rate);

        // Mark the entry fresh (and promote its recency) even if the lookup
        // above raced with an eviction or a sweep.
        {
            let mut cache = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = cache.get_mut(id) {
                entry.last_used = Instant::now();
            }
        }

        bucket.allow(cost)
    }

    fn get_bucket(&self, id: &str, capacity: u64, refill_rate: u64) -> Arc<TokenBucket> {
        // Fast path: shared guard, recency left to the caller's refresh.
        {
            let cache = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = cache.peek(id) {
                return entry.bucket.clone();
            }
        }

        let mut cache = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        // Another task may have inserted while we waited for the guard.
        if let Some(entry) = cache.get_mut(id) {
            entry.last_used = Instant::now();
            return entry.bucket.clone();
        }

        let bucket = Arc::new(TokenBucket::new(capacity, refill_rate));
        let entry = BucketEntry {
            bucket: bucket.clone(),
            last_used: Instant::now(),
        };
        if let Some((evicted, _)) = cache.push(id.to_string(), entry) {
            debug!(identity = %evicted, "evicted least-recently-used bucket");
        }
        bucket
    }

    /// Number of identities currently tracked.
    pub fn len(&self) -> usize {
        self.buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Signals the sweeper and waits for it to drain. Safe to call twice.
    pub async fn stop(&self) {
        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = self.stop_tx.send(true);
            if handle.await.is_err() {
                warn!("bucket sweeper terminated abnormally");
            } else {
                debug!("bucket sweeper stopped");
            }
        }
    }
}

fn sweep_expired(buckets: &BucketMap, expiration: Duration) {
    let now = Instant::now();

    // First pass: snapshot expired identities under the shared guard.
    let expired: Vec<String> = {
        let cache = buckets.read().unwrap_or_else(PoisonError::into_inner);
        cache
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_used) > expiration)
            .map(|(id, _)| id.clone())
            .collect()
    };
    if expired.is_empty() {
        return;
    }

    // Second pass: remove under the exclusive guard, re-checking each entry
    // in case it was touched between the two guards.
    let mut cache = buckets.write().unwrap_or_else(PoisonError::into_inner);
    let mut removed = 0usize;
    for id in &expired {
        let still_expired = cache
            .peek(id)
            .map(|entry| now.duration_since(entry.last_used) > expiration)
            .unwrap_or(false);
        if still_expired {
            cache.pop(id);
            removed += 1;
        }
    }
    if removed > 0 {
        debug!(removed, "swept expired buckets");
    }
}

/// Shared-store admission engine. Bucket state lives in Redis and every
/// decision is one atomic script execution, so any number of controller
/// instances agree on the same budget.
///
/// Store errors and timeouts deny the request; an infrastructure failure
/// never admits traffic.
pub struct DistributedRateLimiter {
    client: RedisClient,
    key_prefix: String,
    expiration: Duration,
    closed: AtomicBool,
}

impl DistributedRateLimiter {
    /// Connects to the store and probes it. A failed probe is logged but
    /// does not fail construction; each decision carries its own deadline.
    pub async fn connect(config: &DistributedConfig) -> Result<Self, GatekeeperError> {
        config.validate()?;
        let client = RedisClient::connect(
            &config.redis_address,
            &config.redis_password,
            config.redis_db,
        )
        .await?;

        Ok(Self {
            client,
            key_prefix: config.key_prefix.clone(),
            expiration: config.expiration,
            closed: AtomicBool::new(false),
        })
    }

    pub async fn allow(&self, id: &str, cost: u64, capacity: u64, refill_rate: u64) -> bool {
        if self.closed.load(Ordering::Acquire) {
            warn!("admission attempted on a closed store client");
            return false;
        }

        let bucket_key = format!("{}:{}", self.key_prefix, id);
        match self
            .client
            .run_admission_script(&bucket_key, cost, capacity, refill_rate, self.expiration)
            .await
        {
            Ok(allowed) => allowed,
            // Already logged by the client at the appropriate severity.
            Err(_) => false,
        }
    }

    /// Re-runs the readiness probe. Used by middleware construction to
    /// refuse installation over a store that never answered.
    pub async fn check_ready(&self) -> Result<(), GatekeeperError> {
        self.client.check_ready().await
    }

    /// Marks the client closed; subsequent decisions deny. Safe to call
    /// twice.
    pub fn stop(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("store client closed");
        }
    }
}
