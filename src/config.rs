use std::env;
use std::fmt;
use std::time::Duration;

/// Which admission engine backs the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Local,
    Distributed,
}

/// Configuration for the in-process engine: bounded bucket registry with
/// TTL eviction.
#[derive(Debug, Clone)]
pub struct LocalConfig {
    pub capacity: u64,
    pub refill_rate: u64,
    pub target_url: String,
    pub identity_header: String,
    pub max_entries: usize,
    pub cleanup_interval: Duration,
    pub expiration: Duration,
}

/// Configuration for the shared-store engine. Bucket state lives in Redis
/// and is reclaimed by key TTL, so `cleanup_interval` is carried for parity
/// with the local variant but the engine itself does not tick on it.
#[derive(Debug, Clone)]
pub struct DistributedConfig {
    pub capacity: u64,
    pub refill_rate: u64,
    pub target_url: String,
    pub identity_header: String,
    pub redis_address: String,
    pub redis_password: String,
    pub redis_db: i64,
    pub key_prefix: String,
    pub cleanup_interval: Duration,
    pub expiration: Duration,
}

/// Top-level service configuration for the binary.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub engine: EngineKind,
    pub proxy: bool,
    pub local: LocalConfig,
    pub distributed: DistributedConfig,
}

#[derive(Debug, Clone)]
pub enum ConfigError {
    InvalidCapacity(String),
    InvalidRefillRate(String),
    InvalidMaxEntries(String),
    InvalidDuration(String, String),
    InvalidRedisDb(String),
    InvalidEngine(String),
    InvalidFlag(String, String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidCapacity(msg) => write!(f, "Invalid capacity: {}", msg),
            ConfigError::InvalidRefillRate(msg) => write!(f, "Invalid refill rate: {}", msg),
            ConfigError::InvalidMaxEntries(msg) => write!(f, "Invalid max entries: {}", msg),
            ConfigError::InvalidDuration(name, msg) => {
                write!(f, "Invalid duration for {}: {}", name, msg)
            }
            ConfigError::InvalidRedisDb(msg) => write!(f, "Invalid Redis DB index: {}", msg),
            ConfigError::InvalidEngine(msg) => {
                write!(f, "Invalid engine (expected \"local\" or \"distributed\"): {}", msg)
            }
            ConfigError::InvalidFlag(name, msg) => write!(f, "Invalid flag {}: {}", name, msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            capacity: 20,
            refill_rate: 1,
            target_url: String::new(),
            identity_header: "X-ID".to_string(),
            max_entries: 1000,
            cleanup_interval: Duration::from_secs(60),
            expiration: Duration::from_secs(300),
        }
    }
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            capacity: 20,
            refill_rate: 1,
            target_url: String::new(),
            identity_header: "X-ID".to_string(),
            redis_address: "localhost:6379".to_string(),
            redis_password: String::new(),
            redis_db: 0,
            key_prefix: "ratelimit".to_string(),
            cleanup_interval: Duration::from_secs(5 * 60),
            expiration: Duration::from_secs(30 * 60),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".to_string(),
            engine: EngineKind::Local,
            proxy: false,
            local: LocalConfig::default(),
            distributed: DistributedConfig::default(),
        }
    }
}

impl LocalConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_rate(self.capacity, self.refill_rate)?;
        if self.max_entries == 0 {
            return Err(ConfigError::InvalidMaxEntries(
                "max entries must be greater than 0".to_string(),
            ));
        }
        if self.cleanup_interval.is_zero() || self.expiration.is_zero() {
            return Err(ConfigError::InvalidDuration(
                "cleanup_interval/expiration".to_string(),
                "must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl DistributedConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_rate(self.capacity, self.refill_rate)
    }
}

fn validate_rate(capacity: u64, refill_rate: u64) -> Result<(), ConfigError> {
    if capacity == 0 {
        return Err(ConfigError::InvalidCapacity(
            "capacity must be greater than 0".to_string(),
        ));
    }
    if refill_rate == 0 {
        return Err(ConfigError::InvalidRefillRate(
            "refill rate must be greater than 0".to_string(),
        ));
    }
    Ok(())
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(bind) = env::var("GATEKEEPER_BIND") {
            config.bind_address = bind;
        }

        if let Ok(engine) = env::var("GATEKEEPER_ENGINE") {
            config.engine = match engine.as_str() {
                "local" => EngineKind::Local,
                "distributed" | "redis" => EngineKind::Distributed,
                _ => return Err(ConfigError::InvalidEngine(engine)),
            };
        }

        if let Ok(target_url) = env::var("TARGET_URL") {
            config.local.target_url = target_url.clone();
            config.distributed.target_url = target_url;
        }
        // Proxy mode follows from a configured target unless overridden.
        config.proxy = !config.local.target_url.is_empty();
        if let Ok(proxy_str) = env::var("GATEKEEPER_PROXY") {
            config.proxy = proxy_str
                .parse()
                .map_err(|_| ConfigError::InvalidFlag("GATEKEEPER_PROXY".to_string(), proxy_str))?;
        }

        if let Ok(header) = env::var("IDENTITY_HEADER") {
            config.local.identity_header = header.clone();
            config.distributed.identity_header = header;
        }

        if let Ok(capacity_str) = env::var("CAPACITY") {
            let capacity = capacity_str
                .parse()
                .map_err(|_| ConfigError::InvalidCapacity(capacity_str))?;
            config.local.capacity = capacity;
            config.distributed.capacity = capacity;
        }

        if let Ok(rate_str) = env::var("REFILL_RATE") {
            let rate = rate_str
                .parse()
                .map_err(|_| ConfigError::InvalidRefillRate(rate_str))?;
            config.local.refill_rate = rate;
            config.distributed.refill_rate = rate;
        }

        if let Ok(entries_str) = env::var("MAX_ENTRIES") {
            config.local.max_entries = entries_str
                .parse()
                .map_err(|_| ConfigError::InvalidMaxEntries(entries_str))?;
        }

        if let Some(interval) = duration_from_env("CLEANUP_INTERVAL_SECS")? {
            config.local.cleanup_interval = interval;
            config.distributed.cleanup_interval = interval;
        }

        if let Some(expiration) = duration_from_env("EXPIRATION_SECS")? {
            config.local.expiration = expiration;
            config.distributed.expiration = expiration;
        }

        if let Ok(address) = env::var("REDIS_ADDRESS") {
            config.distributed.redis_address = address;
        }

        if let Ok(password) = env::var("REDIS_PASSWORD") {
            config.distributed.redis_password = password;
        }

        if let Ok(db_str) = env::var("REDIS_DB") {
            config.distributed.redis_db = db_str
                .parse()
                .map_err(|_| ConfigError::InvalidRedisDb(db_str))?;
        }

        if let Ok(prefix) = env::var("KEY_PREFIX") {
            config.distributed.key_prefix = prefix;
        }

        config.local.validate()?;
        config.distributed.validate()?;
        Ok(config)
    }
}

fn duration_from_env(name: &str) -> Result<Option<Duration>, ConfigError> {
    match env::var(name) {
        Ok(secs_str) => {
            let secs: u64 = secs_str
                .parse()
                .map_err(|_| ConfigError::InvalidDuration(name.to_string(), secs_str))?;
            if secs == 0 {
                return Err(ConfigError::InvalidDuration(
                    name.to_string(),
                    "must be greater than 0".to_string(),
                ));
            }
            Ok(Some(Duration::from_secs(secs)))
        }
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_defaults() {
        let config = LocalConfig::default();
        assert_eq!(config.capacity, 20);
        assert_eq!(config.refill_rate, 1);
        assert_eq!(config.identity_header, "X-ID");
        assert_eq!(config.max_entries, 1000);
        assert_eq!(config.cleanup_interval, Duration::from_secs(60));
        assert_eq!(config.expiration, Duration::from_secs(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_distributed_defaults() {
        let config = DistributedConfig::default();
        assert_eq!(config.redis_address, "localhost:6379");
        assert_eq!(config.redis_db, 0);
        assert_eq!(config.key_prefix, "ratelimit");
        assert_eq!(config.cleanup_interval, Duration::from_secs(300));
        assert_eq!(config.expiration, Duration::from_secs(1800));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = LocalConfig {
            capacity: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidCapacity(_))
        ));
    }

    #[test]
    fn test_zero_max_entries_rejected() {
        let config = LocalConfig {
            max_entries: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidMaxEntries(_))
        ));
    }
}
