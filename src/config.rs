use std::time::Duration;

use anyhow::Result;

// ============================================================================
// Configuration Constants
// ============================================================================

const DEFAULT_HEALTH_PORT: u16 = 8081;

// Queue defaults
const DEFAULT_PARTITION_COUNT: usize = 16;
const DEFAULT_DEDUP_WINDOW_SECS: i64 = 86400;
const DEFAULT_CANCEL_GRACE_MS: u64 = 5000;

// Dispatch defaults
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_BACKOFF_BASE_MS: u64 = 1000;
const DEFAULT_BACKOFF_CAP_MS: u64 = 300_000; // 5 minutes
const DEFAULT_ATTEMPT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_MAX_LANE_ATTEMPTS: u32 = 2;

// Sync defaults
const DEFAULT_SYNC_PAGE_SIZE: usize = 100;

// Rate limit defaults
const DEFAULT_SEND_PER_WINDOW: u32 = 60;
const DEFAULT_CONVERSATION_CREATES_PER_WINDOW: u32 = 10;
const DEFAULT_RATE_WINDOW_SECS: i64 = 60;

// Region defaults
const DEFAULT_HEARTBEAT_TTL_SECS: i64 = 90;

// Retention defaults
const DEFAULT_DELIVERED_RETENTION_DAYS: i64 = 7;
const DEFAULT_FAILED_RETENTION_DAYS: i64 = 30;
const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 300;
const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 60;
const DEFAULT_TYPING_TTL_SECS: u64 = 10;
const DEFAULT_RECEIPT_TTL_SECS: u64 = 60;

// Time conversion constants
pub const SECONDS_PER_MINUTE: i64 = 60;
pub const SECONDS_PER_HOUR: i64 = 3600;
pub const SECONDS_PER_DAY: i64 = 86400;

// ============================================================================
// Configuration Structures
// ============================================================================

/// Message queue configuration.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Number of partitions; a conversation always hashes to the same one.
    pub partition_count: usize,
    /// Window within which a repeated clientMessageId is a duplicate.
    pub dedup_window_secs: i64,
    /// Grace window during which a sender may cancel before first attempt.
    pub cancel_grace_ms: u64,
}

/// Delivery dispatcher configuration.
#[derive(Clone, Debug)]
pub struct DispatchConfig {
    /// Failed attempts before a record is dropped.
    pub max_attempts: u32,
    /// Base delay for exponential backoff (doubles per failed attempt).
    pub backoff_base_ms: u64,
    /// Backoff ceiling.
    pub backoff_cap_ms: u64,
    /// Bound on a single delivery attempt; exceeding it is a failed attempt.
    pub attempt_timeout_ms: u64,
    /// Attempt cap for the MAX-priority lane (no backoff between attempts).
    pub max_lane_attempts: u32,
}

impl DispatchConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }
}

/// Offline sync configuration.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Maximum records per sync page.
    pub page_size: usize,
}

/// Rate limiter configuration.
#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub sends_per_window: u32,
    pub conversation_creates_per_window: u32,
    pub window_secs: i64,
    /// Floor for the risk-adjustment multiplier (highest risk tier).
    pub min_risk_multiplier: f64,
}

/// Region routing configuration for this deployment.
#[derive(Clone, Debug)]
pub struct RegionConfig {
    /// Region this process runs in.
    pub local_region: String,
    /// Default home region for countries the directory does not know.
    pub default_region: String,
    /// Heartbeats older than this mark a region Down regardless of status.
    pub heartbeat_ttl_secs: i64,
}

/// Retention and background job configuration.
#[derive(Clone, Debug)]
pub struct RetentionConfig {
    /// DELIVERED records are purged after this many days.
    pub delivered_retention_days: i64,
    /// FAILED/DROPPED records are kept longer for audit.
    pub failed_retention_days: i64,
    pub cleanup_interval_secs: u64,
    pub reconcile_interval_secs: u64,
    pub typing_ttl_secs: u64,
    pub receipt_ttl_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    /// Log raw user identifiers instead of salted hashes.
    pub enable_user_identifiers: bool,
    pub hash_salt: String,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub health_port: u16,
    pub rust_log: String,
    pub queue: QueueConfig,
    pub dispatch: DispatchConfig,
    pub sync: SyncConfig,
    pub rate: RateLimitConfig,
    pub region: RegionConfig,
    pub retention: RetentionConfig,
    pub logging: LoggingConfig,
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let partition_count: usize = env_parsed("PARTITION_COUNT", DEFAULT_PARTITION_COUNT);
        if partition_count == 0 {
            anyhow::bail!("PARTITION_COUNT must be at least 1");
        }

        let min_risk_multiplier: f64 = env_parsed("MIN_RISK_MULTIPLIER", 0.25);
        if !(0.0..=1.0).contains(&min_risk_multiplier) {
            anyhow::bail!("MIN_RISK_MULTIPLIER must be within 0.0..=1.0");
        }

        Ok(Self {
            health_port: env_parsed("HEALTH_PORT", DEFAULT_HEALTH_PORT),
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            queue: QueueConfig {
                partition_count,
                dedup_window_secs: env_parsed("DEDUP_WINDOW_SECS", DEFAULT_DEDUP_WINDOW_SECS),
                cancel_grace_ms: env_parsed("CANCEL_GRACE_MS", DEFAULT_CANCEL_GRACE_MS),
            },
            dispatch: DispatchConfig {
                max_attempts: env_parsed("MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS),
                backoff_base_ms: env_parsed("BACKOFF_BASE_MS", DEFAULT_BACKOFF_BASE_MS),
                backoff_cap_ms: env_parsed("BACKOFF_CAP_MS", DEFAULT_BACKOFF_CAP_MS),
                attempt_timeout_ms: env_parsed("ATTEMPT_TIMEOUT_MS", DEFAULT_ATTEMPT_TIMEOUT_MS),
                max_lane_attempts: env_parsed("MAX_LANE_ATTEMPTS", DEFAULT_MAX_LANE_ATTEMPTS),
            },
            sync: SyncConfig {
                page_size: env_parsed("SYNC_PAGE_SIZE", DEFAULT_SYNC_PAGE_SIZE),
            },
            rate: RateLimitConfig {
                sends_per_window: env_parsed("RATE_SENDS_PER_WINDOW", DEFAULT_SEND_PER_WINDOW),
                conversation_creates_per_window: env_parsed(
                    "RATE_CONVERSATION_CREATES_PER_WINDOW",
                    DEFAULT_CONVERSATION_CREATES_PER_WINDOW,
                ),
                window_secs: env_parsed("RATE_WINDOW_SECS", DEFAULT_RATE_WINDOW_SECS),
                min_risk_multiplier,
            },
            region: RegionConfig {
                local_region: std::env::var("LOCAL_REGION")
                    .unwrap_or_else(|_| "eu-west".to_string()),
                default_region: std::env::var("DEFAULT_REGION")
                    .unwrap_or_else(|_| "eu-west".to_string()),
                heartbeat_ttl_secs: env_parsed("HEARTBEAT_TTL_SECS", DEFAULT_HEARTBEAT_TTL_SECS),
            },
            retention: RetentionConfig {
                delivered_retention_days: env_parsed(
                    "DELIVERED_RETENTION_DAYS",
                    DEFAULT_DELIVERED_RETENTION_DAYS,
                ),
                failed_retention_days: env_parsed(
                    "FAILED_RETENTION_DAYS",
                    DEFAULT_FAILED_RETENTION_DAYS,
                ),
                cleanup_interval_secs: env_parsed(
                    "CLEANUP_INTERVAL_SECS",
                    DEFAULT_CLEANUP_INTERVAL_SECS,
                ),
                reconcile_interval_secs: env_parsed(
                    "RECONCILE_INTERVAL_SECS",
                    DEFAULT_RECONCILE_INTERVAL_SECS,
                ),
                typing_ttl_secs: env_parsed("TYPING_TTL_SECS", DEFAULT_TYPING_TTL_SECS),
                receipt_ttl_secs: env_parsed("RECEIPT_TTL_SECS", DEFAULT_RECEIPT_TTL_SECS),
            },
            logging: LoggingConfig {
                enable_user_identifiers: env_parsed("LOG_USER_IDENTIFIERS", false),
                hash_salt: std::env::var("LOG_HASH_SALT")
                    .unwrap_or_else(|_| "courier-dev-salt".to_string()),
            },
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            health_port: DEFAULT_HEALTH_PORT,
            rust_log: "info".to_string(),
            queue: QueueConfig {
                partition_count: DEFAULT_PARTITION_COUNT,
                dedup_window_secs: DEFAULT_DEDUP_WINDOW_SECS,
                cancel_grace_ms: DEFAULT_CANCEL_GRACE_MS,
            },
            dispatch: DispatchConfig {
                max_attempts: DEFAULT_MAX_ATTEMPTS,
                backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
                backoff_cap_ms: DEFAULT_BACKOFF_CAP_MS,
                attempt_timeout_ms: DEFAULT_ATTEMPT_TIMEOUT_MS,
                max_lane_attempts: DEFAULT_MAX_LANE_ATTEMPTS,
            },
            sync: SyncConfig {
                page_size: DEFAULT_SYNC_PAGE_SIZE,
            },
            rate: RateLimitConfig {
                sends_per_window: DEFAULT_SEND_PER_WINDOW,
                conversation_creates_per_window: DEFAULT_CONVERSATION_CREATES_PER_WINDOW,
                window_secs: DEFAULT_RATE_WINDOW_SECS,
                min_risk_multiplier: 0.25,
            },
            region: RegionConfig {
                local_region: "eu-west".to_string(),
                default_region: "eu-west".to_string(),
                heartbeat_ttl_secs: DEFAULT_HEARTBEAT_TTL_SECS,
            },
            retention: RetentionConfig {
                delivered_retention_days: DEFAULT_DELIVERED_RETENTION_DAYS,
                failed_retention_days: DEFAULT_FAILED_RETENTION_DAYS,
                cleanup_interval_secs: DEFAULT_CLEANUP_INTERVAL_SECS,
                reconcile_interval_secs: DEFAULT_RECONCILE_INTERVAL_SECS,
                typing_ttl_secs: DEFAULT_TYPING_TTL_SECS,
                receipt_ttl_secs: DEFAULT_RECEIPT_TTL_SECS,
            },
            logging: LoggingConfig {
                enable_user_identifiers: false,
                hash_salt: "courier-dev-salt".to_string(),
            },
        }
    }
}
