//! Configuration for Courier

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable prefix for overrides, e.g. `COURIER__DELIVERY__BATCH_SIZE`
pub const ENV_PREFIX: &str = "COURIER";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Raw message storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Delivery policy
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Outbound SMTP client
    #[serde(default)]
    pub smtp_client: SmtpClientConfig,

    /// HTTP endpoint sender
    #[serde(default)]
    pub http_sender: HttpSenderConfig,

    /// Content inspection
    #[serde(default)]
    pub inspection: InspectionConfig,

    /// Queue worker
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Hostname of this node
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Name written into `locked_by` when leasing queued messages.
    /// Defaults to `<hostname>:<pid>`.
    pub locker_name: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            locker_name: None,
        }
    }
}

impl ServerConfig {
    /// Identity used for queue leases
    pub fn locker(&self) -> String {
        self.locker_name
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.hostname, std::process::id()))
    }
}

fn default_hostname() -> String {
    "localhost".to_string()
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
        }
    }
}

fn default_database_url() -> String {
    "postgres://localhost/courier".to_string()
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    5
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base path for raw message files
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("/var/lib/courier/messages")
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// Delivery policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Attempts after which a message is failed permanently
    #[serde(default = "default_maximum_delivery_attempts")]
    pub maximum_delivery_attempts: i32,

    /// Group queued messages sharing a batch key into one dequeue run
    #[serde(default = "default_true")]
    pub batch_queued_messages: bool,

    /// Maximum number of siblings leased alongside the requested message
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,

    /// How long suppression list entries are kept
    #[serde(default = "default_suppression_list_removal_days")]
    pub suppression_list_removal_days: i64,

    /// How long a held message may be released
    #[serde(default = "default_maximum_hold_expiry_days")]
    pub maximum_hold_expiry_days: i64,

    /// Base delay before the first retry
    #[serde(default = "default_retry_base_secs")]
    pub retry_base_secs: u64,

    /// Multiplier applied per previous attempt
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff: f64,

    /// Hard fails within the window that add a recipient to the suppression list
    #[serde(default = "default_hard_fail_suppression_threshold")]
    pub hard_fail_suppression_threshold: i64,

    /// Window for counting recent hard fails
    #[serde(default = "default_hard_fail_window_hours")]
    pub hard_fail_window_hours: i64,

    /// Fraction of the send limit at which the server is flagged as approaching
    #[serde(default = "default_send_limit_approaching_ratio")]
    pub send_limit_approaching_ratio: f64,

    /// Prepend a Resent-Sender header when relaying outgoing mail
    #[serde(default = "default_true")]
    pub use_resent_sender_header: bool,

    /// Domain used for envelope senders of outgoing mail
    #[serde(default = "default_return_path_domain")]
    pub return_path_domain: String,

    /// Base URL for click and open tracking, tracking is disabled when unset
    pub track_base_url: Option<String>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            maximum_delivery_attempts: default_maximum_delivery_attempts(),
            batch_queued_messages: true,
            batch_size: default_batch_size(),
            suppression_list_removal_days: default_suppression_list_removal_days(),
            maximum_hold_expiry_days: default_maximum_hold_expiry_days(),
            retry_base_secs: default_retry_base_secs(),
            retry_backoff: default_retry_backoff(),
            hard_fail_suppression_threshold: default_hard_fail_suppression_threshold(),
            hard_fail_window_hours: default_hard_fail_window_hours(),
            send_limit_approaching_ratio: default_send_limit_approaching_ratio(),
            use_resent_sender_header: true,
            return_path_domain: default_return_path_domain(),
            track_base_url: None,
        }
    }
}

impl DeliveryConfig {
    /// Delay before the next attempt when the sender gave no hint
    pub fn retry_delay(&self, attempts: i32) -> std::time::Duration {
        let factor = self.retry_backoff.powi(attempts.max(0));
        let secs = (self.retry_base_secs as f64 * factor).round();
        std::time::Duration::from_secs(secs.min(u32::MAX as f64) as u64)
    }
}

fn default_true() -> bool {
    true
}

fn default_maximum_delivery_attempts() -> i32 {
    18
}

fn default_batch_size() -> i64 {
    100
}

fn default_suppression_list_removal_days() -> i64 {
    30
}

fn default_maximum_hold_expiry_days() -> i64 {
    7
}

fn default_retry_base_secs() -> u64 {
    300
}

fn default_retry_backoff() -> f64 {
    1.3
}

fn default_hard_fail_suppression_threshold() -> i64 {
    1
}

fn default_hard_fail_window_hours() -> i64 {
    24
}

fn default_send_limit_approaching_ratio() -> f64 {
    0.9
}

fn default_return_path_domain() -> String {
    "rp.localhost".to_string()
}

/// Outbound SMTP client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpClientConfig {
    /// Name announced in HELO/EHLO, the server hostname when unset
    pub helo_hostname: Option<String>,

    /// Smart hosts (`host` or `host:port`) used instead of MX lookup
    #[serde(default)]
    pub relays: Vec<String>,

    /// Per-command timeout in seconds
    #[serde(default = "default_smtp_timeout")]
    pub timeout_secs: u64,

    /// Port for MX hosts
    #[serde(default = "default_smtp_port")]
    pub port: u16,
}

impl Default for SmtpClientConfig {
    fn default() -> Self {
        Self {
            helo_hostname: None,
            relays: Vec::new(),
            timeout_secs: default_smtp_timeout(),
            port: default_smtp_port(),
        }
    }
}

fn default_smtp_timeout() -> u64 {
    60
}

fn default_smtp_port() -> u16 {
    25
}

/// HTTP endpoint sender configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSenderConfig {
    /// Secret for the `X-Courier-Signature` header, unsigned when unset
    pub signing_secret: Option<String>,

    /// Timeout for endpoints that do not set their own
    #[serde(default = "default_http_timeout")]
    pub default_timeout_secs: u64,
}

impl Default for HttpSenderConfig {
    fn default() -> Self {
        Self {
            signing_secret: None,
            default_timeout_secs: default_http_timeout(),
        }
    }
}

fn default_http_timeout() -> u64 {
    5
}

/// Content inspection configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InspectionConfig {
    /// rspamd scanner
    #[serde(default)]
    pub rspamd: RspamdConfig,
}

/// rspamd configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RspamdConfig {
    /// Enable rspamd scanning
    #[serde(default)]
    pub enabled: bool,

    /// rspamd HTTP endpoint
    #[serde(default = "default_rspamd_url")]
    pub url: String,

    /// Request timeout in milliseconds
    #[serde(default = "default_rspamd_timeout")]
    pub timeout_ms: u64,

    /// Password for rspamd (if configured)
    pub password: Option<String>,
}

impl Default for RspamdConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_rspamd_url(),
            timeout_ms: default_rspamd_timeout(),
            password: None,
        }
    }
}

fn default_rspamd_url() -> String {
    "http://localhost:11333".to_string()
}

fn default_rspamd_timeout() -> u64 {
    5000
}

/// Queue worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Dequeue runs allowed in flight at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Seconds between queue polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Ready messages fetched per poll
    #[serde(default = "default_fetch_limit")]
    pub fetch_limit: i64,

    /// Leases older than this are considered abandoned
    #[serde(default = "default_stale_lock_minutes")]
    pub stale_lock_minutes: i64,

    /// Seconds between maintenance runs
    #[serde(default = "default_prune_interval")]
    pub prune_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_secs: default_poll_interval(),
            fetch_limit: default_fetch_limit(),
            stale_lock_minutes: default_stale_lock_minutes(),
            prune_interval_secs: default_prune_interval(),
        }
    }
}

fn default_concurrency() -> usize {
    10
}

fn default_poll_interval() -> u64 {
    5
}

fn default_fetch_limit() -> i64 {
    200
}

fn default_stale_lock_minutes() -> i64 {
    60
}

fn default_prune_interval() -> u64 {
    3600
}

impl Config {
    /// Load configuration from a file, applying environment overrides
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        Self::build(Some(path))
    }

    /// Load configuration from the first default location that exists,
    /// or from defaults and the environment alone
    pub fn load() -> crate::Result<Self> {
        let paths = [
            PathBuf::from("./courier.toml"),
            PathBuf::from("./config.toml"),
            PathBuf::from("/etc/courier/courier.toml"),
        ];

        let found = paths.iter().find(|path| path.exists());
        if let Some(path) = found {
            tracing::debug!(path = %path.display(), "Loading configuration file");
        }
        Self::build(found.map(PathBuf::as_path))
    }

    fn build(path: Option<&Path>) -> crate::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("smtp_client.relays"),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot work with
    pub fn validate(&self) -> crate::Result<()> {
        if self.delivery.maximum_delivery_attempts < 1 {
            return Err(crate::Error::Config(
                "delivery.maximum_delivery_attempts must be at least 1".to_string(),
            ));
        }
        if self.delivery.batch_size < 0 {
            return Err(crate::Error::Config(
                "delivery.batch_size must not be negative".to_string(),
            ));
        }
        if self.delivery.retry_backoff < 1.0 {
            return Err(crate::Error::Config(
                "delivery.retry_backoff must be at least 1.0".to_string(),
            ));
        }
        if self.worker.concurrency == 0 {
            return Err(crate::Error::Config(
                "worker.concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
