use serde::Deserialize;
use std::path::Path;

/// Top-level config loaded from `trackwave.toml`.
///
/// Deployment secrets (`DATABASE_URL`, `TRACKWAVE_BROKER_URL`,
/// `TRACKWAVE_BROKER_USER`, `TRACKWAVE_BROKER_PASS`) override the file via
/// [`TrackwaveConfig::apply_env`].
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TrackwaveConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub partition: PartitionConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub alert: AlertConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_url")]
    pub url: String,
    #[serde(default = "default_db_max_conns")]
    pub max_connections: u32,
    #[serde(default = "default_db_min_conns")]
    pub min_connections: u32,
    #[serde(default = "default_db_acquire_secs")]
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_db_url(),
            max_connections: default_db_max_conns(),
            min_connections: default_db_min_conns(),
            acquire_timeout_secs: default_db_acquire_secs(),
        }
    }
}

fn default_db_url() -> String {
    "postgres://localhost:5432/trackwave".to_string()
}

fn default_db_max_conns() -> u32 {
    20
}

fn default_db_min_conns() -> u32 {
    5
}

fn default_db_acquire_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_url")]
    pub url: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub pass: Option<String>,
    /// Prefix for per-session client ids (`{client_id}-{n}`).
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,
    #[serde(default = "default_max_inflight")]
    pub max_inflight: u16,
    /// Topic pattern every pooled session subscribes to.
    #[serde(default = "default_device_topic")]
    pub device_topic: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
            user: None,
            pass: None,
            client_id: default_client_id(),
            keepalive_secs: default_keepalive(),
            max_inflight: default_max_inflight(),
            device_topic: default_device_topic(),
        }
    }
}

fn default_broker_url() -> String {
    "mqtt://localhost:1883".to_string()
}

fn default_client_id() -> String {
    "trackwave".to_string()
}

fn default_keepalive() -> u64 {
    30
}

fn default_max_inflight() -> u16 {
    100
}

fn default_device_topic() -> String {
    "devices/+/location".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_pool_initial")]
    pub initial: usize,
    #[serde(default = "default_pool_max")]
    pub max: usize,
    /// Heuristic device capacity of one subscriber session.
    #[serde(default = "default_devices_per_session")]
    pub devices_per_session: usize,
    /// Scale up when estimated utilization exceeds this percentage.
    #[serde(default = "default_scale_threshold")]
    pub scale_threshold_pct: u8,
    /// Fleet size the pool is provisioned for at startup.
    #[serde(default = "default_expected_devices")]
    pub expected_devices: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial: default_pool_initial(),
            max: default_pool_max(),
            devices_per_session: default_devices_per_session(),
            scale_threshold_pct: default_scale_threshold(),
            expected_devices: default_expected_devices(),
        }
    }
}

fn default_pool_initial() -> usize {
    4
}

fn default_pool_max() -> usize {
    64
}

fn default_devices_per_session() -> usize {
    15
}

fn default_scale_threshold() -> u8 {
    80
}

fn default_expected_devices() -> usize {
    500
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// 0 = auto: `min(2 × cores, 32)`.
    #[serde(default)]
    pub workers: usize,
    #[serde(default = "default_per_device_queue")]
    pub per_device_queue: usize,
    #[serde(default = "default_directory_refresh")]
    pub directory_refresh_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            per_device_queue: default_per_device_queue(),
            directory_refresh_secs: default_directory_refresh(),
        }
    }
}

fn default_per_device_queue() -> usize {
    256
}

fn default_directory_refresh() -> u64 {
    60
}

impl IngestConfig {
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        (2 * cores).min(32)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_batch_size")]
    pub size: usize,
    #[serde(default = "default_batch_interval")]
    pub interval_ms: u64,
    #[serde(default = "default_max_queue")]
    pub max_queue: usize,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Below this per-device arrival interval a sample is sheddable under
    /// queue pressure.
    #[serde(default = "default_shed_floor_ms")]
    pub shed_floor_ms: u64,
    #[serde(default = "default_dead_letter_path")]
    pub dead_letter_path: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size: default_batch_size(),
            interval_ms: default_batch_interval(),
            max_queue: default_max_queue(),
            retries: default_retries(),
            backoff_ms: default_backoff_ms(),
            shed_floor_ms: default_shed_floor_ms(),
            dead_letter_path: default_dead_letter_path(),
        }
    }
}

fn default_batch_size() -> usize {
    500
}

fn default_batch_interval() -> u64 {
    1000
}

fn default_max_queue() -> usize {
    5000
}

fn default_retries() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    250
}

fn default_shed_floor_ms() -> u64 {
    5000
}

fn default_dead_letter_path() -> String {
    "./dead_letter.jsonl".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct PartitionConfig {
    #[serde(default = "default_warning_mb")]
    pub warning_mb: u64,
    #[serde(default = "default_critical_mb")]
    pub critical_mb: u64,
    #[serde(default = "default_emergency_mb")]
    pub emergency_mb: u64,
    #[serde(default = "default_true")]
    pub auto_split: bool,
    #[serde(default = "default_future_months")]
    pub future_months: u32,
    #[serde(default = "default_retention_months")]
    pub retention_months: u32,
    /// Scheduled monthly cleanup only drops partitions when this is set;
    /// the manual trigger carries its own confirmation flag.
    #[serde(default)]
    pub auto_cleanup: bool,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            warning_mb: default_warning_mb(),
            critical_mb: default_critical_mb(),
            emergency_mb: default_emergency_mb(),
            auto_split: true,
            future_months: default_future_months(),
            retention_months: default_retention_months(),
            auto_cleanup: false,
        }
    }
}

fn default_warning_mb() -> u64 {
    750
}

fn default_critical_mb() -> u64 {
    1000
}

fn default_emergency_mb() -> u64 {
    1400
}

fn default_future_months() -> u32 {
    3
}

fn default_retention_months() -> u32 {
    12
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Health probe floor for the hit rate, percent.
    #[serde(default = "default_min_hit_ratio")]
    pub min_hit_ratio_pct: u8,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            min_hit_ratio_pct: default_min_hit_ratio(),
        }
    }
}

fn default_max_entries() -> usize {
    100_000
}

fn default_min_hit_ratio() -> u8 {
    70
}

#[derive(Debug, Clone, Deserialize)]
pub struct BroadcastConfig {
    /// Minimum interval between broadcasts for one device.
    #[serde(default = "default_rate_limit_ms")]
    pub rate_limit_ms: u64,
    #[serde(default = "default_alert_speed")]
    pub alert_speed: f64,
    /// Operating-hours window, device-local wall clock.
    #[serde(default = "default_hours_start")]
    pub hours_start: u32,
    #[serde(default = "default_hours_end")]
    pub hours_end: u32,
    #[serde(default = "default_idle_close_secs")]
    pub idle_close_secs: u64,
    #[serde(default = "default_sweep_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            rate_limit_ms: default_rate_limit_ms(),
            alert_speed: default_alert_speed(),
            hours_start: default_hours_start(),
            hours_end: default_hours_end(),
            idle_close_secs: default_idle_close_secs(),
            sweep_interval_secs: default_sweep_secs(),
        }
    }
}

fn default_rate_limit_ms() -> u64 {
    100
}

fn default_alert_speed() -> f64 {
    120.0
}

fn default_hours_start() -> u32 {
    6
}

fn default_hours_end() -> u32 {
    22
}

fn default_idle_close_secs() -> u64 {
    3600
}

fn default_sweep_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertConfig {
    /// Token-bucket cap per alert kind per hour.
    #[serde(default = "default_per_hour")]
    pub per_hour: u32,
    /// Suppress repeats of (kind, device) inside this window.
    #[serde(default = "default_dedup_secs")]
    pub dedup_window_secs: u64,
    /// Transport flags passed through to external adapters on `/topic/alerts`.
    #[serde(default)]
    pub email: bool,
    #[serde(default)]
    pub sms: bool,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            per_hour: default_per_hour(),
            dedup_window_secs: default_dedup_secs(),
            email: false,
            sms: false,
        }
    }
}

fn default_per_hour() -> u32 {
    10
}

fn default_dedup_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_mem_threshold")]
    pub mem_threshold_pct: u8,
    #[serde(default = "default_cpu_threshold")]
    pub cpu_threshold_pct: u8,
    #[serde(default = "default_db_min_conns")]
    pub db_min_conns: u32,
    #[serde(default = "default_batch_success_pct")]
    pub batch_success_pct: u8,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            mem_threshold_pct: default_mem_threshold(),
            cpu_threshold_pct: default_cpu_threshold(),
            db_min_conns: default_db_min_conns(),
            batch_success_pct: default_batch_success_pct(),
        }
    }
}

fn default_mem_threshold() -> u8 {
    90
}

fn default_cpu_threshold() -> u8 {
    80
}

fn default_batch_success_pct() -> u8 {
    95
}

fn default_true() -> bool {
    true
}

impl TrackwaveConfig {
    /// Load config from a TOML file. Returns defaults if the file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("config file not found at {}, using defaults", path.display());
            return Ok(Self::default().apply_env());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: TrackwaveConfig = toml::from_str(&contents)?;
        tracing::info!("loaded config from {}", path.display());
        Ok(config.apply_env())
    }

    /// Environment overrides for deployment credentials.
    pub fn apply_env(mut self) -> Self {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(url) = std::env::var("TRACKWAVE_BROKER_URL") {
            self.broker.url = url;
        }
        if let Ok(user) = std::env::var("TRACKWAVE_BROKER_USER") {
            self.broker.user = Some(user);
        }
        if let Ok(pass) = std::env::var("TRACKWAVE_BROKER_PASS") {
            self.broker.pass = Some(pass);
        }
        self
    }
}
