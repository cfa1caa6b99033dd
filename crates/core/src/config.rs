use std::env;

use serde::Deserialize;

use crate::error::{CdpError, CdpResult};

/// Root application configuration. Loaded from environment variables with
/// the prefix `CDP__`; the Kafka section additionally honors the stable
/// unprefixed `KAFKA_*` variable names shared with the other pipeline
/// deployments.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub processor: ProcessorConfig,
    #[serde(default)]
    pub connectors: ConnectorConfig,
    #[serde(default)]
    pub consent: ConsentConfig,
    #[serde(default)]
    pub erasure: ErasureConfig,
}

/// Message-bus connection and publisher retry settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: String,
    #[serde(default = "default_security_protocol")]
    pub security_protocol: String,
    #[serde(default = "default_sasl_mechanism")]
    pub sasl_mechanism: String,
    #[serde(default)]
    pub sasl_username: String,
    #[serde(default)]
    pub sasl_password: String,
    /// Maximum publish attempts before a terminal error.
    #[serde(default = "default_producer_max_retries")]
    pub producer_max_retries: u32,
    /// Base backoff in seconds; attempt n sleeps `base * 2^(n-1)`.
    #[serde(default = "default_producer_backoff_s")]
    pub producer_backoff_s: f64,
}

impl BusConfig {
    /// Read the stable `KAFKA_*` environment names, falling back to defaults.
    pub fn from_env() -> CdpResult<Self> {
        let mut cfg = Self::default();
        if let Ok(v) = env::var("KAFKA_BOOTSTRAP_SERVERS") {
            cfg.bootstrap_servers = v;
        }
        if let Ok(v) = env::var("KAFKA_SECURITY_PROTOCOL") {
            cfg.security_protocol = v;
        }
        if let Ok(v) = env::var("KAFKA_SASL_MECHANISM") {
            cfg.sasl_mechanism = v;
        }
        if let Ok(v) = env::var("KAFKA_SASL_USERNAME") {
            cfg.sasl_username = v;
        }
        if let Ok(v) = env::var("KAFKA_SASL_PASSWORD") {
            cfg.sasl_password = v;
        }
        if let Ok(v) = env::var("KAFKA_PRODUCER_MAX_RETRIES") {
            cfg.producer_max_retries = v.parse().map_err(|_| {
                CdpError::Config(format!("invalid KAFKA_PRODUCER_MAX_RETRIES: {v}"))
            })?;
        }
        if let Ok(v) = env::var("KAFKA_PRODUCER_BACKOFF_S") {
            cfg.producer_backoff_s = v
                .parse()
                .map_err(|_| CdpError::Config(format!("invalid KAFKA_PRODUCER_BACKOFF_S: {v}")))?;
        }
        Ok(cfg)
    }
}

/// Stream-processor tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorConfig {
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Concurrent in-flight messages per processor instance.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

impl ProcessorConfig {
    pub fn validate(&self) -> CdpResult<()> {
        if !(1..=500).contains(&self.batch_size) {
            return Err(CdpError::Config(format!(
                "processor.batch_size must be in 1..=500, got {}",
                self.batch_size
            )));
        }
        if !(1..=100).contains(&self.max_concurrency) {
            return Err(CdpError::Config(format!(
                "processor.max_concurrency must be in 1..=100, got {}",
                self.max_concurrency
            )));
        }
        Ok(())
    }
}

/// Consumer groups, quota limits, and webhook secrets for the ingestion
/// connectors.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectorConfig {
    #[serde(default = "default_clickstream_group")]
    pub clickstream_group: String,
    #[serde(default = "default_mobile_app_group")]
    pub mobile_app_group: String,
    /// Daily CRM API call budget; the connector pauses once it is spent.
    #[serde(default = "default_crm_daily_api_limit")]
    pub crm_daily_api_limit: u64,
    /// How long a rate-limited connector sleeps before polling again.
    #[serde(default = "default_rate_limit_pause_secs")]
    pub rate_limit_pause_secs: u64,
    /// Shared secret for messaging-provider webhook signatures; empty
    /// disables verification (dev only).
    #[serde(default)]
    pub messaging_webhook_secret: String,
    /// Shared secret for email-provider webhook signatures.
    #[serde(default)]
    pub email_webhook_secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsentConfig {
    #[serde(default = "default_terms_version")]
    pub terms_version: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErasureConfig {
    #[serde(default = "default_erasure_max_attempts")]
    pub max_attempts: u32,
    /// Per-store step timeout.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    /// Tombstone flush timeout for the bus step.
    #[serde(default = "default_bus_flush_timeout_secs")]
    pub bus_flush_timeout_secs: u64,
}

fn default_service_name() -> String {
    "cdp-pipeline".to_string()
}
fn default_environment() -> String {
    env::var("CDP_ENV").unwrap_or_else(|_| "development".to_string())
}
fn default_bootstrap_servers() -> String {
    "localhost:9092".to_string()
}
fn default_security_protocol() -> String {
    "PLAINTEXT".to_string()
}
fn default_sasl_mechanism() -> String {
    "PLAIN".to_string()
}
fn default_producer_max_retries() -> u32 {
    5
}
fn default_producer_backoff_s() -> f64 {
    0.5
}
fn default_consumer_group() -> String {
    "cdp-stream-processor".to_string()
}
fn default_batch_size() -> usize {
    50
}
fn default_max_concurrency() -> usize {
    10
}
fn default_poll_timeout_ms() -> u64 {
    1000
}
fn default_clickstream_group() -> String {
    "cdp-clickstream-cg".to_string()
}
fn default_mobile_app_group() -> String {
    "cdp-mobile-app-cg".to_string()
}
fn default_crm_daily_api_limit() -> u64 {
    100_000
}
fn default_rate_limit_pause_secs() -> u64 {
    3600
}
fn default_terms_version() -> String {
    "v2.1".to_string()
}
fn default_erasure_max_attempts() -> u32 {
    3
}
fn default_step_timeout_secs() -> u64 {
    30
}
fn default_bus_flush_timeout_secs() -> u64 {
    10
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: default_bootstrap_servers(),
            security_protocol: default_security_protocol(),
            sasl_mechanism: default_sasl_mechanism(),
            sasl_username: String::new(),
            sasl_password: String::new(),
            producer_max_retries: default_producer_max_retries(),
            producer_backoff_s: default_producer_backoff_s(),
        }
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            consumer_group: default_consumer_group(),
            batch_size: default_batch_size(),
            max_concurrency: default_max_concurrency(),
            poll_timeout_ms: default_poll_timeout_ms(),
        }
    }
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            clickstream_group: default_clickstream_group(),
            mobile_app_group: default_mobile_app_group(),
            crm_daily_api_limit: default_crm_daily_api_limit(),
            rate_limit_pause_secs: default_rate_limit_pause_secs(),
            messaging_webhook_secret: String::new(),
            email_webhook_secret: String::new(),
        }
    }
}

impl Default for ConsentConfig {
    fn default() -> Self {
        Self {
            terms_version: default_terms_version(),
        }
    }
}

impl Default for ErasureConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_erasure_max_attempts(),
            step_timeout_secs: default_step_timeout_secs(),
            bus_flush_timeout_secs: default_bus_flush_timeout_secs(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            environment: default_environment(),
            bus: BusConfig::default(),
            processor: ProcessorConfig::default(),
            connectors: ConnectorConfig::default(),
            consent: ConsentConfig::default(),
            erasure: ErasureConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> CdpResult<Self> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("CDP")
                .separator("__")
                .try_parsing(true),
        );
        let mut cfg: AppConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| CdpError::Config(e.to_string()))?;
        // Unprefixed KAFKA_* names win over defaults but not over explicit
        // CDP__BUS__* overrides.
        if env::var("CDP__BUS__BOOTSTRAP_SERVERS").is_err() {
            cfg.bus = BusConfig::from_env()?;
        }
        cfg.processor.validate()?;
        Ok(cfg)
    }
}
