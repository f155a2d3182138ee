use clap::Parser;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use validator::{Validate, ValidationError};

use crate::error::{AdmissionError, Result};
use crate::tier::{non_zero_duration, TierLimit, TierTable};

/// Paths that bypass admission entirely. `/health` matches exactly, the rest by prefix.
pub const DEFAULT_EXEMPT_PATHS: [&str; 5] = ["/h2-console", "/actuator", "/health", "/swagger", "/v3/api-docs"];

/// Bucket store limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RegistryConfig {
    #[validate(range(min = 1, message = "max_entries must be greater than 0"))]
    pub max_entries: usize,
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "non_zero_duration"))]
    pub idle_ttl: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_entries: 100_000,
            idle_ttl: Duration::from_secs(60 * 60),
        }
    }
}

/// Where the caller address may come from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientIpConfig {
    /// Peers allowed to speak for the client through `X-Forwarded-For`.
    pub trusted_proxies: Vec<IpNet>,
    /// Legacy behavior: honor `X-Forwarded-For` from any peer.
    pub trust_forwarded_for: bool,
}

/// Everything the admission layer reads at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AdmissionConfig {
    #[validate(nested)]
    pub tier: TierTable,
    #[validate(nested)]
    pub registry: RegistryConfig,
    #[validate(custom(function = "valid_exempt_paths"))]
    pub exempt_paths: Vec<String>,
    pub client_ip: ClientIpConfig,
    /// Also send `X-Rate-Limit-Limit` and `X-Rate-Limit-Reset` on allowed requests.
    pub emit_limit_headers: bool,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            tier: TierTable::default(),
            registry: RegistryConfig::default(),
            exempt_paths: DEFAULT_EXEMPT_PATHS.iter().map(|p| p.to_string()).collect(),
            client_ip: ClientIpConfig::default(),
            emit_limit_headers: false,
        }
    }
}

#[allow(clippy::ptr_arg)]
fn valid_exempt_paths(paths: &Vec<String>) -> std::result::Result<(), ValidationError> {
    if let Some(bad) = paths.iter().find(|p| !p.starts_with('/')) {
        let mut err = ValidationError::new("exempt_path");
        err.message = Some(format!("exempt path '{}' must start with '/'", bad).into());
        return Err(err);
    }
    Ok(())
}

impl AdmissionConfig {
    /// Parse a JSON document. Missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: AdmissionConfig = serde_json::from_str(json)?;
        config.validated()
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AdmissionError::ConfigInvalid(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    /// Check capacities, windows and registry limits.
    pub fn validated(self) -> Result<Self> {
        self.validate()?;
        Ok(self)
    }
}

/// Sweep interval: a humantime duration greater than zero.
pub fn parse_sweep_interval(value: &str) -> std::result::Result<Duration, String> {
    let interval = humantime::parse_duration(value).map_err(|e| e.to_string())?;
    if interval.is_zero() {
        return Err("sweep interval must be greater than 0".to_string());
    }
    Ok(interval)
}

/// Command line and environment options. Unset admission options keep the
/// value from the config file, or the built-in default.
#[derive(Debug, Clone, Parser)]
#[command(name = "postnow-admission", version, about = "PostNow API admission layer")]
pub struct Cli {
    /// Server bind address
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:8080")]
    pub bind_addr: SocketAddr,

    /// Log level used when RUST_LOG is unset
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// How often idle buckets are swept
    #[arg(long, env = "ADMISSION_SWEEP_INTERVAL", default_value = "5m", value_parser = parse_sweep_interval)]
    pub sweep_interval: Duration,

    /// JSON admission config file
    #[arg(long = "config", env = "ADMISSION_CONFIG")]
    pub config_path: Option<PathBuf>,

    /// STRICT tier as <capacity>/<window>, e.g. 10/60s
    #[arg(long, env = "ADMISSION_TIER_STRICT")]
    pub tier_strict: Option<TierLimit>,

    /// MODERATE tier as <capacity>/<window>
    #[arg(long, env = "ADMISSION_TIER_MODERATE")]
    pub tier_moderate: Option<TierLimit>,

    /// LENIENT tier as <capacity>/<window>
    #[arg(long, env = "ADMISSION_TIER_LENIENT")]
    pub tier_lenient: Option<TierLimit>,

    /// AUTHENTICATED tier as <capacity>/<window>
    #[arg(long, env = "ADMISSION_TIER_AUTHENTICATED")]
    pub tier_authenticated: Option<TierLimit>,

    /// Maximum number of live buckets
    #[arg(long, env = "ADMISSION_REGISTRY_MAX_ENTRIES")]
    pub registry_max_entries: Option<usize>,

    /// Idle time after which a bucket may be evicted
    #[arg(long, env = "ADMISSION_REGISTRY_IDLE_TTL", value_parser = humantime::parse_duration)]
    pub registry_idle_ttl: Option<Duration>,

    /// Path prefix exempt from admission (repeatable, replaces the defaults)
    #[arg(long = "exempt-path", env = "ADMISSION_EXEMPT_PATHS", value_delimiter = ',')]
    pub exempt_paths: Vec<String>,

    /// Proxy CIDR whose X-Forwarded-For is trusted (repeatable)
    #[arg(long = "trusted-proxy", env = "ADMISSION_TRUSTED_PROXIES", value_delimiter = ',')]
    pub trusted_proxies: Vec<IpNet>,

    /// Trust X-Forwarded-For from any peer
    #[arg(long, env = "ADMISSION_TRUST_FORWARDED_FOR")]
    pub trust_forwarded_for: bool,

    /// Add X-Rate-Limit-Limit and X-Rate-Limit-Reset to allowed responses
    #[arg(long, env = "ADMISSION_EMIT_LIMIT_HEADERS")]
    pub emit_limit_headers: bool,
}

impl Cli {
    /// Resolve the admission config: defaults, then the file, then these options.
    pub fn admission_config(&self) -> Result<AdmissionConfig> {
        let mut config = match &self.config_path {
            Some(path) => AdmissionConfig::from_file(path)?,
            None => AdmissionConfig::default(),
        };

        if let Some(limit) = self.tier_strict {
            config.tier.strict = limit;
        }
        if let Some(limit) = self.tier_moderate {
            config.tier.moderate = limit;
        }
        if let Some(limit) = self.tier_lenient {
            config.tier.lenient = limit;
        }
        if let Some(limit) = self.tier_authenticated {
            config.tier.authenticated = limit;
        }
        if let Some(max_entries) = self.registry_max_entries {
            config.registry.max_entries = max_entries;
        }
        if let Some(idle_ttl) = self.registry_idle_ttl {
            config.registry.idle_ttl = idle_ttl;
        }
        if !self.exempt_paths.is_empty() {
            config.exempt_paths = self.exempt_paths.clone();
        }
        if !self.trusted_proxies.is_empty() {
            config.client_ip.trusted_proxies = self.trusted_proxies.clone();
        }
        config.client_ip.trust_forwarded_for |= self.trust_forwarded_for;
        config.emit_limit_headers |= self.emit_limit_headers;

        config.validated()
    }
}
