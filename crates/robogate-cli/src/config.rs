//! Gateway configuration: optional TOML file plus `ROBOGATE_*` overrides.
//!
//! Resolution order, later wins:
//!
//! 1. built-in defaults,
//! 2. the TOML file named by `ROBOGATE_CONFIG` (if set),
//! 3. individual `ROBOGATE_*` environment variables.
//!
//! A malformed file is fatal.  A malformed environment value is skipped and
//! reported as a warning, which `main` logs once tracing is up.

use std::collections::HashMap;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use robogate_gateway::GatewayConfig;
use robogate_kernel::SafetyConfig;
use robogate_types::GateError;
use serde::{Deserialize, Serialize};

/// Environment variable naming the TOML file.
pub const CONFIG_PATH_ENV: &str = "ROBOGATE_CONFIG";

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub max_linear_velocity: f64,
    pub max_angular_velocity: f64,
    pub lock_lease_secs: u64,
    pub command_timeout_ms: u64,
    pub log_level: String,
    pub log_format: LogFormat,
    /// OTLP/HTTP collector base URL.  Unset disables span export.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub otlp_endpoint: Option<String>,
    /// Base URL of the persistence service.  Unset means nothing is stored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sink_url: Option<String>,
    pub rate_limit_per_minute: u32,
    /// Simulated robots started at boot.
    pub sim_robots: Vec<String>,
    /// Token → user ID.  Empty selects the development authenticator.
    pub auth_tokens: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_linear_velocity: 1.0,
            max_angular_velocity: 1.5,
            lock_lease_secs: 300,
            command_timeout_ms: 1000,
            log_level: "info".to_string(),
            log_format: LogFormat::Compact,
            otlp_endpoint: None,
            sink_url: None,
            rate_limit_per_minute: 600,
            sim_robots: vec!["sim-1".to_string()],
            auth_tokens: HashMap::new(),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("max_linear_velocity", &self.max_linear_velocity)
            .field("max_angular_velocity", &self.max_angular_velocity)
            .field("lock_lease_secs", &self.lock_lease_secs)
            .field("command_timeout_ms", &self.command_timeout_ms)
            .field("log_level", &self.log_level)
            .field("log_format", &self.log_format)
            .field("otlp_endpoint", &self.otlp_endpoint.as_deref().map(redact_url))
            .field("sink_url", &self.sink_url.as_deref().map(redact_url))
            .field("rate_limit_per_minute", &self.rate_limit_per_minute)
            .field("sim_robots", &self.sim_robots)
            .field(
                "auth_tokens",
                &format_args!("<{} redacted>", self.auth_tokens.len()),
            )
            .finish()
    }
}

/// Shape of each log line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    /// Newline-delimited JSON.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "compact" | "text" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format {other:?}")),
        }
    }
}

/// Replace `user:password@` in a URL with `***@`.
fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{scheme}://***@{}", &rest[at + 1..]),
        None => url.to_string(),
    }
}

/// A resolved configuration and the problems skipped while resolving it.
#[derive(Debug)]
pub struct Loaded {
    pub config: Config,
    pub source: Option<PathBuf>,
    pub warnings: Vec<String>,
}

/// Resolve the configuration from `ROBOGATE_CONFIG` and the process
/// environment.
///
/// # Errors
///
/// [`GateError::Config`] when the named file cannot be read or parsed.
pub fn load() -> Result<Loaded, GateError> {
    let source = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
    let mut config = match &source {
        Some(path) => load_from(path)?,
        None => Config::default(),
    };
    let warnings = apply_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(Loaded {
        config,
        source,
        warnings,
    })
}

/// Parse the TOML file at `path`.  Missing keys keep their defaults.
pub fn load_from(path: &Path) -> Result<Config, GateError> {
    let raw = fs::read_to_string(path).map_err(|e| {
        GateError::Config(format!("failed to read {}: {e}", path.display()))
    })?;
    toml::from_str(&raw)
        .map_err(|e| GateError::Config(format!("failed to parse {}: {e}", path.display())))
}

fn parse_into<T: std::str::FromStr>(
    raw: Option<String>,
    key: &str,
    slot: &mut T,
    warnings: &mut Vec<String>,
) {
    if let Some(raw) = raw {
        match raw.trim().parse() {
            Ok(value) => *slot = value,
            Err(_) => warnings.push(format!("ignoring {key}={raw:?}: not a valid value")),
        }
    }
}

/// Apply `ROBOGATE_*` overrides read through `lookup`.  Returns a warning
/// per value that could not be parsed; those fields keep their prior value.
///
/// | Variable | Field |
/// |---|---|
/// | `ROBOGATE_HOST` | `host` |
/// | `ROBOGATE_PORT` | `port` |
/// | `ROBOGATE_MAX_LINEAR_VELOCITY` | `max_linear_velocity` |
/// | `ROBOGATE_MAX_ANGULAR_VELOCITY` | `max_angular_velocity` |
/// | `ROBOGATE_LOCK_LEASE_SECS` | `lock_lease_secs` |
/// | `ROBOGATE_COMMAND_TIMEOUT_MS` | `command_timeout_ms` |
/// | `ROBOGATE_LOG_LEVEL` | `log_level` |
/// | `ROBOGATE_LOG_FORMAT` | `log_format` (`compact` or `json`) |
/// | `OTEL_EXPORTER_OTLP_ENDPOINT` | `otlp_endpoint` |
/// | `ROBOGATE_SINK_URL` | `sink_url` |
/// | `ROBOGATE_RATE_LIMIT_PER_MINUTE` | `rate_limit_per_minute` |
/// | `ROBOGATE_SIM_ROBOTS` | `sim_robots` (comma separated) |
/// | `ROBOGATE_AUTH_TOKENS` | `auth_tokens` (`token:user,...`) |
pub fn apply_overrides<F>(cfg: &mut Config, lookup: F) -> Vec<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut warnings = Vec::new();

    if let Some(host) = lookup("ROBOGATE_HOST") {
        cfg.host = host;
    }
    parse_into(lookup("ROBOGATE_PORT"), "ROBOGATE_PORT", &mut cfg.port, &mut warnings);
    parse_into(
        lookup("ROBOGATE_MAX_LINEAR_VELOCITY"),
        "ROBOGATE_MAX_LINEAR_VELOCITY",
        &mut cfg.max_linear_velocity,
        &mut warnings,
    );
    parse_into(
        lookup("ROBOGATE_MAX_ANGULAR_VELOCITY"),
        "ROBOGATE_MAX_ANGULAR_VELOCITY",
        &mut cfg.max_angular_velocity,
        &mut warnings,
    );
    parse_into(
        lookup("ROBOGATE_LOCK_LEASE_SECS"),
        "ROBOGATE_LOCK_LEASE_SECS",
        &mut cfg.lock_lease_secs,
        &mut warnings,
    );
    parse_into(
        lookup("ROBOGATE_COMMAND_TIMEOUT_MS"),
        "ROBOGATE_COMMAND_TIMEOUT_MS",
        &mut cfg.command_timeout_ms,
        &mut warnings,
    );
    parse_into(
        lookup("ROBOGATE_RATE_LIMIT_PER_MINUTE"),
        "ROBOGATE_RATE_LIMIT_PER_MINUTE",
        &mut cfg.rate_limit_per_minute,
        &mut warnings,
    );
    if let Some(level) = lookup("ROBOGATE_LOG_LEVEL") {
        cfg.log_level = level;
    }
    parse_into(
        lookup("ROBOGATE_LOG_FORMAT"),
        "ROBOGATE_LOG_FORMAT",
        &mut cfg.log_format,
        &mut warnings,
    );
    if let Some(url) = lookup("OTEL_EXPORTER_OTLP_ENDPOINT") {
        let url = url.trim();
        cfg.otlp_endpoint = (!url.is_empty()).then(|| url.to_string());
    }
    if let Some(url) = lookup("ROBOGATE_SINK_URL") {
        let url = url.trim();
        cfg.sink_url = (!url.is_empty()).then(|| url.to_string());
    }
    if let Some(list) = lookup("ROBOGATE_SIM_ROBOTS") {
        cfg.sim_robots = list
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(pairs) = lookup("ROBOGATE_AUTH_TOKENS") {
        let mut tokens = HashMap::new();
        for pair in pairs.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match pair.split_once(':') {
                Some((token, user)) if !token.is_empty() && !user.is_empty() => {
                    tokens.insert(token.to_string(), user.to_string());
                }
                _ => warnings.push("ignoring malformed ROBOGATE_AUTH_TOKENS entry".to_string()),
            }
        }
        cfg.auth_tokens = tokens;
    }
    warnings
}

impl Config {
    /// Convert to the runtime gateway settings.
    ///
    /// # Errors
    ///
    /// [`GateError::Config`] when the host is not an IP address or a
    /// velocity limit is not a positive finite number.
    pub fn gateway_config(&self) -> Result<GatewayConfig, GateError> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|_| GateError::Config(format!("host {:?} is not an IP address", self.host)))?;
        for (name, value) in [
            ("max_linear_velocity", self.max_linear_velocity),
            ("max_angular_velocity", self.max_angular_velocity),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(GateError::Config(format!(
                    "{name} must be positive and finite, got {value}"
                )));
            }
        }
        Ok(GatewayConfig {
            listen_addr: SocketAddr::new(ip, self.port),
            safety: SafetyConfig {
                max_linear_velocity: self.max_linear_velocity,
                max_angular_velocity: self.max_angular_velocity,
                lock_lease: Duration::from_secs(self.lock_lease_secs),
                command_timeout: Duration::from_millis(self.command_timeout_ms),
            },
            rate_limit_per_minute: self.rate_limit_per_minute,
        })
    }
}
