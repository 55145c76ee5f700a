//! Configuration management for warden.
use regex::Regex;
use serde::Deserialize;
use std::{
    collections::{BTreeMap, HashMap},
    env, fs,
    path::{Path, PathBuf},
    sync::LazyLock,
    time::Duration,
};
use strum_macros::{AsRefStr, Display, EnumString};
use tracing::{debug, warn};

use crate::constants::{
    DEFAULT_BIND_HOST, DEFAULT_BUILD_TIMEOUT, DEFAULT_CONFIG_FILE, DEFAULT_HEALTH_ATTEMPTS,
    DEFAULT_HEALTH_TIMEOUT, DEFAULT_HEALTH_WARMUP, DEFAULT_LOGS_DIR,
    DEFAULT_MAX_RECOVERY_ATTEMPTS, DEFAULT_MAX_SESSIONS, DEFAULT_TREND_WINDOW,
    MONITOR_INTERVAL, MONITOR_RESTART_DELAY,
};
use crate::error::SupervisorError;

static BRACED_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static regex is valid")
});

/// Represents the structure of the configuration file.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Configuration version.
    pub version: String,
    /// Map of service ids to their respective configurations.
    pub services: HashMap<String, ServiceConfig>,
    /// Root directory from which relative paths are resolved.
    #[serde(skip)]
    pub project_dir: Option<String>,
    /// Directory holding service logs, the history file and the PID file.
    pub logs_dir: Option<String>,
    /// Optional build command executed before services start.
    pub build: Option<BuildConfig>,
    /// Startup history settings.
    #[serde(default)]
    pub history: HistoryConfig,
    /// Recovery budget settings.
    #[serde(default)]
    pub recovery: RecoveryConfig,
    /// Liveness monitor settings.
    #[serde(default)]
    pub monitor: MonitorConfig,
}

/// Configuration for an individual service as written in YAML.
#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    /// Human readable name; defaults to the service id.
    pub name: Option<String>,
    /// Port the service listens on.
    pub port: u16,
    /// Command used to start the service.
    pub command: String,
    /// Working directory, relative to the project directory.
    pub cwd: Option<String>,
    /// Health endpoint settings.
    pub health_check: Option<HealthCheckConfig>,
    /// Criticality tier.
    #[serde(default)]
    pub tier: Tier,
    /// Declared dependencies. Recorded but not used for ordering.
    pub depends_on: Option<Vec<String>>,
    /// Regexes matching command lines of stale instances of this service.
    pub conflict_patterns: Option<Vec<String>>,
    /// Extra log substrings that indicate a failed start.
    pub error_markers: Option<Vec<String>>,
    /// Optional environment variables for the service.
    pub env: Option<EnvConfig>,
}

/// Health endpoint settings for a service.
#[derive(Debug, Deserialize, Clone)]
pub struct HealthCheckConfig {
    /// URL polled with HTTP GET.
    pub url: String,
    /// Overall time budget for becoming healthy (e.g. "30s").
    pub timeout: Option<String>,
    /// Maximum number of probes.
    pub max_attempts: Option<u32>,
    /// Delay before the first probe.
    pub warmup: Option<String>,
    /// Accept 404/500 HTML responses as "still starting".
    #[serde(default)]
    pub lenient_html: bool,
}

/// Represents environment variables for a service.
#[derive(Debug, Deserialize, Clone)]
pub struct EnvConfig {
    /// Optional path to an environment file.
    pub file: Option<String>,
    /// Key-value pairs of environment variables.
    pub vars: Option<HashMap<String, String>>,
}

impl EnvConfig {
    /// Resolves the full path to the env file based on a base directory.
    pub fn path(&self, base: &Path) -> Option<PathBuf> {
        self.file.as_ref().map(|f| {
            let path = Path::new(f);
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                base.join(path)
            }
        })
    }
}

/// Pre-start build command.
#[derive(Debug, Deserialize, Clone)]
pub struct BuildConfig {
    /// Shell command to run.
    pub command: String,
    /// Working directory, relative to the project directory.
    pub cwd: Option<String>,
    /// Maximum duration of the build (e.g. "10m").
    pub timeout: Option<String>,
    /// When true a failed build only produces a warning.
    #[serde(default)]
    pub optional: bool,
}

/// Startup history settings.
#[derive(Debug, Deserialize, Clone)]
pub struct HistoryConfig {
    /// Maximum number of persisted sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Number of recent sessions used for predictions.
    #[serde(default = "default_trend_window")]
    pub trend_window: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
            trend_window: DEFAULT_TREND_WINDOW,
        }
    }
}

fn default_max_sessions() -> usize {
    DEFAULT_MAX_SESSIONS
}

fn default_trend_window() -> usize {
    DEFAULT_TREND_WINDOW
}

/// Recovery budget settings.
#[derive(Debug, Deserialize, Clone)]
pub struct RecoveryConfig {
    /// Maximum recovery attempts per service and run.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RECOVERY_ATTEMPTS,
        }
    }
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_RECOVERY_ATTEMPTS
}

/// Liveness monitor settings.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct MonitorConfig {
    /// Probe interval (e.g. "5s").
    pub interval: Option<String>,
    /// Delay before restarting a dead service (e.g. "2s").
    pub restart_delay: Option<String>,
}

/// Criticality tier of a service.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Tier {
    Critical,
    #[default]
    Standard,
    Optional,
}

/// Health policy with durations already parsed.
#[derive(Debug, Clone)]
pub struct HealthPolicy {
    pub url: String,
    pub timeout: Duration,
    pub max_attempts: u32,
    pub warmup: Duration,
    pub lenient_html: bool,
}

/// Immutable, fully resolved description of one supervised service.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub id: String,
    pub name: String,
    pub port: u16,
    pub command: String,
    pub cwd: PathBuf,
    pub health: Option<HealthPolicy>,
    pub tier: Tier,
    pub depends_on: Vec<String>,
    pub conflict_patterns: Vec<String>,
    pub error_markers: Vec<String>,
    /// Environment merged from `env.file` and `env.vars`.
    pub env: HashMap<String, String>,
}

impl ServiceDescriptor {
    /// Environment variable that overrides the bind host for this service.
    pub fn host_env_var(&self) -> String {
        let normalized: String = self
            .id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{normalized}_HOST")
    }

    /// Bind host handed to the child process.
    pub fn bind_host(&self) -> String {
        env::var(self.host_env_var()).unwrap_or_else(|_| DEFAULT_BIND_HOST.to_string())
    }
}

/// Resolved build step.
#[derive(Debug, Clone)]
pub struct BuildStep {
    pub command: String,
    pub cwd: PathBuf,
    pub timeout: Duration,
    pub optional: bool,
}

impl Config {
    /// Directory against which relative paths are resolved.
    pub fn project_root(&self) -> PathBuf {
        self.project_dir
            .as_deref()
            .map(str::trim)
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Directory holding logs, history and PID files.
    pub fn logs_path(&self) -> PathBuf {
        let raw = self.logs_dir.as_deref().unwrap_or(DEFAULT_LOGS_DIR);
        let path = Path::new(raw);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_root().join(path)
        }
    }

    /// Resolves every service into an immutable descriptor.
    pub fn descriptors(&self) -> Result<BTreeMap<String, ServiceDescriptor>, SupervisorError> {
        let root = self.project_root();
        let mut resolved = BTreeMap::new();

        for (id, service) in &self.services {
            if service.command.trim().is_empty() {
                return Err(SupervisorError::InvalidConfig(format!(
                    "service '{id}' has an empty command"
                )));
            }

            let health = match &service.health_check {
                Some(check) => Some(HealthPolicy {
                    url: check.url.clone(),
                    timeout: parse_optional_duration(
                        check.timeout.as_deref(),
                        DEFAULT_HEALTH_TIMEOUT,
                    )?,
                    max_attempts: check
                        .max_attempts
                        .unwrap_or(DEFAULT_HEALTH_ATTEMPTS)
                        .max(1),
                    warmup: parse_optional_duration(
                        check.warmup.as_deref(),
                        DEFAULT_HEALTH_WARMUP,
                    )?,
                    lenient_html: check.lenient_html,
                }),
                None => None,
            };

            let depends_on = service.depends_on.clone().unwrap_or_default();
            for dep in &depends_on {
                if !self.services.contains_key(dep) {
                    warn!("Service '{id}' declares unknown dependency '{dep}'");
                }
            }

            for pattern in service.conflict_patterns.iter().flatten() {
                Regex::new(pattern).map_err(|err| {
                    SupervisorError::InvalidConfig(format!(
                        "invalid conflict pattern '{pattern}' for '{id}': {err}"
                    ))
                })?;
            }

            let cwd = match service.cwd.as_deref() {
                Some(dir) if Path::new(dir).is_absolute() => PathBuf::from(dir),
                Some(dir) => root.join(dir),
                None => root.clone(),
            };

            resolved.insert(
                id.clone(),
                ServiceDescriptor {
                    id: id.clone(),
                    name: service.name.clone().unwrap_or_else(|| id.clone()),
                    port: service.port,
                    command: service.command.clone(),
                    cwd,
                    health,
                    tier: service.tier,
                    depends_on,
                    conflict_patterns: service.conflict_patterns.clone().unwrap_or_default(),
                    error_markers: service.error_markers.clone().unwrap_or_default(),
                    env: collect_service_env(&service.env, &root, id),
                },
            );
        }

        Ok(resolved)
    }

    /// Resolves the optional build step.
    pub fn build_step(&self) -> Result<Option<BuildStep>, SupervisorError> {
        let Some(build) = &self.build else {
            return Ok(None);
        };

        let root = self.project_root();
        Ok(Some(BuildStep {
            command: build.command.clone(),
            cwd: build
                .cwd
                .as_deref()
                .map(|dir| root.join(dir))
                .unwrap_or(root),
            timeout: parse_optional_duration(build.timeout.as_deref(), DEFAULT_BUILD_TIMEOUT)?,
            optional: build.optional,
        }))
    }

    /// Monitor probe interval.
    pub fn monitor_interval(&self) -> Result<Duration, SupervisorError> {
        parse_optional_duration(self.monitor.interval.as_deref(), MONITOR_INTERVAL)
    }

    /// Delay before restarting a service found dead by the monitor.
    pub fn monitor_restart_delay(&self) -> Result<Duration, SupervisorError> {
        parse_optional_duration(self.monitor.restart_delay.as_deref(), MONITOR_RESTART_DELAY)
    }
}

/// Build the environment map for a service, giving inline `env.vars` precedence over entries
/// loaded from `env.file`.
fn collect_service_env(
    env: &Option<EnvConfig>,
    project_root: &Path,
    service_name: &str,
) -> HashMap<String, String> {
    let mut resolved = HashMap::new();

    if let Some(env_config) = env {
        if let Some(file_path) = env_config.path(project_root) {
            match fs::read_to_string(&file_path) {
                Ok(content) => {
                    for (key, value) in parse_env_lines(&content, service_name) {
                        resolved.entry(key).or_insert(value);
                    }
                }
                Err(err) => {
                    warn!("Failed to read env file for '{}': {}", service_name, err);
                }
            }
        }

        if let Some(vars) = &env_config.vars {
            for (key, value) in vars {
                resolved.insert(key.clone(), value.clone());
            }
        }
    }

    resolved
}

fn parse_env_lines(content: &str, origin: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for raw_line in content.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some((key, value)) = line.split_once('=') {
            let mut value = value.trim();
            if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
                value = &value[1..value.len() - 1];
            }
            pairs.push((key.trim().to_string(), value.to_string()));
        } else {
            warn!("Ignoring malformed line in env file for '{}': {}", origin, line);
        }
    }
    pairs
}

/// Expands `${VAR}` references. Bare `$VAR` is left for the service shell.
fn expand_env_vars(input: &str) -> Result<String, SupervisorError> {
    let mut missing = None;
    let result = BRACED_VAR.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                missing.get_or_insert_with(|| var_name.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(var_name) => Err(SupervisorError::InvalidConfig(format!(
            "missing environment variable: {var_name}"
        ))),
        None => Ok(result.to_string()),
    }
}

/// Loads an `.env` file into the supervisor environment so `${VAR}` references resolve.
fn load_env_file(path: &Path) -> Result<(), SupervisorError> {
    let content = fs::read_to_string(path)?;
    for (key, value) in parse_env_lines(&content, &path.display().to_string()) {
        unsafe {
            env::set_var(key, value);
        }
    }
    Ok(())
}

/// Loads and parses the configuration file, expanding environment variables.
pub fn load_config(config_path: Option<&str>) -> Result<Config, SupervisorError> {
    let config_path = Path::new(config_path.unwrap_or(DEFAULT_CONFIG_FILE));

    let content = fs::read_to_string(config_path).map_err(|e| {
        SupervisorError::ConfigReadError(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, config_path.display()),
        ))
    })?;

    let config: Config = serde_yaml::from_str(&content)?;

    let base_path = config_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    for service in config.services.values() {
        if let Some(env_config) = &service.env
            && let Some(resolved_path) = env_config.path(&base_path)
            && resolved_path.exists()
        {
            load_env_file(&resolved_path)?;
        }
    }

    let expanded_content = expand_env_vars(&content)?;
    let mut config: Config = serde_yaml::from_str(&expanded_content)?;
    config.project_dir = Some(base_path.to_string_lossy().to_string());

    if config.services.is_empty() {
        return Err(SupervisorError::InvalidConfig(
            "no services configured".to_string(),
        ));
    }

    debug!(
        "Loaded {} service(s) from {}",
        config.services.len(),
        config_path.display()
    );
    Ok(config)
}

/// Parses a user-facing duration string in the format `<number>[ms|s|m|h]`.
pub fn parse_duration(raw: &str) -> Result<Duration, SupervisorError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(SupervisorError::InvalidConfig(
            "Duration value cannot be empty".to_string(),
        ));
    }

    let invalid = || SupervisorError::InvalidConfig(format!("Invalid duration value: '{raw}'"));

    if let Some(stripped) = value.strip_suffix("ms") {
        let amount: u64 = stripped.trim().parse().map_err(|_| invalid())?;
        return Ok(Duration::from_millis(amount));
    }

    let (amount_str, multiplier) = if let Some(stripped) = value.strip_suffix('s') {
        (stripped.trim(), 1)
    } else if let Some(stripped) = value.strip_suffix('m') {
        (stripped.trim(), 60)
    } else if let Some(stripped) = value.strip_suffix('h') {
        (stripped.trim(), 3600)
    } else {
        (value, 1)
    };

    let amount: u64 = amount_str.parse().map_err(|_| invalid())?;
    Ok(Duration::from_secs(amount.saturating_mul(multiplier)))
}

fn parse_optional_duration(
    raw: Option<&str>,
    default: Duration,
) -> Result<Duration, SupervisorError> {
    raw.map(parse_duration).unwrap_or(Ok(default))
}
