// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// GSS Configuration Types
//
// Defines the configuration schema for the context layer:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Client upcall behaviour (timeouts, helper program, namespace checks)
// - Server negotiation caches (timeouts, TTLs, sequence windows)
// - Garbage collection and observability settings

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const API_VERSION: &str = "lgss/v1";
pub const KIND: &str = "GssConfig";

/// Top-level Kubernetes-style configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GssConfigManifest {
    /// API version (must be "lgss/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "GssConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: GssConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GssConfigSpec {
    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub gc: GcConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Client context manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Seconds a context may wait for the helper (2 x obd_timeout)
    #[serde(default = "default_client_upcall_timeout")]
    pub upcall_timeout_secs: u64,

    /// Report the requesting pid to the helper so it can enter the caller's namespace
    #[serde(default = "default_true")]
    pub check_upcall_ns: bool,

    /// Helper spawned for each new slot
    #[serde(default = "default_client_helper")]
    pub helper_path: PathBuf,

    /// Arguments placed before `<serial> <descriptor> <callout>`
    #[serde(default)]
    pub helper_args: Vec<String>,

    /// Delay between retries of an update that arrived before its context was bound
    #[serde(default = "default_helper_retry_interval_ms")]
    pub helper_retry_interval_ms: u64,

    #[serde(default = "default_helper_max_retries")]
    pub helper_max_retries: u32,

    /// Existing contexts are given this many seconds when a reverse root context is installed
    #[serde(default = "default_reverse_expire_nice")]
    pub reverse_expire_nice_secs: u64,
}

/// Server negotiation cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Seconds an accepting RPC waits for a pending negotiation
    #[serde(default = "default_server_upcall_timeout")]
    pub upcall_timeout_secs: u64,

    /// Lifetime of cache entries that are never populated
    #[serde(default = "default_new_entry_ttl")]
    pub new_entry_ttl_secs: u64,

    /// Grace given to a reverse context when its client side goes away
    #[serde(default = "default_reverse_expire")]
    pub reverse_expire_secs: u64,

    /// Replay window for established contexts
    #[serde(default = "default_seq_window")]
    pub seq_window: u32,

    /// Long-running helper that answers negotiation requests
    #[serde(default = "default_server_helper")]
    pub helper_path: PathBuf,

    #[serde(default = "default_helper_wait_attempts")]
    pub helper_wait_attempts: u32,

    #[serde(default = "default_helper_wait_interval_ms")]
    pub helper_wait_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_gc_interval")]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format (text or json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_true() -> bool {
    true
}

fn default_client_upcall_timeout() -> u64 {
    200
}

fn default_client_helper() -> PathBuf {
    PathBuf::from("/usr/sbin/lgss_keyring")
}

fn default_helper_retry_interval_ms() -> u64 {
    50
}

fn default_helper_max_retries() -> u32 {
    20
}

fn default_reverse_expire_nice() -> u64 {
    10
}

fn default_server_upcall_timeout() -> u64 {
    20
}

fn default_new_entry_ttl() -> u64 {
    120
}

fn default_reverse_expire() -> u64 {
    20
}

fn default_seq_window() -> u32 {
    crate::domain::sequence_window::GSS_SEQ_WIN
}

fn default_server_helper() -> PathBuf {
    PathBuf::from("/usr/sbin/lsvcgssd")
}

fn default_helper_wait_attempts() -> u32 {
    6
}

fn default_helper_wait_interval_ms() -> u64 {
    250
}

fn default_gc_interval() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            upcall_timeout_secs: default_client_upcall_timeout(),
            check_upcall_ns: true,
            helper_path: default_client_helper(),
            helper_args: Vec::new(),
            helper_retry_interval_ms: default_helper_retry_interval_ms(),
            helper_max_retries: default_helper_max_retries(),
            reverse_expire_nice_secs: default_reverse_expire_nice(),
        }
    }
}

impl ClientConfig {
    pub fn upcall_timeout(&self) -> Duration {
        Duration::from_secs(self.upcall_timeout_secs)
    }

    pub fn reverse_expire_nice(&self) -> Duration {
        Duration::from_secs(self.reverse_expire_nice_secs)
    }

    pub fn helper_retry_interval(&self) -> Duration {
        Duration::from_millis(self.helper_retry_interval_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            upcall_timeout_secs: default_server_upcall_timeout(),
            new_entry_ttl_secs: default_new_entry_ttl(),
            reverse_expire_secs: default_reverse_expire(),
            seq_window: default_seq_window(),
            helper_path: default_server_helper(),
            helper_wait_attempts: default_helper_wait_attempts(),
            helper_wait_interval_ms: default_helper_wait_interval_ms(),
        }
    }
}

impl ServerConfig {
    pub fn upcall_timeout(&self) -> Duration {
        Duration::from_secs(self.upcall_timeout_secs)
    }

    pub fn new_entry_ttl(&self) -> Duration {
        Duration::from_secs(self.new_entry_ttl_secs)
    }

    pub fn reverse_expire(&self) -> Duration {
        Duration::from_secs(self.reverse_expire_secs)
    }

    pub fn helper_wait_interval(&self) -> Duration {
        Duration::from_millis(self.helper_wait_interval_ms)
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_gc_interval(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for GssConfigManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "lgss".to_string(),
                version: Some("1.0.0".to_string()),
            },
            spec: GssConfigSpec::default(),
        }
    }
}

impl GssConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. LGSS_CONFIG_PATH environment variable
    /// 2. ./lgss-config.yaml (working directory)
    /// 3. ~/.lgss/config.yaml (user home)
    /// 4. /etc/lgss/config.yaml (system)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("LGSS_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./lgss-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".lgss").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/lgss/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path).map_err(|e| {
                anyhow::anyhow!("Failed to load config at {:?}: {}", path, e)
            })?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Some(secs) = env_seconds("LGSS_CLIENT_UPCALL_TIMEOUT") {
            self.spec.client.upcall_timeout_secs = secs;
        }

        if let Some(secs) = env_seconds("LGSS_SERVER_UPCALL_TIMEOUT") {
            self.spec.server.upcall_timeout_secs = secs;
        }

        if let Ok(val) = std::env::var("LGSS_CHECK_UPCALL_NS") {
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => {
                    tracing::info!("Environment override: LGSS_CHECK_UPCALL_NS=true");
                    self.spec.client.check_upcall_ns = true;
                }
                "false" | "0" | "no" | "off" => {
                    tracing::info!("Environment override: LGSS_CHECK_UPCALL_NS=false");
                    self.spec.client.check_upcall_ns = false;
                }
                _ => {
                    tracing::warn!(
                        "Invalid value for LGSS_CHECK_UPCALL_NS: '{}'. Expected true/false. Ignoring.",
                        val
                    );
                }
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let spec = &self.spec;
        if spec.client.upcall_timeout_secs == 0 {
            anyhow::bail!("spec.client.upcall_timeout_secs must be greater than zero");
        }
        if spec.server.upcall_timeout_secs == 0 {
            anyhow::bail!("spec.server.upcall_timeout_secs must be greater than zero");
        }
        if spec.server.new_entry_ttl_secs < spec.server.upcall_timeout_secs {
            anyhow::bail!(
                "spec.server.new_entry_ttl_secs ({}) must not be shorter than the upcall timeout ({})",
                spec.server.new_entry_ttl_secs,
                spec.server.upcall_timeout_secs
            );
        }
        if spec.server.seq_window == 0 {
            anyhow::bail!("spec.server.seq_window must be greater than zero");
        }
        if spec.gc.enabled && spec.gc.interval_secs == 0 {
            anyhow::bail!("spec.gc.interval_secs must be greater than zero when gc is enabled");
        }
        if !matches!(spec.observability.log_format.as_str(), "text" | "json") {
            anyhow::bail!(
                "Invalid log_format: '{}'. Expected text or json",
                spec.observability.log_format
            );
        }

        Ok(())
    }
}

fn env_seconds(name: &str) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    match val.parse::<u64>() {
        Ok(secs) if secs > 0 => {
            tracing::info!("Environment override: {}={}", name, secs);
            Some(secs)
        }
        _ => {
            tracing::warn!(
                "Invalid value for {}: '{}'. Expected a positive number of seconds. Ignoring.",
                name,
                val
            );
            None
        }
    }
}
