//! Worker configuration: `slipway.toml` plus environment overrides.
//!
//! Every field has a default, so an empty file (or none at all) yields a
//! working configuration for a local daemon with a Swift backend. The loaded
//! [`Config`] is read-only and handed to components by reference.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use slipway_common::{ImageFormat, StorageBackend};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryPolicy;

pub const CONFIG_FILE_NAME: &str = "slipway.toml";
pub const CONFIG_ENV: &str = "SLIPWAY_CONFIG";
pub const AUTH_TOKEN_ENV: &str = "SLIPWAY_AUTH_TOKEN";

/// Job-level limits and local paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Root of the per-job working directories.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Image the cloner image is built from; must provide `git` and `sh`.
    #[serde(default = "default_git_image")]
    pub git_image: String,
    /// Image used for disposable `rm -rf` containers.
    #[serde(default = "default_cleanup_image")]
    pub cleanup_image: String,
    #[serde(default = "default_clone_timeout_secs")]
    pub clone_timeout_secs: u64,
    #[serde(default = "default_clone_attempts")]
    pub clone_attempts: u32,
    #[serde(default = "default_clone_retry_delay_secs")]
    pub clone_retry_delay_secs: u64,
    #[serde(default = "default_build_timeout_secs")]
    pub build_timeout_secs: u64,
    #[serde(default = "default_unittest_timeout_secs")]
    pub unittest_timeout_secs: u64,
    /// Memory ceiling for builds and test containers, in MiB.
    #[serde(default = "default_build_memory_mb")]
    pub build_memory_mb: u64,
}

fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("slipway").join("work")
}

fn default_log_dir() -> PathBuf {
    std::env::temp_dir().join("slipway").join("logs")
}

fn default_db_path() -> PathBuf {
    PathBuf::from("slipway.db")
}

fn default_git_image() -> String {
    "alpine/git:latest".to_string()
}

fn default_cleanup_image() -> String {
    "busybox:latest".to_string()
}

fn default_clone_timeout_secs() -> u64 {
    15 * 60
}

fn default_clone_attempts() -> u32 {
    5
}

fn default_clone_retry_delay_secs() -> u64 {
    5
}

fn default_build_timeout_secs() -> u64 {
    30 * 60
}

fn default_unittest_timeout_secs() -> u64 {
    30 * 60
}

/// Largest whole MiB that fits the build API's signed 32-bit byte count.
pub const MAX_BUILD_MEMORY_MB: u64 = i32::MAX as u64 / (1024 * 1024);

fn default_build_memory_mb() -> u64 {
    MAX_BUILD_MEMORY_MB
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            log_dir: default_log_dir(),
            db_path: default_db_path(),
            git_image: default_git_image(),
            cleanup_image: default_cleanup_image(),
            clone_timeout_secs: default_clone_timeout_secs(),
            clone_attempts: default_clone_attempts(),
            clone_retry_delay_secs: default_clone_retry_delay_secs(),
            build_timeout_secs: default_build_timeout_secs(),
            unittest_timeout_secs: default_unittest_timeout_secs(),
            build_memory_mb: default_build_memory_mb(),
        }
    }
}

impl WorkerConfig {
    pub fn clone_timeout(&self) -> Duration {
        Duration::from_secs(self.clone_timeout_secs)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn unittest_timeout(&self) -> Duration {
        Duration::from_secs(self.unittest_timeout_secs)
    }

    pub fn build_memory_bytes(&self) -> u64 {
        self.build_memory_mb * 1024 * 1024
    }

    pub fn clone_retry(&self) -> RetryPolicy {
        RetryPolicy::fixed(
            self.clone_attempts,
            Duration::from_secs(self.clone_retry_delay_secs),
        )
    }
}

/// Container daemon connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    /// `tcp://` or `http://` daemon address. Local socket defaults when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default = "default_docker_timeout_secs")]
    pub timeout_secs: u64,
    /// Attempts for save/load calls on transient errors.
    #[serde(default = "default_docker_retries")]
    pub retries: u32,
    #[serde(default = "default_docker_retry_delay_secs")]
    pub retry_delay_secs: u64,
}

fn default_docker_timeout_secs() -> u64 {
    120
}

fn default_docker_retries() -> u32 {
    3
}

fn default_docker_retry_delay_secs() -> u64 {
    2
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            host: None,
            timeout_secs: default_docker_timeout_secs(),
            retries: default_docker_retries(),
            retry_delay_secs: default_docker_retry_delay_secs(),
        }
    }
}

impl DockerConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.retries, Duration::from_secs(self.retry_delay_secs))
    }
}

/// Swift object store used for artifacts and job logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwiftConfig {
    /// Account endpoint, e.g. `https://swift.example.com/v1/AUTH_tenant`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default = "default_artifact_container")]
    pub container: String,
    #[serde(default = "default_logs_container")]
    pub logs_container: String,
    /// Account key for temporary URLs handed to booting servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_url_key: Option<String>,
    #[serde(default = "default_temp_url_ttl_secs")]
    pub temp_url_ttl_secs: u64,
    /// Connect and per-read bound for transfers; whole-call bound for
    /// container and delete requests.
    #[serde(default = "default_swift_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_artifact_container() -> String {
    "slipway_artifacts".to_string()
}

fn default_logs_container() -> String {
    "slipway_logs".to_string()
}

fn default_temp_url_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_swift_timeout_secs() -> u64 {
    600
}

impl Default for SwiftConfig {
    fn default() -> Self {
        Self {
            url: None,
            auth_token: None,
            container: default_artifact_container(),
            logs_container: default_logs_container(),
            temp_url_key: None,
            temp_url_ttl_secs: default_temp_url_ttl_secs(),
            timeout_secs: default_swift_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Registry host prefixed to application tags, e.g. `registry.local:5000`.
    #[serde(default = "default_registry_url")]
    pub url: String,
}

fn default_registry_url() -> String {
    "127.0.0.1:5000".to_string()
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: default_registry_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default)]
    pub image_format: ImageFormat,
    /// Uploads at or above this size are rejected.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
    /// Ranged re-requests allowed per download.
    #[serde(default = "default_download_resumes")]
    pub download_resumes: u32,
    /// Extra free space demanded beyond the artifact size before export.
    #[serde(default = "default_min_free_mb")]
    pub min_free_mb: u64,
    #[serde(default)]
    pub swift: SwiftConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
}

fn default_max_upload_bytes() -> u64 {
    5 * 1024 * 1024 * 1024
}

fn default_download_resumes() -> u32 {
    10
}

fn default_min_free_mb() -> u64 {
    512
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            image_format: ImageFormat::default(),
            max_upload_bytes: default_max_upload_bytes(),
            download_resumes: default_download_resumes(),
            min_free_mb: default_min_free_mb(),
            swift: SwiftConfig::default(),
            registry: RegistryConfig::default(),
        }
    }
}

/// Orchestration and network services, plus stack polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heat_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub neutron_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_flavor")]
    pub flavor: String,
    /// Server image for docker strategies (a host that runs containers).
    #[serde(default = "default_host_image")]
    pub host_image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_name: Option<String>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_wait_interval_secs")]
    pub wait_interval_secs: f64,
    #[serde(default = "default_growth_factor")]
    pub growth_factor: f64,
    #[serde(default = "default_max_interval_secs")]
    pub max_interval_secs: f64,
    /// TCP reachability probes after the stack completes; 0 disables.
    #[serde(default)]
    pub probe_attempts: u32,
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_flavor() -> String {
    "m1.small".to_string()
}

fn default_host_image() -> String {
    "coreos".to_string()
}

fn default_max_attempts() -> u32 {
    600
}

fn default_wait_interval_secs() -> f64 {
    1.0
}

fn default_growth_factor() -> f64 {
    1.1
}

fn default_max_interval_secs() -> f64 {
    30.0
}

fn default_probe_interval_secs() -> u64 {
    5
}

impl Default for DeployerConfig {
    fn default() -> Self {
        Self {
            heat_url: None,
            neutron_url: None,
            auth_token: None,
            request_timeout_secs: default_request_timeout_secs(),
            flavor: default_flavor(),
            host_image: default_host_image(),
            key_name: None,
            max_attempts: default_max_attempts(),
            wait_interval_secs: default_wait_interval_secs(),
            growth_factor: default_growth_factor(),
            max_interval_secs: default_max_interval_secs(),
            probe_attempts: 0,
            probe_interval_secs: default_probe_interval_secs(),
        }
    }
}

impl DeployerConfig {
    /// Poll schedule for stack create/update/delete.
    pub fn poll_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.max_attempts,
            Duration::from_secs_f64(self.wait_interval_secs.max(0.0)),
            self.growth_factor,
            Duration::from_secs_f64(self.max_interval_secs.max(0.0)),
        )
    }
}

/// The complete slipway.toml structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SlipwayToml {
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub deployer: DeployerConfig,
}

impl SlipwayToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse slipway.toml")
    }

    /// Load from `path` if it exists, otherwise return defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) if p.exists() => Self::load(p),
            _ => Ok(Self::default()),
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize slipway.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        for (name, value) in [
            ("worker.clone_timeout_secs", self.worker.clone_timeout_secs),
            ("worker.build_timeout_secs", self.worker.build_timeout_secs),
            (
                "worker.unittest_timeout_secs",
                self.worker.unittest_timeout_secs,
            ),
            ("docker.timeout_secs", self.docker.timeout_secs),
            (
                "deployer.request_timeout_secs",
                self.deployer.request_timeout_secs,
            ),
        ] {
            if value == 0 {
                warnings.push(format!("{} is 0: every call will time out", name));
            }
        }

        if self.worker.clone_attempts == 0 {
            warnings.push("worker.clone_attempts is 0: treated as 1".to_string());
        }

        if self.worker.build_memory_mb > MAX_BUILD_MEMORY_MB {
            warnings.push(format!(
                "worker.build_memory_mb {} exceeds the build limit of {} MiB: builds will fail",
                self.worker.build_memory_mb, MAX_BUILD_MEMORY_MB
            ));
        }

        if self.deployer.growth_factor < 1.0 {
            warnings.push(format!(
                "deployer.growth_factor {} is below 1.0: poll interval would shrink",
                self.deployer.growth_factor
            ));
        }

        if self.deployer.max_attempts == 0 {
            warnings.push("deployer.max_attempts is 0: treated as 1".to_string());
        }

        if self.storage.backend == StorageBackend::Swift && self.storage.swift.url.is_none() {
            warnings.push(
                "storage.backend is swift but storage.swift.url is not set".to_string(),
            );
        }

        if self.storage.image_format == ImageFormat::Vm
            && self.storage.backend == StorageBackend::DockerRegistry
        {
            warnings.push(
                "image_format 'vm' is not supported with storage backend 'docker_registry'"
                    .to_string(),
            );
        }

        if self.storage.backend == StorageBackend::Swift
            && self.storage.image_format == ImageFormat::Docker
            && self.storage.swift.temp_url_key.is_none()
        {
            warnings.push(
                "storage.swift.temp_url_key is not set: servers cannot download artifacts"
                    .to_string(),
            );
        }

        warnings
    }
}

/// Loaded configuration and where it came from.
#[derive(Debug, Clone)]
pub struct Config {
    /// File the settings were read from; `None` when running on defaults.
    pub source: Option<PathBuf>,
    pub settings: SlipwayToml,
}

impl std::ops::Deref for Config {
    type Target = SlipwayToml;

    fn deref(&self) -> &SlipwayToml {
        &self.settings
    }
}

impl Config {
    /// Discover, load and apply environment overrides.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let source = match explicit {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!("Config file not found: {}", path.display());
                }
                Some(path.to_path_buf())
            }
            None => discover(),
        };

        let mut settings = SlipwayToml::load_or_default(source.as_deref())?;
        if let Ok(token) = std::env::var(AUTH_TOKEN_ENV)
            && !token.is_empty()
        {
            settings.storage.swift.auth_token = Some(token.clone());
            settings.deployer.auth_token = Some(token);
        }

        Ok(Self { source, settings })
    }

    pub fn from_settings(settings: SlipwayToml) -> Self {
        Self {
            source: None,
            settings,
        }
    }
}

/// First existing config file among `$SLIPWAY_CONFIG`, `./slipway.toml` and
/// `<config_dir>/slipway/slipway.toml`.
pub fn discover() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV)
        && !path.is_empty()
    {
        return Some(PathBuf::from(path));
    }
    candidate_paths().into_iter().find(|p| p.exists())
}

fn candidate_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(CONFIG_FILE_NAME)];
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("slipway").join(CONFIG_FILE_NAME));
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_empty_uses_defaults() {
        let toml = SlipwayToml::parse("").unwrap();
        assert_eq!(toml.worker.clone_attempts, 5);
        assert_eq!(toml.worker.clone_timeout_secs, 900);
        assert_eq!(toml.docker.retries, 3);
        assert_eq!(toml.storage.download_resumes, 10);
        assert_eq!(toml.storage.max_upload_bytes, 5 * 1024 * 1024 * 1024);
        assert_eq!(toml.storage.backend, StorageBackend::Swift);
        assert_eq!(toml.storage.image_format, ImageFormat::Docker);
        assert_eq!(toml.deployer.probe_attempts, 0);
    }

    #[test]
    fn test_parse_partial_sections() {
        let toml = SlipwayToml::parse(
            r#"
[worker]
clone_attempts = 2

[storage]
backend = "docker_registry"

[storage.registry]
url = "registry.local:5000"

[deployer]
max_attempts = 1
growth_factor = 2.0
"#,
        )
        .unwrap();
        assert_eq!(toml.worker.clone_attempts, 2);
        assert_eq!(toml.worker.clone_timeout_secs, 900);
        assert_eq!(toml.storage.backend, StorageBackend::DockerRegistry);
        assert_eq!(toml.storage.registry.url, "registry.local:5000");
        assert_eq!(toml.deployer.max_attempts, 1);
        assert_eq!(toml.deployer.growth_factor, 2.0);
    }

    #[test]
    fn test_parse_rejects_unknown_backend() {
        assert!(SlipwayToml::parse("[storage]\nbackend = \"s3\"\n").is_err());
    }

    #[test]
    fn test_validate_flags_swift_without_url() {
        let toml = SlipwayToml::default();
        let warnings = toml.validate();
        assert!(warnings.iter().any(|w| w.contains("storage.swift.url")));
    }

    #[test]
    fn test_validate_flags_bad_growth_and_zero_timeout() {
        let mut toml = SlipwayToml::default();
        toml.storage.swift.url = Some("http://swift".into());
        toml.storage.swift.temp_url_key = Some("k".into());
        assert!(toml.validate().is_empty());

        toml.deployer.growth_factor = 0.5;
        toml.worker.build_timeout_secs = 0;
        let warnings = toml.validate();
        assert!(warnings.iter().any(|w| w.contains("growth_factor")));
        assert!(warnings.iter().any(|w| w.contains("build_timeout_secs")));
    }

    #[test]
    fn test_validate_flags_build_memory_over_api_limit() {
        let mut toml = SlipwayToml::default();
        assert!(toml.worker.build_memory_bytes() <= i32::MAX as u64);
        assert!(!toml.validate().iter().any(|w| w.contains("build_memory_mb")));

        toml.worker.build_memory_mb = 2048;
        assert!(toml.validate().iter().any(|w| w.contains("build_memory_mb")));
    }

    #[test]
    fn test_validate_flags_vm_on_registry() {
        let mut toml = SlipwayToml::default();
        toml.storage.backend = StorageBackend::DockerRegistry;
        toml.storage.image_format = ImageFormat::Vm;
        assert!(toml.validate().iter().any(|w| w.contains("'vm'")));
    }

    #[test]
    fn test_load_and_save_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let mut toml = SlipwayToml::default();
        toml.deployer.flavor = "m1.large".into();
        toml.save(&path).unwrap();

        let loaded = SlipwayToml::load(&path).unwrap();
        assert_eq!(loaded.deployer.flavor, "m1.large");
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let toml = SlipwayToml::load_or_default(Some(dir.path().join("nope.toml").as_path())).unwrap();
        assert_eq!(toml.worker.clone_attempts, 5);
    }

    #[test]
    fn test_config_load_explicit_missing_is_error() {
        let dir = tempdir().unwrap();
        let err = Config::load(Some(dir.path().join("missing.toml").as_path())).unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }

    #[test]
    fn test_poll_policy_uses_deployer_settings() {
        let mut toml = SlipwayToml::default();
        toml.deployer.max_attempts = 4;
        toml.deployer.wait_interval_secs = 2.0;
        toml.deployer.growth_factor = 2.0;
        toml.deployer.max_interval_secs = 5.0;
        let policy = toml.deployer.poll_policy();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(5));
    }
}
