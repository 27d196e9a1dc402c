//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Credential secrets are loaded from the env var named by `secret_env` or
//! from `secret_file`, never stored in the TOML directly.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use batch_orchestrator::OrchestratorSettings;
use batch_writer::FileLimits;
use common::Secret;
use credential_pool::{DispatchSettings, PoolSettings};
use serde::Deserialize;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,
    pub credentials: Vec<CredentialConfig>,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub writer: WriterConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    pub intake: IntakeConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Shared pool behaviour
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub key_prefix: String,
    pub window_secs: u64,
    /// Budget for credentials that do not set their own
    pub token_budget: u64,
    pub lock_ttl_secs: u64,
    pub acquire_timeout_secs: u64,
    pub backoff_ms: u64,
    pub default_cooldown_secs: u64,
    pub max_cooldown_secs: u64,
    pub sync_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            key_prefix: "batch-station".into(),
            window_secs: 60,
            token_budget: 90_000,
            lock_ttl_secs: 180,
            acquire_timeout_secs: 30,
            backoff_ms: 250,
            default_cooldown_secs: 5,
            max_cooldown_secs: 30 * 60,
            sync_interval_secs: 30,
        }
    }
}

/// One upstream credential
#[derive(Debug, Deserialize)]
pub struct CredentialConfig {
    pub label: String,
    /// Env var holding the secret; wins over `secret_file`
    #[serde(default)]
    pub secret_env: Option<String>,
    #[serde(default)]
    pub secret_file: Option<PathBuf>,
    #[serde(skip)]
    pub secret: Option<Secret<String>>,
    #[serde(default)]
    pub token_budget: Option<u64>,
    /// Largest batch file (in tokens) this credential may take
    #[serde(default)]
    pub batch_token_limit: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    pub base_url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,
}

fn default_request_timeout() -> u64 {
    120
}

fn default_max_response_bytes() -> usize {
    10 * 1024 * 1024
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    pub output_dir: PathBuf,
    pub max_lines: usize,
    pub max_tokens: u64,
    pub max_bytes: u64,
    pub max_files: Option<usize>,
    /// Units read and packed at once
    pub concurrency: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        let limits = FileLimits::default();
        Self {
            output_dir: PathBuf::from("batches"),
            max_lines: limits.max_lines,
            max_tokens: limits.max_tokens,
            max_bytes: limits.max_bytes,
            max_files: limits.max_files,
            concurrency: 8,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// JSON file backing the batch store
    pub store_path: PathBuf,
    pub download_dir: PathBuf,
    /// Where processed artifacts end up
    pub finished_dir: PathBuf,
    pub poll_interval_secs: u64,
    /// How often pending lines are packed into new files
    pub generate_interval_secs: u64,
    pub upload_attempts: u32,
    pub upload_backoff_secs: u64,
    pub transient_cooldown_secs: u64,
    pub failure_cooldown_secs: u64,
    /// Cooldown after a remote batch fails
    pub batch_failure_cooldown_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("state/batch-store.json"),
            download_dir: PathBuf::from("downloads"),
            finished_dir: PathBuf::from("finished"),
            poll_interval_secs: 60,
            generate_interval_secs: 300,
            upload_attempts: 3,
            upload_backoff_secs: 5,
            transient_cooldown_secs: 10 * 60,
            failure_cooldown_secs: 5 * 60,
            batch_failure_cooldown_secs: 10 * 60,
        }
    }
}

impl OrchestratorConfig {
    /// Wait before the last upload attempt; the backoff doubles per retry.
    pub fn longest_upload_backoff_secs(&self) -> u64 {
        match self.upload_attempts {
            0 | 1 => 0,
            n => self
                .upload_backoff_secs
                .saturating_mul(1u64 << (n - 2).min(32)),
        }
    }
}

/// How work enters the station
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntakeMode {
    /// Queue lines for batch files
    Batch,
    /// Call the upstream right away through the dispatcher
    Direct,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IntakeConfig {
    /// Directory scanned for `*.jsonl` work files
    pub inbox_dir: PathBuf,
    #[serde(default = "default_mode")]
    pub mode: IntakeMode,
    pub model: String,
    pub instructions: String,
    #[serde(default = "default_max_chunk_tokens")]
    pub max_chunk_tokens: u64,
    #[serde(default)]
    pub overlap_ratio: f64,
    #[serde(default = "default_max_response_tokens")]
    pub max_response_tokens: u32,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default = "default_intake_interval")]
    pub interval_secs: u64,
}

fn default_mode() -> IntakeMode {
    IntakeMode::Batch
}

fn default_max_chunk_tokens() -> u64 {
    4_000
}

fn default_max_response_tokens() -> u32 {
    1_024
}

fn default_intake_interval() -> u64 {
    30
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub listen_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 9100)),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, validate it, and resolve secrets.
    ///
    /// Secret resolution order per credential:
    /// 1. the env var named by `secret_env`
    /// 2. `secret_file`
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;
        for credential in &mut config.credentials {
            credential.secret = Some(resolve_secret(credential)?);
        }
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.upstream.base_url.starts_with("http://")
            && !self.upstream.base_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {}",
                self.upstream.base_url
            )));
        }
        if self.credentials.is_empty() {
            return Err(common::Error::Config(
                "at least one [[credentials]] entry is required".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for credential in &self.credentials {
            if !seen.insert(credential.label.as_str()) {
                return Err(common::Error::Config(format!(
                    "duplicate credential label: {}",
                    credential.label
                )));
            }
            if credential.token_budget == Some(0) {
                return Err(common::Error::Config(format!(
                    "token_budget for {} must be greater than 0",
                    credential.label
                )));
            }
        }

        let non_zero = [
            ("request_timeout_secs", self.upstream.request_timeout_secs),
            ("window_secs", self.pool.window_secs),
            ("token_budget", self.pool.token_budget),
            ("lock_ttl_secs", self.pool.lock_ttl_secs),
            ("acquire_timeout_secs", self.pool.acquire_timeout_secs),
            ("poll_interval_secs", self.orchestrator.poll_interval_secs),
            ("generate_interval_secs", self.orchestrator.generate_interval_secs),
            ("interval_secs", self.intake.interval_secs),
            ("max_chunk_tokens", self.intake.max_chunk_tokens),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(common::Error::Config(format!(
                    "{name} must be greater than 0"
                )));
            }
        }
        if self.upstream.max_response_bytes == 0 || self.writer.concurrency == 0 {
            return Err(common::Error::Config(
                "max_response_bytes and concurrency must be greater than 0".into(),
            ));
        }
        // Locks are extended before every call, so one TTL must cover one
        // call plus the longest wait between upload attempts
        let step = self
            .upstream
            .request_timeout_secs
            .saturating_add(self.orchestrator.longest_upload_backoff_secs());
        if self.pool.lock_ttl_secs <= step {
            return Err(common::Error::Config(format!(
                "lock_ttl_secs ({}) must be greater than request_timeout_secs plus the longest upload backoff ({step})",
                self.pool.lock_ttl_secs
            )));
        }
        if !(0.0..1.0).contains(&self.intake.overlap_ratio) {
            return Err(common::Error::Config(format!(
                "overlap_ratio must be in [0, 1), got {}",
                self.intake.overlap_ratio
            )));
        }
        self.file_limits()
            .validate()
            .map_err(|e| common::Error::Config(e.to_string()))?;
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("batch-station.toml")
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            key_prefix: self.pool.key_prefix.clone(),
            window: Duration::from_secs(self.pool.window_secs),
            lock_ttl: Duration::from_secs(self.pool.lock_ttl_secs),
            backoff: Duration::from_millis(self.pool.backoff_ms),
            default_cooldown: Duration::from_secs(self.pool.default_cooldown_secs),
            max_cooldown: Duration::from_secs(self.pool.max_cooldown_secs),
        }
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            acquire_timeout: Duration::from_secs(self.pool.acquire_timeout_secs),
            request_timeout: Duration::from_secs(self.upstream.request_timeout_secs),
        }
    }

    pub fn file_limits(&self) -> FileLimits {
        FileLimits {
            max_lines: self.writer.max_lines,
            max_tokens: self.writer.max_tokens,
            max_bytes: self.writer.max_bytes,
            max_files: self.writer.max_files,
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        let o = &self.orchestrator;
        OrchestratorSettings {
            upload_attempts: o.upload_attempts,
            upload_backoff: Duration::from_secs(o.upload_backoff_secs),
            transient_cooldown: Duration::from_secs(o.transient_cooldown_secs),
            failure_cooldown: Duration::from_secs(o.failure_cooldown_secs),
            lock_timeout: Duration::from_secs(self.pool.acquire_timeout_secs),
            poll_interval: Duration::from_secs(o.poll_interval_secs),
            download_dir: o.download_dir.clone(),
        }
    }
}

fn resolve_secret(credential: &CredentialConfig) -> common::Result<Secret<String>> {
    if let Some(var) = &credential.secret_env {
        if let Ok(value) = std::env::var(var) {
            let value = value.trim().to_owned();
            if !value.is_empty() {
                return Ok(Secret::new(value));
            }
        }
    }
    if let Some(file) = &credential.secret_file {
        let value = std::fs::read_to_string(file).map_err(|e| {
            common::Error::Config(format!(
                "failed to read secret_file {} for {}: {e}",
                file.display(),
                credential.label
            ))
        })?;
        let value = value.trim().to_owned();
        if !value.is_empty() {
            return Ok(Secret::new(value));
        }
    }
    Err(common::Error::Config(format!(
        "no secret found for credential {}: set secret_env or secret_file",
        credential.label
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize tests that mutate environment variables, preventing
    /// data races when tests run in parallel.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn config_with(credentials: &str, extra: &str) -> String {
        format!(
            r#"
{credentials}

[upstream]
base_url = "https://api.openai.com"

[intake]
inbox_dir = "inbox"
model = "gpt-4o-mini"
instructions = "Summarize the text."
{extra}
"#
        )
    }

    fn env_credential() -> &'static str {
        r#"
[[credentials]]
label = "primary"
secret_env = "BATCH_STATION_TEST_KEY"
"#
    }

    fn write(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("batch-station.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_load_valid_config_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, &config_with(env_credential(), ""));
        unsafe { set_env("BATCH_STATION_TEST_KEY", "sk-test-123") };

        let config = Config::load(&path).unwrap();
        assert_eq!(config.credentials.len(), 1);
        assert_eq!(
            config.credentials[0].secret.as_ref().unwrap().expose(),
            "sk-test-123"
        );
        assert_eq!(config.pool.window_secs, 60);
        assert_eq!(config.upstream.request_timeout_secs, 120);
        assert_eq!(config.intake.mode, IntakeMode::Batch);
        assert_eq!(config.orchestrator.upload_attempts, 3);
        assert_eq!(config.metrics.listen_addr.port(), 9100);
        assert_eq!(config.pool_settings().max_cooldown, Duration::from_secs(1800));

        unsafe { remove_env("BATCH_STATION_TEST_KEY") };
    }

    #[test]
    fn test_secret_from_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("key");
        std::fs::write(&key_path, "sk-file-456\n").unwrap();
        let credentials = format!(
            r#"
[[credentials]]
label = "filed"
secret_file = "{}"
token_budget = 5000
batch_token_limit = 1000000
"#,
            key_path.display()
        );
        let path = write(&dir, &config_with(&credentials, ""));

        let config = Config::load(&path).unwrap();
        let credential = &config.credentials[0];
        assert_eq!(credential.secret.as_ref().unwrap().expose(), "sk-file-456");
        assert_eq!(credential.token_budget, Some(5000));
        assert_eq!(credential.batch_token_limit, Some(1_000_000));
    }

    #[test]
    fn test_secret_env_overrides_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let credentials = r#"
[[credentials]]
label = "both"
secret_env = "BATCH_STATION_TEST_KEY"
secret_file = "/nonexistent/path/key"
"#;
        let path = write(&dir, &config_with(credentials, ""));
        unsafe { set_env("BATCH_STATION_TEST_KEY", "sk-env-wins") };

        let config = Config::load(&path).unwrap();
        assert_eq!(
            config.credentials[0].secret.as_ref().unwrap().expose(),
            "sk-env-wins",
            "secret_env must take precedence over secret_file"
        );
        unsafe { remove_env("BATCH_STATION_TEST_KEY") };
    }

    #[test]
    fn test_missing_secret_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, &config_with(env_credential(), ""));
        unsafe { remove_env("BATCH_STATION_TEST_KEY") };

        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("no secret found for credential primary"), "{err}");
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_no_credentials_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, &config_with("credentials = []", ""));
        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("at least one"), "{err}");
    }

    #[test]
    fn test_duplicate_labels_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let credentials = format!("{}{}", env_credential(), env_credential());
        let path = write(&dir, &config_with(&credentials, ""));
        unsafe { set_env("BATCH_STATION_TEST_KEY", "sk") };

        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("duplicate credential label"), "{err}");
        unsafe { remove_env("BATCH_STATION_TEST_KEY") };
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let contents = config_with(env_credential(), "")
            .replace("https://api.openai.com", "api.openai.com");
        let path = write(&dir, &contents);

        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("base_url must start with http"), "{err}");
    }

    #[test]
    fn test_lock_ttl_must_exceed_request_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let contents = format!(
            "[pool]\nlock_ttl_secs = 60\n{}",
            config_with(env_credential(), "")
        );
        let path = write(&dir, &contents);

        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("lock_ttl_secs"), "{err}");
    }

    #[test]
    fn test_lock_ttl_must_cover_upload_backoff() {
        let dir = tempfile::tempdir().unwrap();
        // 120s request timeout + 5s backoff doubled once = 130s
        let contents = format!(
            "[pool]\nlock_ttl_secs = 130\n{}",
            config_with(env_credential(), "")
        );
        let path = write(&dir, &contents);
        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("(130)"), "{err}");

        let contents = format!(
            "[pool]\nlock_ttl_secs = 130\n{}",
            config_with(env_credential(), "[orchestrator]\nupload_attempts = 2\n")
        );
        let path = write(&dir, &contents);
        let err = Config::load(&path).err().map(|e| e.to_string()).unwrap_or_default();
        assert!(!err.contains("lock_ttl_secs"), "{err}");
    }

    #[test]
    fn test_zero_file_limits_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let contents = format!(
            "{}\n[writer]\nmax_lines = 0\n",
            config_with(env_credential(), "")
        );
        let path = write(&dir, &contents);

        assert!(Config::load(&path).is_err(), "max_lines = 0 must be rejected");
    }

    #[test]
    fn test_overlap_ratio_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, &config_with(env_credential(), "overlap_ratio = 1.5"));

        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("overlap_ratio"), "{err}");
    }

    #[test]
    fn test_direct_mode_parses() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, &config_with(env_credential(), "mode = \"direct\""));
        unsafe { set_env("BATCH_STATION_TEST_KEY", "sk") };

        let config = Config::load(&path).unwrap();
        assert_eq!(config.intake.mode, IntakeMode::Direct);
        unsafe { remove_env("BATCH_STATION_TEST_KEY") };
    }

    #[test]
    fn test_resolve_path_cli_arg() {
        let path = Config::resolve_path(Some("/custom/path.toml"));
        assert_eq!(path, PathBuf::from("/custom/path.toml"));
    }

    #[test]
    fn test_resolve_path_env_var() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/path.toml") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("/env/path.toml"));
        unsafe { remove_env("CONFIG_PATH") };
    }

    #[test]
    fn test_resolve_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONFIG_PATH") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("batch-station.toml"));
    }
}
