use crate::error::{TaskweaveError, TaskweaveResult};
use crate::telemetry::LogFormat;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Shortest accepted dependency poll period.
pub const MIN_DEPENDENCY_POLL_MS: u64 = 10;

/// Top-level configuration, normally read from `taskweave.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskweaveConfig {
    /// Directory holding the database and other runtime files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// SQLite file, relative to `data_dir` unless absolute. `":memory:"`
    /// keeps everything in process.
    #[serde(default = "default_database")]
    pub database: String,
    /// Output format passed to [`crate::init_tracing`].
    #[serde(default)]
    pub log_format: LogFormat,
    /// `[dispatcher]` table.
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    /// `[feedback]` table.
    #[serde(default)]
    pub feedback: FeedbackConfig,
    /// `[manager]` table.
    #[serde(default)]
    pub manager: ManagerConfig,
    /// `[backends]` table and its role list.
    #[serde(default)]
    pub backends: BackendsConfig,
}

/// Concurrency limits for delegated execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Maximum number of delegated tasks executing at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
        }
    }
}

/// Feedback channel sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackConfig {
    /// Events that can be queued before `publish` starts waiting.
    #[serde(default = "default_feedback_capacity")]
    pub capacity: usize,
    /// How long `publish` waits on a saturated channel before failing.
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
}

impl FeedbackConfig {
    /// [`Self::publish_timeout_ms`] as a `Duration`.
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            capacity: default_feedback_capacity(),
            publish_timeout_ms: default_publish_timeout_ms(),
        }
    }
}

/// How completion validation treats unmet criteria.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionPolicy {
    /// Reject the completion and leave the task unchanged.
    #[default]
    Strict,
    /// Escape hatch: log a warning and force the completion flag.
    Lenient,
}

/// Planner/executor behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Period between dependency checks while a subtask waits. At least
    /// [`MIN_DEPENDENCY_POLL_MS`].
    #[serde(default = "default_dependency_poll_ms")]
    pub dependency_poll_ms: u64,
    /// 0 waits forever.
    #[serde(default = "default_dependency_timeout_secs")]
    pub dependency_timeout_secs: u64,
    /// Worker invocations per task before it is blocked.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Failure count at which a failing task is escalated, once.
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold: u32,
    /// What `complete` does with unmet completion criteria.
    #[serde(default)]
    pub completion_policy: CompletionPolicy,
}

impl ManagerConfig {
    /// [`Self::dependency_poll_ms`] as a `Duration`.
    pub fn dependency_poll_interval(&self) -> Duration {
        Duration::from_millis(self.dependency_poll_ms)
    }

    /// `None` when the wait is unbounded.
    pub fn dependency_timeout(&self) -> Option<Duration> {
        (self.dependency_timeout_secs > 0).then(|| Duration::from_secs(self.dependency_timeout_secs))
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            dependency_poll_ms: default_dependency_poll_ms(),
            dependency_timeout_secs: default_dependency_timeout_secs(),
            max_attempts: default_max_attempts(),
            escalation_threshold: default_escalation_threshold(),
            completion_policy: CompletionPolicy::default(),
        }
    }
}

/// Mapping of a backend role to a concrete model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleConfig {
    /// Worker role name, such as `code` or `review`.
    pub role: String,
    /// Opaque provider id, resolved by the backend factory.
    pub provider: String,
    /// Model the provider loads for this role.
    pub model_id: String,
    /// Sampling temperature handed to the provider.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Keep the instance loaded when nobody holds it.
    #[serde(default)]
    pub keep_alive: bool,
    /// How long an unreferenced instance stays loaded. 0 unloads on last release.
    #[serde(default)]
    pub idle_unload_secs: u64,
}

impl RoleConfig {
    /// A role with default temperature, no keep-alive and immediate unload.
    pub fn new(role: impl Into<String>, provider: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            provider: provider.into(),
            model_id: model_id.into(),
            temperature: default_temperature(),
            keep_alive: false,
            idle_unload_secs: 0,
        }
    }

    /// Set [`Self::keep_alive`].
    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Set [`Self::idle_unload_secs`].
    pub fn with_idle_unload(mut self, secs: u64) -> Self {
        self.idle_unload_secs = secs;
        self
    }

    /// [`Self::idle_unload_secs`] as a `Duration`.
    pub fn idle_unload(&self) -> Duration {
        Duration::from_secs(self.idle_unload_secs)
    }
}

/// Backend roles and lifecycle timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendsConfig {
    /// Period of the idle-unload sweep. Must be at least 1.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Roles tried, in order, when the requested role is unavailable.
    #[serde(default)]
    pub fallback_order: Vec<String>,
    /// Role table. Empty means the built-in defaults.
    #[serde(default)]
    pub roles: Vec<RoleConfig>,
}

impl BackendsConfig {
    /// [`Self::sweep_interval_secs`] as a `Duration`.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            fallback_order: Vec::new(),
            roles: Vec::new(),
        }
    }
}

impl Default for TaskweaveConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database: default_database(),
            log_format: LogFormat::default(),
            dispatcher: DispatcherConfig::default(),
            feedback: FeedbackConfig::default(),
            manager: ManagerConfig::default(),
            backends: BackendsConfig::default(),
        }
    }
}

impl TaskweaveConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> TaskweaveResult<Self> {
        let config: TaskweaveConfig =
            toml::from_str(s).map_err(|e| TaskweaveError::Config(format!("Invalid config: {e}")))?;
        config.validate()?;
        debug!(
            max_concurrent = config.dispatcher.max_concurrent,
            roles = config.backends.roles.len(),
            "Config parsed"
        );
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> TaskweaveResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            TaskweaveError::Config(format!("Failed to read config file '{}': {e}", path.display()))
        })?;
        let config = Self::from_toml_str(&raw)?;
        info!(path = %path.display(), database = %config.database, "Loaded config");
        Ok(config)
    }

    /// Reject values the runtime cannot operate with.
    pub fn validate(&self) -> TaskweaveResult<()> {
        if self.dispatcher.max_concurrent == 0 {
            return Err(TaskweaveError::Config(
                "dispatcher.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.feedback.capacity == 0 {
            return Err(TaskweaveError::Config(
                "feedback.capacity must be at least 1".to_string(),
            ));
        }
        if self.manager.max_attempts == 0 {
            return Err(TaskweaveError::Config(
                "manager.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.manager.escalation_threshold == 0 {
            return Err(TaskweaveError::Config(
                "manager.escalation_threshold must be at least 1".to_string(),
            ));
        }
        if self.manager.dependency_poll_ms < MIN_DEPENDENCY_POLL_MS {
            return Err(TaskweaveError::Config(format!(
                "manager.dependency_poll_ms must be at least {MIN_DEPENDENCY_POLL_MS}"
            )));
        }
        if self.backends.sweep_interval_secs == 0 {
            return Err(TaskweaveError::Config(
                "backends.sweep_interval_secs must be at least 1".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for role in &self.backends.roles {
            if !seen.insert(role.role.as_str()) {
                return Err(TaskweaveError::Config(format!(
                    "backend role '{}' is declared twice",
                    role.role
                )));
            }
        }
        Ok(())
    }

    /// Database location with `data_dir` applied.
    pub fn database_path(&self) -> Option<PathBuf> {
        if self.database == ":memory:" {
            return None;
        }
        let path = PathBuf::from(&self.database);
        Some(if path.is_absolute() {
            path
        } else {
            self.data_dir.join(path)
        })
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_database() -> String {
    "taskweave.db".to_string()
}
fn default_max_concurrent() -> usize {
    4
}
fn default_feedback_capacity() -> usize {
    256
}
fn default_publish_timeout_ms() -> u64 {
    100
}
fn default_dependency_poll_ms() -> u64 {
    250
}
fn default_dependency_timeout_secs() -> u64 {
    600
}
fn default_max_attempts() -> u32 {
    1
}
fn default_escalation_threshold() -> u32 {
    3
}
fn default_temperature() -> f32 {
    0.2
}
fn default_sweep_interval_secs() -> u64 {
    30
}
