use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ReconcileError, Result};

/// Top-level reconciler configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// The organization's management (payer) account. Never assigned to.
    #[serde(default)]
    pub management_account_id: Option<String>,

    #[serde(default)]
    pub directory: DirectoryConfig,

    #[serde(default)]
    pub traversal: TraversalConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub tracker: TrackerConfig,

    #[serde(default)]
    pub notifications: NotificationConfig,
}

impl ReconcilerConfig {
    /// Load configuration from a YAML file. Returns default if the file
    /// doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&contents).map_err(|e| ReconcileError::ConfigParse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectoryMode {
    /// Principals are managed in the identity store itself.
    #[default]
    Native,
    /// Principals are synchronised from an external directory and can be
    /// looked up just-in-time as `name@domain`.
    Integrated,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryConfig {
    #[serde(default)]
    pub mode: DirectoryMode,

    #[serde(default)]
    pub domain_name: Option<String>,
}

impl DirectoryConfig {
    /// The domain suffix for just-in-time lookups, when enabled.
    pub fn jit_domain(&self) -> Option<&str> {
        match self.mode {
            DirectoryMode::Integrated => self.domain_name.as_deref().filter(|d| !d.is_empty()),
            DirectoryMode::Native => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraversalDepth {
    /// Only accounts directly under the requested parent.
    ParentOnly,
    /// Accounts in the whole subtree.
    #[default]
    Nested,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraversalConfig {
    #[serde(default)]
    pub depth: TraversalDepth,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Expansions running at once.
    #[serde(default = "default_expand_concurrency")]
    pub concurrency: usize,

    /// Receives of an expansion request before it is dead-lettered.
    #[serde(default = "default_max_receive_count")]
    pub max_receive_count: u32,

    #[serde(default = "default_redelivery_delay_ms")]
    pub redelivery_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    200
}
fn default_expand_concurrency() -> usize {
    8
}

impl Default for TraversalConfig {
    fn default() -> Self {
        Self {
            depth: TraversalDepth::default(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            concurrency: default_expand_concurrency(),
            max_receive_count: default_max_receive_count(),
            redelivery_delay_ms: default_redelivery_delay_ms(),
        }
    }
}

impl TraversalConfig {
    pub fn redelivery_delay(&self) -> Duration {
        Duration::from_millis(self.redelivery_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_shard_count")]
    pub shard_count: usize,

    /// Receives before a message is dead-lettered.
    #[serde(default = "default_max_receive_count")]
    pub max_receive_count: u32,

    #[serde(default = "default_redelivery_delay_ms")]
    pub redelivery_delay_ms: u64,

    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,

    /// Bounded capacity of each stage channel.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

fn default_shard_count() -> usize {
    10
}
fn default_max_receive_count() -> u32 {
    3
}
fn default_redelivery_delay_ms() -> u64 {
    500
}
fn default_dedup_window_secs() -> u64 {
    300
}
fn default_capacity() -> usize {
    1024
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            shard_count: default_shard_count(),
            max_receive_count: default_max_receive_count(),
            redelivery_delay_ms: default_redelivery_delay_ms(),
            dedup_window_secs: default_dedup_window_secs(),
            capacity: default_capacity(),
        }
    }
}

impl QueueConfig {
    pub fn redelivery_delay(&self) -> Duration {
        Duration::from_millis(self.redelivery_delay_ms)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Bound on the synchronous resolution path. Default: 10 minutes.
    #[serde(default = "default_resolution_secs")]
    pub resolution_secs: u64,

    /// Total polling budget per assignment operation. Default: 2 hours.
    #[serde(default = "default_completion_budget_secs")]
    pub completion_budget_secs: u64,

    #[serde(default = "default_poll_min_delay_ms")]
    pub poll_min_delay_ms: u64,

    #[serde(default = "default_poll_max_delay_ms")]
    pub poll_max_delay_ms: u64,
}

fn default_resolution_secs() -> u64 {
    600
}
fn default_completion_budget_secs() -> u64 {
    7200
}
fn default_poll_min_delay_ms() -> u64 {
    1000
}
fn default_poll_max_delay_ms() -> u64 {
    120_000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            resolution_secs: default_resolution_secs(),
            completion_budget_secs: default_completion_budget_secs(),
            poll_min_delay_ms: default_poll_min_delay_ms(),
            poll_max_delay_ms: default_poll_max_delay_ms(),
        }
    }
}

impl TimeoutConfig {
    pub fn resolution(&self) -> Duration {
        Duration::from_secs(self.resolution_secs)
    }

    pub fn completion_budget(&self) -> Duration {
        Duration::from_secs(self.completion_budget_secs)
    }

    /// First poll delay, never below one millisecond.
    pub fn poll_min_delay(&self) -> Duration {
        Duration::from_millis(self.poll_min_delay_ms.max(1))
    }

    /// Ceiling of the doubling poll delay, never below the first delay.
    pub fn poll_max_delay(&self) -> Duration {
        Duration::from_millis(self.poll_max_delay_ms).max(self.poll_min_delay())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Operations polled concurrently.
    #[serde(default = "default_tracker_concurrency")]
    pub concurrency: usize,
}

fn default_tracker_concurrency() -> usize {
    16
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_tracker_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,

    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
}

fn default_subject_prefix() -> String {
    "[access-reconciler]".into()
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            subject_prefix: default_subject_prefix(),
        }
    }
}
