//! Ambient engineering configuration (§6's Environment Variables section).
//!
//! The spec names exactly two spec-level knobs (`CODOR_WORKSPACE`,
//! `CODOR_CHAT_MARKER_PREFIX`); everything else here is the surrounding
//! engineering configuration this implementation needs to run, following
//! the teacher's `from_env`/`Default` convention.

use std::path::PathBuf;
use std::time::Duration;

use crate::retention::RetentionPolicy;

pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_IDLE_THRESHOLD_SECS: u64 = 600;
pub const DEFAULT_MAX_SPEC_EXCERPT_TOKENS: usize = crate::engine::DEFAULT_MAX_SPEC_EXCERPT_TOKENS;

#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub workspace_root: PathBuf,
    pub chat_marker_prefix: String,
    pub max_retries: u32,
    pub idle_threshold: Duration,
    pub evidence_retention_policy: RetentionPolicy,
    pub evidence_sweep_interval: Duration,
    pub otlp_endpoint: Option<String>,
    pub max_spec_excerpt_tokens: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            workspace_root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            chat_marker_prefix: "@codor".to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            idle_threshold: Duration::from_secs(DEFAULT_IDLE_THRESHOLD_SECS),
            evidence_retention_policy: RetentionPolicy::default(),
            evidence_sweep_interval: Duration::from_secs(crate::retention::DEFAULT_SWEEP_INTERVAL_SECS),
            otlp_endpoint: None,
            max_spec_excerpt_tokens: DEFAULT_MAX_SPEC_EXCERPT_TOKENS,
        }
    }
}

impl CoreConfig {
    /// Reads `CODOR_*` environment variables, falling back to defaults for
    /// anything absent or unparseable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("CODOR_WORKSPACE") {
            config.workspace_root = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("CODOR_CHAT_MARKER_PREFIX") {
            config.chat_marker_prefix = val;
        }

        if let Ok(val) = std::env::var("CODOR_MAX_RETRIES") {
            if let Ok(n) = val.parse() {
                config.max_retries = n;
            }
        }

        if let Ok(val) = std::env::var("CODOR_IDLE_THRESHOLD_SECS") {
            if let Ok(n) = val.parse() {
                config.idle_threshold = Duration::from_secs(n);
            }
        }

        if let Ok(val) = std::env::var("CODOR_EVIDENCE_RETENTION_POLICY") {
            if let Some(policy) = RetentionPolicy::parse(&val) {
                config.evidence_retention_policy = policy;
            }
        }

        if let Ok(val) = std::env::var("CODOR_EVIDENCE_SWEEP_INTERVAL_SECS") {
            if let Ok(n) = val.parse() {
                config.evidence_sweep_interval = Duration::from_secs(n);
            }
        }

        if let Ok(val) = std::env::var("CODOR_OTLP_ENDPOINT") {
            config.otlp_endpoint = Some(val);
        }

        if let Ok(val) = std::env::var("CODOR_MAX_SPEC_EXCERPT_TOKENS") {
            if let Ok(n) = val.parse() {
                config.max_spec_excerpt_tokens = n;
            }
        }

        config
    }

    pub fn database_path(&self) -> PathBuf {
        self.workspace_root.join(".codor").join("tasks.db")
    }

    pub fn evidence_root(&self) -> PathBuf {
        self.workspace_root.join(".codor").join("evidence")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.workspace_root.join(".codor").join("sprint.lock")
    }
}
