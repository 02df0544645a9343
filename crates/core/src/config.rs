use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub storage: StorageConfig,
    pub aws: AwsConfig,
    pub ingest: IngestConfig,
    pub loader: LoaderConfig,
}

/// Well-known env keys that identify a profile when prefixed.
const PROFILE_MARKER_KEYS: &[&str] = &[
    "AWS_ACCESS_KEY_ID",
    "DATABASE_URL",
    "STATE_DIRECTORY",
    "OBJECT_STORE_ROOT",
];

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `LOADSTAR_PROFILE` env var. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("LOADSTAR_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            storage: StorageConfig::from_env_profiled(p),
            aws: AwsConfig::from_env_profiled(p),
            ingest: IngestConfig::from_env_profiled(p),
            loader: LoaderConfig::from_env_profiled(p),
        }
    }

    /// Discover available profiles by scanning env vars for `{PREFIX}_{MARKER_KEY}` patterns.
    /// Always includes "default" (the unprefixed config).
    pub fn available_profiles() -> Vec<String> {
        let mut profiles = std::collections::BTreeSet::new();
        profiles.insert("default".to_string());

        for (key, _) in env::vars() {
            for marker in PROFILE_MARKER_KEYS {
                if let Some(prefix) = key.strip_suffix(&format!("_{}", marker)) {
                    if !prefix.is_empty()
                        && prefix.chars().all(|c| c.is_ascii_uppercase() || c == '_')
                    {
                        profiles.insert(prefix.to_string());
                    }
                }
            }
        }

        profiles.into_iter().collect()
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  storage:     state_dir={}, tmp_dir={}",
            self.storage.state_dir.display(),
            self.storage.tmp_dir.display()
        );
        match &self.aws.local_root {
            Some(root) => tracing::info!("  objects:     local root {}", root.display()),
            None => tracing::info!(
                "  objects:     s3 region={}, signed={}",
                self.aws.region,
                self.aws.is_configured()
            ),
        }
        tracing::info!(
            "  ingest:      max_concurrent_files={}, max_file_size_mb={}, cache_ttl={}s",
            self.ingest.max_concurrent_files,
            self.ingest.max_file_size_mb,
            self.ingest.metadata_cache_ttl_secs
        );
        tracing::info!(
            "  loader:      program={}, database={}",
            self.loader.program,
            if self.loader.database_url.is_some() { "(set)" } else { "(none)" }
        );
    }

    /// Return a redacted view safe for printing (no secrets).
    pub fn redacted_summary(&self) -> serde_json::Value {
        serde_json::json!({
            "profile": self.profile_label(),
            "storage": {
                "state_dir": self.storage.state_dir,
                "jobs_dir": self.storage.jobs_dir(),
                "tmp_dir": self.storage.tmp_dir,
            },
            "aws": {
                "region": self.aws.region,
                "endpoint_url": self.aws.endpoint_url,
                "local_root": self.aws.local_root,
                "configured": self.aws.is_configured(),
            },
            "ingest": {
                "max_concurrent_files": self.ingest.max_concurrent_files,
                "max_file_size_mb": self.ingest.max_file_size_mb,
                "metadata_cache_ttl_secs": self.ingest.metadata_cache_ttl_secs,
                "stale_job_secs": self.ingest.stale_job_secs,
                "job_retention_days": self.ingest.job_retention_days,
                "cancel_grace_secs": self.ingest.cancel_grace_secs,
                "download_chunk_mb": self.ingest.download_chunk_mb,
                "jobs_page_size": self.ingest.jobs_page_size,
                "sweep_interval_secs": self.ingest.sweep_interval_secs,
            },
            "loader": {
                "program": self.loader.program,
                "args": self.loader.base_args,
                "method": self.loader.method,
                "database_configured": self.loader.database_url.is_some(),
            },
        })
    }
}

// ── Storage ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of durable state. Job records live in `{state_dir}/jobs`.
    pub state_dir: PathBuf,
    /// Scratch directory for downloaded objects.
    pub tmp_dir: PathBuf,
}

impl StorageConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            state_dir: PathBuf::from(profiled_env_or(p, "STATE_DIRECTORY", "./state")),
            tmp_dir: PathBuf::from(profiled_env_or(p, "TMP_DIR", "/tmp/shared")),
        }
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.state_dir.join("jobs")
    }
}

// ── AWS / S3 ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsConfig {
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    pub endpoint_url: Option<String>,
    /// When set, buckets are directories under this root instead of S3.
    pub local_root: Option<PathBuf>,
}

impl AwsConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            region: profiled_env_or(p, "AWS_REGION", "us-west-2"),
            access_key_id: profiled_env_opt(p, "AWS_ACCESS_KEY_ID"),
            secret_access_key: profiled_env_opt(p, "AWS_SECRET_ACCESS_KEY"),
            session_token: profiled_env_opt(p, "AWS_SESSION_TOKEN"),
            endpoint_url: profiled_env_opt(p, "AWS_ENDPOINT_URL"),
            local_root: profiled_env_opt(p, "OBJECT_STORE_ROOT").map(PathBuf::from),
        }
    }

    /// True when signed S3 requests are possible.
    pub fn is_configured(&self) -> bool {
        self.access_key_id.is_some() && self.secret_access_key.is_some()
    }
}

// ── Ingest ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Loader processes allowed to run at once across the whole service.
    pub max_concurrent_files: u32,
    pub max_file_size_mb: u64,
    pub metadata_cache_ttl_secs: u64,
    /// Jobs left `processing` longer than this are considered interrupted.
    pub stale_job_secs: u64,
    pub job_retention_days: u32,
    pub cancel_grace_secs: u64,
    pub download_chunk_mb: u32,
    pub jobs_page_size: u32,
    pub sweep_interval_secs: u64,
    pub synthetic_min_secs: u64,
    pub synthetic_max_secs: u64,
}

impl IngestConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            max_concurrent_files: profiled_env_u32(p, "MAX_CONCURRENT_FILES", 2).max(1),
            max_file_size_mb: profiled_env_u64(p, "MAX_FILE_SIZE_MB", 1500),
            metadata_cache_ttl_secs: profiled_env_u64(p, "METADATA_CACHE_TTL_SECS", 3600),
            stale_job_secs: profiled_env_u64(p, "STALE_JOB_SECS", 1800),
            job_retention_days: profiled_env_u32(p, "JOB_RETENTION_DAYS", 30),
            cancel_grace_secs: profiled_env_u64(p, "CANCEL_GRACE_SECS", 5),
            download_chunk_mb: profiled_env_u32(p, "DOWNLOAD_CHUNK_MB", 10).max(1),
            jobs_page_size: profiled_env_u32(p, "JOBS_PAGE_SIZE", 10).max(1),
            sweep_interval_secs: profiled_env_u64(p, "SWEEP_INTERVAL_SECS", 300),
            synthetic_min_secs: profiled_env_u64(p, "SYNTHETIC_MIN_SECS", 10),
            synthetic_max_secs: profiled_env_u64(p, "SYNTHETIC_MAX_SECS", 30),
        }
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }

    pub fn download_chunk_bytes(&self) -> usize {
        self.download_chunk_mb as usize * 1024 * 1024
    }

    pub fn metadata_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.metadata_cache_ttl_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_job_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.job_retention_days) * 86_400)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

// ── External loader ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    pub program: String,
    /// Arguments placed before the load sub-command.
    pub base_args: Vec<String>,
    pub database_url: Option<String>,
    pub method: String,
    pub queryable_index_fields: String,
}

impl LoaderConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            program: profiled_env_or(p, "LOADER_PROGRAM", "micromamba"),
            base_args: profiled_env_or(p, "LOADER_ARGS", "run -p /opt/conda pypgstac")
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            database_url: profiled_env_opt(p, "DATABASE_URL"),
            method: profiled_env_or(p, "LOADER_METHOD", "insert_ignore"),
            queryable_index_fields: profiled_env_or(p, "QUERYABLE_INDEX_FIELDS", "dt_days,created"),
        }
    }
}
