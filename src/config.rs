//! Configuration management.
//!
//! Loads configuration from an optional TOML file; command-line flags and
//! environment variables are applied on top by the binary before `validate()`.

use crate::error::SnapshotError;
use crate::remote::RemoteSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Snapshot root. Must already exist.
    #[serde(default)]
    pub destination: Option<PathBuf>,

    /// Bearer token for the backend.
    #[serde(default)]
    pub token: Option<String>,

    /// Backend registry id
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Remote folder to snapshot, `""` for the whole account
    #[serde(default)]
    pub remote_path: String,

    /// Completed snapshots to keep; unlimited when unset
    #[serde(default)]
    pub rotations: Option<usize>,

    /// How long resolve waits for more index before re-checking (e.g. "1s")
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// Buffered index bytes that trigger a segment flush
    #[serde(default = "default_segment_bytes")]
    pub segment_bytes: usize,

    /// Read chunk size for index segments
    #[serde(default = "default_read_chunk_bytes")]
    pub read_chunk_bytes: usize,

    /// Resolved entries between job-state writes
    #[serde(default = "default_persist_every")]
    pub persist_every: u64,

    /// Extra attempts for downloads that fail without a response
    #[serde(default = "default_download_retries")]
    pub download_retries: usize,

    /// Delay between download attempts (e.g. "10s")
    #[serde(default = "default_retry_delay")]
    pub retry_delay: String,

    #[serde(default)]
    pub api_url: Option<String>,

    #[serde(default)]
    pub content_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// Default values
fn default_backend() -> String {
    crate::remote::dropbox::BACKEND_ID.to_string()
}

fn default_poll_interval() -> String {
    "1s".to_string()
}

fn default_segment_bytes() -> usize {
    10 * 1024 * 1024 // 10MB
}

fn default_read_chunk_bytes() -> usize {
    crate::arrayio::DEFAULT_CHUNK_SIZE
}

fn default_persist_every() -> u64 {
    100
}

fn default_download_retries() -> usize {
    3
}

fn default_retry_delay() -> String {
    "10s".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            destination: None,
            token: None,
            backend: default_backend(),
            remote_path: String::new(),
            rotations: None,
            poll_interval: default_poll_interval(),
            segment_bytes: default_segment_bytes(),
            read_chunk_bytes: default_read_chunk_bytes(),
            persist_every: default_persist_every(),
            download_retries: default_download_retries(),
            retry_delay: default_retry_delay(),
            api_url: None,
            content_url: None,
            log_level: default_log_level(),
        }
    }
}

/// Validated settings the engines run with.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub destination: PathBuf,
    pub backend: String,
    pub remote: RemoteSettings,
    pub remote_path: String,
    pub rotations: Option<usize>,
    pub poll_interval: Duration,
    pub segment_bytes: usize,
    pub read_chunk_bytes: usize,
    pub persist_every: u64,
    pub download_retries: usize,
    pub retry_delay: Duration,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, SnapshotError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SnapshotError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
            .map_err(|e| SnapshotError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml(content: &str) -> Result<Self, SnapshotError> {
        toml::from_str(content).map_err(|e| SnapshotError::Config(e.to_string()))
    }

    /// Checks required keys and converts to [`RunSettings`].
    ///
    /// Reports every problem at once; nothing on disk is touched.
    pub fn validate(&self) -> Result<RunSettings, SnapshotError> {
        let mut errors = Vec::new();

        let destination = match &self.destination {
            None => {
                errors.push(
                    "destination not set (use --destination or the config file)".to_string(),
                );
                None
            }
            Some(path) if !path.is_dir() => {
                errors.push(format!("destination {} is not an existing directory", path.display()));
                None
            }
            Some(path) => Some(path.clone()),
        };

        let token = self.token.as_deref().map(normalize_token).unwrap_or_default();
        if token.is_empty() {
            errors.push("no access token set (use --token or DSNAPSHOT_TOKEN)".to_string());
        }

        let poll_interval = parse_duration("poll_interval", &self.poll_interval, &mut errors);
        let retry_delay = parse_duration("retry_delay", &self.retry_delay, &mut errors);

        if self.segment_bytes == 0 {
            errors.push("segment_bytes must be positive".to_string());
        }
        if self.read_chunk_bytes == 0 {
            errors.push("read_chunk_bytes must be positive".to_string());
        }
        if self.rotations == Some(0) {
            errors.push("rotations must keep at least one snapshot".to_string());
        }

        match destination {
            Some(destination) if errors.is_empty() => Ok(RunSettings {
                destination,
                backend: self.backend.clone(),
                remote: RemoteSettings {
                    token,
                    api_url: self.api_url.clone(),
                    content_url: self.content_url.clone(),
                },
                remote_path: self.remote_path.clone(),
                rotations: self.rotations,
                poll_interval,
                segment_bytes: self.segment_bytes,
                read_chunk_bytes: self.read_chunk_bytes,
                persist_every: self.persist_every.max(1),
                download_retries: self.download_retries,
                retry_delay,
            }),
            _ => Err(SnapshotError::Config(errors.join("; "))),
        }
    }
}

fn parse_duration(key: &str, value: &str, errors: &mut Vec<String>) -> Duration {
    humantime::parse_duration(value).unwrap_or_else(|e| {
        errors.push(format!("{} '{}': {}", key, value, e));
        Duration::ZERO
    })
}

/// Accepts either a bare token or a pasted redirect fragment
/// (`...#access_token=<token>&token_type=bearer...`).
pub fn normalize_token(raw: &str) -> String {
    let raw = raw.trim();
    match raw.find("access_token=") {
        Some(pos) => {
            let rest = &raw[pos + "access_token=".len()..];
            rest.split('&').next().unwrap_or_default().to_string()
        }
        None => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_toml() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.backend, "dropbox");
        assert_eq!(config.segment_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(matches!(
            Config::from_toml("colour = \"blue\""),
            Err(SnapshotError::Config(_))
        ));
    }

    #[test]
    fn test_validate_reports_missing_keys() {
        match Config::default().validate() {
            Err(SnapshotError::Config(msg)) => {
                assert!(msg.contains("destination"));
                assert!(msg.contains("token"));
            }
            other => panic!("expected config error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_validate_full_config() {
        let dir = tempfile::tempdir().unwrap();
        let toml = format!(
            "destination = {:?}\ntoken = \"abc\"\nremote_path = \"/Photos\"\nrotations = 3\npoll_interval = \"250ms\"\n",
            dir.path().display().to_string()
        );
        let settings = Config::from_toml(&toml).unwrap().validate().unwrap();
        assert_eq!(settings.destination, dir.path());
        assert_eq!(settings.remote.token, "abc");
        assert_eq!(settings.rotations, Some(3));
        assert_eq!(settings.poll_interval, Duration::from_millis(250));
        assert_eq!(settings.retry_delay, Duration::from_secs(10));
    }

    #[test]
    fn test_bad_duration_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            destination: Some(dir.path().to_path_buf()),
            token: Some("abc".to_string()),
            poll_interval: "soon".to_string(),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(SnapshotError::Config(_))));
    }

    #[test]
    fn test_normalize_token() {
        assert_eq!(normalize_token("  plain-token \n"), "plain-token");
        assert_eq!(
            normalize_token("http://localhost:18881/#access_token=abc123&token_type=bearer&uid=1"),
            "abc123"
        );
    }
}
