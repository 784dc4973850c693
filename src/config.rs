//! Engine configuration (§6's Configuration table), loaded from JSON or
//! YAML: one flat struct, one `Default` impl with the documented defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where plugins are discovered from, in priority order: a custom
    /// directory first, then the bundled examples, then the standard
    /// install location.
    pub plugin_search_paths: Vec<PathBuf>,
    /// Root directory for session checkpoints and the findings log.
    pub checkpoint_dir: PathBuf,
    /// Hard cap on concurrently running sessions (§5).
    pub max_concurrent_sessions: usize,
    /// Reproducer bytes recorded per finding are truncated to this length.
    pub finding_max_bytes: usize,
    /// Iterations between checkpoint writes, independent of the
    /// on-status-change and on-shutdown writes a campaign always does.
    pub checkpoint_interval: u64,
    /// A session with no activity for this many hours is eligible for
    /// checkpoint/findings garbage collection.
    pub session_ttl_hours: u64,
    /// Default state-model reset cadence when a plugin doesn't set one.
    pub default_reset_cadence: Option<u32>,
    /// Upper bound on sends per second per session; `None` disables
    /// rate limiting.
    pub rate_limit_per_second: Option<f64>,
    /// Default connect/response timeout, in seconds.
    pub default_timeout_secs: u64,
    /// Carried for a future HTTP façade; the core does nothing with these.
    pub cors_enabled: bool,
    pub cors_origins: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            plugin_search_paths: vec![
                PathBuf::from("./plugins"),
                PathBuf::from("./examples/plugins"),
                PathBuf::from("/usr/share/fuzzcore/plugins"),
            ],
            checkpoint_dir: PathBuf::from("./fuzzcore-data"),
            max_concurrent_sessions: 1,
            finding_max_bytes: 65536,
            checkpoint_interval: 1000,
            session_ttl_hours: 96,
            default_reset_cadence: None,
            rate_limit_per_second: None,
            default_timeout_secs: 5,
            cors_enabled: false,
            cors_origins: Vec::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(path).map_err(EngineError::Io)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&raw)
                .map_err(|e| EngineError::InvalidConfig(e.to_string())),
            _ => serde_json::from_str(&raw).map_err(|e| EngineError::InvalidConfig(e.to_string())),
        }
    }

    pub fn plugin_search_order(&self) -> impl Iterator<Item = &PathBuf> {
        self.plugin_search_paths.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.max_concurrent_sessions, 1);
        assert_eq!(cfg.finding_max_bytes, 65536);
        assert_eq!(cfg.checkpoint_interval, 1000);
        assert_eq!(cfg.session_ttl_hours, 96);
        assert!(!cfg.cors_enabled);
    }

    #[test]
    fn loads_json_config_from_disk() {
        let dir = std::env::temp_dir().join(format!("fuzzcore-cfg-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        std::fs::write(&path, r#"{"max_concurrent_sessions": 3}"#).unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.max_concurrent_sessions, 3);
        assert_eq!(cfg.finding_max_bytes, 65536);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
