//! Plugin discovery and loading: search path priority is custom directory
//! first, then bundled examples, then the standard install location
//! (`Config::plugin_search_paths`, in that order); every plugin is
//! structurally validated the moment it's loaded.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::config::Config;
use crate::error::EngineError;
use crate::model::Plugin;

fn candidate_paths(search_paths: &[PathBuf], plugin_id: &str) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for dir in search_paths {
        out.push(dir.join(format!("{plugin_id}.json")));
        out.push(dir.join(format!("{plugin_id}.yaml")));
        out.push(dir.join(format!("{plugin_id}.yml")));
    }
    out
}

/// Find the first existing file for `plugin_id` across the configured
/// search paths, in priority order.
pub fn discover_plugin(config: &Config, plugin_id: &str) -> Result<PathBuf, EngineError> {
    for candidate in candidate_paths(&config.plugin_search_paths, plugin_id) {
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(EngineError::PluginNotFound(plugin_id.to_string()))
}

/// Parse and structurally validate a plugin manifest from a specific path.
pub fn load_plugin(path: &Path) -> Result<Plugin, EngineError> {
    let raw = std::fs::read_to_string(path).map_err(EngineError::Io)?;
    let plugin: Plugin = match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => serde_yaml::from_str(&raw)
            .map_err(|e| EngineError::from(crate::error::PluginError::Malformed(e.to_string())))?,
        _ => serde_json::from_str(&raw)
            .map_err(|e| EngineError::from(crate::error::PluginError::Malformed(e.to_string())))?,
    };
    plugin.validate()?;
    info!(plugin_id = %plugin.id, path = %path.display(), "plugin loaded");
    Ok(plugin)
}

/// Discover, then load and validate, a plugin by id.
pub fn load_plugin_by_id(config: &Config, plugin_id: &str) -> Result<Plugin, EngineError> {
    let path = discover_plugin(config, plugin_id)?;
    load_plugin(&path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discover_respects_search_path_priority() {
        let dir_a = std::env::temp_dir().join(format!("fuzzcore-plugA-{}", std::process::id()));
        let dir_b = std::env::temp_dir().join(format!("fuzzcore-plugB-{}", std::process::id()));
        std::fs::create_dir_all(&dir_a).unwrap();
        std::fs::create_dir_all(&dir_b).unwrap();
        std::fs::write(dir_a.join("echo.json"), "{}").unwrap();
        std::fs::write(dir_b.join("echo.json"), "{}").unwrap();

        let mut config = Config::default();
        config.plugin_search_paths = vec![dir_a.clone(), dir_b.clone()];
        let found = discover_plugin(&config, "echo").unwrap();
        assert_eq!(found, dir_a.join("echo.json"));

        let _ = std::fs::remove_dir_all(&dir_a);
        let _ = std::fs::remove_dir_all(&dir_b);
    }

    #[test]
    fn missing_plugin_is_not_found() {
        let config = Config::default();
        let err = discover_plugin(&config, "does-not-exist-xyz").unwrap_err();
        assert!(matches!(err, EngineError::PluginNotFound(_)));
    }
}
