//! Configuration loading from toolpool.toml.

use std::path::Path;

use pool::PoolConfig;

use crate::error::{Error, Result};

/// Default configuration file, relative to the working directory.
pub const CONFIG_FILE: &str = "toolpool.toml";

/// Load and validate the pool configuration at `path`.
pub fn load(path: &Path) -> Result<PoolConfig> {
    if !path.exists() {
        return Err(Error::ConfigNotFound {
            path: path.to_path_buf(),
        });
    }
    Ok(PoolConfig::load(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_reported_with_path() {
        let err = load(Path::new("/nonexistent/toolpool.toml")).unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound { .. }));
        assert!(err.to_string().contains("/nonexistent/toolpool.toml"));
    }

    #[test]
    fn loads_a_valid_file() {
        let path = std::env::temp_dir().join(format!("toolpool-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            "[servers.fs]\ntransport = \"stdio\"\ncommand = \"mcp-fs\"\n",
        )
        .unwrap();

        let config = load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert!(config.server("fs").is_some());
    }
}
