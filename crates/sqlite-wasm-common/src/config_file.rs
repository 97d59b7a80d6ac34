//! TOML configuration files.
//!
//! - [`ConfigFile`]: top-level configuration file structure

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::EmbedderConfig;

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// module = "./sqlite3.wasm"
///
/// [embedder.engine]
/// cranelift_opt_level = "speed"
/// max_wasm_stack_kb = 2048
///
/// [embedder.memory]
/// max_pages = 16384
///
/// [embedder.host]
/// inherit_env = false
/// working_dir = "/var/lib/app"
///
/// [embedder.host.env]
/// TMPDIR = "/tmp"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Path to the SQLite WebAssembly binary.
    #[serde(default)]
    pub module: Option<PathBuf>,

    /// Embedder configuration.
    #[serde(default)]
    pub embedder: EmbedderConfig,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// A relative `module` path is resolved against the directory holding the
    /// configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigFileError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

        let mut config = Self::from_toml(&content)?;
        if let (Some(module), Some(parent)) = (config.module.as_ref(), path.parent()) {
            if module.is_relative() {
                config.module = Some(parent.join(module));
            }
        }
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigFileError> {
        if self.embedder.memory.max_pages == 0 || self.embedder.memory.max_pages > 65_536 {
            return Err(ConfigFileError::Invalid {
                message: format!(
                    "memory.max_pages must be in 1..=65536, got {}",
                    self.embedder.memory.max_pages
                ),
            });
        }
        if self.embedder.engine.max_wasm_stack_kb == 0 {
            return Err(ConfigFileError::Invalid {
                message: "engine.max_wasm_stack_kb must be positive".into(),
            });
        }
        Ok(())
    }
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },

    /// Parsed values are out of range.
    #[error("Invalid config file: {message}")]
    Invalid { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_file() {
        let config = ConfigFile::default();

        assert!(config.module.is_none());
        assert_eq!(config.embedder.memory.max_pages, 32_768);
        assert!(config.embedder.host.env.is_empty());
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            module = "./sqlite3.wasm"
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();

        assert_eq!(config.module, Some(PathBuf::from("./sqlite3.wasm")));
        // Defaults applied
        assert_eq!(config.embedder.engine.max_wasm_stack_kb, 1024);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            module = "/opt/sqlite3.wasm"

            [embedder.engine]
            cranelift_opt_level = "speed_and_size"
            max_wasm_stack_kb = 2048
            debug_info = true

            [embedder.memory]
            max_pages = 1024
            max_table_elements = 5000

            [embedder.host]
            inherit_env = true
            working_dir = "/data"
            forward_stdio = false

            [embedder.host.env]
            TMPDIR = "/tmp"
            LANG = "C"
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();

        assert_eq!(
            config.embedder.engine.cranelift_opt_level,
            crate::config::OptLevel::SpeedAndSize
        );
        assert_eq!(config.embedder.engine.max_wasm_stack_kb, 2048);
        assert!(config.embedder.engine.debug_info);
        assert_eq!(config.embedder.memory.max_pages, 1024);
        assert_eq!(config.embedder.memory.max_table_elements, 5000);
        assert!(config.embedder.host.inherit_env);
        assert_eq!(config.embedder.host.working_dir, Some(PathBuf::from("/data")));
        assert!(!config.embedder.host.forward_stdio);
        assert_eq!(config.embedder.host.env.get("TMPDIR").map(String::as_str), Some("/tmp"));
        assert_eq!(config.embedder.host.env.len(), 2);
    }

    #[test]
    fn test_reject_out_of_range_pages() {
        let toml = r#"
            [embedder.memory]
            max_pages = 0
        "#;
        let result = ConfigFile::from_toml(toml);
        assert!(matches!(result, Err(ConfigFileError::Invalid { .. })));
    }

    #[test]
    fn test_parse_invalid_toml() {
        let invalid = "this is not valid toml [";
        let result = ConfigFile::from_toml(invalid);
        assert!(matches!(result, Err(ConfigFileError::Parse { .. })));
    }
}
