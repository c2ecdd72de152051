//! Configuration loader.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::error::ConfigError;
use crate::schema::Config;

static ENV_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("env var pattern is valid"));

/// Configuration loader with environment variable substitution.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = fs::read_to_string(path)?;
        Self::load_str(&content)
    }

    /// Load configuration from a file if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Config, ConfigError> {
        match Self::load(path) {
            Err(ConfigError::NotFound(_)) => Ok(Config::default()),
            other => other,
        }
    }

    /// Load configuration from a string.
    pub fn load_str(content: &str) -> Result<Config, ConfigError> {
        let expanded = Self::expand_env_vars(content)?;
        let mut config: Config = toml::from_str(&expanded)?;

        config.queue.db_path = config.queue.db_path.map(|p| Self::expand_pathbuf(&p));
        config.logging.file_dir = config.logging.file_dir.map(|p| Self::expand_pathbuf(&p));

        Ok(config)
    }

    /// Expand environment variables in the format `${VAR}`.
    fn expand_env_vars(content: &str) -> Result<String, ConfigError> {
        let mut result = content.to_string();

        for cap in ENV_VAR.captures_iter(content) {
            let var_name = &cap[1];
            let var_value = std::env::var(var_name)
                .map_err(|_| ConfigError::EnvVarNotSet(var_name.to_string()))?;
            result = result.replace(&cap[0], &var_value);
        }

        Ok(result)
    }

    /// Expand shell-style paths (e.g., `~/.local/share`).
    pub fn expand_path(path: &str) -> String {
        shellexpand::tilde(path).to_string()
    }

    fn expand_pathbuf(path: &Path) -> PathBuf {
        match path.to_str() {
            Some(s) => PathBuf::from(Self::expand_path(s)),
            None => path.to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_empty_config() {
        let config = ConfigLoader::load_str("").unwrap();
        assert_eq!(config.queue.poll_interval_ms, 1000);
        assert_eq!(config.scheduler.tick_interval_secs, 60);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_queue_section() {
        let content = r#"
            [queue]
            max_workers = 2
            poll_interval_ms = 250
            retry_delay_base_ms = 500
            default_max_retries = 5
            job_timeout_secs = 0
        "#;
        let config = ConfigLoader::load_str(content).unwrap();
        assert_eq!(config.queue.max_workers, 2);
        assert_eq!(config.queue.poll_interval_ms, 250);
        assert_eq!(config.queue.retry_delay_base_ms, 500);
        assert_eq!(config.queue.default_max_retries, 5);
        assert!(config.queue.job_timeout().is_none());
    }

    #[test]
    fn test_load_scheduler_and_logging() {
        let content = r#"
            [scheduler]
            enabled = false
            tick_interval_secs = 15

            [logging]
            level = "debug"
            json = true
        "#;
        let config = ConfigLoader::load_str(content).unwrap();
        assert!(!config.scheduler.enabled);
        assert_eq!(config.scheduler.tick_interval_secs, 15);
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
    }

    #[test]
    fn test_db_path_tilde_expanded() {
        let content = r#"
            [queue]
            db_path = "~/taskforge/jobs.db"
        "#;
        let config = ConfigLoader::load_str(content).unwrap();
        let path = config.queue.db_path.unwrap();
        assert!(!path.to_string_lossy().starts_with('~'));
        assert!(path.ends_with("taskforge/jobs.db"));
    }

    #[test]
    fn test_invalid_toml() {
        let result = ConfigLoader::load_str("[queue\nmax_workers = ");
        assert!(matches!(result, Err(ConfigError::TomlParse(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[queue]\nmax_workers = 3").unwrap();

        let config = ConfigLoader::load(file.path()).unwrap();
        assert_eq!(config.queue.max_workers, 3);
    }

    #[test]
    fn test_load_missing_file() {
        let result = ConfigLoader::load(Path::new("/nonexistent/taskforge.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));

        let missing = Path::new("/nonexistent/taskforge.toml");
        let config = ConfigLoader::load_or_default(missing).unwrap();
        assert_eq!(config.queue.default_max_retries, 3);
    }

    #[test]
    fn test_expand_env_vars() {
        // SAFETY: This test runs in isolation and sets a unique test-only env var
        unsafe {
            std::env::set_var("TASKFORGE_TEST_DB", "/var/lib/taskforge.db");
        }
        let content = "[queue]\ndb_path = \"${TASKFORGE_TEST_DB}\"";
        let config = ConfigLoader::load_str(content).unwrap();
        assert_eq!(config.queue.db_path, Some(PathBuf::from("/var/lib/taskforge.db")));
        unsafe {
            std::env::remove_var("TASKFORGE_TEST_DB");
        }
    }

    #[test]
    fn test_expand_env_vars_not_set() {
        let content = "value = \"${NONEXISTENT_TASKFORGE_VAR_12345}\"";
        let result = ConfigLoader::expand_env_vars(content);
        assert!(matches!(result, Err(ConfigError::EnvVarNotSet(_))));
    }

    #[test]
    fn test_expand_path_no_tilde() {
        let path = "/usr/local/bin";
        assert_eq!(ConfigLoader::expand_path(path), path);
    }
}
