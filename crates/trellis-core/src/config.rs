// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

/// Trellis runtime configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL; in-memory stores are used when absent
    pub database_url: Option<String>,
    /// Maximum scheduler runs executing at once across all instances
    pub max_concurrent_runs: usize,
    /// Maximum activities a single scheduler run may execute
    pub max_steps_per_run: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            max_concurrent_runs: 32,
            max_steps_per_run: 10_000,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `TRELLIS_DATABASE_URL`: SQLite connection string (default: in-memory stores)
    /// - `TRELLIS_MAX_CONCURRENT_RUNS`: Max concurrent scheduler runs (default: 32)
    /// - `TRELLIS_MAX_STEPS_PER_RUN`: Step budget per run (default: 10000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("TRELLIS_DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());

        let max_concurrent_runs: usize = std::env::var("TRELLIS_MAX_CONCURRENT_RUNS")
            .unwrap_or_else(|_| "32".to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "TRELLIS_MAX_CONCURRENT_RUNS",
                "must be a positive integer",
            ))?;

        let max_steps_per_run: u64 = std::env::var("TRELLIS_MAX_STEPS_PER_RUN")
            .unwrap_or_else(|_| "10000".to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "TRELLIS_MAX_STEPS_PER_RUN",
                "must be a positive integer",
            ))?;

        Ok(Self {
            database_url,
            max_concurrent_runs,
            max_steps_per_run,
        })
    }

    /// The SQLite file path behind `database_url`, if it names one.
    ///
    /// Accepts `sqlite:path`, `sqlite://path` and a bare path. Query strings are
    /// dropped.
    pub fn database_path(&self) -> Result<Option<String>, ConfigError> {
        let Some(url) = self.database_url.as_deref() else {
            return Ok(None);
        };
        let rest = url
            .strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("sqlite:"))
            .unwrap_or(url);
        let path = rest.split('?').next().unwrap_or_default();
        if path.is_empty() || path == ":memory:" {
            return Err(ConfigError::Invalid(
                "TRELLIS_DATABASE_URL",
                "must name a SQLite database file",
            ));
        }
        Ok(Some(path.to_string()))
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.remove("TRELLIS_DATABASE_URL");
        guard.remove("TRELLIS_MAX_CONCURRENT_RUNS");
        guard.remove("TRELLIS_MAX_STEPS_PER_RUN");

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, None);
        assert_eq!(config.max_concurrent_runs, 32);
        assert_eq!(config.max_steps_per_run, 10_000);
    }

    #[test]
    fn test_config_from_env_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("TRELLIS_DATABASE_URL", "sqlite:.data/trellis.db");
        guard.set("TRELLIS_MAX_CONCURRENT_RUNS", "4");
        guard.set("TRELLIS_MAX_STEPS_PER_RUN", "250");

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url.as_deref(), Some("sqlite:.data/trellis.db"));
        assert_eq!(config.max_concurrent_runs, 4);
        assert_eq!(config.max_steps_per_run, 250);
    }

    #[test]
    fn test_config_invalid_max_concurrent_runs() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.remove("TRELLIS_MAX_STEPS_PER_RUN");
        guard.set("TRELLIS_MAX_CONCURRENT_RUNS", "abc");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("TRELLIS_MAX_CONCURRENT_RUNS", _)
        ));
    }

    #[test]
    fn test_config_zero_step_budget_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.remove("TRELLIS_MAX_CONCURRENT_RUNS");
        guard.set("TRELLIS_MAX_STEPS_PER_RUN", "0");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("TRELLIS_MAX_STEPS_PER_RUN", _)));
    }

    #[test]
    fn test_database_path_forms() {
        let mut config = Config::default();
        assert_eq!(config.database_path().unwrap(), None);

        config.database_url = Some("sqlite:.data/a.db?mode=rwc".to_string());
        assert_eq!(config.database_path().unwrap().as_deref(), Some(".data/a.db"));

        config.database_url = Some("sqlite:///tmp/b.db".to_string());
        assert_eq!(config.database_path().unwrap().as_deref(), Some("/tmp/b.db"));

        config.database_url = Some("c.db".to_string());
        assert_eq!(config.database_path().unwrap().as_deref(), Some("c.db"));

        config.database_url = Some("sqlite::memory:".to_string());
        assert!(config.database_path().is_err());
    }

    #[test]
    fn test_config_error_display() {
        let invalid = ConfigError::Invalid("MY_VAR", "must be a number");
        assert_eq!(
            invalid.to_string(),
            "invalid value for MY_VAR: must be a number"
        );
    }
}
