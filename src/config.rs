//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::queue::RecoveryPolicy;

/// Dispatcher and service configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Number of pool workers claiming from `todo`.
    pub workers: usize,
    /// How long a cancelled executor gets to stop before it is aborted.
    pub grace_period: Duration,
    /// Port for the HTTP/WS adapter.
    pub port: u16,
    /// Append-only run log; disabled when unset.
    pub run_log_path: Option<PathBuf>,
    /// What to do with jobs stranded in `run` by a restart.
    pub recovery: RecoveryPolicy,
    /// Backend CLI program.
    pub executor_program: String,
    /// Arguments placed before the prompt.
    pub executor_args: Vec<String>,
    /// Directory for daily rolling log files; stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            grace_period: Duration::from_secs(5),
            port: 8080,
            run_log_path: None,
            recovery: RecoveryPolicy::Fail,
            executor_program: "claude".to_string(),
            executor_args: vec![
                "--print".to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
                "--verbose".to_string(),
            ],
            log_dir: None,
        }
    }
}

impl DispatchConfig {
    /// Build config from `AGENT_DISPATCH_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let workers = parse_or(&lookup, "AGENT_DISPATCH_WORKERS", defaults.workers)?;
        if workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "AGENT_DISPATCH_WORKERS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let grace_secs = parse_or(
            &lookup,
            "AGENT_DISPATCH_GRACE_SECS",
            defaults.grace_period.as_secs(),
        )?;
        let port = parse_or(&lookup, "AGENT_DISPATCH_PORT", defaults.port)?;

        let recovery = match lookup("AGENT_DISPATCH_RECOVERY") {
            Some(value) => value.parse()?,
            None => defaults.recovery,
        };

        let executor_args = match lookup("AGENT_DISPATCH_EXECUTOR_ARGS") {
            Some(value) => value.split_whitespace().map(str::to_string).collect(),
            None => defaults.executor_args,
        };

        Ok(Self {
            workers,
            grace_period: Duration::from_secs(grace_secs),
            port,
            run_log_path: lookup("AGENT_DISPATCH_RUN_LOG")
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
            recovery,
            executor_program: lookup("AGENT_DISPATCH_EXECUTOR")
                .unwrap_or(defaults.executor_program),
            executor_args,
            log_dir: lookup("AGENT_DISPATCH_LOG_DIR")
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
        })
    }
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = DispatchConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.grace_period, Duration::from_secs(5));
        assert_eq!(config.recovery, RecoveryPolicy::Fail);
        assert!(config.run_log_path.is_none());
        assert_eq!(config.executor_program, "claude");
    }

    #[test]
    fn overrides_from_env() {
        let config = DispatchConfig::from_lookup(lookup(&[
            ("AGENT_DISPATCH_WORKERS", "4"),
            ("AGENT_DISPATCH_GRACE_SECS", "1"),
            ("AGENT_DISPATCH_RECOVERY", "resubmit"),
            ("AGENT_DISPATCH_RUN_LOG", "/tmp/runs.jsonl"),
            ("AGENT_DISPATCH_EXECUTOR", "codex"),
            ("AGENT_DISPATCH_EXECUTOR_ARGS", "exec  --json"),
            ("AGENT_DISPATCH_LOG_DIR", "/var/log/dispatch"),
        ]))
        .unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.grace_period, Duration::from_secs(1));
        assert_eq!(config.recovery, RecoveryPolicy::Resubmit);
        assert_eq!(config.run_log_path, Some(PathBuf::from("/tmp/runs.jsonl")));
        assert_eq!(config.executor_program, "codex");
        assert_eq!(config.executor_args, vec!["exec", "--json"]);
        assert_eq!(config.log_dir, Some(PathBuf::from("/var/log/dispatch")));
    }

    #[test]
    fn invalid_values_are_errors() {
        let err = DispatchConfig::from_lookup(lookup(&[("AGENT_DISPATCH_PORT", "eighty")]))
            .unwrap_err();
        assert!(err.to_string().contains("AGENT_DISPATCH_PORT"));

        assert!(DispatchConfig::from_lookup(lookup(&[("AGENT_DISPATCH_WORKERS", "0")])).is_err());
    }
}
