//! Environment variable and config file support for [`ExecutorBuilder`](super::executor::ExecutorBuilder).
//!
//! # Configuration Precedence
//!
//! Settings are resolved in this order (highest priority first):
//!
//! 1. **Programmatic**: values set via builder methods (`worker_threads(4)`)
//! 2. **Environment variables**: values from `CQBRIDGE_*` env vars
//! 3. **Config file**: values loaded from a TOML file (requires `config-file` feature)
//! 4. **Defaults**: built-in defaults from [`ExecutorConfig::default()`]
//!
//! # Supported Environment Variables
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `CQBRIDGE_WORKER_THREADS` | `usize` | `pool.threads` |
//! | `CQBRIDGE_THREAD_NAME_PREFIX` | `String` | `pool.thread_name_prefix` |
//! | `CQBRIDGE_THREAD_STACK_SIZE` | `usize` | `pool.thread_stack_size` |
//! | `CQBRIDGE_COMPLETION_BATCH_LIMIT` | `usize` | `engine.completion_batch_limit` |
//! | `CQBRIDGE_SHUTDOWN_POLICY` | `exit` / `error` | `engine.shutdown_policy` |

use crate::error::Error;
use crate::runtime::config::{ExecutorConfig, ShutdownPolicy};

/// Environment variable name for worker thread count.
pub const ENV_WORKER_THREADS: &str = "CQBRIDGE_WORKER_THREADS";
/// Environment variable name for worker thread name prefix.
pub const ENV_THREAD_NAME_PREFIX: &str = "CQBRIDGE_THREAD_NAME_PREFIX";
/// Environment variable name for worker thread stack size.
pub const ENV_THREAD_STACK_SIZE: &str = "CQBRIDGE_THREAD_STACK_SIZE";
/// Environment variable name for the per-read completion batch limit.
pub const ENV_COMPLETION_BATCH_LIMIT: &str = "CQBRIDGE_COMPLETION_BATCH_LIMIT";
/// Environment variable name for the transport shutdown policy.
pub const ENV_SHUTDOWN_POLICY: &str = "CQBRIDGE_SHUTDOWN_POLICY";

/// Apply environment variable overrides to an [`ExecutorConfig`].
///
/// Only variables that are set in the environment are applied.
/// Returns an error if a variable is set but contains an unparseable value.
pub fn apply_env_overrides(config: &mut ExecutorConfig) -> Result<(), Error> {
    if let Some(val) = read_env(ENV_WORKER_THREADS) {
        config.pool.threads = parse_usize(ENV_WORKER_THREADS, &val)?;
    }
    if let Some(val) = read_env(ENV_THREAD_NAME_PREFIX) {
        config.pool.thread_name_prefix = val;
    }
    if let Some(val) = read_env(ENV_THREAD_STACK_SIZE) {
        config.pool.thread_stack_size = parse_usize(ENV_THREAD_STACK_SIZE, &val)?;
    }
    if let Some(val) = read_env(ENV_COMPLETION_BATCH_LIMIT) {
        config.engine.completion_batch_limit = parse_usize(ENV_COMPLETION_BATCH_LIMIT, &val)?;
    }
    if let Some(val) = read_env(ENV_SHUTDOWN_POLICY) {
        config.engine.shutdown_policy = parse_policy(ENV_SHUTDOWN_POLICY, &val)?;
    }
    Ok(())
}

/// Read an environment variable, returning `None` if unset.
fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn parse_usize(var_name: &str, val: &str) -> Result<usize, Error> {
    val.trim().parse::<usize>().map_err(|e| {
        Error::config(format!(
            "invalid value for {var_name}: expected unsigned integer, got {val:?} ({e})"
        ))
    })
}

fn parse_policy(var_name: &str, val: &str) -> Result<ShutdownPolicy, Error> {
    val.parse::<ShutdownPolicy>().map_err(|e| {
        Error::config(format!(
            "invalid value for {var_name}: expected exit/error, got {val:?} ({e})"
        ))
    })
}

// =========================================================================
// TOML config file support (feature-gated)
// =========================================================================

/// TOML-deserializable executor configuration.
///
/// ```toml
/// [engine]
/// completion_batch_limit = 64
/// shutdown_policy = "error"
///
/// [pool]
/// threads = 4
/// thread_name_prefix = "rpc-worker"
/// thread_stack_size = 2097152
/// ```
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct ExecutorTomlConfig {
    /// Engine settings.
    #[serde(default)]
    pub engine: EngineToml,
    /// Worker pool settings.
    #[serde(default)]
    pub pool: PoolToml,
}

/// Engine section of the TOML config.
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct EngineToml {
    /// Completions handled per blocking read.
    pub completion_batch_limit: Option<usize>,
    /// `"exit"` or `"error"`.
    pub shutdown_policy: Option<String>,
}

/// Worker pool section of the TOML config.
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct PoolToml {
    /// Number of worker threads.
    pub threads: Option<usize>,
    /// Name prefix for worker threads.
    pub thread_name_prefix: Option<String>,
    /// Stack size per worker thread in bytes.
    pub thread_stack_size: Option<usize>,
}

/// Apply a parsed TOML config to an [`ExecutorConfig`].
///
/// Only fields that are `Some` in the TOML struct override the config.
#[cfg(feature = "config-file")]
pub fn apply_toml_config(
    config: &mut ExecutorConfig,
    toml: &ExecutorTomlConfig,
) -> Result<(), Error> {
    if let Some(v) = toml.engine.completion_batch_limit {
        config.engine.completion_batch_limit = v;
    }
    if let Some(ref v) = toml.engine.shutdown_policy {
        config.engine.shutdown_policy = parse_policy("engine.shutdown_policy", v)?;
    }
    if let Some(v) = toml.pool.threads {
        config.pool.threads = v;
    }
    if let Some(ref v) = toml.pool.thread_name_prefix {
        config.pool.thread_name_prefix.clone_from(v);
    }
    if let Some(v) = toml.pool.thread_stack_size {
        config.pool.thread_stack_size = v;
    }
    Ok(())
}

/// Parse a TOML string into an [`ExecutorTomlConfig`].
#[cfg(feature = "config-file")]
pub fn parse_toml_str(toml_str: &str) -> Result<ExecutorTomlConfig, Error> {
    toml::from_str(toml_str)
        .map_err(|e| Error::config(format!("failed to parse TOML config: {e}")))
}

/// Read and parse a TOML file into an [`ExecutorTomlConfig`].
#[cfg(feature = "config-file")]
pub fn parse_toml_file(path: &std::path::Path) -> Result<ExecutorTomlConfig, Error> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::config(format!(
            "failed to read config file {}: {e}",
            path.display()
        ))
        .with_source(e)
    })?;
    parse_toml_str(&content)
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const ALL_VARS: [&str; 5] = [
        ENV_WORKER_THREADS,
        ENV_THREAD_NAME_PREFIX,
        ENV_THREAD_STACK_SIZE,
        ENV_COMPLETION_BATCH_LIMIT,
        ENV_SHUTDOWN_POLICY,
    ];

    fn with_envs<F, R>(vars: &[(&str, &str)], f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let _guard = crate::test_utils::env_lock();
        for var in ALL_VARS {
            std::env::remove_var(var);
        }
        for (k, v) in vars {
            std::env::set_var(k, v);
        }
        let result = f();
        for (k, _) in vars {
            std::env::remove_var(k);
        }
        result
    }

    #[test]
    fn parse_usize_valid() {
        assert_eq!(super::parse_usize("TEST", "42").unwrap(), 42);
        assert_eq!(super::parse_usize("TEST", " 100 ").unwrap(), 100);
    }

    #[test]
    fn parse_usize_invalid() {
        assert!(super::parse_usize("TEST", "abc").is_err());
        assert!(super::parse_usize("TEST", "-1").is_err());
        assert!(super::parse_usize("TEST", "").is_err());
    }

    #[test]
    fn no_env_keeps_defaults() {
        with_envs(&[], || {
            let mut config = ExecutorConfig::default();
            apply_env_overrides(&mut config).unwrap();
            assert_eq!(config, ExecutorConfig::default());
        });
    }

    #[test]
    fn env_overrides_all_fields() {
        with_envs(
            &[
                (ENV_WORKER_THREADS, "3"),
                (ENV_THREAD_NAME_PREFIX, "rpc-worker"),
                (ENV_THREAD_STACK_SIZE, "65536"),
                (ENV_COMPLETION_BATCH_LIMIT, "16"),
                (ENV_SHUTDOWN_POLICY, "error"),
            ],
            || {
                let mut config = ExecutorConfig::default();
                apply_env_overrides(&mut config).unwrap();
                assert_eq!(config.pool.threads, 3);
                assert_eq!(config.pool.thread_name_prefix, "rpc-worker");
                assert_eq!(config.pool.thread_stack_size, 65536);
                assert_eq!(config.engine.completion_batch_limit, 16);
                assert_eq!(config.engine.shutdown_policy, ShutdownPolicy::ReturnError);
            },
        );
    }

    #[test]
    fn env_invalid_value_is_config_error() {
        with_envs(&[(ENV_WORKER_THREADS, "many")], || {
            let mut config = ExecutorConfig::default();
            let err = apply_env_overrides(&mut config).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Config);
            assert!(err.to_string().contains(ENV_WORKER_THREADS));
        });
    }

    #[test]
    fn env_invalid_policy() {
        with_envs(&[(ENV_SHUTDOWN_POLICY, "restart")], || {
            let mut config = ExecutorConfig::default();
            assert!(apply_env_overrides(&mut config).is_err());
        });
    }

    #[cfg(feature = "config-file")]
    #[test]
    fn toml_overrides_only_present_fields() {
        let parsed = parse_toml_str(
            r#"
            [engine]
            shutdown_policy = "error"

            [pool]
            threads = 2
            "#,
        )
        .unwrap();
        let mut config = ExecutorConfig::default();
        apply_toml_config(&mut config, &parsed).unwrap();
        assert_eq!(config.engine.shutdown_policy, ShutdownPolicy::ReturnError);
        assert_eq!(config.engine.completion_batch_limit, 128);
        assert_eq!(config.pool.threads, 2);
        assert_eq!(config.pool.thread_name_prefix, "cqbridge-worker");
    }

    #[cfg(feature = "config-file")]
    #[test]
    fn toml_parse_error() {
        assert!(parse_toml_str("[engine\nbroken").is_err());
    }
}
