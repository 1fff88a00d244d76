use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::backoff::BackoffConfig;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ClusterBackend {
    #[serde(rename = "kubernetes")]
    Kubernetes,
    /// Self-contained cluster held in process memory
    #[serde(rename = "memory")]
    InMemory,
}

impl Default for ClusterBackend {
    fn default() -> Self {
        ClusterBackend::Kubernetes
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub kube: KubeConfig,
    pub controller: ControllerConfig,
    pub backoff: BackoffSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubeConfig {
    /// Namespace to watch; all namespaces when unset
    pub namespace: Option<String>,
    #[serde(default)]
    pub backend: ClusterBackend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub workers: usize,
    pub max_conflict_retries: u32,
    pub resync_interval_secs: u64,
    pub event_buffer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffSettings {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub default_restart_limit: i32,
}

impl Config {
    pub fn load() -> crate::Result<Self> {
        // Load environment variables from .env file if it exists
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable source, then validates it.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> crate::Result<Self> {
        let defaults = Config::default();

        let config = Config {
            server: ServerConfig {
                addr: lookup("SERVER_ADDR").unwrap_or(defaults.server.addr),
            },
            kube: KubeConfig {
                namespace: lookup("WATCH_NAMESPACE").filter(|ns| !ns.is_empty()),
                backend: match lookup("CLUSTER_BACKEND")
                    .unwrap_or_else(|| "kubernetes".to_string())
                    .to_lowercase()
                    .as_str()
                {
                    "kubernetes" => ClusterBackend::Kubernetes,
                    "memory" => ClusterBackend::InMemory,
                    other => {
                        return Err(crate::Error::Config(format!(
                            "CLUSTER_BACKEND must be kubernetes or memory, got {}",
                            other
                        )))
                    }
                },
            },
            controller: ControllerConfig {
                workers: parse(&lookup, "CONTROLLER_WORKERS", defaults.controller.workers)?,
                max_conflict_retries: parse(
                    &lookup,
                    "MAX_CONFLICT_RETRIES",
                    defaults.controller.max_conflict_retries,
                )?,
                resync_interval_secs: parse(
                    &lookup,
                    "RESYNC_INTERVAL_SECS",
                    defaults.controller.resync_interval_secs,
                )?,
                event_buffer: parse(&lookup, "EVENT_BUFFER", defaults.controller.event_buffer)?,
            },
            backoff: BackoffSettings {
                initial_ms: parse(&lookup, "RESTART_BACKOFF_INITIAL_MS", defaults.backoff.initial_ms)?,
                max_ms: parse(&lookup, "RESTART_BACKOFF_MAX_MS", defaults.backoff.max_ms)?,
                default_restart_limit: parse(
                    &lookup,
                    "DEFAULT_RESTART_LIMIT",
                    defaults.backoff.default_restart_limit,
                )?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.controller.workers == 0 {
            return Err(crate::Error::Config(
                "CONTROLLER_WORKERS must be at least 1".to_string(),
            ));
        }
        if self.controller.resync_interval_secs == 0 {
            return Err(crate::Error::Config(
                "RESYNC_INTERVAL_SECS must be at least 1".to_string(),
            ));
        }
        if self.backoff.initial_ms > self.backoff.max_ms {
            return Err(crate::Error::Config(
                "RESTART_BACKOFF_INITIAL_MS must not exceed RESTART_BACKOFF_MAX_MS".to_string(),
            ));
        }
        if self.backoff.default_restart_limit < 0 {
            return Err(crate::Error::Config(
                "DEFAULT_RESTART_LIMIT must not be negative".to_string(),
            ));
        }
        Ok(())
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.controller.resync_interval_secs)
    }

    pub fn backoff_config(&self) -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_millis(self.backoff.initial_ms),
            max_delay: Duration::from_millis(self.backoff.max_ms),
            default_restart_limit: self.backoff.default_restart_limit,
            ..BackoffConfig::default()
        }
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> crate::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| crate::Error::Config(format!("{} has invalid value {:?}: {}", key, raw, e))),
        None => Ok(default),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                addr: "0.0.0.0:8080".to_string(),
            },
            kube: KubeConfig {
                namespace: None,
                backend: ClusterBackend::Kubernetes,
            },
            controller: ControllerConfig {
                workers: 4,
                max_conflict_retries: 5,
                resync_interval_secs: 30,
                event_buffer: 1024,
            },
            backoff: BackoffSettings {
                initial_ms: 1_000,
                max_ms: 60_000,
                default_restart_limit: 3,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> crate::Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = load(&[]).unwrap();
        assert_eq!(config.server.addr, "0.0.0.0:8080");
        assert_eq!(config.kube.namespace, None);
        assert_eq!(config.kube.backend, ClusterBackend::Kubernetes);
        assert_eq!(config.controller.workers, 4);
        assert_eq!(config.resync_interval(), Duration::from_secs(30));
        assert_eq!(config.backoff_config().default_restart_limit, 3);
    }

    #[test]
    fn reads_overrides() {
        let config = load(&[
            ("WATCH_NAMESPACE", "ml"),
            ("CLUSTER_BACKEND", "memory"),
            ("CONTROLLER_WORKERS", "8"),
            ("RESTART_BACKOFF_INITIAL_MS", "250"),
        ])
        .unwrap();
        assert_eq!(config.kube.namespace.as_deref(), Some("ml"));
        assert_eq!(config.kube.backend, ClusterBackend::InMemory);
        assert_eq!(config.controller.workers, 8);
        assert_eq!(
            config.backoff_config().initial_delay,
            Duration::from_millis(250)
        );
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            load(&[("CONTROLLER_WORKERS", "many")]),
            Err(crate::Error::Config(_))
        ));
        assert!(load(&[("CONTROLLER_WORKERS", "0")]).is_err());
        assert!(load(&[("CLUSTER_BACKEND", "etcd")]).is_err());
        assert!(load(&[
            ("RESTART_BACKOFF_INITIAL_MS", "5000"),
            ("RESTART_BACKOFF_MAX_MS", "100")
        ])
        .is_err());
    }
}
