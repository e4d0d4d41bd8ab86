//! Configuration for the deployment agent.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use fleetd_id::SystemId;
use fleetd_workflow::{DEFAULT_MAIN_QUEUE_SUFFIX, DEFAULT_MAX_CONCURRENT_EXECUTIONS};

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identity of this agent, as known to the controller.
    pub system_id: SystemId,

    /// Controller API URL.
    pub controller_url: String,

    /// Address of the local control surface.
    pub listen_addr: SocketAddr,

    /// Data directory for the journal database.
    pub data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Default timeout of a remote operation.
    pub operation_timeout: Duration,

    /// Concurrent deployments per deploy worker.
    pub max_concurrent_deploys: usize,

    /// Write `failed-deployment` back to the controller when an attempt
    /// fails after its parameters were resolved.
    pub report_failure_status: bool,

    /// Suffix of the main task queue, `{system_id}@{suffix}`.
    pub main_queue_suffix: String,

    /// Address scanner answering `check-ip`. The controller handles it
    /// when unset.
    pub scanner_url: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let system_id = lookup("FLEETD_SYSTEM_ID").context("FLEETD_SYSTEM_ID must be set")?;
        let system_id = SystemId::parse(&system_id).context("invalid FLEETD_SYSTEM_ID")?;

        let controller_url = lookup("FLEETD_CONTROLLER_URL")
            .unwrap_or_else(|| "http://127.0.0.1:5240".to_string())
            .trim_end_matches('/')
            .to_string();

        let listen_addr = lookup("FLEETD_LISTEN_ADDR")
            .unwrap_or_else(|| "127.0.0.1:5250".to_string())
            .parse()
            .context("invalid FLEETD_LISTEN_ADDR")?;

        let data_dir = lookup("FLEETD_DATA_DIR")
            .unwrap_or_else(|| "/var/lib/fleetd".to_string())
            .into();

        let log_level = lookup("FLEETD_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let operation_timeout_secs = match lookup("FLEETD_OPERATION_TIMEOUT_SECS") {
            Some(s) => s.parse().context("invalid FLEETD_OPERATION_TIMEOUT_SECS")?,
            None => 60,
        };

        let max_concurrent_deploys = match lookup("FLEETD_MAX_CONCURRENT_DEPLOYS") {
            Some(s) => s.parse().context("invalid FLEETD_MAX_CONCURRENT_DEPLOYS")?,
            None => DEFAULT_MAX_CONCURRENT_EXECUTIONS,
        };

        let report_failure_status = lookup("FLEETD_REPORT_FAILURE_STATUS")
            .map(|s| matches!(s.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let main_queue_suffix = lookup("FLEETD_MAIN_QUEUE_SUFFIX")
            .unwrap_or_else(|| DEFAULT_MAIN_QUEUE_SUFFIX.to_string());

        let scanner_url = lookup("FLEETD_SCANNER_URL")
            .filter(|s| !s.is_empty())
            .map(|s| s.trim_end_matches('/').to_string());

        Ok(Self {
            system_id,
            controller_url,
            listen_addr,
            data_dir,
            log_level,
            operation_timeout: Duration::from_secs(operation_timeout_secs),
            max_concurrent_deploys,
            report_failure_status,
            main_queue_suffix,
            scanner_url,
        })
    }

    /// Path of the journal database.
    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join("journal.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("FLEETD_SYSTEM_ID", "agent1")]).unwrap();

        assert_eq!(config.system_id.as_str(), "agent1");
        assert_eq!(config.controller_url, "http://127.0.0.1:5240");
        assert_eq!(config.listen_addr, "127.0.0.1:5250".parse().unwrap());
        assert_eq!(config.journal_path(), PathBuf::from("/var/lib/fleetd/journal.db"));
        assert_eq!(config.operation_timeout, Duration::from_secs(60));
        assert_eq!(config.max_concurrent_deploys, 64);
        assert!(!config.report_failure_status);
        assert_eq!(config.main_queue_suffix, "main");
        assert_eq!(config.scanner_url, None);
    }

    #[test]
    fn test_scanner_url() {
        let config = load(&[
            ("FLEETD_SYSTEM_ID", "agent1"),
            ("FLEETD_SCANNER_URL", "http://127.0.0.1:5251/"),
        ])
        .unwrap();
        assert_eq!(config.scanner_url.as_deref(), Some("http://127.0.0.1:5251"));

        let config = load(&[("FLEETD_SYSTEM_ID", "agent1"), ("FLEETD_SCANNER_URL", "")]).unwrap();
        assert_eq!(config.scanner_url, None);
    }

    #[test]
    fn test_system_id_required() {
        let err = load(&[]).unwrap_err();
        assert!(err.to_string().contains("FLEETD_SYSTEM_ID"));

        assert!(load(&[("FLEETD_SYSTEM_ID", "bad id")]).is_err());
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("FLEETD_SYSTEM_ID", "agent1"),
            ("FLEETD_CONTROLLER_URL", "http://controller:5240/"),
            ("FLEETD_OPERATION_TIMEOUT_SECS", "15"),
            ("FLEETD_REPORT_FAILURE_STATUS", "true"),
            ("FLEETD_MAIN_QUEUE_SUFFIX", "agent:main"),
        ])
        .unwrap();

        assert_eq!(config.controller_url, "http://controller:5240");
        assert_eq!(config.operation_timeout, Duration::from_secs(15));
        assert!(config.report_failure_status);
        assert_eq!(config.main_queue_suffix, "agent:main");
    }

    #[test]
    fn test_invalid_number() {
        let err = load(&[
            ("FLEETD_SYSTEM_ID", "agent1"),
            ("FLEETD_MAX_CONCURRENT_DEPLOYS", "many"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("FLEETD_MAX_CONCURRENT_DEPLOYS"));
    }
}
