//! Command line configuration.
//!
//! Every flag can also be set through an environment variable, which is how
//! the controller Deployment configures it.

use crate::error::ControllerError;
use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

/// Static IP controller for Cluster API vSphere machines and clusters.
#[derive(Debug, Clone, Parser)]
#[command(name = "static-ip-controller", version)]
pub struct Config {
    /// Namespace to watch (empty watches all namespaces)
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    pub namespace: String,

    /// Interval after which a converged owner is reconciled again
    #[arg(long, env = "SYNC_PERIOD", default_value = "10m", value_parser = humantime::parse_duration)]
    pub sync_period: Duration,

    /// Address the metrics and health endpoint binds to (":8080" binds all interfaces)
    #[arg(long, env = "METRICS_ADDR", default_value = ":8080", value_parser = parse_listen_addr)]
    pub metrics_addr: SocketAddr,

    /// Accepted for compatibility; run a single replica instead
    #[arg(long, env = "ENABLE_LEADER_ELECTION")]
    pub enable_leader_election: bool,

    /// Maximum concurrent reconciliations per resource kind
    #[arg(long, env = "MAX_CONCURRENCY", default_value_t = 2)]
    pub max_concurrency: usize,

    /// Deadline for a single store call
    #[arg(long, env = "STORE_TIMEOUT", default_value = "10s", value_parser = humantime::parse_duration)]
    pub store_timeout: Duration,

    /// First requeue delay while waiting or retrying
    #[arg(long, env = "BACKOFF_MIN", default_value = "5s", value_parser = humantime::parse_duration)]
    pub backoff_min: Duration,

    /// Requeue delay ceiling
    #[arg(long, env = "BACKOFF_MAX", default_value = "5m", value_parser = humantime::parse_duration)]
    pub backoff_max: Duration,
}

impl Config {
    /// Namespace scope for watches; `None` means all namespaces
    pub fn watch_namespace(&self) -> Option<&str> {
        let ns = self.namespace.trim();
        (!ns.is_empty()).then_some(ns)
    }

    /// Rejects combinations clap cannot express
    pub fn validate(&self) -> Result<(), ControllerError> {
        if self.max_concurrency == 0 {
            return Err(ControllerError::InvalidConfig(
                "--max-concurrency must be at least 1".to_string(),
            ));
        }
        if self.backoff_min.is_zero() || self.backoff_min > self.backoff_max {
            return Err(ControllerError::InvalidConfig(format!(
                "backoff range {:?}..{:?} is empty",
                self.backoff_min, self.backoff_max
            )));
        }
        if self.store_timeout.is_zero() || self.sync_period.is_zero() {
            return Err(ControllerError::InvalidConfig(
                "--store-timeout and --sync-period must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parses a socket address, accepting the `:port` shorthand for all interfaces.
pub fn parse_listen_addr(input: &str) -> Result<SocketAddr, String> {
    let input = input.trim();
    let full = match input.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{}", port),
        None => input.to_string(),
    };
    full.parse()
        .map_err(|e| format!("invalid listen address '{}': {}", input, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_flags_take_humantime_units() {
        let config = Config::try_parse_from([
            "static-ip-controller",
            "--sync-period",
            "1h 30m",
            "--store-timeout",
            "500ms",
            "--backoff-min",
            "2s",
        ])
        .unwrap();
        assert_eq!(config.sync_period, Duration::from_secs(5400));
        assert_eq!(config.store_timeout, Duration::from_millis(500));
        assert_eq!(config.backoff_min, Duration::from_secs(2));
        assert_eq!(config.backoff_max, Duration::from_secs(300));

        assert!(Config::try_parse_from(["static-ip-controller", "--sync-period", "10 fortnights"]).is_err());
        assert!(Config::try_parse_from(["static-ip-controller", "--store-timeout", "m10"]).is_err());
    }

    #[test]
    fn test_parse_listen_addr_shorthand() {
        assert_eq!(parse_listen_addr(":8080"), Ok("0.0.0.0:8080".parse().unwrap()));
        assert_eq!(parse_listen_addr("127.0.0.1:9090"), Ok("127.0.0.1:9090".parse().unwrap()));
        assert!(parse_listen_addr("8080").is_err());
    }

    #[test]
    fn test_defaults() {
        let config = Config::try_parse_from(["static-ip-controller"]).unwrap();
        assert_eq!(config.watch_namespace(), None);
        assert_eq!(config.sync_period, Duration::from_secs(600));
        assert_eq!(config.metrics_addr.port(), 8080);
        assert_eq!(config.max_concurrency, 2);
        assert!(!config.enable_leader_election);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let config = Config::try_parse_from([
            "static-ip-controller",
            "--namespace",
            "capv-system",
            "--backoff-min",
            "10m",
            "--backoff-max",
            "1m",
        ])
        .unwrap();
        assert_eq!(config.watch_namespace(), Some("capv-system"));
        assert!(config.validate().is_err());
    }
}
