use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use lrp_events::DEFAULT_MAX_PENDING_EVENTS;
use lrp_id::CellId;
use lrp_reconcile::BackoffRestartPolicy;

use crate::stream::DEFAULT_STREAM_BUFFER;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    /// Bound on concurrent slot operations per reconciliation.
    pub update_workers: usize,
    /// Per-subscriber queue length before eviction.
    pub hub_capacity: usize,
    pub stream_buffer: usize,
    pub convergence_interval: Duration,
    /// Crash restart backoff used by convergence.
    pub restart_policy: BackoffRestartPolicy,
    pub auctioneer_url: String,
    /// Static cell id to control endpoint map.
    pub cells: HashMap<CellId, String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr = var("LRP_LISTEN_ADDR")
            .unwrap_or_else(|| "127.0.0.1:8080".to_string())
            .parse()
            .context("LRP_LISTEN_ADDR")?;

        let log_level = var("LRP_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let update_workers = parse_or(&var, "LRP_UPDATE_WORKERS", 25)?;
        if update_workers == 0 {
            bail!("LRP_UPDATE_WORKERS must be at least 1");
        }
        let hub_capacity = parse_or(&var, "LRP_HUB_CAPACITY", DEFAULT_MAX_PENDING_EVENTS)?;
        let stream_buffer = parse_or(&var, "LRP_STREAM_BUFFER", DEFAULT_STREAM_BUFFER)?;
        let convergence_interval =
            Duration::from_secs(parse_or(&var, "LRP_CONVERGENCE_INTERVAL_SECS", 30)?);
        if convergence_interval.is_zero() {
            bail!("LRP_CONVERGENCE_INTERVAL_SECS must be at least 1");
        }

        let defaults = BackoffRestartPolicy::default();
        let restart_policy = BackoffRestartPolicy {
            min_backoff: Duration::from_secs(parse_or(
                &var,
                "LRP_RESTART_MIN_BACKOFF_SECS",
                defaults.min_backoff.as_secs(),
            )?),
            max_backoff: Duration::from_secs(parse_or(
                &var,
                "LRP_RESTART_MAX_BACKOFF_SECS",
                defaults.max_backoff.as_secs(),
            )?),
            max_restart_attempts: parse_or(
                &var,
                "LRP_MAX_RESTART_ATTEMPTS",
                defaults.max_restart_attempts,
            )?,
            ..defaults
        };
        restart_policy.validate().context("restart policy")?;

        let auctioneer_url = var("LRP_AUCTIONEER_URL")
            .unwrap_or_else(|| "http://127.0.0.1:9016".to_string());

        let cells = match var("LRP_CELLS") {
            Some(raw) => parse_cells(&raw)?,
            None => HashMap::new(),
        };

        Ok(Self {
            listen_addr,
            log_level,
            update_workers,
            hub_capacity,
            stream_buffer,
            convergence_interval,
            restart_policy,
            auctioneer_url,
            cells,
        })
    }
}

fn parse_or<T>(var: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(name) {
        Some(raw) => raw.trim().parse().with_context(|| format!("{name}={raw}")),
        None => Ok(default),
    }
}

/// Parses `cell-a=http://10.0.0.1:1800,cell-b=http://10.0.0.2:1800`.
fn parse_cells(raw: &str) -> Result<HashMap<CellId, String>> {
    let mut cells = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((id, address)) = entry.split_once('=') else {
            bail!("LRP_CELLS entry {entry:?} is not id=address");
        };
        let id = CellId::parse(id.trim()).with_context(|| format!("LRP_CELLS entry {entry:?}"))?;
        cells.insert(id, address.trim().to_string());
    }
    Ok(cells)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.listen_addr.to_string(), "127.0.0.1:8080");
        assert_eq!(config.log_level, "info");
        assert_eq!(config.update_workers, 25);
        assert_eq!(config.hub_capacity, DEFAULT_MAX_PENDING_EVENTS);
        assert_eq!(config.convergence_interval, Duration::from_secs(30));
        assert_eq!(config.restart_policy, BackoffRestartPolicy::default());
        assert!(config.cells.is_empty());
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("LRP_LISTEN_ADDR", "0.0.0.0:9000"),
            ("LRP_UPDATE_WORKERS", "4"),
            ("LRP_HUB_CAPACITY", "16"),
            ("LRP_RESTART_MIN_BACKOFF_SECS", "10"),
            ("LRP_MAX_RESTART_ATTEMPTS", "5"),
            ("LRP_CELLS", "cell-a=http://10.0.0.1:1800, cell-b = http://10.0.0.2:1800,"),
        ]))
        .unwrap();
        assert_eq!(config.listen_addr.port(), 9000);
        assert_eq!(config.update_workers, 4);
        assert_eq!(config.hub_capacity, 16);
        assert_eq!(config.restart_policy.min_backoff, Duration::from_secs(10));
        assert_eq!(config.restart_policy.max_restart_attempts, 5);
        assert_eq!(config.cells.len(), 2);
        assert_eq!(
            config.cells[&CellId::parse("cell-b").unwrap()],
            "http://10.0.0.2:1800"
        );
    }

    #[rstest]
    #[case("LRP_LISTEN_ADDR", "not-an-addr")]
    #[case("LRP_UPDATE_WORKERS", "0")]
    #[case("LRP_UPDATE_WORKERS", "many")]
    #[case("LRP_CONVERGENCE_INTERVAL_SECS", "0")]
    #[case("LRP_RESTART_MIN_BACKOFF_SECS", "0")]
    #[case("LRP_RESTART_MIN_BACKOFF_SECS", "3600")]
    #[case("LRP_CELLS", "cell-a")]
    #[case("LRP_CELLS", "bad cell=http://x")]
    fn test_invalid_values(#[case] name: &str, #[case] value: &str) {
        assert!(Config::from_lookup(lookup(&[(name, value)])).is_err());
    }
}
