//! Roster Node - the main application entry point.
//!
//! Architecture:
//! - Single daemon process with shared RocksDB storage
//! - HTTP API for clients (events, membership, audit)
//! - Unix admin socket for local diagnostics (roster-admin CLI)
//! - Periodic auditor repairing counter drift

use crate::admin_socket::AdminSocket;
use crate::api;
use crate::error::{Error, Result};
use crate::ledger::{Ledger, LedgerConfig};
use crate::retry::RetryPolicy;
use crate::storage::Storage;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Configuration for a roster node.
#[derive(Debug, Clone)]
pub struct RosterConfig {
    /// Data directory for storage
    pub data_dir: PathBuf,

    /// HTTP API listen address
    pub api_addr: SocketAddr,

    /// Admin socket path (for roster-admin CLI)
    pub admin_socket: PathBuf,

    /// Interval between reconcile passes; `None` disables the periodic auditor
    pub audit_interval: Option<Duration>,

    /// Max wait to enter an event's critical section
    pub lock_timeout: Duration,

    /// Attempts per operation on concurrency conflicts
    pub retry_attempts: u32,
}

impl Default for RosterConfig {
    fn default() -> Self {
        let data_dir = PathBuf::from("./roster-data");
        Self {
            admin_socket: data_dir.join("admin.sock"),
            data_dir,
            api_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            audit_interval: Some(Duration::from_secs(300)),
            lock_timeout: Duration::from_secs(5),
            retry_attempts: RetryPolicy::default().attempts,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::InvalidInput(format!("Invalid {}: {}", name, raw))),
        Err(_) => Ok(None),
    }
}

impl RosterConfig {
    /// Create config from environment variables with sensible defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let data_dir = std::env::var("ROSTER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let api_addr = env_parse("ROSTER_API_ADDR")?.unwrap_or(defaults.api_addr);

        let admin_socket = std::env::var("ROSTER_ADMIN_SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("admin.sock"));

        let audit_interval = match env_parse::<u64>("ROSTER_AUDIT_INTERVAL_SECS")? {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.audit_interval,
        };

        let lock_timeout = env_parse::<u64>("ROSTER_LOCK_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.lock_timeout);

        let retry_attempts = env_parse::<u32>("ROSTER_RETRY_ATTEMPTS")?
            .unwrap_or(defaults.retry_attempts);
        if retry_attempts == 0 {
            return Err(Error::InvalidInput(
                "ROSTER_RETRY_ATTEMPTS must be at least 1".into(),
            ));
        }

        Ok(Self {
            data_dir,
            api_addr,
            admin_socket,
            audit_interval,
            lock_timeout,
            retry_attempts,
        })
    }

    /// Ledger settings derived from this config.
    pub fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            lock_timeout: self.lock_timeout,
            retry: RetryPolicy {
                attempts: self.retry_attempts,
                ..RetryPolicy::default()
            },
        }
    }
}

/// Shared state for the node - single ledger instance shared by all components.
pub struct RosterState {
    pub ledger: Ledger,
    pub config: RosterConfig,
    /// Parent token for every request-scoped cancellation
    pub shutdown: CancellationToken,
}

/// A roster node instance.
pub struct RosterNode {
    state: Arc<RosterState>,
}

impl RosterNode {
    /// Create a new roster node.
    pub fn new(config: RosterConfig) -> Result<Self> {
        // Ensure data directory exists
        std::fs::create_dir_all(&config.data_dir)?;

        // Open single shared storage instance
        let storage = Arc::new(Storage::open(config.data_dir.join("db"))?);
        let ledger = Ledger::new(storage, config.ledger_config());

        let state = Arc::new(RosterState {
            ledger,
            config,
            shutdown: CancellationToken::new(),
        });

        Ok(Self { state })
    }

    /// Get the shared state (for API handlers).
    pub fn state(&self) -> Arc<RosterState> {
        Arc::clone(&self.state)
    }

    /// Token that stops the node when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    /// Run the node (starts HTTP server, admin socket, and periodic auditor).
    pub async fn run(self) -> Result<()> {
        let config = &self.state.config;
        let shutdown = self.shutdown_token();
        tracing::info!("Roster node starting");
        tracing::info!("  API: http://{}", config.api_addr);
        tracing::info!("  Admin: {:?}", config.admin_socket);
        tracing::info!("  Data: {:?}", config.data_dir);

        // Start admin socket server in background
        let admin_path = config.admin_socket.to_string_lossy().into_owned();
        let admin_socket = AdminSocket::new(self.state.ledger.clone(), &admin_path)
            .with_shutdown(shutdown.clone());
        tokio::spawn(async move {
            if let Err(e) = admin_socket.run().await {
                tracing::error!("Admin socket error: {}", e);
            }
        });

        if let Some(interval) = config.audit_interval {
            tokio::spawn(run_periodic_audit(
                self.state.ledger.clone(),
                interval,
                shutdown.clone(),
            ));
        }

        // Build HTTP API
        let app = api::build_router(self.state());

        // Start HTTP server
        let listener = tokio::net::TcpListener::bind(config.api_addr).await?;
        tracing::info!("HTTP server listening on {}", config.api_addr);

        let stop = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown requested");
                stop.cancel();
            }
        });

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        Ok(())
    }
}

/// Ticker for reconcile passes. A pass that overruns pushes the next one
/// back instead of firing catch-up passes.
fn audit_ticker(interval: Duration) -> Interval {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Reconcile every `interval` until shutdown.
async fn run_periodic_audit(ledger: Ledger, interval: Duration, shutdown: CancellationToken) {
    let auditor = ledger.auditor();
    let mut ticker = audit_ticker(interval);
    // The first tick completes immediately; skip it so startup is not a repair pass.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let summary = auditor.reconcile_all(&shutdown).await;
        if summary.inconsistent > 0 {
            tracing::warn!(
                inconsistent = summary.inconsistent,
                repaired = summary.repaired,
                failed = summary.failed(),
                "Periodic audit found drift"
            );
        }
    }
    tracing::debug!("Periodic auditor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn ledger_config_follows_node_config() {
        let config = RosterConfig {
            lock_timeout: Duration::from_millis(250),
            retry_attempts: 5,
            ..RosterConfig::default()
        };
        let ledger = config.ledger_config();
        assert_eq!(ledger.lock_timeout, Duration::from_millis(250));
        assert_eq!(ledger.retry.attempts, 5);
    }

    #[test]
    fn new_node_creates_data_dir() {
        let dir = tempdir().unwrap();
        let config = RosterConfig {
            data_dir: dir.path().join("nested"),
            ..RosterConfig::default()
        };
        let node = RosterNode::new(config).unwrap();
        assert!(dir.path().join("nested").join("db").exists());
        assert!(node.state().ledger.storage().list_events().unwrap().is_empty());
    }

    #[tokio::test]
    async fn overrunning_pass_delays_next_tick() {
        let ticker = audit_ticker(Duration::from_millis(50));
        assert_eq!(ticker.missed_tick_behavior(), MissedTickBehavior::Delay);
    }

    #[tokio::test]
    async fn periodic_audit_repairs_and_stops() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(Storage::open(dir.path()).unwrap());
        let ledger = Ledger::new(storage, LedgerConfig::default());
        ledger.create_event("e", "E", 3).unwrap();
        let mut drifted = ledger.event("e").unwrap();
        drifted.participant_count = 2;
        ledger.storage().put_event_unsynced(&drifted).unwrap();

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_periodic_audit(
            ledger.clone(),
            Duration::from_millis(20),
            shutdown.clone(),
        ));

        let mut repaired = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if ledger.event("e").unwrap().participant_count == 0 {
                repaired = true;
                break;
            }
        }
        assert!(repaired);

        shutdown.cancel();
        task.await.unwrap();
    }
}
