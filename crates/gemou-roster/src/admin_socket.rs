//! Unix socket server for admin commands.
//!
//! Local IPC for inspecting and repairing participant counters
//! (roster-admin CLI). One JSON command per line, one JSON response per line.

use crate::auditor::{Inconsistency, ReconcileSummary};
use crate::error::Result;
use crate::ledger::Ledger;
use crate::models::Event;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

/// Admin command sent over the socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum AdminCommand {
    /// Report every inconsistent counter
    Audit,
    /// Repair every inconsistent counter
    Reconcile,
    /// Show one event record
    ShowEvent { event_id: String },
    /// List active user ids of an event
    ListActive { event_id: String },
    /// Join on behalf of a user
    Join { event_id: String, user_id: String },
    /// Leave on behalf of a user
    Leave { event_id: String, user_id: String },
    /// Ping (health check)
    Ping,
}

/// Response from admin command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AdminResponse {
    Ok { message: String },
    Error { error: String },
    List { items: Vec<String> },
    Event { event: Event },
    Report { inconsistencies: Vec<Inconsistency> },
    Reconciled { summary: ReconcileSummary },
    Pong,
}

/// Admin socket server.
pub struct AdminSocket {
    ledger: Ledger,
    socket_path: String,
    shutdown: CancellationToken,
}

impl AdminSocket {
    /// Create a new admin socket server.
    pub fn new(ledger: Ledger, socket_path: &str) -> Self {
        Self {
            ledger,
            socket_path: socket_path.to_string(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop accepting (and cancel in-flight commands) when `token` fires.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Run the admin socket server.
    pub async fn run(&self) -> Result<()> {
        // Remove existing socket file if present
        let _ = std::fs::remove_file(&self.socket_path);

        let listener = UnixListener::bind(&self.socket_path)?;
        tracing::info!("Admin socket listening on {}", self.socket_path);

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, _)) => {
                    let ledger = self.ledger.clone();
                    let cancel = self.shutdown.child_token();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, ledger, cancel).await {
                            tracing::error!("Admin connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to accept admin connection: {}", e);
                }
            }
        }

        let _ = std::fs::remove_file(&self.socket_path);
        Ok(())
    }

    /// Get the socket path.
    pub fn socket_path(&self) -> &str {
        &self.socket_path
    }
}

async fn handle_connection(
    stream: UnixStream,
    ledger: Ledger,
    cancel: CancellationToken,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        let response = match serde_json::from_str::<AdminCommand>(&line) {
            Ok(cmd) => execute_command(cmd, &ledger, &cancel).await,
            Err(e) => AdminResponse::Error {
                error: format!("Invalid command: {}", e),
            },
        };

        let response_json = serde_json::to_string(&response)? + "\n";
        writer.write_all(response_json.as_bytes()).await?;
        line.clear();
    }

    Ok(())
}

fn error(e: impl std::fmt::Display) -> AdminResponse {
    AdminResponse::Error {
        error: e.to_string(),
    }
}

/// Run one admin command against the ledger.
pub async fn execute_command(
    cmd: AdminCommand,
    ledger: &Ledger,
    cancel: &CancellationToken,
) -> AdminResponse {
    match cmd {
        AdminCommand::Audit => {
            let auditor = ledger.auditor();
            let scanned = auditor.check_consistency().collect::<Result<Vec<_>>>();
            match scanned {
                Ok(inconsistencies) => {
                    if !inconsistencies.is_empty() {
                        tracing::warn!(count = inconsistencies.len(), "Audit found drift");
                    }
                    AdminResponse::Report { inconsistencies }
                }
                Err(e) => error(e),
            }
        }

        AdminCommand::Reconcile => {
            let summary = ledger.auditor().reconcile_all(cancel).await;
            AdminResponse::Reconciled { summary }
        }

        AdminCommand::ShowEvent { event_id } => match ledger.event(&event_id) {
            Ok(event) => AdminResponse::Event { event },
            Err(e) => error(e),
        },

        AdminCommand::ListActive { event_id } => match ledger.list_active(&event_id) {
            Ok(users) => AdminResponse::List {
                items: users.into_iter().collect(),
            },
            Err(e) => error(e),
        },

        AdminCommand::Join { event_id, user_id } => {
            match ledger.join(&event_id, &user_id, cancel).await {
                Ok(m) => {
                    tracing::info!("Admin join: {} -> {}", user_id, event_id);
                    AdminResponse::Ok {
                        message: format!(
                            "{} joined {} ({}/{})",
                            user_id, event_id, m.event.participant_count, m.event.capacity
                        ),
                    }
                }
                Err(e) => error(e),
            }
        }

        AdminCommand::Leave { event_id, user_id } => {
            match ledger.leave(&event_id, &user_id, cancel).await {
                Ok(m) => {
                    tracing::info!("Admin leave: {} <- {}", user_id, event_id);
                    AdminResponse::Ok {
                        message: format!(
                            "{} left {} ({}/{})",
                            user_id, event_id, m.event.participant_count, m.event.capacity
                        ),
                    }
                }
                Err(e) => error(e),
            }
        }

        AdminCommand::Ping => AdminResponse::Pong,
    }
}

/// Default socket path.
pub fn default_socket_path() -> String {
    let data_dir = std::env::var("ROSTER_DATA_DIR").unwrap_or_else(|_| "./roster-data".to_string());
    format!("{}/admin.sock", data_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerConfig;
    use crate::storage::Storage;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, Ledger) {
        let dir = tempdir().unwrap();
        let storage = Arc::new(Storage::open(dir.path().join("db")).unwrap());
        let ledger = Ledger::new(storage, LedgerConfig::default());
        ledger.create_event("e", "E", 2).unwrap();
        (dir, ledger)
    }

    #[test]
    fn command_wire_format() {
        let cmd: AdminCommand =
            serde_json::from_str(r#"{"cmd":"list_active","event_id":"e"}"#).unwrap();
        assert_eq!(
            cmd,
            AdminCommand::ListActive {
                event_id: "e".into()
            }
        );
        let json = serde_json::to_string(&AdminResponse::Pong).unwrap();
        assert_eq!(json, r#"{"status":"pong"}"#);
    }

    #[tokio::test]
    async fn join_then_audit_clean() {
        let (_dir, ledger) = setup();
        let cancel = CancellationToken::new();

        let joined = execute_command(
            AdminCommand::Join {
                event_id: "e".into(),
                user_id: "alice".into(),
            },
            &ledger,
            &cancel,
        )
        .await;
        assert!(matches!(joined, AdminResponse::Ok { .. }));

        let audit = execute_command(AdminCommand::Audit, &ledger, &cancel).await;
        assert_eq!(
            audit,
            AdminResponse::Report {
                inconsistencies: vec![]
            }
        );

        let listed = execute_command(
            AdminCommand::ListActive {
                event_id: "e".into(),
            },
            &ledger,
            &cancel,
        )
        .await;
        assert_eq!(
            listed,
            AdminResponse::List {
                items: vec!["alice".into()]
            }
        );
    }

    #[tokio::test]
    async fn errors_are_reported_not_raised() {
        let (_dir, ledger) = setup();
        let cancel = CancellationToken::new();

        let response = execute_command(
            AdminCommand::Leave {
                event_id: "e".into(),
                user_id: "nobody".into(),
            },
            &ledger,
            &cancel,
        )
        .await;
        assert!(matches!(response, AdminResponse::Error { .. }));
    }

    #[tokio::test]
    async fn socket_roundtrip() {
        let (dir, ledger) = setup();
        let path = dir.path().join("admin.sock");
        let path = path.to_str().unwrap().to_string();
        let shutdown = CancellationToken::new();

        let server = AdminSocket::new(ledger, &path).with_shutdown(shutdown.clone());
        let handle = tokio::spawn(async move { server.run().await });

        let stream = loop {
            match UnixStream::connect(&path).await {
                Ok(stream) => break stream,
                Err(_) => tokio::time::sleep(std::time::Duration::from_millis(10)).await,
            }
        };
        let (reader, mut writer) = stream.into_split();
        writer.write_all(b"{\"cmd\":\"ping\"}\n").await.unwrap();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let response: AdminResponse = serde_json::from_str(&line).unwrap();
        assert_eq!(response, AdminResponse::Pong);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }
}
