//! roster-admin CLI tool
//!
//! Inspects and repairs participant counters on a running roster node.
//!
//! Usage:
//!   roster-admin audit
//!   roster-admin reconcile
//!   roster-admin show-event <event_id>
//!   roster-admin list-active <event_id>
//!   roster-admin join <event_id> <user_id>
//!   roster-admin leave <event_id> <user_id>
//!   roster-admin ping

use gemou_roster::admin_socket::{default_socket_path, AdminCommand, AdminResponse};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

fn print_usage() {
    eprintln!("roster-admin - Inspect and repair event participant counters");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  roster-admin audit                        Report counters that drifted");
    eprintln!("  roster-admin reconcile                    Repair every drifted counter");
    eprintln!("  roster-admin show-event <event_id>        Show an event record");
    eprintln!("  roster-admin list-active <event_id>       List active participants");
    eprintln!("  roster-admin join <event_id> <user_id>    Join on behalf of a user");
    eprintln!("  roster-admin leave <event_id> <user_id>   Leave on behalf of a user");
    eprintln!("  roster-admin ping                         Check if daemon is running");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  ROSTER_SOCKET  Path to admin socket (default: $ROSTER_DATA_DIR/admin.sock)");
}

fn get_socket_path() -> PathBuf {
    std::env::var("ROSTER_SOCKET")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default_socket_path()))
}

fn send_command(cmd: AdminCommand) -> Result<AdminResponse, String> {
    let socket_path = get_socket_path();

    let mut stream = UnixStream::connect(&socket_path).map_err(|e| {
        format!(
            "Failed to connect to roster-node at {:?}: {}\n\
             Is the roster-node running?",
            socket_path, e
        )
    })?;

    // Send command
    let cmd_json = serde_json::to_string(&cmd).map_err(|e| e.to_string())?;
    writeln!(stream, "{}", cmd_json).map_err(|e| e.to_string())?;

    // Read response
    let mut reader = BufReader::new(&stream);
    let mut response_line = String::new();
    reader
        .read_line(&mut response_line)
        .map_err(|e| e.to_string())?;

    serde_json::from_str(&response_line).map_err(|e| format!("Invalid response: {}", e))
}

fn require(args: &[String], count: usize, usage: &str) -> Vec<String> {
    if args.len() < count + 2 {
        eprintln!("Error: {} requires {}", args[1], usage);
        std::process::exit(1);
    }
    args[2..2 + count].to_vec()
}

fn parse_command(args: &[String]) -> AdminCommand {
    match args[1].as_str() {
        "audit" => AdminCommand::Audit,
        "reconcile" => AdminCommand::Reconcile,
        "show-event" => {
            let a = require(args, 1, "an event_id argument");
            AdminCommand::ShowEvent {
                event_id: a[0].clone(),
            }
        }
        "list-active" => {
            let a = require(args, 1, "an event_id argument");
            AdminCommand::ListActive {
                event_id: a[0].clone(),
            }
        }
        "join" => {
            let a = require(args, 2, "event_id and user_id arguments");
            AdminCommand::Join {
                event_id: a[0].clone(),
                user_id: a[1].clone(),
            }
        }
        "leave" => {
            let a = require(args, 2, "event_id and user_id arguments");
            AdminCommand::Leave {
                event_id: a[0].clone(),
                user_id: a[1].clone(),
            }
        }
        "ping" => AdminCommand::Ping,
        "-h" | "--help" | "help" => {
            print_usage();
            std::process::exit(0);
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            std::process::exit(1);
        }
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    let cmd = parse_command(&args);

    match send_command(cmd) {
        Ok(response) => match response {
            AdminResponse::Ok { message } => {
                println!("{}", message);
            }
            AdminResponse::Error { error } => {
                eprintln!("Error: {}", error);
                std::process::exit(1);
            }
            AdminResponse::List { items } => {
                if items.is_empty() {
                    println!("(none)");
                } else {
                    for item in items {
                        println!("{}", item);
                    }
                }
            }
            AdminResponse::Event { event } => {
                println!("id:           {}", event.id);
                println!("title:        {}", event.title);
                println!("participants: {}/{}", event.participant_count, event.capacity);
                println!("revision:     {}", event.revision);
            }
            AdminResponse::Report { inconsistencies } => {
                if inconsistencies.is_empty() {
                    println!("All counters consistent");
                    return;
                }
                for report in &inconsistencies {
                    println!(
                        "{}: stored={} actual={} capacity={} {:?}",
                        report.event_id,
                        report.stored_count,
                        report.actual_count,
                        report.capacity,
                        report.violations
                    );
                }
                std::process::exit(2);
            }
            AdminResponse::Reconciled { summary } => {
                println!(
                    "scanned={} inconsistent={} repaired={} failed={}{}",
                    summary.scanned,
                    summary.inconsistent,
                    summary.repaired,
                    summary.failed(),
                    if summary.cancelled { " (cancelled)" } else { "" }
                );
                for failure in &summary.failures {
                    eprintln!("  {}: {}", failure.event_id, failure.reason);
                }
                if summary.failed() > 0 {
                    std::process::exit(1);
                }
            }
            AdminResponse::Pong => {
                println!("pong - roster-node is running");
            }
        },
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    }
}
