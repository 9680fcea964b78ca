//! Line-oriented admin console on stdin.
//!
//! Commands: `ShowIdentity`, `BanUser <username> <minutes> <reason>`,
//! `BanIP <ipv4> <minutes>`, `Shutdown`, `help`. A leading `-` or
//! `--` is tolerated and commands are case insensitive.

use std::io::BufRead;
use std::net::Ipv4Addr;
use std::sync::Arc;

use log::{info, warn};
use tokio::sync::{mpsc, watch};

use crate::server::Server;

/// Starts the stdin reader thread and the async command handler.
pub fn spawn(server: Arc<Server>, shutdown: watch::Sender<bool>) {
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();

    // stdin has no async story worth having; a plain thread feeds the
    // channel until EOF
    std::thread::Builder::new()
        .name("console".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                match line {
                    Ok(line) => {
                        if line_tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        })
        .expect("failed to start console thread");

    tokio::spawn(async move {
        while let Some(line) = line_rx.recv().await {
            dispatch(&server, &shutdown, line).await;
        }
    });
}

async fn dispatch(server: &Arc<Server>, shutdown: &watch::Sender<bool>, line: String) {
    let mut parts = line.split_whitespace();
    let Some(raw_command) = parts.next() else {
        return;
    };

    let command = raw_command
        .trim_start_matches("--")
        .trim_start_matches('-')
        .to_ascii_lowercase();

    match command.as_str() {
        "banuser" => {
            let username = parts.next();
            let minutes = parts.next().and_then(|raw| raw.parse::<i64>().ok());
            match (username, minutes) {
                (Some(username), Some(minutes)) if minutes > 0 => {
                    let reason: String = parts.collect::<Vec<&str>>().join(" ");
                    server.ban_user(username.to_string(), minutes, reason).await;
                }
                _ => info!("Usage: BanUser <username> <duration (minutes)> <reason>"),
            }
        }
        "banip" => {
            let addr = parts.next().and_then(|raw| raw.parse::<Ipv4Addr>().ok());
            let minutes = parts.next().and_then(|raw| raw.parse::<i64>().ok());
            match (addr, minutes) {
                (Some(addr), Some(minutes)) if minutes > 0 => {
                    server.ban_ip(addr.into(), minutes).await;
                }
                _ => info!("Usage: BanIP <ipv4_address> <duration (minutes)>"),
            }
        }
        "showidentity" => {
            info!("Certificate SPKI fingerprint: {}", server.identity());
        }
        "shutdown" => {
            info!("Shutting down server, please wait.");
            let _ = shutdown.send(true);
        }
        "help" => {
            info!(
                "Available commands:\n\
                 \tShowIdentity\n\
                 \tBanUser <username> <duration (minutes)> <reason>\n\
                 \tBanIP <ipv4_address> <duration (minutes)>\n\
                 \tShutdown"
            );
        }
        other => {
            warn!(
                "Console command {} is unrecognized, try help, -help, or --help",
                other
            );
        }
    }
}
