#![warn(unused_crate_dependencies)]

use std::net::SocketAddr;
use std::sync::Arc;

use log::{error, info};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::{select, signal};

use crate::config::VERSION;
use crate::game::maps::MapRepository;
use crate::server::{Server, SessionMap};
use crate::services::bans::BanTable;
use crate::services::matchmaking::{Matchmaker, TICK_INTERVAL};
use crate::services::store::{MemoryStore, Store};
use crate::services::users::UserRegistry;
use crate::utils::assets;

mod config;
mod console;
mod game;
mod logging;
mod server;
mod services;
mod session;
mod utils;

#[tokio::main]
async fn main() {
    // Load configuration
    let config = config::load_config().unwrap_or_default();

    // Initialize logging
    logging::setup(config.logging);

    // Every required asset must resolve before anything binds
    if let Err(err) = assets::ensure_present(&[
        config.map_index.as_str(),
        config.certificate.as_str(),
        config.private_key.as_str(),
    ]) {
        error!("Startup asset check failed: {}", err);
        std::process::exit(1);
    }

    let identity = match utils::tls::load_identity(&config.certificate, &config.private_key) {
        Ok(identity) => identity,
        Err(err) => {
            error!("TLS setup failed: {}", err);
            std::process::exit(1);
        }
    };

    let maps = match MapRepository::load(&config.map_index) {
        Ok(maps) => Arc::new(maps),
        Err(err) => {
            error!("Failed to load maps: {}", err);
            std::process::exit(1);
        }
    };

    // The reference in-memory store; a deployment wires its own
    // `Store` implementation here
    let memory_store = Arc::new(MemoryStore::new());
    for seed in &config.seed_users {
        if memory_store
            .seed_account(&seed.username, &seed.password)
            .is_none()
        {
            error!("Failed to seed account {}", seed.username);
        }
    }
    let store: Arc<dyn Store> = memory_store;

    let bans = Arc::new(BanTable::new());
    bans.load(store.load_bans().await);

    let sessions = Arc::new(SessionMap::new());
    let registry = Arc::new(UserRegistry::new());
    let matchmaker = Matchmaker::new(
        maps.clone(),
        sessions.clone(),
        registry.clone(),
        store.clone(),
    );

    let server = Server::new(
        sessions,
        registry,
        matchmaker.clone(),
        store,
        bans,
        config.max_sessions,
        identity.spki_fingerprint.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Admin console on stdin
    console::spawn(server.clone(), shutdown_tx.clone());

    // Matchmaking tick loop
    {
        let matchmaker = matchmaker.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            loop {
                select! {
                    _ = shutdown.changed() => break,
                    _ = interval.tick() => matchmaker.tick_all().await,
                }
            }
        });
    }

    let addr = SocketAddr::new(config.host, config.port);
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("Failed to bind server on {}: {:?}", addr, err);
            std::process::exit(1);
        }
    };

    info!("Starting server on {} (v{})", addr, VERSION);

    let accept_task = tokio::spawn(server.clone().listen(
        listener,
        identity.acceptor,
        shutdown_rx.clone(),
    ));

    // Run until ctrl-c or a console shutdown
    let mut shutdown = shutdown_rx;
    select! {
        _ = signal::ctrl_c() => {
            let _ = shutdown_tx.send(true);
        }
        _ = shutdown.changed() => {}
    }

    matchmaker.shutdown().await;
    let _ = accept_task.await;

    info!("Server stopped");
}
