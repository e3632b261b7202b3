// src/lib.rs
// nym-directory - privacy-preserving directory and relay for mixnet chat
// Library entry point

pub mod client_monitor;
pub mod config;
pub mod crypto;
pub mod db;
pub mod notify;
pub mod router;
pub mod session;
pub mod transport;
pub mod wire;

use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use client_monitor::ClientMonitor;
use config::Config;
use crypto::CryptoManager;
use db::Database;
use notify::NotifyBus;
use router::MessageRouter;
use transport::MixnetTransport;

/// Grace period for the transport and the child supervisor at shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

/// Bring the whole service up and run until SIGINT/SIGTERM. Startup
/// failures (missing password, wrong password, unreachable client) come
/// back as errors; the binary turns them into a non-zero exit.
pub async fn run() -> Result<(), String> {
    let config = Config::from_env();
    info!("starting nym-directory (client id '{}')", config.client_id);

    let password = config.read_password()?;
    let crypto = Arc::new(
        CryptoManager::new(&config.keys_dir, password)
            .map_err(|e| format!("crypto init failed: {}", e))?,
    );
    crypto
        .ensure_server_keypair(&config.client_id)
        .map_err(|e| format!("server key unavailable (wrong password?): {}", e))?;

    let db = Arc::new(
        Database::open(&config.database_path, crypto.clone())
            .map_err(|e| format!("directory open failed: {}", e))?,
    );
    info!("directory open with {} users", db.user_count().unwrap_or(0));

    let notify = match &config.redis_url {
        Some(url) => match NotifyBus::connect(url).await {
            Ok(bus) => Some(Arc::new(bus)),
            Err(e) => {
                warn!("redis unavailable, continuing without notifications: {}", e);
                None
            }
        },
        None => None,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let monitor = ClientMonitor::new(&config.client_binary, &config.client_id);
    monitor.init_if_needed().await?;
    let monitor_handle = tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move { monitor.supervise(shutdown).await }
    });

    let (outbound_tx, outbound_rx) = mpsc::channel(64);
    let (inbound_tx, mut inbound_rx) = mpsc::channel::<(String, String)>(64);

    let router = MessageRouter::new(
        db.clone(),
        crypto.clone(),
        outbound_tx,
        notify.clone(),
        config.client_id.clone(),
    );

    if let Some(bus) = notify.clone() {
        tokio::spawn(presence_heartbeat(bus, shutdown_rx.clone()));
    }

    let transport = MixnetTransport::new(config.websocket_url.clone(), config.address_file());
    let transport_handle = tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move { transport.run(inbound_tx, outbound_rx, shutdown).await }
    });

    // Single receive loop: frames are handled strictly in arrival order,
    // which is what keeps per-tag processing sequential.
    let mut shutdown_main = shutdown_rx.clone();
    loop {
        tokio::select! {
            maybe = inbound_rx.recv() => match maybe {
                Some((message, sender_tag)) => {
                    router.handle_received(&message, &sender_tag).await;
                }
                None => break,
            },
            _ = shutdown_main.changed() => break,
        }
    }

    info!("shutting down");
    drop(router);

    let transport_result = tokio::time::timeout(SHUTDOWN_DEADLINE, transport_handle).await;
    match transport_result {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => {
            error!("transport failed: {}", e);
            let _ = tokio::time::timeout(SHUTDOWN_DEADLINE, monitor_handle).await;
            return Err(e);
        }
        Ok(Err(e)) => error!("transport task panicked: {}", e),
        Err(_) => warn!("transport did not stop within {:?}", SHUTDOWN_DEADLINE),
    }
    if tokio::time::timeout(SHUTDOWN_DEADLINE, monitor_handle).await.is_err() {
        warn!("client supervisor did not stop within {:?}", SHUTDOWN_DEADLINE);
    }

    info!("shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                _ = sigterm.recv() => info!("received SIGTERM"),
            }
        }
        Err(e) => {
            error!("cannot install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

async fn presence_heartbeat(bus: Arc<NotifyBus>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let online = bus.online_users().await;
                info!("presence heartbeat: {} users online", online.len());
            }
            _ = shutdown.changed() => return,
        }
    }
}
