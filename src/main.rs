use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;

use sharebox::authsrv::AuthSrv;
use sharebox::broker::{self, Arg, Controller, Registry};
use sharebox::config::Config;
use sharebox::httpcli;

const CONN_QUEUE_DEPTH: usize = 256;

#[tokio::main]
async fn main() {
    let cfg = match Config::from_args(std::env::args()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(2);
        }
    };

    init_logging(cfg.quiet);

    let cfg = Arc::new(cfg);
    let asrv = Arc::new(AuthSrv::new((*cfg).clone()));
    let draining = Arc::new(AtomicBool::new(false));

    let mut registry = Registry::new();
    registry.register("ping", Arc::new(|_args: Vec<Arg>| vec![Arg::Bool(true)]));

    let mut controller_links = Vec::with_capacity(cfg.workers);
    let mut conn_senders = Vec::with_capacity(cfg.workers);

    for id in 0..cfg.workers {
        let (worker, link) = broker::spawn_worker_channels(id);
        controller_links.push(link);

        let worker_asrv = asrv.clone();
        let worker_registry = registry.clone();
        let worker_draining = draining.clone();
        tokio::spawn(async move {
            if let Err(e) = worker.run_control_loop(worker_asrv, worker_registry, worker_draining).await {
                tracing::error!(worker = id, error = %e, "worker control loop exited abnormally");
            }
        });

        let (conn_tx, mut conn_rx) = mpsc::channel::<(tokio::net::TcpStream, std::net::SocketAddr)>(CONN_QUEUE_DEPTH);
        conn_senders.push(conn_tx);

        let conn_cfg = cfg.clone();
        let conn_asrv = asrv.clone();
        tokio::spawn(async move {
            while let Some((stream, peer)) = conn_rx.recv().await {
                let task_cfg = conn_cfg.clone();
                let task_asrv = conn_asrv.clone();
                tokio::spawn(async move {
                    httpcli::serve_connection(stream, peer, task_cfg, task_asrv).await;
                });
            }
        });
    }

    let controller = Controller::new(controller_links);

    let listener = match TcpListener::bind(("0.0.0.0", cfg.port)).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("failed to bind 0.0.0.0:{}: {}", cfg.port, e);
            std::process::exit(1);
        }
    };

    tracing::info!(port = cfg.port, workers = cfg.workers, "sharebox listening");

    let next_worker = AtomicUsize::new(0);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let idx = next_worker.fetch_add(1, Ordering::Relaxed) % conn_senders.len();
                        if conn_senders[idx].send((stream, peer)).await.is_err() {
                            tracing::warn!(worker = idx, "connection queue closed, dropping accepted socket");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                }
            }
            _ = shutdown_signal() => {
                tracing::info!("shutdown signal received, stopping server");
                draining.store(true, Ordering::Relaxed);
                controller.broadcast("shutdown").await;
                break;
            }
        }
    }

    tracing::info!("server shutdown complete");
}

fn init_logging(quiet: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_level = if quiet { "warn" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = fmt().with_env_filter(filter).try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
