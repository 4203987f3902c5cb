//! HTTP server command with graceful shutdown.

use crate::http::{self, AppState};
use anyhow::{Context, Result};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use texd_core::{CompileService, Config};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Run the server until SIGINT/SIGTERM.
///
/// On the first signal: stop accepting connections, reject queued jobs,
/// give in-flight requests the drain window, wait for work whose client
/// already disconnected, then sweep job directories.
/// A second signal exits immediately.
pub async fn run(config: Config) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .with_context(|| {
            format!(
                "invalid bind address: {}:{}",
                config.server.bind, config.server.port
            )
        })?;
    let drain_timeout = config.timeouts.drain_timeout();

    let service = Arc::new(CompileService::new(config).context("failed to start compile service")?);
    // A previous instance may have crashed mid-job.
    if let Err(e) = service.sweep() {
        warn!(error = %e, "startup sweep failed");
    }

    let cancel = CancellationToken::new();
    let eviction = service.spawn_eviction_task(cancel.clone());

    let state = AppState::new(Arc::clone(&service));
    let app = http::router(state.clone());

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(
        %addr,
        cache_mode = %service.config().cache.mode,
        persist = service.config().persist.enabled,
        auth = service.config().server.api_key.is_some(),
        "texd listening"
    );

    let draining = Arc::new(Notify::new());
    let shutdown = {
        let state = state.clone();
        let draining = Arc::clone(&draining);
        async move {
            shutdown_signal().await;
            info!(in_flight = state.requests.in_flight(), "shutdown signal received, draining");
            state.requests.begin_drain();
            state.service.queue().close();
            draining.notify_one();
            tokio::spawn(async {
                shutdown_signal().await;
                warn!("second shutdown signal, exiting immediately");
                std::process::exit(130);
            });
        }
    };

    let mut server = tokio::spawn(
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .into_future(),
    );

    tokio::select! {
        joined = &mut server => {
            joined.context("server task panicked")?.context("server error")?;
        }
        _ = async {
            draining.notified().await;
            tokio::time::sleep(drain_timeout).await;
        } => {
            warn!(
                in_flight = state.requests.in_flight(),
                "drain window elapsed, abandoning remaining requests"
            );
            server.abort();
        }
    }

    if !state.requests.wait_detached(drain_timeout).await {
        warn!(
            detached = state.requests.detached(),
            "requests still running after their clients left"
        );
    }
    cancel.cancel();
    if let Some(task) = eviction {
        let _ = task.await;
    }
    if !service.queue().wait_idle(std::time::Duration::from_secs(1)).await {
        warn!("compile jobs still running at exit");
    }
    match service.sweep() {
        Ok(report) => info!(job_dirs = report.job_dirs, "shutdown complete"),
        Err(e) => error!(error = %e, "shutdown sweep failed"),
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(?err, "failed to listen for CTRL+C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => warn!(?err, "failed to listen for TERM signal"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
