use anyhow::Context;
use tokio_util::sync::CancellationToken;

use orderflow_infra::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    orderflow_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;

    let runtime = orderflow_api::app::services::build_services(&config)
        .await
        .context("failed to start services")?;
    let app = orderflow_api::build_app(runtime.services.clone());

    let listener = tokio::net::TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.http_addr))?;

    tracing::info!(addr = %listener.local_addr()?, "listening");

    let stop_accepting = CancellationToken::new();
    let mut server = tokio::spawn({
        let stop_accepting = stop_accepting.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop_accepting.cancelled().await })
                .await
        }
    });

    let mut consumer_failed = false;
    tokio::select! {
        _ = shutdown_signal() => tracing::info!("shutdown signal received"),
        _ = runtime.consumer_exited() => {
            tracing::error!("order event consumer stopped unexpectedly, shutting down");
            consumer_failed = true;
        }
        result = &mut server => {
            // The server only returns on its own when something went wrong.
            runtime.shutdown().await;
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(err).context("http server failed"),
                Err(err) => Err(err).context("http server task failed"),
            };
        }
    }

    // 1) stop accepting, let in-flight requests finish (bounded)
    stop_accepting.cancel();
    match tokio::time::timeout(config.shutdown_timeout, &mut server).await {
        Ok(Ok(Ok(()))) => tracing::info!("http server drained"),
        Ok(Ok(Err(err))) => tracing::error!(error = %err, "http server failed during shutdown"),
        Ok(Err(err)) => tracing::error!(error = %err, "http server task failed during shutdown"),
        Err(_) => {
            tracing::warn!(
                timeout_secs = config.shutdown_timeout.as_secs(),
                "in-flight requests did not finish in time, aborting"
            );
            server.abort();
        }
    }

    // 2) consumer, publisher, store
    runtime.shutdown().await;

    if consumer_failed {
        anyhow::bail!("order event consumer stopped");
    }

    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
