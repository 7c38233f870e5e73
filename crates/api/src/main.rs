//! API server entry point.

use std::time::Duration;

use api::config::Config;
use api::telemetry;
use tokio::signal;

/// How long shutdown waits for in-flight deliveries to settle.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration
    let config = Config::from_env()?;

    // 2. Initialize tracing and the Prometheus recorder
    telemetry::init_tracing(&config);
    let metrics_handle = telemetry::init_metrics()?;

    // 3. Storage, breakers and saga participants
    let state = api::bootstrap(&config, metrics_handle).await?;

    // 4. Build the application
    let app = api::create_app(state.clone());

    // 5. Start server
    let addr = config.addr();
    tracing::info!(%addr, "starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 6. Let running sagas reach a resting point
    if tokio::time::timeout(DRAIN_TIMEOUT, state.channel.wait_until_idle())
        .await
        .is_err()
    {
        tracing::warn!(
            in_flight = state.channel.in_flight(),
            "shutdown drain timed out, pending deliveries stay in the event log"
        );
    }

    tracing::info!("server shut down gracefully");
    Ok(())
}
