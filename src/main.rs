use std::env;
use std::net::SocketAddr;

use chatrelay::audit::init_operational_logging;
use chatrelay::{app, build_state_from_config, AppConfig};
use tokio::net::TcpListener;
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    // Console honours RUST_LOG; WARN and above also land in LOG_DIR.
    init_operational_logging(&config.logging)?;

    let state = build_state_from_config(&config)?;
    let app = app(state);

    let port: u16 = env::var("PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(
        %addr,
        log_dir = %config.logging.dir.display(),
        model_configured = config.model.is_configured(),
        "listening"
    );
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
