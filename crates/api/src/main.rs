use std::sync::Arc;

use anyhow::Context;

use conveyor_api::app::{self, AppServices};
use conveyor_infra::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::from_env().context("invalid configuration")?;
    conveyor_observability::init(&settings.log_config());
    tracing::info!(environment = %settings.environment, "application.startup");

    let bind_addr = settings.bind_addr;
    let services = Arc::new(AppServices::build(settings).context("failed to initialize task runtime")?);
    let app = app::build_app(services.clone());

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(conveyor_api::shutdown::signal())
        .await
        .context("server error")?;

    services.close().await;
    tracing::info!("application.shutdown");
    Ok(())
}
