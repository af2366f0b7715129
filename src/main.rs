// genex-server - HTTP service for environment generation, exploration and mapping
//
// Usage: genex-server   (settings from GENEX_CONFIG / GENEX__* variables)

use genex::config::Settings;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::load()?;
    std::fs::create_dir_all(&settings.storage.environments_dir)?;
    let addr = format!("{}:{}", settings.server.host, settings.server.port);

    tracing::info!(
        %addr,
        environments = %settings.storage.environments_dir.display(),
        ui = %settings.server.ui_dir.display(),
        "starting genex server"
    );

    let app = genex::server::router(settings);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
