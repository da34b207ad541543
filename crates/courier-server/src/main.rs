use tracing::info;

use courier_server::config::ServerConfig;
use courier_server::{app_state, build_router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=debug,tower_http=debug".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;
    let db = courier_db::Database::open(&config.db_path)?;
    let app = build_router(app_state(db, config.jwt_secret.clone()));

    let addr = config.addr()?;
    info!("Courier server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
