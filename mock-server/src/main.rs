use std::sync::Arc;

use mock_server::{Backend, Generation};
use tokio::{net::TcpListener, sync::RwLock};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let port = std::env::var("PORT").unwrap_or_else(|_| "3000".to_string());
    let generation = match std::env::var("API_GENERATION").as_deref() {
        Ok("legacy") => Generation::Legacy,
        _ => Generation::Current,
    };
    let addr = format!("127.0.0.1:{port}");
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, ?generation, "listening");

    let db = Arc::new(RwLock::new(Backend::seeded(generation)));
    mock_server::run_with(listener, db).await
}
