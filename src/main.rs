use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use sqlgate::{Server, ServerOptions};
use tracing::info;
use tracing_subscriber::filter::EnvFilter;

/// Server configuration from ENV variables.
struct EnvConfig {
    port: u16,
    db_path: Option<PathBuf>,
    username: String,
    password: String,
}

impl EnvConfig {
    fn from_env() -> Self {
        Self {
            port: env::var("SQLGATE_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(5432),
            db_path: env::var("SQLGATE_DB").ok().map(PathBuf::from),
            username: env::var("SQLGATE_USER").unwrap_or_default(),
            password: env::var("SQLGATE_PASSWORD").unwrap_or_default(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .compact()
        .init();

    let config = EnvConfig::from_env();
    let server = Arc::new(Server::new(ServerOptions {
        port: config.port,
        db_path: config.db_path,
        username: config.username,
        password: config.password,
    })?);

    info!(port = config.port, "starting sqlgate");
    server
        .serve(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
