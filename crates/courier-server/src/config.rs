use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use tracing::warn;

const DEV_SECRET: &str = "dev-secret-change-me";

/// Server settings, read from `COURIER_*` environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let jwt_secret = lookup("COURIER_JWT_SECRET").unwrap_or_else(|| {
            warn!("COURIER_JWT_SECRET not set, using the development secret");
            DEV_SECRET.into()
        });
        let port = match lookup("COURIER_PORT") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("COURIER_PORT is not a port number: {raw:?}"))?,
            None => 3000,
        };

        Ok(Self {
            host: lookup("COURIER_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port,
            db_path: PathBuf::from(lookup("COURIER_DB_PATH").unwrap_or_else(|| "courier.db".into())),
            jwt_secret,
        })
    }

    pub fn addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }
}
