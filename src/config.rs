use anyhow::Context;
use std::env;

use crate::protocol::ProtocolKind;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    /// Pub/sub seam; unset runs single-process.
    pub redis_url: Option<String>,
    /// External notification dispatcher for non-HTTP channel URLs.
    pub dispatcher_url: Option<String>,
    /// Listener bind address, shared by every protocol port.
    pub bind_address: String,
    /// Credential-signing secret consumed by the HTTP surface.
    pub secret_key: String,
    pub metrics_port: u16,
    /// `(protocol, port)` for every listener to start.
    pub listeners: Vec<(ProtocolKind, u16)>,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let listeners = ProtocolKind::ALL
            .iter()
            .map(|&kind| {
                let var = format!("PORT_{}", kind.name().to_uppercase());
                let port = match env::var(&var) {
                    Ok(value) => value
                        .parse()
                        .with_context(|| format!("{var} must be a valid port number"))?,
                    Err(_) => kind.default_port(),
                };
                Ok((kind, port))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(AppConfig {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            redis_url: env::var("REDIS_URL").ok(),
            dispatcher_url: env::var("DISPATCHER_URL").ok(),
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()),
            secret_key: env::var("SECRET_KEY")
                .unwrap_or_else(|_| "change-me-in-production".to_string()),
            metrics_port: env::var("METRICS_PORT")
                .unwrap_or_else(|_| "9000".to_string())
                .parse()
                .context("METRICS_PORT must be a valid u16")?,
            listeners,
        })
    }
}
