use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, bail};

/// Secrets that ship in sample env files and must never reach production.
const PLACEHOLDER_SECRETS: &[&str] = &["dev-secret-change-me", "changeme", "change-me", "secret"];

#[derive(Debug, Clone)]
pub struct Config {
    pub jwt_secret: String,
    pub db_path: PathBuf,
    pub host: String,
    pub port: u16,
    /// Media metadata service; without it every attachment is refused.
    pub media_url: Option<String>,
    /// Only members may join a chat room.
    pub verify_joins: bool,
    /// Allowed browser origin; permissive when unset.
    pub cors_origin: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let jwt_secret = var("HUDDLE_JWT_SECRET").context("HUDDLE_JWT_SECRET must be set")?;
        if PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("HUDDLE_JWT_SECRET is still a placeholder value");
        }

        let port = match var("HUDDLE_PORT") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("HUDDLE_PORT is not a port number: {}", raw))?,
            None => 3000,
        };

        let verify_joins = match var("HUDDLE_RELAY_VERIFY_JOINS") {
            Some(raw) => parse_flag(&raw)
                .with_context(|| format!("HUDDLE_RELAY_VERIFY_JOINS is not a boolean: {}", raw))?,
            None => false,
        };

        Ok(Self {
            jwt_secret,
            db_path: PathBuf::from(var("HUDDLE_DB_PATH").unwrap_or_else(|| "huddle.db".into())),
            host: var("HUDDLE_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port,
            media_url: var("HUDDLE_MEDIA_URL"),
            verify_joins,
            cors_origin: var("HUDDLE_CORS_ORIGIN"),
        })
    }

    pub fn addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
