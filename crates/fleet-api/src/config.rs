use std::env;
use std::net::SocketAddr;

use fleet_infra::{Error, Result};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    /// HMAC key for bearer tokens.
    pub token_secret: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let listen_addr = env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into());
        let listen_addr = listen_addr
            .parse()
            .map_err(|_| Error::Config(format!("LISTEN_ADDR is not a socket address: {listen_addr}")))?;

        let token_secret = env::var("FLEET_TOKEN_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::MissingEnv("FLEET_TOKEN_SECRET".into()))?;

        Ok(Self {
            listen_addr,
            token_secret,
        })
    }
}
