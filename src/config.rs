//! Server configuration.
//!
//! Plain data, loadable from TOML. Handlers and formatters are code and are
//! registered on [`Server`](crate::Server) directly.
//!
//! ```toml
//! name = "users-api"
//! addr = "0.0.0.0:3000"
//! versions = ["1.0.0", "2.0.0"]
//! ```

use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;

use crate::error::{ConfigError, Error};

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Reported in probes and logs.
    pub name: String,
    /// `host:port` to listen on.
    pub addr: String,
    /// Versions given to routes mounted without any.
    pub versions: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "relay".to_owned(),
            addr: "127.0.0.1:8080".to_owned(),
            versions: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn from_toml(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let source = std::fs::read_to_string(path)?;
        Ok(Self::from_toml(&source)?)
    }

    pub(crate) fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.addr
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(self.addr.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = ServerConfig::from_toml(r#"versions = ["1.0.0"]"#).unwrap();
        assert_eq!(config.name, "relay");
        assert_eq!(config.versions, ["1.0.0"]);
        assert!(config.socket_addr().is_ok());
    }

    #[test]
    fn rejects_unknown_keys_and_bad_addresses() {
        assert!(matches!(ServerConfig::from_toml("port = 3"), Err(ConfigError::Toml(_))));

        let config = ServerConfig { addr: "nowhere".into(), ..ServerConfig::default() };
        assert!(matches!(config.socket_addr(), Err(ConfigError::InvalidAddress(_))));
    }
}
