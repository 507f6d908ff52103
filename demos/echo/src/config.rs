//! Settings read from `RX_*` environment variables.

use std::net::SocketAddr;
use std::str::FromStr;

use thiserror::Error;

/// Default service id of the echo service.
pub const ECHO_SERVICE_ID: u16 = 1;

/// Errors reading the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A variable could not be parsed.
    #[error("invalid value for {name}: {value:?}")]
    Invalid {
        /// Variable name.
        name: &'static str,
        /// Raw value.
        value: String,
    },

    /// `RX_MODE` is neither `server` nor `client`.
    #[error("RX_MODE must be \"server\" or \"client\", got {0:?}")]
    Mode(String),
}

/// Which side to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Serve echo calls.
    Server,
    /// Make echo calls.
    Client,
}

/// Demo settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoConfig {
    /// Side to run.
    pub mode: Mode,
    /// Rx listener address.
    pub bind_addr: SocketAddr,
    /// Server to call (client only).
    pub server_addr: SocketAddr,
    /// Service id.
    pub service_id: u16,
    /// HTTP health endpoint (server only).
    pub health_addr: SocketAddr,
    /// Number of calls to make (client only).
    pub count: u32,
    /// Request size in bytes (client only).
    pub payload_size: usize,
}

impl EchoConfig {
    /// Read from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read through `lookup`, applying defaults for missing variables.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mode = match lookup("RX_MODE").as_deref() {
            None | Some("server") => Mode::Server,
            Some("client") => Mode::Client,
            Some(other) => return Err(ConfigError::Mode(other.to_string())),
        };
        let default_bind = match mode {
            Mode::Server => "0.0.0.0:7000",
            Mode::Client => "0.0.0.0:0",
        };

        Ok(Self {
            mode,
            bind_addr: parse(&lookup, "RX_BIND_ADDR", default_bind)?,
            server_addr: parse(&lookup, "RX_SERVER_ADDR", "127.0.0.1:7000")?,
            service_id: parse(&lookup, "RX_SERVICE_ID", "1")?,
            health_addr: parse(&lookup, "RX_HEALTH_ADDR", "0.0.0.0:8080")?,
            count: parse(&lookup, "RX_COUNT", "10")?,
            payload_size: parse(&lookup, "RX_PAYLOAD_SIZE", "64")?,
        })
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: &str,
) -> Result<T, ConfigError> {
    let value = lookup(name).unwrap_or_else(|| default.to_string());
    value.parse().map_err(|_| ConfigError::Invalid { name, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<EchoConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EchoConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.mode, Mode::Server);
        assert_eq!(config.bind_addr, "0.0.0.0:7000".parse().unwrap());
        assert_eq!(config.service_id, ECHO_SERVICE_ID);
        assert_eq!(config.count, 10);
    }

    #[test]
    fn test_client_mode() {
        let config = config(&[("RX_MODE", "client"), ("RX_COUNT", "3")]).unwrap();
        assert_eq!(config.mode, Mode::Client);
        assert_eq!(config.bind_addr.port(), 0);
        assert_eq!(config.count, 3);
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(config(&[("RX_MODE", "proxy")]), Err(ConfigError::Mode(_))));
        assert!(matches!(
            config(&[("RX_SERVICE_ID", "70000")]),
            Err(ConfigError::Invalid { name: "RX_SERVICE_ID", .. })
        ));
    }
}
