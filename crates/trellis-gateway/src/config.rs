//! Gateway server settings.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Number of actix workers; 0 lets the runtime decide.
    #[serde(default)]
    pub workers: usize,
    /// Development deployments return internal error details to callers.
    #[serde(default)]
    pub development: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8460
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            host: default_host(),
            port: default_port(),
            workers: 0,
            development: false,
        }
    }
}

impl GatewayConfig {
    pub fn bind_address(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }
}
