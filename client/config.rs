// Client configuration with environment overrides
//
// NREPL_HOST: Server host (default: 127.0.0.1)
// NREPL_PORT: Server port (default: 7888)
// NREPL_TIMEOUT_MS: Per-request timeout for convenience calls (default: none)
// NREPL_VERBOSE: 1/true logs every received message (default: off)
use nrepl_transport::{env_flag, env_parse, DEFAULT_WRITE_QUEUE};
use std::env;
use std::time::Duration;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 7888;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Applied by the convenience calls; `None` waits for a terminal status
    /// or connection loss.
    pub request_timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    pub verbose: bool,
    pub write_queue: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            request_timeout: None,
            connect_timeout: None,
            verbose: false,
            write_queue: DEFAULT_WRITE_QUEUE,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let defaults = ClientConfig::default();
        ClientConfig {
            host: env::var("NREPL_HOST").unwrap_or(defaults.host),
            port: env_parse("NREPL_PORT").unwrap_or(defaults.port),
            request_timeout: env_parse("NREPL_TIMEOUT_MS").map(Duration::from_millis),
            verbose: env_flag("NREPL_VERBOSE").unwrap_or(defaults.verbose),
            ..defaults
        }
    }

    pub fn new(host: &str, port: u16) -> Self {
        ClientConfig {
            host: host.to_string(),
            port,
            ..ClientConfig::default()
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_env_reads_overrides() {
        // The only test in this crate that touches NREPL_* variables
        env::set_var("NREPL_PORT", "7999");
        env::set_var("NREPL_TIMEOUT_MS", "250");
        env::set_var("NREPL_VERBOSE", "on");
        let config = ClientConfig::from_env();
        env::remove_var("NREPL_PORT");
        env::remove_var("NREPL_TIMEOUT_MS");
        env::remove_var("NREPL_VERBOSE");

        assert_eq!(config.port, 7999);
        assert_eq!(config.request_timeout, Some(Duration::from_millis(250)));
        assert!(config.verbose);
        assert_eq!(config.write_queue, DEFAULT_WRITE_QUEUE);
    }
}
