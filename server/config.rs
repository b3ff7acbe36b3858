// Server configuration with environment overrides
//
// NREPL_HOST: Interface to bind (default: 127.0.0.1)
// NREPL_PORT: TCP port, 0 picks an ephemeral port (default: 0)
// NREPL_VERBOSE: 1/true logs every request at info level (default: off)
// NREPL_START_TIMEOUT_MS: How long to retry a bind on an address in use (default: 20000)
// NREPL_WRITE_QUEUE: Outbound messages queued per connection before writers block (default: 256)
// NREPL_UNIX_SOCKET: Also listen on this Unix socket path (default: unset)
use nrepl_transport::{env_flag, env_parse, DEFAULT_WRITE_QUEUE};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub verbose: bool,
    pub start_timeout: Duration,
    pub write_queue: usize,
    pub unix_socket: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: DEFAULT_HOST.to_string(),
            port: 0,
            verbose: false,
            start_timeout: DEFAULT_START_TIMEOUT,
            write_queue: DEFAULT_WRITE_QUEUE,
            unix_socket: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = ServerConfig::default();
        ServerConfig {
            host: env::var("NREPL_HOST").unwrap_or(defaults.host),
            port: env_parse("NREPL_PORT").unwrap_or(defaults.port),
            verbose: env_flag("NREPL_VERBOSE").unwrap_or(defaults.verbose),
            start_timeout: env_parse("NREPL_START_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.start_timeout),
            write_queue: env_parse("NREPL_WRITE_QUEUE")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.write_queue),
            unix_socket: env::var_os("NREPL_UNIX_SOCKET").map(PathBuf::from),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
