use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

/// Prefix of environment variables overriding file settings,
/// e.g. `FRAMELINK__NETWORK__PORT=9901`.
pub const ENV_PREFIX: &str = "FRAMELINK";

/// What the accept loop does after a failed accept.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcceptErrorPolicy {
    /// stop accepting new connections, live connections are still served
    #[default]
    Halt,
    /// log, back off and keep accepting
    Continue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    /// size of the connection id pool, accepts wait while every id is in use
    pub max_connection: usize,
    pub conn_read_buffer_size: usize,
    pub inbound_channel_capacity: usize,
    pub accept_error_policy: AcceptErrorPolicy,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "127.0.0.1".to_string(),
            port: 9900,
            max_connection: 65536,
            conn_read_buffer_size: 4 * 1024,
            inbound_channel_capacity: 1024,
            accept_error_policy: AcceptErrorPolicy::Halt,
        }
    }
}

impl NetworkConfig {
    /// The identity pool needs at least one id and every id must fit a `ConnectionId`.
    pub fn validate(&self) -> AppResult<()> {
        if self.max_connection == 0 || self.max_connection > u32::MAX as usize {
            return Err(AppError::InvalidValue(format!(
                "network.max_connection: {}",
                self.max_connection
            )));
        }
        Ok(())
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_ip: String,
    pub server_port: u16,
    pub conn_read_buffer_size: usize,
    pub inbound_channel_capacity: usize,
    /// how long `start()` waits for the connect outcome
    pub connect_wait_ms: u64,
    /// pause between reconnect attempts while disconnected
    pub retry_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            server_ip: "127.0.0.1".to_string(),
            server_port: 9900,
            conn_read_buffer_size: 4 * 1024,
            inbound_channel_capacity: 1024,
            connect_wait_ms: 1000,
            retry_interval_ms: 1000,
        }
    }
}

impl ClientConfig {
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server_ip, self.server_port)
    }

    pub fn connect_wait(&self) -> Duration {
        Duration::from_millis(self.connect_wait_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub worker_threads: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            worker_threads: num_cpus::get(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub log_dir: String,
    pub file_prefix: String,
    /// export spans and metrics over OTLP (needs a collector)
    pub otlp_enabled: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            log_dir: "logs".to_string(),
            file_prefix: "framelink.log".to_string(),
            otlp_enabled: false,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub network: NetworkConfig,
    pub client: ClientConfig,
    pub runtime: RuntimeConfig,
    pub log: LogConfig,
}

impl LinkConfig {
    /// Loads the config file at `path` (format picked from its extension), then applies
    /// `FRAMELINK__SECTION__KEY` environment overrides. Missing keys keep their defaults.
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<LinkConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let link_config: LinkConfig = config.try_deserialize()?;
        link_config.validate()?;
        Ok(link_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        self.network.validate()?;
        if self.runtime.worker_threads == 0 {
            return Err(AppError::InvalidValue(
                "runtime.worker_threads: 0".to_string(),
            ));
        }
        Ok(())
    }
}
