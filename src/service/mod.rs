pub use app_error::{AppError, AppResult};
pub use config::{
    AcceptErrorPolicy, ClientConfig, LinkConfig, LogConfig, NetworkConfig, RuntimeConfig,
    ENV_PREFIX,
};
pub use connector::{Connector, ConnectorState};
pub use node::{ClientNode, ServerNode};
pub use registry::ConnectionRegistry;
pub use server::{Listener, ServerHandle};
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing, TracingGuard};

mod app_error;
mod config;
mod connector;
mod node;
mod registry;
mod server;
mod shutdown;
mod tracing_config;
