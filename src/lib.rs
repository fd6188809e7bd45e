mod network;
mod service;
mod utils;

pub use network::{
    decode_header, encode_header, ConnectionHandler, ConnectionId, Frame, FrameCodec,
    HandlerState, InboundFrame, HEADER_LENGTH, MAX_BODY_LENGTH,
};
pub use service::{
    setup_local_tracing, setup_tracing, AcceptErrorPolicy, AppError, AppResult, ClientConfig,
    ClientNode, ConnectionRegistry, Connector, ConnectorState, LinkConfig, Listener, LogConfig,
    NetworkConfig, RuntimeConfig, ServerHandle, ServerNode, Shutdown, TracingGuard, ENV_PREFIX,
};
pub use utils::IdentityPool;
