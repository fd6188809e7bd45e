//! Network Module Implementation
//!
//! This module provides the connection level building blocks shared by the server and
//! the client roles.
//!
//! # Components
//!
//! - `Frame` / `FrameCodec`: the 4 byte ASCII length header wire format and a stream
//!   codec that assembles whole frames out of arbitrary socket reads
//! - `ConnectionHandler`: owns one TCP socket, runs its read loop and writer task, and
//!   reports faults through a one-shot error callback
//!
//! # Wire format
//!
//! ```text
//! +----------------+---------------------------+
//! | "%4d" length   | body (0..=512 bytes)      |
//! +----------------+---------------------------+
//! ```

pub use connection::{ConnectionHandler, ConnectionId, HandlerState, InboundFrame};
pub use frame::{decode_header, encode_header, Frame, FrameCodec, HEADER_LENGTH, MAX_BODY_LENGTH};
mod connection;
mod frame;
