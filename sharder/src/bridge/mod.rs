//! IPC bridge between the master and its worker processes.
//!
//! # Architecture
//!
//! - **protocol**: Frames, opcodes, results and request payloads
//! - **codec**: Length-prefixed JSON framing for AsyncRead/AsyncWrite
//! - **transport**: Named endpoints over unix or TCP sockets, with
//!   request/reply correlation and targeted/broadcast delivery
//! - **error**: Transport and request error types

pub mod codec;
pub mod error;
pub mod protocol;
pub mod transport;

pub use error::{IpcError, TransportError};
pub use protocol::{ErrorPayload, Frame, IpcMessage, IpcResult, OpCode, RemoteError};
pub use transport::{Inbound, IpcAddress, IpcClient, IpcServer, Peer, ReplyTo};
