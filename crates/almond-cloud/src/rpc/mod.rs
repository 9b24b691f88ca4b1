//! Remote-object RPC over a newline-delimited JSON stream.
//!
//! - [`framing`]: one JSON value per line, with a size limit.
//! - [`channel`]: call/response multiplexing, object tables, proxies.
//! - [`object`]: the trait local objects implement to be callable.

pub mod channel;
pub mod error;
pub mod framing;
pub mod object;

pub use channel::{
    ChannelConfig, CloseReason, DEFAULT_MAX_PENDING_CALLS, Publication, RemoteHandle, RpcChannel,
};
pub use error::RpcError;
pub use framing::{DEFAULT_MAX_FRAME_BYTES, FrameReader, FrameWriter, FramingError};
pub use object::{RpcObject, arg, to_result};
