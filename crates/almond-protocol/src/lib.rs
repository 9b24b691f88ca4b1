//! Wire types for Almond Cloud.
//!
//! This crate defines every JSON shape that crosses a process or network
//! boundary:
//!
//! ```text
//! Browser <--[WS: ClientCommand / ServerMessage]--> Front end <--[control channel: RpcMessage]--> Engine
//! ```
//!
//! The control channel is a single newline-delimited JSON stream. The engine
//! opens it with a [`rpc::ControlMessage::Ready`] handshake carrying the root
//! object reference; everything after that is a [`rpc::RpcMessage`].
//!
//! The browser sockets speak the small tagged vocabulary in [`browser`], which
//! is the stable contract between the engine's delegates and the web client.

pub mod browser;
pub mod engine;
pub mod rpc;

pub use browser::{ClientCommand, CommandParseError, ServerMessage};
pub use engine::{AppInfo, ConversationOptions, ConversationUser, DeviceInfo, OAuth2Start};
pub use rpc::{ControlMessage, ObjectId, ObjectRef, RemoteError, RpcMessage, error_codes};
