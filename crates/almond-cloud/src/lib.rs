//! Almond Cloud front end library.
//!
//! Connects to the engine process over a newline-delimited JSON control
//! channel, exposes the engine's remote objects as typed proxies, and keeps
//! one conversation per browser socket open on the engine.

pub mod api;
pub mod auth;
pub mod backend;
pub mod conversation;
pub mod delegate;
pub mod rpc;
