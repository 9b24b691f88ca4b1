//! Symmetric remote-object channel over one framed stream.
//!
//! Either side publishes local objects and calls methods on objects the
//! other side published. One reader task demultiplexes incoming frames:
//! responses are matched to their pending call by correlation id, incoming
//! calls are dispatched on their own task so a slow method never blocks
//! response delivery.
//!
//! Closing the channel, for whatever reason, rejects every pending call with
//! [`RpcError::ChannelClosed`] and revokes every published object.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use almond_protocol::{ControlMessage, ObjectId, ObjectRef, RpcMessage};
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, oneshot, watch};

use super::error::RpcError;
use super::framing::{DEFAULT_MAX_FRAME_BYTES, FrameReader, FrameWriter, FramingError};
use super::object::RpcObject;

/// Default cap on outstanding outgoing calls.
pub const DEFAULT_MAX_PENDING_CALLS: usize = 8192;

/// Bound on flushing and shutting down the write half during close.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Channel tuning.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub max_frame_bytes: usize,
    /// Per-call deadline. `None` waits until a response or channel close.
    pub call_timeout: Option<Duration>,
    pub max_pending_calls: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            call_timeout: None,
            max_pending_calls: DEFAULT_MAX_PENDING_CALLS,
        }
    }
}

/// Why a channel closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// [`RpcChannel::close`] was called on this side.
    Local,
    /// The peer ended the stream.
    PeerClosed,
    /// The socket failed.
    Transport(String),
    /// The peer sent something that is not a valid frame or message.
    Protocol(String),
}

impl CloseReason {
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "closed locally"),
            Self::PeerClosed => write!(f, "closed by peer"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
        }
    }
}

/// One in-flight outgoing call.
struct PendingCall {
    method: String,
    created_at: Instant,
    tx: oneshot::Sender<Result<Value, RpcError>>,
}

/// Removes a pending entry when the caller stops waiting, whether it got a
/// response, timed out or was dropped.
struct PendingGuard<'a> {
    pending: &'a DashMap<u64, PendingCall>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

type BoxedWriter = FrameWriter<Box<dyn AsyncWrite + Send + Unpin>>;

/// A bidirectional remote-object multiplexer.
pub struct RpcChannel {
    name: String,
    config: ChannelConfig,
    writer: Mutex<BoxedWriter>,
    objects: DashMap<ObjectId, Arc<dyn RpcObject>>,
    pending: DashMap<u64, PendingCall>,
    next_call_id: AtomicU64,
    next_object_id: AtomicU64,
    closed: watch::Sender<Option<CloseReason>>,
}

impl RpcChannel {
    /// Start a channel over a raw reader/writer pair.
    pub fn start<R, W>(
        name: impl Into<String>,
        reader: R,
        writer: W,
        config: ChannelConfig,
    ) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let frames = FrameReader::new(reader, config.max_frame_bytes);
        Self::start_framed(name, frames, writer, config)
    }

    /// Start a channel over a reader that already consumed some frames,
    /// e.g. a handshake. Bytes it buffered are not lost.
    pub fn start_framed<R, W>(
        name: impl Into<String>,
        frames: FrameReader<R>,
        writer: W,
        config: ChannelConfig,
    ) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);
        let (closed, _) = watch::channel(None);
        let channel = Arc::new(Self {
            name: name.into(),
            writer: Mutex::new(FrameWriter::new(writer, config.max_frame_bytes)),
            config,
            objects: DashMap::new(),
            pending: DashMap::new(),
            next_call_id: AtomicU64::new(1),
            next_object_id: AtomicU64::new(1),
            closed,
        });

        tokio::spawn(Arc::clone(&channel).read_loop(frames));
        channel
    }

    /// Two channels connected to each other in memory.
    pub fn in_memory_pair(config: ChannelConfig) -> (Arc<Self>, Arc<Self>) {
        let (left, right) = tokio::io::duplex(64 * 1024);
        let (left_read, left_write) = tokio::io::split(left);
        let (right_read, right_write) = tokio::io::split(right);
        (
            Self::start("left", left_read, left_write, config.clone()),
            Self::start("right", right_read, right_write, config),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.borrow().is_some()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.closed.borrow().clone()
    }

    /// Wait until the channel closes.
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.closed.subscribe();
        let reason = rx.wait_for(Option::is_some).await.map(|r| (*r).clone());
        match reason {
            Ok(Some(reason)) => reason,
            _ => CloseReason::PeerClosed,
        }
    }

    /// Number of outgoing calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Number of local objects the peer can currently reach.
    pub fn published_objects(&self) -> usize {
        self.objects.len()
    }

    pub fn is_published(&self, id: &ObjectId) -> bool {
        self.objects.contains_key(id)
    }

    // ------------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------------

    /// Register a local object and return a reference the peer can call.
    ///
    /// The caller owns the registration and must [`release`](Self::release)
    /// it; prefer [`publish_scoped`](Self::publish_scoped).
    pub fn publish(&self, object: Arc<dyn RpcObject>) -> ObjectRef {
        let id = ObjectId::from(self.next_object_id.fetch_add(1, Ordering::Relaxed));
        let reference = ObjectRef::new(id.clone(), object.methods());
        if self.is_closed() {
            debug!("[{}] not publishing {id} on a closed channel", self.name);
        } else {
            self.objects.insert(id, object);
        }
        reference
    }

    /// Register a local object for as long as the returned guard lives.
    pub fn publish_scoped(self: &Arc<Self>, object: Arc<dyn RpcObject>) -> Publication {
        Publication {
            reference: self.publish(object),
            channel: Arc::clone(self),
            released: false,
        }
    }

    /// Revoke a local object. Later peer calls fail with "object not found".
    pub fn release(&self, reference: &ObjectRef) -> bool {
        let removed = self.objects.remove(&reference.id).is_some();
        if removed {
            debug!("[{}] released object {}", self.name, reference.id);
        }
        removed
    }

    // ------------------------------------------------------------------------
    // Proxies
    // ------------------------------------------------------------------------

    /// Local handle for an object the peer published.
    pub fn proxy(self: &Arc<Self>, reference: ObjectRef) -> RemoteHandle {
        RemoteHandle {
            channel: Arc::clone(self),
            reference,
        }
    }

    /// Proxy for a reference carried in a JSON value, e.g. a call result.
    pub fn proxy_value(self: &Arc<Self>, value: &Value) -> Result<RemoteHandle, RpcError> {
        let reference: ObjectRef = serde_json::from_value(value.clone())
            .map_err(|e| RpcError::Protocol(format!("expected an object reference: {e}")))?;
        Ok(self.proxy(reference))
    }

    /// Call `method` on the peer's object `target`.
    pub async fn call(
        &self,
        target: &ObjectId,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, RpcError> {
        if self.is_closed() {
            return Err(RpcError::ChannelClosed);
        }
        if self.pending.len() >= self.config.max_pending_calls {
            return Err(RpcError::ResourceExhausted {
                limit: self.config.max_pending_calls,
            });
        }

        let id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id,
            PendingCall {
                method: method.to_string(),
                created_at: Instant::now(),
                tx,
            },
        );
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        // A close racing the insert above may have drained the table already.
        if self.is_closed() {
            return Err(RpcError::ChannelClosed);
        }

        debug!("[{}] call {id}: {target}.{method}", self.name);
        self.send(&RpcMessage::Call {
            id,
            obj: target.clone(),
            method: method.to_string(),
            args,
        })
        .await?;

        let response = match self.config.call_timeout {
            Some(timeout) => tokio::time::timeout(timeout, rx).await.map_err(|_| {
                RpcError::DeadlineExceeded {
                    method: method.to_string(),
                    timeout,
                }
            })?,
            None => rx.await,
        };

        response.unwrap_or(Err(RpcError::ChannelClosed))
    }

    /// Send the `ready` handshake naming `root` as the entry object.
    ///
    /// Only the accepting side announces; the connecting side reads the
    /// announcement off the raw stream before it starts its own channel.
    pub async fn announce_ready(&self, root: &ObjectRef) -> Result<(), RpcError> {
        self.send(&ControlMessage::Ready {
            rpc_id: root.clone(),
        })
        .await
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Close the channel from this side. Idempotent.
    pub async fn close(&self) {
        if self.mark_closed(CloseReason::Local) {
            self.shutdown_writer().await;
        }
    }

    /// Transition to closed. Returns false if the channel was already closed.
    fn mark_closed(&self, reason: CloseReason) -> bool {
        let description = reason.to_string();
        let mut slot = Some(reason);
        let transitioned = self.closed.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = slot.take();
            true
        });
        if !transitioned {
            return false;
        }

        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut rejected = 0;
        for id in ids {
            if let Some((_, call)) = self.pending.remove(&id) {
                debug!(
                    "[{}] rejecting call {id} ({}) after {:?}",
                    self.name,
                    call.method,
                    call.created_at.elapsed()
                );
                let _ = call.tx.send(Err(RpcError::ChannelClosed));
                rejected += 1;
            }
        }

        let revoked = self.objects.len();
        self.objects.clear();

        info!(
            "[{}] channel {description}; rejected {rejected} pending call(s), revoked {revoked} object(s)",
            self.name
        );
        true
    }

    async fn shutdown_writer(&self) {
        let shutdown = async {
            let mut writer = self.writer.lock().await;
            writer.shutdown().await
        };
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, shutdown).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("[{}] shutdown: {e}", self.name),
            Err(_) => warn!("[{}] timed out shutting down the write half", self.name),
        }
    }

    async fn send<T: Serialize>(&self, message: &T) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::ChannelClosed);
        }

        let result = {
            let mut writer = self.writer.lock().await;
            writer.send(message).await
        };

        match result {
            Ok(()) => Ok(()),
            Err(FramingError::Io(e)) => {
                // The close event supersedes the socket error.
                self.mark_closed(CloseReason::Transport(e.to_string()));
                Err(RpcError::ChannelClosed)
            }
            Err(e) => Err(RpcError::Protocol(e.to_string())),
        }
    }

    // ------------------------------------------------------------------------
    // Incoming traffic
    // ------------------------------------------------------------------------

    async fn read_loop<R>(self: Arc<Self>, mut frames: FrameReader<R>)
    where
        R: AsyncRead + Unpin,
    {
        let mut closed = self.closed.subscribe();
        let reason = loop {
            let frame = tokio::select! {
                frame = frames.next_frame() => frame,
                _ = closed.wait_for(Option::is_some) => return,
            };

            match frame {
                Ok(Some(value)) => {
                    if let Err(reason) = self.dispatch(value) {
                        break reason;
                    }
                }
                Ok(None) => break CloseReason::PeerClosed,
                Err(FramingError::Io(e)) => break CloseReason::Transport(e.to_string()),
                Err(e) => break CloseReason::Protocol(e.to_string()),
            }
        };

        if self.mark_closed(reason) {
            self.shutdown_writer().await;
        }
    }

    fn dispatch(self: &Arc<Self>, frame: Value) -> Result<(), CloseReason> {
        if frame.get("control").is_some() {
            debug!("[{}] ignoring control message: {frame}", self.name);
            return Ok(());
        }

        let message: RpcMessage = serde_json::from_value(frame)
            .map_err(|e| CloseReason::Protocol(format!("invalid message: {e}")))?;

        match message {
            RpcMessage::Call {
                id,
                obj,
                method,
                args,
            } => self.handle_call(id, obj, method, args),
            RpcMessage::Reply { id, value } => self.complete(id, Ok(value)),
            RpcMessage::Fault { id, error } => self.complete(id, Err(RpcError::from_remote(error))),
            RpcMessage::Free { obj } => {
                if self.objects.remove(&obj).is_some() {
                    debug!("[{}] peer freed object {obj}", self.name);
                }
            }
        }
        Ok(())
    }

    fn handle_call(self: &Arc<Self>, id: u64, obj: ObjectId, method: String, args: Vec<Value>) {
        let target = self.objects.get(&obj).map(|entry| Arc::clone(entry.value()));
        let channel = Arc::clone(self);

        tokio::spawn(async move {
            let outcome = match target {
                None => Err(RpcError::ObjectNotFound(obj.to_string())),
                Some(object) if !object.methods().contains(&method.as_str()) => {
                    Err(RpcError::MethodNotFound(method.clone()))
                }
                Some(object) => object.invoke(&channel, &method, args).await,
            };

            let reply = match outcome {
                Ok(value) => RpcMessage::Reply { id, value },
                Err(e) => {
                    debug!("[{}] {obj}.{method} failed: {e}", channel.name);
                    RpcMessage::Fault {
                        id,
                        error: e.to_remote(),
                    }
                }
            };

            if let Err(e) = channel.send(&reply).await {
                debug!("[{}] could not answer call {id}: {e}", channel.name);
            }
        });
    }

    fn complete(&self, id: u64, result: Result<Value, RpcError>) {
        match self.pending.remove(&id) {
            // The caller may have given up already.
            Some((_, call)) => {
                let _ = call.tx.send(result);
            }
            None => debug!("[{}] response for unknown call {id}", self.name),
        }
    }
}

impl fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcChannel")
            .field("name", &self.name)
            .field("closed", &self.close_reason())
            .field("pending", &self.pending.len())
            .field("objects", &self.objects.len())
            .finish()
    }
}

/// Scoped registration of a local object. Dropping it releases the object.
pub struct Publication {
    channel: Arc<RpcChannel>,
    reference: ObjectRef,
    released: bool,
}

impl Publication {
    pub fn reference(&self) -> &ObjectRef {
        &self.reference
    }

    pub fn channel(&self) -> &Arc<RpcChannel> {
        &self.channel
    }

    /// Release now. Returns whether the object was still registered.
    pub fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        self.channel.release(&self.reference)
    }
}

impl Drop for Publication {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Publication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publication")
            .field("channel", &self.channel.name)
            .field("reference", &self.reference)
            .field("released", &self.released)
            .finish()
    }
}

/// Local proxy for an object published by the peer.
#[derive(Clone)]
pub struct RemoteHandle {
    channel: Arc<RpcChannel>,
    reference: ObjectRef,
}

impl RemoteHandle {
    pub fn reference(&self) -> &ObjectRef {
        &self.reference
    }

    pub fn channel(&self) -> &Arc<RpcChannel> {
        &self.channel
    }

    pub fn is_connected(&self) -> bool {
        !self.channel.is_closed()
    }

    /// Call a method and wait for its result.
    ///
    /// Methods the reference does not advertise fail locally without
    /// touching the wire.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        if !self.reference.advertises(method) {
            return Err(RpcError::MethodNotFound(method.to_string()));
        }
        self.channel.call(&self.reference.id, method, args).await
    }

    /// Call a method and decode its result.
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> Result<T, RpcError> {
        let value = self.call(method, args).await?;
        serde_json::from_value(value)
            .map_err(|e| RpcError::Protocol(format!("unexpected result from {method}: {e}")))
    }

    /// Call a method that returns another remote object.
    pub async fn call_proxy(&self, method: &str, args: Vec<Value>) -> Result<Self, RpcError> {
        let value = self.call(method, args).await?;
        self.channel.proxy_value(&value)
    }

    /// Tell the peer this side no longer needs the object.
    ///
    /// A no-op once the channel is closed, since closing revoked it anyway.
    pub async fn release(&self) -> Result<(), RpcError> {
        if self.channel.is_closed() {
            return Ok(());
        }
        match self
            .channel
            .send(&RpcMessage::Free {
                obj: self.reference.id.clone(),
            })
            .await
        {
            Ok(()) | Err(RpcError::ChannelClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl fmt::Debug for RemoteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteHandle")
            .field("channel", &self.channel.name)
            .field("reference", &self.reference)
            .finish()
    }
}
