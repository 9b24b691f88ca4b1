//! Control-channel client with automatic reconnect.
//!
//! One supervisor task per started client runs the cycle
//! `connect -> handshake -> ready -> wait for close -> sleep -> ...`, so
//! reconnect attempts never overlap. Between a lost channel and the next
//! successful handshake every forwarded operation fails fast with
//! [`RpcError::BackendUnavailable`].

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use almond_protocol::{AppInfo, ControlMessage, DeviceInfo, OAuth2Start, ObjectRef, engine::methods};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::config::BackendConfig;
use super::proxy::{AssistantProvider, AssistantProxy, ControlProxy, EngineControl};
use crate::rpc::{FrameReader, RpcChannel, RpcError};

/// Connection state as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Ready => "ready",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The live connection.
struct Link {
    channel: Arc<RpcChannel>,
    control: ControlProxy,
    assistant: Option<AssistantProxy>,
}

struct Supervisor {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

struct ClientInner {
    config: BackendConfig,
    status: watch::Sender<ConnectionStatus>,
    link: RwLock<Option<Link>>,
}

impl ClientInner {
    fn set_status(&self, next: ConnectionStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            debug!("Backend connection status: {next}");
        }
    }

    fn set_link(&self, link: Link) {
        *self.link.write().unwrap_or_else(PoisonError::into_inner) = Some(link);
    }

    /// Cache the assistant, unless the link moved on meanwhile.
    fn set_assistant(&self, channel: &Arc<RpcChannel>, assistant: AssistantProxy) {
        let mut guard = self.link.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(link) = guard.as_mut().filter(|link| Arc::ptr_eq(&link.channel, channel)) {
            link.assistant = Some(assistant);
        }
    }

    /// Forget the link if it still belongs to `channel`.
    fn clear_link(&self, channel: &Arc<RpcChannel>) {
        let mut guard = self.link.write().unwrap_or_else(PoisonError::into_inner);
        if guard
            .as_ref()
            .is_some_and(|link| Arc::ptr_eq(&link.channel, channel))
        {
            *guard = None;
        }
    }

    fn take_link(&self) -> Option<Link> {
        self.link
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn read_link<T>(&self, f: impl FnOnce(&Link) -> T) -> Option<T> {
        let guard = self.link.read().unwrap_or_else(PoisonError::into_inner);
        guard
            .as_ref()
            .filter(|link| !link.channel.is_closed())
            .map(f)
    }
}

/// Client for the engine's control socket.
///
/// Cheap to clone; all clones share one connection and one supervisor.
#[derive(Clone)]
pub struct BackendClient {
    inner: Arc<ClientInner>,
    supervisor: Arc<Mutex<Option<Supervisor>>>,
}

impl BackendClient {
    pub fn new(config: BackendConfig) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            inner: Arc::new(ClientInner {
                config,
                status,
                link: RwLock::new(None),
            }),
            supervisor: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &BackendConfig {
        &self.inner.config
    }

    /// Start connecting in the background. No-op while already running.
    pub fn start(&self) {
        let mut supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if supervisor
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
        {
            return;
        }

        info!("Connecting to backend at {}", self.inner.config.address);
        let stop = CancellationToken::new();
        let task = tokio::spawn(supervise(Arc::clone(&self.inner), stop.clone()));
        *supervisor = Some(Supervisor { stop, task });
    }

    /// Close the channel and stop reconnecting. Idempotent.
    pub async fn stop(&self) {
        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(supervisor) = supervisor {
            supervisor.stop.cancel();
            match supervisor.task.await {
                Err(e) if !e.is_cancelled() => warn!("Backend supervisor ended abnormally: {e}"),
                _ => {}
            }
        }

        if let Some(link) = self.inner.take_link() {
            link.channel.close().await;
        }
        self.inner.set_status(ConnectionStatus::Disconnected);
    }

    pub fn is_running(&self) -> bool {
        self.supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// Wait until the client is ready. Returns false on timeout.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut status = self.subscribe_status();
        let ready = status.wait_for(|s| *s == ConnectionStatus::Ready);
        matches!(tokio::time::timeout(timeout, ready).await, Ok(Ok(_)))
    }

    /// The current channel, if connected.
    pub fn channel(&self) -> Option<Arc<RpcChannel>> {
        self.inner.read_link(|link| Arc::clone(&link.channel))
    }

    /// Root control proxy of the current connection.
    pub fn control(&self) -> Result<ControlProxy, RpcError> {
        self.inner
            .read_link(|link| link.control.clone())
            .ok_or(RpcError::BackendUnavailable)
    }
}

impl fmt::Debug for BackendClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendClient")
            .field("address", &self.inner.config.address)
            .field("status", &self.status())
            .finish()
    }
}

#[async_trait]
impl AssistantProvider for BackendClient {
    async fn assistant(&self) -> Result<AssistantProxy, RpcError> {
        if let Some(Some(assistant)) = self.inner.read_link(|link| link.assistant.clone()) {
            return Ok(assistant);
        }

        // Eager resolution failed or has not finished yet; try once more.
        let control = self.control()?;
        let assistant = control.assistant().await?;
        self.inner
            .set_assistant(control.handle().channel(), assistant.clone());
        Ok(assistant)
    }
}

#[async_trait]
impl EngineControl for BackendClient {
    async fn get_all_apps(&self) -> Result<Vec<AppInfo>, RpcError> {
        self.control()?.get_all_apps().await
    }

    async fn get_app(&self, app_id: &str) -> Result<Option<AppInfo>, RpcError> {
        self.control()?.get_app(app_id).await
    }

    async fn delete_app(&self, app_id: &str) -> Result<bool, RpcError> {
        self.control()?.delete_app(app_id).await
    }

    async fn get_all_devices(&self) -> Result<Vec<DeviceInfo>, RpcError> {
        self.control()?.get_all_devices().await
    }

    async fn add_device(&self, state: Value) -> Result<(), RpcError> {
        self.control()?.add_device(state).await
    }

    async fn delete_device(&self, unique_id: &str) -> Result<bool, RpcError> {
        self.control()?.delete_device(unique_id).await
    }

    async fn start_oauth2(&self, kind: &str) -> Result<OAuth2Start, RpcError> {
        self.control()?.start_oauth2(kind).await
    }

    async fn handle_oauth2_callback(
        &self,
        kind: &str,
        redirect_uri: &str,
        session: Value,
    ) -> Result<(), RpcError> {
        self.control()?
            .handle_oauth2_callback(kind, redirect_uri, session)
            .await
    }
}

async fn supervise(inner: Arc<ClientInner>, stop: CancellationToken) {
    let delay = inner.config.reconnect_delay();

    loop {
        inner.set_status(ConnectionStatus::Connecting);

        let attempt = tokio::select! {
            _ = stop.cancelled() => break,
            attempt = connect_once(&inner) => attempt,
        };

        match attempt {
            Ok(channel) => {
                let reason = tokio::select! {
                    _ = stop.cancelled() => break,
                    reason = channel.closed() => reason,
                };
                inner.clear_link(&channel);
                if reason.is_local() {
                    info!("Control channel to backend closed locally");
                } else {
                    warn!("Control channel to backend severed ({reason})");
                }
            }
            Err(e) => {
                warn!(
                    "Failed to connect to backend at {}: {e:#}",
                    inner.config.address
                );
            }
        }

        inner.set_status(ConnectionStatus::Disconnected);
        info!("Reconnecting in {delay:?}...");

        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    if let Some(link) = inner.take_link() {
        link.channel.close().await;
    }
    inner.set_status(ConnectionStatus::Disconnected);
    debug!("Backend supervisor stopped");
}

/// One connection attempt. Returns the channel once the root proxy is set.
async fn connect_once(inner: &Arc<ClientInner>) -> Result<Arc<RpcChannel>> {
    let address = &inner.config.address;
    let stream = TcpStream::connect(address)
        .await
        .with_context(|| format!("connecting to {address}"))?;
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not set TCP_NODELAY: {e}");
    }

    inner.set_status(ConnectionStatus::Handshaking);
    let (read, write) = stream.into_split();
    let mut frames = FrameReader::new(read, inner.config.max_frame_bytes);

    let root = match inner.config.handshake_timeout() {
        Some(timeout) => tokio::time::timeout(timeout, await_ready(&mut frames))
            .await
            .map_err(|_| anyhow!("no ready message within {timeout:?}"))??,
        None => await_ready(&mut frames).await?,
    };

    let channel = RpcChannel::start_framed(
        format!("backend {address}"),
        frames,
        write,
        inner.config.channel_config(),
    );

    let root = root.with_default_methods(methods::CONTROL);
    let missing = root.missing_methods(methods::CONTROL);
    if !missing.is_empty() {
        warn!(
            "Backend root object does not advertise: {}",
            missing.join(", ")
        );
    }

    let control = ControlProxy::new(channel.proxy(root));
    inner.set_link(Link {
        channel: Arc::clone(&channel),
        control: control.clone(),
        assistant: None,
    });

    if !channel.is_closed() {
        inner.set_status(ConnectionStatus::Ready);
        info!("Control channel to backend at {address} ready");
    }

    tokio::spawn(resolve_assistant(
        Arc::clone(inner),
        Arc::clone(&channel),
        control,
    ));
    Ok(channel)
}

/// Cache the assistant for a fresh link. Best effort: a slow or failing
/// getter leaves the cache empty and [`BackendClient::assistant`] retries.
async fn resolve_assistant(
    inner: Arc<ClientInner>,
    channel: Arc<RpcChannel>,
    control: ControlProxy,
) {
    let lookup = async {
        match inner.config.handshake_timeout() {
            Some(timeout) => tokio::time::timeout(timeout, control.assistant())
                .await
                .unwrap_or_else(|_| {
                    Err(RpcError::DeadlineExceeded {
                        method: methods::ASSISTANT_GETTER.to_string(),
                        timeout,
                    })
                }),
            None => control.assistant().await,
        }
    };

    let result = tokio::select! {
        _ = channel.closed() => return,
        result = lookup => result,
    };
    match result {
        Ok(assistant) => inner.set_assistant(&channel, assistant),
        Err(e) => warn!("Could not resolve the assistant object: {e}"),
    }
}

/// Read frames until the engine announces its root object.
async fn await_ready<R>(frames: &mut FrameReader<R>) -> Result<ObjectRef>
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = frames
            .next_frame()
            .await
            .context("reading handshake")?
            .ok_or_else(|| anyhow!("backend closed the connection before the handshake"))?;

        match ControlMessage::ready_reference(&frame).context("malformed ready message")? {
            Some(root) => return Ok(root),
            None => debug!("Ignoring message before handshake: {frame}"),
        }
    }
}
