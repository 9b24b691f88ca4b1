//! Test utilities and common setup.
//!
//! [`FakeEngine`] listens on a loopback port and plays the engine side of the
//! control channel: it announces a root object on every accepted connection
//! and records what the front end asks of it.
#![allow(clippy::field_reassign_with_default)]
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use almond_cloud::api::{self, AppState};
use almond_cloud::auth::{AuthConfig, AuthState, Capability, DevUser, Role};
use almond_cloud::backend::{BackendClient, BackendConfig};
use almond_cloud::rpc::{ChannelConfig, RemoteHandle, RpcChannel, RpcError, RpcObject, arg};
use almond_protocol::engine::methods;
use almond_protocol::{ConversationOptions, ConversationUser, ObjectRef};
use async_trait::async_trait;
use axum::Router;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub const TEST_JWT_SECRET: &str = "test-secret-for-integration-tests-minimum-32-chars";

/// Everything the fake engine was asked to do.
#[derive(Default)]
pub struct EngineLog {
    pub apps: Mutex<Vec<Value>>,
    pub devices: Mutex<Vec<Value>>,
    pub added_devices: Mutex<Vec<Value>>,
    pub oauth_callbacks: Mutex<Vec<(String, String, Value)>>,
    pub opened: Mutex<Vec<(String, ConversationUser, ConversationOptions)>>,
    pub closed: Mutex<Vec<String>>,
    pub commands: Mutex<Vec<(String, String)>>,
    pub outputs: Mutex<Vec<RemoteHandle>>,
    pub removed_outputs: Mutex<Vec<ObjectRef>>,
    pub channels: Mutex<Vec<Arc<RpcChannel>>>,
}

impl EngineLog {
    pub fn opened_ids(&self) -> Vec<String> {
        self.opened
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _, _)| id.clone())
            .collect()
    }

    pub fn closed_ids(&self) -> Vec<String> {
        self.closed.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<(String, String)> {
        self.commands.lock().unwrap().clone()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.lock().unwrap().len()
    }

    pub fn connection_count(&self) -> usize {
        self.channels.lock().unwrap().len()
    }
}

/// Root object announced in the handshake.
struct FakeControl {
    log: Arc<EngineLog>,
    assistant: Arc<FakeAssistant>,
}

#[async_trait]
impl RpcObject for FakeControl {
    fn methods(&self) -> &'static [&'static str] {
        methods::CONTROL
    }

    async fn invoke(
        &self,
        channel: &Arc<RpcChannel>,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, RpcError> {
        match method {
            "assistant" => Ok(channel.publish(self.assistant.clone()).to_value()),
            "getAllApps" => Ok(Value::Array(self.log.apps.lock().unwrap().clone())),
            "getApp" => {
                let id: String = arg(method, &args, 0)?;
                let apps = self.log.apps.lock().unwrap();
                Ok(apps
                    .iter()
                    .find(|app| app["uniqueId"] == id.as_str())
                    .cloned()
                    .unwrap_or(Value::Null))
            }
            "deleteApp" => {
                let id: String = arg(method, &args, 0)?;
                let mut apps = self.log.apps.lock().unwrap();
                let before = apps.len();
                apps.retain(|app| app["uniqueId"] != id.as_str());
                Ok(json!(apps.len() != before))
            }
            "getAllDevices" => Ok(Value::Array(self.log.devices.lock().unwrap().clone())),
            "addDevice" => {
                self.log
                    .added_devices
                    .lock()
                    .unwrap()
                    .push(args.into_iter().next().unwrap_or(Value::Null));
                Ok(Value::Null)
            }
            "deleteDevice" => {
                let id: String = arg(method, &args, 0)?;
                let mut devices = self.log.devices.lock().unwrap();
                let before = devices.len();
                devices.retain(|device| device["uniqueId"] != id.as_str());
                Ok(json!(devices.len() != before))
            }
            "startOAuth2" => {
                let kind: String = arg(method, &args, 0)?;
                Ok(json!([
                    true,
                    format!("https://auth.example.com/authorize?kind={kind}"),
                    {"oauth2-state": kind}
                ]))
            }
            "handleOAuth2Callback" => {
                let kind: String = arg(method, &args, 0)?;
                let redirect: String = arg(method, &args, 1)?;
                let session: Value = arg(method, &args, 2)?;
                self.log
                    .oauth_callbacks
                    .lock()
                    .unwrap()
                    .push((kind, redirect, session));
                Ok(Value::Null)
            }
            other => Err(RpcError::MethodNotFound(other.to_string())),
        }
    }
}

struct FakeAssistant {
    log: Arc<EngineLog>,
}

#[async_trait]
impl RpcObject for FakeAssistant {
    fn methods(&self) -> &'static [&'static str] {
        methods::ASSISTANT
    }

    async fn invoke(
        &self,
        channel: &Arc<RpcChannel>,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, RpcError> {
        match method {
            "openConversation" => {
                let id: String = arg(method, &args, 0)?;
                let user: ConversationUser = arg(method, &args, 1)?;
                let delegate: ObjectRef = arg(method, &args, 2)?;
                let options: Option<ConversationOptions> = arg(method, &args, 3)?;
                let options = options.unwrap_or_default();
                self.log
                    .opened
                    .lock()
                    .unwrap()
                    .push((id.clone(), user, options.clone()));

                let conversation = FakeConversation {
                    id,
                    options,
                    delegate: channel.proxy(delegate),
                    log: Arc::clone(&self.log),
                };
                Ok(channel.publish(Arc::new(conversation)).to_value())
            }
            "closeConversation" => {
                let id: String = arg(method, &args, 0)?;
                self.log.closed.lock().unwrap().push(id);
                Ok(Value::Null)
            }
            "addOutput" => {
                let output = channel.proxy_value(args.first().unwrap_or(&Value::Null))?;
                self.log.outputs.lock().unwrap().push(output);
                Ok(Value::Null)
            }
            "removeOutput" => {
                let output: ObjectRef = arg(method, &args, 0)?;
                self.log
                    .outputs
                    .lock()
                    .unwrap()
                    .retain(|handle| handle.reference().id != output.id);
                self.log.removed_outputs.lock().unwrap().push(output);
                Ok(Value::Null)
            }
            "createApp" => {
                let params: Value = arg(method, &args, 0)?;
                if params["code"] == "bad" {
                    Ok(json!({"error": "Syntax error at line 1"}))
                } else {
                    Ok(json!({"uniqueId": "app-new", "description": "a new app"}))
                }
            }
            "parse" => {
                let sentence: String = arg(method, &args, 0)?;
                Ok(json!({"sentence": sentence, "candidates": []}))
            }
            other => Err(RpcError::MethodNotFound(other.to_string())),
        }
    }
}

struct FakeConversation {
    id: String,
    options: ConversationOptions,
    delegate: RemoteHandle,
    log: Arc<EngineLog>,
}

impl FakeConversation {
    async fn say(&self, text: String) -> Result<Value, RpcError> {
        self.delegate.call("send", vec![json!(text)]).await
    }
}

#[async_trait]
impl RpcObject for FakeConversation {
    fn methods(&self) -> &'static [&'static str] {
        methods::CONVERSATION
    }

    async fn invoke(
        &self,
        _channel: &Arc<RpcChannel>,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, RpcError> {
        match method {
            "start" => {
                if self.options.show_welcome {
                    self.say("Welcome back!".to_string()).await?;
                }
                Ok(Value::Null)
            }
            "handleCommand" => {
                let text: String = arg(method, &args, 0)?;
                self.log
                    .commands
                    .lock()
                    .unwrap()
                    .push((self.id.clone(), text.clone()));
                if text == "fail" {
                    return Err(RpcError::remote("Sorry, I did not understand that"));
                }
                if self.delegate.reference().advertises(methods::ACTIVE) {
                    self.delegate.call(methods::ACTIVE, vec![]).await?;
                }
                if text == "choices" {
                    self.delegate
                        .call(
                            "sendChoice",
                            vec![json!(0), json!("ignored"), json!("Yes"), json!("yes")],
                        )
                        .await?;
                    return Ok(Value::Null);
                }
                self.say(format!("Hello! You said {text}")).await?;
                Ok(Value::Null)
            }
            "handleParsedCommand" => {
                let parsed: Value = arg(method, &args, 0)?;
                self.log
                    .commands
                    .lock()
                    .unwrap()
                    .push((self.id.clone(), parsed.to_string()));
                self.say(format!("parsed {parsed}")).await?;
                Ok(Value::Null)
            }
            "handleThingTalk" => {
                let code: String = arg(method, &args, 0)?;
                self.log
                    .commands
                    .lock()
                    .unwrap()
                    .push((self.id.clone(), code.clone()));
                self.say(format!("running {code}")).await?;
                Ok(Value::Null)
            }
            "notify" => {
                let text = args
                    .iter()
                    .map(Value::to_string)
                    .collect::<Vec<_>>()
                    .join(" ");
                self.say(format!("notification: {text}")).await?;
                Ok(Value::Null)
            }
            "notifyError" => Err(RpcError::remote("cannot show errors")),
            other => Err(RpcError::MethodNotFound(other.to_string())),
        }
    }
}

/// Engine stand-in on a loopback TCP port.
pub struct FakeEngine {
    pub addr: SocketAddr,
    pub log: Arc<EngineLog>,
    task: JoinHandle<()>,
}

impl FakeEngine {
    /// Listen on an ephemeral port.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self::serve(listener)
    }

    /// Listen on a specific address, e.g. to come back where a client is
    /// already trying to reconnect.
    pub async fn start_on(addr: SocketAddr) -> Self {
        let listener = TcpListener::bind(addr).await.unwrap();
        Self::serve(listener)
    }

    fn serve(listener: TcpListener) -> Self {
        let addr = listener.local_addr().unwrap();
        let log = Arc::new(EngineLog::default());
        let accept_log = Arc::clone(&log);

        let task = tokio::spawn(async move {
            let mut seq = 0;
            while let Ok((stream, _)) = listener.accept().await {
                seq += 1;
                let (reader, writer) = stream.into_split();
                let channel = RpcChannel::start(
                    format!("engine-{seq}"),
                    reader,
                    writer,
                    ChannelConfig::default(),
                );
                let root = channel.publish(Arc::new(FakeControl {
                    log: Arc::clone(&accept_log),
                    assistant: Arc::new(FakeAssistant {
                        log: Arc::clone(&accept_log),
                    }),
                }));
                if channel.announce_ready(&root).await.is_ok() {
                    accept_log.channels.lock().unwrap().push(channel);
                }
            }
        });

        Self { addr, log, task }
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    /// Sever every connection, as if the engine process died, and stop
    /// accepting new ones.
    pub async fn shutdown(self) {
        self.task.abort();
        self.drop_connections().await;
    }

    /// Close every connection but keep listening.
    pub async fn drop_connections(&self) {
        let channels: Vec<_> = self.log.channels.lock().unwrap().drain(..).collect();
        for channel in channels {
            channel.close().await;
        }
    }

    /// Push a result to every subscribed results socket.
    pub async fn push_result(&self, text: &str) -> Vec<Result<Value, RpcError>> {
        let outputs: Vec<_> = self.log.outputs.lock().unwrap().clone();
        let mut results = Vec::new();
        for output in outputs {
            results.push(output.call("send", vec![json!(text)]).await);
        }
        results
    }
}

impl Drop for FakeEngine {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Backend config pointed at `address` with short timings for tests.
pub fn fast_backend_config(address: impl Into<String>) -> BackendConfig {
    let mut config = BackendConfig::with_address(address);
    config.reconnect_delay_ms = 50;
    config.handshake_timeout_ms = Some(2_000);
    config.call_timeout_ms = Some(5_000);
    config
}

/// Client connected to `engine`, already past the handshake.
pub async fn connected_client(engine: &FakeEngine) -> BackendClient {
    let client = BackendClient::new(fast_backend_config(engine.address()));
    client.start();
    assert!(
        client.wait_ready(Duration::from_secs(5)).await,
        "client never became ready"
    );
    client
}

fn dev_user(id: &str, name: &str, roles: Vec<Role>, caps: Capability) -> DevUser {
    DevUser {
        id: id.to_string(),
        name: name.to_string(),
        email: Some(format!("{id}@localhost")),
        roles,
        caps,
    }
}

/// Create a test AuthConfig with dev users and a JWT secret.
pub fn test_auth_config() -> AuthConfig {
    let mut config = AuthConfig::default();
    config.dev_mode = true;
    config.dev_users = vec![
        dev_user(
            "root",
            "Root",
            vec![Role::SystemAdministrator],
            Capability::empty(),
        ),
        dev_user("alice", "Alice", vec![Role::User], Capability::empty()),
        dev_user(
            "devices",
            "Device Manager",
            vec![Role::User],
            Capability::MANAGE_DEVICES,
        ),
    ];
    config.jwt_secret = Some(TEST_JWT_SECRET.to_string());
    config
}

pub fn test_state(backend: BackendClient) -> AppState {
    AppState::new(backend, AuthState::new(test_auth_config()))
}

/// Router mounted under `/api`, as the binary serves it.
pub fn test_app(state: AppState) -> Router {
    Router::new().nest("/api", api::create_router(state))
}

/// Serve `app` on an ephemeral port.
pub async fn spawn_server(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Poll `check` until it holds or a few seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

pub fn app_fixture(id: &str) -> Value {
    json!({"uniqueId": id, "slots": {}, "icon": "com.example.weather"})
}

pub fn device_fixture(id: &str, thing_engine: bool) -> Value {
    json!({
        "uniqueId": id,
        "name": id,
        "kind": "com.example.thermostat",
        "isThingEngine": thing_engine,
    })
}

pub fn conversations_by_id(log: &EngineLog) -> HashMap<String, ConversationUser> {
    log.opened
        .lock()
        .unwrap()
        .iter()
        .map(|(id, user, _)| (id.clone(), user.clone()))
        .collect()
}
