//! Control-channel envelope types.
//!
//! Both peers of a control channel are symmetric: either side can publish
//! objects and call methods on objects published by the other side. Object
//! ids are allocated by the publishing side and are only meaningful to it, so
//! a `call` always targets the receiver's object table and a reference found
//! inside arguments always names an object published by the sender.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Stable error codes carried in [`RemoteError::code`].
pub mod error_codes {
    /// No control channel is established.
    pub const BACKEND_UNAVAILABLE: &str = "ENXIO";
    /// The target object was released or never existed.
    pub const OBJECT_NOT_FOUND: &str = "E_OBJECT_NOT_FOUND";
    /// The target object does not expose the requested method.
    pub const METHOD_NOT_FOUND: &str = "E_METHOD_NOT_FOUND";
    /// The arguments could not be decoded for the requested method.
    pub const INVALID_ARGS: &str = "E_INVALID_ARGS";
    /// The channel closed before the call completed.
    pub const CHANNEL_CLOSED: &str = "E_CHANNEL_CLOSED";
    /// The call did not complete within the configured deadline.
    pub const TIMEOUT: &str = "ETIMEDOUT";
    /// A local delegate failed to push an event to its socket.
    pub const DELEGATE_FAILED: &str = "E_DELEGATE";
    /// Too many calls are outstanding on the channel.
    pub const RESOURCE_EXHAUSTED: &str = "E_RESOURCE_EXHAUSTED";
    /// Anything else.
    pub const INTERNAL: &str = "E_INTERNAL";
}

// ============================================================================
// Object references
// ============================================================================

/// Identifier of a published object, unique within one channel's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub String);

impl ObjectId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ObjectId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<u64> for ObjectId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

/// A capability to call methods on an object living on the other side.
///
/// Serialized as `{"$rpcId": "<id>", "$methods": ["..."]}` wherever it
/// appears inside a message. A bare id (string or number) is also accepted
/// on input; such a reference does not advertise its methods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectRef {
    #[serde(rename = "$rpcId")]
    pub id: ObjectId,
    #[serde(rename = "$methods", default, skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,
}

impl ObjectRef {
    pub fn new(id: impl Into<ObjectId>, methods: &[&str]) -> Self {
        Self {
            id: id.into(),
            methods: methods.iter().map(|m| (*m).to_string()).collect(),
        }
    }

    /// Whether `method` may be called on this reference.
    ///
    /// A reference without a method list advertises nothing and permits
    /// everything; the peer rejects unknown methods itself.
    pub fn advertises(&self, method: &str) -> bool {
        self.methods.is_empty() || self.methods.iter().any(|m| m == method)
    }

    /// Fill in the method list for a bare reference.
    pub fn with_default_methods(mut self, methods: &[&str]) -> Self {
        if self.methods.is_empty() {
            self.methods = methods.iter().map(|m| (*m).to_string()).collect();
        }
        self
    }

    /// Methods from `expected` this reference does not advertise.
    pub fn missing_methods<'a>(&self, expected: &[&'a str]) -> Vec<&'a str> {
        expected
            .iter()
            .copied()
            .filter(|m| !self.advertises(m))
            .collect()
    }

    /// Extract a reference from a JSON value if it is one.
    ///
    /// Only the object form is recognized here, a plain string is never
    /// mistaken for a reference.
    pub fn from_value(value: &Value) -> Option<Self> {
        if value.get("$rpcId").is_none() {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }

    pub fn to_value(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert("$rpcId".to_string(), Value::String(self.id.0.clone()));
        if !self.methods.is_empty() {
            map.insert(
                "$methods".to_string(),
                Value::Array(self.methods.iter().cloned().map(Value::String).collect()),
            );
        }
        Value::Object(map)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(u64),
}

impl From<RawId> for ObjectId {
    fn from(raw: RawId) -> Self {
        match raw {
            RawId::Text(s) => ObjectId(s),
            RawId::Number(n) => ObjectId(n.to_string()),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawRef {
    Full {
        #[serde(rename = "$rpcId")]
        id: RawId,
        #[serde(rename = "$methods", default)]
        methods: Vec<String>,
    },
    Bare(RawId),
}

impl<'de> Deserialize<'de> for ObjectRef {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match RawRef::deserialize(deserializer)? {
            RawRef::Full { id, methods } => ObjectRef {
                id: id.into(),
                methods,
            },
            RawRef::Bare(id) => ObjectRef {
                id: id.into(),
                methods: Vec::new(),
            },
        })
    }
}

// ============================================================================
// Handshake
// ============================================================================

/// Out-of-band control messages, tagged by the `control` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "control", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Sent once by the engine after accepting the connection.
    Ready {
        #[serde(rename = "rpcId")]
        rpc_id: ObjectRef,
    },
}

impl ControlMessage {
    /// Inspect a frame received before the handshake completed.
    ///
    /// Returns `Ok(None)` for anything that is not a ready message and an
    /// error for a ready message whose root reference is malformed.
    pub fn ready_reference(frame: &Value) -> Result<Option<ObjectRef>, serde_json::Error> {
        if frame.get("control").and_then(Value::as_str) != Some("ready") {
            return Ok(None);
        }
        match serde_json::from_value::<ControlMessage>(frame.clone())? {
            ControlMessage::Ready { rpc_id } => Ok(Some(rpc_id)),
        }
    }
}

// ============================================================================
// Call envelope
// ============================================================================

/// Error payload of a failed call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Generic call/response envelope, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcMessage {
    /// Invoke `method` on the receiver's object `obj`.
    Call {
        id: u64,
        obj: ObjectId,
        method: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    /// Successful completion of call `id`.
    #[serde(rename = "result")]
    Reply {
        id: u64,
        #[serde(default)]
        value: Value,
    },
    /// Failed completion of call `id`.
    #[serde(rename = "error")]
    Fault { id: u64, error: RemoteError },
    /// The sender no longer needs the receiver's object `obj`.
    Free { obj: ObjectId },
}
