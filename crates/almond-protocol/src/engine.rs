//! Remote surface exported by the engine process.
//!
//! The method lists are the static contract agreed with the engine binary.
//! Data shapes use the engine's camelCase field names.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Method names, grouped by the object that exposes them.
pub mod methods {
    /// Getter on the root object returning the assistant reference.
    pub const ASSISTANT_GETTER: &str = "assistant";

    /// Root control object.
    pub const CONTROL: &[&str] = &[
        ASSISTANT_GETTER,
        "getAllApps",
        "getApp",
        "deleteApp",
        "getAllDevices",
        "addDevice",
        "deleteDevice",
        "startOAuth2",
        "handleOAuth2Callback",
    ];

    /// Assistant object reached through the root.
    pub const ASSISTANT: &[&str] = &[
        "openConversation",
        "closeConversation",
        "parse",
        "createApp",
        "addOutput",
        "removeOutput",
    ];

    /// One remote conversation.
    pub const CONVERSATION: &[&str] = &[
        "start",
        "handleCommand",
        "handleParsedCommand",
        "handleThingTalk",
        "notify",
        "notifyError",
    ];

    /// Chat delegate published by the front end for one browser socket.
    pub const ASSISTANT_DELEGATE: &[&str] = &[
        "send",
        "sendPicture",
        "sendRDL",
        "sendChoice",
        "sendButton",
        "sendLink",
        "sendAskSpecial",
    ];

    /// Event raised by a conversation when it becomes the active one.
    pub const ACTIVE: &str = "active";

    /// Delegate the session manager publishes in front of a chat delegate.
    pub const SESSION_DELEGATE: &[&str] = &[
        "send",
        "sendPicture",
        "sendRDL",
        "sendChoice",
        "sendButton",
        "sendLink",
        "sendAskSpecial",
        ACTIVE,
    ];

    /// Results delegate published for one results socket.
    pub const RESULTS_DELEGATE: &[&str] = &["send"];
}

/// Description of an installed app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInfo {
    pub unique_id: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub slots: Value,
    #[serde(default)]
    pub icon: Option<String>,
}

/// Description of a configured device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub unique_id: String,
    #[serde(default = "unknown_device_name")]
    pub name: String,
    #[serde(default = "unknown_device_description")]
    pub description: String,
    pub kind: String,
    #[serde(default)]
    pub owner_tier: Option<String>,
    #[serde(default)]
    pub available: Option<i64>,
    #[serde(default)]
    pub is_transient: bool,
    #[serde(default)]
    pub is_online_account: bool,
    #[serde(default)]
    pub is_data_source: bool,
    #[serde(default)]
    pub is_physical: bool,
    #[serde(default)]
    pub is_thing_engine: bool,
}

fn unknown_device_name() -> String {
    "Unknown device".to_string()
}

fn unknown_device_description() -> String {
    "Description not available".to_string()
}

/// Result of starting an OAuth2 device configuration.
///
/// The engine answers with a `[ok, redirect, session]` triple; the front end
/// re-exposes it as an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "(bool, String, Value)")]
pub struct OAuth2Start {
    pub ok: bool,
    pub redirect: String,
    pub session: Value,
}

impl From<(bool, String, Value)> for OAuth2Start {
    fn from((ok, redirect, session): (bool, String, Value)) -> Self {
        Self {
            ok,
            redirect,
            session,
        }
    }
}

/// Identity handed to the engine when a conversation is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationUser {
    pub id: String,
    pub name: String,
    pub principal: String,
    pub is_owner: bool,
}

impl ConversationUser {
    pub fn new(id: impl Into<String>, name: impl Into<String>, is_owner: bool) -> Self {
        let id = id.into();
        Self {
            principal: format!("user:{id}"),
            name: name.into(),
            id,
            is_owner,
        }
    }
}

/// Options for a newly opened conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationOptions {
    #[serde(default)]
    pub show_welcome: bool,
}
