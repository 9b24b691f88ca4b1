//! Browser-facing conversation socket messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Events pushed to the browser, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        icon: Option<String>,
    },
    Picture {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        icon: Option<String>,
    },
    Rdl {
        rdl: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        icon: Option<String>,
    },
    Choice {
        idx: i64,
        title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    Button {
        title: String,
        json: Value,
    },
    Link {
        title: String,
        url: String,
    },
    AskSpecial {
        ask: Option<String>,
    },
    /// A command from the browser could not be handled.
    Error {
        error: String,
    },
}

/// Commands sent by the browser, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientCommand {
    /// Free-form natural language.
    Command { text: String },
    /// An already parsed command.
    Parsed { json: Value },
    /// Raw ThingTalk source.
    Tt { code: String },
}

/// Why a browser frame could not be turned into a [`ClientCommand`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandParseError {
    /// Not JSON, or missing a field required by its type.
    #[error("Malformed command: {0}")]
    Malformed(String),
    /// The `type` field names no known command.
    #[error("Invalid command type {0}")]
    InvalidType(String),
}

impl ClientCommand {
    const TYPES: [&'static str; 3] = ["command", "parsed", "tt"];

    /// Parse one text frame from the browser.
    pub fn parse(text: &str) -> Result<Self, CommandParseError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| CommandParseError::Malformed(e.to_string()))?;

        let kind = match value.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            Some(other) => other.to_string(),
            None => "undefined".to_string(),
        };
        if !Self::TYPES.contains(&kind.as_str()) {
            return Err(CommandParseError::InvalidType(kind));
        }

        serde_json::from_value(value).map_err(|e| CommandParseError::Malformed(e.to_string()))
    }
}
