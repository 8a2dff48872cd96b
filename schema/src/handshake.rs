//! Lifecycle messages a script child prints on stdout, one JSON object per line

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Typed handshake message from a supervised child
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HandshakeMessage {
    /// The child finished initialising and accepts work
    Ready,
    /// The child is about to exit on its own accord
    Shutdown,
    /// The child hit an unrecoverable error
    Error {
        /// Human-readable reason
        reason: String,
    },
}

/// Legacy model-service status line: `{"type":"health_result","status":"ready"}`
#[derive(Deserialize)]
struct HealthResultLine {
    #[serde(rename = "type")]
    kind: String,
    status: Option<String>,
}

impl HandshakeMessage {
    /// Parse one stdout line; returns `None` for ordinary log output
    pub fn parse_line(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            return None;
        }
        if let Ok(msg) = serde_json::from_str::<HandshakeMessage>(trimmed) {
            return Some(msg);
        }
        match serde_json::from_str::<HealthResultLine>(trimmed) {
            Ok(HealthResultLine { kind, status }) if kind == "health_result" => {
                (status.as_deref() == Some("ready")).then_some(HandshakeMessage::Ready)
            }
            _ => None,
        }
    }
}
