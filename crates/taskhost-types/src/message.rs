//! IPC protocol between the supervisor and worker processes.
//!
//! Messages are JSON objects of the shape `{"action": ..., "payload": ...}`,
//! one per line. The parent writes [`WorkerMessage`]s to the child's stdin;
//! the child answers with [`WorkerEvent`]s on stdout.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::IpcError;
use crate::identity::Identity;

/// Parent -> child control message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload", rename_all = "camelCase")]
pub enum WorkerMessage {
    /// Load a handler module and start a task worker for it.
    Create(CreatePayload),
    /// Tear down the running task worker and create it again from new code.
    Restart(RestartPayload),
    /// Swap the identity on the running task worker.
    UpdateIdentity(UpdateIdentityPayload),
}

impl WorkerMessage {
    /// Short action name, for logging.
    pub fn action(&self) -> &'static str {
        match self {
            WorkerMessage::Create(_) => "create",
            WorkerMessage::Restart(_) => "restart",
            WorkerMessage::UpdateIdentity(_) => "updateIdentity",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePayload {
    pub topic: String,
    pub identity: Identity,
    /// Bundled handler module text.
    pub module_text: String,
    /// Original handler entry file; used for stack traces.
    pub source_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartPayload {
    pub topic: String,
    pub identity: Identity,
    pub module_text: String,
    pub source_path: PathBuf,
}

impl From<RestartPayload> for CreatePayload {
    fn from(p: RestartPayload) -> Self {
        Self {
            topic: p.topic,
            identity: p.identity,
            module_text: p.module_text,
            source_path: p.source_path,
            worker_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateIdentityPayload {
    pub identity: Identity,
}

/// Child -> parent notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload", rename_all = "camelCase")]
pub enum WorkerEvent {
    /// The task worker for a `create` (or `restart`) message is running.
    CreateCompleted,
}

/// Encode a message as a single JSON line (including the trailing newline).
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, IpcError> {
    let mut line = serde_json::to_string(message).map_err(IpcError::Encode)?;
    line.push('\n');
    Ok(line)
}

/// Decode one JSON line into a message.
pub fn decode_line<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T, IpcError> {
    serde_json::from_str(line.trim()).map_err(IpcError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_create() -> WorkerMessage {
        WorkerMessage::Create(CreatePayload {
            topic: "billing".to_string(),
            identity: Identity::new("tok", "user-1"),
            module_text: "module.exports = {}".to_string(),
            source_path: PathBuf::from("app/billing/external_task.ts"),
            worker_id: None,
        })
    }

    #[test]
    fn test_create_wire_shape() {
        let json = serde_json::to_value(sample_create()).unwrap();
        assert_eq!(json["action"], "create");
        assert_eq!(json["payload"]["topic"], "billing");
        assert_eq!(json["payload"]["identity"]["userId"], "user-1");
        assert_eq!(json["payload"]["moduleText"], "module.exports = {}");
        assert_eq!(json["payload"]["sourcePath"], "app/billing/external_task.ts");
        assert!(json["payload"].get("workerId").is_none());
    }

    #[test]
    fn test_update_identity_wire_shape() {
        let msg = WorkerMessage::UpdateIdentity(UpdateIdentityPayload {
            identity: Identity::new("tok2", "user-2"),
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["action"], "updateIdentity");
        assert_eq!(json["payload"]["identity"]["token"], "tok2");
        assert_eq!(msg.action(), "updateIdentity");
    }

    #[test]
    fn test_create_completed_has_no_payload() {
        let line = encode_line(&WorkerEvent::CreateCompleted).unwrap();
        assert_eq!(line, "{\"action\":\"createCompleted\"}\n");

        let parsed: WorkerEvent = decode_line(&line).unwrap();
        assert_eq!(parsed, WorkerEvent::CreateCompleted);
    }

    #[test]
    fn test_decode_restart_from_line() {
        let line = r#"{"action":"restart","payload":{"topic":"t","identity":{"token":"a","userId":"b"},"moduleText":"x","sourcePath":"/src/external_task.js"}}"#;
        let msg: WorkerMessage = decode_line(line).unwrap();
        match msg {
            WorkerMessage::Restart(p) => {
                assert_eq!(p.topic, "t");
                assert_eq!(p.source_path, PathBuf::from("/src/external_task.js"));
            }
            other => panic!("expected restart, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_unknown_action_fails() {
        let result: Result<WorkerMessage, _> = decode_line(r#"{"action":"explode"}"#);
        assert!(matches!(result, Err(IpcError::Decode(_))));
    }

    #[test]
    fn test_encoded_line_is_single_line() {
        let line = encode_line(&sample_create()).unwrap();
        assert_eq!(line.matches('\n').count(), 1);
        assert!(line.ends_with('\n'));
    }
}
