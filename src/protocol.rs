//! Worker Wire Protocol
//!
//! Message types exchanged with the opaque transcoding executable. The
//! executable's internals are a black box; this module only fixes the shape
//! of the conversation: one outbound `run` command per job, and a stream of
//! inbound lifecycle messages per worker.
//!
//! Byte buffers are base64 strings on the wire so that the protocol can be
//! carried over a plain JSON-lines stdio transport.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

// =============================================================================
// Byte Buffers
// =============================================================================

/// Named input buffer handed to a worker as part of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputBuffer {
    pub name: String,
    #[serde(with = "b64")]
    pub bytes: Vec<u8>,
}

/// Named output buffer reported by a worker when a job completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputArtifact {
    pub name: String,
    #[serde(with = "b64")]
    pub bytes: Vec<u8>,
}

// =============================================================================
// Outbound: Coordinator -> Worker
// =============================================================================

/// Command descriptor posted to a worker unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCommand {
    /// Always `"run"` in the current protocol.
    pub operation: String,
    /// Ordered command-line style arguments.
    pub arguments: Vec<String>,
    /// Input buffers mounted for the worker before execution.
    pub inputs: Vec<InputBuffer>,
}

impl RunCommand {
    pub fn run(arguments: Vec<String>, inputs: Vec<InputBuffer>) -> Self {
        Self {
            operation: "run".to_string(),
            arguments,
            inputs,
        }
    }
}

// =============================================================================
// Inbound: Worker -> Coordinator
// =============================================================================

/// Lifecycle message emitted by a worker unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerMessage {
    /// Warmup complete; the unit can accept jobs.
    Ready,
    /// The unit has started executing a job.
    Run,
    /// Diagnostic text. Logged, never surfaced as a result or error.
    Stdout { data: String },
    /// Diagnostic text. Logged, never surfaced as a result or error.
    Stderr { data: String },
    /// Job completed with the listed output artifacts.
    Done { outputs: Vec<OutputArtifact> },
    /// The unit is free again.
    Exit,
}

// =============================================================================
// Base64 field encoding
// =============================================================================

mod b64 {
    use super::*;
    use serde::{de::Error as _, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_command_serializes_with_lowercase_operation() {
        let command = RunCommand::run(
            vec!["-i".to_string(), "in.mp4".to_string()],
            vec![InputBuffer {
                name: "in.mp4".to_string(),
                bytes: vec![1, 2, 3],
            }],
        );

        let json = serde_json::to_value(&command).unwrap();
        assert_eq!(json["operation"], "run");
        assert_eq!(json["arguments"][0], "-i");
        assert_eq!(json["inputs"][0]["name"], "in.mp4");
        // 0x010203 in base64
        assert_eq!(json["inputs"][0]["bytes"], "AQID");
    }

    #[test]
    fn worker_messages_round_trip_through_lowercase_tags() {
        let parsed: WorkerMessage = serde_json::from_str(r#"{"type":"ready"}"#).unwrap();
        assert_eq!(parsed, WorkerMessage::Ready);

        let parsed: WorkerMessage =
            serde_json::from_str(r#"{"type":"stderr","data":"frame=1"}"#).unwrap();
        assert_eq!(
            parsed,
            WorkerMessage::Stderr {
                data: "frame=1".to_string()
            }
        );

        let done = WorkerMessage::Done {
            outputs: vec![OutputArtifact {
                name: "clip.jpg".to_string(),
                bytes: vec![0xff],
            }],
        };
        let json = serde_json::to_string(&done).unwrap();
        assert!(json.contains(r#""type":"done""#));
        assert_eq!(serde_json::from_str::<WorkerMessage>(&json).unwrap(), done);
    }

    #[test]
    fn unknown_message_types_are_rejected() {
        assert!(serde_json::from_str::<WorkerMessage>(r#"{"type":"reboot"}"#).is_err());
    }
}
