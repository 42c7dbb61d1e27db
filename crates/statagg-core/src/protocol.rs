use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

/// Messages a peer (agent or observer) may send to the relay.
///
/// The wire discriminator is a `type` string; anything with a well-formed
/// `type` the relay does not know decodes to `Unrecognized` so the dispatcher
/// can log it without dropping the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Register(RegisterPayload),
    Metrics(MetricsReport),
    Subscribe,
    Command(CommandRequest),
    Unrecognized { raw_type: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    pub agent_id: String,
}

/// A telemetry snapshot as reported by an agent. The metric sub-structures
/// are opaque to the relay; it stores and forwards them without inspecting
/// their fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsReport {
    pub agent_id: String,
    #[serde(default)]
    pub cpu: Value,
    #[serde(default)]
    pub gpu: Value,
    #[serde(default)]
    pub memory: Value,
    #[serde(default)]
    pub temps: Value,
    #[serde(default)]
    pub timestamp: Value,
}

impl MetricsReport {
    /// The fixed subset of fields relayed to observers. Extra keys an agent
    /// may have included in the report never pass through.
    pub fn envelope(&self) -> MetricsEnvelope {
        MetricsEnvelope {
            cpu: self.cpu.clone(),
            gpu: self.gpu.clone(),
            memory: self.memory.clone(),
            temps: self.temps.clone(),
            timestamp: self.timestamp.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsEnvelope {
    pub cpu: Value,
    pub gpu: Value,
    pub memory: Value,
    pub temps: Value,
    pub timestamp: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    pub agent_id: String,
    pub command: Value,
}

/// One line of the roster sent to a freshly subscribed observer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentSummary {
    pub agent_id: String,
    pub last_seen: i64,
    pub has_metrics: bool,
}

/// Messages the relay sends back to peers.
///
/// `registration_confirmed` carries an RFC 3339 timestamp; the connection
/// events and command delivery carry Unix milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum RelayMessage {
    RegistrationConfirmed {
        agent_id: String,
        timestamp: String,
    },
    AgentConnected {
        agent_id: String,
        timestamp: i64,
    },
    AgentDisconnected {
        agent_id: String,
        timestamp: i64,
    },
    AgentList {
        agents: Vec<AgentSummary>,
    },
    MetricsUpdate {
        agent_id: String,
        metrics: MetricsEnvelope,
    },
    Command {
        command: Value,
        timestamp: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("invalid message syntax: {0}")]
    Syntax(String),
    #[error("message missing type field")]
    MissingType,
    #[error("malformed {kind} payload: {detail}")]
    Payload { kind: &'static str, detail: String },
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
}

pub fn encode_message<T: Serialize>(
    value: &T,
    max_frame_bytes: usize,
) -> Result<Vec<u8>, CodecError> {
    let encoded = serde_json::to_vec(value).map_err(|err| CodecError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(CodecError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_client_message(
    bytes: &[u8],
    max_frame_bytes: usize,
) -> Result<ClientMessage, CodecError> {
    if bytes.len() > max_frame_bytes {
        return Err(CodecError::OversizedFrame {
            size: bytes.len(),
            max: max_frame_bytes,
        });
    }
    let value: Value =
        serde_json::from_slice(bytes).map_err(|err| CodecError::Syntax(err.to_string()))?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(CodecError::MissingType)?
        .to_string();
    match kind.as_str() {
        "register" => decode_payload(value, "register").map(ClientMessage::Register),
        "metrics" => decode_payload(value, "metrics").map(ClientMessage::Metrics),
        // The original web client sends a stray agentId here; tolerate and
        // ignore any extra fields.
        "client_subscribe" => Ok(ClientMessage::Subscribe),
        "command" => decode_payload(value, "command").map(ClientMessage::Command),
        _ => Ok(ClientMessage::Unrecognized { raw_type: kind }),
    }
}

fn decode_payload<T: serde::de::DeserializeOwned>(
    value: Value,
    kind: &'static str,
) -> Result<T, CodecError> {
    serde_json::from_value(value).map_err(|err| CodecError::Payload {
        kind,
        detail: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_register() {
        let msg = decode_client_message(
            br#"{"type":"register","agentId":"pi1"}"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("decode");
        assert_eq!(
            msg,
            ClientMessage::Register(RegisterPayload {
                agent_id: "pi1".to_string(),
            })
        );
    }

    #[test]
    fn decodes_metrics_with_opaque_sections() {
        let raw = json!({
            "type": "metrics",
            "agentId": "pi1",
            "timestamp": 1_707_335_222.5,
            "cpu": {"Avg_MHz": "1200", "PkgTmp": "48"},
            "gpu": {"available": false},
            "memory": {"used memory": "123456"},
            "temps": {"coretemp-isa-0000": {"Package id 0": 48.0}}
        });
        let msg = decode_client_message(
            &serde_json::to_vec(&raw).expect("encode"),
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("decode");
        let ClientMessage::Metrics(report) = msg else {
            panic!("expected metrics, got {msg:?}");
        };
        assert_eq!(report.agent_id, "pi1");
        assert_eq!(report.cpu["Avg_MHz"], "1200");
        assert_eq!(report.gpu["available"], false);
        assert_eq!(report.timestamp, json!(1_707_335_222.5));
    }

    #[test]
    fn metrics_sections_default_to_null_when_missing() {
        let msg = decode_client_message(
            br#"{"type":"metrics","agentId":"pi1"}"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("decode");
        let ClientMessage::Metrics(report) = msg else {
            panic!("expected metrics");
        };
        assert!(report.cpu.is_null());
        assert!(report.temps.is_null());
    }

    #[test]
    fn decodes_subscribe_and_ignores_extra_fields() {
        let msg = decode_client_message(
            br#"{"type":"client_subscribe","agentId":"webclient"}"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("decode");
        assert_eq!(msg, ClientMessage::Subscribe);
    }

    #[test]
    fn decodes_command() {
        let msg = decode_client_message(
            br#"{"type":"command","agentId":"pi1","command":"reboot"}"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("decode");
        assert_eq!(
            msg,
            ClientMessage::Command(CommandRequest {
                agent_id: "pi1".to_string(),
                command: json!("reboot"),
            })
        );
    }

    #[test]
    fn unknown_type_becomes_unrecognized() {
        let msg = decode_client_message(
            br#"{"type":"telepathy","agentId":"pi1"}"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("decode");
        assert_eq!(
            msg,
            ClientMessage::Unrecognized {
                raw_type: "telepathy".to_string(),
            }
        );
    }

    #[test]
    fn invalid_syntax_is_a_codec_error() {
        let result = decode_client_message(b"{\"type\":", DEFAULT_MAX_FRAME_BYTES);
        assert!(matches!(result, Err(CodecError::Syntax(_))));
    }

    #[test]
    fn missing_type_is_a_codec_error() {
        let result = decode_client_message(br#"{"agentId":"pi1"}"#, DEFAULT_MAX_FRAME_BYTES);
        assert_eq!(result, Err(CodecError::MissingType));
    }

    #[test]
    fn known_type_with_bad_payload_is_a_codec_error() {
        let result = decode_client_message(br#"{"type":"register"}"#, DEFAULT_MAX_FRAME_BYTES);
        assert!(matches!(
            result,
            Err(CodecError::Payload {
                kind: "register",
                ..
            })
        ));
    }

    #[test]
    fn oversized_frames_rejected_on_both_paths() {
        let blob = "x".repeat(2_000);
        let raw = format!(r#"{{"type":"register","agentId":"{blob}"}}"#);
        assert!(matches!(
            decode_client_message(raw.as_bytes(), 1_024),
            Err(CodecError::OversizedFrame { .. })
        ));

        let message = RelayMessage::MetricsUpdate {
            agent_id: "pi1".to_string(),
            metrics: MetricsEnvelope {
                cpu: json!({ "blob": blob }),
                gpu: Value::Null,
                memory: Value::Null,
                temps: Value::Null,
                timestamp: Value::Null,
            },
        };
        assert!(matches!(
            encode_message(&message, 64),
            Err(CodecError::OversizedFrame { .. })
        ));
    }

    #[test]
    fn outbound_messages_use_wire_field_names() {
        let ack = RelayMessage::RegistrationConfirmed {
            agent_id: "pi1".to_string(),
            timestamp: "2026-02-07T21:00:00+00:00".to_string(),
        };
        let value: Value = serde_json::from_slice(
            &encode_message(&ack, DEFAULT_MAX_FRAME_BYTES).expect("encode"),
        )
        .expect("parse");
        assert_eq!(value["type"], "registration_confirmed");
        assert_eq!(value["agentId"], "pi1");
        assert_eq!(value["timestamp"], "2026-02-07T21:00:00+00:00");

        let list = RelayMessage::AgentList {
            agents: vec![AgentSummary {
                agent_id: "pi1".to_string(),
                last_seen: 1_707_335_222_222,
                has_metrics: true,
            }],
        };
        let value: Value = serde_json::from_slice(
            &encode_message(&list, DEFAULT_MAX_FRAME_BYTES).expect("encode"),
        )
        .expect("parse");
        assert_eq!(value["type"], "agent_list");
        assert_eq!(value["agents"][0]["agentId"], "pi1");
        assert_eq!(value["agents"][0]["lastSeen"], 1_707_335_222_222_i64);
        assert_eq!(value["agents"][0]["hasMetrics"], true);

        let delivery = RelayMessage::Command {
            command: json!("reboot"),
            timestamp: 1_707_335_222_222,
        };
        let value: Value = serde_json::from_slice(
            &encode_message(&delivery, DEFAULT_MAX_FRAME_BYTES).expect("encode"),
        )
        .expect("parse");
        assert_eq!(value["type"], "command");
        assert_eq!(value["command"], "reboot");
    }

    #[test]
    fn metrics_update_envelope_carries_the_fixed_field_set() {
        let report = MetricsReport {
            agent_id: "pi1".to_string(),
            cpu: json!({"Avg_MHz": "1200"}),
            gpu: json!({"available": false}),
            memory: json!({"used memory": "123"}),
            temps: json!({}),
            timestamp: json!(1_707_335_222.5),
        };
        let update = RelayMessage::MetricsUpdate {
            agent_id: report.agent_id.clone(),
            metrics: report.envelope(),
        };
        let value: Value = serde_json::from_slice(
            &encode_message(&update, DEFAULT_MAX_FRAME_BYTES).expect("encode"),
        )
        .expect("parse");
        assert_eq!(value["type"], "metrics_update");
        assert_eq!(value["agentId"], "pi1");
        let metrics = value["metrics"].as_object().expect("metrics object");
        let mut keys = metrics.keys().cloned().collect::<Vec<_>>();
        keys.sort();
        assert_eq!(keys, ["cpu", "gpu", "memory", "temps", "timestamp"]);
    }
}
