//! Wire message schema for both front doors (local socket and remote
//! session).
//!
//! Field names and the `type` discriminator values are grounded on
//! `original_source/src/msg/msg_common.hpp`'s `FLD_*`/`MSGTYPE_*` constants
//! and `src/msg/json/msg_json.cpp`'s response builders. Responses are built
//! as plain `serde_json::Value`s rather than a single serialized enum,
//! because the original's own response shapes are not uniform: `create_res`
//! and `inspect_res` are bare field objects with no `type` discriminator,
//! while every other response wraps a human-readable `content` under a
//! `type` of `"<request>_res"`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::AgentError;
use crate::store::InstanceRecord;

/// Deep sparse-overlay patch applied over an existing `hp.cfg`-shaped
/// document: absent keys leave the existing value untouched, present keys
/// (including `null`) overwrite it. Mirrors the original's own comment
/// that optional numeric config fields are "kept as optional ... we do
/// nothing" when absent.
pub fn merge_config_patch(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                match base_map.get_mut(key) {
                    Some(existing) => merge_config_patch(existing, patch_value),
                    None => {
                        base_map.insert(key.clone(), patch_value.clone());
                    }
                }
            }
        }
        (base_slot, patch_value) => {
            *base_slot = patch_value.clone();
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Create {
        owner_pubkey: String,
        contract_id: String,
        image: String,
    },
    Initiate {
        container_name: String,
        config: Value,
    },
    Destroy {
        container_name: String,
    },
    Start {
        container_name: String,
    },
    Stop {
        container_name: String,
    },
    List,
    Inspect {
        container_name: String,
    },
}

impl Request {
    /// The request-type string, reused to build the matching
    /// `"<request>_res"`/`"<request>_error"` response type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Request::Create { .. } => "create",
            Request::Initiate { .. } => "initiate",
            Request::Destroy { .. } => "destroy",
            Request::Start { .. } => "start",
            Request::Stop { .. } => "stop",
            Request::List => "list",
            Request::Inspect { .. } => "inspect",
        }
    }
}

/// A single entry of a `list_res`'s `content` array, also reused (with the
/// lease fields always absent) as the basis of `inspect_res`. The agent has
/// no lease/tenancy subsystem of its own, so `created_timestamp`,
/// `created_ledger`, `expiry_timestamp` and `tenant` are always omitted —
/// documented as an explicit scope decision in `DESIGN.md`.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSummary {
    pub name: String,
    pub user: String,
    pub image: String,
    pub contract_id: String,
    pub status: String,
    pub peer_port: u16,
    pub user_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_ledger: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry_timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
}

impl From<InstanceRecord> for InstanceSummary {
    fn from(record: InstanceRecord) -> Self {
        InstanceSummary {
            name: record.container_name,
            user: record.username,
            image: record.image,
            contract_id: record.contract_id,
            status: record.status.as_str().to_string(),
            peer_port: record.peer_port,
            user_port: record.user_port,
            created_timestamp: None,
            created_ledger: None,
            expiry_timestamp: None,
            tenant: None,
        }
    }
}

/// `create_res`: `{name, ip, pubkey, contract_id, peer_port, user_port}`,
/// no `type` discriminator — matches `msg_json.cpp`'s `build_create_response`.
pub fn create_res(record: &InstanceRecord) -> Value {
    json!({
        "name": record.container_name,
        "ip": record.ip,
        "pubkey": record.pubkey,
        "contract_id": record.contract_id,
        "peer_port": record.peer_port,
        "user_port": record.user_port,
    })
}

/// `initiate_res|destroy_res|start_res|stop_res|init`:
/// `{type, content:"<human message>"}`.
pub fn message_res(response_type: &str, content: &str) -> Value {
    json!({ "type": response_type, "content": content })
}

/// `list_res`: `{type:"list_res", content:[<instance-summary>…]}`.
pub fn list_res(instances: &[InstanceSummary]) -> Value {
    json!({ "type": "list_res", "content": instances })
}

/// `inspect_res`: `{name, user, image, status, peer_port, user_port}`, no
/// `type` discriminator, no lease fields.
pub fn inspect_res(summary: &InstanceSummary) -> Value {
    json!({
        "name": summary.name,
        "user": summary.user,
        "image": summary.image,
        "status": summary.status,
        "peer_port": summary.peer_port,
        "user_port": summary.user_port,
    })
}

/// The unsolicited message sent synchronously once a `RemoteSession` starts.
pub fn init_message() -> Value {
    message_res("init", "Connection initiated.")
}

/// Build the generic error response for a request that never got far
/// enough to be decoded (e.g. malformed JSON).
pub fn generic_error(err: &AgentError) -> Value {
    message_res("error", &err.to_string())
}

/// Build the `"<request>_error"` response for a request that was decoded
/// successfully but failed while being handled.
pub fn request_error(request_type: &str, err: &AgentError) -> Value {
    message_res(&format!("{request_type}_error"), &err.to_string())
}

pub struct MessageCodec;

impl MessageCodec {
    pub fn decode_request(bytes: &[u8]) -> Result<Request, AgentError> {
        serde_json::from_slice(bytes)
            .map_err(|e| AgentError::BadRequest(format!("invalid request: {e}")))
    }

    pub fn encode_value(value: &Value) -> Vec<u8> {
        serde_json::to_vec(value).expect("response serialization is infallible")
    }

    pub fn encode_request_error(request_type: &str, err: &AgentError) -> Vec<u8> {
        Self::encode_value(&request_error(request_type, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InstanceStatus;

    fn sample_record() -> InstanceRecord {
        InstanceRecord {
            container_name: "sashi01".into(),
            owner_pubkey: "owner-pub".into(),
            contract_id: "c1".into(),
            pubkey: "node-pub".into(),
            ip: "10.0.0.5".into(),
            image: "hp-2.2".into(),
            username: "sashi01".into(),
            user_id: 2001,
            peer_port: 22861,
            user_port: 26201,
            status: InstanceStatus::Created,
            current_status: None,
            created_at: 0,
        }
    }

    #[test]
    fn decodes_create_request() {
        let raw = br#"{"type":"create","owner_pubkey":"abc","contract_id":"c1","image":"hp-2.2"}"#;
        let req = MessageCodec::decode_request(raw).unwrap();
        assert!(matches!(req, Request::Create { .. }));
        assert_eq!(req.type_name(), "create");
    }

    #[test]
    fn decodes_list_request_with_no_fields() {
        let raw = br#"{"type":"list"}"#;
        let req = MessageCodec::decode_request(raw).unwrap();
        assert!(matches!(req, Request::List));
    }

    #[test]
    fn rejects_unknown_request_type() {
        let raw = br#"{"type":"wipe_everything"}"#;
        assert!(MessageCodec::decode_request(raw).is_err());
    }

    #[test]
    fn config_patch_overlays_without_clobbering_unrelated_keys() {
        let mut base = json!({
            "mesh": {"port": 22861, "listen_address": "0.0.0.0"},
            "log": {"log_level": "inf"}
        });
        let patch = json!({"mesh": {"port": 22862}});

        merge_config_patch(&mut base, &patch);

        assert_eq!(base["mesh"]["port"], 22862);
        assert_eq!(base["mesh"]["listen_address"], "0.0.0.0");
        assert_eq!(base["log"]["log_level"], "inf");
    }

    #[test]
    fn create_res_has_no_type_field() {
        let value = create_res(&sample_record());
        assert!(value.get("type").is_none());
        assert_eq!(value["name"], "sashi01");
        assert_eq!(value["ip"], "10.0.0.5");
        assert_eq!(value["pubkey"], "node-pub");
    }

    #[test]
    fn list_res_wraps_summaries_in_content() {
        let summary: InstanceSummary = sample_record().into();
        let value = list_res(&[summary]);
        assert_eq!(value["type"], "list_res");
        assert_eq!(value["content"][0]["name"], "sashi01");
        assert!(value["content"][0].get("created_timestamp").is_none());
    }

    #[test]
    fn request_error_uses_request_specific_type_name() {
        let err = AgentError::PreconditionFailed("already running".into());
        let value = request_error("start", &err);
        assert_eq!(value["type"], "start_error");
        assert!(value["content"].as_str().unwrap().contains("already running"));
    }
}
