//! `hp.cfg` patching
//!
//! Grounded on `original_source/src/hp_manager.cpp`'s `create_contract`,
//! which reads the template's `hp.cfg`, overwrites a fixed set of fields,
//! and writes it back unmodified otherwise (history shard counts, log
//! defaults, hpfs paths are all inherited from the template verbatim).

use serde_json::{json, Value};

use crate::error::{AgentError, Result};

/// Fixed `uid:gid` the contract process runs as inside the container,
/// matching `original_source/src/hp_manager.cpp`'s `CONTRACT_USER_ID`
/// (`contract_ugid = {10000, 10000}`).
pub const CONTRACT_RUN_AS: &str = "10000:10000";

pub struct HpCfgFields<'a> {
    pub contract_id: &'a str,
    pub owner_pubkey: &'a str,
    pub node_public_key: &'a str,
    pub node_private_key: &'a str,
    pub bin_path: &'a str,
    pub peer_port: u16,
    pub user_port: u16,
}

/// Apply the fixed set of per-instance overrides to a template `hp.cfg`,
/// preserving every other key the template shipped with.
pub fn patch_hp_cfg(template: &str, fields: &HpCfgFields) -> Result<String> {
    let mut doc: Value = serde_json::from_str(template)
        .map_err(|e| AgentError::ExternalFailure(format!("invalid hp.cfg template: {e}")))?;

    let obj = doc
        .as_object_mut()
        .ok_or_else(|| AgentError::ExternalFailure("hp.cfg template root is not an object".into()))?;

    // node identity + fixed history shard counts
    let node = obj
        .entry("node")
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .ok_or_else(|| AgentError::ExternalFailure("hp.cfg node section malformed".into()))?;
    node.insert(
        "public_key".into(),
        Value::String(fields.node_public_key.to_string()),
    );
    node.insert(
        "private_key".into(),
        Value::String(fields.node_private_key.to_string()),
    );
    let history_config = node
        .entry("history_config")
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .ok_or_else(|| {
            AgentError::ExternalFailure("hp.cfg node.history_config section malformed".into())
        })?;
    history_config.insert("max_primary_shards".into(), json!(2));
    history_config.insert("max_raw_shards".into(), json!(2));

    // contract identity + run command
    let contract = obj
        .entry("contract")
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .ok_or_else(|| AgentError::ExternalFailure("hp.cfg contract section malformed".into()))?;
    contract.insert("id".into(), Value::String(fields.contract_id.to_string()));
    contract.insert(
        "unl".into(),
        Value::Array(vec![Value::String(fields.node_public_key.to_string())]),
    );
    contract.insert("bin_path".into(), Value::String(fields.bin_path.to_string()));
    contract.insert(
        "bin_args".into(),
        Value::String(fields.owner_pubkey.to_string()),
    );
    contract.insert("run_as".into(), Value::String(CONTRACT_RUN_AS.to_string()));

    // networking
    let mesh = obj
        .entry("mesh")
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .ok_or_else(|| AgentError::ExternalFailure("hp.cfg mesh section malformed".into()))?;
    mesh.insert("port".into(), json!(fields.peer_port));

    let user = obj
        .entry("user")
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .ok_or_else(|| AgentError::ExternalFailure("hp.cfg user section malformed".into()))?;
    user.insert("port".into(), json!(fields.user_port));

    // hpfs defaults
    let hpfs = obj
        .entry("hpfs")
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .ok_or_else(|| AgentError::ExternalFailure("hp.cfg hpfs section malformed".into()))?;
    hpfs.insert("external".into(), json!(true));
    let hpfs_log = hpfs
        .entry("log")
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .ok_or_else(|| AgentError::ExternalFailure("hp.cfg hpfs.log section malformed".into()))?;
    hpfs_log.insert("log_level".into(), Value::String("err".into()));

    // log defaults
    let log = obj
        .entry("log")
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .ok_or_else(|| AgentError::ExternalFailure("hp.cfg log section malformed".into()))?;
    log.insert("log_level".into(), Value::String("inf".into()));
    log.insert("max_mbytes_per_file".into(), json!(5));
    log.insert("max_file_count".into(), json!(10));

    serde_json::to_string_pretty(&doc)
        .map_err(|e| AgentError::ExternalFailure(format!("failed to serialize hp.cfg: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_preserves_unrelated_template_keys() {
        let template = r#"{
            "history": {"shards": 2},
            "log": {"log_level": "dbg"}
        }"#;

        let fields = HpCfgFields {
            contract_id: "c1",
            owner_pubkey: "owner-pub",
            node_public_key: "node-pub",
            node_private_key: "node-priv",
            bin_path: "bootstrap_contract",
            peer_port: 22861,
            user_port: 26201,
        };

        let patched = patch_hp_cfg(template, &fields).unwrap();
        let doc: Value = serde_json::from_str(&patched).unwrap();

        assert_eq!(doc["history"]["shards"], 2);
        assert_eq!(doc["contract"]["id"], "c1");
        assert_eq!(doc["contract"]["run_as"], CONTRACT_RUN_AS);
        assert_eq!(doc["contract"]["bin_args"], "owner-pub");
        assert_eq!(doc["contract"]["unl"][0], "node-pub");
        assert_eq!(doc["mesh"]["port"], 22861);
        assert_eq!(doc["user"]["port"], 26201);
        assert_eq!(doc["node"]["history_config"]["max_primary_shards"], 2);
        assert_eq!(doc["node"]["history_config"]["max_raw_shards"], 2);
        assert_eq!(doc["hpfs"]["external"], true);
        assert_eq!(doc["hpfs"]["log"]["log_level"], "err");
        assert_eq!(doc["log"]["log_level"], "inf");
        assert_eq!(doc["log"]["max_mbytes_per_file"], 5);
    }
}
