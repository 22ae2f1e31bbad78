//! Strategic-merge-patch emulation for pod specs.
//!
//! Kubernetes merges lists of objects by a per-field merge key (`name` for
//! containers, `mountPath` for volume mounts, ...) rather than replacing
//! them. There is no Rust implementation of that algorithm, so this module
//! carries a hand-maintained merge-key table for the pod-spec subset and
//! overlays patch trees recursively. The result is round-tripped through
//! [`PodSpec`] so schema violations surface as structured errors.

use k8s_openapi::api::core::v1::PodSpec;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("pod spec patch must be a JSON object")]
    NotAnObject,

    #[error("could not serialize pod spec: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("patched pod spec is invalid: {0}")]
    Invalid(#[source] serde_json::Error),
}

/// Merge keys for the list fields of the pod-spec schema. Lists not named
/// here are replaced wholesale, matching the upstream default.
const MERGE_KEYS: &[(&str, &str)] = &[
    ("containers", "name"),
    ("initContainers", "name"),
    ("ephemeralContainers", "name"),
    ("volumes", "name"),
    ("imagePullSecrets", "name"),
    ("env", "name"),
    ("volumeMounts", "mountPath"),
    ("volumeDevices", "devicePath"),
    ("ports", "containerPort"),
    ("hostAliases", "ip"),
    ("tolerations", "key"),
];

fn merge_key_for(field: &str) -> Option<&'static str> {
    MERGE_KEYS
        .iter()
        .find(|(name, _)| *name == field)
        .map(|(_, key)| *key)
}

/// Apply `patch` to `original` with strategic-merge semantics.
pub fn strategic_merge(original: &PodSpec, patch: &Value) -> Result<PodSpec, PatchError> {
    let Value::Object(patch_map) = patch else {
        return Err(PatchError::NotAnObject);
    };
    let Value::Object(mut tree) =
        serde_json::to_value(original).map_err(PatchError::Serialize)?
    else {
        return Err(PatchError::NotAnObject);
    };
    merge_object(&mut tree, patch_map);
    serde_json::from_value(Value::Object(tree)).map_err(PatchError::Invalid)
}

fn merge_object(original: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (field, patch_value) in patch {
        match patch_value {
            // null deletes the field
            Value::Null => {
                original.remove(field);
            }
            Value::Object(patch_obj) => match original.get_mut(field) {
                Some(Value::Object(original_obj)) => merge_object(original_obj, patch_obj),
                _ => {
                    original.insert(field.clone(), patch_value.clone());
                }
            },
            Value::Array(patch_items) => {
                let merged = match (merge_key_for(field), original.get(field)) {
                    (Some(key), Some(Value::Array(original_items))) => {
                        merge_list(original_items, patch_items, key)
                    }
                    _ => patch_items.clone(),
                };
                original.insert(field.clone(), Value::Array(merged));
            }
            _ => {
                original.insert(field.clone(), patch_value.clone());
            }
        }
    }
}

/// Merge two lists of objects by `merge_key`: entries with a matching key
/// merge in place (original order kept), the rest append in patch order.
fn merge_list(original: &[Value], patch: &[Value], merge_key: &str) -> Vec<Value> {
    let mut merged = original.to_vec();
    for patch_item in patch {
        let (Some(patch_obj), Some(id)) = (patch_item.as_object(), patch_item.get(merge_key))
        else {
            merged.push(patch_item.clone());
            continue;
        };
        match merged
            .iter()
            .position(|item| item.get(merge_key) == Some(id))
        {
            Some(index) => {
                if let Some(original_obj) = merged[index].as_object_mut() {
                    merge_object(original_obj, patch_obj);
                } else {
                    merged[index] = patch_item.clone();
                }
            }
            None => merged.push(patch_item.clone()),
        }
    }
    merged
}
