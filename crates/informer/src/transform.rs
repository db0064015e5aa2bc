//! The optional per-GVK transform hook.
//!
//! Pure and idempotent: it runs on every event, including every object of a
//! GVK again on `ReplaceAll` after a relist, so it must not accumulate state
//! across calls or depend on call order.

use serde_json::Value as Json;

pub trait Transform: Send + Sync {
    /// Mutates `obj` in place, e.g. injecting a synthetic
    /// `metadata.state.name` derived from `status`.
    fn apply(&self, obj: &mut Json);
}

/// The default no-op transform used when a GVK declares none.
pub struct Identity;

impl Transform for Identity {
    fn apply(&self, _obj: &mut Json) {}
}

/// Derives a synthetic `metadata.state.name` from `status.phase` (falling
/// back to `status.conditions[-1].type`). Kept as a ready-made transform
/// rather than only a trait so `steve-cache` has something concrete to wire
/// up for workload-shaped GVKs.
pub struct DeriveStateName;

impl Transform for DeriveStateName {
    fn apply(&self, obj: &mut Json) {
        let state_name = obj
            .pointer("/status/phase")
            .and_then(Json::as_str)
            .map(str::to_string)
            .or_else(|| {
                obj.pointer("/status/conditions")
                    .and_then(Json::as_array)
                    .and_then(|conds| conds.last())
                    .and_then(|c| c.get("type"))
                    .and_then(Json::as_str)
                    .map(str::to_string)
            });
        let Some(name) = state_name else { return };
        let metadata = obj
            .as_object_mut()
            .and_then(|m| m.entry("metadata").or_insert_with(|| Json::Object(Default::default())).as_object_mut());
        if let Some(metadata) = metadata {
            let state = metadata.entry("state").or_insert_with(|| Json::Object(Default::default()));
            if let Some(state) = state.as_object_mut() {
                state.insert("name".to_string(), Json::String(name));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_state_name_from_status_phase() {
        let mut obj = serde_json::json!({"metadata": {"name": "x"}, "status": {"phase": "Running"}});
        DeriveStateName.apply(&mut obj);
        assert_eq!(obj["metadata"]["state"]["name"], "Running");
    }

    #[test]
    fn transform_is_idempotent() {
        let mut obj = serde_json::json!({"metadata": {"name": "x"}, "status": {"phase": "Running"}});
        DeriveStateName.apply(&mut obj);
        DeriveStateName.apply(&mut obj);
        assert_eq!(obj["metadata"]["state"]["name"], "Running");
    }

    #[test]
    fn no_status_leaves_object_untouched() {
        let mut obj = serde_json::json!({"metadata": {"name": "x"}});
        DeriveStateName.apply(&mut obj);
        assert!(obj["metadata"].get("state").is_none());
    }
}
