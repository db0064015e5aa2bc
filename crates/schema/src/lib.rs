//! Discovery- and CRD-driven schema catalog, plus the per-user schema diff
//! the watch layer pushes on subscription channels.
//!
//! Watches discovery plus every CRD, maintains a whole-cluster catalog, and
//! diffs it per user's `AccessSet`; printer-column extraction normalizes a
//! CRD's `jsonPath` into a `steve_core::FieldPath`.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Mutex;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::ListParams;
use kube::discovery::{Discovery, Scope};
use kube::{Api, Client};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use steve_access::{AccessSet, GroupResource};
use steve_core::{parse_field_path, FieldPath, Gvk, Gvr};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("discovery: {0}")]
    Discovery(#[from] kube::Error),
}

/// How a printer column's value should be interpreted by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    String,
    Number,
    Date,
    Duration,
    Other,
}

/// One declared print column: display name, the path to extract it from,
/// its type, and a priority (higher-priority columns are hidden first by a
/// narrow client).
#[derive(Debug, Clone, PartialEq)]
pub struct PrinterColumn {
    pub name: String,
    pub path: FieldPath,
    pub json_path: String,
    pub column_type: ColumnType,
    pub priority: i32,
}

impl PrinterColumn {
    fn new(name: String, json_path: String, column_type: ColumnType, priority: i32) -> Option<Self> {
        let path = parse_field_path(&json_path)?;
        Some(Self { name, path, json_path, column_type, priority })
    }
}

/// One served resource type's derived, not-authored, schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub gvk: Gvk,
    pub gvr: Gvr,
    pub plural: String,
    pub namespaced: bool,
    pub watchable: bool,
    pub printer_columns: Vec<PrinterColumn>,
}

impl Schema {
    fn group_resource(&self) -> GroupResource {
        GroupResource::new(self.gvr.group.clone(), self.gvr.resource.clone())
    }

    /// The `(column name, path)` pairs this GVK should index for.
    pub fn indexed_fields(&self) -> Vec<(String, FieldPath)> {
        self.printer_columns.iter().map(|c| (c.json_path.clone(), c.path.clone())).collect()
    }

    /// A fingerprint over exactly the indexing-relevant attributes (the
    /// column set) — changes to the access map or counts must NOT perturb
    /// this.
    fn indexing_fingerprint(&self) -> Vec<(String, String)> {
        self.printer_columns.iter().map(|c| (c.name.clone(), c.json_path.clone())).collect()
    }
}

fn default_printer_columns(namespaced: bool) -> Vec<PrinterColumn> {
    let mut cols = vec![PrinterColumn::new("Name".into(), "metadata.name".into(), ColumnType::String, 0).expect("static path")];
    if namespaced {
        cols.push(PrinterColumn::new("Namespace".into(), "metadata.namespace".into(), ColumnType::String, 0).expect("static path"));
    }
    cols.push(PrinterColumn::new("Age".into(), "metadata.creationTimestamp".into(), ColumnType::Date, 0).expect("static path"));
    cols
}

/// Accepts only simple, unambiguous JSONPath-ish strings (`.spec.foo.bar[0]`,
/// no wildcards or filters) — a CRD author can put arbitrary CEL-ish
/// expressions in `jsonPath`, most of which this cache has no business
/// trying to index.
fn normalize_json_path(jp: &str) -> Option<String> {
    if jp.contains('?') || jp.contains('*') {
        return None;
    }
    let s = jp.strip_prefix('.').unwrap_or(jp);
    if s.is_empty() {
        return None;
    }
    for seg in s.split('.') {
        if seg.is_empty() {
            return None;
        }
        let bytes = seg.as_bytes();
        let mut open_idx: Option<usize> = None;
        for (i, ch) in bytes.iter().enumerate() {
            match *ch as char {
                '[' => {
                    if open_idx.is_some() {
                        return None;
                    }
                    open_idx = Some(i);
                }
                ']' => match open_idx {
                    Some(start) => {
                        if i != bytes.len() - 1 || start + 1 >= i || !seg[start + 1..i].chars().all(|c| c.is_ascii_digit()) {
                            return None;
                        }
                    }
                    None => return None,
                },
                c if open_idx.is_none() && !(c.is_ascii_alphanumeric() || c == '_' || c == '-') => return None,
                _ => {}
            }
        }
    }
    Some(s.to_string())
}

fn column_type_from_crd(raw: &str) -> ColumnType {
    match raw {
        "integer" => ColumnType::Number,
        "date" => ColumnType::Date,
        _ => ColumnType::String,
    }
}

/// Walks every served group/version/resource via `kube::discovery`, then
/// overlays CRD printer columns for the resources that are CRD-backed.
pub async fn discover_catalog(client: Client) -> Result<HashMap<Gvk, Schema>, SchemaError> {
    let discovery = Discovery::new(client.clone()).run().await?;
    let mut catalog = HashMap::new();

    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            let namespaced = matches!(caps.scope, Scope::Namespaced);
            let gvk = Gvk::new(ar.group.clone(), ar.version.clone(), ar.kind.clone());
            let gvr = Gvr { group: ar.group.clone(), version: ar.version.clone(), resource: ar.plural.clone() };
            let watchable = caps.supports_operation(kube::discovery::verbs::WATCH);
            catalog.insert(
                gvk.clone(),
                Schema { gvk, gvr, plural: ar.plural.clone(), namespaced, watchable, printer_columns: default_printer_columns(namespaced) },
            );
        }
    }

    if let Err(e) = overlay_crd_printer_columns(client, &mut catalog).await {
        warn!(error = %e, "failed to list CustomResourceDefinitions; serving builtin-only printer columns");
    }

    Ok(catalog)
}

async fn overlay_crd_printer_columns(client: Client, catalog: &mut HashMap<Gvk, Schema>) -> Result<(), SchemaError> {
    let api: Api<CustomResourceDefinition> = Api::all(client);
    let crds = api.list(&ListParams::default()).await?;

    for crd in crds {
        let Some(spec) = serde_json::to_value(&crd).ok().and_then(|v| v.get("spec").cloned()) else { continue };
        let group = spec.get("group").and_then(Json::as_str).unwrap_or_default().to_string();
        let kind = spec.get("names").and_then(|n| n.get("kind")).and_then(Json::as_str).unwrap_or_default().to_string();
        let versions = spec.get("versions").and_then(Json::as_array).cloned().unwrap_or_default();

        for version in &versions {
            let Some(version_name) = version.get("name").and_then(Json::as_str) else { continue };
            let gvk = Gvk::new(group.clone(), version_name.to_string(), kind.clone());
            let Some(schema) = catalog.get_mut(&gvk) else { continue };

            let Some(cols) = version.get("additionalPrinterColumns").and_then(Json::as_array) else { continue };
            let mut printer_columns = Vec::new();
            for c in cols {
                let name = c.get("name").and_then(Json::as_str).unwrap_or_default().to_string();
                let raw_path = c.get("jsonPath").and_then(Json::as_str).unwrap_or_default();
                let raw_type = c.get("type").and_then(Json::as_str).unwrap_or("string");
                let priority = c.get("priority").and_then(Json::as_i64).unwrap_or(0) as i32;
                if name.is_empty() {
                    continue;
                }
                let Some(normalized) = normalize_json_path(raw_path) else { continue };
                if let Some(col) = PrinterColumn::new(name, normalized, column_type_from_crd(raw_type), priority) {
                    printer_columns.push(col);
                }
            }
            if !printer_columns.is_empty() {
                schema.printer_columns = printer_columns;
                debug!(gvk = %schema.gvk, count = schema.printer_columns.len(), "overlaid CRD printer columns");
            }
        }
    }
    Ok(())
}

/// One user-visible schema-catalog change.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaEvent {
    Create(Schema),
    Remove(Gvk),
    Change(Schema),
}

/// `newly-visible / newly-invisible / column-set-changed` diff between two
/// user-scoped schema snapshots. Access-map reshaping and
/// count changes never appear here because [`Schema::indexing_fingerprint`]
/// is the only thing compared for `Change`.
pub fn diff_user_schema(previous: &HashMap<Gvk, Schema>, current: &HashMap<Gvk, Schema>) -> Vec<SchemaEvent> {
    let mut events = Vec::new();
    for (gvk, schema) in current {
        match previous.get(gvk) {
            None => events.push(SchemaEvent::Create(schema.clone())),
            Some(prev) if prev.indexing_fingerprint() != schema.indexing_fingerprint() => events.push(SchemaEvent::Change(schema.clone())),
            Some(_) => {}
        }
    }
    for gvk in previous.keys() {
        if !current.contains_key(gvk) {
            events.push(SchemaEvent::Remove(gvk.clone()));
        }
    }
    events
}

/// Filters the whole-cluster catalog down to what `access` may list.
pub fn visible_to(catalog: &HashMap<Gvk, Schema>, access: &AccessSet) -> HashMap<Gvk, Schema> {
    catalog
        .iter()
        .filter(|(_, schema)| {
            let gr = schema.group_resource();
            access.is_passthrough("list", &gr) || !access.namespaces("list", &gr).is_empty()
        })
        .map(|(gvk, schema)| (gvk.clone(), schema.clone()))
        .collect()
}

/// Owns the whole-cluster catalog and every subscribed user's last-seen
/// filtered view, so repeated calls to [`SchemaController::user_diff`]
/// return only what actually changed for that user since last time.
pub struct SchemaController {
    catalog: Mutex<HashMap<Gvk, Schema>>,
    per_user: Mutex<HashMap<String, HashMap<Gvk, Schema>>>,
}

impl Default for SchemaController {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaController {
    pub fn new() -> Self {
        Self { catalog: Mutex::new(HashMap::new()), per_user: Mutex::new(HashMap::new()) }
    }

    /// Replaces the whole-cluster catalog and returns the GVKs whose
    /// indexing-relevant attributes changed since the last refresh — the
    /// cache factory should `Stop(gvk)` each one so the next `CacheFor`
    /// re-creates it with the new field set.
    pub fn refresh(&self, fresh: HashMap<Gvk, Schema>) -> Vec<Gvk> {
        let mut catalog = self.catalog.lock().expect("schema controller mutex poisoned");
        let mut changed = Vec::new();
        for (gvk, schema) in &fresh {
            match catalog.get(gvk) {
                Some(prev) if prev.indexing_fingerprint() != schema.indexing_fingerprint() => changed.push(gvk.clone()),
                _ => {}
            }
        }
        *catalog = fresh;
        changed
    }

    pub fn catalog(&self) -> HashMap<Gvk, Schema> {
        self.catalog.lock().expect("schema controller mutex poisoned").clone()
    }

    /// Recomputes `user_key`'s visible schema set against the current
    /// catalog and returns the diff since the last call for that user.
    pub fn user_diff(&self, user_key: &str, access: &AccessSet) -> Vec<SchemaEvent> {
        let current = visible_to(&self.catalog.lock().expect("schema controller mutex poisoned"), access);
        let mut per_user = self.per_user.lock().expect("schema controller mutex poisoned");
        let previous = per_user.get(user_key).cloned().unwrap_or_default();
        let events = diff_user_schema(&previous, &current);
        per_user.insert(user_key.to_string(), current);
        events
    }

    /// Drops a disconnected user's last-seen snapshot so it doesn't leak
    /// memory across reconnects with new identities.
    pub fn forget_user(&self, user_key: &str) {
        self.per_user.lock().expect("schema controller mutex poisoned").remove(user_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pods_schema(column_count: usize) -> Schema {
        let mut cols = vec![PrinterColumn::new("Name".into(), "metadata.name".into(), ColumnType::String, 0).unwrap()];
        if column_count > 1 {
            cols.push(PrinterColumn::new("Phase".into(), "status.phase".into(), ColumnType::String, 0).unwrap());
        }
        Schema {
            gvk: Gvk::new("", "v1", "Pod"),
            gvr: Gvr { group: "".into(), version: "v1".into(), resource: "pods".into() },
            plural: "pods".into(),
            namespaced: true,
            watchable: true,
            printer_columns: cols,
        }
    }

    #[test]
    fn normalize_json_path_rejects_wildcards_and_accepts_indexed_segments() {
        assert_eq!(normalize_json_path(".spec.foo"), Some("spec.foo".to_string()));
        assert_eq!(normalize_json_path("spec.dnsNames[0]"), Some("spec.dnsNames[0]".to_string()));
        assert!(normalize_json_path("spec.*").is_none());
        assert!(normalize_json_path("").is_none());
    }

    #[test]
    fn diff_detects_create_remove_and_change() {
        let mut previous = HashMap::new();
        previous.insert(pods_schema(1).gvk.clone(), pods_schema(1));

        let mut current = HashMap::new();
        let changed = pods_schema(2);
        current.insert(changed.gvk.clone(), changed.clone());
        let secrets = Schema {
            gvk: Gvk::new("", "v1", "Secret"),
            gvr: Gvr { group: "".into(), version: "v1".into(), resource: "secrets".into() },
            plural: "secrets".into(),
            namespaced: true,
            watchable: true,
            printer_columns: default_printer_columns(true),
        };
        current.insert(secrets.gvk.clone(), secrets.clone());

        let events = diff_user_schema(&previous, &current);
        assert!(events.contains(&SchemaEvent::Create(secrets)));
        assert!(events.iter().any(|e| matches!(e, SchemaEvent::Change(s) if s.gvk == changed.gvk)));
    }

    #[test]
    fn schema_controller_diff_is_empty_once_user_has_seen_current_state() {
        let controller = SchemaController::new();
        let mut catalog = HashMap::new();
        let pods = pods_schema(1);
        catalog.insert(pods.gvk.clone(), pods);
        controller.refresh(catalog);

        let user = steve_access::User::new("alice", vec![]);
        let inputs = steve_access::RbacInputs { role_bindings: &[], cluster_role_bindings: &[], roles: &[], cluster_roles: &[] };
        let access = steve_access::compute_access_set(&user, &inputs);

        // No grants at all: nothing is visible, so nothing to diff either time.
        let first = controller.user_diff("alice", &access);
        assert!(first.is_empty());
        let second = controller.user_diff("alice", &access);
        assert!(second.is_empty());
    }

    #[test]
    fn refresh_reports_only_indexing_relevant_changes() {
        let controller = SchemaController::new();
        let mut catalog = HashMap::new();
        catalog.insert(pods_schema(1).gvk.clone(), pods_schema(1));
        assert!(controller.refresh(catalog).is_empty());

        let mut catalog2 = HashMap::new();
        catalog2.insert(pods_schema(2).gvk.clone(), pods_schema(2));
        let changed = controller.refresh(catalog2);
        assert_eq!(changed, vec![Gvk::new("", "v1", "Pod")]);
    }
}
