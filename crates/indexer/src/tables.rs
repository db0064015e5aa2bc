//! Per-GVK table naming and DDL.
//!
//! SQLite table names can't contain the `/` a `Gvk::to_string()` produces, so
//! each GVK gets a suffix sanitized to `[a-zA-Z0-9_]`; collisions are
//! astronomically unlikely for the handful of live GVKs a single proxy
//! process tracks. The indexer mints three tables (`objects`/`fields`/
//! `events`) per GVK rather than one shared table for the whole store.

use steve_core::Gvk;

fn sanitize(gvk: &Gvk) -> String {
    format!("{}_{}_{}", gvk.group, gvk.version, gvk.kind)
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

pub struct TableNames {
    pub objects: String,
    pub fields: String,
    pub events: String,
}

impl TableNames {
    pub fn for_gvk(gvk: &Gvk) -> Self {
        let suffix = sanitize(gvk);
        Self {
            objects: format!("objects_{suffix}"),
            fields: format!("fields_{suffix}"),
            events: format!("events_{suffix}"),
        }
    }

    pub fn create_ddl(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {objects} (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                nonce BLOB,
                key_id INTEGER
            );
            CREATE TABLE IF NOT EXISTS {fields} (
                key TEXT NOT NULL,
                field TEXT NOT NULL,
                value TEXT,
                FOREIGN KEY(key) REFERENCES {objects}(key) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_{fields}_field_value ON {fields}(field, value);
            CREATE INDEX IF NOT EXISTS idx_{fields}_key ON {fields}(key);
            CREATE TABLE IF NOT EXISTS {events} (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                key TEXT NOT NULL,
                value BLOB,
                prev_value BLOB,
                rv TEXT
            );",
            objects = self.objects,
            fields = self.fields,
            events = self.events,
        )
    }

    pub fn drop_ddl(&self) -> String {
        format!(
            "DROP TABLE IF EXISTS {fields}; DROP TABLE IF EXISTS {objects}; DROP TABLE IF EXISTS {events};",
            fields = self.fields,
            objects = self.objects,
            events = self.events,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_group_version_kind_into_valid_identifier() {
        let names = TableNames::for_gvk(&Gvk::new("apps", "v1", "Deployment"));
        assert_eq!(names.objects, "objects_apps_v1_Deployment");
        assert!(names.objects.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    }

    #[test]
    fn core_group_has_no_leading_double_underscore_collision_with_apps() {
        let core = TableNames::for_gvk(&Gvk::new("", "v1", "Pod"));
        let apps = TableNames::for_gvk(&Gvk::new("apps", "v1", "Pod"));
        assert_ne!(core.objects, apps.objects);
    }
}
