//! Compiles a [`ListOptions`] into SQL against a GVK's `objects`/`fields`
//! tables.
//!
//! Declared fields (those the indexer was configured to extract into the
//! `fields` table, see `steve_indexer::GvkConfig::indexed_fields`) compile to
//! an `EXISTS` join against `fields`. A filter or sort on any other path is
//! "ad-hoc": `objects.value` is an opaquely encoded (and optionally
//! compressed/encrypted) blob rather than queryable JSON text, so ad-hoc
//! paths are instead evaluated in-process after decoding — see
//! `planner::Planner::list`.
//!
//! By convention a declared column's name is its path's `to_dotted()` form,
//! so the catalog passed in here is just the set of dotted paths the GVK's
//! `GvkConfig` was registered with.

use std::collections::HashSet;

use steve_core::Partition;

use crate::types::{Filter, ListOptions, Op, OrFilter, SortSpec};

pub struct CompiledSql {
    pub where_clause: String,
    pub params: Vec<String>,
    pub order_by: String,
    /// Filter groups that could not be expressed in SQL because they touch
    /// at least one undeclared path; applied in-process after decoding.
    pub ad_hoc_filters: Vec<OrFilter>,
    /// Sort keys that touch an undeclared path; applied in-process.
    pub ad_hoc_sort: Vec<SortSpec>,
    /// `true` once any ad-hoc filter or sort is present — the caller must
    /// not apply `LIMIT`/`OFFSET` in SQL when this holds.
    pub needs_post_processing: bool,
}

pub fn compile(opts: &ListOptions, fields_table: &str, declared: &HashSet<String>) -> CompiledSql {
    let mut clauses = Vec::new();
    let mut params = Vec::new();
    let mut ad_hoc_filters = Vec::new();

    if let Some(partition_clause) = compile_partitions(&opts.partitions, &mut params) {
        clauses.push(partition_clause);
    }

    for group in &opts.filters {
        if group.0.iter().all(|f| declared.contains(&f.path.to_dotted())) {
            clauses.push(compile_or_group(group, fields_table, &mut params));
        } else {
            ad_hoc_filters.push(group.clone());
        }
    }

    let mut ad_hoc_sort = Vec::new();
    let mut order_parts = Vec::new();
    for sort in &opts.sort {
        if declared.contains(&sort.path.to_dotted()) {
            order_parts.push(compile_sort(sort, fields_table, &mut params));
        } else {
            ad_hoc_sort.push(sort.clone());
        }
    }
    order_parts.push("o.key ASC".to_string()); // stable tiebreak so paginated order never depends on SQLite's row order

    let where_clause = if clauses.is_empty() { "1=1".to_string() } else { clauses.join(" AND ") };
    let needs_post_processing = !ad_hoc_filters.is_empty() || !ad_hoc_sort.is_empty();

    CompiledSql {
        where_clause,
        params,
        order_by: order_parts.join(", "),
        ad_hoc_filters,
        ad_hoc_sort,
        needs_post_processing,
    }
}

fn compile_partitions(partitions: &[Partition], params: &mut Vec<String>) -> Option<String> {
    if partitions.is_empty() || partitions.iter().any(Partition::is_passthrough) {
        return None;
    }
    let mut scoped = Vec::new();
    for p in partitions {
        match p {
            Partition::Passthrough => unreachable!("filtered out above"),
            Partition::Scoped { namespace, names: None } => {
                params.push(format!("{namespace}/%"));
                scoped.push(format!("o.key LIKE ?{}", params.len()));
            }
            Partition::Scoped { namespace, names: Some(names) } => {
                let placeholders: Vec<String> = names
                    .iter()
                    .map(|n| {
                        params.push(format!("{namespace}/{n}"));
                        format!("?{}", params.len())
                    })
                    .collect();
                scoped.push(format!("o.key IN ({})", placeholders.join(", ")));
            }
        }
    }
    Some(format!("({})", scoped.join(" OR ")))
}

fn compile_or_group(group: &OrFilter, fields_table: &str, params: &mut Vec<String>) -> String {
    let parts: Vec<String> = group.0.iter().map(|f| compile_filter(f, fields_table, params)).collect();
    format!("({})", parts.join(" OR "))
}

fn compile_filter(filter: &Filter, fields_table: &str, params: &mut Vec<String>) -> String {
    let column = filter.path.to_dotted();
    match filter.op {
        Op::Exists => {
            params.push(column);
            format!("EXISTS (SELECT 1 FROM {fields_table} f WHERE f.key = o.key AND f.field = ?{})", params.len())
        }
        Op::NotExists => {
            params.push(column);
            format!("NOT EXISTS (SELECT 1 FROM {fields_table} f WHERE f.key = o.key AND f.field = ?{})", params.len())
        }
        Op::In | Op::NotIn => {
            params.push(column);
            let field_idx = params.len();
            let placeholders: Vec<String> = filter
                .matches
                .iter()
                .map(|v| {
                    params.push(v.clone());
                    format!("?{}", params.len())
                })
                .collect();
            let verb = if filter.op == Op::In { "IN" } else { "NOT IN" };
            format!(
                "EXISTS (SELECT 1 FROM {fields_table} f WHERE f.key = o.key AND f.field = ?{field_idx} AND f.value {verb} ({}))",
                placeholders.join(", ")
            )
        }
        Op::Eq | Op::Ne => {
            params.push(column);
            let field_idx = params.len();
            let value = filter.matches.first().cloned().unwrap_or_default();
            if filter.partial {
                params.push(format!("%{value}%"));
                let cmp = if filter.op == Op::Eq { "LIKE" } else { "NOT LIKE" };
                format!("EXISTS (SELECT 1 FROM {fields_table} f WHERE f.key = o.key AND f.field = ?{field_idx} AND f.value {cmp} ?{})", params.len())
            } else {
                params.push(value);
                let cmp = if filter.op == Op::Eq { "=" } else { "!=" };
                format!("EXISTS (SELECT 1 FROM {fields_table} f WHERE f.key = o.key AND f.field = ?{field_idx} AND f.value {cmp} ?{})", params.len())
            }
        }
        Op::Lt | Op::Gt => {
            params.push(column);
            let field_idx = params.len();
            let value = filter.matches.first().cloned().unwrap_or_default();
            params.push(value);
            let value_idx = params.len();
            let cmp = if filter.op == Op::Lt { "<" } else { ">" };
            // Numeric comparisons require both operands to parse as numbers
            //; non-numeric field values are excluded by the
            // CAST-to-NULL short circuit rather than falling back to a
            // lexical compare.
            format!(
                "EXISTS (SELECT 1 FROM {fields_table} f WHERE f.key = o.key AND f.field = ?{field_idx} \
                 AND CAST(f.value AS REAL) {cmp} CAST(?{value_idx} AS REAL) \
                 AND f.value GLOB '*[0-9]*' AND ?{value_idx} GLOB '*[0-9]*')"
            )
        }
    }
}

fn compile_sort(sort: &SortSpec, fields_table: &str, params: &mut Vec<String>) -> String {
    let column = sort.path.to_dotted();
    params.push(column);
    let idx = params.len();
    let dir = if sort.descending { "DESC" } else { "ASC" };
    let expr = format!(
        "(SELECT f.value FROM {fields_table} f WHERE f.key = o.key AND f.field = ?{idx})"
    );
    if sort.ip_collate {
        // Pads each dotted-decimal octet to 3 digits so lexical ordering
        // matches numeric IP ordering: "9.9.9.9" sorts after "10.0.0.0"
        // without this.
        format!(
            "(SELECT printf('%03d.%03d.%03d.%03d', \
                CAST(substr(v, 1, instr(v, '.') - 1) AS INTEGER), \
                CAST(substr(v, instr(v, '.') + 1, instr(substr(v, instr(v, '.') + 1), '.') - 1) AS INTEGER), \
                0, 0) \
              FROM (SELECT {expr} AS v)) {dir}"
        )
    } else {
        format!("{expr} {dir}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Op as TOp, Pagination};
    use steve_core::parse_field_path;
    use std::collections::HashSet;

    fn declared(paths: &[&str]) -> HashSet<String> {
        paths.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn equal_list_options_compile_to_identical_sql() {
        let mut opts = ListOptions::default();
        opts.filters.push(OrFilter(vec![Filter {
            path: parse_field_path("metadata.name").unwrap(),
            op: TOp::Eq,
            matches: vec!["alpha".into()],
            partial: false,
        }]));
        let cols = declared(&["metadata.name"]);
        let a = compile(&opts, "fields_v1_Pod", &cols);
        let b = compile(&opts, "fields_v1_Pod", &cols);
        assert_eq!(a.where_clause, b.where_clause);
        assert_eq!(a.params, b.params);
    }

    #[test]
    fn undeclared_path_is_pushed_to_ad_hoc() {
        let mut opts = ListOptions::default();
        opts.filters.push(OrFilter(vec![Filter {
            path: parse_field_path("spec.replicas").unwrap(),
            op: TOp::Gt,
            matches: vec!["3".into()],
            partial: false,
        }]));
        let cols = declared(&["metadata.name"]);
        let compiled = compile(&opts, "fields_v1_Pod", &cols);
        assert_eq!(compiled.where_clause, "1=1");
        assert_eq!(compiled.ad_hoc_filters.len(), 1);
        assert!(compiled.needs_post_processing);
    }

    #[test]
    fn passthrough_partition_skips_scoping_clause() {
        let mut opts = ListOptions::default();
        opts.partitions = vec![Partition::Passthrough];
        let compiled = compile(&opts, "fields_v1_Pod", &declared(&[]));
        assert_eq!(compiled.where_clause, "1=1");
    }

    #[test]
    fn scoped_partition_with_names_builds_in_clause() {
        let mut opts = ListOptions::default();
        opts.partitions = vec![Partition::Scoped { namespace: "default".into(), names: Some(vec!["a".into(), "b".into()]) }];
        let compiled = compile(&opts, "fields_v1_Pod", &declared(&[]));
        assert!(compiled.where_clause.contains("o.key IN"));
        assert_eq!(compiled.params, vec!["default/a", "default/b"]);
    }

    #[test]
    fn pagination_limit_offset_math() {
        let p = Pagination { page: 3, page_size: 20 };
        assert_eq!(p.limit_offset(), (20, 40));
    }
}
