//! Ties [`compile`] to a live [`Indexer`]: runs the declared-field SQL,
//! decodes rows, applies any ad-hoc filter/sort in-process, and paginates.

use std::collections::HashSet;

use indexmap::IndexMap;
use steve_core::{CachedObject, FieldPath, Gvk, Segment, Value};
use steve_indexer::Indexer;
use steve_sql::SqlResult;
use tracing::debug;

use crate::compile::compile;
use crate::types::{Filter, ListOptions, Op, OrFilter, QueryResult, SortSpec};

/// Default page size for resume-token chunking when the caller supplies a
/// token but no explicit `pageSize`.
const RESUME_CHUNK_SIZE: usize = 500;

pub struct Planner<'a> {
    indexer: &'a Indexer,
}

impl<'a> Planner<'a> {
    pub fn new(indexer: &'a Indexer) -> Self {
        Self { indexer }
    }

    /// Executes `opts` against `gvk`, returning matching objects in final
    /// order plus a count consistent with the returned page: COUNT(*) and
    /// data are computed from the same predicate.
    pub fn list(&self, gvk: &Gvk, opts: &ListOptions, declared: &HashSet<String>) -> SqlResult<(Vec<CachedObject>, QueryResult)> {
        let tables = self
            .indexer
            .table_names(gvk)
            .ok_or_else(|| steve_sql::QueryError::new("QUERY", format!("gvk {gvk} not registered")))?;

        for group in &opts.filters {
            for filter in &group.0 {
                filter.validate().map_err(|e| steve_sql::QueryError::new("VALIDATE", e))?;
            }
        }

        let compiled = compile(opts, &tables.fields, declared);

        // A resume token is an opaque cursor: the key of the last row the
        // caller already consumed. It only composes with SQL pushdown (it
        // always orders by `o.key`, which the compiler's tiebreak already
        // guarantees is the final sort key).
        let mut where_clause = compiled.where_clause.clone();
        let mut sql_params = compiled.params.clone();
        if let Some(token) = &opts.resume_token {
            sql_params.push(token.clone());
            where_clause = format!("({where_clause}) AND o.key > ?{}", sql_params.len());
        }

        // Pagination can only be pushed down to SQL `LIMIT`/`OFFSET` when
        // every filter and sort key was declared; an ad-hoc filter or sort
        // needs the full candidate set decoded before it can slice a page.
        let push_down_pagination = opts.pagination.filter(|_| !compiled.needs_post_processing);
        let mut sql = format!(
            "SELECT o.key, o.value, o.nonce, o.key_id FROM {} o WHERE {} ORDER BY {}",
            tables.objects, where_clause, compiled.order_by
        );
        if let Some(pagination) = push_down_pagination {
            let (limit, offset) = pagination.limit_offset();
            sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}"));
        } else if opts.resume_token.is_some() && !compiled.needs_post_processing {
            sql.push_str(&format!(" LIMIT {RESUME_CHUNK_SIZE}"));
        }

        let params: Vec<&dyn rusqlite::ToSql> = sql_params.iter().map(|p| p as &dyn rusqlite::ToSql).collect();
        let rows = self.indexer.query_objects(&sql, &params)?;
        debug!(gvk = %gvk, sql = %sql, rows = rows.len(), "query planner executed declared-field scan");

        let mut objects: Vec<(String, CachedObject)> = Vec::with_capacity(rows.len());
        for (key, blob, nonce, key_id) in rows {
            let json = self.indexer.decode_row(blob, nonce, key_id)?;
            objects.push((key, CachedObject::from_json(json)));
        }

        for group in &compiled.ad_hoc_filters {
            objects.retain(|(_, obj)| matches_or_group(group, obj));
        }

        for sort in compiled.ad_hoc_sort.iter().rev() {
            apply_ad_hoc_sort(&mut objects, sort);
        }

        let (mut final_objects, count, pages) = match opts.pagination {
            Some(pagination) if push_down_pagination.is_some() => {
                // `objects` is already the exact page; the total count needs
                // its own unbounded COUNT(*) within the same predicate.
                let total = self.count_only(gvk, opts, declared)?;
                let page_size = pagination.page_size.max(1) as u64;
                (objects, total, Some((total + page_size - 1) / page_size))
            }
            Some(pagination) => {
                let total = objects.len() as u64;
                let (limit, offset) = pagination.limit_offset();
                let sliced: Vec<_> = objects.into_iter().skip(offset as usize).take(limit.max(0) as usize).collect();
                let page_size = pagination.page_size.max(1) as u64;
                (sliced, total, Some((total + page_size - 1) / page_size))
            }
            None => {
                let total = objects.len() as u64;
                (objects, total, None)
            }
        };

        // Resume-token chunking is a distinct mode from page/pageSize pagination: it
        // only engages when the caller is in the resume protocol, i.e.
        // supplied a (possibly empty, meaning "start") resume_token.
        let next_resume_token = if opts.resume_token.is_some() {
            if final_objects.len() > RESUME_CHUNK_SIZE {
                final_objects.truncate(RESUME_CHUNK_SIZE);
            }
            if final_objects.len() == RESUME_CHUNK_SIZE {
                final_objects.last().map(|(k, _)| k.clone())
            } else {
                None
            }
        } else {
            None
        };

        if let Some(fields) = &opts.summary_fields {
            for (_, obj) in final_objects.iter_mut() {
                *obj = project_summary(obj, fields);
            }
        }

        let keys = final_objects.iter().map(|(k, _)| k.clone()).collect();
        let values = final_objects.into_iter().map(|(_, v)| v).collect();

        Ok((values, QueryResult { keys, count, pages, next_resume_token }))
    }

    fn count_only(&self, gvk: &Gvk, opts: &ListOptions, declared: &HashSet<String>) -> SqlResult<u64> {
        let tables = self
            .indexer
            .table_names(gvk)
            .ok_or_else(|| steve_sql::QueryError::new("QUERY", format!("gvk {gvk} not registered")))?;
        let compiled = compile(opts, &tables.fields, declared);
        let sql = format!("SELECT COUNT(*) FROM {} o WHERE {}", tables.objects, compiled.where_clause);
        let params: Vec<&dyn rusqlite::ToSql> = compiled.params.iter().map(|p| p as &dyn rusqlite::ToSql).collect();
        self.indexer.connection().with_connection(|c| {
            c.query_row(&sql, params.as_slice(), |row| row.get::<_, i64>(0))
                .map(|n| n as u64)
                .map_err(|e| steve_sql::QueryError::new(&sql, e.to_string()))
        })
    }
}

fn matches_or_group(group: &OrFilter, obj: &CachedObject) -> bool {
    group.0.iter().any(|f| matches_filter(f, obj))
}

fn matches_filter(filter: &Filter, obj: &CachedObject) -> bool {
    let value = filter.path.get(&obj.value);
    match filter.op {
        Op::Exists => value.is_some() && !value.unwrap().is_null(),
        Op::NotExists => value.is_none() || value.unwrap().is_null(),
        Op::Eq | Op::Ne => {
            let Some(scalar) = value.and_then(steve_core::Value::scalar_string) else { return false };
            let want = filter.matches.first().map(String::as_str).unwrap_or_default();
            let matched = if filter.partial { scalar.contains(want) } else { scalar == want };
            if filter.op == Op::Eq { matched } else { !matched }
        }
        Op::In | Op::NotIn => {
            let Some(scalar) = value.and_then(steve_core::Value::scalar_string) else { return false };
            let matched = filter.matches.iter().any(|m| m == &scalar);
            if filter.op == Op::In { matched } else { !matched }
        }
        Op::Lt | Op::Gt => {
            let (Some(a), Some(want)) = (value.and_then(steve_core::Value::as_f64), filter.matches.first().and_then(|s| s.parse::<f64>().ok())) else {
                return false; // non-numeric operands exclude the row
            };
            if filter.op == Op::Lt { a < want } else { a > want }
        }
    }
}

/// Projects `obj` down to just the paths in `fields`, rebuilding only the nested objects/arrays needed to
/// hold each path rather than cloning the whole tree.
fn project_summary(obj: &CachedObject, fields: &[FieldPath]) -> CachedObject {
    let mut root = Value::Object(IndexMap::new());
    for path in fields {
        if let Some(value) = path.get(&obj.value) {
            insert_at(&mut root, path.segments(), value.clone());
        }
    }
    CachedObject { value: root }
}

fn insert_at(root: &mut Value, segments: &[Segment], value: Value) {
    let Some((head, rest)) = segments.split_first() else { return };
    match head {
        Segment::Key(key) => {
            if !matches!(root, Value::Object(_)) {
                *root = Value::Object(IndexMap::new());
            }
            let Value::Object(map) = root else { unreachable!() };
            let entry = map.entry(key.clone()).or_insert(Value::Null);
            if rest.is_empty() {
                *entry = value;
            } else {
                insert_at(entry, rest, value);
            }
        }
        Segment::Index(idx) => {
            if !matches!(root, Value::Array(_)) {
                *root = Value::Array(Vec::new());
            }
            let Value::Array(arr) = root else { unreachable!() };
            if arr.len() <= *idx {
                arr.resize(*idx + 1, Value::Null);
            }
            if rest.is_empty() {
                arr[*idx] = value;
            } else {
                insert_at(&mut arr[*idx], rest, value);
            }
        }
    }
}

fn apply_ad_hoc_sort(objects: &mut [(String, CachedObject)], sort: &SortSpec) {
    objects.sort_by(|(_, a), (_, b)| {
        let av = sort.path.get(&a.value).and_then(steve_core::Value::scalar_string).unwrap_or_default();
        let bv = sort.path.get(&b.value).and_then(steve_core::Value::scalar_string).unwrap_or_default();
        let ord = av.cmp(&bv);
        if sort.descending { ord.reverse() } else { ord }
    });
}
