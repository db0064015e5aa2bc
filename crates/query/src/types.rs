//! `ListOptions` and its building blocks.

use steve_core::{FieldPath, Partition};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Lt,
    Gt,
    In,
    NotIn,
    Exists,
    NotExists,
}

/// One filter clause. `exists`/`not-exists` are only meaningful on
/// `metadata.labels.*` paths; `partial` turns an `Eq` into a substring match.
#[derive(Debug, Clone)]
pub struct Filter {
    pub path: FieldPath,
    pub op: Op,
    pub matches: Vec<String>,
    pub partial: bool,
}

impl Filter {
    pub fn validate(&self) -> Result<(), String> {
        if matches!(self.op, Op::Exists | Op::NotExists) && !self.path.is_label_path() {
            return Err(format!("{:?} is only valid on metadata.labels paths", self.op));
        }
        Ok(())
    }
}

/// A group of filters ORed together; groups themselves are ANDed.
#[derive(Debug, Clone, Default)]
pub struct OrFilter(pub Vec<Filter>);

#[derive(Debug, Clone)]
pub struct SortSpec {
    pub path: FieldPath,
    pub descending: bool,
    /// Compare as dotted-decimal IP addresses rather than lexically.
    pub ip_collate: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    pub page: u32,
    pub page_size: u32,
}

impl Pagination {
    pub fn limit_offset(&self) -> (i64, i64) {
        let limit = self.page_size as i64;
        let offset = (self.page.saturating_sub(1) as i64) * limit;
        (limit, offset)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub filters: Vec<OrFilter>,
    pub sort: Vec<SortSpec>,
    pub pagination: Option<Pagination>,
    pub resume_token: Option<String>,
    pub revision: Option<String>,
    pub summary_fields: Option<Vec<FieldPath>>,
    pub partitions: Vec<Partition>,
}

#[derive(Debug, Clone)]
pub struct QueryResult {
    pub keys: Vec<String>,
    pub count: u64,
    pub pages: Option<u64>,
    /// Opaque cursor the caller should pass back as `resume_token` to fetch
    /// the next chunk; `None` once the last chunk has been returned.
    pub next_resume_token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use steve_core::parse_field_path;

    #[test]
    fn exists_on_label_path_is_valid() {
        let filter = Filter { path: parse_field_path("metadata.labels.app").unwrap(), op: Op::Exists, matches: vec![], partial: false };
        assert!(filter.validate().is_ok());
    }

    #[test]
    fn exists_on_non_label_path_is_rejected() {
        let filter = Filter { path: parse_field_path("spec.nodeName").unwrap(), op: Op::Exists, matches: vec![], partial: false };
        assert!(filter.validate().is_err());
    }

    #[test]
    fn non_exists_ops_are_always_valid() {
        let filter = Filter { path: parse_field_path("spec.nodeName").unwrap(), op: Op::Eq, matches: vec!["x".into()], partial: false };
        assert!(filter.validate().is_ok());
    }
}
