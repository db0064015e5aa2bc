//! Field-path parsing shared by the query planner (filter/sort paths) and the
//! schema controller (printer-column JSONPaths).
//!
//! Handles simple dotted paths with an optional trailing `[index]`, plus
//! three label-path syntaxes: `metadata.labels.foo`, `metadata.labels[foo]`,
//! `metadata.labels["foo/bar"]`.

use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath(pub Vec<Segment>);

impl FieldPath {
    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    /// `true` when this path addresses a label subfield, e.g.
    /// `metadata.labels.foo` or `metadata.labels["a/b"]`.
    pub fn is_label_path(&self) -> bool {
        matches!(self.0.first(), Some(Segment::Key(k)) if k == "metadata")
            && matches!(self.0.get(1), Some(Segment::Key(k)) if k == "labels")
            && self.0.len() >= 3
    }

    /// The label key addressed by a label path (panics-free: returns `None`
    /// if this isn't one).
    pub fn label_key(&self) -> Option<&str> {
        if !self.is_label_path() {
            return None;
        }
        match &self.0[2] {
            Segment::Key(k) => Some(k.as_str()),
            Segment::Index(_) => None,
        }
    }

    /// Render back to the canonical dotted form, used as the column name in
    /// the `fields` table and in stable-SQL tests.
    pub fn to_dotted(&self) -> String {
        let mut out = String::new();
        for (i, seg) in self.0.iter().enumerate() {
            match seg {
                Segment::Key(k) if k.contains('.') || k.contains('/') => {
                    out.push_str(&format!("[\"{}\"]", k));
                }
                Segment::Key(k) => {
                    if i > 0 {
                        out.push('.');
                    }
                    out.push_str(k);
                }
                Segment::Index(n) => out.push_str(&format!("[{}]", n)),
            }
        }
        out
    }

    pub fn get<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        let mut cur = root;
        for seg in &self.0 {
            cur = match (cur, seg) {
                (Value::Object(m), Segment::Key(k)) => m.get(k)?,
                (Value::Array(a), Segment::Index(i)) => a.get(*i)?,
                _ => return None,
            };
        }
        Some(cur)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PathParseError {
    #[error("empty field path")]
    Empty,
    #[error("unterminated bracket in field path")]
    UnterminatedBracket,
    #[error("invalid segment in field path: {0}")]
    InvalidSegment(String),
}

/// Parse a dotted/bracketed field path into segments.
///
/// Accepts:
/// - plain dotted keys: `metadata.labels.foo`
/// - bracketed bare keys: `metadata.labels[foo]`
/// - bracketed quoted keys (required when the key has `.` or `/`):
///   `metadata.labels["foo/bar"]`
/// - bracketed numeric indices: `spec.dnsNames[0]`
pub fn parse_field_path(input: &str) -> Result<FieldPath, PathParseError> {
    if input.is_empty() {
        return Err(PathParseError::Empty);
    }
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0usize;
    let mut segments = Vec::new();
    let mut cur = String::new();

    let flush = |cur: &mut String, segments: &mut Vec<Segment>| {
        if !cur.is_empty() {
            segments.push(Segment::Key(std::mem::take(cur)));
        }
    };

    while i < chars.len() {
        match chars[i] {
            '.' => {
                flush(&mut cur, &mut segments);
                i += 1;
            }
            '[' => {
                flush(&mut cur, &mut segments);
                i += 1;
                if i >= chars.len() {
                    return Err(PathParseError::UnterminatedBracket);
                }
                if chars[i] == '"' || chars[i] == '\'' {
                    let quote = chars[i];
                    i += 1;
                    let start = i;
                    while i < chars.len() && chars[i] != quote {
                        i += 1;
                    }
                    if i >= chars.len() {
                        return Err(PathParseError::UnterminatedBracket);
                    }
                    let key: String = chars[start..i].iter().collect();
                    i += 1; // closing quote
                    if i >= chars.len() || chars[i] != ']' {
                        return Err(PathParseError::UnterminatedBracket);
                    }
                    i += 1;
                    segments.push(Segment::Key(key));
                } else {
                    let start = i;
                    while i < chars.len() && chars[i] != ']' {
                        i += 1;
                    }
                    if i >= chars.len() {
                        return Err(PathParseError::UnterminatedBracket);
                    }
                    let raw: String = chars[start..i].iter().collect();
                    i += 1; // closing bracket
                    if let Ok(n) = raw.parse::<usize>() {
                        segments.push(Segment::Index(n));
                    } else if raw.is_empty() {
                        return Err(PathParseError::InvalidSegment(raw));
                    } else {
                        segments.push(Segment::Key(raw));
                    }
                }
            }
            c => {
                cur.push(c);
                i += 1;
            }
        }
    }
    flush(&mut cur, &mut segments);

    if segments.is_empty() {
        return Err(PathParseError::Empty);
    }
    Ok(FieldPath(segments))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_label_syntaxes_normalize_equal() {
        let a = parse_field_path("metadata.labels.foo").unwrap();
        let b = parse_field_path("metadata.labels[foo]").unwrap();
        let c = parse_field_path(r#"metadata.labels["foo"]"#).unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert!(a.is_label_path());
        assert_eq!(a.label_key(), Some("foo"));
    }

    #[test]
    fn bracket_quoting_required_for_dotted_or_slashed_keys() {
        let p = parse_field_path(r#"metadata.labels["app.kubernetes.io/name"]"#).unwrap();
        assert_eq!(p.label_key(), Some("app.kubernetes.io/name"));
    }

    #[test]
    fn numeric_index_segment() {
        let p = parse_field_path("spec.dnsNames[0]").unwrap();
        assert_eq!(p.0, vec![Segment::Key("spec".into()), Segment::Key("dnsNames".into()), Segment::Index(0)]);
    }

    #[test]
    fn unterminated_bracket_is_an_error() {
        assert_eq!(parse_field_path("metadata.labels[foo"), Err(PathParseError::UnterminatedBracket));
    }

    #[test]
    fn get_walks_value_tree() {
        let v = Value::from(serde_json::json!({"spec": {"containers": [{"image": "alpine"}]}}));
        let p = parse_field_path("spec.containers[0].image").unwrap();
        assert_eq!(p.get(&v).and_then(|v| v.as_str()), Some("alpine"));
    }
}
