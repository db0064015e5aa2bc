//! The extended query grammar the URL layer hands the planner: `&` across
//! `OrFilter` groups, `,` within one; `=, ==, !=, ~, !~, <, >, in (…),
//! notin (…)`, a `!` prefix for does-not-exist. `in`/`notin`/`gt`/`lt` are
//! case-insensitive keywords.

use std::sync::OnceLock;

use regex::Regex;
use steve_core::parse_field_path;
use thiserror::Error;

use crate::types::{Filter, Op, OrFilter};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GrammarError {
    #[error("invalid field path in filter expression: {0}")]
    Path(String),
    #[error("malformed filter clause: {0}")]
    Clause(String),
    #[error("unterminated parenthesis in: {0}")]
    UnterminatedParen(String),
}

fn clause_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?xi)^(?P<bang>!)?(?P<path>[^=!~<>\s(]+)\s*(?:(?P<op>==|=|!=|!~|~|<|>|notin|in|gt|lt)\s*(?P<value>.*))?$")
            .expect("static grammar regex is valid")
    })
}

/// Parses the full query string into `OrFilter` groups, ANDed.
pub fn parse(query: &str) -> Result<Vec<OrFilter>, GrammarError> {
    let query = query.trim();
    if query.is_empty() {
        return Ok(Vec::new());
    }
    split_respecting_parens(query, '&')?
        .into_iter()
        .map(|group| parse_or_group(&group))
        .collect()
}

fn parse_or_group(group: &str) -> Result<OrFilter, GrammarError> {
    let filters = split_respecting_parens(group, ',')?
        .into_iter()
        .map(|clause| parse_clause(&clause))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(OrFilter(filters))
}

fn parse_clause(clause: &str) -> Result<Filter, GrammarError> {
    let clause = clause.trim();
    let caps = clause_regex()
        .captures(clause)
        .ok_or_else(|| GrammarError::Clause(clause.to_string()))?;

    let path_str = caps.name("path").map(|m| m.as_str().trim()).unwrap_or_default();
    let path = parse_field_path(path_str).map_err(|e| GrammarError::Path(format!("{path_str}: {e}")))?;
    let bang = caps.name("bang").is_some();
    let op_token = caps.name("op").map(|m| m.as_str().to_ascii_lowercase());
    let value = caps.name("value").map(|m| m.as_str().trim()).unwrap_or_default();

    match (bang, op_token.as_deref()) {
        (true, None) => Ok(Filter { path, op: Op::NotExists, matches: Vec::new(), partial: false }),
        (false, None) => Ok(Filter { path, op: Op::Exists, matches: Vec::new(), partial: false }),
        (_, Some("=")) | (_, Some("==")) => {
            Ok(Filter { path, op: Op::Eq, matches: vec![value.to_string()], partial: false })
        }
        (_, Some("!=")) => Ok(Filter { path, op: Op::Ne, matches: vec![value.to_string()], partial: false }),
        (_, Some("~")) => Ok(Filter { path, op: Op::Eq, matches: vec![value.to_string()], partial: true }),
        (_, Some("!~")) => Ok(Filter { path, op: Op::Ne, matches: vec![value.to_string()], partial: true }),
        (_, Some("<")) | (_, Some("lt")) => {
            Ok(Filter { path, op: Op::Lt, matches: vec![value.to_string()], partial: false })
        }
        (_, Some(">")) | (_, Some("gt")) => {
            Ok(Filter { path, op: Op::Gt, matches: vec![value.to_string()], partial: false })
        }
        (_, Some("in")) => Ok(Filter { path, op: Op::In, matches: parse_value_list(value)?, partial: false }),
        (_, Some("notin")) => Ok(Filter { path, op: Op::NotIn, matches: parse_value_list(value)?, partial: false }),
        _ => Err(GrammarError::Clause(clause.to_string())),
    }
}

fn parse_value_list(value: &str) -> Result<Vec<String>, GrammarError> {
    let inner = value
        .strip_prefix('(')
        .and_then(|v| v.strip_suffix(')'))
        .ok_or_else(|| GrammarError::Clause(format!("expected parenthesized list, got `{value}`")))?;
    Ok(inner.split(',').map(|s| s.trim().trim_matches('"').to_string()).filter(|s| !s.is_empty()).collect())
}

/// Splits `s` on `sep` at the top nesting level only — commas or ampersands
/// inside an `in (...)`/`notin (...)` value list don't split the clause.
fn split_respecting_parens(s: &str, sep: char) -> Result<Vec<String>, GrammarError> {
    let mut depth = 0i32;
    let mut out = Vec::new();
    let mut cur = String::new();
    for c in s.chars() {
        match c {
            '(' => {
                depth += 1;
                cur.push(c);
            }
            ')' => {
                depth -= 1;
                cur.push(c);
            }
            c if c == sep && depth == 0 => {
                out.push(std::mem::take(&mut cur));
            }
            c => cur.push(c),
        }
    }
    if depth != 0 {
        return Err(GrammarError::UnterminatedParen(s.to_string()));
    }
    out.push(cur);
    Ok(out.into_iter().map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_match_operator() {
        let groups = parse("metadata.name~alpha").unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].0.len(), 1);
        assert_eq!(groups[0].0[0].op, Op::Eq);
        assert!(groups[0].0[0].partial);
        assert_eq!(groups[0].0[0].matches, vec!["alpha"]);
    }

    #[test]
    fn or_group_comma_separated() {
        let groups = parse("metadata.name=alpha,metadata.name=beta").unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].0.len(), 2);
    }

    #[test]
    fn and_groups_ampersand_separated() {
        let groups = parse("metadata.name=alpha&status.phase=Running").unwrap();
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn in_and_notin_keyword_case_insensitive_with_value_list() {
        let groups = parse("status.phase IN (Running,Pending)").unwrap();
        assert_eq!(groups[0].0[0].op, Op::In);
        assert_eq!(groups[0].0[0].matches, vec!["Running", "Pending"]);

        let groups2 = parse("status.phase NOTIN (Failed)").unwrap();
        assert_eq!(groups2[0].0[0].op, Op::NotIn);
        assert_eq!(groups2[0].0[0].matches, vec!["Failed"]);
    }

    #[test]
    fn bang_prefix_is_not_exists_on_label_path() {
        let groups = parse("!metadata.labels.app").unwrap();
        assert_eq!(groups[0].0[0].op, Op::NotExists);
    }

    #[test]
    fn bare_path_is_exists() {
        let groups = parse("metadata.labels.app").unwrap();
        assert_eq!(groups[0].0[0].op, Op::Exists);
    }

    #[test]
    fn commas_inside_in_list_do_not_split_the_or_group() {
        let groups = parse("status.phase in (Running,Pending)&metadata.name=alpha").unwrap();
        assert_eq!(groups.len(), 2, "the in(...) comma list must not be mistaken for an OR group separator");
    }

    #[test]
    fn gt_lt_keywords_and_symbols_are_equivalent() {
        let sym = parse("spec.replicas>3").unwrap();
        let kw = parse("spec.replicas gt 3").unwrap();
        assert_eq!(sym[0].0[0].op, kw[0].0[0].op);
        assert_eq!(sym[0].0[0].matches, kw[0].0[0].matches);
    }
}
