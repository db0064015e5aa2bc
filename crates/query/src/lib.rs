//! Declarative `ListOptions`, the extended query grammar, and the SQL
//! compiler.

#![forbid(unsafe_code)]

mod compile;
mod grammar;
mod planner;
mod types;

pub use compile::{compile, CompiledSql};
pub use grammar::{parse, GrammarError};
pub use planner::Planner;
pub use types::{Filter, ListOptions, Op, OrFilter, Pagination, QueryResult, SortSpec};
