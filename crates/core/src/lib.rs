//! Steve core types: the dynamic object tree, GVK/GVR identity, and outward
//! error kinds shared by every other crate in the workspace.

#![forbid(unsafe_code)]

mod error;
mod gvk;
mod jsonpath;
mod object;
mod partition;
mod value;

pub use error::{SteveError, SteveResult};
pub use gvk::{Gvk, Gvr, ObjectKey};
pub use jsonpath::{parse_field_path, FieldPath, PathParseError, Segment};
pub use object::CachedObject;
pub use partition::Partition;
pub use value::Value;

pub mod prelude {
    pub use crate::{CachedObject, FieldPath, Gvk, Gvr, ObjectKey, Partition, Segment, SteveError, SteveResult, Value};
}
