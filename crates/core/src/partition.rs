//! Partition scoping shared between the partitioner (component H) and the
//! query planner (component C), which turns a partition set into a `WHERE`
//! clause.

/// One scope a user's list is restricted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Partition {
    /// No restriction: the user may list every object of this GVK.
    Passthrough,
    /// Restricted to one namespace, optionally to a specific set of names
    /// within it. Cluster-scoped resources never produce this variant.
    Scoped { namespace: String, names: Option<Vec<String>> },
}

impl Partition {
    pub fn is_passthrough(&self) -> bool {
        matches!(self, Partition::Passthrough)
    }
}
