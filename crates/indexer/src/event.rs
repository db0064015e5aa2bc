//! The event record shape appended to the ring on every mutation.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Add,
    Change,
    Remove,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Add => "add",
            EventKind::Change => "change",
            EventKind::Remove => "remove",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventRecord {
    pub seq: u64,
    pub kind: EventKind,
    pub key: String,
    /// Decoded JSON of the new object; `None` for `remove`.
    pub object: Option<serde_json::Value>,
    /// Decoded JSON of the object that was replaced or removed.
    pub prev_object: Option<serde_json::Value>,
    pub rv: Option<String>,
}
