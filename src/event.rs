use bincode::{Decode, Encode};
use std::fmt;

/// One resolved document view: who (pseudonymous), what, when.
///
/// Field order matters: the derived `Ord` sorts by user, then document,
/// then timestamp, which is exactly the key the deduplicator needs.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode)]
pub struct AccessEvent {
    pub user_key: String,
    pub document_id: String,
    pub timestamp: i64,
}

impl AccessEvent {
    pub fn new(user_key: impl Into<String>, document_id: impl Into<String>, timestamp: i64) -> Self {
        Self {
            user_key: user_key.into(),
            document_id: document_id.into(),
            timestamp,
        }
    }

    /// Parse a `user document timestamp` line. Returns `None` for anything
    /// that is not exactly three whitespace-separated fields with an integer
    /// timestamp.
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let user_key = fields.next()?;
        let document_id = fields.next()?;
        let timestamp = fields.next()?.parse::<i64>().ok()?;
        if fields.next().is_some() {
            return None;
        }
        Some(Self::new(user_key, document_id, timestamp))
    }

    /// Same user viewing the same document, regardless of when.
    pub fn same_view(&self, other: &AccessEvent) -> bool {
        self.user_key == other.user_key && self.document_id == other.document_id
    }

    /// Rough in-memory footprint, used to cut sort runs.
    pub fn approx_bytes(&self) -> usize {
        // two String headers + i64
        self.user_key.len() + self.document_id.len() + 2 * 24 + 8
    }
}

impl fmt::Display for AccessEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.user_key, self.document_id, self.timestamp)
    }
}

/// A field is only usable in a flat line if it is non-empty and has no whitespace.
pub fn is_line_safe(field: &str) -> bool {
    !field.is_empty() && !field.chars().any(char::is_whitespace)
}

/// Final ranked neighbor of a source document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoAccessRecord {
    pub source_document: String,
    pub neighbor_document: String,
    pub count: u64,
}
