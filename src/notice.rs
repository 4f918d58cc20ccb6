//! Purpose: Define a stable, structured schema for non-fatal stderr notices.
//! Exports: `Notice`, `notice_json`.
//! Role: Shared contract helper for CLI diagnostics such as background refresh results.
//! Invariants: Notices are non-fatal and never alter stdout payloads.
//! Invariants: JSON schema is stable once published; fields are additive-only.
use serde_json::{Map, Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::core::keyword::LibraryKey;
use crate::core::store::CacheEntry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: String,
    pub time: String,
    pub cmd: String,
    pub library: String,
    pub message: String,
    pub details: Map<String, Value>,
}

impl Notice {
    /// A background refresh replaced the cached keywords of `key`.
    ///
    /// `entry` is the stored entry as read after the refresh; when present its
    /// keyword names and `last_updated` go into `details`.
    pub fn keywords_changed(
        cmd: &str,
        key: &LibraryKey,
        entry: Option<&CacheEntry>,
        at: OffsetDateTime,
    ) -> Self {
        let mut details = Map::new();
        details.insert("args".to_string(), json!(key.args));
        if let Some(entry) = entry {
            let names: Vec<&str> = entry.keywords.iter().map(|kw| kw.name.as_str()).collect();
            details.insert("keywords".to_string(), json!(names));
            if let Ok(updated) = entry.last_updated.format(&Rfc3339) {
                details.insert("last_updated".to_string(), json!(updated));
            }
        }
        Self {
            kind: "refresh".to_string(),
            time: at.format(&Rfc3339).unwrap_or_default(),
            cmd: cmd.to_string(),
            library: key.path.clone(),
            message: "library keywords changed; cached entry replaced".to_string(),
            details,
        }
    }
}

pub fn notice_json(notice: &Notice) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(notice.kind));
    inner.insert("time".to_string(), json!(notice.time));
    inner.insert("cmd".to_string(), json!(notice.cmd));
    inner.insert("library".to_string(), json!(notice.library));
    inner.insert("message".to_string(), json!(notice.message));
    inner.insert("details".to_string(), Value::Object(notice.details.clone()));

    let mut outer = Map::new();
    outer.insert("notice".to_string(), Value::Object(inner));
    Value::Object(outer)
}
