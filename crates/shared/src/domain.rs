use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub i64);
    };
}

id_newtype!(RecordId);

/// One entity in the watched collection. Identity is immutable; `fields` is an
/// opaque set that is replaced wholesale on every update. `updated_at` is the
/// server-side write time of the most recent mutation, used to reject event
/// payloads older than an already-cached copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub fields: Map<String, Value>,
    pub updated_at: DateTime<Utc>,
}

impl Record {
    /// Lowercased text projection of the scalar field values. Server-side
    /// search and the client-side filter approximation both match against
    /// this, so the two sides agree on what a search term selects.
    pub fn search_text(&self) -> String {
        search_projection(&self.fields)
    }
}

pub fn search_projection(fields: &Map<String, Value>) -> String {
    let mut parts = Vec::new();
    for value in fields.values() {
        match value {
            Value::String(text) => parts.push(text.to_lowercase()),
            Value::Number(number) => parts.push(number.to_string()),
            Value::Bool(flag) => parts.push(flag.to_string()),
            Value::Null | Value::Array(_) | Value::Object(_) => {}
        }
    }
    parts.join(" ")
}
