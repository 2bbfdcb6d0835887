use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::{Record, RecordId};

/// One full-replacement page request against the authoritative store.
/// `page` is 1-based, matching the store's query contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListQuery {
    pub page: u32,
    pub limit: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListPage {
    pub items: Vec<Record>,
    pub total_items: u64,
}

/// Mutation notification fanned out on the event channel. Delivery toward any
/// given client is at-least-once-or-zero: a frame may arrive twice or never,
/// so consumers must treat these as advisory patches, not a log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ListEvent {
    Created { record: Record },
    Updated { record: Record },
    Deleted { id: RecordId },
    BulkDeleted { ids: Vec<RecordId> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRecordRequest {
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRecordRequest {
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkDeleteRequest {
    pub ids: Vec<RecordId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkDeleteResponse {
    pub deleted: Vec<RecordId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn list_event_uses_snake_case_wire_names() {
        let deleted = serde_json::to_value(ListEvent::Deleted { id: RecordId(7) }).expect("json");
        assert_eq!(deleted, json!({ "type": "deleted", "payload": { "id": 7 } }));

        let bulk = serde_json::to_value(ListEvent::BulkDeleted {
            ids: vec![RecordId(1), RecordId(2)],
        })
        .expect("json");
        assert_eq!(
            bulk,
            json!({ "type": "bulk_deleted", "payload": { "ids": [1, 2] } })
        );
    }

    #[test]
    fn created_event_round_trips_record_payload() {
        let record = Record {
            id: RecordId(3),
            fields: json!({ "reference": "ORD-3" })
                .as_object()
                .expect("object")
                .clone(),
            updated_at: Utc::now(),
        };
        let encoded =
            serde_json::to_string(&ListEvent::Created { record: record.clone() }).expect("encode");
        let decoded: ListEvent = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, ListEvent::Created { record });
    }
}
