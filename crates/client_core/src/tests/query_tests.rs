use super::*;
use chrono::{TimeZone, Utc};
use serde_json::json;
use shared::domain::{Record, RecordId};
use tokio::sync::{mpsc, oneshot};

fn record(id: i64, reference: &str) -> Record {
    Record {
        id: RecordId(id),
        fields: json!({ "reference": reference })
            .as_object()
            .expect("object")
            .clone(),
        updated_at: Utc.timestamp_opt(1_000, 0).single().expect("timestamp"),
    }
}

struct PendingQuery {
    query: ListQuery,
    respond: oneshot::Sender<Result<ListPage, StoreQueryError>>,
}

/// Backend that parks every query until the test answers it, so response
/// arrival order is fully under test control.
struct ScriptedBackend {
    requests: mpsc::UnboundedSender<PendingQuery>,
}

#[async_trait]
impl StoreBackend for ScriptedBackend {
    async fn query_page(&self, query: &ListQuery) -> Result<ListPage, StoreQueryError> {
        let (respond, response) = oneshot::channel();
        self.requests
            .send(PendingQuery {
                query: query.clone(),
                respond,
            })
            .expect("test is listening");
        response.await.expect("test answers every query")
    }
}

fn scripted() -> (Arc<QueryController>, mpsc::UnboundedReceiver<PendingQuery>) {
    let (requests, pending) = mpsc::unbounded_channel();
    let controller = Arc::new(QueryController::new(Arc::new(ScriptedBackend { requests })));
    (controller, pending)
}

#[tokio::test]
async fn translates_page_index_to_one_based_store_page() {
    let (controller, mut pending) = scripted();
    let fetch = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.fetch(2, 25, Some("  ord  ")).await }
    });

    let request = pending.recv().await.expect("query issued");
    assert_eq!(
        request.query,
        ListQuery {
            page: 3,
            limit: 25,
            search: Some("ord".to_string()),
        }
    );
    request
        .respond
        .send(Ok(ListPage {
            items: vec![],
            total_items: 0,
        }))
        .expect("respond");

    let snapshot = fetch
        .await
        .expect("join")
        .expect("fetch ok")
        .expect("applied");
    assert_eq!(snapshot.page_index, 2);
    assert_eq!(snapshot.page_size, 25);
    assert_eq!(snapshot.filter.as_deref(), Some("ord"));
}

#[tokio::test]
async fn blank_filter_is_treated_as_unfiltered() {
    let (controller, mut pending) = scripted();
    let fetch = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.fetch(0, 10, Some("   ")).await }
    });

    let request = pending.recv().await.expect("query issued");
    assert_eq!(request.query.search, None);
    request
        .respond
        .send(Ok(ListPage {
            items: vec![],
            total_items: 0,
        }))
        .expect("respond");
    fetch.await.expect("join").expect("fetch ok");
}

#[tokio::test]
async fn late_response_for_superseded_request_is_discarded() {
    let (controller, mut pending) = scripted();

    let first = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.fetch(0, 3, None).await }
    });
    let first_request = pending.recv().await.expect("first query");

    let second = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.fetch(1, 3, None).await }
    });
    let second_request = pending.recv().await.expect("second query");

    // The later request resolves first and is applied.
    second_request
        .respond
        .send(Ok(ListPage {
            items: vec![record(4, "D")],
            total_items: 4,
        }))
        .expect("respond");
    let applied = second
        .await
        .expect("join")
        .expect("fetch ok")
        .expect("applied");
    assert_eq!(applied.page_index, 1);

    // The earlier request's response arrives afterwards and must lose.
    first_request
        .respond
        .send(Ok(ListPage {
            items: vec![record(1, "A")],
            total_items: 4,
        }))
        .expect("respond");
    let discarded = first.await.expect("join").expect("fetch ok");
    assert!(discarded.is_none());
}

#[tokio::test]
async fn in_order_responses_all_apply() {
    let (controller, mut pending) = scripted();

    for expected_page in 1..=3u32 {
        let fetch = tokio::spawn({
            let controller = Arc::clone(&controller);
            async move { controller.fetch(expected_page - 1, 3, None).await }
        });
        let request = pending.recv().await.expect("query issued");
        assert_eq!(request.query.page, expected_page);
        request
            .respond
            .send(Ok(ListPage {
                items: vec![],
                total_items: 0,
            }))
            .expect("respond");
        assert!(fetch
            .await
            .expect("join")
            .expect("fetch ok")
            .is_some());
    }
}

#[tokio::test]
async fn earlier_success_still_applies_when_newer_request_failed() {
    let (controller, mut pending) = scripted();

    let first = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.fetch(0, 3, None).await }
    });
    let first_request = pending.recv().await.expect("first query");

    let second = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.fetch(1, 3, None).await }
    });
    let second_request = pending.recv().await.expect("second query");

    second_request
        .respond
        .send(Err(StoreQueryError::Rejected {
            status: 500,
            message: "store unavailable".to_string(),
        }))
        .expect("respond");
    assert!(second.await.expect("join").is_err());

    // Nothing newer was applied, so the older response still wins.
    first_request
        .respond
        .send(Ok(ListPage {
            items: vec![record(1, "A")],
            total_items: 1,
        }))
        .expect("respond");
    assert!(first
        .await
        .expect("join")
        .expect("fetch ok")
        .is_some());
}

#[tokio::test]
async fn snapshot_is_normalized_against_a_misbehaving_store() {
    let (controller, mut pending) = scripted();
    let fetch = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.fetch(0, 2, None).await }
    });

    let request = pending.recv().await.expect("query issued");
    request
        .respond
        .send(Ok(ListPage {
            // Duplicate id, more items than the page size, and a total
            // below the item count.
            items: vec![record(1, "A"), record(1, "A-dup"), record(2, "B"), record(3, "C")],
            total_items: 0,
        }))
        .expect("respond");

    let snapshot = fetch
        .await
        .expect("join")
        .expect("fetch ok")
        .expect("applied");
    let ids: Vec<_> = snapshot.items.iter().map(|item| item.id).collect();
    assert_eq!(ids, vec![RecordId(1), RecordId(2)]);
    assert_eq!(snapshot.total_count, 2);
}
