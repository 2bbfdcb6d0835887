use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::Deserialize;
use shared::{
    domain::{Record, RecordId},
    error::{ApiError, ErrorCode},
    protocol::{
        BulkDeleteRequest, BulkDeleteResponse, CreateRecordRequest, ListEvent, ListPage,
        UpdateRecordRequest,
    },
};
use storage::Storage;
use tokio::sync::broadcast;
use tracing::{error, info};

mod config;

use config::{load_settings, prepare_database_url};

const MAX_PAGE_SIZE: u32 = 200;
const DEFAULT_PAGE_SIZE: u32 = 50;

#[derive(Clone)]
struct AppState {
    storage: Storage,
    events: broadcast::Sender<ListEvent>,
}

#[derive(Debug, Deserialize)]
struct ListParams {
    page: Option<u32>,
    limit: Option<u32>,
    search: Option<String>,
}

type HandlerError = (StatusCode, Json<ApiError>);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let (events, _) = broadcast::channel(256);

    let state = AppState { storage, events };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/records", get(list_records))
        .route("/records", post(create_record))
        .route("/records/:id", put(update_record))
        .route("/records/:id", delete(delete_record))
        .route("/records/bulk_delete", post(bulk_delete_records))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, HandlerError> {
    state.storage.health_check().await.map_err(internal_error)?;
    Ok("ok")
}

async fn list_records(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<ListPage>, HandlerError> {
    let page = params.page.unwrap_or(1);
    if page < 1 {
        return Err(validation_error("page must be >= 1"));
    }
    let limit = params.limit.unwrap_or(DEFAULT_PAGE_SIZE);
    if !(1..=MAX_PAGE_SIZE).contains(&limit) {
        return Err(validation_error(format!(
            "limit must be between 1 and {MAX_PAGE_SIZE}"
        )));
    }

    let (items, total_items) = state
        .storage
        .query_page(page, limit, params.search.as_deref())
        .await
        .map_err(internal_error)?;
    Ok(Json(ListPage { items, total_items }))
}

async fn create_record(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateRecordRequest>,
) -> Result<(StatusCode, Json<Record>), HandlerError> {
    let record = state
        .storage
        .create_record(req.fields)
        .await
        .map_err(internal_error)?;

    let _ = state.events.send(ListEvent::Created {
        record: record.clone(),
    });
    Ok((StatusCode::CREATED, Json(record)))
}

async fn update_record(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateRecordRequest>,
) -> Result<Json<Record>, HandlerError> {
    let record = state
        .storage
        .update_record(RecordId(id), req.fields)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| record_not_found(id))?;

    let _ = state.events.send(ListEvent::Updated {
        record: record.clone(),
    });
    Ok(Json(record))
}

async fn delete_record(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, HandlerError> {
    let deleted = state
        .storage
        .delete_record(RecordId(id))
        .await
        .map_err(internal_error)?;
    if !deleted {
        return Err(record_not_found(id));
    }

    let _ = state.events.send(ListEvent::Deleted { id: RecordId(id) });
    Ok(StatusCode::NO_CONTENT)
}

async fn bulk_delete_records(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BulkDeleteRequest>,
) -> Result<Json<BulkDeleteResponse>, HandlerError> {
    if req.ids.is_empty() {
        return Err(validation_error("ids cannot be empty"));
    }

    let deleted = state
        .storage
        .delete_records(&req.ids)
        .await
        .map_err(internal_error)?;

    // One event covering the whole batch; ids that were already gone are
    // not announced.
    if !deleted.is_empty() {
        let _ = state.events.send(ListEvent::BulkDeleted {
            ids: deleted.clone(),
        });
    }
    Ok(Json(BulkDeleteResponse { deleted }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket))
}

async fn ws_connection(state: Arc<AppState>, socket: axum::extract::ws::WebSocket) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let mut events_rx = state.events.subscribe();

    let send_task = tokio::spawn(async move {
        loop {
            let event = match events_rx.recv().await {
                Ok(event) => event,
                // A lagged subscriber just misses frames; the client resolves
                // that through its own refetch path.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(_msg)) = receiver.next().await {}

    send_task.abort();
}

fn internal_error(error: anyhow::Error) -> HandlerError {
    error!(%error, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiError::new(ErrorCode::Internal, error.to_string())),
    )
}

fn validation_error(message: impl Into<String>) -> HandlerError {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiError::new(ErrorCode::Validation, message)),
    )
}

fn record_not_found(id: i64) -> HandlerError {
    (
        StatusCode::NOT_FOUND,
        Json(ApiError::new(
            ErrorCode::NotFound,
            format!("record {id} not found"),
        )),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{to_bytes, Body},
        http::Request,
    };
    use serde_json::json;
    use tower::ServiceExt;

    async fn test_app() -> (Router, broadcast::Receiver<ListEvent>) {
        let storage = Storage::new("sqlite::memory:").await.expect("db");
        let (events, events_rx) = broadcast::channel(32);
        let app = build_router(Arc::new(AppState { storage, events }));
        (app, events_rx)
    }

    async fn create(app: &Router, reference: &str) -> Record {
        let request = Request::post("/records")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({ "fields": { "reference": reference } }).to_string(),
            ))
            .expect("request");
        let response = app.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::CREATED);
        decode(response).await
    }

    async fn decode<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("decode body")
    }

    #[tokio::test]
    async fn created_records_appear_in_the_listing_newest_first() {
        let (app, _events) = test_app().await;
        create(&app, "ORD-1").await;
        create(&app, "ORD-2").await;

        let response = app
            .oneshot(
                Request::get("/records?page=1&limit=10")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let page: ListPage = decode(response).await;
        assert_eq!(page.total_items, 2);
        let references: Vec<_> = page
            .items
            .iter()
            .map(|r| r.fields["reference"].as_str().expect("reference"))
            .collect();
        assert_eq!(references, vec!["ORD-2", "ORD-1"]);
    }

    #[tokio::test]
    async fn listing_filters_on_the_search_projection() {
        let (app, _events) = test_app().await;
        create(&app, "ORD-1").await;
        create(&app, "INV-1").await;

        let response = app
            .oneshot(
                Request::get("/records?search=ord")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        let page: ListPage = decode(response).await;
        assert_eq!(page.total_items, 1);
        assert_eq!(page.items[0].fields["reference"], "ORD-1");
    }

    #[tokio::test]
    async fn each_mutation_publishes_exactly_one_event() {
        let (app, mut events) = test_app().await;
        let created = create(&app, "ORD-1").await;
        assert_eq!(
            events.recv().await.expect("event"),
            ListEvent::Created {
                record: created.clone()
            }
        );

        let response = app
            .clone()
            .oneshot(
                Request::put(format!("/records/{}", created.id.0))
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({ "fields": { "reference": "ORD-1b" } }).to_string(),
                    ))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let updated: Record = decode(response).await;
        assert_eq!(
            events.recv().await.expect("event"),
            ListEvent::Updated { record: updated }
        );

        let response = app
            .oneshot(
                Request::delete(format!("/records/{}", created.id.0))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            events.recv().await.expect("event"),
            ListEvent::Deleted { id: created.id }
        );
    }

    #[tokio::test]
    async fn mutating_a_missing_record_is_not_found_and_publishes_nothing() {
        let (app, mut events) = test_app().await;

        let response = app
            .clone()
            .oneshot(
                Request::put("/records/999")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({ "fields": {} }).to_string()))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .clone()
            .oneshot(
                Request::delete("/records/999")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn bulk_delete_reports_and_announces_only_existing_ids() {
        let (app, mut events) = test_app().await;
        let first = create(&app, "ORD-1").await;
        let second = create(&app, "ORD-2").await;
        let _ = events.recv().await;
        let _ = events.recv().await;

        let response = app
            .oneshot(
                Request::post("/records/bulk_delete")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({ "ids": [first.id.0, second.id.0, 999] }).to_string(),
                    ))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let body: BulkDeleteResponse = decode(response).await;
        assert_eq!(body.deleted, vec![first.id, second.id]);
        assert_eq!(
            events.recv().await.expect("event"),
            ListEvent::BulkDeleted {
                ids: vec![first.id, second.id]
            }
        );
    }

    #[tokio::test]
    async fn out_of_range_limit_is_rejected() {
        let (app, _events) = test_app().await;
        let response = app
            .oneshot(
                Request::get("/records?limit=5000")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
