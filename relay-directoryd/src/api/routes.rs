use std::sync::Arc;
use axum::{
    extract::{rejection::FormRejection, Form, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD as B64, Engine};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use shared::protocol::{CHECKIN_PATH, COORDINATION_PATH, DIGEST_HEADER, RECORDS_PATH, REGISTER_PATH};
use shared::types::RecordList;
use crate::api::wire::{BatchRequest, BatchResponse, ErrorResponse, RecordStatus};
use crate::coordinator::Coordinator;
use crate::crypto::Authority;
use crate::registry::Registry;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub coordinator: Arc<Coordinator>,
    pub authority: Arc<Authority>,
}

#[derive(Deserialize)]
pub struct RecordsQuery {
    pub since: Option<String>,
}

#[derive(Deserialize)]
pub struct CoordinationForm {
    pub payload: String,
    pub digest: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(REGISTER_PATH, post(register))
        .route(CHECKIN_PATH, post(check_in))
        .route(RECORDS_PATH, get(records))
        .route(COORDINATION_PATH, post(coordinate))
        .with_state(state)
}

/// Serialize `body` and attach the authority's signature over the exact bytes sent
fn signed_json<T: Serialize>(authority: &Authority, status: StatusCode, body: &T) -> Response {
    let signed = serde_json::to_vec(body)
        .map_err(anyhow::Error::from)
        .and_then(|bytes| {
            let digest = authority.sign(&bytes)?;
            Ok((bytes, B64.encode(digest)))
        });

    let (bytes, digest) = match signed {
        Ok(signed) => signed,
        Err(e) => {
            tracing::error!("Failed to sign response: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let mut response = (status, bytes).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    // base64 output is always a valid header value
    if let Ok(value) = HeaderValue::from_str(&digest) {
        headers.insert(DIGEST_HEADER, value);
    }
    response
}

async fn register(State(state): State<AppState>, Json(batch): Json<BatchRequest>) -> Response {
    let mut results = Vec::with_capacity(batch.records.len());

    for submission in batch.records {
        let label = submission.service_id.clone();
        let status = match submission.into_record(true) {
            Ok(record) => match state.registry.register(record).await {
                Ok(()) => RecordStatus::success(label, "registered"),
                Err(e) => RecordStatus::rejected(label, &e),
            },
            Err(e) => RecordStatus::bad_request(label, &e),
        };
        results.push(status);
    }

    persist_after_batch(&state.registry).await;
    signed_json(&state.authority, StatusCode::OK, &BatchResponse { results })
}

async fn check_in(State(state): State<AppState>, Json(batch): Json<BatchRequest>) -> Response {
    let mut results = Vec::with_capacity(batch.records.len());

    for submission in batch.records {
        let label = submission.service_id.clone();
        let status = match submission.into_record(false) {
            Ok(record) => match state.registry.check_in(&record) {
                Ok(stamped) => RecordStatus::success(
                    label,
                    format!("checked in at {}", stamped.to_rfc3339_opts(SecondsFormat::Millis, true)),
                ),
                Err(e) => RecordStatus::rejected(label, &e),
            },
            Err(e) => RecordStatus::bad_request(label, &e),
        };
        results.push(status);
    }

    persist_after_batch(&state.registry).await;
    signed_json(&state.authority, StatusCode::OK, &BatchResponse { results })
}

async fn persist_after_batch(registry: &Registry) {
    if let Err(e) = registry.persist().await {
        tracing::error!("Failed to persist snapshot: {}", e);
    }
}

async fn records(State(state): State<AppState>, Query(query): Query<RecordsQuery>) -> Response {
    let since = match parse_since(query.since.as_deref()) {
        Ok(since) => since,
        Err(error) => {
            return signed_json(&state.authority, StatusCode::BAD_REQUEST, &ErrorResponse { error });
        }
    };

    let list = RecordList {
        records: state.registry.snapshot(since),
    };
    signed_json(&state.authority, StatusCode::OK, &list)
}

/// `since` is unix milliseconds; absent means everything
fn parse_since(raw: Option<&str>) -> Result<DateTime<Utc>, String> {
    let Some(raw) = raw else {
        return Ok(DateTime::<Utc>::UNIX_EPOCH);
    };
    let millis: i64 = raw
        .trim()
        .parse()
        .map_err(|_| format!("invalid since parameter: {:?}", raw))?;
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| format!("since parameter out of range: {}", millis))
}

/// Partners never learn whether a delta was accepted.
async fn coordinate(
    State(state): State<AppState>,
    form: Result<Form<CoordinationForm>, FormRejection>,
) -> StatusCode {
    match form {
        Ok(Form(form)) => {
            state.coordinator.ingest(&form.payload, &form.digest).await;
        }
        Err(e) => tracing::debug!("Dropping malformed coordination request: {}", e),
    }
    StatusCode::OK
}
