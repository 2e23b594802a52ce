//! HTTP API for the roster.

use crate::auditor::{Inconsistency, ReconcileSummary};
use crate::error::{Error, Result};
use crate::ledger::Membership;
use crate::models::{now_millis, Event, Participation};
use crate::node::RosterState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

type AppState = Arc<RosterState>;

/// Build the API router.
pub fn build_router(state: AppState) -> Router {
    // CORS layer for browser access
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/v1/health", get(health))
        // Events
        .route("/api/v1/events", post(create_event))
        .route("/api/v1/events/:id", get(get_event))
        .route("/api/v1/events/:id/participants", get(list_participants))
        // Membership
        .route("/api/v1/events/:id/join", post(join))
        .route("/api/v1/events/:id/leave", post(leave))
        .route("/api/v1/events/:id/request", post(request))
        .route("/api/v1/events/:id/approve", post(approve))
        // Audit
        .route("/api/v1/audit", get(audit))
        .route("/api/v1/audit/reconcile", post(reconcile))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// HTTP status for a roster error.
pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::CapacityExceeded { .. }
        | Error::AlreadyActive { .. }
        | Error::AlreadyPending { .. }
        | Error::NotActive { .. }
        | Error::NotPending { .. } => StatusCode::CONFLICT,
        Error::EventNotFound(_) => StatusCode::NOT_FOUND,
        Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
        Error::ConcurrencyConflict { .. } | Error::StoreUnavailable(_) | Error::Cancelled => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        Error::TimedOut(_) => StatusCode::GATEWAY_TIMEOUT,
        Error::Serialization(_) | Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Roster error rendered as a JSON response.
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::warn!("API error: {}", self.0);
        }
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// --- Health endpoints ---

async fn health() -> &'static str {
    "OK"
}

// --- Event endpoints ---

#[derive(Debug, Deserialize)]
struct CreateEventRequest {
    id: Option<String>,
    title: String,
    capacity: u32,
}

async fn create_event(
    State(state): State<AppState>,
    Json(req): Json<CreateEventRequest>,
) -> ApiResult<(StatusCode, Json<Event>)> {
    // Generate ID from title + timestamp
    let id = req
        .id
        .unwrap_or_else(|| Event::generate_id(format!("{}:{}", req.title, now_millis()).as_bytes()));
    let event = state.ledger.create_event(&id, &req.title, req.capacity)?;
    Ok((StatusCode::CREATED, Json(event)))
}

async fn get_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Event>> {
    Ok(Json(state.ledger.event(&id)?))
}

#[derive(Debug, Serialize)]
struct ParticipantsResponse {
    event_id: String,
    participant_count: i64,
    capacity: u32,
    active: Vec<String>,
    participations: Vec<Participation>,
}

async fn list_participants(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ParticipantsResponse>> {
    let (event, participations) = state
        .ledger
        .storage()
        .event_with_participations(&id)?
        .ok_or_else(|| Error::EventNotFound(id.clone()))?;
    let active = participations
        .iter()
        .filter(|row| row.is_active())
        .map(|row| row.user_id.clone())
        .collect();
    Ok(Json(ParticipantsResponse {
        event_id: event.id,
        participant_count: event.participant_count,
        capacity: event.capacity,
        active,
        participations,
    }))
}

// --- Membership endpoints ---

#[derive(Debug, Deserialize)]
struct MembershipRequest {
    user_id: String,
}

async fn join(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<MembershipRequest>,
) -> ApiResult<Json<Membership>> {
    let cancel = state.shutdown.child_token();
    Ok(Json(state.ledger.join(&id, &req.user_id, &cancel).await?))
}

async fn leave(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<MembershipRequest>,
) -> ApiResult<Json<Membership>> {
    let cancel = state.shutdown.child_token();
    Ok(Json(state.ledger.leave(&id, &req.user_id, &cancel).await?))
}

async fn request(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<MembershipRequest>,
) -> ApiResult<Json<Membership>> {
    let cancel = state.shutdown.child_token();
    Ok(Json(state.ledger.request(&id, &req.user_id, &cancel).await?))
}

async fn approve(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<MembershipRequest>,
) -> ApiResult<Json<Membership>> {
    let cancel = state.shutdown.child_token();
    Ok(Json(state.ledger.approve(&id, &req.user_id, &cancel).await?))
}

// --- Audit endpoints ---

async fn audit(State(state): State<AppState>) -> ApiResult<Json<Vec<Inconsistency>>> {
    let auditor = state.ledger.auditor();
    let reports = auditor.check_consistency().collect::<Result<Vec<_>>>()?;
    Ok(Json(reports))
}

async fn reconcile(State(state): State<AppState>) -> Json<ReconcileSummary> {
    let cancel = state.shutdown.child_token();
    Json(state.ledger.auditor().reconcile_all(&cancel).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{Ledger, LedgerConfig};
    use crate::node::RosterConfig;
    use crate::storage::Storage;
    use tokio_util::sync::CancellationToken;

    fn state(dir: &tempfile::TempDir) -> AppState {
        let storage = Arc::new(Storage::open(dir.path()).unwrap());
        Arc::new(RosterState {
            ledger: Ledger::new(storage, LedgerConfig::default()),
            config: RosterConfig::default(),
            shutdown: CancellationToken::new(),
        })
    }

    #[tokio::test]
    async fn participants_come_from_one_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        let cancel = CancellationToken::new();
        state.ledger.create_event("e", "E", 3).unwrap();
        state.ledger.join("e", "bob", &cancel).await.unwrap();
        state.ledger.join("e", "alice", &cancel).await.unwrap();
        state.ledger.request("e", "carol", &cancel).await.unwrap();
        state.ledger.leave("e", "bob", &cancel).await.unwrap();

        let Ok(Json(body)) = list_participants(State(state), Path("e".to_string())).await else {
            panic!("listing failed");
        };
        assert_eq!(body.participant_count, 1);
        assert_eq!(body.active, vec!["alice".to_string()]);
        assert_eq!(body.participations.len(), 3);
        assert_eq!(body.capacity, 3);
    }

    #[tokio::test]
    async fn participants_of_unknown_event_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let result = list_participants(State(state(&dir)), Path("nope".to_string())).await;
        let Err(err) = result else {
            panic!("expected an error");
        };
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn state_errors_map_to_conflict() {
        let full = Error::CapacityExceeded {
            event_id: "e".into(),
            capacity: 2,
        };
        assert_eq!(status_for(&full), StatusCode::CONFLICT);
        let not_active = Error::NotActive {
            event_id: "e".into(),
            user_id: "u".into(),
        };
        assert_eq!(status_for(&not_active), StatusCode::CONFLICT);
    }

    #[test]
    fn infrastructure_errors_map_to_5xx() {
        assert_eq!(
            status_for(&Error::StoreUnavailable("down".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&Error::TimedOut("e".into())),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_for(&Error::EventNotFound("e".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&Error::InvalidInput("bad".into())),
            StatusCode::BAD_REQUEST
        );
    }
}
