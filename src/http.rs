//! HTTP trigger for pipeline runs.
//!
//! | Method | Path                 | Body                 |
//! |--------|----------------------|----------------------|
//! | POST   | `/runs`              | `RunRequest`         |
//! | GET    | `/runs`              |                      |
//! | GET    | `/runs/:id`          |                      |
//! | POST   | `/runs/:id/abort`    |                      |
//! | POST   | `/runs/:id/approve`  | `{"approved": bool}` |
//! | GET    | `/health`            |                      |

use std::net::SocketAddr;

use axum::{
  Json, Router,
  extract::{Path, State},
  http::StatusCode,
  response::{IntoResponse, Response},
  routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::coordinator::{PipelineCoordinator, RunRequest};
use crate::definitions_io::validate_ids;
use crate::error::ControlError;

#[derive(Debug, Serialize, Deserialize)]
pub struct Submitted {
  pub id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApprovalBody {
  pub approved: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
  pub error: String,
}

/// Error response with a JSON body.
struct Failure(StatusCode, String);

impl IntoResponse for Failure {
  fn into_response(self) -> Response {
    (self.0, Json(ErrorBody { error: self.1 })).into_response()
  }
}

impl From<ControlError> for Failure {
  fn from(e: ControlError) -> Self {
    let status = match e {
      ControlError::NotFound => StatusCode::NOT_FOUND,
      ControlError::NotActive => StatusCode::CONFLICT,
    };
    Failure(status, e.to_string())
  }
}

pub fn router(coordinator: PipelineCoordinator) -> Router {
  Router::new()
    .route("/health", get(health))
    .route("/runs", post(submit_run).get(list_runs))
    .route("/runs/:id", get(get_run))
    .route("/runs/:id/abort", post(abort_run))
    .route("/runs/:id/approve", post(approve_run))
    .layer(TraceLayer::new_for_http())
    .layer(CorsLayer::permissive())
    .with_state(coordinator)
}

/// Serves the trigger on `addr` until ctrl-c.
pub async fn serve(coordinator: PipelineCoordinator, addr: SocketAddr) -> std::io::Result<()> {
  let listener = tokio::net::TcpListener::bind(addr).await?;
  info!(addr = %listener.local_addr()?, "pipeline trigger listening");
  axum::serve(listener, router(coordinator))
    .with_graceful_shutdown(async {
      if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "could not install ctrl-c handler");
      }
      info!("shutting down pipeline trigger");
    })
    .await
}

async fn health() -> &'static str {
  "ok"
}

async fn submit_run(
  State(coordinator): State<PipelineCoordinator>,
  Json(request): Json<RunRequest>,
) -> Result<(StatusCode, Json<Submitted>), Failure> {
  validate_ids(&request.definitions).map_err(|e| Failure(StatusCode::BAD_REQUEST, e.to_string()))?;
  let id = coordinator.submit(request);
  Ok((StatusCode::ACCEPTED, Json(Submitted { id })))
}

async fn list_runs(State(coordinator): State<PipelineCoordinator>) -> impl IntoResponse {
  Json(coordinator.runs())
}

async fn get_run(
  State(coordinator): State<PipelineCoordinator>,
  Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, Failure> {
  coordinator
    .status(id)
    .map(Json)
    .ok_or_else(|| ControlError::NotFound.into())
}

async fn abort_run(
  State(coordinator): State<PipelineCoordinator>,
  Path(id): Path<Uuid>,
) -> Result<StatusCode, Failure> {
  coordinator.abort(id)?;
  Ok(StatusCode::ACCEPTED)
}

async fn approve_run(
  State(coordinator): State<PipelineCoordinator>,
  Path(id): Path<Uuid>,
  Json(body): Json<ApprovalBody>,
) -> Result<StatusCode, Failure> {
  coordinator.approve(id, body.approved)?;
  Ok(StatusCode::OK)
}
