// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! JSON facade for the connector RPC surface.
//!
//! Routes:
//! - `POST /expose` - expose a service, body is a `ServiceSpec`
//! - `DELETE /service/{id}` - destroy a service
//! - `GET /services` - list services with status
//! - `GET /health` - liveness probe
//!
//! The facade holds one RPC client connection, so requests made through it
//! form a single client session on the daemon, exactly like a CLI client.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tether_connector::{ConnectorClient, ConnectorError, TlsContext, DEFAULT_DIAL_TIMEOUT};
use tether_proto::{ServiceRecord, ServiceSpec};
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum HttpError {
	#[error("{0}")]
	Rejected(String),

	#[error("connector unavailable: {0}")]
	Upstream(String),

	#[error("bind failed: {0}")]
	Bind(#[source] std::io::Error),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
	error: String,
}

impl IntoResponse for HttpError {
	fn into_response(self) -> Response {
		let status = match &self {
			HttpError::Rejected(_) => StatusCode::BAD_REQUEST,
			HttpError::Upstream(_) | HttpError::Bind(_) => StatusCode::BAD_GATEWAY,
		};
		(
			status,
			Json(ErrorBody {
				error: self.to_string(),
			}),
		)
			.into_response()
	}
}

#[derive(Debug, Serialize)]
struct ExposeBody {
	id: Uuid,
}

/// Facade state: where the daemon lives and the cached client session.
pub struct FacadeState {
	rpc_addr: String,
	tls: Option<TlsContext>,
	client: tokio::sync::Mutex<Option<Arc<ConnectorClient>>>,
}

impl FacadeState {
	pub fn new(rpc_addr: String, tls: Option<TlsContext>) -> Self {
		Self {
			rpc_addr,
			tls,
			client: tokio::sync::Mutex::new(None),
		}
	}

	async fn client(&self) -> Result<Arc<ConnectorClient>, HttpError> {
		let mut cached = self.client.lock().await;
		if let Some(client) = cached.as_ref() {
			return Ok(Arc::clone(client));
		}
		let client = ConnectorClient::connect(&self.rpc_addr, self.tls.as_ref(), DEFAULT_DIAL_TIMEOUT)
			.await
			.map_err(|e| HttpError::Upstream(e.to_string()))?;
		debug!(addr = %self.rpc_addr, "connected to connector rpc");
		let client = Arc::new(client);
		*cached = Some(Arc::clone(&client));
		Ok(client)
	}

	/// Drops the cached session so the next request reconnects.
	async fn invalidate(&self) {
		*self.client.lock().await = None;
	}

	async fn map_err(&self, e: ConnectorError) -> HttpError {
		match e {
			ConnectorError::Rpc(message) => HttpError::Rejected(message),
			other => {
				self.invalidate().await;
				HttpError::Upstream(other.to_string())
			}
		}
	}
}

pub fn router(state: Arc<FacadeState>) -> Router {
	Router::new()
		.route("/expose", post(expose))
		.route("/service/{id}", delete(destroy))
		.route("/services", get(list))
		.route("/health", get(health))
		.layer(TraceLayer::new_for_http())
		.with_state(state)
}

#[instrument(skip(state, spec), fields(name = %spec.name))]
async fn expose(
	State(state): State<Arc<FacadeState>>,
	Json(spec): Json<ServiceSpec>,
) -> Result<Json<ExposeBody>, HttpError> {
	let client = state.client().await?;
	match client.expose_service(&spec).await {
		Ok(id) => Ok(Json(ExposeBody { id })),
		Err(e) => Err(state.map_err(e).await),
	}
}

#[instrument(skip(state))]
async fn destroy(
	State(state): State<Arc<FacadeState>>,
	Path(id): Path<Uuid>,
) -> Result<StatusCode, HttpError> {
	let client = state.client().await?;
	match client.destroy_service(id).await {
		Ok(()) => Ok(StatusCode::NO_CONTENT),
		Err(e) => Err(state.map_err(e).await),
	}
}

async fn list(
	State(state): State<Arc<FacadeState>>,
) -> Result<Json<Vec<ServiceRecord>>, HttpError> {
	let client = state.client().await?;
	match client.list_services().await {
		Ok(services) => Ok(Json(services)),
		Err(e) => Err(state.map_err(e).await),
	}
}

async fn health() -> StatusCode {
	StatusCode::OK
}

/// Binds and serves the facade until the task is dropped.
pub async fn serve(
	http_bind: &str,
	rpc_addr: String,
	tls: Option<TlsContext>,
) -> Result<(), HttpError> {
	let state = Arc::new(FacadeState::new(rpc_addr, tls));
	let app = router(state);

	let listener = tokio::net::TcpListener::bind(http_bind)
		.await
		.map_err(HttpError::Bind)?;
	info!(bind = %http_bind, "http facade listening");

	if let Err(e) = axum::serve(listener, app).await {
		warn!(error = %e, "http facade stopped");
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_rejected_maps_to_bad_request() {
		let response = HttpError::Rejected("duplicate".to_string()).into_response();
		assert_eq!(response.status(), StatusCode::BAD_REQUEST);
	}

	#[test]
	fn test_upstream_maps_to_bad_gateway() {
		let response = HttpError::Upstream("unreachable".to_string()).into_response();
		assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
	}

	#[test]
	fn test_router_builds() {
		let state = Arc::new(FacadeState::new("localhost:9090".to_string(), None));
		let _ = router(state);
	}
}
