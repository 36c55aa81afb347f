// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{ConnectorError, RegistryError, Result};
use crate::stream::{self, spawn_accept_loop};
use crate::ConnectorState;
use std::sync::Arc;
use tether_proto::{normalize_name, Frame, ServiceRecord, ServiceSpec, ServiceType};
use tokio::net::TcpListener;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Accepts an expose request: validates, inserts the PENDING record and
/// hands it to a controller task. Returns the id immediately; progress is
/// observed through `ListServices`.
pub(crate) async fn expose(
	state: &Arc<ConnectorState>,
	spec: ServiceSpec,
	owner_token: Uuid,
) -> Result<Uuid> {
	let id = state.registry.insert(spec, owner_token).await?;
	let state = Arc::clone(state);
	tokio::spawn(run(state, id));
	Ok(id)
}

/// Drives one service through its lifecycle. Every exit path either reaches
/// COMPLETE or records the error on the service; partially acquired
/// resources are released on the way out.
#[instrument(skip(state))]
pub(crate) async fn run(state: Arc<ConnectorState>, id: Uuid) {
	let Some(record) = state.registry.get(id).await else {
		return;
	};

	let result = match record.service_type {
		ServiceType::Local => setup_local(&state, &record).await,
		ServiceType::Remote => setup_remote(&state, &record).await,
	};

	match result {
		Ok(()) => {
			state.registry.set_complete(id).await;
			info!(%id, name = %record.name, "service complete");
		}
		Err(e) => {
			warn!(%id, name = %record.name, error = %e, "service failed");
			state.registry.set_error(id, &e.to_string()).await;
		}
	}
}

/// LOCAL: the service lives here; ask the peer to listen and to register it
/// with the peer's integration. COMPLETE once the peer acknowledges.
async fn setup_local(state: &Arc<ConnectorState>, record: &ServiceRecord) -> Result<()> {
	let session = stream::get_or_dial(state, &record.remote_connector_addr).await?;
	state
		.registry
		.set_session_peer(record.id, &record.remote_connector_addr)
		.await;

	let name = normalize_name(&record.name);
	session
		.create_remote_listener(
			record.id,
			record.source_port,
			&name,
			record.source_port,
			state.ack_timeout,
		)
		.await?;

	if state.registry.get(record.id).await.is_none() {
		// destroyed while the listener request was in flight
		let _ = session
			.send(&Frame::DestroyListener {
				service_id: record.id,
			})
			.await;
		return Err(RegistryError::UnknownService(record.id).into());
	}

	Ok(())
}

/// REMOTE: the service lives on the peer; listen here, register with the
/// local integration and proxy every accept over the shared stream.
async fn setup_remote(state: &Arc<ConnectorState>, record: &ServiceRecord) -> Result<()> {
	let session = stream::get_or_dial(state, &record.remote_connector_addr).await?;
	state
		.registry
		.set_session_peer(record.id, &record.remote_connector_addr)
		.await;

	let listener = TcpListener::bind(("0.0.0.0", record.source_port))
		.await
		.map_err(|e| bind_error(record.source_port, e))?;

	let name = normalize_name(&record.name);
	state
		.integration
		.register(&name, record.source_port, record.source_port)
		.await
		.map_err(ConnectorError::Integration)?;

	if !state.registry.mark_registered(record.id, &name).await {
		// destroyed mid-setup; undo the registration we just made
		let _ = state.integration.deregister(&name).await;
		return Err(RegistryError::UnknownService(record.id).into());
	}

	let guard = spawn_accept_loop(
		listener,
		record.id,
		record.destination_addr.clone(),
		session,
		Arc::clone(state),
	);
	if !state.registry.attach_listener(record.id, guard).await {
		return Err(RegistryError::UnknownService(record.id).into());
	}

	Ok(())
}

fn bind_error(port: u16, e: std::io::Error) -> ConnectorError {
	if e.kind() == std::io::ErrorKind::AddrInUse {
		ConnectorError::Listener(format!("port in use: {port}"))
	} else {
		ConnectorError::Listener(format!("failed to bind port {port}: {e}"))
	}
}

/// Tears a service down: claims the record, closes the exposing-side
/// listener, aborts its channels, tells the peer and fires the deregister.
/// Returns only after all of that has happened.
#[instrument(skip(state))]
pub(crate) async fn destroy(state: &Arc<ConnectorState>, id: Uuid) -> Result<()> {
	let Some(removed) = state.registry.remove(id).await else {
		return Err(RegistryError::UnknownService(id).into());
	};

	// closes the local exposing listener, if any
	drop(removed.listener);

	if let Some(peer) = &removed.session_peer {
		if let Some(session) = state.streams.outbound_session(peer).await {
			session.abort_service_channels(id).await;
			if removed.record.service_type == ServiceType::Local {
				let _ = session.send(&Frame::DestroyListener { service_id: id }).await;
			}
		}
	}

	if let Some(name) = removed.registered_name {
		if let Err(e) = state.integration.deregister(&name).await {
			warn!(%id, error = %e, "deregister failed");
		}
	} else {
		debug!(%id, "no local registration to remove");
	}

	info!(%id, name = %removed.record.name, "service destroyed");
	Ok(())
}
