// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Service exposure engine. Each daemon runs one [`Connector`]: the RPC
//! surface, the service registry, per-service exposure controllers and the
//! multiplexed peer streams that carry tunneled TCP traffic.

pub mod client;
mod controller;
pub mod error;
pub mod integrations;
pub mod registry;
mod server;
pub mod stream;
pub mod tls;

pub use client::ConnectorClient;
pub use error::{ConnectorError, IntegrationError, RegistryError, Result, StreamError, TlsError};
pub use integrations::{Integration, NoopIntegration};
pub use registry::ServiceRegistry;
pub use tls::{TlsContext, TlsPaths};

use crate::stream::Streams;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tether_proto::{ServiceRecord, ServiceSpec};
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};
use uuid::Uuid;

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
	pub tls: TlsPaths,
	pub dial_timeout: Duration,
	pub ack_timeout: Duration,
}

impl Default for ConnectorConfig {
	fn default() -> Self {
		Self {
			tls: TlsPaths::default(),
			dial_timeout: DEFAULT_DIAL_TIMEOUT,
			ack_timeout: DEFAULT_ACK_TIMEOUT,
		}
	}
}

/// Shared engine state handed to controllers, stream sessions and the RPC
/// server.
pub(crate) struct ConnectorState {
	pub(crate) registry: ServiceRegistry,
	pub(crate) streams: Streams,
	pub(crate) integration: Arc<dyn Integration>,
	pub(crate) tls: Option<TlsContext>,
	pub(crate) dial_timeout: Duration,
	pub(crate) ack_timeout: Duration,
}

/// One connector daemon instance.
pub struct Connector {
	state: Arc<ConnectorState>,
	listener: Mutex<Option<TcpListener>>,
	serve_handle: Mutex<Option<JoinHandle<()>>>,
	shutdown_tx: watch::Sender<bool>,
}

impl Connector {
	/// Builds the engine, reading TLS material once. Plaintext development
	/// mode applies only when no material at all is configured.
	pub fn new(config: ConnectorConfig, integration: Arc<dyn Integration>) -> Result<Self> {
		let tls = tls::load(&config.tls)?;
		let (shutdown_tx, _) = watch::channel(false);

		Ok(Self {
			state: Arc::new(ConnectorState {
				registry: ServiceRegistry::new(),
				streams: Streams::new(),
				integration,
				tls,
				dial_timeout: config.dial_timeout,
				ack_timeout: config.ack_timeout,
			}),
			listener: Mutex::new(None),
			serve_handle: Mutex::new(None),
			shutdown_tx,
		})
	}

	/// Binds the RPC port. Kept separate from [`Self::spawn_serve`] so bind
	/// failures surface synchronously at startup.
	pub async fn bind(&self, addr: &str) -> Result<SocketAddr> {
		let listener = TcpListener::bind(addr).await?;
		let local = listener.local_addr()?;
		*self.listener.lock().await = Some(listener);
		info!(%local, "rpc listener bound");
		Ok(local)
	}

	/// Starts serving the bound RPC port in the background.
	pub async fn spawn_serve(&self) -> Result<()> {
		let listener = self
			.listener
			.lock()
			.await
			.take()
			.ok_or(ConnectorError::NotBound)?;
		let handle = tokio::spawn(server::serve(
			Arc::clone(&self.state),
			listener,
			self.shutdown_tx.subscribe(),
		));
		*self.serve_handle.lock().await = Some(handle);
		Ok(())
	}

	/// The TLS state loaded at startup, shared with collaborators (the HTTP
	/// facade) that dial this daemon's RPC port.
	pub fn tls_context(&self) -> Option<TlsContext> {
		self.state.tls.clone()
	}

	/// Direct (in-process) form of the `ExposeService` operation.
	pub async fn expose_service(&self, spec: ServiceSpec, owner_token: Uuid) -> Result<Uuid> {
		controller::expose(&self.state, spec, owner_token).await
	}

	/// Direct form of the `DestroyService` operation.
	pub async fn destroy_service(&self, id: Uuid) -> Result<()> {
		controller::destroy(&self.state, id).await
	}

	/// Direct form of the `ListServices` operation.
	pub async fn list_services(&self) -> Vec<ServiceRecord> {
		self.state.registry.list().await
	}

	/// Stops the RPC server, tears down every service and closes all peer
	/// streams. Waits for teardown to finish.
	#[instrument(skip(self))]
	pub async fn shutdown(&self) {
		let _ = self.shutdown_tx.send(true);
		if let Some(handle) = self.serve_handle.lock().await.take() {
			let _ = handle.await;
		}

		for id in self.state.registry.ids().await {
			if let Err(e) = controller::destroy(&self.state, id).await {
				debug!(%id, error = %e, "destroy during shutdown failed");
			}
		}

		stream::shutdown_all(&self.state).await;
		info!("connector stopped");
	}
}

impl std::fmt::Debug for Connector {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Connector").finish_non_exhaustive()
	}
}
