// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{ConnectorError, Result};
use crate::stream::AsyncReadWrite;
use crate::tls::{self, TlsContext};
use std::time::Duration;
use tether_proto::{read_frame, Frame, ServiceRecord, ServiceSpec};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::instrument;
use uuid::Uuid;

/// RPC client for a connector daemon. One client holds one connection, and
/// that connection is the client session: duplicate detection on the server
/// is scoped to the requests made through it.
pub struct ConnectorClient {
	conn: Mutex<Box<dyn AsyncReadWrite>>,
	addr: String,
}

impl ConnectorClient {
	pub async fn connect(
		addr: &str,
		tls: Option<&TlsContext>,
		timeout: Duration,
	) -> Result<Self> {
		let connector = tls.map(|t| &t.connector);
		let conn = tls::dial(addr, connector, timeout).await?;
		Ok(Self {
			conn: Mutex::new(conn),
			addr: addr.to_string(),
		})
	}

	pub fn addr(&self) -> &str {
		&self.addr
	}

	async fn roundtrip(&self, request: &Frame) -> Result<Frame> {
		let mut conn = self.conn.lock().await;
		conn.write_all(&request.encode()).await?;
		Ok(read_frame(&mut *conn).await?)
	}

	/// Submits a service for exposure, returning its id. The id comes back
	/// before the service reaches COMPLETE; poll [`Self::list_services`].
	#[instrument(skip(self, spec), fields(addr = %self.addr, name = %spec.name))]
	pub async fn expose_service(&self, spec: &ServiceSpec) -> Result<Uuid> {
		let request = Frame::ExposeService {
			service: spec.clone(),
		};
		match self.roundtrip(&request).await? {
			Frame::ExposeResponse { id } => Ok(id),
			Frame::RpcError { message } => Err(ConnectorError::Rpc(message)),
			other => Err(unexpected(other)),
		}
	}

	/// Destroys a service. Returns once the daemon has released listeners,
	/// aborted channels and deregistered the service.
	#[instrument(skip(self), fields(addr = %self.addr))]
	pub async fn destroy_service(&self, id: Uuid) -> Result<()> {
		match self.roundtrip(&Frame::DestroyService { id }).await? {
			Frame::Ok => Ok(()),
			Frame::RpcError { message } => Err(ConnectorError::Rpc(message)),
			other => Err(unexpected(other)),
		}
	}

	pub async fn list_services(&self) -> Result<Vec<ServiceRecord>> {
		match self.roundtrip(&Frame::ListServices).await? {
			Frame::ServiceList { services } => Ok(services),
			Frame::RpcError { message } => Err(ConnectorError::Rpc(message)),
			other => Err(unexpected(other)),
		}
	}
}

fn unexpected(frame: Frame) -> ConnectorError {
	ConnectorError::Rpc(format!(
		"unexpected response frame {:#04x}",
		frame.frame_type()
	))
}

impl std::fmt::Debug for ConnectorClient {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ConnectorClient")
			.field("addr", &self.addr)
			.finish()
	}
}
