// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::controller;
use crate::error::Result;
use crate::stream::{self, AsyncReadWrite};
use crate::ConnectorState;
use std::net::SocketAddr;
use std::sync::Arc;
use tether_proto::{read_frame, Frame, ProtoError};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Accept loop for the RPC port. Runs until the shutdown flag flips.
pub(crate) async fn serve(
	state: Arc<ConnectorState>,
	listener: TcpListener,
	mut shutdown_rx: watch::Receiver<bool>,
) {
	loop {
		tokio::select! {
			biased;

			_ = shutdown_rx.changed() => {
				if *shutdown_rx.borrow() {
					break;
				}
			}

			accepted = listener.accept() => {
				match accepted {
					Ok((socket, remote)) => {
						let state = Arc::clone(&state);
						tokio::spawn(handle_connection(state, socket, remote));
					}
					Err(e) => {
						warn!(error = %e, "rpc accept failed");
					}
				}
			}
		}
	}
	info!("rpc server stopped");
}

async fn handle_connection(state: Arc<ConnectorState>, socket: TcpStream, remote: SocketAddr) {
	let conn: Box<dyn AsyncReadWrite> = match &state.tls {
		Some(tls) => match tls.acceptor.accept(socket).await {
			Ok(stream) => Box::new(stream),
			Err(e) => {
				warn!(%remote, error = %e, "TLS handshake failed");
				return;
			}
		},
		None => Box::new(socket),
	};

	// the connection is the client session; its token scopes duplicate
	// detection to calls made over this one connection
	let owner_token = Uuid::new_v4();
	debug!(%remote, %owner_token, "rpc client connected");

	match handle_session(state, conn, remote, owner_token).await {
		Ok(()) => {}
		Err(crate::error::ConnectorError::Proto(ProtoError::ConnectionClosed)) => {
			debug!(%remote, "rpc client disconnected");
		}
		Err(e) => {
			debug!(%remote, error = %e, "rpc connection ended");
		}
	}
}

async fn handle_session(
	state: Arc<ConnectorState>,
	mut conn: Box<dyn AsyncReadWrite>,
	remote: SocketAddr,
	owner_token: Uuid,
) -> Result<()> {
	loop {
		let frame = read_frame(&mut conn).await?;
		let response = match frame {
			Frame::ExposeService { service } => {
				match controller::expose(&state, service, owner_token).await {
					Ok(id) => Frame::ExposeResponse { id },
					Err(e) => Frame::RpcError {
						message: e.to_string(),
					},
				}
			}
			Frame::DestroyService { id } => match controller::destroy(&state, id).await {
				Ok(()) => Frame::Ok,
				Err(e) => Frame::RpcError {
					message: e.to_string(),
				},
			},
			Frame::ListServices => Frame::ServiceList {
				services: state.registry.list().await,
			},
			Frame::OpenStream => {
				debug!(%remote, "upgrading rpc connection to peer stream");
				stream::register_inbound(&state, conn, remote.to_string()).await;
				return Ok(());
			}
			other => Frame::RpcError {
				message: format!("unexpected frame type {:#04x}", other.frame_type()),
			},
		};
		conn.write_all(&response.encode()).await?;
	}
}
