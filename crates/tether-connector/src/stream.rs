// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::StreamError;
use crate::ConnectorState;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether_proto::{read_frame, Frame, ProtoError, DATA_CHUNK_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncReadWrite for T {}

const CHANNEL_CAPACITY: usize = 64;

/// Owns a listener accept loop. Dropping the guard aborts the loop, which
/// closes the bound socket and releases the port.
pub struct ListenerGuard {
	handle: JoinHandle<()>,
	port: u16,
}

impl ListenerGuard {
	pub fn port(&self) -> u16 {
		self.port
	}
}

impl Drop for ListenerGuard {
	fn drop(&mut self) {
		self.handle.abort();
	}
}

/// Serializes frame writes onto the shared stream. Frames interleave at
/// whole-frame granularity only.
struct FrameSender {
	writer: Mutex<WriteHalf<Box<dyn AsyncReadWrite>>>,
}

impl FrameSender {
	async fn send(&self, frame: &Frame) -> Result<(), StreamError> {
		let buf = frame.encode();
		let mut writer = self.writer.lock().await;
		writer.write_all(&buf).await?;
		Ok(())
	}
}

enum ChannelMsg {
	Data(Vec<u8>),
	CloseWrite,
	Close,
}

/// Completion flags for the two directions of a channel; the channel is
/// garbage-collected once both are set.
struct ChannelFlags {
	read_done: AtomicBool,
	write_done: AtomicBool,
}

struct Channel {
	service_id: Uuid,
	msg_tx: mpsc::Sender<ChannelMsg>,
	read_pump: Option<JoinHandle<()>>,
}

struct RemoteListener {
	name: String,
	guard: ListenerGuard,
}

/// One bidirectional peer stream: the mux map, the send serializer, pending
/// ack tables and the connection-id allocator. The dialing side allocates odd
/// connection ids and the accepting side even ones, so two streams between
/// the same pair can never collide.
pub(crate) struct StreamSession {
	pub(crate) id: Uuid,
	peer_label: String,
	outbound_peer: Option<String>,
	sender: FrameSender,
	channels: Mutex<HashMap<u32, Channel>>,
	pending_opens: Mutex<HashMap<u32, oneshot::Sender<Result<(), String>>>>,
	pending_listeners: Mutex<HashMap<Uuid, oneshot::Sender<Result<(), String>>>>,
	remote_listeners: Mutex<HashMap<Uuid, RemoteListener>>,
	next_conn_id: AtomicU32,
}

impl StreamSession {
	/// Splits the connection, spawns the receiver-dispatcher and returns the
	/// session handle.
	pub(crate) fn start(
		conn: Box<dyn AsyncReadWrite>,
		peer_label: String,
		outbound_peer: Option<String>,
		state: Arc<ConnectorState>,
	) -> (Arc<Self>, JoinHandle<()>) {
		let (read_half, write_half) = tokio::io::split(conn);
		let first_conn_id = if outbound_peer.is_some() { 1 } else { 2 };

		let session = Arc::new(Self {
			id: Uuid::new_v4(),
			peer_label,
			outbound_peer,
			sender: FrameSender {
				writer: Mutex::new(write_half),
			},
			channels: Mutex::new(HashMap::new()),
			pending_opens: Mutex::new(HashMap::new()),
			pending_listeners: Mutex::new(HashMap::new()),
			remote_listeners: Mutex::new(HashMap::new()),
			next_conn_id: AtomicU32::new(first_conn_id),
		});

		let reader = Arc::clone(&session);
		let handle = tokio::spawn(async move { reader.read_loop(read_half, state).await });

		(session, handle)
	}

	pub(crate) async fn send(&self, frame: &Frame) -> Result<(), StreamError> {
		self.sender.send(frame).await
	}

	/// Asks the peer to bind `source_port` and register the service with its
	/// integration, waiting for the acknowledgment.
	pub(crate) async fn create_remote_listener(
		&self,
		service_id: Uuid,
		source_port: u16,
		name: &str,
		destination_port: u16,
		timeout: Duration,
	) -> Result<(), StreamError> {
		let (tx, rx) = oneshot::channel();
		self.pending_listeners.lock().await.insert(service_id, tx);

		let frame = Frame::CreateRemoteListener {
			service_id,
			source_port,
			name: name.to_string(),
			destination_port,
		};
		if let Err(e) = self.sender.send(&frame).await {
			self.pending_listeners.lock().await.remove(&service_id);
			return Err(e);
		}

		match tokio::time::timeout(timeout, rx).await {
			Err(_) => {
				self.pending_listeners.lock().await.remove(&service_id);
				Err(StreamError::Timeout("listener acknowledgment"))
			}
			Ok(Err(_)) => Err(StreamError::Closed),
			Ok(Ok(Ok(()))) => Ok(()),
			Ok(Ok(Err(message))) => Err(StreamError::ListenerRejected(message)),
		}
	}

	/// Accept-side entry point: turns an accepted TCP connection into a
	/// channel on this stream. `destination_addr` is left empty when the
	/// peer owns the service record and resolves the destination itself.
	#[instrument(skip(self, socket), fields(peer = %self.peer_label))]
	pub(crate) async fn open_channel(
		self: Arc<Self>,
		service_id: Uuid,
		destination_addr: String,
		socket: TcpStream,
		ack_timeout: Duration,
	) -> Result<(), StreamError> {
		let connection_id = self.next_conn_id.fetch_add(2, Ordering::Relaxed);

		// The channel entry is registered before OPEN goes out so that
		// frames arriving ahead of the ack waiter are buffered, not dropped.
		let (msg_rx, flags) = self.insert_channel(connection_id, service_id).await;

		let (tx, rx) = oneshot::channel();
		self.pending_opens.lock().await.insert(connection_id, tx);

		let open = Frame::Open {
			service_id,
			connection_id,
			destination_addr,
		};
		if let Err(e) = self.sender.send(&open).await {
			self.pending_opens.lock().await.remove(&connection_id);
			self.remove_channel(connection_id, false).await;
			return Err(e);
		}

		match tokio::time::timeout(ack_timeout, rx).await {
			Err(_) => {
				self.pending_opens.lock().await.remove(&connection_id);
				self.remove_channel(connection_id, true).await;
				Err(StreamError::Timeout("open acknowledgment"))
			}
			Ok(Err(_)) => {
				self.remove_channel(connection_id, false).await;
				Err(StreamError::Closed)
			}
			Ok(Ok(Err(message))) => {
				self.remove_channel(connection_id, false).await;
				Err(StreamError::OpenRejected(message))
			}
			Ok(Ok(Ok(()))) => {
				debug!(connection_id, %service_id, "channel open");
				spawn_channel_pumps(self, connection_id, socket, msg_rx, flags).await;
				Ok(())
			}
		}
	}

	async fn insert_channel(
		&self,
		connection_id: u32,
		service_id: Uuid,
	) -> (mpsc::Receiver<ChannelMsg>, Arc<ChannelFlags>) {
		let (msg_tx, msg_rx) = mpsc::channel(CHANNEL_CAPACITY);
		let flags = Arc::new(ChannelFlags {
			read_done: AtomicBool::new(false),
			write_done: AtomicBool::new(false),
		});
		self.channels.lock().await.insert(
			connection_id,
			Channel {
				service_id,
				msg_tx,
				read_pump: None,
			},
		);
		(msg_rx, flags)
	}

	async fn remove_channel(&self, connection_id: u32, notify_peer: bool) {
		let channel = self.channels.lock().await.remove(&connection_id);
		if let Some(channel) = channel {
			if notify_peer {
				let _ = self.sender.send(&Frame::Close { connection_id }).await;
			}
			if let Some(handle) = channel.read_pump {
				handle.abort();
			}
			debug!(connection_id, "channel closed");
		}
	}

	/// Aborts every live channel belonging to `service_id`, notifying the
	/// peer.
	pub(crate) async fn abort_service_channels(&self, service_id: Uuid) {
		let ids: Vec<u32> = self
			.channels
			.lock()
			.await
			.iter()
			.filter(|(_, channel)| channel.service_id == service_id)
			.map(|(id, _)| *id)
			.collect();
		for id in ids {
			self.remove_channel(id, true).await;
		}
	}

	async fn read_loop(
		self: Arc<Self>,
		mut read_half: ReadHalf<Box<dyn AsyncReadWrite>>,
		state: Arc<ConnectorState>,
	) {
		loop {
			let frame = match read_frame(&mut read_half).await {
				Ok(frame) => frame,
				Err(ProtoError::ConnectionClosed) => {
					debug!(peer = %self.peer_label, "peer stream closed");
					break;
				}
				Err(e) => {
					warn!(peer = %self.peer_label, error = %e, "peer stream failed");
					break;
				}
			};
			Arc::clone(&self).dispatch(frame, &state).await;
		}
		session_closed(&state, &self).await;
	}

	async fn dispatch(self: Arc<Self>, frame: Frame, state: &Arc<ConnectorState>) {
		match frame {
			Frame::ListenerReady { service_id } => {
				if let Some(tx) = self.pending_listeners.lock().await.remove(&service_id) {
					let _ = tx.send(Ok(()));
				}
			}
			Frame::ListenerError {
				service_id,
				message,
			} => {
				if let Some(tx) = self.pending_listeners.lock().await.remove(&service_id) {
					let _ = tx.send(Err(message));
				}
			}
			Frame::OpenAck { connection_id } => {
				if let Some(tx) = self.pending_opens.lock().await.remove(&connection_id) {
					let _ = tx.send(Ok(()));
				}
			}
			Frame::OpenError {
				connection_id,
				message,
			} => {
				if let Some(tx) = self.pending_opens.lock().await.remove(&connection_id) {
					let _ = tx.send(Err(message));
				} else {
					self.route(connection_id, ChannelMsg::Close).await;
				}
			}
			Frame::Open {
				service_id,
				connection_id,
				destination_addr,
			} => {
				let state = Arc::clone(state);
				tokio::spawn(async move {
					self
						.handle_open(state, service_id, connection_id, destination_addr)
						.await;
				});
			}
			Frame::Data {
				connection_id,
				data,
			} => {
				self.route(connection_id, ChannelMsg::Data(data)).await;
			}
			Frame::CloseWrite { connection_id } => {
				self.route(connection_id, ChannelMsg::CloseWrite).await;
			}
			Frame::Close { connection_id } => {
				self.route(connection_id, ChannelMsg::Close).await;
			}
			Frame::CreateRemoteListener {
				service_id,
				source_port,
				name,
				destination_port,
			} => {
				self
					.handle_create_remote_listener(state, service_id, source_port, name, destination_port)
					.await;
			}
			Frame::DestroyListener { service_id } => {
				self.handle_destroy_listener(state, service_id).await;
			}
			other => {
				warn!(
					peer = %self.peer_label,
					frame_type = other.frame_type(),
					"unexpected frame on peer stream"
				);
			}
		}
	}

	async fn route(&self, connection_id: u32, msg: ChannelMsg) {
		let tx = self
			.channels
			.lock()
			.await
			.get(&connection_id)
			.map(|channel| channel.msg_tx.clone());
		match tx {
			Some(tx) => {
				// full buffer exerts backpressure on the whole stream
				let _ = tx.send(msg).await;
			}
			None => debug!(connection_id, "frame for unknown channel"),
		}
	}

	/// Dial-side half of the per-connection algorithm: resolve the
	/// destination, dial it, then ack. The registry wins over the frame so
	/// a LOCAL service's destination never has to leave its owning daemon.
	async fn handle_open(
		self: Arc<Self>,
		state: Arc<ConnectorState>,
		service_id: Uuid,
		connection_id: u32,
		destination_addr: String,
	) {
		let destination = match state.registry.get(service_id).await {
			Some(record) => record.destination_addr,
			None if !destination_addr.is_empty() => destination_addr,
			None => {
				let _ = self
					.send(&Frame::OpenError {
						connection_id,
						message: format!("unknown service {service_id}"),
					})
					.await;
				return;
			}
		};

		let dialed = tokio::time::timeout(state.dial_timeout, TcpStream::connect(&destination)).await;
		let socket = match dialed {
			Ok(Ok(socket)) => socket,
			Ok(Err(e)) => {
				debug!(%destination, error = %e, "dial failed");
				let _ = self
					.send(&Frame::OpenError {
						connection_id,
						message: e.to_string(),
					})
					.await;
				return;
			}
			Err(_) => {
				let _ = self
					.send(&Frame::OpenError {
						connection_id,
						message: format!("dial to {destination} timed out"),
					})
					.await;
				return;
			}
		};

		// pumps are live before the ack so nothing the peer sends next races us
		let (msg_rx, flags) = self.insert_channel(connection_id, service_id).await;
		spawn_channel_pumps(Arc::clone(&self), connection_id, socket, msg_rx, flags).await;

		if self.send(&Frame::OpenAck { connection_id }).await.is_err() {
			self.remove_channel(connection_id, false).await;
			return;
		}
		debug!(connection_id, %service_id, %destination, "channel dialed");
	}

	/// Peer asked us to expose one of its LOCAL services here: bind,
	/// register with the local integration, then acknowledge.
	async fn handle_create_remote_listener(
		self: Arc<Self>,
		state: &Arc<ConnectorState>,
		service_id: Uuid,
		source_port: u16,
		name: String,
		destination_port: u16,
	) {
		let listener = match TcpListener::bind(("0.0.0.0", source_port)).await {
			Ok(listener) => listener,
			Err(e) => {
				let message = if e.kind() == std::io::ErrorKind::AddrInUse {
					format!("port in use: {source_port}")
				} else {
					format!("failed to bind port {source_port}: {e}")
				};
				warn!(%service_id, source_port, %message, "remote listener rejected");
				let _ = self
					.send(&Frame::ListenerError {
						service_id,
						message,
					})
					.await;
				return;
			}
		};

		if let Err(e) = state
			.integration
			.register(&name, source_port, destination_port)
			.await
		{
			drop(listener);
			let _ = self
				.send(&Frame::ListenerError {
					service_id,
					message: format!("integration register failed: {e}"),
				})
				.await;
			return;
		}

		let guard = spawn_accept_loop(
			listener,
			service_id,
			String::new(),
			Arc::clone(&self),
			Arc::clone(state),
		);
		self
			.remote_listeners
			.lock()
			.await
			.insert(service_id, RemoteListener { name, guard });

		let _ = self.send(&Frame::ListenerReady { service_id }).await;
		info!(%service_id, source_port, "remote listener ready");
	}

	async fn handle_destroy_listener(&self, state: &Arc<ConnectorState>, service_id: Uuid) {
		let removed = self.remote_listeners.lock().await.remove(&service_id);
		if let Some(remote) = removed {
			drop(remote.guard);
			self.abort_service_channels(service_id).await;
			if let Err(e) = state.integration.deregister(&remote.name).await {
				warn!(%service_id, error = %e, "deregister failed");
			}
			info!(%service_id, "remote listener destroyed");
		}
	}

	/// Releases everything this stream owns: remote listeners (with their
	/// deregistrations), live channels and waiting acks.
	async fn teardown(&self, state: &Arc<ConnectorState>) {
		let listeners: Vec<RemoteListener> = self
			.remote_listeners
			.lock()
			.await
			.drain()
			.map(|(_, remote)| remote)
			.collect();
		for remote in listeners {
			drop(remote.guard);
			if let Err(e) = state.integration.deregister(&remote.name).await {
				warn!(error = %e, "deregister failed during stream teardown");
			}
		}

		let channels: Vec<Channel> = self
			.channels
			.lock()
			.await
			.drain()
			.map(|(_, channel)| channel)
			.collect();
		for channel in channels {
			if let Some(handle) = channel.read_pump {
				handle.abort();
			}
		}

		self.pending_opens.lock().await.clear();
		self.pending_listeners.lock().await.clear();
	}
}

/// Starts the two byte pumps for an established channel: socket reads become
/// `Data` frames, incoming channel messages become socket writes.
async fn spawn_channel_pumps(
	session: Arc<StreamSession>,
	connection_id: u32,
	socket: TcpStream,
	mut msg_rx: mpsc::Receiver<ChannelMsg>,
	flags: Arc<ChannelFlags>,
) {
	let (mut tcp_read, mut tcp_write) = socket.into_split();

	let reader_session = Arc::clone(&session);
	let read_flags = Arc::clone(&flags);
	let read_pump = tokio::spawn(async move {
		let mut buf = vec![0u8; DATA_CHUNK_SIZE];
		loop {
			match tcp_read.read(&mut buf).await {
				Ok(0) => {
					let _ = reader_session
						.send(&Frame::CloseWrite { connection_id })
						.await;
					read_flags.read_done.store(true, Ordering::SeqCst);
					if read_flags.write_done.load(Ordering::SeqCst) {
						reader_session.remove_channel(connection_id, false).await;
					}
					break;
				}
				Ok(n) => {
					let frame = Frame::Data {
						connection_id,
						data: buf[..n].to_vec(),
					};
					if reader_session.send(&frame).await.is_err() {
						reader_session.remove_channel(connection_id, false).await;
						break;
					}
				}
				Err(_) => {
					let _ = reader_session.send(&Frame::Close { connection_id }).await;
					reader_session.remove_channel(connection_id, false).await;
					break;
				}
			}
		}
	});

	let writer_session = Arc::clone(&session);
	tokio::spawn(async move {
		while let Some(msg) = msg_rx.recv().await {
			match msg {
				ChannelMsg::Data(data) => {
					if tcp_write.write_all(&data).await.is_err() {
						let _ = writer_session.send(&Frame::Close { connection_id }).await;
						writer_session.remove_channel(connection_id, false).await;
						break;
					}
				}
				ChannelMsg::CloseWrite => {
					let _ = tcp_write.shutdown().await;
					flags.write_done.store(true, Ordering::SeqCst);
					if flags.read_done.load(Ordering::SeqCst) {
						writer_session.remove_channel(connection_id, false).await;
					}
				}
				ChannelMsg::Close => {
					writer_session.remove_channel(connection_id, false).await;
					break;
				}
			}
		}
	});

	if let Some(channel) = session.channels.lock().await.get_mut(&connection_id) {
		channel.read_pump = Some(read_pump);
	} else {
		// lost a teardown race; stop pumping
		read_pump.abort();
	}
}

/// Spawns the accept loop for an exposing-side listener. Every accepted
/// connection becomes a channel on `session`; a failed open closes the
/// client socket by dropping it.
pub(crate) fn spawn_accept_loop(
	listener: TcpListener,
	service_id: Uuid,
	destination_addr: String,
	session: Arc<StreamSession>,
	state: Arc<ConnectorState>,
) -> ListenerGuard {
	let port = listener.local_addr().map(|a| a.port()).unwrap_or(0);
	let handle = tokio::spawn(async move {
		loop {
			match listener.accept().await {
				Ok((socket, remote)) => {
					debug!(%remote, %service_id, "accepted client connection");
					let session = Arc::clone(&session);
					let destination_addr = destination_addr.clone();
					let ack_timeout = state.ack_timeout;
					tokio::spawn(async move {
						if let Err(e) = session
							.open_channel(service_id, destination_addr, socket, ack_timeout)
							.await
						{
							debug!(%service_id, error = %e, "failed to open channel");
						}
					});
				}
				Err(e) => {
					warn!(%service_id, error = %e, "listener accept failed");
					break;
				}
			}
		}
	});
	ListenerGuard { handle, port }
}

struct SessionHandle {
	session: Arc<StreamSession>,
	reader: JoinHandle<()>,
}

/// All live peer streams. Outbound streams are keyed by peer address and
/// shared: at most one outbound stream per peer, subsequent services reuse
/// it. Inbound streams are keyed by session id.
pub(crate) struct Streams {
	outbound: Mutex<HashMap<String, SessionHandle>>,
	inbound: Mutex<HashMap<Uuid, SessionHandle>>,
}

impl Streams {
	pub(crate) fn new() -> Self {
		Self {
			outbound: Mutex::new(HashMap::new()),
			inbound: Mutex::new(HashMap::new()),
		}
	}

	pub(crate) async fn outbound_session(&self, peer: &str) -> Option<Arc<StreamSession>> {
		self
			.outbound
			.lock()
			.await
			.get(peer)
			.map(|handle| Arc::clone(&handle.session))
	}
}

/// Returns the outbound stream for `peer_addr`, dialing and announcing a new
/// one when none exists.
#[instrument(skip(state))]
pub(crate) async fn get_or_dial(
	state: &Arc<ConnectorState>,
	peer_addr: &str,
) -> Result<Arc<StreamSession>, StreamError> {
	let mut outbound = state.streams.outbound.lock().await;
	if let Some(handle) = outbound.get(peer_addr) {
		return Ok(Arc::clone(&handle.session));
	}

	let connector = state.tls.as_ref().map(|t| &t.connector);
	let mut conn = crate::tls::dial(peer_addr, connector, state.dial_timeout).await?;
	conn.write_all(&Frame::OpenStream.encode()).await?;

	let (session, reader) = StreamSession::start(
		conn,
		peer_addr.to_string(),
		Some(peer_addr.to_string()),
		Arc::clone(state),
	);
	outbound.insert(
		peer_addr.to_string(),
		SessionHandle {
			session: Arc::clone(&session),
			reader,
		},
	);

	info!(peer = %peer_addr, "opened peer stream");
	Ok(session)
}

/// Adopts an RPC connection that upgraded itself with `OpenStream`.
pub(crate) async fn register_inbound(
	state: &Arc<ConnectorState>,
	conn: Box<dyn AsyncReadWrite>,
	peer_label: String,
) {
	let (session, reader) = StreamSession::start(conn, peer_label, None, Arc::clone(state));
	state.streams.inbound.lock().await.insert(
		session.id,
		SessionHandle {
			session: Arc::clone(&session),
			reader,
		},
	);
}

async fn session_closed(state: &Arc<ConnectorState>, session: &Arc<StreamSession>) {
	match &session.outbound_peer {
		Some(peer) => {
			let mut outbound = state.streams.outbound.lock().await;
			if let Some(handle) = outbound.get(peer) {
				if handle.session.id == session.id {
					outbound.remove(peer);
				}
			}
			drop(outbound);

			let failed = state
				.registry
				.fail_services_on_peer(peer, "peer stream closed")
				.await;
			if !failed.is_empty() {
				warn!(peer = %peer, services = failed.len(), "peer stream lost, services failed");
			}
		}
		None => {
			state.streams.inbound.lock().await.remove(&session.id);
		}
	}
	session.teardown(state).await;
}

/// Closes every stream, releasing remote listeners and channels.
pub(crate) async fn shutdown_all(state: &Arc<ConnectorState>) {
	let outbound: Vec<SessionHandle> = state
		.streams
		.outbound
		.lock()
		.await
		.drain()
		.map(|(_, handle)| handle)
		.collect();
	let inbound: Vec<SessionHandle> = state
		.streams
		.inbound
		.lock()
		.await
		.drain()
		.map(|(_, handle)| handle)
		.collect();

	for handle in outbound.into_iter().chain(inbound) {
		handle.reader.abort();
		handle.session.teardown(state).await;
	}
}
