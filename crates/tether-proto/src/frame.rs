// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{ProtoError, Result, MAX_FRAME_SIZE};
use crate::service::{ServiceRecord, ServiceSpec};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

/// Largest payload carried by a single `Data` frame. Senders chunk at this
/// size; readers must tolerate any payload up to [`MAX_FRAME_SIZE`].
pub const DATA_CHUNK_SIZE: usize = 32 * 1024;

pub const FRAME_TYPE_EXPOSE_SERVICE: u8 = 0x01;
pub const FRAME_TYPE_EXPOSE_RESPONSE: u8 = 0x02;
pub const FRAME_TYPE_DESTROY_SERVICE: u8 = 0x03;
pub const FRAME_TYPE_LIST_SERVICES: u8 = 0x04;
pub const FRAME_TYPE_SERVICE_LIST: u8 = 0x05;
pub const FRAME_TYPE_OK: u8 = 0x06;
pub const FRAME_TYPE_RPC_ERROR: u8 = 0x07;
pub const FRAME_TYPE_OPEN_STREAM: u8 = 0x08;
pub const FRAME_TYPE_CREATE_REMOTE_LISTENER: u8 = 0x09;
pub const FRAME_TYPE_LISTENER_READY: u8 = 0x0a;
pub const FRAME_TYPE_LISTENER_ERROR: u8 = 0x0b;
pub const FRAME_TYPE_DESTROY_LISTENER: u8 = 0x0c;
pub const FRAME_TYPE_OPEN: u8 = 0x0d;
pub const FRAME_TYPE_OPEN_ACK: u8 = 0x0e;
pub const FRAME_TYPE_OPEN_ERROR: u8 = 0x0f;
pub const FRAME_TYPE_DATA: u8 = 0x10;
pub const FRAME_TYPE_CLOSE_WRITE: u8 = 0x11;
pub const FRAME_TYPE_CLOSE: u8 = 0x12;

/// One frame on the connector wire. Unary RPC frames and stream control
/// frames carry JSON payloads; the per-connection data path is binary with a
/// big-endian u32 connection id prefix.
#[derive(Debug, Clone)]
pub enum Frame {
	ExposeService { service: ServiceSpec },
	ExposeResponse { id: Uuid },
	DestroyService { id: Uuid },
	ListServices,
	ServiceList { services: Vec<ServiceRecord> },
	Ok,
	RpcError { message: String },
	OpenStream,
	CreateRemoteListener {
		service_id: Uuid,
		source_port: u16,
		name: String,
		destination_port: u16,
	},
	ListenerReady { service_id: Uuid },
	ListenerError { service_id: Uuid, message: String },
	DestroyListener { service_id: Uuid },
	Open {
		service_id: Uuid,
		connection_id: u32,
		destination_addr: String,
	},
	OpenAck { connection_id: u32 },
	OpenError { connection_id: u32, message: String },
	Data { connection_id: u32, data: Vec<u8> },
	CloseWrite { connection_id: u32 },
	Close { connection_id: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IdPayload {
	id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MessagePayload {
	message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ServicePayload {
	service_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ServiceErrorPayload {
	service_id: Uuid,
	message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CreateRemoteListenerPayload {
	service_id: Uuid,
	source_port: u16,
	name: String,
	destination_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenPayload {
	service_id: Uuid,
	connection_id: u32,
	#[serde(default)]
	destination_addr: String,
}

impl Frame {
	pub fn frame_type(&self) -> u8 {
		match self {
			Frame::ExposeService { .. } => FRAME_TYPE_EXPOSE_SERVICE,
			Frame::ExposeResponse { .. } => FRAME_TYPE_EXPOSE_RESPONSE,
			Frame::DestroyService { .. } => FRAME_TYPE_DESTROY_SERVICE,
			Frame::ListServices => FRAME_TYPE_LIST_SERVICES,
			Frame::ServiceList { .. } => FRAME_TYPE_SERVICE_LIST,
			Frame::Ok => FRAME_TYPE_OK,
			Frame::RpcError { .. } => FRAME_TYPE_RPC_ERROR,
			Frame::OpenStream => FRAME_TYPE_OPEN_STREAM,
			Frame::CreateRemoteListener { .. } => FRAME_TYPE_CREATE_REMOTE_LISTENER,
			Frame::ListenerReady { .. } => FRAME_TYPE_LISTENER_READY,
			Frame::ListenerError { .. } => FRAME_TYPE_LISTENER_ERROR,
			Frame::DestroyListener { .. } => FRAME_TYPE_DESTROY_LISTENER,
			Frame::Open { .. } => FRAME_TYPE_OPEN,
			Frame::OpenAck { .. } => FRAME_TYPE_OPEN_ACK,
			Frame::OpenError { .. } => FRAME_TYPE_OPEN_ERROR,
			Frame::Data { .. } => FRAME_TYPE_DATA,
			Frame::CloseWrite { .. } => FRAME_TYPE_CLOSE_WRITE,
			Frame::Close { .. } => FRAME_TYPE_CLOSE,
		}
	}

	pub fn encode(&self) -> Vec<u8> {
		let payload = self.encode_payload();
		let header = encode_frame_header(self.frame_type(), payload.len());
		let mut buf = Vec::with_capacity(4 + payload.len());
		buf.extend_from_slice(&header);
		buf.extend_from_slice(&payload);
		buf
	}

	fn encode_payload(&self) -> Vec<u8> {
		match self {
			Frame::ExposeService { service } => serde_json::to_vec(service).unwrap_or_default(),
			Frame::ExposeResponse { id } => {
				serde_json::to_vec(&IdPayload { id: *id }).unwrap_or_default()
			}
			Frame::DestroyService { id } => {
				serde_json::to_vec(&IdPayload { id: *id }).unwrap_or_default()
			}
			Frame::ListServices => Vec::new(),
			Frame::ServiceList { services } => serde_json::to_vec(services).unwrap_or_default(),
			Frame::Ok => Vec::new(),
			Frame::RpcError { message } => serde_json::to_vec(&MessagePayload {
				message: message.clone(),
			})
			.unwrap_or_default(),
			Frame::OpenStream => Vec::new(),
			Frame::CreateRemoteListener {
				service_id,
				source_port,
				name,
				destination_port,
			} => serde_json::to_vec(&CreateRemoteListenerPayload {
				service_id: *service_id,
				source_port: *source_port,
				name: name.clone(),
				destination_port: *destination_port,
			})
			.unwrap_or_default(),
			Frame::ListenerReady { service_id } => serde_json::to_vec(&ServicePayload {
				service_id: *service_id,
			})
			.unwrap_or_default(),
			Frame::ListenerError {
				service_id,
				message,
			} => serde_json::to_vec(&ServiceErrorPayload {
				service_id: *service_id,
				message: message.clone(),
			})
			.unwrap_or_default(),
			Frame::DestroyListener { service_id } => serde_json::to_vec(&ServicePayload {
				service_id: *service_id,
			})
			.unwrap_or_default(),
			Frame::Open {
				service_id,
				connection_id,
				destination_addr,
			} => serde_json::to_vec(&OpenPayload {
				service_id: *service_id,
				connection_id: *connection_id,
				destination_addr: destination_addr.clone(),
			})
			.unwrap_or_default(),
			Frame::OpenAck { connection_id } => connection_id.to_be_bytes().to_vec(),
			Frame::OpenError {
				connection_id,
				message,
			} => {
				let msg = message.as_bytes();
				let mut buf = Vec::with_capacity(4 + msg.len());
				buf.extend_from_slice(&connection_id.to_be_bytes());
				buf.extend_from_slice(msg);
				buf
			}
			Frame::Data {
				connection_id,
				data,
			} => {
				let mut buf = Vec::with_capacity(4 + data.len());
				buf.extend_from_slice(&connection_id.to_be_bytes());
				buf.extend_from_slice(data);
				buf
			}
			Frame::CloseWrite { connection_id } => connection_id.to_be_bytes().to_vec(),
			Frame::Close { connection_id } => connection_id.to_be_bytes().to_vec(),
		}
	}

	pub fn decode(data: &[u8]) -> Result<Self> {
		if data.len() < 4 {
			return Err(ProtoError::PayloadTooShort(0));
		}

		let mut header = [0u8; 4];
		header.copy_from_slice(&data[..4]);
		let (frame_type, payload_len) = decode_frame_header(&header);

		if payload_len > MAX_FRAME_SIZE {
			return Err(ProtoError::FrameTooLarge(payload_len, MAX_FRAME_SIZE));
		}

		if data.len() < 4 + payload_len {
			return Err(ProtoError::PayloadTooShort(frame_type));
		}

		let payload = &data[4..4 + payload_len];
		Self::decode_payload(frame_type, payload)
	}

	fn decode_payload(frame_type: u8, payload: &[u8]) -> Result<Self> {
		match frame_type {
			FRAME_TYPE_EXPOSE_SERVICE => {
				let service: ServiceSpec = serde_json::from_slice(payload)?;
				Ok(Frame::ExposeService { service })
			}
			FRAME_TYPE_EXPOSE_RESPONSE => {
				let p: IdPayload = serde_json::from_slice(payload)?;
				Ok(Frame::ExposeResponse { id: p.id })
			}
			FRAME_TYPE_DESTROY_SERVICE => {
				let p: IdPayload = serde_json::from_slice(payload)?;
				Ok(Frame::DestroyService { id: p.id })
			}
			FRAME_TYPE_LIST_SERVICES => Ok(Frame::ListServices),
			FRAME_TYPE_SERVICE_LIST => {
				let services: Vec<ServiceRecord> = serde_json::from_slice(payload)?;
				Ok(Frame::ServiceList { services })
			}
			FRAME_TYPE_OK => Ok(Frame::Ok),
			FRAME_TYPE_RPC_ERROR => {
				let p: MessagePayload = serde_json::from_slice(payload)?;
				Ok(Frame::RpcError { message: p.message })
			}
			FRAME_TYPE_OPEN_STREAM => Ok(Frame::OpenStream),
			FRAME_TYPE_CREATE_REMOTE_LISTENER => {
				let p: CreateRemoteListenerPayload = serde_json::from_slice(payload)?;
				Ok(Frame::CreateRemoteListener {
					service_id: p.service_id,
					source_port: p.source_port,
					name: p.name,
					destination_port: p.destination_port,
				})
			}
			FRAME_TYPE_LISTENER_READY => {
				let p: ServicePayload = serde_json::from_slice(payload)?;
				Ok(Frame::ListenerReady {
					service_id: p.service_id,
				})
			}
			FRAME_TYPE_LISTENER_ERROR => {
				let p: ServiceErrorPayload = serde_json::from_slice(payload)?;
				Ok(Frame::ListenerError {
					service_id: p.service_id,
					message: p.message,
				})
			}
			FRAME_TYPE_DESTROY_LISTENER => {
				let p: ServicePayload = serde_json::from_slice(payload)?;
				Ok(Frame::DestroyListener {
					service_id: p.service_id,
				})
			}
			FRAME_TYPE_OPEN => {
				let p: OpenPayload = serde_json::from_slice(payload)?;
				Ok(Frame::Open {
					service_id: p.service_id,
					connection_id: p.connection_id,
					destination_addr: p.destination_addr,
				})
			}
			FRAME_TYPE_OPEN_ACK => Ok(Frame::OpenAck {
				connection_id: read_connection_id(frame_type, payload)?,
			}),
			FRAME_TYPE_OPEN_ERROR => {
				let connection_id = read_connection_id(frame_type, payload)?;
				let message = String::from_utf8_lossy(&payload[4..]).into_owned();
				Ok(Frame::OpenError {
					connection_id,
					message,
				})
			}
			FRAME_TYPE_DATA => {
				let connection_id = read_connection_id(frame_type, payload)?;
				Ok(Frame::Data {
					connection_id,
					data: payload[4..].to_vec(),
				})
			}
			FRAME_TYPE_CLOSE_WRITE => Ok(Frame::CloseWrite {
				connection_id: read_connection_id(frame_type, payload)?,
			}),
			FRAME_TYPE_CLOSE => Ok(Frame::Close {
				connection_id: read_connection_id(frame_type, payload)?,
			}),
			_ => Err(ProtoError::InvalidFrameType(frame_type)),
		}
	}
}

fn read_connection_id(frame_type: u8, payload: &[u8]) -> Result<u32> {
	if payload.len() < 4 {
		return Err(ProtoError::PayloadTooShort(frame_type));
	}
	let mut id = [0u8; 4];
	id.copy_from_slice(&payload[..4]);
	Ok(u32::from_be_bytes(id))
}

pub fn encode_frame_header(frame_type: u8, payload_len: usize) -> [u8; 4] {
	let len = payload_len as u32;
	[
		frame_type,
		((len >> 16) & 0xff) as u8,
		((len >> 8) & 0xff) as u8,
		(len & 0xff) as u8,
	]
}

pub fn decode_frame_header(header: &[u8; 4]) -> (u8, usize) {
	let frame_type = header[0];
	let len = ((header[1] as usize) << 16) | ((header[2] as usize) << 8) | (header[3] as usize);
	(frame_type, len)
}

/// Reads a single frame from the stream. Returns [`ProtoError::ConnectionClosed`]
/// on a clean EOF at a frame boundary.
pub async fn read_frame<R>(stream: &mut R) -> Result<Frame>
where
	R: AsyncRead + Unpin,
{
	let mut header = [0u8; 4];
	stream.read_exact(&mut header).await.map_err(map_eof)?;

	let (frame_type, payload_len) = decode_frame_header(&header);

	if payload_len > MAX_FRAME_SIZE {
		return Err(ProtoError::FrameTooLarge(payload_len, MAX_FRAME_SIZE));
	}

	let mut payload = vec![0u8; payload_len];
	if payload_len > 0 {
		stream.read_exact(&mut payload).await.map_err(map_eof)?;
	}

	Frame::decode_payload(frame_type, &payload)
}

fn map_eof(e: std::io::Error) -> ProtoError {
	if e.kind() == std::io::ErrorKind::UnexpectedEof {
		ProtoError::ConnectionClosed
	} else {
		ProtoError::Io(e)
	}
}
