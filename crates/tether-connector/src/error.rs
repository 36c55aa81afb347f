// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ConnectorError {
	#[error("protocol error: {0}")]
	Proto(#[from] tether_proto::ProtoError),

	#[error("registry error: {0}")]
	Registry(#[from] RegistryError),

	#[error("stream error: {0}")]
	Stream(#[from] StreamError),

	#[error("TLS error: {0}")]
	Tls(#[from] TlsError),

	#[error("integration error: {0}")]
	Integration(#[from] IntegrationError),

	#[error("rpc error: {0}")]
	Rpc(String),

	#[error("listener error: {0}")]
	Listener(String),

	#[error("not bound")]
	NotBound,

	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum RegistryError {
	#[error("duplicate service registration for port {0}")]
	Duplicate(u16),

	#[error("unknown service: {0}")]
	UnknownService(Uuid),

	#[error("invalid service definition: {0}")]
	InvalidService(String),
}

#[derive(Debug, Error)]
pub enum StreamError {
	#[error("failed to dial peer {addr}: {reason}")]
	Dial { addr: String, reason: String },

	#[error("timed out waiting for {0}")]
	Timeout(&'static str),

	#[error("stream closed")]
	Closed,

	#[error("connection rejected by peer: {0}")]
	OpenRejected(String),

	#[error("listener rejected by peer: {0}")]
	ListenerRejected(String),

	#[error("protocol error: {0}")]
	Proto(#[from] tether_proto::ProtoError),

	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum TlsError {
	#[error("failed to read {path}: {source}")]
	ReadMaterial {
		path: String,
		source: std::io::Error,
	},

	#[error("invalid PEM in {0}")]
	InvalidPem(String),

	#[error("no private key found in {0}")]
	NoPrivateKey(String),

	#[error("root, certificate and key must all be provided for TLS, or none for plaintext mode")]
	PartialMaterial,

	#[error("client verifier: {0}")]
	Verifier(String),

	#[error("TLS configuration error: {0}")]
	Config(#[from] rustls::Error),
}

/// Failure reported by an [`crate::integrations::Integration`] hook.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct IntegrationError(pub String);

pub type Result<T> = std::result::Result<T, ConnectorError>;
