// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{StreamError, TlsError};
use crate::stream::AsyncReadWrite;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

/// Certificate material paths from the command line. All three must be
/// present for mutual TLS; all three absent selects plaintext development
/// mode.
#[derive(Debug, Clone, Default)]
pub struct TlsPaths {
	pub root_cert: Option<PathBuf>,
	pub server_cert: Option<PathBuf>,
	pub server_key: Option<PathBuf>,
}

impl TlsPaths {
	pub fn new(
		root_cert: Option<PathBuf>,
		server_cert: Option<PathBuf>,
		server_key: Option<PathBuf>,
	) -> Self {
		Self {
			root_cert,
			server_cert,
			server_key,
		}
	}
}

/// Loaded TLS state, shared by the RPC acceptor and every outbound dial.
/// Certificates are read once at startup.
#[derive(Clone)]
pub struct TlsContext {
	pub acceptor: TlsAcceptor,
	pub connector: TlsConnector,
}

pub fn load(paths: &TlsPaths) -> Result<Option<TlsContext>, TlsError> {
	let (root, cert, key) = match (&paths.root_cert, &paths.server_cert, &paths.server_key) {
		(None, None, None) => return Ok(None),
		(Some(root), Some(cert), Some(key)) => (root, cert, key),
		_ => return Err(TlsError::PartialMaterial),
	};

	let mut roots = RootCertStore::empty();
	for ca in load_certs(root)? {
		roots.add(ca)?;
	}
	let roots = Arc::new(roots);

	let chain = load_certs(cert)?;
	let private_key = load_key(key)?;

	let verifier = WebPkiClientVerifier::builder(roots.clone())
		.build()
		.map_err(|e| TlsError::Verifier(e.to_string()))?;

	let server = ServerConfig::builder()
		.with_client_cert_verifier(verifier)
		.with_single_cert(chain.clone(), private_key.clone_key())?;

	let client = ClientConfig::builder()
		.with_root_certificates(roots)
		.with_client_auth_cert(chain, private_key)?;

	debug!(root = %root.display(), cert = %cert.display(), "loaded TLS material");

	Ok(Some(TlsContext {
		acceptor: TlsAcceptor::from(Arc::new(server)),
		connector: TlsConnector::from(Arc::new(client)),
	}))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
	let data = std::fs::read(path).map_err(|e| TlsError::ReadMaterial {
		path: path.display().to_string(),
		source: e,
	})?;
	let certs: Vec<_> = rustls_pemfile::certs(&mut data.as_slice())
		.collect::<Result<_, _>>()
		.map_err(|_| TlsError::InvalidPem(path.display().to_string()))?;
	if certs.is_empty() {
		return Err(TlsError::InvalidPem(path.display().to_string()));
	}
	Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
	let data = std::fs::read(path).map_err(|e| TlsError::ReadMaterial {
		path: path.display().to_string(),
		source: e,
	})?;
	rustls_pemfile::private_key(&mut data.as_slice())
		.map_err(|_| TlsError::InvalidPem(path.display().to_string()))?
		.ok_or_else(|| TlsError::NoPrivateKey(path.display().to_string()))
}

/// Dials `addr` within `timeout`, upgrading to TLS when a connector is
/// configured. The host part of the address is used as the TLS server name.
pub(crate) async fn dial(
	addr: &str,
	connector: Option<&TlsConnector>,
	timeout: Duration,
) -> Result<Box<dyn AsyncReadWrite>, StreamError> {
	let tcp = tokio::time::timeout(timeout, TcpStream::connect(addr))
		.await
		.map_err(|_| StreamError::Timeout("peer dial"))?
		.map_err(|e| StreamError::Dial {
			addr: addr.to_string(),
			reason: e.to_string(),
		})?;

	match connector {
		None => Ok(Box::new(tcp)),
		Some(connector) => {
			let host = host_of(addr);
			let server_name = ServerName::try_from(host.to_string()).map_err(|_| {
				StreamError::Dial {
					addr: addr.to_string(),
					reason: format!("invalid server name: {host}"),
				}
			})?;
			let tls = connector
				.connect(server_name, tcp)
				.await
				.map_err(|e| StreamError::Dial {
					addr: addr.to_string(),
					reason: format!("TLS handshake failed: {e}"),
				})?;
			Ok(Box::new(tls))
		}
	}
}

fn host_of(addr: &str) -> &str {
	let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
	host.trim_start_matches('[').trim_end_matches(']')
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_no_material_is_plaintext_mode() {
		let loaded = load(&TlsPaths::default()).unwrap();
		assert!(loaded.is_none());
	}

	#[test]
	fn test_partial_material_rejected() {
		let paths = TlsPaths::new(Some(PathBuf::from("/tmp/root.pem")), None, None);
		assert!(matches!(load(&paths), Err(TlsError::PartialMaterial)));
	}

	#[test]
	fn test_host_of() {
		assert_eq!(host_of("localhost:1234"), "localhost");
		assert_eq!(host_of("[::1]:1234"), "::1");
		assert_eq!(host_of("localhost"), "localhost");
	}

	#[test]
	fn test_load_generated_material() {
		let dir = tempfile::tempdir().unwrap();

		let ca_key = rcgen::KeyPair::generate().unwrap();
		let mut ca_params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
		ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
		let ca_cert = ca_params.self_signed(&ca_key).unwrap();

		let leaf_key = rcgen::KeyPair::generate().unwrap();
		let leaf_params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
		let leaf_cert = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key).unwrap();

		let root_path = dir.path().join("root.pem");
		let cert_path = dir.path().join("leaf.pem");
		let key_path = dir.path().join("leaf.key");
		std::fs::write(&root_path, ca_cert.pem()).unwrap();
		std::fs::write(&cert_path, leaf_cert.pem()).unwrap();
		std::fs::write(&key_path, leaf_key.serialize_pem()).unwrap();

		let loaded = load(&TlsPaths::new(
			Some(root_path),
			Some(cert_path),
			Some(key_path),
		))
		.unwrap();
		assert!(loaded.is_some());
	}
}
