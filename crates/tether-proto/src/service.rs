// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{ProtoError, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which side of the pair the service lives on.
///
/// `Local`: the service is reachable from this daemon at `destination_addr`
/// and is exposed on the remote peer at `source_port`. `Remote`: the service
/// is reachable from the peer and is exposed on this daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
	Local,
	Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
	Pending,
	Complete,
	Error,
}

/// User-supplied definition of a service to expose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
	pub name: String,
	pub remote_connector_addr: String,
	pub source_port: u16,
	pub destination_addr: String,
	#[serde(rename = "type")]
	pub service_type: ServiceType,
}

impl ServiceSpec {
	pub fn validate(&self) -> Result<()> {
		if self.name.trim().is_empty() {
			return Err(ProtoError::InvalidService("name must not be empty".to_string()));
		}
		if self.source_port == 0 {
			return Err(ProtoError::InvalidService(
				"source_port must not be zero".to_string(),
			));
		}
		if self.destination_addr.is_empty() {
			return Err(ProtoError::InvalidService(
				"destination_addr must not be empty".to_string(),
			));
		}
		if self.remote_connector_addr.is_empty() {
			return Err(ProtoError::InvalidService(
				"remote_connector_addr must not be empty".to_string(),
			));
		}
		Ok(())
	}
}

/// Registry row for an accepted service, as returned by `ListServices`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRecord {
	pub id: Uuid,
	pub name: String,
	pub remote_connector_addr: String,
	pub source_port: u16,
	pub destination_addr: String,
	#[serde(rename = "type")]
	pub service_type: ServiceType,
	pub status: ServiceStatus,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error_message: Option<String>,
}

impl ServiceRecord {
	pub fn new(id: Uuid, spec: ServiceSpec) -> Self {
		Self {
			id,
			name: spec.name,
			remote_connector_addr: spec.remote_connector_addr,
			source_port: spec.source_port,
			destination_addr: spec.destination_addr,
			service_type: spec.service_type,
			status: ServiceStatus::Pending,
			error_message: None,
		}
	}
}

/// Normalized form of a service name as handed to the integration hook:
/// lowercased, spaces replaced with `-`. The hook contract depends on this.
pub fn normalize_name(name: &str) -> String {
	name.to_lowercase().replace(' ', "-")
}

#[cfg(test)]
mod tests {
	use super::*;

	fn spec() -> ServiceSpec {
		ServiceSpec {
			name: "Test Service".to_string(),
			remote_connector_addr: "localhost:1235".to_string(),
			source_port: 19000,
			destination_addr: "localhost:19001".to_string(),
			service_type: ServiceType::Local,
		}
	}

	#[test]
	fn test_normalize_name() {
		assert_eq!(normalize_name("Test Service"), "test-service");
		assert_eq!(normalize_name("already-normal"), "already-normal");
		assert_eq!(normalize_name("Mixed CASE Words"), "mixed-case-words");
	}

	#[test]
	fn test_validate_ok() {
		assert!(spec().validate().is_ok());
	}

	#[test]
	fn test_validate_rejects_empty_name() {
		let mut s = spec();
		s.name = "  ".to_string();
		assert!(matches!(s.validate(), Err(ProtoError::InvalidService(_))));
	}

	#[test]
	fn test_validate_rejects_zero_port() {
		let mut s = spec();
		s.source_port = 0;
		assert!(matches!(s.validate(), Err(ProtoError::InvalidService(_))));
	}

	#[test]
	fn test_service_type_wire_format() {
		let json = serde_json::to_string(&ServiceType::Local).unwrap();
		assert_eq!(json, "\"local\"");
		let parsed: ServiceType = serde_json::from_str("\"remote\"").unwrap();
		assert_eq!(parsed, ServiceType::Remote);
	}

	#[test]
	fn test_record_starts_pending() {
		let record = ServiceRecord::new(Uuid::new_v4(), spec());
		assert_eq!(record.status, ServiceStatus::Pending);
		assert!(record.error_message.is_none());
	}
}
