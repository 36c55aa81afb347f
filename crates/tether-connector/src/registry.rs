// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::RegistryError;
use crate::stream::ListenerGuard;
use std::collections::HashMap;
use tether_proto::{ServiceRecord, ServiceSpec, ServiceStatus};
use tokio::sync::Mutex;
use tracing::{debug, instrument};
use uuid::Uuid;

struct ServiceEntry {
	record: ServiceRecord,
	owner_token: Uuid,
	listener: Option<ListenerGuard>,
	session_peer: Option<String>,
	registered_name: Option<String>,
}

/// Everything teardown needs once a service has been claimed for removal.
pub(crate) struct RemovedService {
	pub record: ServiceRecord,
	pub listener: Option<ListenerGuard>,
	pub session_peer: Option<String>,
	pub registered_name: Option<String>,
}

/// Canonical store of exposed services. All rules are evaluated under the
/// single internal mutex; critical sections stay short and never await I/O.
///
/// Streams and controllers refer to services by id through this registry
/// rather than holding pointers at each other.
pub struct ServiceRegistry {
	services: Mutex<HashMap<Uuid, ServiceEntry>>,
}

impl ServiceRegistry {
	pub fn new() -> Self {
		Self {
			services: Mutex::new(HashMap::new()),
		}
	}

	/// Validates and inserts a new PENDING record, allocating its id.
	///
	/// A request that duplicates an existing service from the *same* client
	/// session on the same `(type, source_port, remote_connector_addr)` is
	/// rejected synchronously. Conflicts across sessions are accepted here;
	/// the losing controller surfaces `status=ERROR` once the bind fails.
	#[instrument(skip(self, spec), fields(name = %spec.name, port = spec.source_port))]
	pub async fn insert(
		&self,
		spec: ServiceSpec,
		owner_token: Uuid,
	) -> Result<Uuid, RegistryError> {
		spec
			.validate()
			.map_err(|e| RegistryError::InvalidService(e.to_string()))?;

		let mut services = self.services.lock().await;

		let duplicate = services.values().any(|entry| {
			entry.owner_token == owner_token
				&& entry.record.service_type == spec.service_type
				&& entry.record.source_port == spec.source_port
				&& entry.record.remote_connector_addr == spec.remote_connector_addr
		});
		if duplicate {
			return Err(RegistryError::Duplicate(spec.source_port));
		}

		let id = Uuid::new_v4();
		services.insert(
			id,
			ServiceEntry {
				record: ServiceRecord::new(id, spec),
				owner_token,
				listener: None,
				session_peer: None,
				registered_name: None,
			},
		);

		debug!(%id, "accepted service");
		Ok(id)
	}

	pub async fn get(&self, id: Uuid) -> Option<ServiceRecord> {
		self
			.services
			.lock()
			.await
			.get(&id)
			.map(|entry| entry.record.clone())
	}

	pub async fn list(&self) -> Vec<ServiceRecord> {
		self
			.services
			.lock()
			.await
			.values()
			.map(|entry| entry.record.clone())
			.collect()
	}

	pub async fn ids(&self) -> Vec<Uuid> {
		self.services.lock().await.keys().copied().collect()
	}

	/// PENDING → COMPLETE. A service already destroyed or failed is left
	/// untouched.
	pub async fn set_complete(&self, id: Uuid) {
		let mut services = self.services.lock().await;
		if let Some(entry) = services.get_mut(&id) {
			if entry.record.status == ServiceStatus::Pending {
				entry.record.status = ServiceStatus::Complete;
				entry.record.error_message = None;
			}
		}
	}

	/// PENDING → ERROR or COMPLETE → ERROR. Releases the service's listener;
	/// the record itself stays until destroyed.
	pub async fn set_error(&self, id: Uuid, message: &str) {
		let mut services = self.services.lock().await;
		if let Some(entry) = services.get_mut(&id) {
			entry.record.status = ServiceStatus::Error;
			entry.record.error_message = Some(message.to_string());
			entry.listener = None;
		}
	}

	/// Attaches the accept-loop guard for the exposing-side listener.
	/// Returns false when the service has been destroyed in the meantime;
	/// the dropped guard then closes the freshly created listener.
	pub async fn attach_listener(&self, id: Uuid, guard: ListenerGuard) -> bool {
		let mut services = self.services.lock().await;
		match services.get_mut(&id) {
			Some(entry) => {
				entry.listener = Some(guard);
				true
			}
			None => false,
		}
	}

	/// Records that the integration hook accepted `register` for this
	/// service. Returns false when the service is already gone, in which
	/// case the caller must issue the compensating deregister itself.
	pub async fn mark_registered(&self, id: Uuid, name: &str) -> bool {
		let mut services = self.services.lock().await;
		match services.get_mut(&id) {
			Some(entry) => {
				entry.registered_name = Some(name.to_string());
				true
			}
			None => false,
		}
	}

	pub async fn set_session_peer(&self, id: Uuid, peer: &str) {
		let mut services = self.services.lock().await;
		if let Some(entry) = services.get_mut(&id) {
			entry.session_peer = Some(peer.to_string());
		}
	}

	/// Claims a service for teardown, removing the record.
	pub(crate) async fn remove(&self, id: Uuid) -> Option<RemovedService> {
		let entry = self.services.lock().await.remove(&id)?;
		Some(RemovedService {
			record: entry.record,
			listener: entry.listener,
			session_peer: entry.session_peer,
			registered_name: entry.registered_name,
		})
	}

	/// Marks every service riding the given peer stream as failed and
	/// releases their listeners. Records remain until destroyed.
	pub async fn fail_services_on_peer(&self, peer: &str, message: &str) -> Vec<Uuid> {
		let mut services = self.services.lock().await;
		let mut failed = Vec::new();
		for entry in services.values_mut() {
			if entry.session_peer.as_deref() == Some(peer)
				&& entry.record.status != ServiceStatus::Error
			{
				entry.record.status = ServiceStatus::Error;
				entry.record.error_message = Some(message.to_string());
				entry.listener = None;
				failed.push(entry.record.id);
			}
		}
		failed
	}
}

impl Default for ServiceRegistry {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tether_proto::ServiceType;

	fn spec(port: u16, peer: &str, service_type: ServiceType) -> ServiceSpec {
		ServiceSpec {
			name: "Test Service".to_string(),
			remote_connector_addr: peer.to_string(),
			source_port: port,
			destination_addr: "localhost:19001".to_string(),
			service_type,
		}
	}

	#[tokio::test]
	async fn test_insert_allocates_distinct_ids() {
		let registry = ServiceRegistry::new();
		let owner = Uuid::new_v4();
		let a = registry
			.insert(spec(19000, "localhost:1235", ServiceType::Remote), owner)
			.await
			.unwrap();
		let b = registry
			.insert(spec(19001, "localhost:1235", ServiceType::Remote), owner)
			.await
			.unwrap();
		assert_ne!(a, b);
	}

	#[tokio::test]
	async fn test_same_session_duplicate_rejected() {
		let registry = ServiceRegistry::new();
		let owner = Uuid::new_v4();
		registry
			.insert(spec(19000, "localhost:1235", ServiceType::Remote), owner)
			.await
			.unwrap();
		let err = registry
			.insert(spec(19000, "localhost:1235", ServiceType::Remote), owner)
			.await
			.unwrap_err();
		assert!(matches!(err, RegistryError::Duplicate(19000)));
	}

	#[tokio::test]
	async fn test_cross_session_duplicate_accepted() {
		let registry = ServiceRegistry::new();
		registry
			.insert(
				spec(19000, "localhost:1235", ServiceType::Remote),
				Uuid::new_v4(),
			)
			.await
			.unwrap();
		// different session; deferred to the controller's bind attempt
		registry
			.insert(
				spec(19000, "localhost:1235", ServiceType::Remote),
				Uuid::new_v4(),
			)
			.await
			.unwrap();
	}

	#[tokio::test]
	async fn test_same_port_different_peer_accepted() {
		let registry = ServiceRegistry::new();
		let owner = Uuid::new_v4();
		registry
			.insert(spec(19000, "localhost:1235", ServiceType::Local), owner)
			.await
			.unwrap();
		registry
			.insert(spec(19000, "localhost:1236", ServiceType::Local), owner)
			.await
			.unwrap();
	}

	#[tokio::test]
	async fn test_invalid_spec_rejected() {
		let registry = ServiceRegistry::new();
		let mut bad = spec(19000, "localhost:1235", ServiceType::Remote);
		bad.name = String::new();
		let err = registry.insert(bad, Uuid::new_v4()).await.unwrap_err();
		assert!(matches!(err, RegistryError::InvalidService(_)));
	}

	#[tokio::test]
	async fn test_status_transitions() {
		let registry = ServiceRegistry::new();
		let id = registry
			.insert(
				spec(19000, "localhost:1235", ServiceType::Remote),
				Uuid::new_v4(),
			)
			.await
			.unwrap();

		assert_eq!(
			registry.get(id).await.unwrap().status,
			ServiceStatus::Pending
		);

		registry.set_complete(id).await;
		assert_eq!(
			registry.get(id).await.unwrap().status,
			ServiceStatus::Complete
		);

		registry.set_error(id, "peer stream closed").await;
		let record = registry.get(id).await.unwrap();
		assert_eq!(record.status, ServiceStatus::Error);
		assert_eq!(record.error_message.as_deref(), Some("peer stream closed"));

		// a failed service stays failed
		registry.set_complete(id).await;
		assert_eq!(
			registry.get(id).await.unwrap().status,
			ServiceStatus::Error
		);
	}

	#[tokio::test]
	async fn test_fail_services_on_peer() {
		let registry = ServiceRegistry::new();
		let owner = Uuid::new_v4();
		let a = registry
			.insert(spec(19000, "localhost:1235", ServiceType::Local), owner)
			.await
			.unwrap();
		let b = registry
			.insert(spec(19001, "localhost:1236", ServiceType::Local), owner)
			.await
			.unwrap();
		registry.set_session_peer(a, "localhost:1235").await;
		registry.set_session_peer(b, "localhost:1236").await;

		let failed = registry
			.fail_services_on_peer("localhost:1235", "peer stream closed")
			.await;
		assert_eq!(failed, vec![a]);
		assert_eq!(registry.get(a).await.unwrap().status, ServiceStatus::Error);
		assert_eq!(
			registry.get(b).await.unwrap().status,
			ServiceStatus::Pending
		);
	}

	#[tokio::test]
	async fn test_remove_claims_entry_once() {
		let registry = ServiceRegistry::new();
		let id = registry
			.insert(
				spec(19000, "localhost:1235", ServiceType::Remote),
				Uuid::new_v4(),
			)
			.await
			.unwrap();
		assert!(registry.remove(id).await.is_some());
		assert!(registry.remove(id).await.is_none());
		assert!(!registry.mark_registered(id, "test-service").await);
	}
}
