// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::IntegrationError;
use async_trait::async_trait;
use tracing::debug;

/// Pluggable side-effect fired when a service becomes reachable on the
/// exposing side and when it is torn down. `name` is always the normalized
/// service name ([`tether_proto::normalize_name`]).
///
/// `register` is called once per service when the listener is ready; an error
/// fails the service and suppresses the matching `deregister`. `deregister`
/// is called once on destruction or fatal error, only after a successful
/// `register`. Calls may run concurrently across services but never
/// concurrently for the same service.
#[async_trait]
pub trait Integration: Send + Sync {
	async fn register(
		&self,
		name: &str,
		source_port: u16,
		destination_port: u16,
	) -> Result<(), IntegrationError>;

	async fn deregister(&self, name: &str) -> Result<(), IntegrationError>;
}

/// Default integration: accepts everything and touches nothing.
#[derive(Debug, Default)]
pub struct NoopIntegration;

#[async_trait]
impl Integration for NoopIntegration {
	async fn register(
		&self,
		name: &str,
		source_port: u16,
		destination_port: u16,
	) -> Result<(), IntegrationError> {
		debug!(%name, source_port, destination_port, "noop register");
		Ok(())
	}

	async fn deregister(&self, name: &str) -> Result<(), IntegrationError> {
		debug!(%name, "noop deregister");
		Ok(())
	}
}
