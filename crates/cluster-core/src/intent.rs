//! Join intents and join plans.
//!
//! A [`JoinIntent`] is what a candidate machine sends (signed) to declare it
//! wants to pair. A [`JoinPlan`] is what the join coordinator hands to a
//! confirmed peer: one token per subsystem plus opaque per-subsystem config.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::service::ServiceType;

/// Protocol compatibility tag carried in intents and discovery records.
///
/// Increment when making breaking changes to the pairing protocol.
pub const PROTOCOL_VERSION: &str = "1.0";

/// A request to join an active session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JoinIntent {
    pub name: String,
    pub version: String,
    pub address: String,
    /// PEM encoded certificate of the sender
    pub certificate: String,
    /// Services the sender runs
    pub services: Vec<ServiceType>,
}

impl JoinIntent {
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        certificate: impl Into<String>,
        services: Vec<ServiceType>,
    ) -> Self {
        Self {
            name: name.into(),
            version: PROTOCOL_VERSION.to_string(),
            address: address.into(),
            certificate: certificate.into(),
            services,
        }
    }

    /// Canonical JSON encoding. The HMAC is computed over exactly these bytes.
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("JoinIntent serialization should not fail")
    }

    /// Check the fields every intent must carry.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("Missing name".to_string());
        }

        if self.address.is_empty() {
            return Err(format!("Missing address of {:?}", self.name));
        }

        if self.certificate.is_empty() {
            return Err(format!("Missing certificate of {:?}", self.name));
        }

        Ok(())
    }

    /// Services from `required` that the sender did not advertise.
    pub fn missing_services(&self, required: &[ServiceType]) -> Vec<ServiceType> {
        required
            .iter()
            .filter(|s| !self.services.contains(s))
            .copied()
            .collect()
    }
}

/// Per-subsystem join parameters handed to [`crate::service::Service::join`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JoinConfig {
    pub token: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub config: serde_json::Value,
}

/// Everything a peer needs to join every subsystem.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JoinPlan {
    pub address: String,
    pub tokens: BTreeMap<ServiceType, String>,
    /// Opaque per-subsystem configuration
    #[serde(default)]
    pub config: BTreeMap<ServiceType, serde_json::Value>,
}

impl JoinPlan {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    pub fn add_token(&mut self, service: ServiceType, token: String) {
        self.tokens.insert(service, token);
    }

    /// Requested services that have no usable token yet.
    pub fn missing_tokens(&self, services: &[ServiceType]) -> Vec<ServiceType> {
        services
            .iter()
            .filter(|s| self.tokens.get(s).is_none_or(|t| t.is_empty()))
            .copied()
            .collect()
    }

    /// A plan is complete once it holds a token for every requested service.
    pub fn is_complete(&self, services: &[ServiceType]) -> bool {
        self.missing_tokens(services).is_empty()
    }

    pub fn services(&self) -> Vec<ServiceType> {
        self.tokens.keys().copied().collect()
    }

    /// Join parameters for one subsystem.
    pub fn join_config(&self, service: ServiceType) -> Option<JoinConfig> {
        let token = self.tokens.get(&service)?;
        Some(JoinConfig {
            token: token.clone(),
            config: self.config.get(&service).cloned().unwrap_or_default(),
        })
    }
}
