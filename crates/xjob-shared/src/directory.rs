//! # Service Directory Client
//!
//! Read-only view of cluster membership, used by the orchestrator to find
//! bus endpoints that might host workers. The HTTP variant asks the
//! membership service for all services of a type with their health scores;
//! the static variant serves tests and fixed single-node deployments.

use serde::{Deserialize, Serialize};

use crate::errors::XjobResult;

/// One registered service with its health score
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub addr: String,
    /// Health score; services at zero or below are unusable
    #[serde(default)]
    pub score: i32,
}

impl ServiceInfo {
    pub fn new(addr: impl Into<String>, score: i32) -> Self {
        Self {
            addr: addr.into(),
            score,
        }
    }
}

/// Membership lookup, enum dispatch over the two deployment shapes
#[derive(Debug, Clone)]
pub enum DirectoryClient {
    /// Fixed service list
    Static(Vec<ServiceInfo>),
    /// Membership service over HTTP
    Http {
        endpoint: String,
        client: reqwest::Client,
    },
}

impl DirectoryClient {
    /// Directory serving a fixed list of healthy services
    pub fn static_services(addrs: &[&str]) -> Self {
        Self::Static(
            addrs
                .iter()
                .map(|addr| ServiceInfo::new(*addr, 100))
                .collect(),
        )
    }

    /// Directory backed by the membership service at `endpoint`
    pub fn http(endpoint: impl Into<String>) -> Self {
        Self::Http {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }

    /// All known services of one type, healthy or not.
    pub async fn all_services(&self, service_type: &str) -> XjobResult<Vec<ServiceInfo>> {
        match self {
            Self::Static(services) => Ok(services.clone()),
            Self::Http { endpoint, client } => {
                let services = client
                    .get(format!("{endpoint}/v1.0/services/{service_type}"))
                    .send()
                    .await?
                    .error_for_status()?
                    .json()
                    .await?;
                Ok(services)
            }
        }
    }
}
