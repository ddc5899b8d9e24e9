//! # Configuration
//!
//! Engine configuration loaded from a TOML file (path in `XJOB_CONFIG_PATH`)
//! with `XJOB_*` environment variable overrides. Key names mirror the
//! operator-facing configuration of the platform: the bus addresses are
//! required, everything else has a sensible default.

use serde::Deserialize;

use crate::errors::{XjobError, XjobResult};

fn default_api_listen() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_refresh_interval_secs() -> u64 {
    5
}

fn default_claim_interval_secs() -> u64 {
    5
}

/// Engine configuration shared by the server, orchestrator and worker binaries
#[derive(Debug, Clone, Deserialize)]
pub struct XjobConfig {
    /// Address of the bus endpoint the orchestrator listens on for replies
    pub beanstalkd_reply_addr: String,
    /// Reply tube name; each orchestrator owns one
    pub beanstalkd_reply_tube: String,
    /// Tube workers watch for task messages
    pub beanstalkd_workers_tube: String,
    /// Backend store endpoint (`redis://...` or `memory://` for development)
    pub backend_endpoint: String,
    /// Stable orchestrator identity; defaults to the host name
    #[serde(default)]
    pub orchestrator_id: Option<String>,
    /// Listen address for the HTTP control API
    #[serde(default = "default_api_listen")]
    pub api_listen: String,
    /// Membership service endpoint used for worker discovery
    #[serde(default)]
    pub directory_endpoint: Option<String>,
    /// Local bus address a worker process reserves task messages from
    #[serde(default)]
    pub worker_beanstalkd_addr: Option<String>,
    /// Worker discovery period, seconds
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    /// Claim poll period, seconds
    #[serde(default = "default_claim_interval_secs")]
    pub claim_interval_secs: u64,
}

impl XjobConfig {
    /// Load configuration from the path in `XJOB_CONFIG_PATH`, then apply
    /// `XJOB_*` environment overrides.
    pub fn load() -> XjobResult<Self> {
        let path = std::env::var("XJOB_CONFIG_PATH")
            .map_err(|_| XjobError::Config("XJOB_CONFIG_PATH is not set".to_string()))?;
        Self::from_file(&path)
    }

    /// Load configuration from an explicit TOML file path.
    pub fn from_file(path: &str) -> XjobResult<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("XJOB"))
            .build()?;

        let config: XjobConfig = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> XjobResult<()> {
        if self.beanstalkd_reply_addr.is_empty() {
            return Err(XjobError::Config(
                "Missing beanstalkd reply address".to_string(),
            ));
        }
        if self.beanstalkd_reply_tube.is_empty() {
            return Err(XjobError::Config(
                "Missing beanstalkd reply tube".to_string(),
            ));
        }
        if self.beanstalkd_workers_tube.is_empty() {
            return Err(XjobError::Config(
                "Missing beanstalkd workers tube".to_string(),
            ));
        }
        if self.backend_endpoint.is_empty() {
            return Err(XjobError::Config("Missing backend endpoint".to_string()));
        }
        Ok(())
    }

    /// The effective orchestrator id: the configured one, or the host name.
    pub fn orchestrator_id(&self) -> String {
        self.orchestrator_id
            .clone()
            .filter(|id| !id.is_empty())
            .or_else(sysinfo::System::host_name)
            .unwrap_or_else(|| "xjob-orchestrator".to_string())
    }
}
