// This file is part of TRINCI.
//
// Copyright (C) 2021 Affidaty Spa.
//
// TRINCI is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the
// Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// TRINCI is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License
// for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with TRINCI. If not, see <https://www.gnu.org/licenses/>.

//! Relay miner configuration.

use crate::{Error, ErrorKind, Result};
use std::{collections::HashMap, time::Duration};

/// Used when neither the service nor the node set a timeout.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default max relay request body size (4 MiB).
pub const DEFAULT_MAX_BODY_SIZE: usize = 4 * 1024 * 1024;

/// Default mining queue capacity.
pub const DEFAULT_QUEUE_SIZE: usize = 10_000;

/// Default interval between two drop warnings.
pub const DEFAULT_DROP_LOG_INTERVAL_MS: u64 = 2_000;

/// When relays are checked against the chain.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    /// Meter and verify before contacting the backend.
    Eager,
    /// Serve first, meter and verify asynchronously.
    #[serde(alias = "optimistic")]
    Lazy,
}

impl Default for ValidationMode {
    fn default() -> Self {
        ValidationMode::Lazy
    }
}

/// What the mining supervisor sacrifices when its queue is full.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Reject the relay being published.
    DropNewest,
    /// Evict the oldest queued relay to make room.
    DropOldest,
}

impl Default for DropPolicy {
    fn default() -> Self {
        DropPolicy::DropNewest
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Authentication {
    Basic { username: String, password: String },
    Bearer { token: String },
}

/// Backend serving one RPC type of a service.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL, `http://` or `https://`.
    pub url: String,
    /// Headers added to every forwarded request, overriding client ones.
    pub headers: HashMap<String, String>,
    pub authentication: Option<Authentication>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ServiceConfig {
    /// Overrides the node default.
    pub validation_mode: Option<ValidationMode>,
    /// Overrides the node default.
    pub request_timeout_secs: Option<u64>,
    /// Overrides the node default.
    pub max_body_size: Option<usize>,
    /// Backend used when no RPC type specific one matches.
    pub backend: BackendConfig,
    /// Backends selected by the RPC type request header.
    pub rpc_backends: HashMap<String, BackendConfig>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct MiningSupervisorConfig {
    /// Queue capacity.
    pub queue_size: usize,
    /// Number of workers draining the queue.
    pub workers: usize,
    pub drop_policy: DropPolicy,
    /// How long a publish may wait for room before applying the drop policy.
    /// Zero never waits.
    pub enqueue_timeout_ms: u64,
    pub drop_log_interval_ms: u64,
}

impl Default for MiningSupervisorConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        MiningSupervisorConfig {
            queue_size: DEFAULT_QUEUE_SIZE,
            workers,
            drop_policy: DropPolicy::default(),
            enqueue_timeout_ms: 0,
            drop_log_interval_ms: DEFAULT_DROP_LOG_INTERVAL_MS,
        }
    }
}

impl MiningSupervisorConfig {
    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    pub fn drop_log_interval(&self) -> Duration {
        Duration::from_millis(self.drop_log_interval_ms)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct RelayMinerConfig {
    /// IP address (e.g. 127.0.0.1 for localhost)
    pub listen_addr: String,
    /// TCP port.
    pub port: u16,
    pub default_validation_mode: ValidationMode,
    pub default_request_timeout_secs: u64,
    pub max_body_size: usize,
    /// Added to the on-chain session grace period.
    pub grace_period_extra_blocks: u64,
    /// Coins an application may be served beyond its payable stake before
    /// being rate limited. Negative means no limit.
    pub over_servicing_allowance: i64,
    /// Operator address to keyring key name.
    pub suppliers: HashMap<String, String>,
    /// Service id to service configuration.
    pub services: HashMap<String, ServiceConfig>,
    pub mining_supervisor: MiningSupervisorConfig,
}

impl Default for RelayMinerConfig {
    fn default() -> Self {
        RelayMinerConfig {
            listen_addr: "127.0.0.1".to_owned(),
            port: 8545,
            default_validation_mode: ValidationMode::default(),
            default_request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            grace_period_extra_blocks: 0,
            over_servicing_allowance: 0,
            suppliers: HashMap::new(),
            services: HashMap::new(),
            mining_supervisor: MiningSupervisorConfig::default(),
        }
    }
}

fn config_error(msg: String) -> Error {
    Error::new_ext(ErrorKind::MalformedData, msg)
}

impl RelayMinerConfig {
    /// Parse and validate a JSON document. Missing fields take their default.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: RelayMinerConfig = serde_json::from_str(json)
            .map_err(|err| Error::new_ext(ErrorKind::MalformedData, err))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.is_empty() {
            return Err(config_error("listen_addr is required".to_owned()));
        }
        if self.mining_supervisor.queue_size == 0 {
            return Err(config_error("mining_supervisor.queue_size must be positive".to_owned()));
        }
        if self.mining_supervisor.workers == 0 {
            return Err(config_error("mining_supervisor.workers must be positive".to_owned()));
        }
        for (operator, key_name) in self.suppliers.iter() {
            if operator.is_empty() || key_name.is_empty() {
                return Err(config_error(format!(
                    "supplier '{}' needs both an address and a key name",
                    operator
                )));
            }
        }
        for (id, service) in self.services.iter() {
            validate_backend(id, "default", &service.backend)?;
            for (rpc_type, backend) in service.rpc_backends.iter() {
                validate_backend(id, rpc_type, backend)?;
            }
        }
        Ok(())
    }

    pub fn validation_mode(&self, service_id: &str) -> ValidationMode {
        self.services
            .get(service_id)
            .and_then(|svc| svc.validation_mode)
            .unwrap_or(self.default_validation_mode)
    }

    pub fn request_timeout(&self, service_id: &str) -> Duration {
        let secs = self
            .services
            .get(service_id)
            .and_then(|svc| svc.request_timeout_secs)
            .filter(|secs| *secs > 0)
            .unwrap_or(match self.default_request_timeout_secs {
                0 => DEFAULT_REQUEST_TIMEOUT_SECS,
                secs => secs,
            });
        Duration::from_secs(secs)
    }

    pub fn max_body_size(&self, service_id: &str) -> usize {
        self.services
            .get(service_id)
            .and_then(|svc| svc.max_body_size)
            .filter(|size| *size > 0)
            .unwrap_or(self.max_body_size)
    }

    /// Backend for a service, the RPC type specific one when configured.
    pub fn backend(&self, service_id: &str, rpc_type: Option<&str>) -> Option<&BackendConfig> {
        let service = self.services.get(service_id)?;
        rpc_type
            .and_then(|rpc_type| service.rpc_backends.get(rpc_type))
            .or(Some(&service.backend))
    }

    /// Keyring key name of an operator served by this node.
    pub fn key_name(&self, operator_address: &str) -> Option<&str> {
        self.suppliers.get(operator_address).map(|s| s.as_str())
    }
}

fn validate_backend(service_id: &str, rpc_type: &str, backend: &BackendConfig) -> Result<()> {
    if !(backend.url.starts_with("http://") || backend.url.starts_with("https://")) {
        return Err(config_error(format!(
            "services[{}].{} backend url must be http(s), got '{}'",
            service_id, rpc_type, backend.url
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub fn create_test_config(service_id: &str, backend_url: &str) -> RelayMinerConfig {
        let mut config = RelayMinerConfig::default();
        config.services.insert(
            service_id.to_owned(),
            ServiceConfig {
                backend: BackendConfig {
                    url: backend_url.to_owned(),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        config
    }

    const CONFIG_JSON: &str = r#"{
        "listen_addr": "0.0.0.0",
        "port": 8545,
        "default_validation_mode": "optimistic",
        "over_servicing_allowance": -1,
        "suppliers": { "pokt1supplier": "supplier1" },
        "services": {
            "anvil": {
                "validation_mode": "eager",
                "request_timeout_secs": 5,
                "backend": { "url": "http://localhost:8547" },
                "rpc_backends": {
                    "rest": {
                        "url": "https://rest.local/base",
                        "headers": { "X-Api-Key": "secret" },
                        "authentication": { "basic": { "username": "u", "password": "p" } }
                    }
                }
            }
        },
        "mining_supervisor": { "queue_size": 16, "workers": 2, "drop_policy": "drop_oldest" }
    }"#;

    #[test]
    fn parse_json_config() {
        let config = RelayMinerConfig::from_json(CONFIG_JSON).unwrap();

        assert_eq!(config.listen_addr, "0.0.0.0");
        assert_eq!(config.default_validation_mode, ValidationMode::Lazy);
        assert_eq!(config.validation_mode("anvil"), ValidationMode::Eager);
        assert_eq!(config.validation_mode("other"), ValidationMode::Lazy);
        assert_eq!(config.request_timeout("anvil"), Duration::from_secs(5));
        assert_eq!(config.request_timeout("other"), Duration::from_secs(30));
        assert_eq!(config.max_body_size("anvil"), DEFAULT_MAX_BODY_SIZE);
        assert_eq!(config.key_name("pokt1supplier"), Some("supplier1"));
        assert_eq!(config.over_servicing_allowance, -1);
        assert_eq!(config.mining_supervisor.drop_policy, DropPolicy::DropOldest);
        assert_eq!(config.mining_supervisor.queue_size, 16);
        assert_eq!(
            config.mining_supervisor.drop_log_interval(),
            Duration::from_millis(DEFAULT_DROP_LOG_INTERVAL_MS)
        );
    }

    #[test]
    fn backend_selection_by_rpc_type() {
        let config = RelayMinerConfig::from_json(CONFIG_JSON).unwrap();

        let rest = config.backend("anvil", Some("rest")).unwrap();
        let json_rpc = config.backend("anvil", Some("json_rpc")).unwrap();
        let default = config.backend("anvil", None).unwrap();

        assert_eq!(rest.url, "https://rest.local/base");
        assert_eq!(
            rest.authentication,
            Some(Authentication::Basic {
                username: "u".to_owned(),
                password: "p".to_owned()
            })
        );
        assert_eq!(json_rpc.url, "http://localhost:8547");
        assert_eq!(default.url, "http://localhost:8547");
        assert!(config.backend("unknown", None).is_none());
    }

    #[test]
    fn reject_non_http_backend() {
        let config = create_test_config("anvil", "ws://localhost:8547");

        let err = config.validate().unwrap_err();

        assert_eq!(err.kind, ErrorKind::MalformedData);
    }

    #[test]
    fn reject_empty_queue() {
        let mut config = create_test_config("anvil", "http://localhost:8547");
        config.mining_supervisor.queue_size = 0;

        assert!(config.validate().is_err());
    }

    #[test]
    fn defaults() {
        let config = RelayMinerConfig::from_json("{}").unwrap();

        assert_eq!(config.mining_supervisor.queue_size, DEFAULT_QUEUE_SIZE);
        assert!(config.mining_supervisor.workers > 0);
        assert_eq!(config.mining_supervisor.drop_policy, DropPolicy::DropNewest);
        assert_eq!(config.mining_supervisor.enqueue_timeout(), Duration::ZERO);
        assert_eq!(config.over_servicing_allowance, 0);
    }
}
