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

//! Relay serving and relay mining.

use crate::client::{
    AccountQuerier, ApplicationQuerier, BlockClient, EventsClient, ServiceQuerier,
    SessionQuerier, SharedQuerier,
};
use std::sync::Arc;

pub mod authenticator;
pub mod backend;
pub mod config;
pub mod meter;
pub mod miner;
pub mod ring_cache;
pub mod server;
pub mod session_cache;
pub mod supervisor;

pub use authenticator::RelayAuthenticator;
pub use backend::{Backend, BackendRequest, ServiceRequest, ServiceResponse};
pub use config::{
    BackendConfig, DropPolicy, MiningSupervisorConfig, RelayMinerConfig, ServiceConfig,
    ValidationMode,
};
pub use meter::{OverServicingAllowance, RelayMeter};
pub use miner::RelayMiner;
pub use ring_cache::RingCache;
pub use server::RelayServer;
pub use session_cache::{SessionCache, SessionCacheEntry};
pub use supervisor::{RelayMiningSupervisor, SupervisorStats};

#[cfg(feature = "http-backend")]
pub use backend::HttpBackend;

/// Chain facing collaborators.
#[derive(Clone)]
pub struct ChainClients {
    pub blocks: Arc<dyn BlockClient>,
    pub events: Arc<dyn EventsClient>,
    pub sessions: Arc<dyn SessionQuerier>,
    pub applications: Arc<dyn ApplicationQuerier>,
    pub accounts: Arc<dyn AccountQuerier>,
    pub shared: Arc<dyn SharedQuerier>,
    pub services: Arc<dyn ServiceQuerier>,
}

impl ChainClients {
    /// All collaborators served by a single chain client.
    pub fn from_client<C>(client: Arc<C>) -> Self
    where
        C: BlockClient
            + EventsClient
            + SessionQuerier
            + ApplicationQuerier
            + AccountQuerier
            + SharedQuerier
            + ServiceQuerier
            + 'static,
    {
        ChainClients {
            blocks: client.clone(),
            events: client.clone(),
            sessions: client.clone(),
            applications: client.clone(),
            accounts: client.clone(),
            shared: client.clone(),
            services: client,
        }
    }
}
