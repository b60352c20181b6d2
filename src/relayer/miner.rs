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

//! Relay miner assembly.

use crate::{
    base::Relay,
    channel::Sender,
    client::Keyring,
    relayer::{
        authenticator::RelayAuthenticator,
        backend::Backend,
        config::RelayMinerConfig,
        meter::{OverServicingAllowance, RelayMeter},
        ring_cache::RingCache,
        server::RelayServer,
        session_cache::SessionCache,
        supervisor::RelayMiningSupervisor,
        ChainClients,
    },
    Error, ErrorKind, Result,
};
use async_std::task;
use std::sync::Arc;

/// Relay miner components wired together.
pub struct RelayMiner {
    ring_cache: Arc<RingCache>,
    meter: Arc<RelayMeter>,
    supervisor: Arc<RelayMiningSupervisor>,
    server: Arc<RelayServer>,
    running: bool,
}

impl RelayMiner {
    /// Build the relay miner.
    ///
    /// Every configured operator must have its key in the keyring, and the
    /// key must derive the operator address.
    pub fn new(
        config: RelayMinerConfig,
        clients: ChainClients,
        keyring: Arc<dyn Keyring>,
        backend: Arc<dyn Backend>,
        reward_sink: Sender<Relay>,
    ) -> Result<Self> {
        config.validate()?;
        for (operator, key_name) in config.suppliers.iter() {
            let address = keyring.public_key(key_name)?.to_account_id();
            if &address != operator {
                return Err(Error::new_ext(
                    ErrorKind::MalformedData,
                    format!(
                        "key '{}' belongs to {}, not to operator {}",
                        key_name, address, operator
                    ),
                ));
            }
        }

        let ring_cache = Arc::new(RingCache::new(
            clients.applications.clone(),
            clients.accounts.clone(),
            clients.events.clone(),
        ));
        let authenticator = Arc::new(RelayAuthenticator::new(
            &config,
            ring_cache.clone(),
            clients.blocks.clone(),
            clients.sessions.clone(),
            clients.shared.clone(),
            keyring,
        ));
        let meter = Arc::new(RelayMeter::new(
            clients.applications.clone(),
            clients.shared.clone(),
            clients.services.clone(),
            clients.events.clone(),
        )
        .with_over_servicing_allowance(OverServicingAllowance::from(
            config.over_servicing_allowance,
        )));
        let session_cache = Arc::new(SessionCache::new());
        let supervisor = Arc::new(RelayMiningSupervisor::new(
            &config.mining_supervisor,
            meter.clone(),
            authenticator.clone(),
            session_cache.clone(),
            clients.events,
            reward_sink,
        ));
        let server = Arc::new(RelayServer::new(
            config,
            authenticator,
            meter.clone(),
            session_cache,
            supervisor.clone(),
            backend,
        ));

        Ok(RelayMiner {
            ring_cache,
            meter,
            supervisor,
            server,
            running: false,
        })
    }

    /// Start the background components.
    pub fn start(&mut self) {
        debug!("Starting relay miner");
        if self.running {
            warn!("relay miner was already running");
            return;
        }
        self.ring_cache.start();
        self.meter.start();
        self.supervisor.start();
        self.running = true;
    }

    /// Stop the background components.
    /// Queued relays are drained before returning.
    pub fn stop(&mut self) {
        debug!("Stopping relay miner");
        if !self.running {
            debug!("relay miner was not running");
            return;
        }
        task::block_on(async {
            self.supervisor.stop().await;
            self.meter.stop().await;
            self.ring_cache.stop().await;
        });
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Get a shared reference to the relay server.
    pub fn server(&self) -> Arc<RelayServer> {
        self.server.clone()
    }

    pub fn supervisor(&self) -> Arc<RelayMiningSupervisor> {
        self.supervisor.clone()
    }
}
