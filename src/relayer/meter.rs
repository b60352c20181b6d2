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

//! Relay meter.
//!
//! Tracks, per session, how much of the application stake payable to this
//! supplier has been consumed by served relays. Every relay is charged
//! optimistically when metered and the charge is rolled back if the relay
//! turns out not to be rewardable.
//!
//! Meters are created on the first relay of a session and evicted in bulk
//! when the session claim window opens.

use crate::{
    base::{Application, Mutex, RelayRequestMetadata, RwLock, SessionHeader, SharedParams},
    channel::Receiver,
    client::{ApplicationQuerier, ChainEvent, Event, EventsClient, ServiceQuerier, SharedQuerier},
    Result,
};
use async_std::task::{self, JoinHandle};
use std::{collections::HashMap, sync::Arc};

const SUBSCRIBER_ID: &str = "relay-meter";

/// Stake share of one supplier for one session.
///
/// The per supplier share is further split across the sessions that may be
/// waiting for settlement at the same time, plus the current one.
pub fn payable_stake(stake: u64, params: &SharedParams) -> u64 {
    stake / params.num_suppliers_per_session.max(1) / (params.num_pending_sessions() + 1)
}

/// Tolerated service beyond the payable stake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverServicingAllowance {
    Limited(u64),
    Unlimited,
}

impl From<i64> for OverServicingAllowance {
    /// Negative amounts lift the limit.
    fn from(coins: i64) -> Self {
        match u64::try_from(coins) {
            Ok(coins) => OverServicingAllowance::Limited(coins),
            Err(_) => OverServicingAllowance::Unlimited,
        }
    }
}

struct SessionRelayMeter {
    app: Application,
    params: SharedParams,
    session_end_height: u64,
    relay_cost: u64,
    max_coin: u64,
    consumed_coin: u64,
    num_over_serviced: u64,
}

impl SessionRelayMeter {
    fn update_application(&mut self, app: Application) {
        self.max_coin = payable_stake(app.stake, &self.params);
        self.app = app;
    }
}

/// Point in time view of a session meter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeterSnapshot {
    pub max_coin: u64,
    pub consumed_coin: u64,
    pub num_over_serviced: u64,
}

type MeterMap = RwLock<HashMap<String, Arc<Mutex<SessionRelayMeter>>>>;

#[derive(Default)]
struct MeterStore {
    meters: MeterMap,
}

impl MeterStore {
    fn get(&self, session_id: &str) -> Option<Arc<Mutex<SessionRelayMeter>>> {
        self.meters.read().get(session_id).cloned()
    }

    fn on_new_block(&self, height: u64) -> usize {
        // Scan under the shared lock, most blocks evict nothing.
        let expired: Vec<String> = self
            .meters
            .read()
            .iter()
            .filter(|(_, meter)| {
                let meter = meter.lock();
                height >= meter.params.claim_window_open_height(meter.session_end_height)
            })
            .map(|(session_id, _)| session_id.clone())
            .collect();
        if expired.is_empty() {
            return 0;
        }

        let mut meters = self.meters.write();
        for session_id in expired.iter() {
            meters.remove(session_id);
        }
        debug!("[meter] height {}: evicted {} session meters", height, expired.len());
        expired.len()
    }

    fn on_application_staked(&self, app: &Application) {
        for meter in self.meters.read().values() {
            let mut meter = meter.lock();
            if meter.app.address == app.address {
                meter.update_application(app.clone());
                debug!(
                    "[meter] {} stake updated to {}, payable {}",
                    app.address, app.stake, meter.max_coin
                );
            }
        }
    }
}

pub struct RelayMeter {
    applications: Arc<dyn ApplicationQuerier>,
    shared: Arc<dyn SharedQuerier>,
    services: Arc<dyn ServiceQuerier>,
    events: Arc<dyn EventsClient>,
    store: Arc<MeterStore>,
    allowance: OverServicingAllowance,
    subscription: Mutex<Option<Receiver<ChainEvent>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RelayMeter {
    pub fn new(
        applications: Arc<dyn ApplicationQuerier>,
        shared: Arc<dyn SharedQuerier>,
        services: Arc<dyn ServiceQuerier>,
        events: Arc<dyn EventsClient>,
    ) -> Self {
        RelayMeter {
            applications,
            shared,
            services,
            events,
            store: Arc::new(MeterStore::default()),
            allowance: OverServicingAllowance::Limited(0),
            subscription: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    pub fn with_over_servicing_allowance(mut self, allowance: OverServicingAllowance) -> Self {
        self.allowance = allowance;
        self
    }

    /// Start following committed blocks and application stake changes.
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            warn!("[meter] already running");
            return;
        }
        let rx_chan = self
            .events
            .subscribe(SUBSCRIBER_ID, Event::BLOCK | Event::APPLICATION_STAKED);
        *self.subscription.lock() = Some(rx_chan.clone());
        let store = self.store.clone();
        *handle = Some(task::spawn(async move {
            while let Ok(event) = rx_chan.recv().await {
                match event {
                    ChainEvent::Block(block) => {
                        store.on_new_block(block.height);
                    }
                    ChainEvent::ApplicationStaked(app) => store.on_application_staked(&app),
                    _ => (),
                }
            }
            debug!("[meter] event loop exited");
        }));
    }

    pub async fn stop(&self) {
        if let Some(rx_chan) = self.subscription.lock().take() {
            rx_chan.close();
        }
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle.await;
        }
    }

    async fn create_meter(&self, header: &SessionHeader) -> Result<SessionRelayMeter> {
        let app = self
            .applications
            .get_application(&header.application_address)
            .await?;
        let params = self.shared.get_params().await?;
        let service = self.services.get_service(&header.service_id).await?;
        let relay_cost = service
            .compute_units_per_relay
            .saturating_mul(params.compute_units_to_tokens_multiplier);
        let max_coin = payable_stake(app.stake, &params);
        debug!(
            "[meter] session {}: payable {}, relay cost {}",
            header.session_id, max_coin, relay_cost
        );
        Ok(SessionRelayMeter {
            app,
            params,
            session_end_height: header.session_end_block_height,
            relay_cost,
            max_coin,
            consumed_coin: 0,
            num_over_serviced: 0,
        })
    }

    async fn get_or_create(&self, header: &SessionHeader) -> Result<Arc<Mutex<SessionRelayMeter>>> {
        if let Some(meter) = self.store.get(&header.session_id) {
            return Ok(meter);
        }
        // Queries run without holding the map lock, first insert wins.
        let meter = self.create_meter(header).await?;
        let mut meters = self.store.meters.write();
        let meter = meters
            .entry(header.session_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(meter)));
        Ok(meter.clone())
    }

    /// Charge one relay to its session and tell if the session is now
    /// over-serviced past the configured allowance.
    ///
    /// The charge is recorded even when over-servicing, so this must run
    /// exactly once per relay. If the meter cannot be resolved the relay is
    /// let through uncharged.
    pub async fn is_over_servicing(&self, meta: &RelayRequestMetadata) -> bool {
        let header = match meta.header() {
            Ok(header) => header,
            Err(err) => {
                warn!("[meter] {}, serving without rate limiting", err.to_string_full());
                return false;
            }
        };
        let meter = match self.get_or_create(header).await {
            Ok(meter) => meter,
            Err(err) => {
                warn!(
                    "[meter] session {}: {}, serving without rate limiting",
                    header.session_id,
                    err.to_string_full()
                );
                return false;
            }
        };

        let mut meter = meter.lock();
        meter.consumed_coin = meter.consumed_coin.saturating_add(meter.relay_cost);
        if meter.consumed_coin <= meter.max_coin {
            return false;
        }
        meter.num_over_serviced += 1;
        let rate_limited = match self.allowance {
            OverServicingAllowance::Unlimited => false,
            OverServicingAllowance::Limited(coins) => {
                meter.consumed_coin > meter.max_coin.saturating_add(coins)
            }
        };
        if meter.num_over_serviced.is_power_of_two() {
            warn!(
                "[meter] session {} of {} over-serviced {} times (consumed {} of {}, {})",
                header.session_id,
                meter.app.address,
                meter.num_over_serviced,
                meter.consumed_coin,
                meter.max_coin,
                if rate_limited { "rate limited" } else { "within allowance" }
            );
        }
        rate_limited
    }

    /// Roll back the charge of one relay.
    pub fn set_non_applicable_relay_reward(&self, meta: &RelayRequestMetadata) {
        let session_id = match meta.header() {
            Ok(header) => header.session_id.as_str(),
            Err(_) => {
                warn!("[meter] rollback of a relay without session header");
                return;
            }
        };
        let meter = match self.store.get(session_id) {
            Some(meter) => meter,
            None => {
                warn!("[meter] rollback for unknown session {}", session_id);
                return;
            }
        };
        let mut meter = meter.lock();
        if meter.consumed_coin < meter.relay_cost {
            warn!(
                "[meter] rollback for session {} exceeds consumed amount {}",
                session_id, meter.consumed_coin
            );
            return;
        }
        meter.consumed_coin -= meter.relay_cost;
    }

    /// Evict the meters of sessions whose claim window is open at `height`.
    /// Returns the number of evicted meters.
    pub fn on_new_block(&self, height: u64) -> usize {
        self.store.on_new_block(height)
    }

    /// Apply a stake change to every live meter of the application.
    pub fn on_application_staked(&self, app: &Application) {
        self.store.on_application_staked(app)
    }

    pub fn snapshot(&self, session_id: &str) -> Option<MeterSnapshot> {
        self.store.get(session_id).map(|meter| {
            let meter = meter.lock();
            MeterSnapshot {
                max_coin: meter.max_coin,
                consumed_coin: meter.consumed_coin,
                num_over_serviced: meter.num_over_serviced,
            }
        })
    }

    pub fn len(&self) -> usize {
        self.store.meters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.meters.read().is_empty()
    }
}
