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

//! Cache of application verification rings.
//!
//! Rings are keyed by application address and block height. A redelegation
//! event drops every ring of the application so that the next lookup rebuilds
//! it from the current on-chain delegations.

use crate::{
    base::{Mutex, RwLock},
    channel::Receiver,
    client::{AccountQuerier, ApplicationQuerier, ChainEvent, Event, EventsClient},
    crypto::Ring,
    Result,
};
use async_std::task::{self, JoinHandle};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

const SUBSCRIBER_ID: &str = "ring-cache";

#[derive(Default)]
struct RingStore {
    rings: RwLock<HashMap<String, HashMap<u64, Ring>>>,
    /// Bumped by every invalidation, under the rings write lock.
    generation: AtomicU64,
}

impl RingStore {
    fn get(&self, address: &str, height: u64) -> Option<Ring> {
        self.rings
            .read()
            .get(address)
            .and_then(|by_height| by_height.get(&height))
            .cloned()
    }

    /// Store a ring built while `generation` was current.
    /// Dropped if an invalidation happened in the meantime.
    fn insert(&self, address: &str, height: u64, ring: Ring, generation: u64) {
        let mut rings = self.rings.write();
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!("[ring-cache] discarding ring of {} built before invalidation", address);
            return;
        }
        rings
            .entry(address.to_owned())
            .or_insert_with(HashMap::new)
            .insert(height, ring);
    }

    fn invalidate(&self, address: &str) {
        let mut rings = self.rings.write();
        self.generation.fetch_add(1, Ordering::SeqCst);
        if rings.remove(address).is_some() {
            debug!("[ring-cache] rings of {} invalidated", address);
        }
    }

    fn clear(&self) {
        let mut rings = self.rings.write();
        self.generation.fetch_add(1, Ordering::SeqCst);
        rings.clear();
    }
}

pub struct RingCache {
    applications: Arc<dyn ApplicationQuerier>,
    accounts: Arc<dyn AccountQuerier>,
    events: Arc<dyn EventsClient>,
    store: Arc<RingStore>,
    subscription: Mutex<Option<Receiver<ChainEvent>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RingCache {
    pub fn new(
        applications: Arc<dyn ApplicationQuerier>,
        accounts: Arc<dyn AccountQuerier>,
        events: Arc<dyn EventsClient>,
    ) -> Self {
        RingCache {
            applications,
            accounts,
            events,
            store: Arc::new(RingStore::default()),
            subscription: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    /// Start listening for redelegation events.
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            warn!("[ring-cache] already running");
            return;
        }
        let rx_chan = self.events.subscribe(SUBSCRIBER_ID, Event::REDELEGATION);
        *self.subscription.lock() = Some(rx_chan.clone());
        let store = self.store.clone();
        *handle = Some(task::spawn(async move {
            while let Ok(event) = rx_chan.recv().await {
                if let ChainEvent::Redelegation { app_address } = event {
                    store.invalidate(&app_address);
                }
            }
            debug!("[ring-cache] event loop exited");
        }));
    }

    /// Stop the event listener and drop every cached ring.
    pub async fn stop(&self) {
        if let Some(rx_chan) = self.subscription.lock().take() {
            rx_chan.close();
        }
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle.await;
        }
        self.store.clear();
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().is_some()
    }

    /// Ring of the application at `height`, built from chain state on miss.
    ///
    /// The ring is the application key followed by the delegated gateways
    /// keys. Without delegations the application key is used twice. Any
    /// public key fetch failure fails the whole ring.
    pub async fn get_ring_for_address_at_height(&self, address: &str, height: u64) -> Result<Ring> {
        if let Some(ring) = self.store.get(address, height) {
            return Ok(ring);
        }

        let generation = self.store.generation.load(Ordering::SeqCst);
        let application = self.applications.get_application(address).await?;
        let mut members = vec![application.address.clone()];
        match application.delegatee_gateway_addresses.is_empty() {
            true => members.push(application.address.clone()),
            false => members.extend(application.delegatee_gateway_addresses.iter().cloned()),
        }

        let mut keys = Vec::with_capacity(members.len());
        for member in members.iter() {
            keys.push(self.accounts.get_public_key(member).await?);
        }
        let ring = Ring::new(keys)?;

        self.store.insert(address, height, ring.clone(), generation);
        Ok(ring)
    }

    /// Drop every ring of an application.
    pub fn invalidate(&self, address: &str) {
        self.store.invalidate(address);
    }

    /// Applications with at least one cached ring.
    pub fn cached_addresses(&self) -> Vec<String> {
        self.store.rings.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        client::{tests::FakeChain, MockAccountQuerier},
        crypto::{ecdsa::tests::ecdsa_secp384_test_public_key, PublicKey},
        Error, ErrorKind,
    };
    use std::time::{Duration, Instant};

    fn create_ring_cache(chain: &Arc<FakeChain>) -> RingCache {
        RingCache::new(chain.clone(), chain.clone(), chain.clone())
    }

    fn wait_until<F: Fn() -> bool>(cond: F) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn ring_without_delegations_has_two_app_keys() {
        let chain = Arc::new(FakeChain::new(1));
        let app = chain.add_application(1000);
        let cache = create_ring_cache(&chain);

        let ring = task::block_on(cache.get_ring_for_address_at_height(&app.address, 1)).unwrap();

        assert_eq!(ring.len(), 2);
        assert_eq!(ring.members()[0], app.keypair.public_key());
        assert_eq!(ring.members()[1], app.keypair.public_key());
    }

    #[test]
    fn ring_with_delegations() {
        let chain = Arc::new(FakeChain::new(1));
        let app = chain.add_application(1000);
        let gw1 = chain.add_gateway();
        let gw2 = chain.add_gateway();
        chain.delegate(&app.address, &gw1.address);
        chain.delegate(&app.address, &gw2.address);
        let cache = create_ring_cache(&chain);

        let ring = task::block_on(cache.get_ring_for_address_at_height(&app.address, 1)).unwrap();

        assert_eq!(ring.len(), 3);
        assert_eq!(ring.members()[2], gw2.keypair.public_key());
    }

    #[test]
    fn ring_is_cached_per_height() {
        let chain = Arc::new(FakeChain::new(1));
        let app = chain.add_application(1000);
        let cache = create_ring_cache(&chain);

        task::block_on(cache.get_ring_for_address_at_height(&app.address, 1)).unwrap();
        task::block_on(cache.get_ring_for_address_at_height(&app.address, 1)).unwrap();
        task::block_on(cache.get_ring_for_address_at_height(&app.address, 2)).unwrap();

        assert_eq!(chain.app_queries.load(Ordering::SeqCst), 2);
        assert_eq!(cache.cached_addresses(), vec![app.address.clone()]);
    }

    #[test]
    fn unknown_member_key_fails_whole_ring() {
        let chain = Arc::new(FakeChain::new(1));
        let app = chain.add_application(1000);
        chain.delegate(&app.address, "pokt1ghost");
        let cache = create_ring_cache(&chain);

        let err = task::block_on(cache.get_ring_for_address_at_height(&app.address, 1)).unwrap_err();

        assert_eq!(err.kind, ErrorKind::ResourceNotFound);
        assert!(cache.cached_addresses().is_empty());
    }

    #[test]
    fn non_ed25519_member_is_wrong_curve() {
        let chain = Arc::new(FakeChain::new(1));
        let app = chain.add_application(1000);
        let mut accounts = MockAccountQuerier::new();
        let app_address = app.address.clone();
        let app_key = app.public_key();
        accounts
            .expect_get_public_key()
            .returning(move |address| match address == app_address {
                true => Ok(app_key.clone()),
                false => Ok(PublicKey::Ecdsa(ecdsa_secp384_test_public_key())),
            });
        chain.delegate(&app.address, "pokt1ecdsa-gateway");
        let cache = RingCache::new(chain.clone(), Arc::new(accounts), chain.clone());

        let err = task::block_on(cache.get_ring_for_address_at_height(&app.address, 1)).unwrap_err();

        assert_eq!(err.kind, ErrorKind::WrongCurve);
    }

    #[test]
    fn account_query_failure_propagates() {
        let chain = Arc::new(FakeChain::new(1));
        let app = chain.add_application(1000);
        let mut accounts = MockAccountQuerier::new();
        accounts
            .expect_get_public_key()
            .returning(|_| Err(Error::new_ext(ErrorKind::Internal, "node down")));
        let cache = RingCache::new(chain.clone(), Arc::new(accounts), chain.clone());

        let err = task::block_on(cache.get_ring_for_address_at_height(&app.address, 1)).unwrap_err();

        assert_eq!(err.kind, ErrorKind::Internal);
    }

    #[test]
    fn redelegation_event_invalidates_rings() {
        let chain = Arc::new(FakeChain::new(1));
        let app = chain.add_application(1000);
        let gateway = chain.add_gateway();
        let cache = create_ring_cache(&chain);
        cache.start();
        let stale = task::block_on(cache.get_ring_for_address_at_height(&app.address, 1)).unwrap();
        chain.delegate(&app.address, &gateway.address);
        let req = chain.signed_request(&app.address, &gateway, "pokt1supplier", 1);
        let hash = req.signable_bytes_hash().unwrap();
        let still_stale =
            task::block_on(cache.get_ring_for_address_at_height(&app.address, 1)).unwrap();

        chain.hub.publish(ChainEvent::Redelegation {
            app_address: app.address.clone(),
        });
        wait_until(|| cache.cached_addresses().is_empty());
        let fresh = task::block_on(cache.get_ring_for_address_at_height(&app.address, 1)).unwrap();

        assert!(!stale.verify(hash.as_bytes(), &req.meta.signature));
        assert!(!still_stale.verify(hash.as_bytes(), &req.meta.signature));
        assert!(fresh.verify(hash.as_bytes(), &req.meta.signature));
        task::block_on(cache.stop());
        assert!(!cache.is_running());
    }

    #[test]
    fn stop_clears_cache() {
        let chain = Arc::new(FakeChain::new(1));
        let app = chain.add_application(1000);
        let cache = create_ring_cache(&chain);
        cache.start();
        task::block_on(cache.get_ring_for_address_at_height(&app.address, 1)).unwrap();

        task::block_on(cache.stop());

        assert!(cache.cached_addresses().is_empty());
    }
}
