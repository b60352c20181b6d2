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

//! Interfaces toward the chain and the local keyring.
//!
//! The relayer never talks to the chain directly: queries, block height and
//! events come through these traits so that any chain client (and the tests
//! fakes) can be plugged in.

use crate::{
    base::{Application, Service, Session, SharedParams},
    channel::Receiver,
    crypto::PublicKey,
    Result,
};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

pub mod keyring;
pub mod pubsub;

pub use keyring::{Keyring, LocalKeyring};
pub use pubsub::{ChainEvent, Event, EventHub};

/// Committed blocks observer.
#[cfg_attr(test, automock)]
pub trait BlockClient: Send + Sync {
    /// Height of the last committed block.
    fn latest_height(&self) -> u64;
}

/// Chain events source.
#[cfg_attr(test, automock)]
pub trait EventsClient: Send + Sync {
    /// Subscribe to the given event kinds. The subscription ends when the
    /// returned receiver is dropped or closed.
    fn subscribe(&self, id: &str, events: Event) -> Receiver<ChainEvent>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait SessionQuerier: Send + Sync {
    /// Session of `app_address` for `service_id` containing block `height`.
    async fn get_session(&self, app_address: &str, service_id: &str, height: u64)
        -> Result<Session>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ApplicationQuerier: Send + Sync {
    async fn get_application(&self, address: &str) -> Result<Application>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait AccountQuerier: Send + Sync {
    /// Public key of an on-chain account.
    async fn get_public_key(&self, address: &str) -> Result<PublicKey>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait SharedQuerier: Send + Sync {
    async fn get_params(&self) -> Result<SharedParams>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ServiceQuerier: Send + Sync {
    async fn get_service(&self, service_id: &str) -> Result<Service>;
}
