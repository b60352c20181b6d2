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

//! Implementation of publish/subscriber protocol for chain events.
//!
//! Events are propagated using the channel that the subscriber has received
//! from `subscribe`.
//!
//! If the subscriber closes the receiving side of the channel then this is
//! interpreted as an implicit unsubscribe.

use super::EventsClient;
use crate::{
    base::{Application, Block, Mutex},
    channel::{self, Receiver, Sender, TrySendError},
};
use std::collections::HashMap;

bitflags::bitflags! {
    /// Chain event kinds.
    pub struct Event: u8 {
        /// New block has been committed.
        const BLOCK = 1 << 0;
        /// An application changed its gateway delegations.
        const REDELEGATION = 1 << 1;
        /// An application (up)staked.
        const APPLICATION_STAKED = 1 << 2;
    }
}

const EVENTS_NUM: usize = 3;

/// Events delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    Block(Block),
    Redelegation { app_address: String },
    ApplicationStaked(Application),
}

impl ChainEvent {
    /// Kind flag of this event.
    pub fn kind(&self) -> Event {
        match self {
            ChainEvent::Block(_) => Event::BLOCK,
            ChainEvent::Redelegation { .. } => Event::REDELEGATION,
            ChainEvent::ApplicationStaked(_) => Event::APPLICATION_STAKED,
        }
    }
}

/// Chain events subscribers.
/// Publishing never blocks: a subscriber whose queue is full misses the event.
pub struct EventHub {
    events_sub: Mutex<HashMap<Event, HashMap<String, Sender<ChainEvent>>>>,
}

impl Default for EventHub {
    fn default() -> Self {
        EventHub {
            events_sub: Mutex::new(HashMap::new()),
        }
    }
}

impl EventHub {
    pub fn new() -> Self {
        EventHub::default()
    }

    /// Check if the `event` kind has subscribers.
    pub fn has_subscribers(&self, event: Event) -> bool {
        match self.events_sub.lock().get(&event) {
            Some(subs) => !subs.is_empty(),
            None => false,
        }
    }

    /// Subscribe to chain events.
    /// The `events` parameter is a bitflag, thus it is not limited to one
    /// single event and multiple kinds can be OR-ed together.
    /// Re-subscribing with the same `id` replaces the previous channel.
    pub fn subscribe(&self, id: &str, events: Event) -> Receiver<ChainEvent> {
        let (tx_chan, rx_chan) = channel::simple_channel();
        let mut events_sub = self.events_sub.lock();
        for i in 0..EVENTS_NUM {
            if let Some(event) = Event::from_bits((1 << i) & events.bits()) {
                if event.is_empty() {
                    continue;
                }
                debug!("[sub] '{}' subscribed to '{:?}' event", id, event);
                events_sub
                    .entry(event)
                    .or_insert_with(HashMap::new)
                    .insert(id.to_owned(), tx_chan.clone());
            }
        }
        rx_chan
    }

    /// Unsubscribe from chain events.
    pub fn unsubscribe(&self, id: &str, events: Event) {
        let mut events_sub = self.events_sub.lock();
        for i in 0..EVENTS_NUM {
            if let Some(event) = Event::from_bits((1 << i) & events.bits()) {
                if event.is_empty() {
                    continue;
                }
                debug!("[sub] '{}' unsubscribed from '{:?}' event", id, event);
                if let Some(event_subs) = events_sub.get_mut(&event) {
                    event_subs.remove(id);
                    if event_subs.is_empty() {
                        events_sub.remove(&event);
                    }
                }
            }
        }
    }

    /// Publish a chain event to subscribers.
    pub fn publish(&self, msg: ChainEvent) {
        let event = msg.kind();
        let mut events_sub = self.events_sub.lock();
        if let Some(event_subs) = events_sub.get_mut(&event) {
            event_subs.retain(|id, chan| match chan.try_send(msg.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!("[sub] '{}' is lagging, '{:?}' event dropped", id, event);
                    true
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("[sub] '{}' closed its channel, unsubscribing", id);
                    false
                }
            });
            if event_subs.is_empty() {
                events_sub.remove(&event);
            }
        }
    }
}

impl EventsClient for EventHub {
    fn subscribe(&self, id: &str, events: Event) -> Receiver<ChainEvent> {
        EventHub::subscribe(self, id, events)
    }
}
