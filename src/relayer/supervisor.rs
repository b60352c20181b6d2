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

//! Relay mining supervisor.
//!
//! Served relays are published into a bounded queue drained by a pool of
//! workers. Each worker meters and verifies the relay and then either hands
//! it to the reward sink or rolls its charge back. Publishing never waits
//! longer than the configured enqueue timeout: when the queue is full the
//! relay is dropped from the reward pipeline, the client was served anyway.

use crate::{
    base::{Mutex, Relay},
    channel::{self, Receiver, Sender, TrySendError},
    client::{ChainEvent, Event, EventsClient},
    relayer::{
        authenticator::RelayAuthenticator,
        config::{DropPolicy, MiningSupervisorConfig},
        meter::RelayMeter,
        session_cache::SessionCache,
    },
};
use async_std::task::{self, JoinHandle};
use futures::FutureExt;
use std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

/// Pause before a panicked worker is respawned.
pub const WORKER_RESTART_BACKOFF: Duration = Duration::from_millis(50);

/// Polling step while waiting for room in the queue.
const ENQUEUE_POLL_INTERVAL: Duration = Duration::from_millis(5);

const SUBSCRIBER_ID: &str = "mining-supervisor";

/// Supervisor counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SupervisorStats {
    /// Relays accepted by `publish`.
    pub enqueued: u64,
    /// Relays lost by `publish`, either rejected or evicted from the queue.
    pub dropped: u64,
    /// Queued relays evicted to make room for newer ones. Also counted in
    /// `dropped`.
    pub evicted: u64,
    /// Relays handed to the reward sink.
    pub forwarded: u64,
    /// Relays whose charge has been rolled back.
    pub rolled_back: u64,
    pub worker_panics: u64,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    evicted: AtomicU64,
    forwarded: AtomicU64,
    rolled_back: AtomicU64,
    worker_panics: AtomicU64,
}

/// Rate limited reporting of dropped relays.
struct DropLogger {
    interval: Duration,
    last: Mutex<Option<Instant>>,
    suppressed: AtomicU64,
}

impl DropLogger {
    fn new(interval: Duration) -> Self {
        DropLogger {
            interval,
            last: Mutex::new(None),
            suppressed: AtomicU64::new(0),
        }
    }

    fn record(&self, reason: &str) {
        self.suppressed.fetch_add(1, Ordering::Relaxed);
        let mut last = self.last.lock();
        let due = match *last {
            Some(instant) => instant.elapsed() >= self.interval,
            None => true,
        };
        if due {
            let count = self.suppressed.swap(0, Ordering::Relaxed);
            warn!("[supervisor] {}: {} relays dropped", reason, count);
            *last = Some(Instant::now());
        }
    }
}

struct SupervisorInner {
    tx_queue: Sender<Relay>,
    rx_queue: Receiver<Relay>,
    reward_sink: Sender<Relay>,
    meter: Arc<RelayMeter>,
    authenticator: Arc<RelayAuthenticator>,
    session_cache: Arc<SessionCache>,
    drop_policy: DropPolicy,
    enqueue_timeout: Duration,
    stopped: AtomicBool,
    downstream_closed: AtomicBool,
    counters: Counters,
    drop_logger: DropLogger,
}

impl SupervisorInner {
    fn rollback(&self, relay: &Relay) {
        self.meter.set_non_applicable_relay_reward(&relay.req.meta);
        self.counters.rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    fn mark_non_rewardable(&self, relay: &Relay) {
        if let Some(header) = relay.req.meta.session_header.as_ref() {
            self.session_cache
                .mark_non_rewardable(&header.session_id, header.session_end_block_height);
        }
    }

    /// Hand a relay to the reward sink.
    ///
    /// The relay is sent only if its session is still rewardable. Otherwise,
    /// or if the sink refuses it, the session is latched and the charge is
    /// rolled back.
    fn forward(&self, relay: Relay) -> bool {
        let rewardable = match relay.req.meta.session_header.as_ref() {
            Some(header) => self
                .session_cache
                .get_or_insert(&header.session_id, header.session_end_block_height)
                .is_rewardable(),
            None => false,
        };
        if !rewardable {
            self.rollback(&relay);
            return false;
        }
        if self.downstream_closed.load(Ordering::Acquire) {
            self.mark_non_rewardable(&relay);
            self.rollback(&relay);
            return false;
        }

        match self.reward_sink.try_send(relay) {
            Ok(()) => {
                self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(err) => {
                let reason = match err {
                    TrySendError::Full(_) => "reward sink full",
                    TrySendError::Closed(_) => {
                        if !self.downstream_closed.swap(true, Ordering::AcqRel) {
                            error!("[supervisor] reward sink closed");
                        }
                        "reward sink closed"
                    }
                };
                let relay = err.into_inner();
                self.mark_non_rewardable(&relay);
                self.rollback(&relay);
                self.drop_logger.record(reason);
                false
            }
        }
    }

    /// Delayed checks of a lazily served relay.
    async fn process(&self, relay: Relay) {
        let header = match relay.req.meta.header() {
            Ok(header) => header.clone(),
            Err(err) => {
                warn!("[supervisor] discarding relay: {}", err.to_string_full());
                return;
            }
        };
        let entry = self
            .session_cache
            .get_or_insert(&header.session_id, header.session_end_block_height);

        // Charges the relay, must run exactly once. Relays within the
        // over-servicing allowance are not reported.
        let over_servicing = self.meter.is_over_servicing(&relay.req.meta).await;
        let verified = self.authenticator.verify_relay_request(&relay.req).await;

        if over_servicing && entry.mark_non_rewardable() {
            info!("[supervisor] session {} over-serviced", header.session_id);
        }
        if let Err(err) = &verified {
            match err.kind.is_session_fatal() {
                true => {
                    if entry.mark_non_rewardable() {
                        info!(
                            "[supervisor] session {} not rewardable: {}",
                            header.session_id,
                            err.to_string_full()
                        );
                    }
                }
                false => warn!(
                    "[supervisor] relay of session {} not verified: {}",
                    header.session_id,
                    err.to_string_full()
                ),
            }
        }

        if over_servicing || verified.is_err() {
            self.rollback(&relay);
            return;
        }
        self.forward(relay);
    }

    async fn worker_loop(&self, id: usize) {
        while let Ok(relay) = self.rx_queue.recv().await {
            self.process(relay).await;
        }
        debug!("[supervisor] worker {} exited", id);
    }
}

async fn run_worker(inner: Arc<SupervisorInner>, id: usize) {
    loop {
        match AssertUnwindSafe(inner.worker_loop(id)).catch_unwind().await {
            Ok(()) => break,
            Err(_) => {
                error!("[supervisor] worker {} panicked", id);
                inner.counters.worker_panics.fetch_add(1, Ordering::Relaxed);
                if inner.stopped.load(Ordering::Acquire) {
                    break;
                }
                task::sleep(WORKER_RESTART_BACKOFF).await;
                info!("[supervisor] worker {} restarted", id);
            }
        }
    }
}

async fn run_pruner(inner: Arc<SupervisorInner>, rx_chan: Receiver<ChainEvent>) {
    while let Ok(event) = rx_chan.recv().await {
        if let ChainEvent::Block(block) = event {
            let removed = inner.session_cache.prune(block.height);
            if removed > 0 {
                debug!("[supervisor] height {}: pruned {} sessions", block.height, removed);
            }
        }
    }
}

pub struct RelayMiningSupervisor {
    inner: Arc<SupervisorInner>,
    workers: usize,
    events: Arc<dyn EventsClient>,
    subscription: Mutex<Option<Receiver<ChainEvent>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayMiningSupervisor {
    pub fn new(
        config: &MiningSupervisorConfig,
        meter: Arc<RelayMeter>,
        authenticator: Arc<RelayAuthenticator>,
        session_cache: Arc<SessionCache>,
        events: Arc<dyn EventsClient>,
        reward_sink: Sender<Relay>,
    ) -> Self {
        let (tx_queue, rx_queue) = channel::bounded_channel(config.queue_size);
        let inner = SupervisorInner {
            tx_queue,
            rx_queue,
            reward_sink,
            meter,
            authenticator,
            session_cache,
            drop_policy: config.drop_policy,
            enqueue_timeout: config.enqueue_timeout(),
            stopped: AtomicBool::new(false),
            downstream_closed: AtomicBool::new(false),
            counters: Counters::default(),
            drop_logger: DropLogger::new(config.drop_log_interval()),
        };
        RelayMiningSupervisor {
            inner: Arc::new(inner),
            workers: config.workers.max(1),
            events,
            subscription: Mutex::new(None),
            handles: Mutex::new(vec![]),
        }
    }

    /// Spawn the workers and the session pruner.
    pub fn start(&self) {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            warn!("[supervisor] already running");
            return;
        }
        if self.inner.stopped.load(Ordering::Acquire) {
            warn!("[supervisor] cannot restart a stopped supervisor");
            return;
        }
        for id in 0..self.workers {
            handles.push(task::spawn(run_worker(self.inner.clone(), id)));
        }
        let rx_chan = self.events.subscribe(SUBSCRIBER_ID, Event::BLOCK);
        *self.subscription.lock() = Some(rx_chan.clone());
        handles.push(task::spawn(run_pruner(self.inner.clone(), rx_chan)));
        info!("[supervisor] started {} workers", self.workers);
    }

    /// Stop accepting relays, let the workers drain the queue and wait for
    /// them to exit.
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        self.inner.tx_queue.close();
        if let Some(rx_chan) = self.subscription.lock().take() {
            rx_chan.close();
        }
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            handle.await;
        }
        info!("[supervisor] stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.handles.lock().is_empty()
    }

    /// Queue a served relay for delayed metering and verification.
    ///
    /// Returns true if the relay has been queued. Never waits longer than
    /// the configured enqueue timeout and gives up as soon as the supervisor
    /// is stopped.
    pub async fn publish(&self, relay: Relay) -> bool {
        let inner = &self.inner;
        if inner.stopped.load(Ordering::Acquire) || inner.downstream_closed.load(Ordering::Acquire)
        {
            self.reject("supervisor not accepting relays");
            return false;
        }

        let mut relay = match inner.tx_queue.try_send(relay) {
            Ok(()) => return self.accepted(),
            Err(TrySendError::Closed(_)) => {
                self.reject("queue closed");
                return false;
            }
            Err(TrySendError::Full(relay)) => relay,
        };

        if !inner.enqueue_timeout.is_zero() {
            let deadline = Instant::now() + inner.enqueue_timeout;
            while Instant::now() < deadline {
                if inner.stopped.load(Ordering::Acquire) {
                    self.reject("supervisor stopped");
                    return false;
                }
                task::sleep(ENQUEUE_POLL_INTERVAL).await;
                relay = match inner.tx_queue.try_send(relay) {
                    Ok(()) => return self.accepted(),
                    Err(TrySendError::Closed(_)) => {
                        self.reject("queue closed");
                        return false;
                    }
                    Err(TrySendError::Full(relay)) => relay,
                };
            }
        }

        if inner.drop_policy == DropPolicy::DropOldest {
            if inner.rx_queue.try_recv().is_ok() {
                inner.counters.evicted.fetch_add(1, Ordering::Relaxed);
                inner.counters.dropped.fetch_add(1, Ordering::Relaxed);
                inner.drop_logger.record("queue full, oldest relay evicted");
            }
            if inner.tx_queue.try_send(relay).is_ok() {
                return self.accepted();
            }
        }
        self.reject("queue full");
        false
    }

    fn accepted(&self) -> bool {
        self.inner.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn reject(&self, reason: &str) {
        self.inner.counters.dropped.fetch_add(1, Ordering::Relaxed);
        self.inner.drop_logger.record(reason);
    }

    /// Hand an already verified relay straight to the reward sink.
    pub fn forward(&self, relay: Relay) -> bool {
        self.inner.forward(relay)
    }

    pub fn enqueue_timeout(&self) -> Duration {
        self.inner.enqueue_timeout
    }

    pub fn queue_len(&self) -> usize {
        self.inner.tx_queue.len()
    }

    pub fn stats(&self) -> SupervisorStats {
        let counters = &self.inner.counters;
        SupervisorStats {
            enqueued: counters.enqueued.load(Ordering::Relaxed),
            dropped: counters.dropped.load(Ordering::Relaxed),
            evicted: counters.evicted.load(Ordering::Relaxed),
            forwarded: counters.forwarded.load(Ordering::Relaxed),
            rolled_back: counters.rolled_back.load(Ordering::Relaxed),
            worker_panics: counters.worker_panics.load(Ordering::Relaxed),
        }
    }
}
