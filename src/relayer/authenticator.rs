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

//! Relay request verification and relay response signing.

use crate::{
    base::{RelayRequest, RelayResponse, SessionHeader},
    client::{BlockClient, Keyring, SessionQuerier, SharedQuerier},
    relayer::{config::RelayMinerConfig, ring_cache::RingCache},
    Error, ErrorKind, Result,
};
use std::{collections::HashMap, sync::Arc};

/// Blocks a client may be ahead of this node when addressing a new session.
const SESSION_START_TOLERANCE_BLOCKS: u64 = 1;

pub struct RelayAuthenticator {
    ring_cache: Arc<RingCache>,
    blocks: Arc<dyn BlockClient>,
    sessions: Arc<dyn SessionQuerier>,
    shared: Arc<dyn SharedQuerier>,
    keyring: Arc<dyn Keyring>,
    /// Operator address to keyring key name.
    suppliers: HashMap<String, String>,
    grace_period_extra_blocks: u64,
}

impl RelayAuthenticator {
    pub fn new(
        config: &RelayMinerConfig,
        ring_cache: Arc<RingCache>,
        blocks: Arc<dyn BlockClient>,
        sessions: Arc<dyn SessionQuerier>,
        shared: Arc<dyn SharedQuerier>,
        keyring: Arc<dyn Keyring>,
    ) -> Self {
        RelayAuthenticator {
            ring_cache,
            blocks,
            sessions,
            shared,
            keyring,
            suppliers: config.suppliers.clone(),
            grace_period_extra_blocks: config.grace_period_extra_blocks,
        }
    }

    /// True if this node holds the signing key of the operator.
    pub fn is_operator_served(&self, operator_address: &str) -> bool {
        self.suppliers.contains_key(operator_address)
    }

    /// Reject headers of sessions that cannot be live at the current height.
    ///
    /// The session must have started (one block of clock skew is allowed)
    /// and span at most one session length, so its end height stays within
    /// one session of the chain tip. Runs before any cache sees the header.
    pub async fn check_session_header_heights(&self, header: &SessionHeader) -> Result<()> {
        let current = self.blocks.latest_height();
        if current == 0 {
            return Ok(());
        }
        let start = header.session_start_block_height;
        if start > current.saturating_add(SESSION_START_TOLERANCE_BLOCKS) {
            return Err(Error::new_ext(
                ErrorKind::InvalidSession,
                format!("session starts at height {}, current height {}", start, current),
            ));
        }
        match self.shared.get_params().await {
            Ok(params) => {
                let span = header.session_end_block_height.saturating_sub(start);
                if span >= params.num_blocks_per_session.max(1) {
                    return Err(Error::new_ext(
                        ErrorKind::InvalidSession,
                        format!(
                            "session [{}, {}] longer than {} blocks",
                            start, header.session_end_block_height, params.num_blocks_per_session
                        ),
                    ));
                }
            }
            Err(err) => warn!(
                "[authenticator] session length not checked: {}",
                err.to_string_full()
            ),
        }
        Ok(())
    }

    /// Height used to look up the session of a relay.
    ///
    /// A running session is looked up at the current height. An ended session
    /// is looked up at its end height while in its grace period, afterwards
    /// it is expired.
    async fn target_session_height(&self, header: &SessionHeader) -> Result<u64> {
        let current = self.blocks.latest_height();
        let session_end = header.session_end_block_height;
        if current == 0 {
            return Ok(session_end);
        }
        if session_end >= current {
            return Ok(current);
        }

        let params = self.shared.get_params().await?;
        let grace_end = params
            .session_grace_period_end_height(session_end)
            .saturating_add(self.grace_period_extra_blocks);
        if current > grace_end {
            return Err(Error::new_ext(
                ErrorKind::InvalidSession,
                format!(
                    "session expired at height {} (grace period end {}, current height {})",
                    session_end, grace_end, current
                ),
            ));
        }
        Ok(session_end)
    }

    /// Check the request ring signature.
    pub async fn verify_relay_request_signature(&self, req: &RelayRequest) -> Result<()> {
        let header = req.meta.header()?;
        let height = self.target_session_height(header).await?;
        let ring = self
            .ring_cache
            .get_ring_for_address_at_height(&header.application_address, height)
            .await?;
        let hash = req.signable_bytes_hash()?;
        match ring.verify(hash.as_bytes(), &req.meta.signature) {
            true => Ok(()),
            false => Err(Error::new_ext(
                ErrorKind::InvalidSignature,
                format!(
                    "signature does not match any key of {} ring",
                    header.application_address
                ),
            )),
        }
    }

    /// Full request verification: signature, session identity and session
    /// membership of the addressed operator.
    pub async fn verify_relay_request(&self, req: &RelayRequest) -> Result<()> {
        self.verify_relay_request_signature(req).await?;

        let header = req.meta.header()?;
        let height = self.target_session_height(header).await?;
        let session = self
            .sessions
            .get_session(&header.application_address, &header.service_id, height)
            .await?;
        if session.session_id != header.session_id {
            return Err(Error::new_ext(
                ErrorKind::InvalidSession,
                format!(
                    "session id mismatch: expected {}, got {}",
                    session.session_id, header.session_id
                ),
            ));
        }

        let operator = req.meta.supplier_operator_address.as_str();
        if !self.is_operator_served(operator) {
            return Err(Error::new_ext(
                ErrorKind::InvalidSession,
                format!("operator {} not served by this node", operator),
            ));
        }
        if !session.has_supplier(operator) {
            return Err(Error::new_ext(
                ErrorKind::InvalidSession,
                format!("operator {} not in session {}", operator, session.session_id),
            ));
        }
        Ok(())
    }

    /// Fails once the claim window of the relay session has opened.
    pub async fn check_reward_eligibility(&self, req: &RelayRequest) -> Result<()> {
        let current = self.blocks.latest_height();
        if current == 0 {
            return Ok(());
        }
        let header = req.meta.header()?;
        let params = self.shared.get_params().await?;
        let claim_open = params.claim_window_open_height(header.session_end_block_height);
        if current >= claim_open {
            return Err(Error::new_ext(
                ErrorKind::InvalidSession,
                format!(
                    "claim window opened at height {}, current height {}",
                    claim_open, current
                ),
            ));
        }
        Ok(())
    }

    /// Sign a response with the key of the operator that served it.
    pub fn sign_relay_response(&self, res: &mut RelayResponse, operator_address: &str) -> Result<()> {
        let key_name = self.suppliers.get(operator_address).ok_or_else(|| {
            Error::new_ext(
                ErrorKind::SupplierUnreachable,
                format!("operator {} not served by this node", operator_address),
            )
        })?;
        let hash = res.signable_bytes_hash()?;
        res.meta.supplier_operator_signature = self.keyring.sign(key_name, hash.as_bytes())?;
        Ok(())
    }
}
