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

//! Relay wire messages and the on-chain records the relayer reads.

use crate::{
    base::serialize::rmp_serialize,
    crypto::Hash,
    Error, ErrorKind, Result,
};

/// Identifies the session a relay belongs to.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default)]
pub struct SessionHeader {
    /// Address of the application paying for the relays.
    pub application_address: String,
    /// Service being relayed.
    pub service_id: String,
    /// Opaque session identifier.
    pub session_id: String,
    /// First block of the session.
    pub session_start_block_height: u64,
    /// Last block of the session.
    pub session_end_block_height: u64,
}

impl SessionHeader {
    pub fn validate_basic(&self) -> Result<()> {
        if self.application_address.is_empty() {
            return Err(Error::new_ext(
                ErrorKind::MalformedData,
                "empty application address",
            ));
        }
        if self.service_id.is_empty() {
            return Err(Error::new_ext(ErrorKind::MalformedData, "empty service id"));
        }
        if self.session_id.is_empty() {
            return Err(Error::new_ext(ErrorKind::MalformedData, "empty session id"));
        }
        if self.session_start_block_height > self.session_end_block_height {
            return Err(Error::new_ext(
                ErrorKind::MalformedData,
                "session starts after its end",
            ));
        }
        Ok(())
    }
}

/// Relay request metadata.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default)]
pub struct RelayRequestMetadata {
    pub session_header: Option<SessionHeader>,
    /// Ring signature over the request signable bytes.
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
    /// Operator address of the supplier the client wants to reach.
    pub supplier_operator_address: String,
}

impl RelayRequestMetadata {
    /// Session header or `MalformedData` if missing.
    pub fn header(&self) -> Result<&SessionHeader> {
        self.session_header
            .as_ref()
            .ok_or_else(|| Error::new_ext(ErrorKind::MalformedData, "missing session header"))
    }
}

/// Signed client request.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default)]
pub struct RelayRequest {
    pub meta: RelayRequestMetadata,
    /// Opaque serialized service request.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl RelayRequest {
    /// Stateless checks, no chain access.
    pub fn validate_basic(&self) -> Result<()> {
        self.meta.header()?.validate_basic()?;
        if self.meta.signature.is_empty() {
            return Err(Error::new_ext(ErrorKind::MalformedData, "missing signature"));
        }
        if self.meta.supplier_operator_address.is_empty() {
            return Err(Error::new_ext(
                ErrorKind::MalformedData,
                "missing supplier operator address",
            ));
        }
        Ok(())
    }

    /// Hash of the request with the signature field cleared.
    pub fn signable_bytes_hash(&self) -> Result<Hash> {
        let mut unsigned = self.clone();
        unsigned.meta.signature = vec![];
        let buf = rmp_serialize(&unsigned)?;
        Ok(Hash::from_data(&buf))
    }

    /// Session identifier, empty if the header is missing.
    pub fn session_id(&self) -> &str {
        self.meta
            .session_header
            .as_ref()
            .map(|h| h.session_id.as_str())
            .unwrap_or_default()
    }
}

/// Error carried back to the client inside a response.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct RelayError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for RelayError {
    fn from(err: &Error) -> Self {
        RelayError {
            kind: err.kind,
            message: err.to_client_string(),
        }
    }
}

/// Relay response metadata.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default)]
pub struct RelayResponseMetadata {
    pub session_header: Option<SessionHeader>,
    /// Supplier operator signature over the response signable bytes.
    #[serde(with = "serde_bytes")]
    pub supplier_operator_signature: Vec<u8>,
}

/// Supplier response.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default)]
pub struct RelayResponse {
    pub meta: RelayResponseMetadata,
    /// Opaque serialized service response.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    /// Hash of `payload`.
    pub payload_hash: Hash,
    /// Backend status passthrough (zero when no backend was contacted).
    pub status_code: u16,
    pub error: Option<RelayError>,
}

impl RelayResponse {
    /// Build a successful response for the given session.
    pub fn new(session_header: SessionHeader, payload: Vec<u8>, status_code: u16) -> Self {
        let payload_hash = Hash::from_data(&payload);
        RelayResponse {
            meta: RelayResponseMetadata {
                session_header: Some(session_header),
                supplier_operator_signature: vec![],
            },
            payload,
            payload_hash,
            status_code,
            error: None,
        }
    }

    /// Build an error response, the session header is echoed when known.
    pub fn from_error(session_header: Option<SessionHeader>, err: &Error) -> Self {
        RelayResponse {
            meta: RelayResponseMetadata {
                session_header,
                supplier_operator_signature: vec![],
            },
            error: Some(err.into()),
            ..Default::default()
        }
    }

    /// Hash of the response with the signature field cleared.
    pub fn signable_bytes_hash(&self) -> Result<Hash> {
        let mut unsigned = self.clone();
        unsigned.meta.supplier_operator_signature = vec![];
        let buf = rmp_serialize(&unsigned)?;
        Ok(Hash::from_data(&buf))
    }

    pub fn is_server_error(&self) -> bool {
        self.status_code >= 500
    }
}

/// A served request paired with its signed response.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct Relay {
    pub req: RelayRequest,
    pub res: RelayResponse,
}

/// Supplier taking part in a session.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default)]
pub struct Supplier {
    pub operator_address: String,
    pub owner_address: String,
}

/// On-chain session.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default)]
pub struct Session {
    pub header: SessionHeader,
    pub session_id: String,
    pub session_number: u64,
    pub suppliers: Vec<Supplier>,
}

impl Session {
    pub fn has_supplier(&self, operator_address: &str) -> bool {
        self.suppliers
            .iter()
            .any(|s| s.operator_address == operator_address)
    }
}

/// On-chain application.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default)]
pub struct Application {
    pub address: String,
    /// Staked amount (uPOKT).
    pub stake: u64,
    pub service_ids: Vec<String>,
    /// Gateways the application delegated signing to.
    pub delegatee_gateway_addresses: Vec<String>,
}

/// On-chain service.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub compute_units_per_relay: u64,
    pub owner_address: String,
}

/// Network wide timing and pricing parameters.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct SharedParams {
    pub num_blocks_per_session: u64,
    pub grace_period_end_offset_blocks: u64,
    pub claim_window_open_offset_blocks: u64,
    pub claim_window_close_offset_blocks: u64,
    pub proof_window_open_offset_blocks: u64,
    pub proof_window_close_offset_blocks: u64,
    /// Cost of a compute unit.
    pub compute_units_to_tokens_multiplier: u64,
    pub num_suppliers_per_session: u64,
}

impl Default for SharedParams {
    fn default() -> Self {
        SharedParams {
            num_blocks_per_session: 4,
            grace_period_end_offset_blocks: 1,
            claim_window_open_offset_blocks: 2,
            claim_window_close_offset_blocks: 4,
            proof_window_open_offset_blocks: 0,
            proof_window_close_offset_blocks: 4,
            compute_units_to_tokens_multiplier: 42,
            num_suppliers_per_session: 15,
        }
    }
}

impl SharedParams {
    // Session heights come from client headers, all height arithmetic saturates.

    /// Last height at which relays of a session ending at `session_end` are
    /// still accepted.
    pub fn session_grace_period_end_height(&self, session_end: u64) -> u64 {
        session_end.saturating_add(self.grace_period_end_offset_blocks)
    }

    /// The extra block leaves room for relays served at the session last block.
    pub fn claim_window_open_height(&self, session_end: u64) -> u64 {
        session_end
            .saturating_add(self.claim_window_open_offset_blocks)
            .saturating_add(1)
    }

    pub fn session_end_to_proof_window_close_blocks(&self) -> u64 {
        self.claim_window_open_offset_blocks
            .saturating_add(self.claim_window_close_offset_blocks)
            .saturating_add(self.proof_window_open_offset_blocks)
            .saturating_add(self.proof_window_close_offset_blocks)
    }

    /// Sessions that may be unsettled at the same time, rounded up.
    pub fn num_pending_sessions(&self) -> u64 {
        let per_session = self.num_blocks_per_session.max(1);
        let blocks = self.session_end_to_proof_window_close_blocks();
        blocks / per_session + u64::from(blocks % per_session != 0)
    }
}

/// Committed block notification.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default)]
pub struct Block {
    pub height: u64,
    pub hash: Hash,
}
