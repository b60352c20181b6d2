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

use crate::{
    crypto::{ecdsa, ed25519},
    Result,
};
use serde::{self, Deserialize, Serialize};

pub enum KeyPair {
    Ecdsa(ecdsa::KeyPair),
    Ed25519(ed25519::KeyPair),
}

impl KeyPair {
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            KeyPair::Ecdsa(keypair) => keypair.sign(data),
            KeyPair::Ed25519(keypair) => keypair.sign(data),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        match self {
            KeyPair::Ecdsa(keypair) => PublicKey::Ecdsa(keypair.public_key()),
            KeyPair::Ed25519(keypair) => PublicKey::Ed25519 {
                pb: keypair.public_key(),
            },
        }
    }
}

/// Account public key as published on-chain.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(tag = "type")]
pub enum PublicKey {
    #[serde(rename = "ecdsa")]
    Ecdsa(ecdsa::PublicKey),
    #[serde(rename = "ed25519")]
    Ed25519 { pb: ed25519::PublicKey },
}

impl PublicKey {
    pub fn verify(&self, data: &[u8], sig: &[u8]) -> bool {
        match self {
            PublicKey::Ecdsa(key) => key.verify(data, sig),
            PublicKey::Ed25519 { pb } => pb.verify(data, sig),
        }
    }

    pub fn to_account_id(&self) -> String {
        match self {
            PublicKey::Ecdsa(key) => key.to_account_id(),
            PublicKey::Ed25519 { pb } => pb.to_account_id(),
        }
    }
}

impl From<ed25519::PublicKey> for PublicKey {
    fn from(pb: ed25519::PublicKey) -> Self {
        PublicKey::Ed25519 { pb }
    }
}
