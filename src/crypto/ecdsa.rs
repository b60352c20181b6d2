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

//! NIST curves keys. Usable as supplier operator keys, never as ring members.

use crate::{crypto::Hash, Error, ErrorKind, Result};
use ring::{
    rand::SystemRandom,
    signature::{
        self, EcdsaKeyPair as EcdsaKeyPairImpl, EcdsaSigningAlgorithm, EcdsaVerificationAlgorithm,
        KeyPair as RingKeyPair, UnparsedPublicKey as RingPublicKey,
    },
};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum CurveId {
    #[serde(rename = "secp256r1")]
    Secp256R1,
    #[serde(rename = "secp384r1")]
    Secp384R1,
}

#[derive(Debug)]
pub struct KeyPair {
    curve_id: CurveId,
    imp: EcdsaKeyPairImpl,
    rng: SystemRandom,
}

impl KeyPair {
    /// Instantiante new keypair given its private and public components.
    pub fn new(curve_id: CurveId, private_bytes: &[u8], public_bytes: &[u8]) -> Result<KeyPair> {
        let alg = Self::get_alg(curve_id);
        let imp =
            EcdsaKeyPairImpl::from_private_key_and_public_key(alg, private_bytes, public_bytes)
                .map_err(|err| Error::new_ext(ErrorKind::MalformedData, err))?;
        Ok(KeyPair {
            curve_id,
            imp,
            rng: SystemRandom::new(),
        })
    }

    /// Load keypair from pkcs#8 byte array.
    pub fn from_pkcs8_bytes(curve_id: CurveId, bytes: &[u8]) -> Result<KeyPair> {
        let alg = Self::get_alg(curve_id);
        let imp = EcdsaKeyPairImpl::from_pkcs8(alg, bytes)
            .map_err(|err| Error::new_ext(ErrorKind::MalformedData, err))?;
        Ok(KeyPair {
            curve_id,
            imp,
            rng: SystemRandom::new(),
        })
    }

    /// Generate a fresh keypair.
    pub fn from_random(curve_id: CurveId) -> Result<KeyPair> {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPairImpl::generate_pkcs8(Self::get_alg(curve_id), &rng)
            .map_err(|err| Error::new_ext(ErrorKind::Internal, err))?;
        Self::from_pkcs8_bytes(curve_id, pkcs8.as_ref())
    }

    /// Digital signature.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let sig = self
            .imp
            .sign(&self.rng, data)
            .map_err(|err| Error::new_ext(ErrorKind::Internal, err))?
            .as_ref()
            .to_vec();
        Ok(sig)
    }

    /// Get public key from keypair.
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            curve_id: self.curve_id,
            value: self.imp.public_key().as_ref().to_vec(),
        }
    }

    fn get_alg(curve_id: CurveId) -> &'static EcdsaSigningAlgorithm {
        match curve_id {
            CurveId::Secp256R1 => &signature::ECDSA_P256_SHA256_FIXED_SIGNING,
            CurveId::Secp384R1 => &signature::ECDSA_P384_SHA384_FIXED_SIGNING,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct PublicKey {
    pub curve_id: CurveId,
    #[serde(with = "serde_bytes")]
    pub value: Vec<u8>,
}

impl PublicKey {
    /// Signature verification procedure.
    pub fn verify(&self, data: &[u8], sig: &[u8]) -> bool {
        let alg = Self::get_alg(self.curve_id);
        let imp = RingPublicKey::new(alg, &self.value);
        imp.verify(data, sig).is_ok()
    }

    /// Base58 of the multihash of the tagged key bytes.
    pub fn to_account_id(&self) -> String {
        let mut bytes = vec![
            // Algorithm type tag.
            0x08,
            // ECDSA.
            0x03,
            // Curve.
            self.curve_tag(),
            // Payload length.
            self.value.len() as u8,
        ];
        bytes.extend_from_slice(&self.value);
        let hash = Hash::from_data(&bytes);
        bs58::encode(hash).into_string()
    }

    fn curve_tag(&self) -> u8 {
        match self.curve_id {
            CurveId::Secp256R1 => 0x01,
            CurveId::Secp384R1 => 0x02,
        }
    }

    fn get_alg(curve_id: CurveId) -> &'static EcdsaVerificationAlgorithm {
        match curve_id {
            CurveId::Secp256R1 => &signature::ECDSA_P256_SHA256_FIXED,
            CurveId::Secp384R1 => &signature::ECDSA_P384_SHA384_FIXED,
        }
    }
}
